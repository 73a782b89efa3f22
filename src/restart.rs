//! Graceful drain and restart.
//!
//! Two Unix signals drive process lifecycle: SIGUSR1 drains and exits,
//! SIGUSR2 hands the accept socket to a freshly exec'd copy of this binary
//! and then drains. The handoff passes every registered listener fd to the
//! child at a dense run of fd numbers starting at 3, with `IS_GRACEFUL=1`
//! in the child's environment so it knows to adopt fd 3 instead of
//! binding. Draining itself is bounded by [`RestartWait`], which gives
//! in-flight work five minutes before shutdown proceeds anyway.

use std::{
    collections::BTreeMap,
    env,
    io,
    os::fd::RawFd,
    os::unix::process::CommandExt,
    process,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use log::{error, info, warn};
use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    unistd::dup2,
};
use thiserror::Error;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
    time::timeout,
};

use crate::listener::INHERITED_LISTENER_FD;

/// Environment variable marking a graceful-restart child.
pub const GRACEFUL_ENV_KEY: &str = "IS_GRACEFUL";

/// Hard ceiling on how long in-flight work may delay shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Errors from listener registration or replacement-process spawning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RestartError {
    /// fds 0–2 belong to stdio; listener keys start at 3.
    #[error("listener fd key {0} is reserved, keys start at 3")]
    ReservedFdKey(RawFd),

    /// Each key may be marked once.
    #[error("listener fd key {0} is already marked")]
    DuplicateFdKey(RawFd),

    /// Keys must form a dense run from 3 so the child can find every fd.
    #[error("listener fd keys are not dense, key {0} is missing")]
    SparseFdKey(RawFd),

    /// Fork-exec of the replacement process failed.
    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Default)]
struct Inner {
    listener_fds: Mutex<BTreeMap<RawFd, RawFd>>,
    callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    stopping: AtomicBool,
}

/// Coordinates drain-and-exit and drain-and-restart across the process.
///
/// Cloning shares the same state; one instance is created at startup and
/// threaded to everything that needs to observe [`is_stopping`]
/// (`Self::is_stopping`).
#[derive(Clone, Default)]
pub struct RestartManager {
    inner: Arc<Inner>,
}

impl RestartManager {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Whether this process was exec'd by a graceful-restart parent and
    /// should adopt its listener from fd 3.
    #[must_use]
    pub fn is_graceful_child() -> bool {
        env::var_os(GRACEFUL_ENV_KEY).is_some_and(|value| !value.is_empty())
    }

    /// Register a callback fired once when shutdown or restart begins.
    /// The server uses this to stop accepting new connections.
    pub fn register_handler(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .expect("restart callback lock poisoned")
            .push(Box::new(callback));
    }

    /// Record `fd` for handoff under `key`. Keys start at 3 and must end
    /// up dense; sparseness is rejected at spawn time.
    ///
    /// # Errors
    ///
    /// Returns [`RestartError::ReservedFdKey`] for keys below 3 and
    /// [`RestartError::DuplicateFdKey`] when the key was already marked.
    pub fn mark_fd(&self, key: RawFd, fd: RawFd) -> Result<(), RestartError> {
        if key < INHERITED_LISTENER_FD {
            return Err(RestartError::ReservedFdKey(key));
        }
        let mut map = self
            .inner
            .listener_fds
            .lock()
            .expect("listener fd lock poisoned");
        if map.contains_key(&key) {
            return Err(RestartError::DuplicateFdKey(key));
        }
        map.insert(key, fd);
        Ok(())
    }

    /// Whether a drain (SIGUSR1) or restart (SIGUSR2) is in progress.
    #[must_use]
    pub fn is_stopping(&self) -> bool { self.inner.stopping.load(Ordering::SeqCst) }

    pub(crate) fn begin_stop(&self) { self.inner.stopping.store(true, Ordering::SeqCst); }

    fn fire_callbacks(&self) {
        let callbacks = self
            .inner
            .callbacks
            .lock()
            .expect("restart callback lock poisoned");
        for callback in callbacks.iter() {
            callback();
        }
    }

    /// Install the SIGUSR1/SIGUSR2 handlers.
    ///
    /// The task ends after the first successful drain or restart so a
    /// second SIGUSR2 cannot fork twice; a failed restart leaves the
    /// current process serving and the handler listening.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be registered.
    pub fn spawn_signal_handler(&self) -> io::Result<JoinHandle<()>> {
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = usr1.recv() => {
                        info!("received SIGUSR1, shutting down gracefully");
                        manager.begin_stop();
                        manager.fire_callbacks();
                        return;
                    }
                    _ = usr2.recv() => {
                        info!("process {} received SIGUSR2, restarting gracefully", process::id());
                        match manager.start_replacement() {
                            Ok(pid) => {
                                info!("replacement process {pid} started");
                                manager.begin_stop();
                                manager.fire_callbacks();
                                return;
                            }
                            Err(err) => error!(
                                "replacement process failed to start: {err}, process {} continues to serve",
                                process::id()
                            ),
                        }
                    }
                }
            }
        }))
    }

    /// Fork-exec this binary with its original arguments, `IS_GRACEFUL=1`,
    /// and every marked listener fd placed at its key in the child.
    fn start_replacement(&self) -> Result<u32, RestartError> {
        let fds: Vec<(RawFd, RawFd)> = {
            let map = self
                .inner
                .listener_fds
                .lock()
                .expect("listener fd lock poisoned");
            if let Some((&max_key, _)) = map.iter().next_back() {
                for key in INHERITED_LISTENER_FD..=max_key {
                    if !map.contains_key(&key) {
                        return Err(RestartError::SparseFdKey(key));
                    }
                }
            }
            map.iter().map(|(&key, &fd)| (key, fd)).collect()
        };

        let exe = env::current_exe().map_err(RestartError::Spawn)?;
        let mut command = process::Command::new(exe);
        command.args(env::args_os().skip(1));
        command.env(GRACEFUL_ENV_KEY, "1");
        let inherited = fds;
        // SAFETY: the pre-exec hook only calls dup2/fcntl, both
        // async-signal-safe, on fds recorded before the fork.
        unsafe {
            command.pre_exec(move || {
                for &(key, fd) in &inherited {
                    if fd == key {
                        // Already at the target number; dup2 would be a
                        // no-op that leaves close-on-exec set.
                        fcntl(key, FcntlArg::F_SETFD(FdFlag::empty()))?;
                    } else {
                        dup2(fd, key)?;
                    }
                }
                Ok(())
            });
        }
        let child = command.spawn().map_err(RestartError::Spawn)?;
        Ok(child.id())
    }
}

struct WaitWork {
    name: String,
    future: BoxFuture<'static, ()>,
}

/// Bounded wait for in-flight work before shutdown or restart completes.
#[derive(Default)]
pub struct RestartWait {
    works: Vec<WaitWork>,
    max_wait: Option<Duration>,
}

impl RestartWait {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Replace the default five-minute drain deadline.
    pub fn set_max_wait(&mut self, max_wait: Duration) { self.max_wait = Some(max_wait); }

    /// Register a named piece of work to wait for.
    pub fn register<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.works.push(WaitWork {
            name: name.into(),
            future: Box::pin(future),
        });
    }

    /// Wait for all registered work, up to the drain deadline. Work that
    /// misses the deadline is named in a warning and abandoned.
    pub async fn wait_all(self) {
        if self.works.is_empty() {
            info!("no work to finish before shutdown");
            return;
        }
        let max_wait = self.max_wait.unwrap_or(DRAIN_DEADLINE);
        let mut tracked = Vec::with_capacity(self.works.len());
        let mut futures = Vec::with_capacity(self.works.len());
        for work in self.works {
            let done = Arc::new(AtomicBool::new(false));
            tracked.push((work.name, Arc::clone(&done)));
            futures.push(async move {
                work.future.await;
                done.store(true, Ordering::SeqCst);
            });
        }
        if timeout(max_wait, futures::future::join_all(futures))
            .await
            .is_err()
        {
            for (name, done) in &tracked {
                if !done.load(Ordering::SeqCst) {
                    warn!("{name} did not finish before the drain deadline, forcing shutdown");
                }
            }
        } else {
            info!("all work finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn mark_fd_rejects_reserved_keys() {
        let manager = RestartManager::new();
        assert!(matches!(
            manager.mark_fd(2, 9),
            Err(RestartError::ReservedFdKey(2))
        ));
    }

    #[test]
    fn mark_fd_rejects_duplicate_keys() {
        let manager = RestartManager::new();
        manager.mark_fd(3, 9).expect("first mark succeeds");
        assert!(matches!(
            manager.mark_fd(3, 10),
            Err(RestartError::DuplicateFdKey(3))
        ));
    }

    #[test]
    fn stop_flag_flips_once_begun() {
        let manager = RestartManager::new();
        assert!(!manager.is_stopping());
        manager.begin_stop();
        assert!(manager.is_stopping());
    }

    #[tokio::test]
    async fn sigusr1_marks_stopping_and_fires_callbacks() {
        let manager = RestartManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        manager.register_handler(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let handle = manager
            .spawn_signal_handler()
            .expect("signal registration succeeds");

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).expect("raise SIGUSR1");
        handle.await.expect("signal task joins");

        assert!(manager.is_stopping());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_all_returns_once_work_finishes() {
        let mut wait = RestartWait::new();
        wait.register("quick", async {});
        wait.wait_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_all_abandons_work_at_the_deadline() {
        let mut wait = RestartWait::new();
        wait.set_max_wait(Duration::from_millis(10));
        wait.register("stuck", std::future::pending());
        wait.wait_all().await;
    }
}
