//! Accept-socket wrapper.
//!
//! [`Listener`] owns the TCP accept socket and the [`TaskTracker`] that
//! counts in-flight session tasks, so graceful drain can block until every
//! session has ended. It can be built by binding an address or, in a
//! graceful-restart child, from the listener fd inherited at fd 3. Every
//! accepted socket gets OS-level TCP keep-alive probes as a second liveness
//! layer under the protocol's own ping/pong.

use std::{
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, RawFd},
    time::Duration,
};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;

/// fd at which a graceful-restart child finds its inherited listener.
pub const INHERITED_LISTENER_FD: RawFd = 3;

/// Interval between TCP keep-alive probes on accepted sockets.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// TCP accept socket plus in-flight session tracking.
pub struct Listener {
    inner: TcpListener,
    tracker: TaskTracker,
}

impl Listener {
    /// Bind a fresh listener on `addr`.
    ///
    /// # Errors
    ///
    /// Returns any error from binding the socket.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::wrap(inner))
    }

    /// Adopt the listener a graceful-restart parent left at fd 3.
    ///
    /// # Errors
    ///
    /// Returns an error if the fd is not a usable listening socket.
    pub fn from_inherited_fd() -> io::Result<Self> {
        // SAFETY: the graceful-restart protocol guarantees the parent dup'd
        // its listening socket to exactly this fd before exec, and nothing
        // else in this process has claimed it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(INHERITED_LISTENER_FD) };
        std_listener.set_nonblocking(true)?;
        let inner = TcpListener::from_std(std_listener)?;
        Ok(Self::wrap(inner))
    }

    fn wrap(inner: TcpListener) -> Self {
        Self {
            inner,
            tracker: TaskTracker::new(),
        }
    }

    /// Accept one connection with TCP keep-alive enabled.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying accept call.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let sock = SockRef::from(&stream);
        sock.set_keepalive(true)?;
        sock.set_tcp_keepalive(
            &TcpKeepalive::new()
                .with_time(TCP_KEEPALIVE_INTERVAL)
                .with_interval(TCP_KEEPALIVE_INTERVAL),
        )?;
        Ok((stream, peer))
    }

    /// Tracker for the session tasks spawned off this listener.
    #[must_use]
    pub fn tracker(&self) -> &TaskTracker { &self.tracker }

    /// Wait until every session spawned off this listener has ended.
    pub async fn wait_all_closed(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.inner.local_addr() }
}

impl AsRawFd for Listener {
    /// Raw fd of the accept socket, for handoff to a replacement process.
    fn as_raw_fd(&self) -> RawFd { self.inner.as_raw_fd() }
}
