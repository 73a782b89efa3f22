//! Application wiring.
//!
//! [`App`] threads the process-wide collaborators — user factory,
//! controller dispatcher, access log, online registry, restart manager —
//! through construction and runs the server: bind (or adopt the inherited
//! listener in a graceful-restart child), install signal handlers, accept
//! until drain, then wait for in-flight sessions.

use std::{fs::File, io::BufReader, net::SocketAddr, process, sync::Arc};

use log::info;
use serde::Deserialize;
use std::os::fd::AsRawFd;
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;

use crate::{
    access::{AccessLog, LogAccessLog},
    controller::{Controller, Dispatcher},
    error::AppError,
    listener::{INHERITED_LISTENER_FD, Listener},
    registry::OnlineRegistry,
    restart::{RestartManager, RestartWait},
    server::Server,
    user::{SimpleUser, UserFactory},
};

/// Server configuration. Each option also accepts its long spelling
/// (`listen_address`, `listen_port`, `tls_enabled`, `tls_cert_path`,
/// `tls_key_path`).
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Address to listen on when not inheriting a listener.
    #[serde(alias = "listen_address")]
    pub tcp_addr: String,
    /// Port to listen on when not inheriting a listener.
    #[serde(alias = "listen_port")]
    pub tcp_port: u16,
    /// Wrap accepted sockets in TLS.
    #[serde(default, alias = "tls_enabled")]
    pub tls_enable: bool,
    /// PEM certificate chain, required when `tls_enable` is set.
    #[serde(default, alias = "tls_cert_path")]
    pub tls_cert: String,
    /// PEM private key, required when `tls_enable` is set.
    #[serde(default, alias = "tls_key_path")]
    pub tls_key: String,
}

impl AppConfig {
    /// Plain-TCP configuration for `addr:port`.
    #[must_use]
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            tcp_addr: addr.into(),
            tcp_port: port,
            tls_enable: false,
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the file cannot be read or parsed.
    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|e| AppError::Config(format!("{path}: {e}")))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| AppError::Config(format!("{path}: {e}")))
    }

    fn listen_addr(&self) -> String { format!("{}:{}", self.tcp_addr, self.tcp_port) }
}

/// Collaborators shared by every connection of one [`App`].
pub(crate) struct Shared {
    pub user_factory: UserFactory,
    pub dispatcher: Dispatcher,
    pub access: Box<dyn AccessLog>,
    pub registry: OnlineRegistry,
    pub restart: RestartManager,
}

/// The server application.
///
/// Build with [`App::new`], attach collaborators, then [`run`](App::run).
pub struct App {
    config: AppConfig,
    user_factory: UserFactory,
    dispatcher: Dispatcher,
    access: Box<dyn AccessLog>,
    registry: OnlineRegistry,
    shutdown: CancellationToken,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl App {
    /// New app with default collaborators: accept-all users, no
    /// controllers, access records on the log facade.
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            user_factory: Box::new(|| Box::new(SimpleUser::default())),
            dispatcher: Dispatcher::default(),
            access: Box::new(LogAccessLog),
            registry: OnlineRegistry::new(),
            shutdown: CancellationToken::new(),
            ready: None,
        }
    }

    /// Install the factory producing one [`UserAuth`](crate::user::UserAuth)
    /// per connection.
    #[must_use]
    pub fn user_factory(mut self, factory: UserFactory) -> Self {
        self.user_factory = factory;
        self
    }

    /// Register a controller under `name`.
    #[must_use]
    pub fn route(mut self, name: &str, controller: Arc<dyn Controller>) -> Self {
        self.dispatcher.route(name, controller);
        self
    }

    /// Replace the access-record sink.
    #[must_use]
    pub fn access_log(mut self, access: impl AccessLog + 'static) -> Self {
        self.access = Box::new(access);
        self
    }

    /// Handle to the online registry, for pushing notifications at
    /// logged-in sessions from outside the request path.
    #[must_use]
    pub fn registry(&self) -> OnlineRegistry { self.registry.clone() }

    /// Token that stops the accept loop when cancelled. Draining signals
    /// cancel it too.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Receive the bound address once the listener is ready.
    #[must_use]
    pub fn on_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Run until drained: accept connections, serve sessions, and on
    /// SIGUSR1/SIGUSR2 (or cancellation of the shutdown token) stop
    /// accepting and wait for in-flight sessions to finish.
    ///
    /// # Errors
    ///
    /// Returns an [`AppError`] when the listener, TLS material, or signal
    /// handlers cannot be set up. Per-connection failures never surface
    /// here.
    pub async fn run(self) -> Result<(), AppError> {
        let restart = RestartManager::new();
        restart.spawn_signal_handler()?;

        let listener = if RestartManager::is_graceful_child() {
            info!(
                "process {} inheriting listener from fd {INHERITED_LISTENER_FD}",
                process::id()
            );
            Listener::from_inherited_fd()?
        } else {
            Listener::bind(&self.config.listen_addr()).await?
        };
        restart.mark_fd(INHERITED_LISTENER_FD, listener.as_raw_fd())?;

        let shutdown = self.shutdown.clone();
        restart.register_handler({
            let shutdown = shutdown.clone();
            move || shutdown.cancel()
        });

        let tls = if self.config.tls_enable {
            Some(load_tls_acceptor(&self.config.tls_cert, &self.config.tls_key)?)
        } else {
            None
        };

        let shared = Arc::new(Shared {
            user_factory: self.user_factory,
            dispatcher: self.dispatcher,
            access: self.access,
            registry: self.registry,
            restart: restart.clone(),
        });

        if let Some(ready) = self.ready {
            let _ = ready.send(listener.local_addr()?);
        }
        info!("process {} listening on {}", process::id(), self.config.listen_addr());

        let server = Server {
            listener,
            tls,
            shutdown,
        };
        server.serve(shared).await;

        // Accepting has stopped; give in-flight sessions their bounded
        // window to drain.
        let tracker = server.listener.tracker().clone();
        let mut wait = RestartWait::new();
        wait.register("tcp sessions", async move {
            tracker.close();
            tracker.wait().await;
        });
        wait.wait_all().await;
        info!(
            "all connections closed, process {} is shutting down",
            process::id()
        );
        Ok(())
    }
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, AppError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or(AppError::TlsKeyMissing)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
