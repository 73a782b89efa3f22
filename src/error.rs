//! Crate-level error types and failure-classification helpers.

use std::{any::Any, io};

use thiserror::Error;

use crate::restart::RestartError;

/// Errors surfaced by [`App::run`](crate::app::App::run) and server setup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// Binding, inheriting, or accepting on the listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS certificate or key material could not be used.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// The configured key file held no usable private key.
    #[error("TLS key file contains no private key")]
    TlsKeyMissing,

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Graceful-restart bookkeeping rejected the listener registration.
    #[error(transparent)]
    Restart(#[from] RestartError),
}

/// Whether a transport error is part of the ordinary close-of-connection
/// family. These are peers going away, not server faults, and are logged at
/// debug level.
pub(crate) fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

/// Render a caught panic payload for a log line.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}
