//! Accept loop and TLS wrapping.
//!
//! The server accepts connections until its shutdown token is cancelled
//! (graceful drain closing the listener) and spawns the per-connection
//! tasks onto the listener's tracker. Accept failures back off
//! exponentially rather than crashing the loop. With TLS configured, the
//! handshake runs in the connection's own task so a slow peer cannot stall
//! the accept loop.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{app::Shared, connection, listener::Listener};

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct Server {
    pub listener: Listener,
    pub tls: Option<TlsAcceptor>,
    pub shutdown: CancellationToken,
}

impl Server {
    /// Accept connections until shutdown is requested.
    pub(crate) async fn serve(&self, shared: Arc<Shared>) {
        let mut backoff = INITIAL_ACCEPT_BACKOFF;
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    backoff = INITIAL_ACCEPT_BACKOFF;
                    let tracker = self.listener.tracker();
                    match &self.tls {
                        Some(acceptor) => {
                            let acceptor = acceptor.clone();
                            let shared = Arc::clone(&shared);
                            let tracker = tracker.clone();
                            tracker.clone().spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        connection::spawn(stream, peer, shared, &tracker);
                                    }
                                    Err(err) => {
                                        debug!("{} TLS handshake failed: {err}", peer.ip());
                                    }
                                }
                            });
                        }
                        None => connection::spawn(stream, peer, Arc::clone(&shared), tracker),
                    }
                }
                Err(err) => {
                    warn!("accept error: {err}");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }
    }
}
