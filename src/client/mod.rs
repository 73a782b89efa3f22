//! Client for GOSOC servers.
//!
//! [`Client`] dials, authenticates, and keeps the session alive with a
//! 60-second ping. Requests correlate responses by message id, never by
//! arrival order: a slow action's answer may follow a faster later one.
//! [`Client::get_data`] wraps each request in a timeout so the caller gets
//! exactly one outcome — the response or the timeout, whichever is first.

mod conn;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
pub use conn::ClientConn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{Instant, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::packet::ReturnCode;

/// Interval between client keep-alive pings.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default wait for a response before [`ClientError::Timeout`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation needs [`Client::connect`] first.
    #[error("connect required")]
    NotConnected,

    /// The server refused the handshake.
    #[error("handshake rejected: {}", .0.reason())]
    Handshake(ReturnCode),

    /// The request payload could not be serialised to JSON.
    #[error("request payload failed to serialise: {0}")]
    Encode(serde_json::Error),

    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection ended before the operation finished.
    #[error("connection closed")]
    ConnectionClosed,

    /// The response carried a non-success status.
    #[error("response status {status}: {message}")]
    ResponseStatus {
        status: u8,
        message: String,
    },

    /// The response body was not valid JSON.
    #[error("response data error")]
    ResponseData,
}

/// Hooks for traffic the client did not ask for.
#[async_trait]
pub trait ClientEvents: Send + Sync + 'static {
    /// A server push (SendReq) arrived. Runs on its own task.
    async fn on_send_req_received(&self, req_type: &str, payload: &str) {
        let _ = (req_type, payload);
    }

    /// The connection ended, for any reason.
    async fn on_disconnect(&self) {}
}

/// [`ClientEvents`] that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEvents;

#[async_trait]
impl ClientEvents for NoopEvents {}

/// High-level GOSOC client.
pub struct Client {
    host: String,
    port: u16,
    connect_info: String,
    events: Arc<dyn ClientEvents>,
    conn: Option<Arc<ClientConn>>,
    ping_cancel: Option<CancellationToken>,
}

impl Client {
    /// Client for `host:port`, with no push handling and an empty login
    /// payload until configured otherwise.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_info: String::new(),
            events: Arc::new(NoopEvents),
            conn: None,
            ping_cancel: None,
        }
    }

    /// Install hooks for pushes and disconnects.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn ClientEvents>) -> Self {
        self.events = events;
        self
    }

    /// Login payload carried by the Connect packet.
    #[must_use]
    pub fn connect_info(mut self, info: impl Into<String>) -> Self {
        self.connect_info = info.into();
        self
    }

    /// Dial the server over plain TCP and authenticate.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] when the server refuses the
    /// login, or an I/O error when the dial fails.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.attach(stream).await
    }

    /// Authenticate over a caller-supplied stream. This is the TLS path:
    /// hand in an established TLS session (or any other byte stream).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] when the server refuses the
    /// login.
    pub async fn attach<S>(&mut self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = ClientConn::spawn(stream, Arc::clone(&self.events));
        let code = conn.connect(&self.connect_info).await?;
        if !code.is_accepted() {
            return Err(ClientError::Handshake(code));
        }
        self.conn = Some(conn);
        self.start_auto_ping();
        Ok(())
    }

    /// Call a server action and wait up to the default ten seconds for its
    /// response data.
    ///
    /// `req_type` routes the request: `controller.action`.
    ///
    /// # Errors
    ///
    /// See [`Client::get_data_with_timeout`].
    pub async fn get_data<P: Serialize>(
        &self,
        req_type: &str,
        payload: &P,
        data: Option<Bytes>,
    ) -> Result<String, ClientError> {
        self.get_data_with_timeout(req_type, payload, data, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Call a server action with an explicit response timeout.
    ///
    /// Exactly one outcome is produced: the decoded response data, or
    /// [`ClientError::Timeout`] with the pending entry dropped so a late
    /// answer is ignored.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] without a connection,
    /// [`ClientError::Timeout`] when the deadline lapses,
    /// [`ClientError::ResponseStatus`] for non-success responses.
    pub async fn get_data_with_timeout<P: Serialize>(
        &self,
        req_type: &str,
        payload: &P,
        data: Option<Bytes>,
        wait: Duration,
    ) -> Result<String, ClientError> {
        let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
        let payload = serde_json::to_string(payload).map_err(ClientError::Encode)?;
        let (message_id, response_rx) = conn.send_request(req_type, &payload, data).await?;
        match timeout(wait, response_rx).await {
            Err(_) => {
                conn.abandon(message_id);
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(body)) => decode_response(&body),
        }
    }

    /// Fire-and-forget request; no response will ever arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] without a connection.
    pub async fn send_no_reply<P: Serialize>(
        &self,
        req_type: &str,
        payload: &P,
    ) -> Result<(), ClientError> {
        let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
        let payload = serde_json::to_string(payload).map_err(ClientError::Encode)?;
        conn.send_no_reply(req_type, &payload, None).await
    }

    /// Stop pinging and close the session with a Disconnect.
    pub async fn disconnect(&mut self) {
        self.stop_auto_ping();
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await;
        }
    }

    fn start_auto_ping(&mut self) {
        let Some(conn) = self.conn.clone() else {
            return;
        };
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if conn.send_ping().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.ping_cancel = Some(cancel);
    }

    fn stop_auto_ping(&mut self) {
        if let Some(cancel) = self.ping_cancel.take() {
            cancel.cancel();
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientResponseBody {
    status: u8,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

fn decode_response(body: &str) -> Result<String, ClientError> {
    let response: ClientResponseBody =
        serde_json::from_str(body).map_err(|_| ClientError::ResponseData)?;
    if response.status != 0 {
        return Err(ClientError::ResponseStatus {
            status: response.status,
            message: response.message,
        });
    }
    Ok(response
        .data
        .map(|data| data.to_string())
        .unwrap_or_default())
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
