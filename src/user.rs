//! User collaborator interface.
//!
//! The framework never interprets login payloads itself; it drives a
//! [`UserAuth`] implementation through a fixed call sequence (auth →
//! require_lock → login → … → logout) and asks it for identity, presence
//! refresh, and fire-and-forget request handling. One fresh instance is
//! created per connection from the factory installed on the
//! [`App`](crate::app::App).

use async_trait::async_trait;
use serde_json::Value;

use crate::packet::ReturnCode;

/// Capability interface for authentication and per-user session state.
///
/// Implementations back presence with whatever store suits the deployment;
/// a shared external store (for example Redis with a >4 minute TTL, renewed
/// by [`refresh`](Self::refresh)) makes presence visible across processes,
/// while a process-local implementation like [`SimpleUser`] is enough for a
/// single server.
#[async_trait]
pub trait UserAuth: Send + 'static {
    /// Validate the login payload from the Connect packet.
    ///
    /// Returns the user's id and a return code. Any code other than
    /// `Accepted`, or a zero uid, ends the handshake with that code.
    async fn auth(&mut self, payload: &str, ip: &str) -> (i64, ReturnCode);

    /// Mark the user online. Runs under the lock from
    /// [`require_lock`](Self::require_lock).
    async fn login(&mut self, uid: i64) -> ReturnCode;

    /// Mark the user offline. `is_kick_out` is true when a newer session
    /// for the same uid displaced this one.
    async fn logout(&mut self, is_kick_out: bool);

    /// Renew the user's presence record. Called every three minutes while
    /// the session stays logged in, so the backing record's expiry must
    /// exceed four minutes.
    async fn refresh(&mut self);

    /// Whether the session has completed login.
    fn is_login(&self) -> bool;

    /// Take a per-uid mutex before the login state changes, guarding
    /// against the same account connecting twice concurrently. Scope it to
    /// the cluster if logins span processes.
    async fn require_lock(&mut self, uid: i64) -> bool;

    /// Release the mutex taken by [`require_lock`](Self::require_lock).
    async fn release_lock(&mut self, uid: i64);

    /// Current user id; zero means not logged in.
    fn uid(&self) -> i64;

    /// Extra fields appended to the `connect` access record.
    fn connect_info_fields(&self) -> Vec<(String, Value)> { Vec::new() }

    /// Extra fields appended to `sendReq` access records.
    fn send_req_info_fields(&self) -> Vec<(String, Value)> { Vec::new() }

    /// Handle a fire-and-forget request. Losing one of these is acceptable,
    /// which is why they carry no response and no delivery guarantee.
    async fn handle_no_reply_req(&mut self, req_type: &str, payload: &str) {
        let _ = (req_type, payload);
    }
}

/// Process-local [`UserAuth`] that accepts every login.
///
/// Suitable for demos and single-server deployments; real applications
/// validate the payload in [`auth`](UserAuth::auth) and back
/// [`login`](UserAuth::login)/[`refresh`](UserAuth::refresh) with a shared
/// store.
#[derive(Debug, Default)]
pub struct SimpleUser {
    uid: i64,
}

#[async_trait]
impl UserAuth for SimpleUser {
    async fn auth(&mut self, _payload: &str, _ip: &str) -> (i64, ReturnCode) {
        (-1, ReturnCode::Accepted)
    }

    async fn login(&mut self, uid: i64) -> ReturnCode {
        self.uid = uid;
        ReturnCode::Accepted
    }

    async fn logout(&mut self, _is_kick_out: bool) { self.uid = 0; }

    async fn refresh(&mut self) {}

    fn is_login(&self) -> bool { self.uid != 0 }

    async fn require_lock(&mut self, _uid: i64) -> bool { true }

    async fn release_lock(&mut self, _uid: i64) {}

    fn uid(&self) -> i64 { self.uid }
}

/// Factory producing one [`UserAuth`] per accepted connection.
pub type UserFactory = Box<dyn Fn() -> Box<dyn UserAuth> + Send + Sync>;
