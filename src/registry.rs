//! Process-wide registry of logged-in sessions.
//!
//! One entry per uid, pointing at the live session's handle so a later
//! login for the same account can push a kick-out Disconnect to its
//! predecessor. Entries are added when login is accepted and removed on
//! voluntary logout only — a kicked-out session must never remove the
//! entry its replacement just installed.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::SessionHandle;

/// Concurrent uid → session-handle map shared by every connection.
#[derive(Clone, Default)]
pub struct OnlineRegistry {
    inner: Arc<DashMap<i64, SessionHandle>>,
}

impl OnlineRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Handle of the session currently registered for `uid`, if any.
    #[must_use]
    pub fn get(&self, uid: i64) -> Option<SessionHandle> {
        self.inner.get(&uid).map(|entry| entry.value().clone())
    }

    /// Register `handle` as the live session for `uid`, replacing any
    /// previous entry.
    pub fn set(&self, uid: i64, handle: SessionHandle) { self.inner.insert(uid, handle); }

    /// Drop the entry for `uid` on voluntary logout.
    pub fn remove(&self, uid: i64) { self.inner.remove(&uid); }

    /// Number of logged-in sessions in this process.
    #[must_use]
    pub fn len(&self) -> usize { self.inner.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.inner.is_empty() }
}
