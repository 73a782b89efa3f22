//! Server-side session state machine.
//!
//! The handler consumes decoded packets from the work queue and walks the
//! session through AwaitingConnect → LoggedIn → Terminated. The first
//! packet must be a Connect; the handshake runs the user collaborator's
//! auth/lock/login sequence, kicks out an older same-process session for
//! the same account, and acknowledges synchronously so the ConnAck is on
//! the wire before anything else. After login, SendReq and PingReq are
//! served until a Disconnect, a protocol violation upstream, or a stop.
//!
//! Each loop turn also polls the drain flag: once the restart manager is
//! stopping and both queues are empty the session ends on its own.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use log::{debug, error};
use serde_json::{Map, Value};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};

use crate::{
    access::AccessRecord,
    app::Shared,
    connection::SessionHandle,
    error::panic_message,
    packet::{
        ConnAck,
        Connect,
        Disconnect,
        DisconnectKind,
        Packet,
        ReplyLevel,
        ReturnCode,
        SendReq,
        SendResp,
    },
    user::UserAuth,
};

/// How often the user's presence record is renewed while logged in. The
/// external record's TTL must exceed this by a comfortable margin.
const REFRESH_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Idle wake-up so the drain flag is observed even on a silent session.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parameter values longer than this are elided from access records.
const MAX_LOGGED_PARAM_LEN: usize = 50;

pub(crate) struct SessionHandler {
    shared: Arc<Shared>,
    handle: SessionHandle,
    user: Box<dyn UserAuth>,
    ip: String,
}

impl SessionHandler {
    pub(crate) fn new(shared: Arc<Shared>, handle: SessionHandle, ip: String) -> Self {
        let user = (shared.user_factory)();
        Self {
            shared,
            handle,
            user,
            ip,
        }
    }

    pub(crate) async fn run(mut self, mut work_rx: mpsc::Receiver<Packet>) {
        let mut refreshed_at = Instant::now();
        let mut connected = false;
        loop {
            let message = tokio::select! {
                biased;
                () = self.handle.cancelled() => break,
                message = work_rx.recv() => match message {
                    Some(message) => Some(message),
                    None => break,
                },
                () = sleep(STOP_POLL_INTERVAL) => None,
            };
            if let Some(message) = message {
                match message {
                    Packet::Connect(connect) if !connected => {
                        if self.handle_connect(&connect).await {
                            connected = true;
                        } else {
                            break;
                        }
                    }
                    Packet::Connect(_) => {
                        debug!("{} repeated connect, closing session", self.ip);
                        break;
                    }
                    Packet::SendReq(request) if self.user.is_login() => {
                        self.handle_send_req(request).await;
                    }
                    Packet::PingReq if self.user.is_login() => {
                        self.handle.submit(Packet::PingResp);
                    }
                    Packet::Disconnect(_) => break,
                    Packet::ConnAck(_) | Packet::PingResp | Packet::SendResp(_) => {
                        debug!("{} unexpected client-bound packet, closing session", self.ip);
                        break;
                    }
                    // SendReq or PingReq before login.
                    Packet::SendReq(_) | Packet::PingReq => break,
                }
                if self.user.is_login() && refreshed_at.elapsed() > REFRESH_INTERVAL {
                    self.user.refresh().await;
                    refreshed_at = Instant::now();
                }
            }
            if self.shared.restart.is_stopping() && self.handle.jobs_idle() && work_rx.is_empty() {
                debug!("{} drained, ending session for restart", self.ip);
                break;
            }
        }
        self.finish().await;
    }

    /// Run the handshake and acknowledge it. Returns whether the session
    /// is now logged in.
    ///
    /// The ConnAck is always emitted, synchronously, even when the user
    /// collaborator panics; a panic is answered with `ServerUnavailable`.
    async fn handle_connect(&mut self, connect: &Connect) -> bool {
        let start = Instant::now();
        let code = match AssertUnwindSafe(self.establish(connect)).catch_unwind().await {
            Ok(code) => code,
            Err(panic) => {
                error!("connect handling panicked: {}", panic_message(panic));
                ReturnCode::ServerUnavailable
            }
        };
        self.handle
            .submit_sync(Packet::ConnAck(ConnAck { return_code: code }))
            .await;
        let message = if code.is_accepted() {
            String::new()
        } else {
            code.reason().to_string()
        };
        self.shared.access.connect(&AccessRecord {
            req_type: String::new(),
            ip: self.ip.clone(),
            uid: self.user.uid(),
            params: Value::String(connect.payload.clone()),
            status: Some(code as u8),
            message,
            duration: format_duration(start.elapsed()),
            extra: self.user.connect_info_fields(),
        });
        code.is_accepted() && self.user.is_login()
    }

    async fn establish(&mut self, connect: &Connect) -> ReturnCode {
        let (uid, code) = self.user.auth(&connect.payload, &self.ip).await;
        if !code.is_accepted() || uid == 0 {
            return code;
        }
        if !self.user.require_lock(uid).await {
            return ReturnCode::ConcurrentLogin;
        }
        let code = self.user.login(uid).await;
        if code.is_accepted() {
            // Same account already online in this process: push a kick-out
            // at the old session. Its stop is marked as kick-out so its
            // teardown leaves the registry entry we are about to install.
            if let Some(old) = self.shared.registry.get(self.user.uid()) {
                old.submit(Packet::Disconnect(Disconnect {
                    kind: DisconnectKind::KickOut,
                }));
                old.stop(true);
                debug!("kicked out same-process session for account {uid}");
            }
            self.shared.registry.set(self.user.uid(), self.handle.clone());
        }
        self.user.release_lock(uid).await;
        code
    }

    async fn handle_send_req(&mut self, request: SendReq) {
        let start = Instant::now();
        match request.reply_level {
            ReplyLevel::NoReply => {
                let outcome = AssertUnwindSafe(
                    self.user
                        .handle_no_reply_req(&request.req_type, &request.payload),
                )
                .catch_unwind()
                .await;
                if let Err(panic) = outcome {
                    error!("no-reply handler panicked: {}", panic_message(panic));
                }
                self.shared.access.send_req_no_reply(&AccessRecord {
                    req_type: request.req_type,
                    ip: self.ip.clone(),
                    uid: self.user.uid(),
                    params: Value::String(request.payload),
                    status: None,
                    message: String::new(),
                    duration: format_duration(start.elapsed()),
                    extra: self.user.send_req_info_fields(),
                });
            }
            ReplyLevel::ReplyLater => {
                let response = self
                    .shared
                    .dispatcher
                    .process(
                        self.user.as_mut(),
                        &request.req_type,
                        &request.payload,
                        request.data.as_deref(),
                    )
                    .await;
                self.shared.access.send_req(&AccessRecord {
                    req_type: request.req_type,
                    ip: self.ip.clone(),
                    uid: self.user.uid(),
                    params: elide_long_params(&request.payload),
                    status: Some(response.status as u8),
                    message: response.message.clone(),
                    duration: format_duration(start.elapsed()),
                    extra: self.user.send_req_info_fields(),
                });
                self.handle.submit(Packet::SendResp(SendResp {
                    message_id: request.message_id,
                    payload: response.to_json(),
                }));
            }
        }
    }

    /// Tear the session down exactly once. A voluntary exit removes the
    /// registry entry; a kick-out must not, because the entry now belongs
    /// to the replacement session.
    async fn finish(mut self) {
        self.handle.stop(false);
        if self.user.is_login() {
            let kicked = self.handle.was_kicked_out();
            if !kicked {
                self.shared.registry.remove(self.user.uid());
            }
            self.user.logout(kicked).await;
        }
    }
}

/// Parameters for the access record, with oversized values elided so a
/// base64 image in a request does not swell the log.
fn elide_long_params(payload: &str) -> Value {
    let Ok(map) = serde_json::from_str::<Map<String, Value>>(payload) else {
        return Value::Object(Map::new());
    };
    let kept = map
        .into_iter()
        .filter(|(_, value)| value.to_string().len() <= MAX_LOGGED_PARAM_LEN)
        .collect();
    Value::Object(kept)
}

fn format_duration(elapsed: Duration) -> String { format!("{:.3}", elapsed.as_secs_f32()) }
