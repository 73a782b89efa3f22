//! End-to-end scenarios over loopback TCP: a real server, real clients.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use gosoc::{
    ActionContext,
    ActionError,
    ActionResult,
    App,
    AppConfig,
    Client,
    ClientError,
    ClientEvents,
    Controller,
    OnlineRegistry,
    ResponseBody,
    ReturnCode,
    UserAuth,
    decode_params,
};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    sync::{Notify, oneshot},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(10);

/// Test user: the login payload names the uid it wants.
#[derive(Default)]
struct UidUser {
    uid: i64,
}

#[async_trait]
impl UserAuth for UidUser {
    async fn auth(&mut self, payload: &str, _ip: &str) -> (i64, ReturnCode) {
        let value: serde_json::Value = serde_json::from_str(payload).unwrap_or_default();
        match value["uid"].as_i64() {
            Some(uid) => (uid, ReturnCode::Accepted),
            None => (0, ReturnCode::BadLoginInfo),
        }
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

#[derive(Debug, Default, Deserialize)]
struct AddMessageParams {
    message: String,
}

struct ChatController;

#[async_trait]
impl Controller for ChatController {
    async fn dispatch(&self, action: &str, ctx: ActionContext<'_>) -> ActionResult {
        match action {
            "AddMessage" => {
                let params: AddMessageParams = decode_params(ctx.payload)?;
                if params.message.is_empty() {
                    return Err(ActionError::user("message required"));
                }
                Ok(ResponseBody::success(json!({ "message_id": "1" })))
            }
            other => Err(ActionError::user(format!("action {other} not found"))),
        }
    }
}

struct RunningServer {
    addr: SocketAddr,
    registry: OnlineRegistry,
    shutdown: tokio_util::sync::CancellationToken,
    task: JoinHandle<Result<(), gosoc::AppError>>,
}

impl RunningServer {
    async fn shut_down(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.task)
            .await
            .expect("server drains in time")
            .expect("server task joins")
            .expect("server run succeeds");
    }
}

async fn start_server() -> RunningServer {
    let app = App::new(AppConfig::new("127.0.0.1", 0))
        .user_factory(Box::new(|| Box::new(UidUser::default())))
        .route("chat", Arc::new(ChatController));
    let registry = app.registry();
    let shutdown = app.shutdown_token();
    let (ready_tx, ready_rx) = oneshot::channel();
    let app = app.on_ready(ready_tx);
    let task = tokio::spawn(app.run());
    let addr = timeout(WAIT, ready_rx)
        .await
        .expect("server becomes ready")
        .expect("ready address sent");
    RunningServer {
        addr,
        registry,
        shutdown,
        task,
    }
}

fn client_for(addr: SocketAddr, uid: i64) -> Client {
    Client::new(addr.ip().to_string(), addr.port())
        .connect_info(format!("{{\"uid\":{uid}}}"))
}

#[tokio::test]
async fn handshake_and_request_response() {
    let server = start_server().await;

    let mut client = client_for(server.addr, 7);
    client.connect().await.expect("handshake accepted");

    let data = client
        .get_data("chat.AddMessage", &json!({ "message": "hi" }), None)
        .await
        .expect("response arrives");
    assert_eq!(data, "{\"message_id\":\"1\"}");

    // User-facing errors surface with their status and message.
    let err = client
        .get_data("chat.AddMessage", &json!({ "message": "" }), None)
        .await
        .expect_err("empty message is rejected");
    match err {
        ClientError::ResponseStatus { status, message } => {
            assert_eq!(status, 4);
            assert_eq!(message, "message required");
        }
        other => panic!("unexpected error {other:?}"),
    }

    client.disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn bad_login_is_refused() {
    let server = start_server().await;

    let mut client = Client::new(server.addr.ip().to_string(), server.addr.port())
        .connect_info("{\"no\":\"uid\"}");
    let err = client.connect().await.expect_err("handshake refused");
    assert!(matches!(
        err,
        ClientError::Handshake(ReturnCode::BadLoginInfo)
    ));

    server.shut_down().await;
}

struct DisconnectNotify {
    notify: Notify,
}

#[async_trait]
impl ClientEvents for DisconnectNotify {
    async fn on_disconnect(&self) { self.notify.notify_one(); }
}

#[tokio::test]
async fn duplicate_login_kicks_out_the_first_client() {
    let server = start_server().await;

    let events = Arc::new(DisconnectNotify {
        notify: Notify::new(),
    });
    let mut first = client_for(server.addr, 9).events(Arc::clone(&events) as Arc<dyn ClientEvents>);
    first.connect().await.expect("first handshake accepted");

    let mut second = client_for(server.addr, 9);
    second.connect().await.expect("second handshake accepted");

    // The first client is pushed a kick-out Disconnect and its connection
    // ends; the second keeps working.
    timeout(WAIT, events.notify.notified())
        .await
        .expect("first client sees the disconnect");
    let data = second
        .get_data("chat.AddMessage", &json!({ "message": "still here" }), None)
        .await
        .expect("second client still served");
    assert_eq!(data, "{\"message_id\":\"1\"}");

    second.disconnect().await;
    server.shut_down().await;
}

struct PushCollector {
    notify: Notify,
    pushes: tokio::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ClientEvents for PushCollector {
    async fn on_send_req_received(&self, req_type: &str, payload: &str) {
        self.pushes
            .lock()
            .await
            .push((req_type.to_string(), payload.to_string()));
        self.notify.notify_one();
    }
}

#[tokio::test]
async fn server_can_push_at_a_logged_in_session() {
    let server = start_server().await;

    let events = Arc::new(PushCollector {
        notify: Notify::new(),
        pushes: tokio::sync::Mutex::new(Vec::new()),
    });
    let mut client = client_for(server.addr, 11).events(Arc::clone(&events) as Arc<dyn ClientEvents>);
    client.connect().await.expect("handshake accepted");

    let session = server.registry.get(11).expect("uid 11 is online");
    session.push_notify("sync.KeyChanged", &json!({ "key": 3 }));

    timeout(WAIT, events.notify.notified())
        .await
        .expect("push arrives");
    let pushes = events.pushes.lock().await;
    assert_eq!(
        pushes.as_slice(),
        [("sync.KeyChanged".to_string(), "{\"key\":3}".to_string())]
    );
    drop(pushes);

    client.disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn no_reply_requests_do_not_produce_responses() {
    let server = start_server().await;

    let mut client = client_for(server.addr, 13);
    client.connect().await.expect("handshake accepted");

    client
        .send_no_reply("presence.Touch", &json!({}))
        .await
        .expect("no-reply request sends");
    // The connection still answers ordinary requests afterwards.
    let data = client
        .get_data("chat.AddMessage", &json!({ "message": "after" }), None)
        .await
        .expect("later request answered");
    assert_eq!(data, "{\"message_id\":\"1\"}");

    client.disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn voluntary_logout_clears_the_registry() {
    let server = start_server().await;

    let mut client = client_for(server.addr, 15);
    client.connect().await.expect("handshake accepted");
    assert!(server.registry.get(15).is_some());

    client.disconnect().await;
    // Teardown is asynchronous; poll briefly.
    let deadline = tokio::time::Instant::now() + WAIT;
    while server.registry.get(15).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry entry should be removed on logout"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.shut_down().await;
}
