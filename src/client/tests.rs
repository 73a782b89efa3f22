use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf, duplex},
    sync::Mutex,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::*;
use crate::packet::{
    ConnAck,
    MessageManager,
    Packet,
    ReplyLevel,
    SendReq,
    SendResp,
};

type ServerRead = FramedRead<ReadHalf<DuplexStream>, MessageManager>;
type ServerWrite = FramedWrite<WriteHalf<DuplexStream>, MessageManager>;

fn server_io(stream: DuplexStream) -> (ServerRead, ServerWrite) {
    let manager = MessageManager::new();
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FramedRead::new(read_half, manager.clone()),
        FramedWrite::new(write_half, manager),
    )
}

async fn expect_packet(frames: &mut ServerRead) -> Packet {
    timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("packet within deadline")
        .expect("stream still open")
        .expect("decode succeeds")
}

/// Accept the handshake and hand back the framed halves.
async fn accept_handshake(stream: DuplexStream, code: ReturnCode) -> (ServerRead, ServerWrite) {
    let (mut read, mut write) = server_io(stream);
    let Packet::Connect(_) = expect_packet(&mut read).await else {
        panic!("expected a Connect first");
    };
    write
        .send(Packet::ConnAck(ConnAck { return_code: code }))
        .await
        .expect("ConnAck sends");
    (read, write)
}

#[tokio::test]
async fn connect_resolves_with_the_servers_return_code() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(accept_handshake(server_stream, ReturnCode::Accepted));

    let mut client = Client::new("unused", 0).connect_info("{\"token\":\"t\"}");
    client.attach(client_stream).await.expect("handshake accepted");
    server.await.expect("server task joins");
}

#[tokio::test]
async fn rejected_handshake_surfaces_the_return_code() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(accept_handshake(server_stream, ReturnCode::BadLoginInfo));

    let mut client = Client::new("unused", 0);
    let err = client
        .attach(client_stream)
        .await
        .expect_err("handshake should be refused");
    assert!(matches!(err, ClientError::Handshake(ReturnCode::BadLoginInfo)));
    server.await.expect("server task joins");
}

#[tokio::test]
async fn responses_correlate_by_message_id_not_order() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (mut read, mut write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        let mut requests = Vec::new();
        for _ in 0..2 {
            let Packet::SendReq(request) = expect_packet(&mut read).await else {
                panic!("expected a SendReq");
            };
            assert_eq!(request.reply_level, ReplyLevel::ReplyLater);
            requests.push(request);
        }
        // Answer in reverse order; correlation must still hold.
        for request in requests.iter().rev() {
            let payload = format!(
                "{{\"status\":0,\"data\":{{\"echo\":\"{}\"}}}}",
                request.payload.len()
            );
            write
                .send(Packet::SendResp(SendResp {
                    message_id: request.message_id,
                    payload,
                }))
                .await
                .expect("SendResp sends");
        }
    });

    let mut client = Client::new("unused", 0);
    client.attach(client_stream).await.expect("handshake accepted");

    let short = client.get_data("chat.AddMessage", &"a", None);
    let long = client.get_data("chat.AddMessage", &"abcdef", None);
    let (short, long) = tokio::join!(short, long);
    // Payload strings are JSON-quoted, hence the +2.
    assert_eq!(short.expect("short response"), "{\"echo\":\"3\"}");
    assert_eq!(long.expect("long response"), "{\"echo\":\"8\"}");
    server.await.expect("server task joins");
}

#[tokio::test]
async fn unanswered_request_times_out_exactly_once() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (mut read, _write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        // Swallow the request and never answer.
        let Packet::SendReq(_) = expect_packet(&mut read).await else {
            panic!("expected a SendReq");
        };
        read
    });

    let mut client = Client::new("unused", 0);
    client.attach(client_stream).await.expect("handshake accepted");

    let err = client
        .get_data_with_timeout("chat.AddMessage", &"hi", None, Duration::from_millis(50))
        .await
        .expect_err("expected a timeout");
    assert!(matches!(err, ClientError::Timeout));
    drop(server);
}

#[tokio::test]
async fn error_statuses_map_to_response_errors() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (mut read, mut write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        let Packet::SendReq(request) = expect_packet(&mut read).await else {
            panic!("expected a SendReq");
        };
        write
            .send(Packet::SendResp(SendResp {
                message_id: request.message_id,
                payload: "{\"status\":4,\"message\":\"told to fail\",\"data\":{}}".into(),
            }))
            .await
            .expect("SendResp sends");
    });

    let mut client = Client::new("unused", 0);
    client.attach(client_stream).await.expect("handshake accepted");

    let err = client
        .get_data("chat.AddMessage", &"hi", None)
        .await
        .expect_err("expected a status error");
    match err {
        ClientError::ResponseStatus { status, message } => {
            assert_eq!(status, 4);
            assert_eq!(message, "told to fail");
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.await.expect("server task joins");
}

struct RecordingEvents {
    pushes: Mutex<Vec<(String, String)>>,
    notify: tokio::sync::Notify,
}

#[async_trait]
impl ClientEvents for RecordingEvents {
    async fn on_send_req_received(&self, req_type: &str, payload: &str) {
        self.pushes
            .lock()
            .await
            .push((req_type.to_string(), payload.to_string()));
        self.notify.notify_one();
    }
}

#[tokio::test]
async fn server_pushes_reach_the_event_hook() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (_read, mut write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        write
            .send(Packet::SendReq(SendReq {
                message_id: 0,
                reply_level: ReplyLevel::NoReply,
                req_type: "sync.KeyChanged".into(),
                payload: "{\"key\":9}".into(),
                data: None,
            }))
            .await
            .expect("push sends");
        (_read, write)
    });

    let events = Arc::new(RecordingEvents {
        pushes: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
    });
    let mut client = Client::new("unused", 0).events(Arc::clone(&events) as Arc<dyn ClientEvents>);
    client.attach(client_stream).await.expect("handshake accepted");

    timeout(Duration::from_secs(5), events.notify.notified())
        .await
        .expect("push delivered");
    let pushes = events.pushes.lock().await;
    assert_eq!(
        pushes.as_slice(),
        [("sync.KeyChanged".to_string(), "{\"key\":9}".to_string())]
    );
    drop(server);
}

#[tokio::test]
async fn disconnect_flushes_a_disconnect_packet() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (mut read, _write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        expect_packet(&mut read).await
    });

    let mut client = Client::new("unused", 0);
    client.attach(client_stream).await.expect("handshake accepted");
    client.disconnect().await;

    let packet = server.await.expect("server task joins");
    assert!(matches!(packet, Packet::Disconnect(_)));
}

#[tokio::test]
async fn message_ids_increase_per_request() {
    let (client_stream, server_stream) = duplex(4096);
    let server = tokio::spawn(async move {
        let (mut read, mut write) = accept_handshake(server_stream, ReturnCode::Accepted).await;
        let mut ids = Vec::new();
        for _ in 0..2 {
            let Packet::SendReq(request) = expect_packet(&mut read).await else {
                panic!("expected a SendReq");
            };
            ids.push(request.message_id);
            write
                .send(Packet::SendResp(SendResp {
                    message_id: request.message_id,
                    payload: "{\"status\":0,\"data\":{}}".into(),
                }))
                .await
                .expect("SendResp sends");
        }
        ids
    });

    let mut client = Client::new("unused", 0);
    client.attach(client_stream).await.expect("handshake accepted");
    client.get_data("a.B", &"x", None).await.expect("first call");
    client.get_data("a.B", &"x", None).await.expect("second call");

    let ids = server.await.expect("server task joins");
    assert_eq!(ids, [1, 2]);
}
