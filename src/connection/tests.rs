use std::time::Duration;

use tokio::{
    io::duplex,
    sync::mpsc,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::*;
use crate::packet::{
    ConnAck,
    Connect,
    Disconnect,
    DisconnectKind,
    ProtocolCommon,
    ReturnCode,
};

fn handle_with_capacity(capacity: usize) -> (SessionHandle, mpsc::Receiver<Job>) {
    let (job_tx, job_rx) = mpsc::channel(capacity);
    (SessionHandle::new(job_tx, "10.0.0.1".into()), job_rx)
}

#[tokio::test]
async fn submit_drops_when_the_queue_is_full() {
    let (handle, mut job_rx) = handle_with_capacity(1);
    handle.submit(Packet::PingResp);
    handle.submit(Packet::PingResp);

    assert!(job_rx.try_recv().is_ok(), "first offer is queued");
    assert!(job_rx.try_recv().is_err(), "second offer was dropped");
}

#[test]
fn first_stop_call_wins() {
    let (kicked, _rx) = handle_with_capacity(1);
    kicked.stop(true);
    kicked.stop(false);
    assert!(kicked.was_kicked_out());

    let (voluntary, _rx) = handle_with_capacity(1);
    voluntary.stop(false);
    voluntary.stop(true);
    assert!(!voluntary.was_kicked_out());
}

#[tokio::test]
async fn submit_sync_resolves_after_the_writer_flush() {
    let (stream, peer) = duplex(4096);
    let (handle, job_rx) = handle_with_capacity(QUEUE_LEN);
    let manager = MessageManager::with_common(ProtocolCommon::client_default());
    let (_read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(write_loop(
        FramedWrite::new(write_half, manager),
        job_rx,
        handle.clone(),
    ));

    timeout(
        Duration::from_secs(5),
        handle.submit_sync(Packet::ConnAck(ConnAck {
            return_code: ReturnCode::Accepted,
        })),
    )
    .await
    .expect("receipt released after flush");

    let mut peer_in = FramedRead::new(
        tokio::io::split(peer).0,
        MessageManager::with_common(ProtocolCommon::client_default()),
    );
    let packet = timeout(Duration::from_secs(5), peer_in.next())
        .await
        .expect("packet arrives")
        .expect("stream open")
        .expect("decodes");
    assert!(matches!(packet, Packet::ConnAck(_)));
}

#[tokio::test]
async fn writer_exits_immediately_after_flushing_a_disconnect() {
    let (stream, peer) = duplex(4096);
    let (handle, job_rx) = handle_with_capacity(QUEUE_LEN);
    let manager = MessageManager::with_common(ProtocolCommon::client_default());
    let (_read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(write_loop(
        FramedWrite::new(write_half, manager),
        job_rx,
        handle.clone(),
    ));

    handle.submit(Packet::Disconnect(Disconnect {
        kind: DisconnectKind::KickOut,
    }));
    handle.submit(Packet::PingResp);

    let mut peer_in = FramedRead::new(
        tokio::io::split(peer).0,
        MessageManager::with_common(ProtocolCommon::client_default()),
    );
    let packet = timeout(Duration::from_secs(5), peer_in.next())
        .await
        .expect("packet arrives")
        .expect("stream open")
        .expect("decodes");
    assert!(matches!(packet, Packet::Disconnect(_)));

    // The queued PingResp is never written; the stream just ends.
    let eof = timeout(Duration::from_secs(5), peer_in.next())
        .await
        .expect("stream settles");
    assert!(eof.is_none(), "writer should close after the disconnect");
    timeout(Duration::from_secs(5), handle.cancelled())
        .await
        .expect("writer stops the session on exit");
}

#[tokio::test]
async fn reader_forwards_packets_and_stops_the_session_on_eof() {
    let (stream, peer) = duplex(4096);
    let (handle, _job_rx) = handle_with_capacity(QUEUE_LEN);
    let (work_tx, mut work_rx) = mpsc::channel(QUEUE_LEN);
    let (read_half, _write_half) = tokio::io::split(stream);
    let reader = tokio::spawn(read_loop(
        FramedRead::new(read_half, MessageManager::new()),
        work_tx,
        handle.clone(),
        "10.0.0.1".into(),
    ));

    // Framing the unsplit stream lets dropping it deliver EOF below.
    let mut peer_out = FramedWrite::new(
        peer,
        MessageManager::with_common(ProtocolCommon::client_default()),
    );
    peer_out
        .send(Packet::Connect(Connect {
            protocol_name: String::new(),
            protocol_version: 0,
            keep_alive_secs: 0,
            enable_payload_gzip: false,
            payload: "{}".into(),
        }))
        .await
        .expect("connect sends");

    let packet = timeout(Duration::from_secs(5), work_rx.recv())
        .await
        .expect("packet forwarded")
        .expect("work queue open");
    assert!(matches!(packet, Packet::Connect(_)));

    drop(peer_out);
    reader.await.expect("reader joins");
    timeout(Duration::from_secs(5), handle.cancelled())
        .await
        .expect("reader stops the session on exit");
    assert!(!handle.was_kicked_out());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_hits_the_handshake_deadline() {
    let (stream, _peer) = duplex(4096);
    let (handle, _job_rx) = handle_with_capacity(QUEUE_LEN);
    let (work_tx, _work_rx) = mpsc::channel(QUEUE_LEN);
    let (read_half, _write_half) = tokio::io::split(stream);
    let reader = tokio::spawn(read_loop(
        FramedRead::new(read_half, MessageManager::new()),
        work_tx,
        handle.clone(),
        "10.0.0.1".into(),
    ));

    // No Connect ever arrives; the handshake-phase deadline fires.
    reader.await.expect("reader joins");
    timeout(Duration::from_secs(1), handle.cancelled())
        .await
        .expect("session stopped after the deadline");
}
