//! Client-side connection plumbing.
//!
//! A [`ClientConn`] owns the reader/writer pair for one dialled stream.
//! The reader demultiplexes inbound packets: the ConnAck goes to a
//! dedicated channel so the handshake is synchronous, SendResp payloads
//! resolve the pending request with the matching message id, and server
//! pushes (SendReq) are handed to the event hook on their own task so the
//! reader is never blocked by user code.

use std::sync::{
    Arc,
    atomic::{AtomicU16, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use super::{ClientError, ClientEvents};
use crate::{
    connection::Job,
    error::is_benign_disconnect,
    packet::{
        Connect,
        Disconnect,
        DisconnectKind,
        MessageManager,
        Packet,
        ProtocolCommon,
        ReplyLevel,
        ReturnCode,
        SendReq,
    },
};

/// Outbound queue length on the client side.
const QUEUE_LEN: usize = 50;

/// One dialled connection to a GOSOC server.
pub struct ClientConn {
    job_tx: mpsc::Sender<Job>,
    conn_ack_rx: Mutex<mpsc::Receiver<ReturnCode>>,
    next_message_id: AtomicU16,
    pending: Arc<DashMap<u16, oneshot::Sender<String>>>,
}

impl ClientConn {
    /// Start the reader and writer for `stream` and return the connection
    /// handle. The stream may be plain TCP or anything else that reads and
    /// writes bytes (a TLS session, an in-memory pipe in tests).
    pub fn spawn<S>(stream: S, events: Arc<dyn ClientEvents>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let manager = MessageManager::with_common(ProtocolCommon::client_default());
        let (read_half, write_half) = tokio::io::split(stream);
        let (job_tx, job_rx) = mpsc::channel(QUEUE_LEN);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let pending = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(
            FramedRead::new(read_half, manager.clone()),
            ReaderHooks {
                ack_tx,
                pending: Arc::clone(&pending),
                events,
                closed: closed.clone(),
            },
        ));
        tokio::spawn(write_loop(
            FramedWrite::new(write_half, manager),
            job_rx,
            closed,
        ));

        Arc::new(Self {
            job_tx,
            conn_ack_rx: Mutex::new(ack_rx),
            next_message_id: AtomicU16::new(1),
            pending,
        })
    }

    /// Send the Connect packet and wait for the server's ConnAck.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] when the connection ends
    /// before an acknowledgement arrives.
    pub async fn connect(&self, login_info: &str) -> Result<ReturnCode, ClientError> {
        self.submit_sync(Packet::Connect(Connect {
            protocol_name: String::new(),
            protocol_version: 0,
            keep_alive_secs: 0,
            enable_payload_gzip: false,
            payload: login_info.to_string(),
        }))
        .await?;
        let mut ack = self.conn_ack_rx.lock().await;
        ack.recv().await.ok_or(ClientError::ConnectionClosed)
    }

    /// Send a ReplyLater request. Returns the allocated message id and the
    /// channel that resolves with the response payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] when the writer is gone.
    pub async fn send_request(
        &self,
        req_type: &str,
        payload: &str,
        data: Option<Bytes>,
    ) -> Result<(u16, oneshot::Receiver<String>), ClientError> {
        let message_id = self.allocate_message_id();
        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(message_id, response_tx);
        let result = self
            .submit_sync(Packet::SendReq(SendReq {
                message_id,
                reply_level: ReplyLevel::ReplyLater,
                req_type: req_type.to_string(),
                payload: payload.to_string(),
                data,
            }))
            .await;
        if result.is_err() {
            self.pending.remove(&message_id);
        }
        result.map(|()| (message_id, response_rx))
    }

    /// Send a fire-and-forget request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] when the writer is gone.
    pub async fn send_no_reply(
        &self,
        req_type: &str,
        payload: &str,
        data: Option<Bytes>,
    ) -> Result<(), ClientError> {
        self.submit_sync(Packet::SendReq(SendReq {
            message_id: self.allocate_message_id(),
            reply_level: ReplyLevel::NoReply,
            req_type: req_type.to_string(),
            payload: payload.to_string(),
            data,
        }))
        .await
    }

    /// Send a keep-alive ping.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] when the writer is gone.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.submit_sync(Packet::PingReq).await
    }

    /// Queue a Disconnect; the writer flushes it and closes the stream.
    pub async fn disconnect(&self) {
        let _ = self
            .job_tx
            .send(Job {
                packet: Packet::Disconnect(Disconnect {
                    kind: DisconnectKind::Normal,
                }),
                receipt: None,
            })
            .await;
    }

    /// Drop the pending entry for a request whose caller gave up waiting.
    /// A response arriving later is then silently ignored.
    pub fn abandon(&self, message_id: u16) { self.pending.remove(&message_id); }

    /// Monotonically increasing, wrapping message-id allocator.
    fn allocate_message_id(&self) -> u16 { self.next_message_id.fetch_add(1, Ordering::Relaxed) }

    /// Queue a packet and wait until the writer has flushed it. Blocks
    /// while the queue is full rather than dropping: client callers want
    /// delivery, and they are not on a socket-servicing task.
    async fn submit_sync(&self, packet: Packet) -> Result<(), ClientError> {
        let (receipt_tx, receipt_rx) = oneshot::channel();
        self.job_tx
            .send(Job {
                packet,
                receipt: Some(receipt_tx),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        receipt_rx.await.map_err(|_| ClientError::ConnectionClosed)
    }
}

struct ReaderHooks {
    ack_tx: mpsc::Sender<ReturnCode>,
    pending: Arc<DashMap<u16, oneshot::Sender<String>>>,
    events: Arc<dyn ClientEvents>,
    closed: CancellationToken,
}

async fn read_loop<S>(mut frames: FramedRead<ReadHalf<S>, MessageManager>, hooks: ReaderHooks)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let packet = match frames.next().await {
            None => {
                debug!("server closed the connection");
                break;
            }
            Some(Err(err)) => {
                if is_benign_disconnect(&err) {
                    debug!("connection closed: {err}");
                } else {
                    error!("read failed: {err}");
                }
                break;
            }
            Some(Ok(packet)) => packet,
        };
        match packet {
            Packet::ConnAck(ack) => {
                // try_send keeps the reader unblockable even if nobody is
                // waiting on the handshake any more.
                let _ = hooks.ack_tx.try_send(ack.return_code);
            }
            Packet::PingResp => {}
            Packet::SendResp(resp) => {
                // Late or duplicate responses have no entry and are
                // dropped on the floor.
                if let Some((_, response_tx)) = hooks.pending.remove(&resp.message_id) {
                    let _ = response_tx.send(resp.payload);
                }
            }
            Packet::SendReq(push) => {
                let events = Arc::clone(&hooks.events);
                tokio::spawn(async move {
                    events
                        .on_send_req_received(&push.req_type, &push.payload)
                        .await;
                });
            }
            Packet::Disconnect(_) => {
                debug!("server requested disconnect");
                break;
            }
            Packet::Connect(_) | Packet::PingReq => {
                warn!("unexpected {:?} from server", packet.message_type());
            }
        }
    }
    hooks.closed.cancel();
    hooks.events.on_disconnect().await;
}

async fn write_loop<S>(
    mut frames: FramedWrite<WriteHalf<S>, MessageManager>,
    mut job_rx: mpsc::Receiver<Job>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut draining = false;
    loop {
        let job = if draining {
            match job_rx.try_recv() {
                Ok(job) => job,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                biased;
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                () = closed.cancelled() => {
                    draining = true;
                    continue;
                }
            }
        };
        let is_disconnect = matches!(job.packet, Packet::Disconnect(_));
        let result = frames.send(job.packet).await;
        if let Some(receipt) = job.receipt {
            let _ = receipt.send(());
        }
        if let Err(err) = result {
            if !is_benign_disconnect(&err) {
                error!("write failed: {err}");
            }
            break;
        }
        if is_disconnect {
            break;
        }
    }
    let mut writer = frames.into_inner();
    let _ = writer.shutdown().await;
    closed.cancel();
}
