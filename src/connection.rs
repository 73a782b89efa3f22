//! Per-connection concurrency core.
//!
//! Every accepted socket gets three cooperating tasks: a reader decoding
//! packets into a bounded work queue, a writer draining a bounded job
//! queue onto the socket, and a session handler (see
//! [`handler`](crate::handler)) consuming the work queue. The queues are
//! the only channel between them; teardown flows through the
//! [`SessionHandle`]'s cancellation token.
//!
//! Queue offers never block: a full queue drops the message and logs it.
//! That is the backpressure policy — a misbehaving peer costs bounded
//! memory, not the process. The one delivery that must not be fire-and-
//! forget, the ConnAck, goes through [`SessionHandle::submit_sync`] and a
//! receipt the writer releases after the bytes are flushed.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    app::Shared,
    error::is_benign_disconnect,
    handler::SessionHandler,
    packet::{MessageManager, Packet, ReplyLevel, SendReq, error::ProtocolError},
};

/// Capacity of the inbound and outbound queues. Bounds memory under
/// misbehaving peers; overflow drops the message.
pub(crate) const QUEUE_LEN: usize = 200;

/// Read deadline applied before the first Connect has negotiated a
/// keep-alive, so a silent peer cannot pin a socket indefinitely.
const HANDSHAKE_READ_DEADLINE: Duration = Duration::from_secs(30);

/// An outbound packet plus an optional receipt released once the bytes
/// have been written to the socket.
pub(crate) struct Job {
    pub packet: Packet,
    pub receipt: Option<oneshot::Sender<()>>,
}

struct HandleInner {
    job_tx: mpsc::Sender<Job>,
    stop: CancellationToken,
    stopped: AtomicBool,
    kicked_out: AtomicBool,
    peer_ip: String,
}

/// Shared handle to one live session.
///
/// Clones are held by the session's own tasks and by the
/// [`OnlineRegistry`](crate::registry::OnlineRegistry), which uses it to
/// push a kick-out Disconnect at an older session for the same account.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    pub(crate) fn new(job_tx: mpsc::Sender<Job>, peer_ip: String) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                job_tx,
                stop: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                kicked_out: AtomicBool::new(false),
                peer_ip,
            }),
        }
    }

    /// Queue `packet` for the writer. Never blocks: a full queue drops the
    /// packet with an error log.
    pub fn submit(&self, packet: Packet) {
        match self.inner.job_tx.try_send(Job {
            packet,
            receipt: None,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                error!(
                    "{} job queue full, dropping {:?} packet",
                    self.inner.peer_ip,
                    job.packet.message_type()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{} job queue closed, session is gone", self.inner.peer_ip);
            }
        }
    }

    /// Queue `packet` and wait until the writer has flushed it. Used for
    /// the ConnAck, which must reach the wire before the handshake is
    /// considered done. Still drops when the queue is full.
    pub(crate) async fn submit_sync(&self, packet: Packet) {
        let (receipt_tx, receipt_rx) = oneshot::channel();
        match self.inner.job_tx.try_send(Job {
            packet,
            receipt: Some(receipt_tx),
        }) {
            Ok(()) => {
                // An error here means the writer died before flushing; the
                // session is tearing down either way.
                let _ = receipt_rx.await;
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                error!(
                    "{} job queue full, dropping {:?} packet",
                    self.inner.peer_ip,
                    job.packet.message_type()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{} job queue closed, session is gone", self.inner.peer_ip);
            }
        }
    }

    /// Push a fire-and-forget notification to this session's client.
    pub fn push_notify<B: Serialize>(&self, notify_type: &str, body: &B) {
        let payload = match serde_json::to_string(body) {
            Ok(payload) => payload,
            Err(err) => {
                error!("push notification body failed to serialise: {err}");
                return;
            }
        };
        self.submit(Packet::SendReq(SendReq {
            message_id: 0,
            reply_level: ReplyLevel::NoReply,
            req_type: notify_type.to_string(),
            payload,
            data: None,
        }));
    }

    /// Stop this session. The first call wins; later calls are no-ops so a
    /// kick-out cannot be downgraded by the session's own teardown.
    pub fn stop(&self, is_kick_out: bool) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if is_kick_out {
            self.inner.kicked_out.store(true, Ordering::SeqCst);
        }
        self.inner.stop.cancel();
    }

    /// Whether the winning [`stop`](Self::stop) call was a kick-out.
    pub(crate) fn was_kicked_out(&self) -> bool { self.inner.kicked_out.load(Ordering::SeqCst) }

    /// Resolves once the session has been stopped.
    pub(crate) async fn cancelled(&self) { self.inner.stop.cancelled().await; }

    /// True when no outbound jobs are waiting for the writer.
    pub(crate) fn jobs_idle(&self) -> bool {
        self.inner.job_tx.capacity() == self.inner.job_tx.max_capacity()
    }

    /// Whether two handles refer to the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }
}

/// Start the three tasks serving one accepted stream.
pub(crate) fn spawn<S>(stream: S, peer: SocketAddr, shared: Arc<Shared>, tracker: &TaskTracker)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ip = peer.ip().to_string();
    let manager = MessageManager::new();
    let (read_half, write_half) = tokio::io::split(stream);
    let (job_tx, job_rx) = mpsc::channel(QUEUE_LEN);
    let (work_tx, work_rx) = mpsc::channel(QUEUE_LEN);
    let handle = SessionHandle::new(job_tx, ip.clone());
    let handler = SessionHandler::new(shared, handle.clone(), ip.clone());

    tracker.spawn(read_loop(
        FramedRead::new(read_half, manager.clone()),
        work_tx,
        handle.clone(),
        ip,
    ));
    tracker.spawn(write_loop(
        FramedWrite::new(write_half, manager),
        job_rx,
        handle,
    ));
    tracker.spawn(handler.run(work_rx));
}

/// Decode packets until the peer goes away, a deadline lapses, or the
/// session is stopped, offering each packet to the handler's work queue.
async fn read_loop<S>(
    mut frames: FramedRead<ReadHalf<S>, MessageManager>,
    work_tx: mpsc::Sender<Packet>,
    handle: SessionHandle,
    ip: String,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        // 1.5 × the negotiated keep-alive, re-read every iteration because
        // the first Connect changes it mid-stream.
        let keep_alive = frames.decoder().keep_alive_secs();
        let deadline = if keep_alive == 0 {
            HANDSHAKE_READ_DEADLINE
        } else {
            Duration::from_millis(u64::from(keep_alive) * 1500)
        };
        let next = tokio::select! {
            biased;
            () = handle.cancelled() => break,
            next = timeout(deadline, frames.next()) => next,
        };
        let packet = match next {
            Err(_) => {
                debug!("{ip} read deadline exceeded, closing session");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                if let Some(violation) = ProtocolError::from_io(&err) {
                    debug!("{ip} protocol violation: {violation}");
                } else if is_benign_disconnect(&err) {
                    debug!("{ip} connection closed: {err}");
                } else {
                    error!("{ip} read failed: {err}");
                }
                break;
            }
            Ok(Some(Ok(packet))) => packet,
        };
        match work_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                warn!(
                    "{ip} work queue full, dropping {:?} packet",
                    packet.message_type()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    handle.stop(false);
}

/// Encode queued jobs onto the socket. Receipts are released after each
/// write attempt; a flushed Disconnect ends the writer immediately. Once
/// the session is stopped the remaining queue is drained without waiting
/// for more producers.
async fn write_loop<S>(
    mut frames: FramedWrite<WriteHalf<S>, MessageManager>,
    mut job_rx: mpsc::Receiver<Job>,
    handle: SessionHandle,
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
                () = handle.cancelled() => {
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
            if is_benign_disconnect(&err) {
                debug!("write on closed connection: {err}");
            } else {
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
    handle.stop(false);
}

#[cfg(test)]
#[path = "connection/tests.rs"]
mod tests;
