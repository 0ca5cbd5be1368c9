//! The ordered duplex channel under one connection.
//!
//! Frames to send go through a [`ChannelHandle`], which may be cloned freely
//! and used from any task. A single session task owns the transport: it writes
//! queued frames in order and dispatches inbound frames to the two frame
//! consumers of its connection.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::BytesMut;
use n0_error::stack_error;
use n0_future::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
};
use tokio_util::{
    codec::{Encoder, FramedRead},
    sync::{CancellationToken, WaitForCancellationFuture},
};
use tracing::{debug, trace};

use crate::frame::{Frame, FrameCodec, FrameError, FrameKind, Side};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// Body bytes queued for the transport but not yet written, per channel.
///
/// [`ChannelHandle::send_data`] waits once this is used up, so a sender can
/// never run further ahead of the transport than this.
pub const SEND_BUFFER: u32 = 1024 * 1024;

/// Process-unique identifier of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("ch-{_0}")]
pub struct ChannelId(u64);

/// The channel has been closed.
#[stack_error(derive, add_meta)]
#[error("channel {id} is closed")]
pub struct ChannelClosed {
    id: ChannelId,
}

/// Sending half of a channel plus its liveness.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Queued>,
    credit: Arc<Semaphore>,
    closed: CancellationToken,
}

/// A frame waiting for the transport. Its credit returns once it is written.
#[derive(Debug)]
struct Queued {
    frame: Frame,
    credit: Option<OwnedSemaphorePermit>,
}

/// Frames queued for the transport, consumed by [`run_session`].
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::UnboundedReceiver<Queued>,
}

impl Outbound {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok().map(|queued| queued.frame)
    }
}

impl ChannelHandle {
    pub fn new() -> (Self, Outbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            tx,
            credit: Arc::new(Semaphore::new(SEND_BUFFER as usize)),
            closed: CancellationToken::new(),
        };
        (handle, Outbound { rx })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queues a frame. Frames queued from one task are written in order.
    ///
    /// Does not wait for the transport. Meant for heads, ends, errors and
    /// bodies that are already held in memory.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelClosed> {
        self.queue(frame, None)
    }

    /// Queues a body frame once the transport has room for its payload.
    ///
    /// Waits while [`SEND_BUFFER`] bytes are queued and unwritten, which is
    /// how a fast producer is held to the pace of the connection.
    pub async fn send_data(&self, frame: Frame) -> Result<(), ChannelClosed> {
        let len = u32::try_from(frame.payload.len()).unwrap_or(u32::MAX);
        let credit = tokio::select! {
            credit = self.credit.clone().acquire_many_owned(len.clamp(1, SEND_BUFFER)) => {
                credit.map_err(|_| ChannelClosed::new(self.id))?
            }
            _ = self.closed.cancelled() => return Err(ChannelClosed::new(self.id)),
        };
        self.queue(frame, Some(credit))
    }

    fn queue(&self, frame: Frame, credit: Option<OwnedSemaphorePermit>) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed::new(self.id));
        }
        let queued = Queued {
            frame,
            credit: credit,
        };
        self.tx
            .send(queued)
            .map_err(|_| ChannelClosed::new(self.id))
    }

    /// Whether frames can still be queued.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Receives the frames of one half of an exchange.
///
/// Exactly two implementations exist: the [`Multiplexer`](crate::mux::Multiplexer)
/// consumes frames answering exchanges this side started, the
/// [`Forwarder`](crate::forward::Forwarder) consumes frames of exchanges the
/// peer started.
///
/// The session reads no further frames until `on_frame` completes, so a
/// consumer that waits holds the peer back through transport flow control.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, frame: Frame) -> impl Future<Output = ()> + Send;
}

/// Routes inbound frames to the consumer owning their exchange.
pub struct Dispatch<'a, L, R> {
    /// Consumer for exchanges started by this side.
    pub local: &'a L,
    /// Consumer for exchanges started by the peer.
    pub remote: &'a R,
    pub side: Side,
}

impl<L: FrameConsumer, R: FrameConsumer> Dispatch<'_, L, R> {
    async fn dispatch(&self, frame: Frame) {
        match (frame.kind, frame.id) {
            (FrameKind::Identify, _) => debug!("ignoring repeated identify frame"),
            (kind, _) if kind.is_response() => self.local.on_frame(frame).await,
            (kind, _) if kind.is_request() => self.remote.on_frame(frame).await,
            (_, Some(id)) if self.side.owns(id) => self.local.on_frame(frame).await,
            _ => self.remote.on_frame(frame).await,
        }
    }
}

/// Drives one channel until the transport ends or the channel is closed.
///
/// Closes the channel on return.
pub async fn run_session<R, W, L, C>(
    channel: &ChannelHandle,
    mut frames: FramedRead<R, FrameCodec>,
    mut send: W,
    mut outbound: Outbound,
    dispatch: Dispatch<'_, L, C>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: FrameConsumer,
    C: FrameConsumer,
{
    let writer = async {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut credits = Vec::new();
        while let Some(queued) = outbound.rx.recv().await {
            trace!(frame=?queued.frame, "send");
            codec.encode(queued.frame, &mut buf)?;
            credits.push(queued.credit);
            // drain whatever is already queued into the same write
            while let Ok(queued) = outbound.rx.try_recv() {
                trace!(frame=?queued.frame, "send");
                codec.encode(queued.frame, &mut buf)?;
                credits.push(queued.credit);
            }
            send.write_all(&buf).await?;
            buf.clear();
            credits.clear();
        }
        Ok::<_, FrameError>(())
    };
    let reader = async {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            trace!(?frame, "recv");
            dispatch.dispatch(frame).await;
        }
        debug!("channel ended by remote");
        Ok::<_, FrameError>(())
    };
    let res = tokio::select! {
        res = reader => res,
        res = writer => res,
        _ = channel.closed() => {
            debug!("channel closed locally");
            Ok(())
        }
    };
    channel.close();
    send.shutdown().await.ok();
    res
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use bytes::Bytes;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::frame::CorrelationId;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Frame>>);

    impl FrameConsumer for Collect {
        async fn on_frame(&self, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    #[tokio::test]
    async fn frames_are_routed_by_kind_and_owner() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_recv, a_send) = tokio::io::split(a);
        let (b_recv, b_send) = tokio::io::split(b);

        let (chan_a, out_a) = ChannelHandle::new();
        let (chan_b, out_b) = ChannelHandle::new();
        let (local, remote) = (Collect::default(), Collect::default());
        let ignore = Collect::default();

        chan_a
            .send(Frame::new(FrameKind::RequestHead, CorrelationId(1), "x"))
            .unwrap();
        chan_a
            .send(Frame::new(FrameKind::ResponseEnd, CorrelationId(2), ""))
            .unwrap();
        chan_a.send(Frame::error(CorrelationId(2), "boom")).unwrap();
        chan_a.send(Frame::error(CorrelationId(1), "gone")).unwrap();

        let session_a = run_session(
            &chan_a,
            FramedRead::new(a_recv, FrameCodec::default()),
            a_send,
            out_a,
            Dispatch {
                local: &ignore,
                remote: &ignore,
                side: Side::Client,
            },
        );
        let session_b = run_session(
            &chan_b,
            FramedRead::new(b_recv, FrameCodec::default()),
            b_send,
            out_b,
            Dispatch {
                local: &local,
                remote: &remote,
                side: Side::Server,
            },
        );
        let wait = async {
            while local.0.lock().unwrap().len() + remote.0.lock().unwrap().len() < 4 {
                tokio::task::yield_now().await;
            }
            chan_a.close();
            chan_b.close();
        };
        let _ = tokio::join!(session_a, session_b, wait);

        let local = local.0.into_inner().unwrap();
        let remote = remote.0.into_inner().unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(local[0].kind, FrameKind::ResponseEnd);
        assert_eq!(local[1].payload, "boom");
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[0].kind, FrameKind::RequestHead);
        assert_eq!(remote[1].payload, "gone");
        assert!(!chan_a.is_open());
        assert!(chan_b.send(Frame::identify("")).is_err());
    }

    #[tokio::test]
    async fn send_data_waits_for_the_transport() {
        let (chan, mut outbound) = ChannelHandle::new();
        let id = CorrelationId(2);
        let chunk = Bytes::from(vec![7u8; 64 * 1024]);
        for _ in 0..SEND_BUFFER as usize / chunk.len() {
            chan.send_data(Frame::new(FrameKind::ResponseChunk, id, chunk.clone()))
                .await
                .unwrap();
        }

        let next = chan.send_data(Frame::new(FrameKind::ResponseChunk, id, chunk.clone()));
        tokio::pin!(next);
        let blocked = tokio::time::timeout(Duration::from_millis(50), next.as_mut()).await;
        assert!(blocked.is_err(), "buffer is full");
        // control frames are never held back
        chan.send(Frame::error(CorrelationId(4), "gone")).unwrap();

        // writing one frame frees room for the next
        assert_eq!(outbound.try_recv().unwrap().payload, chunk);
        next.await.unwrap();

        let held = chan.send_data(Frame::new(FrameKind::ResponseChunk, id, chunk.clone()));
        tokio::pin!(held);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), held.as_mut())
                .await
                .is_err()
        );
        chan.close();
        assert!(held.await.is_err());
    }
}
