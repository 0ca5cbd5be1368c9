//! Request/response exchanges multiplexed over one channel.
//!
//! Every exchange lives in the pending table of its [`Multiplexer`] until it
//! resolves. Removal from that table is the only way an exchange resolves, so
//! whichever of response end, error frame, deadline, cancellation or
//! connection loss removes it first decides the outcome, and all later
//! frames for its id are dropped.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use n0_future::{Stream, StreamExt, stream};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::future::FutureExt;
use tracing::{debug, trace};

pub use crate::{error::ExchangeError, frame::Side};
use crate::{
    channel::{ChannelHandle, FrameConsumer},
    error::Failure,
    frame::{CorrelationId, Frame, FrameKind},
    parse::{RequestHead, ResponseHead},
    registry::Liveness,
};

/// Largest request body relayed in one exchange.
pub const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// A request to relay: head plus the complete body.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub head: RequestHead,
    pub body: Bytes,
}

/// Exchanges started by this side of one channel.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    side: Side,
    channel: ChannelHandle,
    next_id: AtomicU64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    liveness: Liveness,
    pending: HashMap<CorrelationId, Pending>,
}

/// Response frames buffered per exchange before the session stops reading.
const EXCHANGE_BUFFER: usize = 16;

/// How long the session waits on a caller that does not read its response.
const CONSUMER_STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Pending {
    /// Set once the response head arrived.
    streaming: bool,
    events: mpsc::Sender<Event>,
    /// Fired on resolution. Events still queued are delivered first.
    outcome: oneshot::Sender<Outcome>,
}

/// `Ok` once the response end arrived.
type Outcome = Result<(), Failure>;

#[derive(Debug)]
enum Event {
    Head(ResponseHead),
    Data(Bytes),
}

enum Step {
    Deliver(mpsc::Sender<Event>, Event),
    Resolve(Outcome),
}

impl Multiplexer {
    pub fn new(side: Side, channel: ChannelHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                side,
                channel,
                next_id: AtomicU64::new(side.first_id()),
                state: Mutex::new(State {
                    liveness: Liveness::Connecting,
                    pending: HashMap::new(),
                }),
            }),
        }
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.inner.channel
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.lock().liveness
    }

    /// Number of unresolved exchanges.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Moves from connecting to identified. Fails once disconnected.
    pub(crate) fn set_identified(&self) -> bool {
        let mut state = self.inner.lock();
        match state.liveness {
            Liveness::Disconnected => false,
            _ => {
                state.liveness = Liveness::Identified;
                true
            }
        }
    }

    /// Marks the connection disconnected and fails every pending exchange with
    /// `failure`, atomically. Returns the number of failed exchanges.
    pub(crate) fn disconnect(&self, failure: Failure) -> usize {
        let mut state = self.inner.lock();
        state.liveness = Liveness::Disconnected;
        let failed = state.pending.len();
        for (id, pending) in state.pending.drain() {
            trace!(%id, ?failure, "failing pending exchange");
            pending.outcome.send(Err(failure.clone())).ok();
        }
        failed
    }

    /// Starts an exchange and queues its request frames.
    ///
    /// Fails immediately unless the connection is identified. The exchange
    /// resolves with a timeout once `deadline` passes.
    pub fn send(
        &self,
        request: RequestDescriptor,
        deadline: Instant,
    ) -> Result<ExchangeHandle, ExchangeError> {
        let id = CorrelationId(self.inner.next_id.fetch_add(2, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(EXCHANGE_BUFFER);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.liveness != Liveness::Identified {
                return Err(Failure::Unavailable.into());
            }
            state.pending.insert(
                id,
                Pending {
                    streaming: false,
                    events: tx,
                    outcome: outcome_tx,
                },
            );
        }
        let rx = ExchangeRx {
            id,
            mux: self.clone(),
            events: rx,
            outcome: outcome_rx,
            deadline,
            done: false,
        };
        debug!(%id, method=%request.head.method, target=%request.head.target, "send request");
        let head = Frame::new(FrameKind::RequestHead, id, request.head.encode());
        let body = Frame::body(FrameKind::RequestChunk, FrameKind::RequestEnd, id, request.body);
        for frame in std::iter::once(head).chain(body) {
            if self.inner.channel.send(frame).is_err() {
                // dropping `rx` removes the entry
                return Err(Failure::Lost.into());
            }
        }
        Ok(ExchangeHandle { rx })
    }

    /// Resolves `id` locally and tells the peer to stop working on it.
    ///
    /// Returns `false` if the exchange had already resolved.
    fn abandon(&self, id: CorrelationId, reason: &str) -> bool {
        let removed = self.inner.lock().pending.remove(&id).is_some();
        if removed {
            debug!(%id, reason, "abandon exchange");
            self.inner.channel.send(Frame::error(id, reason)).ok();
        }
        removed
    }

    /// Resolves `id` with `outcome` unless it already resolved.
    fn resolve(&self, id: CorrelationId, outcome: Outcome) {
        let Some(pending) = self.inner.lock().pending.remove(&id) else {
            return;
        };
        if let Err(Failure::Protocol(reason)) = &outcome {
            debug!(%id, %reason, "exchange failed");
            self.inner.channel.send(Frame::error(id, reason)).ok();
        }
        pending.outcome.send(outcome).ok();
    }

    /// Hands `event` to the exchange, waiting while its buffer is full.
    async fn deliver(&self, id: CorrelationId, events: mpsc::Sender<Event>, event: Event) {
        let sent = events.send(event).timeout(CONSUMER_STALL_TIMEOUT).await;
        drop(events);
        // a closed receiver abandons the exchange on drop
        if sent.is_err() {
            let reason = "response not consumed in time".to_string();
            self.resolve(id, Err(Failure::Protocol(reason)));
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameConsumer for Multiplexer {
    async fn on_frame(&self, frame: Frame) {
        let Some(id) = frame.id else {
            return;
        };
        let step = {
            let mut state = self.inner.lock();
            let Some(pending) = state.pending.get_mut(&id) else {
                debug!(%id, kind=?frame.kind, "dropping frame for unknown exchange");
                return;
            };
            match frame.kind {
                FrameKind::ResponseHead if !pending.streaming => {
                    match ResponseHead::decode(&frame.payload) {
                        Ok(head) => {
                            pending.streaming = true;
                            Step::Deliver(pending.events.clone(), Event::Head(head))
                        }
                        Err(err) => Step::Resolve(Err(Failure::Protocol(format!(
                            "invalid response head: {err:#}"
                        )))),
                    }
                }
                FrameKind::ResponseChunk if pending.streaming => {
                    Step::Deliver(pending.events.clone(), Event::Data(frame.payload))
                }
                FrameKind::ResponseEnd if pending.streaming => Step::Resolve(Ok(())),
                FrameKind::Error => Step::Resolve(Err(Failure::Upstream(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                ))),
                kind => Step::Resolve(Err(Failure::Protocol(format!(
                    "unexpected {kind:?} frame"
                )))),
            }
        };
        match step {
            Step::Deliver(events, event) => self.deliver(id, events, event).await,
            Step::Resolve(outcome) => self.resolve(id, outcome),
        }
    }
}

/// What the receiving end of an exchange sees next.
#[derive(Debug)]
enum Next {
    Event(Event),
    End,
}

/// Receiving end of one exchange. Abandons the exchange when dropped early.
#[derive(Debug)]
struct ExchangeRx {
    id: CorrelationId,
    mux: Multiplexer,
    events: mpsc::Receiver<Event>,
    outcome: oneshot::Receiver<Outcome>,
    deadline: Instant,
    done: bool,
}

impl ExchangeRx {
    async fn next(&mut self) -> Result<Next, Failure> {
        let next = tokio::select! {
            biased;
            event = self.events.recv() => match event {
                Some(event) => Ok(Next::Event(event)),
                // every sender is gone once the exchange resolved
                None => self.finish(),
            },
            _ = tokio::time::sleep_until(self.deadline) => {
                if self.mux.abandon(self.id, "exchange timed out") {
                    Err(Failure::Timeout)
                } else {
                    // resolved concurrently
                    match self.events.try_recv() {
                        Ok(event) => Ok(Next::Event(event)),
                        Err(_) => self.finish(),
                    }
                }
            }
        };
        if !matches!(next, Ok(Next::Event(_))) {
            self.done = true;
        }
        next
    }

    fn finish(&mut self) -> Result<Next, Failure> {
        match self.outcome.try_recv() {
            Ok(Ok(())) => Ok(Next::End),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(Failure::Lost),
        }
    }
}

impl Drop for ExchangeRx {
    fn drop(&mut self) {
        if !self.done {
            self.mux.abandon(self.id, "exchange cancelled");
        }
    }
}

/// Handle to a pending exchange.
#[derive(Debug)]
pub struct ExchangeHandle {
    rx: ExchangeRx,
}

impl ExchangeHandle {
    pub fn id(&self) -> CorrelationId {
        self.rx.id
    }

    /// Waits for the response head. The body streams afterwards.
    pub async fn response(mut self) -> Result<Response, ExchangeError> {
        match self.rx.next().await {
            Ok(Next::Event(Event::Head(head))) => Ok(Response {
                head,
                body: ResponseBody::new(self.rx),
            }),
            Err(failure) => Err(failure.into()),
            Ok(next) => {
                Err(Failure::Protocol(format!("expected response head, got {next:?}")).into())
            }
        }
    }

    /// Waits for the complete response.
    pub async fn collect(self) -> Result<BufferedResponse, ExchangeError> {
        let Response { head, body } = self.response().await?;
        let body = body.collect().await?;
        Ok(BufferedResponse { head, body })
    }
}

/// Response head with its still streaming body.
#[derive(Debug)]
pub struct Response {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

/// A fully received response.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// Body chunks in arrival order.
///
/// Ends cleanly only after the response end frame. A failure after some
/// chunks yields an error item, so a truncated body never looks complete.
#[derive(derive_more::Debug)]
pub struct ResponseBody {
    #[debug("ResponseBody")]
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, ExchangeError>> + Send>>,
}

impl ResponseBody {
    fn new(rx: ExchangeRx) -> Self {
        let inner = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.next().await {
                Ok(Next::Event(Event::Data(bytes))) => Some((Ok(bytes), Some(rx))),
                Ok(Next::End) => None,
                Err(failure) => Some((Err(failure.into()), None)),
                Ok(Next::Event(Event::Head(_))) => Some((
                    Err(Failure::Protocol("duplicate response head".to_string()).into()),
                    None,
                )),
            }
        });
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Concatenates the whole body.
    pub async fn collect(mut self) -> Result<Bytes, ExchangeError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, ExchangeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
