//! Serving exchanges started by the peer.
//!
//! The [`Forwarder`] reassembles inbound requests from their frames and runs
//! each one through the [`Pipeline`]: accept rules, variable substitution,
//! credential injection, then the origin call whose response streams back as
//! frames.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use n0_future::StreamExt;
use percent_encoding::percent_decode_str;
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};
use url::Url;

use crate::{
    channel::{ChannelClosed, ChannelHandle, FrameConsumer},
    filter::{
        BLOCKED_STATUS, BlockReason, BlockSide, BlockedBody, FilterRequest, RuleAuth, Ruleset,
        Verdict,
    },
    frame::{CorrelationId, Frame, FrameKind, Side},
    mux::{MAX_REQUEST_BODY, RequestDescriptor},
    parse::{
        BROKER_TOKEN_HEADER, RequestHead, ResponseHead, filter_hop_by_hop_headers,
        strip_internal_headers,
    },
};

pub use self::template::{VAR_SUB_KEY, Variables};

mod template;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for a [`Pipeline`].
#[derive(Debug, Clone, Default)]
pub struct PipelineOpts {
    /// Rules every forwarded request must pass.
    pub rules: Ruleset,
    /// Values for `${NAME}` placeholders.
    pub variables: Variables,
    /// Origin base URL for rules that do not name one.
    pub default_origin: Option<String>,
    /// Send the calling client's token to the origin in `X-Broker-Token`.
    ///
    /// Only meaningful on the server, where the caller is a known client.
    pub forward_identity: bool,
}

/// Turns one reassembled request into response frames.
#[derive(Debug, Clone)]
pub struct Pipeline {
    opts: PipelineOpts,
    identity: Option<HeaderValue>,
    http_client: reqwest::Client,
}

impl Pipeline {
    pub fn new(opts: PipelineOpts) -> Result<Self> {
        // Bodies are relayed byte for byte, so no decompression and no
        // following of redirects on behalf of the caller.
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .std_context("Failed to build origin http client")?;
        Ok(Self {
            opts,
            identity: None,
            http_client,
        })
    }

    /// Pipeline for requests sent by the client identified as `token`.
    ///
    /// The forwarded identity is the lowercased token.
    pub fn for_client(&self, token: &str) -> Self {
        let identity = self
            .opts
            .forward_identity
            .then(|| HeaderValue::from_str(&token.to_lowercase()).ok())
            .flatten();
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn rules(&self) -> &Ruleset {
        &self.opts.rules
    }

    /// Serves one request and writes the complete response, or an error frame,
    /// to `reply`.
    ///
    /// Only fails if the channel closed.
    pub async fn forward(
        &self,
        id: CorrelationId,
        request: RequestDescriptor,
        reply: &ChannelHandle,
    ) -> Result<(), ChannelClosed> {
        let filter = FilterRequest::new(&request.head, &request.body);
        let rule = match self.opts.rules.evaluate(&filter) {
            Verdict::Allow(rule) => rule,
            Verdict::Block(kind) => {
                let reason = BlockReason::new(BlockSide::Forwarding, kind);
                debug!(method=%request.head.method, path=%filter.path, %reason, "blocked");
                return send_blocked(id, reason, filter.path, reply);
            }
        };
        let outbound = match self.prepare(
            request,
            filter.body,
            rule.origin(),
            rule.auth(),
        ) {
            Ok(outbound) => outbound,
            Err(err) => {
                warn!("failed to prepare origin request: {err:#}");
                return reply.send(Frame::error(id, format!("{err:#}")));
            }
        };
        debug!(method=%outbound.method(), url=%outbound.url(), "calling origin");
        let response = match self.http_client.execute(outbound).await {
            Ok(response) => response,
            Err(err) => {
                debug!("origin request failed: {err:#}");
                return reply.send(Frame::error(id, err));
            }
        };
        let total = relay_response(id, response, reply).await?;
        debug!(response_body_len=%total, "finish");
        Ok(())
    }

    /// Builds the origin request for an accepted `request`.
    fn prepare(
        &self,
        request: RequestDescriptor,
        parsed_body: Option<serde_json::Value>,
        origin: Option<&str>,
        auth: Option<&RuleAuth>,
    ) -> Result<reqwest::Request> {
        let vars = &self.opts.variables;
        let RequestDescriptor { head, body } = request;
        let origin = origin
            .or(self.opts.default_origin.as_deref())
            .context("No origin configured for accepted request")?;
        let mut url = origin_url(&vars.substitute(origin), &head.target)?;

        let mut headers = head.headers;
        filter_hop_by_hop_headers(&mut headers);
        strip_internal_headers(&mut headers);
        for name in [HOST, ACCEPT_ENCODING, CONTENT_LENGTH] {
            headers.remove(name);
        }
        if let Some(value) = take_userinfo(&mut url)? {
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(auth) = auth {
            headers.insert(AUTHORIZATION, auth_header(auth, vars)?);
        }
        if let Some(identity) = &self.identity {
            headers.insert(BROKER_TOKEN_HEADER, identity.clone());
        }

        let body = match parsed_body {
            Some(mut json) => {
                if vars.substitute_body(&mut json) {
                    Bytes::from(serde_json::to_vec(&json).anyerr()?)
                } else {
                    body
                }
            }
            None => body,
        };

        let mut outbound = reqwest::Request::new(head.method, url);
        *outbound.headers_mut() = headers;
        *outbound.body_mut() = Some(body.into());
        Ok(outbound)
    }
}

/// Joins the origin base with the raw request target.
fn origin_url(origin: &str, target: &str) -> Result<Url> {
    let joined = format!("{}{}", origin.trim_end_matches('/'), target);
    Url::parse(&joined).std_context("Invalid origin url")
}

/// Removes credentials from `url` and turns them into an authorization value.
///
/// `user:pass@` yields basic auth, a lone `token@` yields `token <token>`.
fn take_userinfo(url: &mut Url) -> Result<Option<HeaderValue>> {
    if url.username().is_empty() {
        return Ok(None);
    }
    let user = decode(url.username());
    let value = match url.password() {
        Some(password) => basic(&user, &decode(password)),
        None => format!("token {user}"),
    };
    url.set_username("")
        .ok()
        .and_then(|()| url.set_password(None).ok())
        .context("Origin url cannot carry credentials")?;
    header_value(value).map(Some)
}

fn auth_header(auth: &RuleAuth, vars: &Variables) -> Result<HeaderValue> {
    let value = match auth {
        RuleAuth::Basic { username, password } => {
            basic(&vars.substitute(username), &vars.substitute(password))
        }
        RuleAuth::Bearer { token } => format!("Bearer {}", vars.substitute(token)),
        RuleAuth::Token { token } => format!("token {}", vars.substitute(token)),
    };
    header_value(value)
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64_STANDARD.encode(format!("{user}:{password}")))
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn header_value(value: String) -> Result<HeaderValue> {
    let mut value = HeaderValue::try_from(value).std_context("Invalid authorization value")?;
    value.set_sensitive(true);
    Ok(value)
}

fn send_blocked(
    id: CorrelationId,
    reason: BlockReason,
    url: String,
    reply: &ChannelHandle,
) -> Result<(), ChannelClosed> {
    let body = BlockedBody::new(reason, url).to_bytes();
    let mut head = ResponseHead::new(BLOCKED_STATUS);
    head.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    head.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    reply.send(Frame::new(FrameKind::ResponseHead, id, head.encode()))?;
    for frame in Frame::body(FrameKind::ResponseChunk, FrameKind::ResponseEnd, id, body) {
        reply.send(frame)?;
    }
    Ok(())
}

/// Streams an origin response as frames, in the order bytes arrive.
///
/// The origin body is read no faster than the channel writes it. A body
/// failure after the head ends the exchange with an error frame, never with an
/// end frame.
async fn relay_response(
    id: CorrelationId,
    mut response: reqwest::Response,
    reply: &ChannelHandle,
) -> Result<usize, ChannelClosed> {
    filter_hop_by_hop_headers(response.headers_mut());
    let mut head = ResponseHead::new(response.status());
    head.headers = std::mem::take(response.headers_mut());
    debug!(status=%head.status, "received response from origin");
    reply.send(Frame::new(FrameKind::ResponseHead, id, head.encode()))?;

    let mut total = 0;
    let mut body = response.bytes_stream();
    while let Some(bytes) = body.next().await {
        match bytes {
            Ok(bytes) => {
                total += bytes.len();
                for frame in Frame::chunks(FrameKind::ResponseChunk, id, bytes) {
                    reply.send_data(frame).await?;
                }
            }
            Err(err) => {
                debug!(relayed = total, "origin body failed: {err:#}");
                reply.send(Frame::error(id, err))?;
                return Ok(total);
            }
        }
    }
    reply.send(Frame::new(FrameKind::ResponseEnd, id, Bytes::new()))?;
    Ok(total)
}

/// Exchanges started by the peer, serving each through a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

#[derive(Debug)]
struct ForwarderInner {
    /// This end's side. Inbound requests carry ids of the other side.
    side: Side,
    pipeline: Pipeline,
    channel: ChannelHandle,
    inbound: Mutex<HashMap<CorrelationId, Inbound>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Debug)]
enum Inbound {
    Receiving { head: RequestHead, body: BytesMut },
    Running(CancellationToken),
}

impl Forwarder {
    pub fn new(side: Side, pipeline: Pipeline, channel: ChannelHandle) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                side,
                pipeline,
                channel,
                inbound: Default::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Number of requests being received or served.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }

    /// Cancels every running request and waits briefly for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        match self
            .inner
            .tasks
            .wait()
            .timeout(GRACEFUL_SHUTDOWN_TIMEOUT)
            .await
        {
            Ok(_) => debug!("all forwarding tasks finished"),
            Err(_) => debug!(
                remaining = self.inner.tasks.len(),
                "not all forwarding tasks finished in time"
            ),
        }
    }

    fn reject(&self, id: CorrelationId, reason: &str) {
        debug!(%id, reason, "rejecting inbound request");
        self.inner.lock().remove(&id);
        self.inner.channel.send(Frame::error(id, reason)).ok();
    }

    fn spawn(&self, id: CorrelationId, request: RequestDescriptor) -> CancellationToken {
        let cancel = self.inner.shutdown.child_token();
        let this = self.clone();
        let token = cancel.clone();
        let task = async move {
            let inner = &this.inner;
            match inner
                .pipeline
                .forward(id, request, &inner.channel)
                .with_cancellation_token(&token)
                .await
            {
                None => debug!("cancelled"),
                Some(Err(err)) => debug!("reply dropped: {err:#}"),
                Some(Ok(())) => {}
            }
            inner.lock().remove(&id);
        };
        self.inner
            .tasks
            .spawn(task.instrument(error_span!("forward", %id)));
        cancel
    }
}

impl ForwarderInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Inbound>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameConsumer for Forwarder {
    async fn on_frame(&self, frame: Frame) {
        let Some(id) = frame.id else {
            return;
        };
        match frame.kind {
            FrameKind::RequestHead => {
                if self.inner.side.owns(id) {
                    return self.reject(id, "request id has the wrong parity");
                }
                let head = match RequestHead::decode(&frame.payload) {
                    Ok(head) => head,
                    Err(err) => return self.reject(id, &format!("invalid request head: {err:#}")),
                };
                let mut inbound = self.inner.lock();
                if inbound.contains_key(&id) {
                    drop(inbound);
                    return self.reject(id, "duplicate request head");
                }
                inbound.insert(
                    id,
                    Inbound::Receiving {
                        head,
                        body: BytesMut::new(),
                    },
                );
            }
            FrameKind::RequestChunk => {
                let rejected = match self.inner.lock().get_mut(&id) {
                    Some(Inbound::Receiving { body, .. })
                        if body.len() + frame.payload.len() > MAX_REQUEST_BODY =>
                    {
                        Some("request body too large")
                    }
                    Some(Inbound::Receiving { body, .. }) => {
                        body.extend_from_slice(&frame.payload);
                        None
                    }
                    _ => Some("request chunk without head"),
                };
                if let Some(reason) = rejected {
                    self.reject(id, reason);
                }
            }
            FrameKind::RequestEnd => {
                let mut inbound = self.inner.lock();
                let Some(Inbound::Receiving { head, body }) = inbound.remove(&id) else {
                    drop(inbound);
                    return self.reject(id, "request end without head");
                };
                let request = RequestDescriptor {
                    head,
                    body: body.freeze(),
                };
                // holding the lock until the entry is in place keeps the task
                // from removing it first
                let cancel = self.spawn(id, request);
                inbound.insert(id, Inbound::Running(cancel));
            }
            FrameKind::Error => match self.inner.lock().remove(&id) {
                Some(Inbound::Running(cancel)) => {
                    debug!(%id, "peer abandoned exchange, cancelling");
                    cancel.cancel();
                }
                Some(Inbound::Receiving { .. }) => debug!(%id, "peer abandoned request"),
                None => debug!(%id, "error frame for unknown request"),
            },
            kind => debug!(%id, ?kind, "ignoring frame"),
        }
    }
}
