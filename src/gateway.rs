//! HTTP listener relaying calls over a tunnel connection.
//!
//! The [`IngressGateway`] turns each inbound HTTP call into one exchange on the
//! connection picked by its [`ResolveConnection`] implementation, and turns the
//! outcome back into an HTTP response.

use std::{convert::Infallible, io, sync::Arc, time::Duration};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::{
    HeaderValue, Request, Response, StatusCode,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use http_body_util::{
    BodyExt, Full, LengthLimitError, Limited, StreamBody, combinators::UnsyncBoxBody,
};
use hyper::{body::Body, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{Result, e, stack_error};
use n0_future::{StreamExt, stream};
use percent_encoding::percent_decode_str;
use tokio::{net::TcpListener, sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    error::ExchangeError,
    filter::{BLOCKED_STATUS, BlockReason, BlockSide, BlockedBody, FilterRequest, Ruleset, Verdict},
    mux::{MAX_REQUEST_BODY, RequestDescriptor, Response as Exchanged},
    parse::{RequestHead, filter_hop_by_hop_headers, strip_internal_headers},
    registry::{Connection, Registry},
};

pub(crate) type HyperBody = UnsyncBoxBody<Bytes, io::Error>;

/// Default deadline of one exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Responses announcing at most this length are buffered before relaying.
const BUFFERED_RESPONSE_LIMIT: u64 = 1024 * 1024;

/// Why no connection was found for a call.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ResolveError {
    /// The addressed token is unknown, malformed or missing.
    #[error("unknown token")]
    UnknownToken,
    /// The one connection this gateway relays over is down.
    #[error("connection unavailable")]
    Unavailable,
}

impl ResolveError {
    fn response_status(&self) -> StatusCode {
        match self {
            ResolveError::UnknownToken { .. } => StatusCode::NOT_FOUND,
            ResolveError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Connection picked for one call, plus the target to request on it.
#[derive(Debug, Clone)]
pub struct Route {
    pub connection: Connection,
    /// Raw origin-form target forwarded to the far side.
    pub target: String,
}

#[dynosaur(DynResolveConnection = dyn(box) ResolveConnection)]
/// Picks the connection an inbound call is relayed over.
pub trait ResolveConnection: Send + Sync {
    /// Resolves the raw origin-form `target` of an inbound call.
    fn resolve<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Future<Output = Result<Route, ResolveError>> + Send + 'a;
}

/// Resolves `/{prefix}/{token}/{rest}` through a [`Registry`].
///
/// The call is forwarded with target `/{rest}` and the original query.
#[derive(Debug, Clone)]
pub struct TokenPath {
    registry: Registry,
    prefix: String,
}

impl TokenPath {
    pub const DEFAULT_PREFIX: &'static str = "/broker";

    pub fn new(registry: Registry) -> Self {
        Self::with_prefix(registry, Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(registry: Registry, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Splits a token-scoped target into the decoded token and the remaining target.
fn split_token_path(prefix: &str, target: &str) -> Option<(String, String)> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let (token, rest) = rest.split_once('/').unwrap_or((rest, ""));
    let token = percent_decode_str(token).decode_utf8().ok()?;
    if token.is_empty() {
        return None;
    }
    let mut target = format!("/{rest}");
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    Some((token.into_owned(), target))
}

impl ResolveConnection for TokenPath {
    async fn resolve<'a>(&'a self, target: &'a str) -> Result<Route, ResolveError> {
        let (token, target) =
            split_token_path(&self.prefix, target).ok_or_else(|| e!(ResolveError::UnknownToken))?;
        let connection = self
            .registry
            .lookup(&token)
            .ok_or_else(|| e!(ResolveError::UnknownToken))?;
        Ok(Route { connection, target })
    }
}

/// Relays every call over the current connection to the broker server.
#[derive(Debug, Clone)]
pub struct UpstreamConnection {
    current: watch::Receiver<Option<Connection>>,
}

impl UpstreamConnection {
    pub fn new(current: watch::Receiver<Option<Connection>>) -> Self {
        Self { current }
    }
}

impl ResolveConnection for UpstreamConnection {
    async fn resolve<'a>(&'a self, target: &'a str) -> Result<Route, ResolveError> {
        let connection = self
            .current
            .borrow()
            .clone()
            .ok_or_else(|| e!(ResolveError::Unavailable))?;
        Ok(Route {
            connection,
            target: target.to_string(),
        })
    }
}

/// Options for an [`IngressGateway`].
#[derive(Debug, Clone)]
pub struct GatewayOpts {
    /// Rules inbound calls must pass before they are relayed. `None` relays
    /// everything.
    pub rules: Option<Ruleset>,
    /// Deadline of each exchange, counted from the start of the call.
    pub exchange_timeout: Duration,
}

impl Default for GatewayOpts {
    fn default() -> Self {
        Self {
            rules: None,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }
}

/// HTTP front end of a tunnel.
#[derive(derive_more::Debug, Clone)]
pub struct IngressGateway {
    #[debug("Arc<dyn ResolveConnection>")]
    resolver: Arc<DynResolveConnection<'static>>,
    opts: GatewayOpts,
}

impl IngressGateway {
    pub fn new(resolver: impl ResolveConnection + 'static, opts: GatewayOpts) -> Self {
        Self {
            resolver: DynResolveConnection::new_arc(resolver),
            opts,
        }
    }

    /// Accepts TCP connections and serves each in a new task.
    ///
    /// Runs until the listener errors or the future is dropped, which also
    /// stops the connection tasks.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0;
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted TCP connection");
                        let service = service_fn(|req| {
                            let this = this.clone();
                            async move { Ok::<_, Infallible>(this.handle(req).await) }
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await {
                            debug!("connection closed with error: {err:#}");
                        }
                    })
                    .instrument(error_span!("http-accept", id)),
            );
            id += 1;
        }
    }

    /// Relays one call and translates the outcome.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<HyperBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let deadline = Instant::now() + self.opts.exchange_timeout;
        let target = req
            .uri()
            .path_and_query()
            .map_or("/", |p| p.as_str())
            .to_string();
        let route = match self.resolver.resolve(&target).await {
            Ok(route) => route,
            Err(err) => {
                debug!(%target, "not relayed: {err:#}");
                return empty_response(err.response_status());
            }
        };

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, MAX_REQUEST_BODY).collect().await {
            Ok(body) => body.to_bytes(),
            Err(err) if err.is::<LengthLimitError>() => {
                debug!(limit = MAX_REQUEST_BODY, "request body too large");
                return empty_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(err) => {
                warn!("failed to read request body: {err:#}");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        };
        let mut head = RequestHead::new(parts.method, route.target);
        head.headers = parts.headers;
        strip_internal_headers(&mut head.headers);
        filter_hop_by_hop_headers(&mut head.headers);

        if let Some(rules) = &self.opts.rules {
            let filter = FilterRequest::new(&head, &body);
            if let Verdict::Block(kind) = rules.evaluate(&filter) {
                let reason = BlockReason::new(BlockSide::Ingress, kind);
                debug!(method=%head.method, path=%filter.path, %reason, "blocked");
                return blocked_response(BlockedBody::new(reason, filter.path));
            }
        }

        let channel = route.connection.channel_id();
        let request = RequestDescriptor { head, body };
        let res = async {
            let exchange = route.connection.send(request, deadline)?;
            let response = exchange.response().await?;
            relay(response).await
        }
        .instrument(error_span!("relay", %channel))
        .await;
        res.unwrap_or_else(|err| {
            debug!("exchange failed: {err:#}");
            exchange_error_response(&err)
        })
    }
}

/// Translates a successful exchange.
///
/// A response announcing a small length is buffered so the relayed length is
/// the real one. Any other response streams, but only after its first body
/// event, so a failure before the first byte still becomes an error response.
/// A streamed response keeps its announced length, if any, and a body cut
/// short then aborts the call.
async fn relay(response: Exchanged) -> Result<Response<HyperBody>, ExchangeError> {
    let Exchanged { head, mut body } = response;
    let length = head.content_length();
    let mut headers = head.headers;
    filter_hop_by_hop_headers(&mut headers);
    let body = if length.is_some_and(|len| len <= BUFFERED_RESPONSE_LIMIT) {
        let bytes = body.collect().await?;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        full(bytes)
    } else {
        if length.is_none() {
            headers.remove(CONTENT_LENGTH);
        }
        match body.next().await {
            None => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                full(Bytes::new())
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(first)) => {
                let rest = stream::once(Ok(first)).chain(body).map(|chunk| {
                    chunk
                        .map(hyper::body::Frame::data)
                        .map_err(|err| io::Error::other(err.to_string()))
                });
                StreamBody::new(rest).boxed_unsync()
            }
        }
    };
    let mut res = Response::new(body);
    *res.status_mut() = head.status;
    *res.headers_mut() = headers;
    Ok(res)
}

fn full(bytes: Bytes) -> HyperBody {
    Full::new(bytes).map_err(infallible_to_io).boxed_unsync()
}

fn empty_response(status: StatusCode) -> Response<HyperBody> {
    let mut res = Response::new(full(Bytes::new()));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    res
}

fn exchange_error_response(err: &ExchangeError) -> Response<HyperBody> {
    let body = Bytes::from(err.response_body());
    let mut res = Response::new(full(body.clone()));
    *res.status_mut() = err.response_status();
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    res
}

fn blocked_response(blocked: BlockedBody) -> Response<HyperBody> {
    let body = blocked.to_bytes();
    let mut res = Response::new(full(body.clone()));
    *res.status_mut() = BLOCKED_STATUS;
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    res
}

fn infallible_to_io(err: Infallible) -> io::Error {
    match err {}
}

#[cfg(test)]
mod tests {
    use http::Method;
    use n0_tracing_test::traced_test;

    use super::*;
    use crate::{
        channel::{ChannelHandle, FrameConsumer, Outbound},
        frame::{CorrelationId, Frame, FrameKind, Side},
        parse::{BROKER_TOKEN_HEADER, ResponseHead},
        registry::{Identify, Metadata},
    };

    #[test]
    fn token_path() {
        let split = |t| split_token_path("/broker", t);
        assert_eq!(
            split("/broker/abc/echo-body/x?a=1"),
            Some(("abc".to_string(), "/echo-body/x?a=1".to_string()))
        );
        assert_eq!(split("/broker/abc"), Some(("abc".to_string(), "/".to_string())));
        assert_eq!(
            split("/broker/a%20b/long/nested%2Fpath"),
            Some(("a b".to_string(), "/long/nested%2Fpath".to_string()))
        );
        assert_eq!(split("/broker/"), None);
        assert_eq!(split("/broker"), None);
        assert_eq!(split("/brokerx/abc/"), None);
        assert_eq!(split("/other/abc/"), None);
        assert_eq!(split("/broker/%FF/x"), None);
    }

    /// A gateway relaying over a hand-driven connection.
    fn gateway(opts: GatewayOpts) -> (IngressGateway, Connection, Outbound) {
        let (channel, outbound) = ChannelHandle::new();
        let connection = Connection::new(Side::Server, channel);
        connection
            .mark_identified(Identify {
                token: "t".to_string(),
                metadata: Metadata {
                    version: "test".to_string(),
                    filters: Default::default(),
                },
            })
            .unwrap();
        let (_tx, rx) = watch::channel(Some(connection.clone()));
        let gateway = IngressGateway::new(UpstreamConnection::new(rx), opts);
        (gateway, connection, outbound)
    }

    /// Answers the next request on `outbound` with `frames(id)`.
    async fn answer(
        connection: &Connection,
        outbound: &mut Outbound,
        frames: impl FnOnce(CorrelationId) -> Vec<Frame>,
    ) -> RequestHead {
        let head = loop {
            if let Some(frame) = outbound.try_recv() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(head.kind, FrameKind::RequestHead);
        let id = head.id.unwrap();
        for frame in frames(id) {
            connection.multiplexer().on_frame(frame).await;
        }
        RequestHead::decode(&head.payload).unwrap()
    }

    fn response_head(id: CorrelationId, status: u16, headers: &[(&'static str, &'static str)]) -> Frame {
        let mut head = ResponseHead::new(StatusCode::from_u16(status).unwrap());
        for (name, value) in headers {
            head.headers.insert(*name, HeaderValue::from_static(*value));
        }
        Frame::new(FrameKind::ResponseHead, id, head.encode())
    }

    fn request(target: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(target)
            .header(BROKER_TOKEN_HEADER, "secret")
            .header("x-custom", "kept")
            .body(Full::new(Bytes::from_static(b"{\"a\":  1}")))
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn buffered_response_gets_real_length() {
        let (gateway, connection, mut outbound) = gateway(Default::default());
        let call = gateway.handle(request("/x?y=1"));
        let serve = answer(&connection, &mut outbound, |id| {
            vec![
                response_head(id, 200, &[("content-length", "999")]),
                Frame::new(FrameKind::ResponseChunk, id, "hello"),
                Frame::new(FrameKind::ResponseEnd, id, ""),
            ]
        });
        let (res, sent) = tokio::join!(call, serve);
        assert_eq!(sent.target, "/x?y=1");
        assert!(!sent.headers.contains_key(BROKER_TOKEN_HEADER));
        assert_eq!(sent.headers["x-custom"], "kept");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_LENGTH], "5");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    #[traced_test]
    async fn streamed_response_keeps_status_and_drops_length() {
        let (gateway, connection, mut outbound) = gateway(Default::default());
        let call = gateway.handle(request("/stream"));
        let serve = answer(&connection, &mut outbound, |id| {
            vec![
                response_head(id, 299, &[("test-orig-url", "/stream")]),
                Frame::new(FrameKind::ResponseChunk, id, "a".repeat(300)),
                Frame::new(FrameKind::ResponseChunk, id, "b".repeat(200)),
                Frame::new(FrameKind::ResponseEnd, id, ""),
            ]
        });
        let (res, _) = tokio::join!(call, serve);
        assert_eq!(res.status().as_u16(), 299);
        assert!(!res.headers().contains_key(CONTENT_LENGTH));
        assert_eq!(res.headers()["test-orig-url"], "/stream");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 500);
    }

    #[tokio::test]
    #[traced_test]
    async fn large_announced_response_streams_with_its_length() {
        let (gateway, connection, mut outbound) = gateway(Default::default());
        let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
        let count = 2 * BUFFERED_RESPONSE_LIMIT as usize / chunk.len();
        let call = async {
            let res = gateway.handle(request("/large")).await;
            assert_eq!(
                res.headers()[CONTENT_LENGTH],
                (2 * BUFFERED_RESPONSE_LIMIT).to_string().as_str()
            );
            res.into_body().collect().await.unwrap().to_bytes()
        };
        let serve = answer(&connection, &mut outbound, |id| {
            let mut head = ResponseHead::new(StatusCode::OK);
            head.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(2 * BUFFERED_RESPONSE_LIMIT));
            let mut frames = vec![Frame::new(FrameKind::ResponseHead, id, head.encode())];
            frames.extend((0..count).map(|_| Frame::new(FrameKind::ResponseChunk, id, chunk.clone())));
            frames.push(Frame::new(FrameKind::ResponseEnd, id, ""));
            frames
        });
        let (body, _) = tokio::join!(call, serve);
        assert_eq!(body.len() as u64, 2 * BUFFERED_RESPONSE_LIMIT);
    }

    #[tokio::test]
    #[traced_test]
    async fn oversized_request_body_is_rejected() {
        let (gateway, _connection, mut outbound) = gateway(Default::default());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from(vec![0u8; MAX_REQUEST_BODY + 1])))
            .unwrap();
        let res = gateway.handle(req).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_before_first_byte_is_an_error_status() {
        let (gateway, connection, mut outbound) = gateway(Default::default());
        let call = gateway.handle(request("/fail"));
        let serve = answer(&connection, &mut outbound, |id| {
            vec![
                response_head(id, 200, &[]),
                Frame::error(id, "connect ECONNREFUSED"),
            ]
        });
        let (res, _) = tokio::join!(call, serve);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "connect ECONNREFUSED");
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_mid_stream_aborts_body() {
        let (gateway, connection, mut outbound) = gateway(Default::default());
        let call = gateway.handle(request("/fail"));
        let serve = answer(&connection, &mut outbound, |id| {
            vec![
                response_head(id, 200, &[]),
                Frame::new(FrameKind::ResponseChunk, id, "partial"),
                Frame::error(id, "origin reset"),
            ]
        });
        let (res, _) = tokio::join!(call, serve);
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.into_body().collect().await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn ingress_rules_block_before_relaying() {
        let rules: Ruleset = serde_json::from_str(r#"[{"method": "GET", "path": "/x"}]"#).unwrap();
        let (gateway, _connection, mut outbound) = gateway(GatewayOpts {
            rules: Some(rules),
            ..Default::default()
        });
        let res = gateway.handle(request("/x?q=1")).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "blocked");
        assert_eq!(
            body["reason"],
            "Request does not match any accept rule, blocking HTTP request"
        );
        assert_eq!(body["url"], "/x");
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn ingress_rules_reject_dot_segments() {
        let rules: Ruleset = serde_json::from_str(r#"[{"path": "/api/*"}]"#).unwrap();
        let (gateway, _connection, mut outbound) = gateway(GatewayOpts {
            rules: Some(rules),
            ..Default::default()
        });
        for target in ["/api/../admin", "/api/%2e%2e/admin"] {
            let res = gateway.handle(request(target)).await;
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{target}");
        }
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn unresolved_calls() {
        let registry = Registry::new();
        let gateway = IngressGateway::new(TokenPath::new(registry), Default::default());
        let res = gateway.handle(request("/broker/unknown/x")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let (_tx, rx) = watch::channel(None);
        let gateway = IngressGateway::new(UpstreamConnection::new(rx), Default::default());
        let res = gateway.handle(request("/x")).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    #[traced_test]
    async fn timeout_is_gateway_timeout() {
        let (gateway, _connection, _outbound) = gateway(GatewayOpts {
            exchange_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let res = gateway.handle(request("/slow")).await;
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
