use bytes::{BufMut, Bytes, BytesMut};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{self, CONTENT_LENGTH},
};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};

/// Header carrying the broker identity token. Never leaves the broker unless
/// explicitly configured.
pub const BROKER_TOKEN_HEADER: &str = "x-broker-token";

/// Maximum number of headers accepted in one head section.
const MAX_HEADERS: usize = 128;

/// Request line and headers of a brokered request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Origin-form target: raw path plus optional `?query`, never decoded.
    pub target: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Raw path without query.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// Encodes as an HTTP/1.1 request head section.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.target.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        write_headers(&mut buf, &self.headers);
        buf.freeze()
    }

    /// Parses a complete request head section.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(buf).std_context("Invalid request head")?;
        ensure_any!(status.is_complete(), "Incomplete request head");
        let method = req
            .method
            .context("Missing HTTP method")?
            .parse::<Method>()
            .std_context("Invalid HTTP method")?;
        let target = req.path.context("Missing request target")?;
        ensure_any!(
            target.starts_with('/'),
            "Expected origin-form request target"
        );
        Ok(Self {
            method,
            target: target.to_string(),
            headers: collect_headers(req.headers)?,
        })
    }
}

/// Status line and headers of a brokered response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase if one was received.
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Encodes as an HTTP/1.1 response head section.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(self.status_line().as_bytes());
        write_headers(&mut buf, &self.headers);
        buf.freeze()
    }

    /// Parses a complete response head section.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        let status = res.parse(buf).std_context("Invalid response head")?;
        ensure_any!(status.is_complete(), "Incomplete response head");
        let code = res.code.context("Missing response status code")?;
        let status = StatusCode::from_u16(code).std_context("Invalid response status code")?;
        Ok(Self {
            status,
            reason: res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned),
            headers: collect_headers(res.headers)?,
        })
    }
}

fn write_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).std_context("Invalid header name")?;
        let value = HeaderValue::from_bytes(h.value).std_context("Invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Removes hop-by-hop headers per RFC 9110 section 7.6.1, including any header
/// named by `Connection`.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Removes headers reserved for broker-internal use.
pub fn strip_internal_headers(headers: &mut HeaderMap) {
    headers.remove(BROKER_TOKEN_HEADER);
}
