//! Accept rules deciding which requests may cross the tunnel.
//!
//! A [`Ruleset`] is an ordered list of [`Rule`]s. Evaluation is pure: it never
//! performs I/O and treats malformed input as "no match".

use std::{fmt, sync::Arc};

use bytes::Bytes;
use glob::Pattern;
use http::{HeaderMap, Method, header::CONTENT_TYPE};
use n0_error::{e, stack_error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::parse::RequestHead;

pub(crate) use self::path::PathPattern;

mod path;

/// Errors raised while compiling accept rules.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum FilterError {
    /// A path or value pattern is not a valid glob.
    #[error("invalid pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[error(source, std_err)]
        source: glob::PatternError,
    },
    /// The rule method is not a valid HTTP method token.
    #[error("invalid method {method:?}")]
    InvalidMethod { method: String },
}

impl FilterError {
    fn invalid_pattern(pattern: &str, source: glob::PatternError) -> Self {
        e!(FilterError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
    }
}

/// Both rule lists of an accept file.
///
/// `private` governs requests travelling into the private network, `public`
/// governs requests travelling out of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptConfig {
    #[serde(default)]
    pub private: Ruleset,
    #[serde(default)]
    pub public: Ruleset,
}

/// Ordered, immutable list of rules. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Arc<Vec<Rule>>,
}

impl Ruleset {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Finds the first rule accepting `req`.
    ///
    /// When nothing accepts, the verdict tells apart requests that matched no
    /// rule path from requests that matched a path but failed validation.
    pub fn evaluate(&self, req: &FilterRequest) -> Verdict<'_> {
        let mut path_matched = false;
        for rule in self.rules.iter() {
            if !rule.matches_route(req) {
                continue;
            }
            if rule.validates(req) {
                return Verdict::Allow(rule);
            }
            path_matched = true;
        }
        if path_matched {
            Verdict::Block(BlockKind::ValidationFailed)
        } else {
            Verdict::Block(BlockKind::NoRule)
        }
    }
}

impl Serialize for Ruleset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rules.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ruleset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Rule>::deserialize(deserializer).map(Self::new)
    }
}

/// Rule as written in the accept file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(rename = "//", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "any_method")]
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RuleAuth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid: Vec<ValidationSpec>,
}

fn any_method() -> String {
    "any".to_string()
}

/// Credentials a rule injects into forwarded requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum RuleAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
    Token { token: String },
}

/// One validation entry. Every entry of a rule must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationSpec {
    Query {
        #[serde(rename = "queryParam")]
        query_param: String,
        values: Vec<String>,
    },
    Header {
        header: String,
        values: Vec<String>,
    },
    Body {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        values: Vec<String>,
    },
}

/// A compiled accept rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RuleSpec", into = "RuleSpec")]
pub struct Rule {
    spec: RuleSpec,
    method: Option<Method>,
    path: PathPattern,
    valid: Vec<Validation>,
}

#[derive(Debug, Clone)]
enum Validation {
    Query(String, Vec<Pattern>),
    Header(String, Vec<Pattern>),
    Body(Vec<String>, Vec<Pattern>),
}

impl TryFrom<RuleSpec> for Rule {
    type Error = FilterError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let method = match spec.method.as_str() {
            m if m.eq_ignore_ascii_case("any") || m == "*" => None,
            m => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    e!(FilterError::InvalidMethod {
                        method: m.to_string()
                    })
                })?,
            ),
        };
        let path = PathPattern::parse(&spec.path)?;
        let valid = spec
            .valid
            .iter()
            .map(|entry| match entry {
                ValidationSpec::Query {
                    query_param,
                    values,
                } => Ok(Validation::Query(query_param.clone(), compile(values)?)),
                ValidationSpec::Header { header, values } => Ok(Validation::Header(
                    header.to_ascii_lowercase(),
                    compile(values)?,
                )),
                ValidationSpec::Body {
                    path,
                    value,
                    values,
                } => {
                    let keys = path.split('.').map(ToOwned::to_owned).collect();
                    let all: Vec<String> = value.iter().chain(values).cloned().collect();
                    Ok(Validation::Body(keys, compile(&all)?))
                }
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        Ok(Self {
            spec,
            method,
            path,
            valid,
        })
    }
}

impl From<Rule> for RuleSpec {
    fn from(rule: Rule) -> Self {
        rule.spec
    }
}

fn compile(values: &[String]) -> Result<Vec<Pattern>, FilterError> {
    values
        .iter()
        .map(|v| Pattern::new(v).map_err(|source| FilterError::invalid_pattern(v, source)))
        .collect()
}

fn any_matches(patterns: &[Pattern], value: &str) -> bool {
    patterns.iter().any(|p| p.matches(value))
}

impl Rule {
    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    /// Origin base URL this rule forwards to, if any.
    pub fn origin(&self) -> Option<&str> {
        self.spec.origin.as_deref()
    }

    pub fn auth(&self) -> Option<&RuleAuth> {
        self.spec.auth.as_ref()
    }

    fn matches_route(&self, req: &FilterRequest) -> bool {
        if let Some(method) = &self.method
            && *method != req.method
        {
            return false;
        }
        self.path.matches(&req.path)
    }

    fn validates(&self, req: &FilterRequest) -> bool {
        self.valid.iter().all(|entry| match entry {
            Validation::Query(key, patterns) => req
                .query
                .iter()
                .any(|(k, v)| k == key && any_matches(patterns, v)),
            Validation::Header(name, patterns) => req
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| any_matches(patterns, v)),
            Validation::Body(keys, patterns) => req
                .body
                .as_ref()
                .and_then(|body| lookup(body, keys))
                .and_then(scalar_to_string)
                .is_some_and(|v| any_matches(patterns, &v)),
        })
    }
}

fn lookup<'a>(value: &'a Value, keys: &[String]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The parts of a request the rules look at.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub method: Method,
    /// Raw path without query, exactly as received.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Parsed body, present only for structured content types.
    pub body: Option<Value>,
}

impl FilterRequest {
    pub fn new(head: &RequestHead, body: &Bytes) -> Self {
        let (path, query) = match head.target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (head.target.as_str(), None),
        };
        let query = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let is_json = head
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("json"));
        let body = if is_json {
            serde_json::from_slice(body).ok()
        } else {
            None
        };
        Self {
            method: head.method.clone(),
            path: path.to_string(),
            query,
            headers: head.headers.clone(),
            body,
        }
    }
}

/// Outcome of [`Ruleset::evaluate`].
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'a> {
    Allow(&'a Rule),
    Block(BlockKind),
}

impl Verdict<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// No rule path matched.
    NoRule,
    /// A rule path matched but its validation did not hold.
    ValidationFailed,
}

/// Which side of the tunnel blocked a request. Each side has its own wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSide {
    /// The gateway that received the external HTTP call.
    Ingress,
    /// The pipeline about to call the origin.
    Forwarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReason {
    pub side: BlockSide,
    pub kind: BlockKind,
}

impl BlockReason {
    pub fn new(side: BlockSide, kind: BlockKind) -> Self {
        Self { side, kind }
    }

    pub fn as_str(&self) -> &'static str {
        match (self.side, self.kind) {
            (BlockSide::Ingress, BlockKind::NoRule) => {
                "Request does not match any accept rule, blocking HTTP request"
            }
            (BlockSide::Ingress, BlockKind::ValidationFailed) => {
                "Request matched an accept rule path but failed its validation, blocking HTTP request"
            }
            (BlockSide::Forwarding, BlockKind::NoRule) => {
                "Response does not match any accept rule, blocking websocket request"
            }
            (BlockSide::Forwarding, BlockKind::ValidationFailed) => {
                "Response matched an accept rule path but failed its validation, blocking websocket request"
            }
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of every blocked response.
pub const BLOCKED_STATUS: http::StatusCode = http::StatusCode::UNAUTHORIZED;

/// Body of a blocked response: `{"message":"blocked","reason":..,"url":..}`.
#[derive(Debug, Clone)]
pub struct BlockedBody {
    pub reason: BlockReason,
    pub url: String,
}

impl BlockedBody {
    pub fn new(reason: BlockReason, url: impl Into<String>) -> Self {
        Self {
            reason,
            url: url.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let json = serde_json::json!({
            "message": "blocked",
            "reason": self.reason.as_str(),
            "url": self.url,
        });
        Bytes::from(json.to_string())
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method};

    use super::*;

    fn ruleset(json: &str) -> Ruleset {
        serde_json::from_str(json).unwrap()
    }

    fn request(method: Method, target: &str, body: &str) -> FilterRequest {
        let mut head = RequestHead::new(method, target);
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        FilterRequest::new(&head, &Bytes::copy_from_slice(body.as_bytes()))
    }

    const FILTERED: &str = r#"[
        { "//": "only polite requests", "method": "POST", "path": "/echo-body/filtered",
          "valid": [{ "path": "proxy.me", "value": "please" }] }
    ]"#;

    #[test]
    fn body_validation() {
        let rules = ruleset(FILTERED);
        let ok = request(Method::POST, "/echo-body/filtered", r#"{"proxy":{"me":"please"}}"#);
        assert!(rules.evaluate(&ok).is_allowed());

        let bad = request(Method::POST, "/echo-body/filtered", r#"{"proxy":{"me":"now!"}}"#);
        let Verdict::Block(kind) = rules.evaluate(&bad) else {
            panic!("expected block");
        };
        assert_eq!(kind, BlockKind::ValidationFailed);
        let body = BlockedBody::new(BlockReason::new(BlockSide::Forwarding, kind), &bad.path);
        let parsed: Value = serde_json::from_slice(&body.to_bytes()).unwrap();
        assert_eq!(parsed["message"], "blocked");
        assert_eq!(parsed["url"], "/echo-body/filtered");
        assert_eq!(
            parsed["reason"],
            "Response matched an accept rule path but failed its validation, blocking websocket request"
        );
    }

    #[test]
    fn no_rule_and_method_mismatch() {
        let rules = ruleset(FILTERED);
        let req = request(Method::POST, "/not-allowed", "{}");
        assert!(matches!(
            rules.evaluate(&req),
            Verdict::Block(BlockKind::NoRule)
        ));
        let get = request(Method::GET, "/echo-body/filtered", r#"{"proxy":{"me":"please"}}"#);
        assert!(matches!(
            rules.evaluate(&get),
            Verdict::Block(BlockKind::NoRule)
        ));
    }

    #[test]
    fn non_json_body_fails_body_validation() {
        let rules = ruleset(FILTERED);
        let head = RequestHead::new(Method::POST, "/echo-body/filtered");
        let req = FilterRequest::new(&head, &Bytes::from_static(br#"{"proxy":{"me":"please"}}"#));
        assert!(!rules.evaluate(&req).is_allowed());
    }

    #[test]
    fn query_and_header_validation() {
        let rules = ruleset(
            r#"[
                { "method": "GET", "path": "/echo-query",
                  "valid": [{ "queryParam": "proxyMe", "values": ["please"] }] },
                { "method": "any", "path": "/echo-headers/*",
                  "valid": [{ "header": "accept", "values": ["valid.accept.*"] }] }
            ]"#,
        );
        assert!(
            rules
                .evaluate(&request(Method::GET, "/echo-query?proxyMe=please", ""))
                .is_allowed()
        );
        assert!(
            !rules
                .evaluate(&request(Method::GET, "/echo-query?proxyMe=now", ""))
                .is_allowed()
        );
        assert!(
            !rules
                .evaluate(&request(Method::GET, "/echo-query", ""))
                .is_allowed()
        );

        let mut head = RequestHead::new(Method::GET, "/echo-headers/x");
        head.headers
            .insert("accept", HeaderValue::from_static("valid.accept.header"));
        assert!(
            rules
                .evaluate(&FilterRequest::new(&head, &Bytes::new()))
                .is_allowed()
        );
        head.headers
            .insert("accept", HeaderValue::from_static("invalid.accept.header"));
        assert!(
            !rules
                .evaluate(&FilterRequest::new(&head, &Bytes::new()))
                .is_allowed()
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = ruleset(
            r#"[
                { "method": "GET", "path": "/a/*", "origin": "http://first" },
                { "method": "GET", "path": "/a/b", "origin": "http://second" }
            ]"#,
        );
        let Verdict::Allow(rule) = rules.evaluate(&request(Method::GET, "/a/b", "")) else {
            panic!("expected allow");
        };
        assert_eq!(rule.origin(), Some("http://first"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = ruleset(FILTERED);
        let req = request(Method::POST, "/echo-body/filtered", r#"{"proxy":{"me":"now!"}}"#);
        let a = format!("{:?}", rules.evaluate(&req));
        let b = format!("{:?}", rules.evaluate(&req));
        assert_eq!(a, b);
    }

    #[test]
    fn ruleset_serializes_back_to_spec() {
        let rules = ruleset(FILTERED);
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json[0]["path"], "/echo-body/filtered");
        assert_eq!(json[0]["//"], "only polite requests");
        assert_eq!(json[0]["valid"][0]["value"], "please");
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let res: Result<Ruleset, _> =
            serde_json::from_str(r#"[{ "method": "GET", "path": "/a/[" }]"#);
        assert!(res.is_err());
    }
}
