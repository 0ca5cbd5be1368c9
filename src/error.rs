use http::StatusCode;
use n0_error::{e, stack_error};

/// Terminal failure of one exchange.
///
/// Connection-level failures are delivered to every pending exchange of the
/// connection. None of them are retried.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The connection is not identified, or no longer is.
    #[error("connection unavailable")]
    ConnectionUnavailable,
    /// A newer connection identified with the same token.
    #[error("connection superseded by a newer connection for the same token")]
    ConnectionSuperseded,
    /// The channel closed while the exchange was pending.
    #[error("connection lost")]
    ConnectionLost,
    /// The exchange deadline elapsed.
    #[error("exchange timed out")]
    Timeout,
    /// The far side failed to produce a complete response.
    #[error("upstream error: {message}")]
    Upstream { message: String },
    /// The peer sent frames that do not form a valid exchange.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
}

impl ExchangeError {
    /// Status surfaced to the external caller.
    pub fn response_status(&self) -> StatusCode {
        match self {
            ExchangeError::ConnectionUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::ConnectionSuperseded { .. }
            | ExchangeError::ConnectionLost { .. }
            | ExchangeError::Protocol { .. } => StatusCode::BAD_GATEWAY,
            ExchangeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ExchangeError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body surfaced to the external caller.
    pub fn response_body(&self) -> String {
        match self {
            ExchangeError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Cloneable form of [`ExchangeError`], used to fan one failure out to many
/// pending exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Unavailable,
    Superseded,
    Lost,
    Timeout,
    Upstream(String),
    Protocol(String),
}

impl From<Failure> for ExchangeError {
    #[track_caller]
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Unavailable => e!(ExchangeError::ConnectionUnavailable),
            Failure::Superseded => e!(ExchangeError::ConnectionSuperseded),
            Failure::Lost => e!(ExchangeError::ConnectionLost),
            Failure::Timeout => e!(ExchangeError::Timeout),
            Failure::Upstream(message) => e!(ExchangeError::Upstream { message }),
            Failure::Protocol(reason) => e!(ExchangeError::Protocol { reason }),
        }
    }
}
