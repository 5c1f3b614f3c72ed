use std::fmt;

/// Error kinds surfaced by internal calls, mapped to an HTTP status at the edge.
#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    NoRouteMatch,
    NoHealthyUpstream,
    BreakerOpen,
    DialFailed(String),
    UpstreamTimeout,
    UpstreamMalformed(String),
    PayloadTooLarge,
    Unauthenticated,
    Unauthorized,
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// The §7 kind → HTTP status mapping.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyUpstream => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DialFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamMalformed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether C10's retry loop should retry this kind of failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::DialFailed(_) | GatewayError::UpstreamTimeout
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoHealthyUpstream => write!(f, "no healthy upstream available"),
            GatewayError::BreakerOpen => write!(f, "circuit breaker open"),
            GatewayError::DialFailed(msg) => write!(f, "dial failed: {}", msg),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamMalformed(msg) => write!(f, "malformed upstream response: {}", msg),
            GatewayError::PayloadTooLarge => write!(f, "payload too large"),
            GatewayError::Unauthenticated => write!(f, "unauthenticated"),
            GatewayError::Unauthorized => write!(f, "unauthorized"),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
