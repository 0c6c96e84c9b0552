use axum::{http::StatusCode, response::IntoResponse};
use std::time::Duration;
use thiserror::Error;

/// Relay error types, mapped onto the admission-control taxonomy:
/// admission denials surface as 4xx statuses and are never fatal,
/// per-connection failures stay local to their connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Origin not allowed")]
    OriginDenied,

    #[error("Connection capacity exceeded")]
    CapacityExceeded,

    #[error("Client is temporarily blocked")]
    Blocked { retry_after: Duration },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown deadline exceeded")]
    ShutdownTimeout,

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl RelayError {
    /// Retry-After hint for 429 responses, if the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::Blocked { retry_after } | RelayError::RateLimited { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<&RelayError> for StatusCode {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::OriginDenied => StatusCode::FORBIDDEN,
            RelayError::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Blocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ShutdownTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RelayError> for StatusCode {
    fn from(err: RelayError) -> Self {
        From::from(&err)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let status: StatusCode = From::from(&self);
        let retry_after = self.retry_after();
        let body = format!("{}", self);

        let mut response = (status, body).into_response();
        if let Some(retry) = retry_after {
            // Retry-After is whole seconds, rounded up so clients never retry
            // early. A zero hint means there is no meaningful retry horizon
            // (a bucket that never refills), so no header is emitted rather
            // than inviting an immediate retry.
            let secs = retry.as_secs() + u64::from(retry.subsec_nanos() > 0);
            if secs > 0 {
                if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StatusCode::from(&RelayError::OriginDenied), StatusCode::FORBIDDEN);
        assert_eq!(StatusCode::from(&RelayError::CapacityExceeded), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            StatusCode::from(&RelayError::RateLimited { retry_after: Duration::from_secs(1) }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StatusCode::from(&RelayError::InvalidRequest("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = RelayError::RateLimited { retry_after: Duration::from_millis(1500) };
        let response = err.into_response();
        assert_eq!(response.headers().get("Retry-After").unwrap(), "2");
    }

    #[test]
    fn test_zero_retry_after_omits_header() {
        let err = RelayError::RateLimited { retry_after: Duration::ZERO };
        let response = err.into_response();
        assert!(response.headers().get("Retry-After").is_none());
    }
}
