use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no tuners available: {0}")]
    NoTunersAvailable(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("channel is DRM protected: {0}")]
    DrmProtected(String),

    #[error("transcoder did not produce a playlist within {0} seconds")]
    TranscodeStartupTimeout(u64),

    #[error("transcoder failed: {0}")]
    TranscoderFailed(String),

    #[error("cloud authorization expired")]
    AuthExpired,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NoTunersAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Collapse a reqwest failure into the upstream error kinds. Connection
    /// level problems (refused, DNS, socket timeouts before a response) are
    /// `UpstreamUnreachable`; anything that produced an HTTP status is
    /// `UpstreamUnavailable`.
    pub fn from_upstream(context: &str, err: &reqwest::Error) -> ApiError {
        if err.is_connect() || err.is_timeout() {
            ApiError::UpstreamUnreachable(format!("{context}: {err}"))
        } else if let Some(status) = err.status() {
            ApiError::UpstreamUnavailable(format!("{context}: HTTP {status}"))
        } else {
            ApiError::UpstreamUnavailable(format!("{context}: {err}"))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Cache-Control", "no-store")
            .body(Body::from(body))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::InvalidArgument("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Busy("x".into()).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::NoTunersAvailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::TranscodeStartupTimeout(15).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
