use pace_limit::LimiterError;

/// Errors produced by the Tower Pace middleware stack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PaceError {
    /// The request did not get a permit and a response within the allowed time.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for a permit")]
    Timeout,

    /// The limiter gating the service has been stopped.
    ///
    /// No further permits will be issued. When the `axum` feature is enabled,
    /// this converts to `503 Service Unavailable`.
    #[error("Rate limiter has stopped")]
    Stopped,

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<LimiterError> for PaceError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::Stopped => Self::Stopped,
            other => Self::Inner(other.to_string()),
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for PaceError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::response::IntoResponse;

        let status = match self {
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
