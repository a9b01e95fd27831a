/// Errors produced by the Tower Admit middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmitError {
    /// The request was denied by the admission-control policy.
    ///
    /// The duration indicates when the client should retry.
    /// When the `axum` feature is enabled, this converts to `429 Too Many
    /// Requests` with a `Retry-After` header.
    #[error("{message}")]
    RateLimited {
        /// How long to wait before retrying.
        retry_after: std::time::Duration,
        /// Human-readable denial text for the response body.
        message: String,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal
    /// Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        match self {
            Self::RateLimited {
                retry_after,
                message,
            } => {
                let secs = retry_after.as_secs().max(1);
                let val = axum::http::HeaderValue::from(secs);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, message).into_response();
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, val);
                response
            }
            Self::Inner(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}
