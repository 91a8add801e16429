//! HTTP error types.

use thiserror::Error;

/// The raw response an [`HttpError`] was built from.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl ErrorResponse {
    /// Best-effort view of the body as text.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Errors produced by the REST client.
///
/// Status-mapped variants carry the raw [`ErrorResponse`]; severity is
/// recovered with [`HttpError::is_client_error`] / [`HttpError::is_server_error`]
/// rather than a subtype hierarchy.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("bad request")]
    BadRequest(ErrorResponse),

    #[error("unauthorized: invalid token")]
    Unauthorized(ErrorResponse),

    #[error("forbidden: missing access")]
    Forbidden(ErrorResponse),

    #[error("not found")]
    NotFound(ErrorResponse),

    #[error("method not allowed")]
    MethodNotAllowed(ErrorResponse),

    #[error("unprocessable entity")]
    UnprocessableEntity(ErrorResponse),

    /// Every attempt of the request was answered with a 429.
    #[error("rate limit exhausted after retries")]
    TooManyRequests(ErrorResponse),

    #[error("internal server error")]
    ServerError(ErrorResponse),

    #[error("bad gateway")]
    BadGateway(ErrorResponse),

    #[error("service unavailable")]
    ServiceUnavailable(ErrorResponse),

    #[error("gateway timeout")]
    GatewayTimeout(ErrorResponse),

    /// Any other non-success status.
    #[error("http error {}", .0.status)]
    Response(ErrorResponse),

    /// Connection-level failure before a status was read.
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HttpError {
    /// Map a response status onto its error kind.
    pub fn from_response(status: u16, body: Vec<u8>) -> Self {
        let response = ErrorResponse { status, body };
        match status {
            400 => Self::BadRequest(response),
            401 => Self::Unauthorized(response),
            403 => Self::Forbidden(response),
            404 => Self::NotFound(response),
            405 => Self::MethodNotAllowed(response),
            422 => Self::UnprocessableEntity(response),
            429 => Self::TooManyRequests(response),
            500 => Self::ServerError(response),
            502 => Self::BadGateway(response),
            503 => Self::ServiceUnavailable(response),
            504 => Self::GatewayTimeout(response),
            _ => Self::Response(response),
        }
    }

    /// The raw response this error carries, if it was built from one.
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Self::BadRequest(r)
            | Self::Unauthorized(r)
            | Self::Forbidden(r)
            | Self::NotFound(r)
            | Self::MethodNotAllowed(r)
            | Self::UnprocessableEntity(r)
            | Self::TooManyRequests(r)
            | Self::ServerError(r)
            | Self::BadGateway(r)
            | Self::ServiceUnavailable(r)
            | Self::GatewayTimeout(r)
            | Self::Response(r) => Some(r),
            Self::Transport(_) | Self::Json(_) | Self::InvalidHeaderValue(_) | Self::Internal(_) => {
                None
            }
        }
    }

    /// The HTTP status this error was built from, if any.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    /// Whether this is a caller-side (4xx) failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    /// Whether this is a server-side (5xx) failure.
    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(status) if status >= 500)
    }
}
