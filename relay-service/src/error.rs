//! Error types and transport conversions

use thiserror::Error;

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the framework
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Missing, malformed, or invalid credentials on the ingress path
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// Token verification error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// JWK exponent does not fit the platform integer type
    #[error("JWK exponent too large")]
    ExponentTooLarge,

    /// Publish or receive attempted before the endpoint was initialized
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// Unknown publisher/subscriber reference
    #[error("{0}")]
    NotFound(String),

    /// Invalid registration input (empty reference, bad DSN)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Broker driver failure (send, receive, or shutdown)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Handler (user code) failure while processing a delivery
    #[error("Handler error: {0}")]
    Handler(String),

    /// Unrecoverable failure escalated through the worker pool stop channel
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Cooperative cancellation observed on the caller's context
    #[error("operation cancelled")]
    Cancelled,

    /// Worker pool could not accept the job
    #[error("Worker pool busy: {0}")]
    PoolBusy(String),

    /// Payload encode/decode failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Outbound HTTP failure (JWKS fetch, OAuth2 registration)
    #[error("HTTP client error: {0}")]
    HttpClient(Box<reqwest::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error is a cooperative-cancellation signal rather than a
    /// genuine failure. Dispatch loops skip recovery for these.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Construct the manager's unknown-publisher error for `reference`.
    pub(crate) fn publisher_not_found(reference: &str) -> Self {
        Error::NotFound(format!("publisher {reference} not found"))
    }

    /// Construct the manager's unknown-subscriber error for `reference`.
    pub(crate) fn subscriber_not_found(reference: &str) -> Self {
        Error::NotFound(format!("subscriber {reference} not found"))
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpClient(Box::new(err))
    }
}

/// Error response body used by the HTTP conversion
#[cfg(feature = "http")]
#[derive(Debug)]
pub struct ErrorBody {
    /// HTTP status code
    pub status: http::StatusCode,
    /// Plain-text message
    pub message: String,
}

#[cfg(feature = "http")]
impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(feature = "http")]
impl Error {
    /// Map the error to an HTTP status code and plain-text body.
    ///
    /// Authentication failures surface exactly as the ingress middleware
    /// produced them; everything else collapses to a server-side status.
    pub fn http_body(&self) -> ErrorBody {
        use http::StatusCode;

        let (status, message) = match self {
            Error::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Cancelled => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };

        ErrorBody { status, message }
    }
}

#[cfg(feature = "http")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let body = self.http_body();
        (body.status, body.message).into_response()
    }
}

#[cfg(feature = "grpc")]
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthenticated(msg) => tonic::Status::unauthenticated(msg),
            Error::Jwt(e) => tonic::Status::unauthenticated(e.to_string()),
            Error::NotFound(msg) => tonic::Status::not_found(msg),
            Error::Validation(msg) => tonic::Status::invalid_argument(msg),
            Error::Cancelled => tonic::Status::cancelled("operation cancelled"),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_messages() {
        let err = Error::publisher_not_found("random");
        assert_eq!(err.to_string(), "publisher random not found");

        let err = Error::subscriber_not_found("random");
        assert_eq!(err.to_string(), "subscriber random not found");
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::Driver("closed".into()).is_cancellation());
        assert!(!Error::PoolBusy("full".into()).is_cancellation());
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_body_for_auth_failure() {
        let body = Error::Unauthenticated("token expired".into()).http_body();
        assert_eq!(body.status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(body.message, "token expired");
    }

    #[cfg(feature = "grpc")]
    #[test]
    fn test_status_conversion_preserves_message() {
        let status = tonic::Status::from(Error::Unauthenticated("bad signature".into()));
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
        assert_eq!(status.message(), "bad signature");
    }
}
