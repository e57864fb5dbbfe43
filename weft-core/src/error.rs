use std::collections::BTreeMap;

/// Convenience alias used throughout the toolkit.
pub type Result<T> = std::result::Result<T, Error>;

/// The shared error taxonomy.
///
/// Every failure that crosses a component boundary is expressed as one of
/// these kinds. Client kinds map to 4xx status codes, server kinds to 5xx,
/// and transport kinds are translated by the client when a call fails before
/// a response is received.
pub enum Error {
    // Client kinds (4xx)
    InvalidArgument(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed(String),
    Conflict(String),
    UnsupportedMedia(String),
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    // Server kinds (5xx)
    Internal(String),
    NotImplemented(String),
    BadGateway(String),
    ServiceUnavailable(String),
    GatewayTimeout(String),

    // Transport kinds, mapped by the client
    Timeout(String),
    ConnectionRefused(String),
    ConnectionReset(String),
    NetworkUnreachable(String),
    Io(String),

    /// Marshal/unmarshal failure in a codec.
    Codec(String),
    /// Invalid or missing configuration.
    Config(String),
}

impl Error {
    /// Stable kind name, used as the `type` field of error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::NotFound(_) => "NotFound",
            Error::MethodNotAllowed(_) => "MethodNotAllowed",
            Error::Conflict(_) => "Conflict",
            Error::UnsupportedMedia(_) => "UnsupportedMedia",
            Error::Validation { .. } => "Validation",
            Error::RateLimited { .. } => "RateLimited",
            Error::Internal(_) => "Internal",
            Error::NotImplemented(_) => "NotImplemented",
            Error::BadGateway(_) => "BadGateway",
            Error::ServiceUnavailable(_) => "ServiceUnavailable",
            Error::GatewayTimeout(_) => "GatewayTimeout",
            Error::Timeout(_) => "Timeout",
            Error::ConnectionRefused(_) => "ConnectionRefused",
            Error::ConnectionReset(_) => "ConnectionReset",
            Error::NetworkUnreachable(_) => "NetworkUnreachable",
            Error::Io(_) => "Io",
            Error::Codec(_) => "Codec",
            Error::Config(_) => "Config",
        }
    }

    /// HTTP status code for this kind. Transport kinds use the client-side
    /// mapping: Timeout is a gateway timeout, connection failures mean the
    /// peer is unavailable, everything else is internal.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::MethodNotAllowed(_) => 405,
            Error::Conflict(_) => 409,
            Error::UnsupportedMedia(_) => 415,
            Error::Validation { .. } => 422,
            Error::RateLimited { .. } => 429,
            Error::Internal(_) => 500,
            Error::NotImplemented(_) => 501,
            Error::BadGateway(_) => 502,
            Error::ServiceUnavailable(_) => 503,
            Error::GatewayTimeout(_) => 504,
            Error::Timeout(_) => 504,
            Error::ConnectionRefused(_) => 503,
            Error::ConnectionReset(_) => 503,
            Error::NetworkUnreachable(_) => 503,
            Error::Io(_) => 500,
            Error::Codec(_) => 500,
            Error::Config(_) => 500,
        }
    }

    /// The human-readable message carried by the error.
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(m)
            | Error::Unauthorized(m)
            | Error::Forbidden(m)
            | Error::NotFound(m)
            | Error::MethodNotAllowed(m)
            | Error::Conflict(m)
            | Error::UnsupportedMedia(m)
            | Error::Internal(m)
            | Error::NotImplemented(m)
            | Error::BadGateway(m)
            | Error::ServiceUnavailable(m)
            | Error::GatewayTimeout(m)
            | Error::Timeout(m)
            | Error::ConnectionRefused(m)
            | Error::ConnectionReset(m)
            | Error::NetworkUnreachable(m)
            | Error::Io(m)
            | Error::Codec(m)
            | Error::Config(m) => m,
            Error::Validation { message, .. } => message,
            Error::RateLimited { message, .. } => message,
        }
    }

    /// Whether a client is allowed to retry after this error.
    ///
    /// Only transport-level failures and server errors are retryable;
    /// client errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionRefused(_)
                | Error::ConnectionReset(_)
                | Error::NetworkUnreachable(_)
                | Error::Internal(_)
                | Error::BadGateway(_)
                | Error::ServiceUnavailable(_)
                | Error::GatewayTimeout(_)
        )
    }

    /// Reconstruct an error from a status code and message, e.g. when a
    /// client receives an error response over the wire.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Error::InvalidArgument(message),
            401 => Error::Unauthorized(message),
            403 => Error::Forbidden(message),
            404 => Error::NotFound(message),
            405 => Error::MethodNotAllowed(message),
            409 => Error::Conflict(message),
            415 => Error::UnsupportedMedia(message),
            422 => Error::Validation {
                message,
                fields: BTreeMap::new(),
            },
            429 => Error::RateLimited {
                message,
                retry_after_secs: 0,
            },
            501 => Error::NotImplemented(message),
            502 => Error::BadGateway(message),
            503 => Error::ServiceUnavailable(message),
            504 => Error::GatewayTimeout(message),
            _ => Error::Internal(message),
        }
    }

    /// JSON body for error responses: `{error, type, request_id?, message?}`
    /// plus `validation_errors` / `retry_after` for the kinds that carry them.
    pub fn to_body(&self, request_id: Option<&str>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.message(),
            "type": self.kind(),
        });
        if let Some(id) = request_id {
            body["request_id"] = serde_json::Value::String(id.to_string());
        }
        match self {
            Error::Validation { fields, .. } => {
                body["validation_errors"] = serde_json::json!(fields);
            }
            Error::RateLimited {
                retry_after_secs, ..
            } => {
                body["retry_after"] = serde_json::json!(retry_after_secs);
            }
            _ => {}
        }
        body
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Error::ConnectionReset(err.to_string())
            }
            ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => {
                Error::NetworkUnreachable(err.to_string())
            }
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(Error::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(Error::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::MethodNotAllowed("x".into()).status_code(), 405);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        assert_eq!(Error::UnsupportedMedia("x".into()).status_code(), 415);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
        assert_eq!(Error::NotImplemented("x".into()).status_code(), 501);
        assert_eq!(Error::BadGateway("x".into()).status_code(), 502);
        assert_eq!(Error::ServiceUnavailable("x".into()).status_code(), 503);
        assert_eq!(Error::GatewayTimeout("x".into()).status_code(), 504);
    }

    #[test]
    fn transport_kinds_map_to_client_statuses() {
        assert_eq!(Error::Timeout("t".into()).status_code(), 504);
        assert_eq!(Error::ConnectionRefused("c".into()).status_code(), 503);
        assert_eq!(Error::ConnectionReset("c".into()).status_code(), 503);
        assert_eq!(Error::NetworkUnreachable("n".into()).status_code(), 503);
        assert_eq!(Error::Io("i".into()).status_code(), 500);
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Timeout("t".into()).is_retryable());
        assert!(Error::ConnectionRefused("c".into()).is_retryable());
        assert!(Error::ServiceUnavailable("s".into()).is_retryable());
        assert!(Error::Internal("i".into()).is_retryable());
        assert!(!Error::InvalidArgument("b".into()).is_retryable());
        assert!(!Error::NotFound("n".into()).is_retryable());
        assert!(!Error::Unauthorized("u".into()).is_retryable());
    }

    #[test]
    fn body_shape() {
        let err = Error::NotFound("Method not found: /bye".into());
        let body = err.to_body(None);
        assert_eq!(body["error"], "Method not found: /bye");
        assert_eq!(body["type"], "NotFound");
        assert!(body.get("request_id").is_none());

        let body = err.to_body(Some("req-1"));
        assert_eq!(body["request_id"], "req-1");
    }

    #[test]
    fn validation_body_carries_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "must not be empty".to_string());
        let err = Error::Validation {
            message: "validation failed".into(),
            fields,
        };
        assert_eq!(err.status_code(), 422);
        let body = err.to_body(None);
        assert_eq!(body["validation_errors"]["name"], "must not be empty");
    }

    #[test]
    fn rate_limited_body_carries_retry_after() {
        let err = Error::RateLimited {
            message: "too many requests".into(),
            retry_after_secs: 30,
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_body(None)["retry_after"], 30);
    }

    #[test]
    fn io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(Error::from(refused).status_code(), 503);
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(Error::from(timeout).kind(), "Timeout");
    }

    #[test]
    fn from_status_round_trip() {
        let err = Error::from_status(404, "gone");
        assert_eq!(err.kind(), "NotFound");
        assert_eq!(err.message(), "gone");
        assert_eq!(Error::from_status(418, "odd").kind(), "Internal");
    }
}
