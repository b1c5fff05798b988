//! Error types for modwire.
//!
//! `RpcError` covers everything a caller can observe: descriptor problems,
//! transport failures, unavailable services, call deadlines and errors raised
//! by the remote peer. Remote errors travel as an [`ErrorPayload`] and are
//! rebuilt into a [`RemoteError`] whose [`RemoteErrorKind`] is the closest
//! local match for the peer's error name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for modwire.
#[derive(Debug, Error)]
pub enum RpcError {
    // Descriptor errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unsupported platform: {message}")]
    UnsupportedPlatform { message: String },

    // Transport errors
    #[error("{message}")]
    Connection { message: String },

    #[error("Channel to {server_id} has been closed")]
    ChannelClosed { server_id: String },

    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Call errors
    #[error("Service {module} is not available")]
    ServiceUnavailable { module: String },

    #[error("{module}.{method}() timeout after {} ms", .duration.as_millis())]
    Timeout {
        module: String,
        method: String,
        duration: Duration,
    },

    #[error(transparent)]
    Remote(RemoteError),

    #[error("{message}")]
    Usage { message: String },

    #[error("Subscriber of topic '{topic}' failed: {message}")]
    Subscriber { topic: String, message: String },

    // Wrapped errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for modwire operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::WebSocket {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for RpcError {
    fn from(err: url::ParseError) -> Self {
        RpcError::Configuration {
            message: format!("invalid URL: {}", err),
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

impl RpcError {
    /// The error raised when no instance can serve `module`.
    pub fn unavailable(module: impl Into<String>) -> Self {
        RpcError::ServiceUnavailable {
            module: module.into(),
        }
    }

    /// An error of the given wire name, as module implementations raise them.
    pub fn raise(name: &str, message: impl Into<String>) -> Self {
        RpcError::Remote(RemoteError::new(name, message))
    }

    /// The error a module raises for a method it does not implement.
    pub fn undefined_method(module: &str, method: &str) -> Self {
        RpcError::Remote(RemoteError::new(
            RemoteErrorKind::BadMethodCall.name(),
            format!("Call to undefined method {}::{}()", module, method),
        ))
    }

    /// Name used for this error on the wire.
    pub fn error_name(&self) -> &str {
        match self {
            RpcError::Configuration { .. } => "ConfigurationError",
            RpcError::UnsupportedPlatform { .. } => "UnsupportedPlatformError",
            RpcError::Connection { .. } => "ConnectionError",
            RpcError::ChannelClosed { .. } => "ChannelClosedError",
            RpcError::WebSocket { .. } => "WebSocketError",
            RpcError::Protocol { .. } => "ProtocolError",
            RpcError::ServiceUnavailable { .. } => "ServiceUnavailableError",
            RpcError::Timeout { .. } => "TimeoutError",
            RpcError::Remote(err) => &err.name,
            RpcError::Usage { .. } => "UsageError",
            RpcError::Subscriber { .. } => "SubscriberError",
            RpcError::Io { .. } => "IoError",
            RpcError::Json { .. } => "JsonError",
        }
    }

    /// Numeric code carried in the error payload.
    ///
    /// Follows JSON-RPC conventions:
    /// - -32700: Parse/protocol error
    /// - -32600: Invalid request (configuration, misuse)
    /// - -32603: Internal error
    ///
    /// Custom codes (-32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Service unavailable
    /// - -32002: Call timeout
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Remote(err) => err.code,

            RpcError::Connection { .. }
            | RpcError::ChannelClosed { .. }
            | RpcError::WebSocket { .. }
            | RpcError::Io { .. } => -32000,

            RpcError::ServiceUnavailable { .. } => -32001,

            RpcError::Timeout { .. } => -32002,

            RpcError::Protocol { .. } | RpcError::Json { .. } => -32700,

            RpcError::Configuration { .. }
            | RpcError::UnsupportedPlatform { .. }
            | RpcError::Usage { .. } => -32600,

            RpcError::Subscriber { .. } => -32603,
        }
    }

    /// Serialize this error into the structured payload sent in THROW frames.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            RpcError::Remote(err) => err.to_payload(),
            other => ErrorPayload {
                name: other.error_name().to_string(),
                message: other.to_string(),
                code: other.code(),
                file: None,
                line: None,
                stack: None,
            },
        }
    }

    /// Rebuild an error from a THROW payload received off the wire.
    pub fn from_payload(value: &Value) -> Self {
        RpcError::Remote(RemoteError::from_payload(ErrorPayload::from_value(value)))
    }

    /// Whether this is a (local or remote) service-unavailable error.
    pub fn is_service_unavailable(&self) -> bool {
        match self {
            RpcError::ServiceUnavailable { .. } => true,
            RpcError::Remote(err) => err.kind == RemoteErrorKind::ServiceUnavailable,
            _ => false,
        }
    }
}

/// Structured error as it travels inside a THROW frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    /// Leniently read a payload from any JSON value.
    ///
    /// Objects are read field by field (`code` falls back to `errno`), strings
    /// become a generic error carrying the string as message.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => {
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(RemoteErrorKind::Generic.name())
                    .to_string();
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = map
                    .get("code")
                    .or_else(|| map.get("errno"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);

                Self {
                    name,
                    message,
                    code,
                    file: map.get("file").and_then(Value::as_str).map(String::from),
                    line: map
                        .get("line")
                        .and_then(Value::as_u64)
                        .and_then(|l| u32::try_from(l).ok()),
                    stack: map.get("stack").and_then(Value::as_str).map(String::from),
                }
            }
            Value::String(message) => Self::generic(message.clone()),
            other => Self::generic(format!("Unexpected exception: {}", other)),
        }
    }

    fn generic(message: String) -> Self {
        Self {
            name: RemoteErrorKind::Generic.name().to_string(),
            message,
            code: 0,
            file: None,
            line: None,
            stack: None,
        }
    }

    pub fn to_value(&self) -> Value {
        // Only plain strings and integers inside; serialization can't fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Local error kinds a remote error name can map back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Generic,
    Type,
    Range,
    Reference,
    Syntax,
    Assertion,
    ArgumentCount,
    InvalidArgument,
    OutOfRange,
    OutOfBounds,
    Overflow,
    Underflow,
    Length,
    Logic,
    Domain,
    Runtime,
    UnexpectedValue,
    BadFunctionCall,
    BadMethodCall,
    ServiceUnavailable,
    Timeout,
    Connection,
}

impl RemoteErrorKind {
    /// Map a wire error name to the closest known kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "TypeError" => RemoteErrorKind::Type,
            "RangeError" | "RangeException" => RemoteErrorKind::Range,
            "ReferenceError" => RemoteErrorKind::Reference,
            "SyntaxError" => RemoteErrorKind::Syntax,
            "AssertionError" | "AssertionFailedError" => RemoteErrorKind::Assertion,
            "ArgumentCountError" => RemoteErrorKind::ArgumentCount,
            "InvalidArgumentException" => RemoteErrorKind::InvalidArgument,
            "OutOfRangeException" => RemoteErrorKind::OutOfRange,
            "OutOfBoundsException" => RemoteErrorKind::OutOfBounds,
            "OverflowException" => RemoteErrorKind::Overflow,
            "UnderflowException" => RemoteErrorKind::Underflow,
            "LengthException" => RemoteErrorKind::Length,
            "LogicException" => RemoteErrorKind::Logic,
            "DomainException" => RemoteErrorKind::Domain,
            "RuntimeException" => RemoteErrorKind::Runtime,
            "UnexpectedValueException" => RemoteErrorKind::UnexpectedValue,
            "BadFunctionCallException" => RemoteErrorKind::BadFunctionCall,
            "BadMethodCallException" => RemoteErrorKind::BadMethodCall,
            "ServiceUnavailableError" => RemoteErrorKind::ServiceUnavailable,
            "TimeoutError" => RemoteErrorKind::Timeout,
            "ConnectionError" | "ChannelClosedError" | "WebSocketError" => {
                RemoteErrorKind::Connection
            }
            _ => RemoteErrorKind::Generic,
        }
    }

    /// Canonical wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteErrorKind::Generic => "Error",
            RemoteErrorKind::Type => "TypeError",
            RemoteErrorKind::Range => "RangeError",
            RemoteErrorKind::Reference => "ReferenceError",
            RemoteErrorKind::Syntax => "SyntaxError",
            RemoteErrorKind::Assertion => "AssertionError",
            RemoteErrorKind::ArgumentCount => "ArgumentCountError",
            RemoteErrorKind::InvalidArgument => "InvalidArgumentException",
            RemoteErrorKind::OutOfRange => "OutOfRangeException",
            RemoteErrorKind::OutOfBounds => "OutOfBoundsException",
            RemoteErrorKind::Overflow => "OverflowException",
            RemoteErrorKind::Underflow => "UnderflowException",
            RemoteErrorKind::Length => "LengthException",
            RemoteErrorKind::Logic => "LogicException",
            RemoteErrorKind::Domain => "DomainException",
            RemoteErrorKind::Runtime => "RuntimeException",
            RemoteErrorKind::UnexpectedValue => "UnexpectedValueException",
            RemoteErrorKind::BadFunctionCall => "BadFunctionCallException",
            RemoteErrorKind::BadMethodCall => "BadMethodCallException",
            RemoteErrorKind::ServiceUnavailable => "ServiceUnavailableError",
            RemoteErrorKind::Timeout => "TimeoutError",
            RemoteErrorKind::Connection => "ConnectionError",
        }
    }
}

/// An error raised on the other side of a channel.
///
/// `name` keeps the peer's original error name even when `kind` falls back
/// to [`RemoteErrorKind::Generic`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub name: String,
    pub message: String,
    pub code: i64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::from_name(name),
            name: name.to_string(),
            message: message.into(),
            code: 0,
            file: None,
            line: None,
            stack: None,
        }
    }

    pub fn from_payload(payload: ErrorPayload) -> Self {
        Self {
            kind: RemoteErrorKind::from_name(&payload.name),
            name: payload.name,
            message: payload.message,
            code: payload.code,
            file: payload.file,
            line: payload.line,
            stack: payload.stack,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            name: self.name.clone(),
            message: self.message.clone(),
            code: self.code,
            file: self.file.clone(),
            line: self.line,
            stack: self.stack.clone(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = RpcError::unavailable("App.Services.Detail");
        assert_eq!(err.to_string(), "Service App.Services.Detail is not available");

        let err = RpcError::Timeout {
            module: "App.Services.Detail".into(),
            method: "triggerTimeout".into(),
            duration: Duration::from_millis(1000),
        };
        assert_eq!(
            err.to_string(),
            "App.Services.Detail.triggerTimeout() timeout after 1000 ms"
        );
    }

    #[test]
    fn test_payload_reconstructs_known_kind() {
        let err = RpcError::from_payload(&json!({
            "name": "TypeError",
            "message": "something went wrong",
            "code": 3,
            "file": "detail.rs",
            "line": 42
        }));

        match err {
            RpcError::Remote(remote) => {
                assert_eq!(remote.kind, RemoteErrorKind::Type);
                assert_eq!(remote.message, "something went wrong");
                assert_eq!(remote.code, 3);
                assert_eq!(remote.file.as_deref(), Some("detail.rs"));
                assert_eq!(remote.line, Some(42));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name_defaults_to_generic() {
        let err = RemoteError::from_payload(ErrorPayload::from_value(&json!({
            "name": "FancyCustomError",
            "message": "boom",
            "errno": 7
        })));
        assert_eq!(err.kind, RemoteErrorKind::Generic);
        assert_eq!(err.name, "FancyCustomError");
        assert_eq!(err.code, 7);
    }

    #[test]
    fn test_string_and_scalar_payloads() {
        let payload = ErrorPayload::from_value(&json!("plain failure"));
        assert_eq!(payload.name, "Error");
        assert_eq!(payload.message, "plain failure");

        let payload = ErrorPayload::from_value(&json!(12));
        assert_eq!(payload.message, "Unexpected exception: 12");
    }

    #[test]
    fn test_local_error_to_payload() {
        let payload = RpcError::unavailable("App.Config").to_payload();
        assert_eq!(payload.name, "ServiceUnavailableError");
        assert_eq!(payload.code, -32001);
        assert!(RpcError::from_payload(&payload.to_value()).is_service_unavailable());
    }

    #[test]
    fn test_undefined_method_message() {
        let err = RpcError::undefined_method("App.Config", "missing");
        assert_eq!(err.to_string(), "Call to undefined method App.Config::missing()");
        assert_eq!(err.error_name(), "BadMethodCallException");
    }
}
