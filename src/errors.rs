/// Canonical error taxonomy shared by both transports
/// Every user-visible failure carries kind, status, code, message and trace
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;

/// Canonical error kinds with their REST status defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    InternalError,
    SessionNotFound,
    SessionExpired,
    // Protocol kinds, raised by the WebSocket dispatcher only
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
}

impl ErrorKind {
    /// Wire name of the kind, as sent in the `error` envelope field
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "INVALID_PARAMETER",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
        }
    }

    /// HTTP status used on the REST transport (and bridged onto WebSocket)
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidParameter => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::InternalError => 500,
            ErrorKind::SessionNotFound => 404,
            ErrorKind::SessionExpired => 400,
            ErrorKind::ParseError => 400,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::MethodNotFound => 404,
            ErrorKind::InvalidParams => 400,
        }
    }

    /// JSON-RPC numeric code used on the WebSocket transport (and bridged
    /// back onto REST errors that originated there)
    pub fn rpc_code(&self) -> i32 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams | ErrorKind::InvalidParameter => -32602,
            _ => -32603,
        }
    }

    /// Default message when a constructor is given none
    fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "Invalid parameter provided",
            ErrorKind::NotFound => "Not found",
            ErrorKind::InternalError => "Internal error occured",
            ErrorKind::SessionNotFound => "Session not found",
            ErrorKind::SessionExpired => "Session has expired",
            ErrorKind::ParseError => "Parse error",
            ErrorKind::InvalidRequest => "Invalid Request",
            ErrorKind::MethodNotFound => "Method not found",
            ErrorKind::InvalidParams => "Invalid params",
        }
    }
}

/// Canonical error carried through both dispatch paths
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .kind.name())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Option<String>,
}

impl ApiError {
    /// Create an error of the given kind, capturing the call stack
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            kind.default_message().to_string()
        } else {
            message
        };

        Self {
            kind,
            message,
            trace: Some(capture_trace()),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method called \"{}\" not found", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn rpc_code(&self) -> i32 {
        self.kind.rpc_code()
    }
}

/// Render the current call stack as a single normalized line
///
/// Frames are trimmed and joined with " > " so the trace survives JSON
/// transport without embedded newlines or indentation.
pub fn capture_trace() -> String {
    normalize_trace(&Backtrace::force_capture().to_string())
}

pub fn normalize_trace(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" > ")
}
