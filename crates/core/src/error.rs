use std::fmt;
use thiserror::Error;

/// Flat error namespace shared by every component in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionClosed,
    BindFailed,
    AlreadyExists,
    InvalidArgument,
    InternalError,
    SendFailed,
    ConnectionFailed,
    ConnectionTimeout,
    NotInitialized,
    ServerAlreadyRunning,
    ServerNotStarted,
    ClientAlreadyRunning,
    ClientNotStarted,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::BindFailed => "bind_failed",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::SendFailed => "send_failed",
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::ConnectionTimeout => "connection_timeout",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::ServerAlreadyRunning => "server_already_running",
            ErrorCode::ServerNotStarted => "server_not_started",
            ErrorCode::ClientAlreadyRunning => "client_already_running",
            ErrorCode::ClientNotStarted => "client_not_started",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record carried by every fallible operation.
///
/// `origin` is the source site that produced the error and `context` is a
/// free-form string (typically the component id or the peer address).
/// The message is never empty.
#[derive(Debug, Clone, Error)]
#[error("[{origin}] {code}: {message}")]
pub struct NetError {
    pub code: ErrorCode,
    pub message: String,
    pub origin: &'static str,
    pub context: String,
}

impl NetError {
    pub fn new(code: ErrorCode, message: impl Into<String>, origin: &'static str) -> Self {
        let message = message.into();
        debug_assert!(!message.is_empty(), "error message must not be empty");
        Self {
            code,
            message,
            origin,
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn invalid_argument(message: impl Into<String>, origin: &'static str) -> Self {
        Self::new(ErrorCode::InvalidArgument, message, origin)
    }

    pub fn internal(message: impl Into<String>, origin: &'static str) -> Self {
        Self::new(ErrorCode::InternalError, message, origin)
    }
}

pub type NetResult<T> = Result<T, NetError>;
