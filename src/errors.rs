//! Error taxonomy for the session engine.
//!
//! Every error that crosses the wire carries an [`ErrorCode`] and a
//! recoverability flag. Recoverable errors are reported to the client and the
//! session continues; non-recoverable errors additionally move the session to
//! the `error` status and close the connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Authentication or credential resolution failed
    AuthFailed,
    /// The user already has an active session on this connection
    SessionExists,
    /// The requested mode is unknown or its configuration is incomplete
    InvalidMode,
    /// A provider stage failed (retry or fallback)
    ProviderError,
    /// Provider quota exhausted
    QuotaExceeded,
    /// The audio payload could not be decoded
    InvalidAudio,
    /// Unexpected internal failure
    InternalError,
    /// The message could not be parsed or violated protocol limits
    InvalidMessage,
    /// The inbound audio-chunk rate ceiling was exceeded
    RateLimited,
}

impl ErrorCode {
    /// Whether the session survives an error of this kind.
    pub fn recoverable(&self) -> bool {
        match self {
            ErrorCode::AuthFailed => false,
            ErrorCode::SessionExists => true,
            ErrorCode::InvalidMode => true,
            ErrorCode::ProviderError => true,
            ErrorCode::QuotaExceeded => false,
            ErrorCode::InvalidAudio => true,
            ErrorCode::InternalError => false,
            ErrorCode::InvalidMessage => true,
            ErrorCode::RateLimited => true,
        }
    }

    /// Canonical wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::SessionExists => "SESSION_EXISTS",
            ErrorCode::InvalidMode => "INVALID_MODE",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::InvalidAudio => "INVALID_AUDIO",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::RateLimited => "RATE_LIMITED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the session engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credential resolution or provider authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A session is already active where none may be
    #[error("session already active: {0}")]
    SessionExists(String),

    /// Unknown mode or incomplete mode configuration
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// Provider stage failure, scoped to the current turn
    #[error("provider error: {0}")]
    Provider(String),

    /// Provider quota exhausted
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Audio payload rejected
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Malformed or oversized protocol message
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Audio-chunk rate ceiling exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::AuthFailed(_) => ErrorCode::AuthFailed,
            GatewayError::SessionExists(_) => ErrorCode::SessionExists,
            GatewayError::InvalidMode(_) => ErrorCode::InvalidMode,
            GatewayError::Provider(_) => ErrorCode::ProviderError,
            GatewayError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            GatewayError::InvalidAudio(_) => ErrorCode::InvalidAudio,
            GatewayError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            GatewayError::RateLimited(_) => ErrorCode::RateLimited,
            GatewayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the session survives this error.
    pub fn recoverable(&self) -> bool {
        self.code().recoverable()
    }
}

/// Result alias used across the engine.
pub type GatewayResult<T> = Result<T, GatewayError>;
