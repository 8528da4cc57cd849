use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, caller-visible failure codes.
///
/// The serialized form (`"SESSION_NOT_FOUND"`, `"CLIENT_DISCONNECTED"`, …)
/// is part of the wire contract and appears in the `code` field of every
/// failed [`ApiResponse`](crate::protocol::ApiResponse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    InvalidRequest,
    SessionNotFound,
    SessionInactive,
    SessionFull,
    AlreadyHasActiveSession,
    NotAuthorized,
    NotHost,
    ClientDisconnected,
    KeyNotFound,
    InvalidKey,
    CryptoVerificationFailed,
    TransferNotFound,
    TransferInProgress,
    InvalidTransferState,
    TransferSizeMismatch,
    TransferIncomplete,
    NetworkError,
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionInactive => "SESSION_INACTIVE",
            Self::SessionFull => "SESSION_FULL",
            Self::AlreadyHasActiveSession => "ALREADY_HAS_ACTIVE_SESSION",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::NotHost => "NOT_HOST",
            Self::ClientDisconnected => "CLIENT_DISCONNECTED",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::InvalidKey => "INVALID_KEY",
            Self::CryptoVerificationFailed => "CRYPTO_VERIFICATION_FAILED",
            Self::TransferNotFound => "TRANSFER_NOT_FOUND",
            Self::TransferInProgress => "TRANSFER_IN_PROGRESS",
            Self::InvalidTransferState => "INVALID_TRANSFER_STATE",
            Self::TransferSizeMismatch => "TRANSFER_SIZE_MISMATCH",
            Self::TransferIncomplete => "TRANSFER_INCOMPLETE",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain failure: a code plus a human-readable message.
///
/// Never thrown across the channel boundary; the channel handler turns
/// it into a `{success: false, message, code}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Wraps an unexpected plumbing failure (store, transport, …).
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        )
    }

    pub fn session_inactive(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionInactive,
            format!("session {session_id} is no longer active"),
        )
    }

    pub fn not_authorized(session_id: &str) -> Self {
        Self::new(
            ErrorCode::NotAuthorized,
            format!("caller is not a participant of session {session_id}"),
        )
    }

    pub fn transfer_not_found(transfer_id: &str) -> Self {
        Self::new(
            ErrorCode::TransferNotFound,
            format!("transfer {transfer_id} not found"),
        )
    }
}

/// Convenience alias for results carrying a [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_error_code_when_serialized_then_matches_as_str() {
        for code in [
            ErrorCode::AuthRequired,
            ErrorCode::SessionFull,
            ErrorCode::ClientDisconnected,
            ErrorCode::CryptoVerificationFailed,
            ErrorCode::AlreadyHasActiveSession,
            ErrorCode::InvalidRequest,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn given_relay_error_when_displayed_then_includes_code_and_message() {
        let err = RelayError::session_not_found("S1");
        assert_eq!(err.code, ErrorCode::SessionNotFound);
        assert_eq!(err.to_string(), "SESSION_NOT_FOUND: session S1 not found");
    }
}
