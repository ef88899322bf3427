//! Keyshare errors
//!
//! Every failure maps onto one [`ErrorKind`] so callers (and counterparty
//! chains reading an acknowledgement) can tell a retryable race from a
//! terminal rejection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed command or packet
    Validation,
    /// Untrusted creator or channel/port mismatch
    Authorization,
    /// Unknown identity, request, key or index
    NotFound,
    /// Key-rotation race; poll again later
    Retryable,
    /// The call would break a state invariant
    Invariant,
    /// The backing store failed
    Storage,
}

#[derive(Debug, Error)]
pub enum KeyshareError {
    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------
    #[error("commitments cannot be empty")]
    EmptyCommitments,

    #[error("number of validators must be greater than zero")]
    InvalidValidatorCount,

    #[error("public key cannot be empty")]
    EmptyPublicKey,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("unrecognized packet type: {0}")]
    UnrecognizedPacket(String),

    #[error("invalid encrypted tx: {0}")]
    InvalidEncryptedTx(String),

    #[error("target height {target} must be after current height {current}")]
    TargetHeightNotInFuture { target: u64, current: u64 },

    #[error("target height {target} is beyond the last scheduled key expiry {expiry}")]
    TargetHeightBeyondKeys { target: u64, expiry: u64 },

    #[error("invalid key share: {0}")]
    InvalidKeyShare(String),

    #[error("invalid channel version: got {got}, expected {expected}")]
    InvalidVersion { got: String, expected: String },

    #[error("invalid port: {got}, expected {expected}")]
    InvalidPort { got: String, expected: String },

    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),

    #[error("key expiry {key_expiry} after height {base} overflows")]
    ExpiryOverflow { base: u64, key_expiry: u64 },

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------
    #[error("address {0} is not trusted")]
    NotTrusted(String),

    #[error("unauthorized request")]
    Unauthorized,

    #[error("user cannot close channel")]
    ChannelCloseNotAllowed,

    // ------------------------------------------------------------------
    // Not found
    // ------------------------------------------------------------------
    #[error("request {0} not found")]
    RequestNotFound(String),

    #[error("active public key not found")]
    ActivePubKeyNotFound,

    #[error("pubkey not found")]
    PubkeyNotFound,

    #[error("no public key covers condition {0}")]
    NoEpochForCondition(String),

    // ------------------------------------------------------------------
    // Retryable
    // ------------------------------------------------------------------
    #[error("retry after current queued key becomes active key")]
    RetryAfterActivation,

    // ------------------------------------------------------------------
    // Invariant
    // ------------------------------------------------------------------
    #[error("queued key already exists")]
    QueuedKeyAlreadyExists,

    #[error("no encrypted tx at height {height} index {index}")]
    IndexOutOfRange { height: u64, index: u64 },

    #[error("packet was not sent by this chain")]
    UnexpectedAcknowledgement,

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl KeyshareError {
    pub fn kind(&self) -> ErrorKind {
        use KeyshareError::*;
        match self {
            EmptyCommitments
            | InvalidValidatorCount
            | EmptyPublicKey
            | InvalidPacket(_)
            | UnrecognizedPacket(_)
            | InvalidEncryptedTx(_)
            | TargetHeightNotInFuture { .. }
            | TargetHeightBeyondKeys { .. }
            | InvalidKeyShare(_)
            | InvalidVersion { .. }
            | InvalidPort { .. }
            | InvalidGenesis(_)
            | ExpiryOverflow { .. } => ErrorKind::Validation,
            NotTrusted(_) | Unauthorized | ChannelCloseNotAllowed => ErrorKind::Authorization,
            RequestNotFound(_)
            | ActivePubKeyNotFound
            | PubkeyNotFound
            | NoEpochForCondition(_) => ErrorKind::NotFound,
            RetryAfterActivation => ErrorKind::Retryable,
            QueuedKeyAlreadyExists | IndexOutOfRange { .. } | UnexpectedAcknowledgement => {
                ErrorKind::Invariant
            }
            Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

pub type Result<T, E = KeyshareError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_race_is_the_only_retryable_error() {
        assert!(KeyshareError::RetryAfterActivation.is_retryable());
        assert!(!KeyshareError::PubkeyNotFound.is_retryable());
        assert_eq!(KeyshareError::PubkeyNotFound.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn storage_errors_convert_from_anyhow() {
        let err: KeyshareError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn authorization_kinds() {
        assert_eq!(
            KeyshareError::NotTrusted("mallory".into()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(KeyshareError::Unauthorized.kind(), ErrorKind::Authorization);
    }
}
