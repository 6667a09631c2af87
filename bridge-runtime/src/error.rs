use alloy::primitives::{Address, U256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Underlying {underlying} already has a wrapped share token")]
    AlreadyRegistered { underlying: Address },

    #[error("Underlying {underlying} is not registered with the bridge")]
    NotRegistered { underlying: Address },

    #[error("Unsupported asset: {0}")]
    UnsupportedAsset(String),

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: U256, need: U256 },

    #[error("Interaction nonce {0} already used")]
    DuplicateNonce(u64),

    #[error("Unknown interaction nonce {0}")]
    UnknownNonce(u64),

    #[error("Interaction {0} already finalised")]
    AlreadyFinalised(u64),

    #[error("Interaction {0} is not ready to be finalised")]
    AsyncNotReady(u64),

    #[error("Bridge does not support asynchronous interactions")]
    AsyncUnsupported,

    #[error("Slippage exceeded: maximum input {maximum}, required {required}")]
    SlippageExceeded { maximum: U256, required: U256 },

    #[error("External venue failure ({venue}): {message}")]
    ExternalVenueFailure { venue: String, message: String },

    #[error("Accounting invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown bridge id {0}")]
    UnknownBridge(u32),

    #[error("Bridge id {0} is already registered")]
    BridgeIdTaken(u32),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl BridgeError {
    pub(crate) fn venue(venue: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::ExternalVenueFailure {
            venue: venue.into(),
            message: message.into(),
        }
    }

    /// Whether re-submitting the same request (with the same or a fresh nonce)
    /// can succeed later. Registration errors and invariant violations are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::AsyncNotReady(_)
                | BridgeError::ExternalVenueFailure { .. }
                | BridgeError::InsufficientBalance { .. }
                | BridgeError::SlippageExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        BridgeError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::AsyncNotReady(1).is_retryable());
        assert!(BridgeError::venue("pool", "no liquidity").is_retryable());
        assert!(!BridgeError::AlreadyRegistered { underlying: Address::ZERO }.is_retryable());
        assert!(!BridgeError::InvariantViolation("supply drift".into()).is_retryable());
        assert!(!BridgeError::DuplicateNonce(7).is_retryable());
    }

    #[test]
    fn test_display_includes_amounts() {
        let err = BridgeError::InsufficientBalance {
            have: U256::from(5u64),
            need: U256::from(10u64),
        };
        assert_eq!(err.to_string(), "Insufficient balance: have 5, need 10");
    }
}
