//! Error handling for the assurance engine
//!
//! One enum covers both infrastructure failures (database, chain, codec) and
//! the admission outcomes a contributor gets back when a pledge is refused.

use std::fmt;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Database-related errors
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Blockchain indexer communication errors
    Chain(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// A shared lock was poisoned by a panicking thread
    Lock(String),
    /// Wire format violations in raw transactions or scripts
    Codec(String),
    /// Invalid address format
    InvalidAddress(String),
    /// Satoshi amount outside the accepted range
    InvalidAmount(String),

    UnknownCampaign(u64),
    AlreadyFulfilled(u64),
    NotStarted {
        campaign_id: u64,
        starts_at: i64,
    },
    Expired {
        campaign_id: u64,
        expires_at: i64,
    },
    /// The referenced output is unknown to the indexer or already spent
    UtxoNotFound {
        tx_hash: String,
        index: u32,
    },
    /// Sum of the referenced outputs differs from the declared pledge amount
    IntentMismatch {
        declared: u64,
        actual: u64,
    },
    BadSignature {
        input: usize,
    },
    MalformedUnlockScript(String),
    /// The committed output is locked by something other than P2PKH
    UnsupportedScript(String),
    MalformedPledge(String),
    /// An outpoint in the pledge is already held by another contribution
    DuplicateInput {
        tx_hash: String,
        index: u32,
    },
    BelowFloor {
        amount: u64,
        floor: u64,
    },
    Overcommit {
        excess: u64,
    },
    BroadcastFailed(String),
}

impl EngineError {
    /// Stable reason code reported to contributors.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Database(_) => "database",
            EngineError::Crypto(_) => "crypto",
            EngineError::Chain(_) => "chain_unavailable",
            EngineError::Config(_) => "config",
            EngineError::Serialization(_) => "serialization",
            EngineError::Io(_) => "io",
            EngineError::Lock(_) => "lock",
            EngineError::Codec(_) => "codec",
            EngineError::InvalidAddress(_) => "invalid_address",
            EngineError::InvalidAmount(_) => "invalid_amount",
            EngineError::UnknownCampaign(_) => "unknown_campaign",
            EngineError::AlreadyFulfilled(_) => "already_fulfilled",
            EngineError::NotStarted { .. } => "not_started",
            EngineError::Expired { .. } => "expired",
            EngineError::UtxoNotFound { .. } => "utxo_not_found",
            EngineError::IntentMismatch { .. } => "intent_mismatch",
            EngineError::BadSignature { .. } => "bad_signature",
            EngineError::MalformedUnlockScript(_) => "malformed_unlock_script",
            EngineError::UnsupportedScript(_) => "unsupported_script",
            EngineError::MalformedPledge(_) => "malformed_pledge",
            EngineError::DuplicateInput { .. } => "duplicate_input",
            EngineError::BelowFloor { .. } => "below_floor",
            EngineError::Overcommit { .. } => "overcommit",
            EngineError::BroadcastFailed(_) => "broadcast_failed",
        }
    }

    /// Whether resubmitting the same pledge later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UtxoNotFound { .. } | EngineError::Chain(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Database(msg) => write!(f, "Database error: {msg}"),
            EngineError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            EngineError::Chain(msg) => write!(f, "Chain query error: {msg}"),
            EngineError::Config(msg) => write!(f, "Configuration error: {msg}"),
            EngineError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            EngineError::Io(msg) => write!(f, "I/O error: {msg}"),
            EngineError::Lock(msg) => write!(f, "Lock poisoned: {msg}"),
            EngineError::Codec(msg) => write!(f, "Codec error: {msg}"),
            EngineError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            EngineError::InvalidAmount(msg) => write!(f, "Invalid amount: {msg}"),
            EngineError::UnknownCampaign(id) => write!(f, "Unknown campaign #{id}"),
            EngineError::AlreadyFulfilled(id) => {
                write!(f, "Campaign #{id} has already been fulfilled")
            }
            EngineError::NotStarted {
                campaign_id,
                starts_at,
            } => write!(f, "Campaign #{campaign_id} does not start until {starts_at}"),
            EngineError::Expired {
                campaign_id,
                expires_at,
            } => write!(f, "Campaign #{campaign_id} expired at {expires_at}"),
            EngineError::UtxoNotFound { tx_hash, index } => write!(
                f,
                "Output {tx_hash}:{index} was not found, retry after a short delay"
            ),
            EngineError::IntentMismatch { declared, actual } => write!(
                f,
                "Declared amount {declared} does not match committed value {actual}"
            ),
            EngineError::BadSignature { input } => {
                write!(f, "Signature verification failed for input {input}")
            }
            EngineError::MalformedUnlockScript(msg) => {
                write!(f, "Malformed unlocking script: {msg}")
            }
            EngineError::UnsupportedScript(msg) => write!(f, "Unsupported script: {msg}"),
            EngineError::MalformedPledge(msg) => write!(f, "Malformed pledge: {msg}"),
            EngineError::DuplicateInput { tx_hash, index } => {
                write!(f, "Output {tx_hash}:{index} is already committed")
            }
            EngineError::BelowFloor { amount, floor } => {
                write!(f, "Pledge of {amount} is below the minimum of {floor}")
            }
            EngineError::Overcommit { excess } => {
                write!(f, "Pledge exceeds the remaining value by {excess}")
            }
            EngineError::BroadcastFailed(msg) => write!(f, "Broadcast failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(err: bincode::error::EncodeError) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(err: bincode::error::DecodeError) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_outputs_and_chain_errors_are_retryable() {
        let missing = EngineError::UtxoNotFound {
            tx_hash: "ab".to_string(),
            index: 0,
        };
        assert!(missing.is_retryable());
        assert!(EngineError::Chain("timeout".to_string()).is_retryable());
        assert!(!EngineError::BadSignature { input: 0 }.is_retryable());
        assert!(!EngineError::Overcommit { excess: 1 }.is_retryable());
        assert!(!EngineError::AlreadyFulfilled(1).is_retryable());
    }

    #[test]
    fn test_codes_are_snake_case() {
        let err = EngineError::BelowFloor {
            amount: 10,
            floor: 100,
        };
        assert_eq!(err.code(), "below_floor");
        assert_eq!(err.to_string(), "Pledge of 10 is below the minimum of 100");
    }
}
