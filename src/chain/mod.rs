//! Blockchain query interface
//!
//! The engine never runs a node. Everything it learns about the chain comes
//! through [`ChainClient`], implemented over Electrum for production use and
//! in memory for tests and local runs.
//!
//! Notifications are at-least-once: an implementation may deliver the same
//! status for a script hash several times, or deliver a stale one.

pub mod electrum;
pub mod memory;

pub use electrum::ElectrumClient;
pub use memory::MemoryChain;

use crate::error::Result;
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

/// An unspent output as reported for a script hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value: u64,
    #[serde(default)]
    pub height: i64,
}

/// A transaction touching a script hash, either funding or spending it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    #[serde(default)]
    pub height: i64,
}

/// Activity on a subscribed script hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNotification {
    pub script_hash: String,
    /// Electrum status hash of the history, `None` when the history is empty
    pub status: Option<String>,
}

pub trait ChainClient: Send + Sync {
    /// Raw transaction bytes, `None` when the indexer does not know the hash.
    fn get_transaction(&self, tx_hash: &str) -> Result<Option<Vec<u8>>>;

    fn get_unspent_outputs(&self, script_hash: &str) -> Result<Vec<UnspentOutput>>;

    fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryEntry>>;

    /// Start receiving notifications for `script_hash`; returns its current status.
    fn subscribe(&self, script_hash: &str) -> Result<Option<String>>;

    fn unsubscribe(&self, script_hash: &str) -> Result<bool>;

    /// Submit a raw transaction, returning its id. Rejections come back as
    /// [`EngineError::BroadcastFailed`](crate::error::EngineError::BroadcastFailed).
    fn broadcast(&self, raw_tx_hex: &str) -> Result<String>;
}

/// Status hash over a history: sha256 of every `tx_hash:height:` joined.
pub fn history_status(history: &[HistoryEntry]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let joined: String = history
        .iter()
        .map(|entry| format!("{}:{}:", entry.tx_hash, entry.height))
        .collect();
    Some(HEXLOWER.encode(&sha256_digest(joined.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_status() {
        assert_eq!(history_status(&[]), None);

        let history = vec![HistoryEntry {
            tx_hash: "ab".to_string(),
            height: 0,
        }];
        let status = history_status(&history).unwrap();
        assert_eq!(status, HEXLOWER.encode(&sha256_digest(b"ab:0:")));

        let mut longer = history.clone();
        longer.push(HistoryEntry {
            tx_hash: "cd".to_string(),
            height: 5,
        });
        assert_ne!(history_status(&longer).unwrap(), status);
    }

    #[test]
    fn test_unspent_output_from_electrum_json() {
        let json = r#"{"tx_hash":"ff","tx_pos":1,"value":5000,"height":812000}"#;
        let utxo: UnspentOutput = serde_json::from_str(json).unwrap();
        assert_eq!(utxo.tx_pos, 1);
        assert_eq!(utxo.value, 5000);
    }
}
