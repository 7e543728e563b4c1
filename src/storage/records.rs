//! Records persisted by the store and pushed to observers
//!
//! Contributions are never deleted. A revocation is written into the record
//! itself so observers that reconnect see the same history.

use crate::core::ledger::{Commitment, ContractLedger};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Recipient {
    pub name: String,
    pub address: String,
    pub satoshis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Campaign {
    pub id: u64,
    pub title: String,
    pub starts_at: i64,
    pub expires_at: i64,
    pub recipients: Vec<Recipient>,
}

impl Campaign {
    /// Ledger holding only this campaign's recipient outputs.
    pub fn ledger(&self) -> Result<ContractLedger> {
        let mut ledger = ContractLedger::new();
        for recipient in &self.recipients {
            ledger.add_output(recipient.satoshis, &recipient.address)?;
        }
        Ok(ledger)
    }

    pub fn requested_satoshis(&self) -> u64 {
        self.recipients.iter().map(|r| r.satoshis).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Revocation {
    pub timestamp: i64,
    /// Unknown when the indexer had not yet reported the spender
    pub spending_tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Contribution {
    pub id: u64,
    pub campaign_id: u64,
    pub alias: String,
    pub comment: String,
    pub satoshis: u64,
    pub timestamp: i64,
    pub commitment_ids: Vec<u64>,
    pub revocation: Option<Revocation>,
}

impl Contribution {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StoredCommitment {
    pub id: u64,
    pub contribution_id: u64,
    pub campaign_id: u64,
    pub commitment: Commitment,
    /// Script of the output being committed, the key the monitor watches
    pub locking_script: Vec<u8>,
    pub script_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Fulfillment {
    pub campaign_id: u64,
    pub timestamp: i64,
    pub transaction_hash: String,
}

/// Everything admission hands to the store for one accepted pledge.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub campaign_id: u64,
    pub alias: String,
    pub comment: String,
    pub timestamp: i64,
    pub commitments: Vec<NewCommitment>,
}

#[derive(Debug, Clone)]
pub struct NewCommitment {
    pub commitment: Commitment,
    pub locking_script: Vec<u8>,
}
