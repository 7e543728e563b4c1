//! Pledge submission wire format

use crate::core::monetary::MAX_SAFE_SATOSHIS;
use crate::error::{EngineError, Result};
use crate::utils::decode_hex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PledgeInput {
    /// Display order hex, as block explorers show it
    pub previous_output_transaction_hash: String,
    pub previous_output_index: u32,
    pub unlocking_script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PledgeData {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub comment: String,
    /// Declared satoshis. Kept as a raw JSON number so fractional and
    /// negative values reach validation instead of failing to parse.
    pub amount: serde_json::Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pledge {
    pub inputs: Vec<PledgeInput>,
    pub data: PledgeData,
}

/// A pledge input with its hex fields decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInput {
    pub tx_hash: [u8; 32],
    pub tx_hash_hex: String,
    pub index: u32,
    pub unlock_script: Vec<u8>,
}

impl Pledge {
    pub fn declared_amount(&self) -> Result<u64> {
        let amount = &self.data.amount;
        let satoshis = match amount.as_u64() {
            Some(value) => value,
            None => match amount.as_f64() {
                Some(value) if value >= 0.0 && value.fract() == 0.0 => value as u64,
                _ => {
                    return Err(EngineError::MalformedPledge(format!(
                        "amount {amount} is not a whole number of satoshis"
                    )))
                }
            },
        };
        if satoshis > MAX_SAFE_SATOSHIS {
            return Err(EngineError::MalformedPledge(format!(
                "amount {amount} exceeds {MAX_SAFE_SATOSHIS}"
            )));
        }
        Ok(satoshis)
    }

    /// Decode every input, rejecting an empty list and any outpoint named
    /// twice.
    pub fn decode_inputs(&self) -> Result<Vec<DecodedInput>> {
        if self.inputs.is_empty() {
            return Err(EngineError::MalformedPledge(
                "pledge has no inputs".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut decoded = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let hash_bytes = decode_hex(&input.previous_output_transaction_hash).map_err(|_| {
                EngineError::MalformedPledge(format!(
                    "invalid transaction hash {}",
                    input.previous_output_transaction_hash
                ))
            })?;
            let tx_hash = <[u8; 32]>::try_from(hash_bytes.as_slice()).map_err(|_| {
                EngineError::MalformedPledge(format!(
                    "transaction hash {} is not 32 bytes",
                    input.previous_output_transaction_hash
                ))
            })?;
            let unlock_script = decode_hex(&input.unlocking_script).map_err(|_| {
                EngineError::MalformedPledge("unlocking script is not valid hex".to_string())
            })?;

            let tx_hash_hex = input.previous_output_transaction_hash.to_lowercase();
            if !seen.insert((tx_hash_hex.clone(), input.previous_output_index)) {
                return Err(EngineError::DuplicateInput {
                    tx_hash: tx_hash_hex,
                    index: input.previous_output_index,
                });
            }
            decoded.push(DecodedInput {
                tx_hash,
                tx_hash_hex,
                index: input.previous_output_index,
                unlock_script,
            });
        }
        Ok(decoded)
    }
}
