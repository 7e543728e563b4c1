//! In-memory aggregate of one campaign's contract
//!
//! Outputs are the campaign's recipients and never change. Inputs are the
//! commitments of contributions that have not been revoked; the ledger is
//! rebuilt from the record store for every decision, so revoked commitments
//! are simply never added.

use crate::core::address::Address;
use crate::core::fees::FeeCalculator;
use crate::core::monetary::{
    DUST_THRESHOLD, FINAL_SEQUENCE, MAX_OUTPUT_SATOSHIS, MAX_SAFE_SATOSHIS, MINIMUM_CONTRIBUTION,
    TRANSACTION_LOCKTIME, TRANSACTION_VERSION,
};
use crate::core::sighash;
use crate::core::transaction::{TXInput, TXOutput, Transaction};
use crate::error::{EngineError, Result};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

/// A signed input promised to the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Commitment {
    /// Display order, as contributors submit it
    pub previous_tx_hash: [u8; 32],
    pub previous_output_index: u32,
    pub unlock_script: Vec<u8>,
    pub sequence: u32,
    pub satoshis: u64,
}

impl Commitment {
    pub fn new(
        previous_tx_hash: [u8; 32],
        previous_output_index: u32,
        unlock_script: Vec<u8>,
        satoshis: u64,
    ) -> Commitment {
        Commitment {
            previous_tx_hash,
            previous_output_index,
            unlock_script,
            sequence: FINAL_SEQUENCE,
            satoshis,
        }
    }

    pub fn outpoint(&self) -> String {
        format!(
            "{}:{}",
            HEXLOWER.encode(&self.previous_tx_hash),
            self.previous_output_index
        )
    }

    pub fn to_input(&self) -> TXInput {
        TXInput::new(
            self.previous_tx_hash,
            self.previous_output_index,
            self.unlock_script.clone(),
            self.sequence,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContractLedger {
    outputs: Vec<TXOutput>,
    commitments: Vec<Commitment>,
}

impl ContractLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, satoshis: u64, address: &str) -> Result<()> {
        if satoshis < DUST_THRESHOLD {
            return Err(EngineError::InvalidAmount(format!(
                "{satoshis} is below the dust limit of {DUST_THRESHOLD}"
            )));
        }
        if satoshis > MAX_OUTPUT_SATOSHIS {
            return Err(EngineError::InvalidAmount(format!(
                "{satoshis} is above the maximum output of {MAX_OUTPUT_SATOSHIS}"
            )));
        }
        // every total derived from the outputs stays below the safe ceiling
        let total = self.total_output_value() + satoshis;
        if total > MAX_SAFE_SATOSHIS {
            return Err(EngineError::InvalidAmount(format!(
                "recipients would total {total}, above {MAX_SAFE_SATOSHIS}"
            )));
        }
        let locking_script = Address::parse(address)?.locking_script();
        self.outputs.push(TXOutput::new(satoshis, locking_script));
        Ok(())
    }

    /// Stored as given; admission has already validated it.
    pub fn add_commitment(&mut self, commitment: Commitment) {
        self.commitments.push(commitment);
    }

    pub fn outputs(&self) -> &[TXOutput] {
        &self.outputs
    }

    pub fn commitments(&self) -> &[Commitment] {
        &self.commitments
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    /// Commitments at or below the minimum contribution size.
    pub fn small_commitment_count(&self) -> usize {
        self.commitments
            .iter()
            .filter(|c| c.satoshis <= MINIMUM_CONTRIBUTION)
            .count()
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(TXOutput::get_value).sum()
    }

    pub fn total_committed_value(&self) -> u64 {
        self.commitments.iter().map(|c| c.satoshis).sum()
    }

    pub fn remaining_value(&self) -> u64 {
        self.total_output_value()
            .saturating_sub(self.total_committed_value())
    }

    pub fn is_complete(&self) -> bool {
        !self.outputs.is_empty() && self.remaining_value() == 0
    }

    /// Fee the next admission decision targets.
    pub fn miner_fee(&self) -> u64 {
        FeeCalculator::miner_fee(self.outputs.len(), self.commitments.len())
    }

    /// Outstanding value including the miner fee.
    pub fn remaining_with_fee(&self) -> u64 {
        self.total_output_value()
            .saturating_add(self.miner_fee())
            .saturating_sub(self.total_committed_value())
    }

    pub fn minimum_contribution(&self) -> u64 {
        FeeCalculator::minimum_contribution(
            self.remaining_with_fee(),
            self.small_commitment_count(),
            self.commitment_count(),
        )
    }

    pub fn signing_digest(
        &self,
        previous_tx_hash: &[u8; 32],
        previous_output_index: u32,
        previous_output_value: u64,
        previous_locking_script: &[u8],
    ) -> Result<[u8; 32]> {
        sighash::build_signing_digest(
            previous_tx_hash,
            previous_output_index,
            previous_output_value,
            previous_locking_script,
            &self.outputs,
            FINAL_SEQUENCE,
        )
    }

    pub fn assemble_transaction(&self) -> Result<Transaction> {
        if self.outputs.is_empty() || self.commitments.is_empty() {
            return Err(EngineError::Codec(
                "Contract needs at least one output and one commitment".to_string(),
            ));
        }
        let inputs = self.commitments.iter().map(Commitment::to_input).collect();
        Ok(Transaction::new(
            TRANSACTION_VERSION,
            inputs,
            self.outputs.clone(),
            TRANSACTION_LOCKTIME,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPIENT: &str = "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2";

    fn commitment(seed: u8, satoshis: u64) -> Commitment {
        Commitment::new([seed; 32], 0, vec![0x51], satoshis)
    }

    #[test]
    fn test_add_output_bounds() {
        let mut ledger = ContractLedger::new();
        assert!(ledger.add_output(545, RECIPIENT).is_err());
        assert!(ledger.add_output(MAX_OUTPUT_SATOSHIS + 1, RECIPIENT).is_err());
        assert!(matches!(
            ledger.add_output(1_000, "bitcoincash:qqqq"),
            Err(EngineError::InvalidAddress(_))
        ));
        ledger.add_output(546, RECIPIENT).unwrap();
        ledger.add_output(MAX_OUTPUT_SATOSHIS, RECIPIENT).unwrap();
        assert_eq!(ledger.outputs().len(), 2);
    }

    #[test]
    fn test_output_total_stays_below_safe_ceiling() {
        let mut ledger = ContractLedger::new();
        for _ in 0..4 {
            ledger.add_output(MAX_OUTPUT_SATOSHIS, RECIPIENT).unwrap();
        }
        assert!(matches!(
            ledger.add_output(MAX_OUTPUT_SATOSHIS, RECIPIENT),
            Err(EngineError::InvalidAmount(_))
        ));
        assert_eq!(ledger.outputs().len(), 4);
        assert_eq!(ledger.total_output_value(), 4 * MAX_OUTPUT_SATOSHIS);
    }

    #[test]
    fn test_totals_and_remaining() {
        let mut ledger = ContractLedger::new();
        ledger.add_output(500_000_000, RECIPIENT).unwrap();
        assert_eq!(ledger.miner_fee(), 750);
        assert_eq!(ledger.remaining_with_fee(), 500_000_750);
        assert_eq!(ledger.minimum_contribution(), 100_000);

        ledger.add_commitment(commitment(1, 400_000_000));
        assert_eq!(ledger.total_committed_value(), 400_000_000);
        assert_eq!(ledger.remaining_value(), 100_000_000);
        assert_eq!(ledger.miner_fee(), 1342);
        assert!(!ledger.is_complete());

        ledger.add_commitment(commitment(2, 100_001_342));
        assert_eq!(ledger.remaining_value(), 0);
        assert_eq!(ledger.remaining_with_fee(), 0);
        assert!(ledger.is_complete());
    }

    #[test]
    fn test_small_commitments_are_counted() {
        let mut ledger = ContractLedger::new();
        ledger.add_commitment(commitment(1, 100_000));
        ledger.add_commitment(commitment(2, 100_001));
        ledger.add_commitment(commitment(3, 5_000));
        assert_eq!(ledger.small_commitment_count(), 2);
    }

    #[test]
    fn test_assemble_transaction() {
        let mut ledger = ContractLedger::new();
        ledger.add_output(1_000, RECIPIENT).unwrap();
        assert!(ledger.assemble_transaction().is_err());

        ledger.add_commitment(commitment(9, 1_500));
        let tx = ledger.assemble_transaction().unwrap();
        assert_eq!(tx.get_version(), 2);
        assert_eq!(tx.get_locktime(), 0);
        assert_eq!(tx.get_vin().len(), 1);
        assert_eq!(tx.get_vin()[0].get_sequence(), FINAL_SEQUENCE);
        assert_eq!(tx.get_vout()[0].get_value(), 1_000);

        let decoded = Transaction::decode(&tx.encode().unwrap()).unwrap();
        assert_eq!(decoded, tx);
    }
}
