//! Pledge admission
//!
//! A pledge moves through `Received -> ChainVerified -> SignatureVerified ->
//! RangeAccepted -> Stored`, or stops at the first failed check with the
//! matching [`EngineError`]. The caller serializes admissions; nothing here
//! guards against two pledges being evaluated against the same ledger.

use crate::chain::ChainClient;
use crate::core::fees::FeeCalculator;
use crate::core::ledger::{Commitment, ContractLedger};
use crate::core::script::{self, parse_p2pkh_unlock, ScriptKind};
use crate::core::sighash;
use crate::core::transaction::Transaction;
use crate::engine::pledge::{DecodedInput, Pledge};
use crate::error::{EngineError, Result};
use crate::storage::{Campaign, Contribution, NewCommitment, NewContribution, RecordStore};
use crate::utils::hash160;
use log::{debug, info};

/// Outcome of a pledge that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(Contribution),
    /// The same inputs were admitted before; nothing new was stored
    Duplicate(Contribution),
}

/// A pledge input after the indexer confirmed the output it spends.
struct VerifiedInput {
    input: DecodedInput,
    value: u64,
    locking_script: Vec<u8>,
}

pub struct AdmissionController<'a> {
    store: &'a RecordStore,
    chain: &'a dyn ChainClient,
}

impl<'a> AdmissionController<'a> {
    pub fn new(store: &'a RecordStore, chain: &'a dyn ChainClient) -> Self {
        Self { store, chain }
    }

    pub fn admit(&self, campaign_id: u64, pledge: &Pledge, now: i64) -> Result<Admission> {
        let result = self.evaluate(campaign_id, pledge, now);
        if let Err(e) = &result {
            info!("Rejected pledge for campaign #{campaign_id}: {e}");
        }
        result
    }

    fn evaluate(&self, campaign_id: u64, pledge: &Pledge, now: i64) -> Result<Admission> {
        debug!("Pledge for campaign #{campaign_id}: Received");
        let campaign = self.open_campaign(campaign_id, now)?;

        let declared = pledge.declared_amount()?;
        let inputs = pledge.decode_inputs()?;
        if let Some(existing) = self.previously_admitted(campaign_id, &inputs)? {
            info!(
                "Pledge repeats contribution #{} of campaign #{campaign_id}",
                existing.id
            );
            return Ok(Admission::Duplicate(existing));
        }

        let mut ledger = campaign.ledger()?;
        for commitment in self.store.active_ledger_commitments(campaign_id)? {
            ledger.add_commitment(commitment);
        }
        let miner_fee = ledger.miner_fee();
        debug!(
            "Campaign #{campaign_id} holds {} of {} satoshis, miner fee {miner_fee}",
            ledger.total_committed_value(),
            ledger.total_output_value()
        );

        let verified = inputs
            .into_iter()
            .map(|input| self.verify_on_chain(input))
            .collect::<Result<Vec<_>>>()?;
        debug!("Pledge for campaign #{campaign_id}: ChainVerified");

        let actual = verified
            .iter()
            .try_fold(0u64, |sum, v| sum.checked_add(v.value))
            .ok_or_else(|| EngineError::InvalidAmount("pledge total overflows".to_string()))?;
        if actual != declared {
            return Err(EngineError::IntentMismatch { declared, actual });
        }

        for (position, input) in verified.iter().enumerate() {
            Self::verify_signature(&ledger, position, input)?;
        }
        debug!("Pledge for campaign #{campaign_id}: SignatureVerified");

        let floor = ledger.minimum_contribution();
        if actual < floor {
            return Err(EngineError::BelowFloor {
                amount: actual,
                floor,
            });
        }
        let excess = FeeCalculator::overcommitment(
            ledger.total_committed_value(),
            actual,
            ledger.total_output_value(),
            miner_fee,
        );
        if excess > 0 {
            return Err(EngineError::Overcommit { excess });
        }
        debug!("Pledge for campaign #{campaign_id}: RangeAccepted");

        let contribution = self.store.add_contribution(NewContribution {
            campaign_id,
            alias: pledge.data.alias.clone(),
            comment: pledge.data.comment.clone(),
            timestamp: now,
            commitments: verified
                .into_iter()
                .map(|v| NewCommitment {
                    commitment: Commitment::new(
                        v.input.tx_hash,
                        v.input.index,
                        v.input.unlock_script,
                        v.value,
                    ),
                    locking_script: v.locking_script,
                })
                .collect(),
        })?;
        debug!("Pledge for campaign #{campaign_id}: Stored");
        info!(
            "Accepted contribution #{} of {} satoshis to campaign #{campaign_id}",
            contribution.id, contribution.satoshis
        );
        Ok(Admission::Accepted(contribution))
    }

    fn open_campaign(&self, campaign_id: u64, now: i64) -> Result<Campaign> {
        let campaign = self
            .store
            .get_campaign(campaign_id)?
            .ok_or(EngineError::UnknownCampaign(campaign_id))?;
        if self.store.get_fulfillment(campaign_id)?.is_some() {
            return Err(EngineError::AlreadyFulfilled(campaign_id));
        }
        if now < campaign.starts_at {
            return Err(EngineError::NotStarted {
                campaign_id,
                starts_at: campaign.starts_at,
            });
        }
        if now > campaign.expires_at {
            return Err(EngineError::Expired {
                campaign_id,
                expires_at: campaign.expires_at,
            });
        }
        Ok(campaign)
    }

    /// The contribution these exact inputs already formed in this campaign,
    /// if any. Inputs that only partly overlap the campaign's stored
    /// commitments are a `DuplicateInput`.
    fn previously_admitted(
        &self,
        campaign_id: u64,
        inputs: &[DecodedInput],
    ) -> Result<Option<Contribution>> {
        let mut found = Vec::with_capacity(inputs.len());
        let mut first_missing = None;
        for input in inputs {
            match self
                .store
                .find_commitment_by_outpoint(campaign_id, &input.tx_hash_hex, input.index)?
            {
                Some(stored) => found.push((input, stored)),
                None => first_missing = first_missing.or(Some(input)),
            }
        }
        let Some((first_input, first)) = found.first() else {
            return Ok(None);
        };
        let duplicate = || EngineError::DuplicateInput {
            tx_hash: first_input.tx_hash_hex.clone(),
            index: first_input.index,
        };

        if first_missing.is_some()
            || found
                .iter()
                .any(|(_, stored)| stored.contribution_id != first.contribution_id)
        {
            return Err(duplicate());
        }

        let contribution = self
            .store
            .get_contribution(first.contribution_id)?
            .ok_or_else(duplicate)?;
        if contribution.is_revoked() || contribution.commitment_ids.len() != inputs.len() {
            return Err(duplicate());
        }
        Ok(Some(contribution))
    }

    fn verify_on_chain(&self, input: DecodedInput) -> Result<VerifiedInput> {
        let not_found = || EngineError::UtxoNotFound {
            tx_hash: input.tx_hash_hex.clone(),
            index: input.index,
        };

        let raw = self
            .chain
            .get_transaction(&input.tx_hash_hex)?
            .ok_or_else(not_found)?;
        let tx = Transaction::decode(&raw).map_err(|e| {
            EngineError::Chain(format!(
                "Indexer returned an undecodable transaction {}: {e}",
                input.tx_hash_hex
            ))
        })?;
        let output = tx.get_output(input.index).ok_or_else(not_found)?;

        let script_hash = script::script_hash(output.get_locking_script());
        let unspent = self.chain.get_unspent_outputs(&script_hash)?;
        if !unspent
            .iter()
            .any(|u| u.tx_hash.eq_ignore_ascii_case(&input.tx_hash_hex) && u.tx_pos == input.index)
        {
            return Err(not_found());
        }

        Ok(VerifiedInput {
            value: output.get_value(),
            locking_script: output.get_locking_script().to_vec(),
            input,
        })
    }

    fn verify_signature(
        ledger: &ContractLedger,
        position: usize,
        verified: &VerifiedInput,
    ) -> Result<()> {
        let ScriptKind::P2PKH(key_hash) = script::classify(&verified.locking_script) else {
            return Err(EngineError::UnsupportedScript(format!(
                "{}:{} is not a pay-to-public-key-hash output",
                verified.input.tx_hash_hex, verified.input.index
            )));
        };

        let unlock = parse_p2pkh_unlock(&verified.input.unlock_script)?;
        if hash160(&unlock.public_key) != key_hash {
            debug!("Input {position} public key does not own the committed output");
            return Err(EngineError::BadSignature { input: position });
        }

        let digest = ledger.signing_digest(
            &verified.input.tx_hash,
            verified.input.index,
            verified.value,
            &verified.locking_script,
        )?;
        if !sighash::verify(&unlock.signature, &unlock.public_key, &digest) {
            return Err(EngineError::BadSignature { input: position });
        }
        Ok(())
    }
}
