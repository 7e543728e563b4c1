use crate::core::ledger::Commitment;
use crate::core::script::script_hash;
use crate::error::{EngineError, Result};
use crate::storage::records::{
    Campaign, Contribution, Fulfillment, NewContribution, Recipient, Revocation, StoredCommitment,
};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;

const CAMPAIGNS_TREE: &str = "campaigns";
const CONTRIBUTIONS_TREE: &str = "contributions";
const COMMITMENTS_TREE: &str = "commitments";
const OUTPOINTS_TREE: &str = "outpoints";
const FULFILLMENTS_TREE: &str = "fulfillments";

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Outpoints are indexed per campaign: one output may back pledges to
/// several campaigns, whichever broadcasts first revokes the others.
fn outpoint_key(campaign_id: u64, tx_hash: &str, index: u32) -> Vec<u8> {
    let mut key = id_key(campaign_id).to_vec();
    key.extend_from_slice(format!("{}:{index}", tx_hash.to_lowercase()).as_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::Database(format!("Corrupt id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

/// Durable campaign, contribution and fulfillment records in sled.
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
    campaigns: Tree,
    contributions: Tree,
    commitments: Tree,
    outpoints: Tree,
    fulfillments: Tree,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RecordStore> {
        let db = sled::open(path.as_ref())
            .map_err(|e| EngineError::Database(format!("Failed to open database: {e}")))?;
        Self::from_db(db)
    }

    /// Store that disappears when dropped.
    pub fn temporary() -> Result<RecordStore> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EngineError::Database(format!("Failed to open database: {e}")))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<RecordStore> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| EngineError::Database(format!("Failed to open {name} tree: {e}")))
        };
        Ok(RecordStore {
            campaigns: open(CAMPAIGNS_TREE)?,
            contributions: open(CONTRIBUTIONS_TREE)?,
            commitments: open(COMMITMENTS_TREE)?,
            outpoints: open(OUTPOINTS_TREE)?,
            fulfillments: open(FULFILLMENTS_TREE)?,
            db,
        })
    }

    fn next_id(&self) -> Result<u64> {
        // sled ids start at zero; keep zero free so it never names a record
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(|e| EngineError::Database(format!("Failed to generate id: {e}")))
    }

    pub fn add_campaign(
        &self,
        title: &str,
        starts_at: i64,
        expires_at: i64,
        recipients: Vec<Recipient>,
    ) -> Result<Campaign> {
        if recipients.is_empty() {
            return Err(EngineError::InvalidAmount(
                "A campaign needs at least one recipient".to_string(),
            ));
        }
        if expires_at <= starts_at {
            return Err(EngineError::Config(format!(
                "Campaign expires at {expires_at}, before it starts at {starts_at}"
            )));
        }

        let mut campaign = Campaign {
            id: 0,
            title: title.to_string(),
            starts_at,
            expires_at,
            recipients,
        };
        // rejects dust, oversize and malformed recipients
        campaign.ledger()?;

        campaign.id = self.next_id()?;
        self.campaigns
            .insert(id_key(campaign.id), serialize(&campaign)?)
            .map_err(|e| EngineError::Database(format!("Failed to store campaign: {e}")))?;
        info!(
            "Created campaign #{} with {} recipients",
            campaign.id,
            campaign.recipients.len()
        );
        Ok(campaign)
    }

    pub fn get_campaign(&self, campaign_id: u64) -> Result<Option<Campaign>> {
        self.campaigns
            .get(id_key(campaign_id))
            .map_err(|e| EngineError::Database(format!("Failed to read campaign: {e}")))?
            .map(|bytes| deserialize(&bytes))
            .transpose()
    }

    pub fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut campaigns = vec![];
        for item in self.campaigns.iter() {
            let (_, value) = item
                .map_err(|e| EngineError::Database(format!("Failed to iterate campaigns: {e}")))?;
            campaigns.push(deserialize(&value)?);
        }
        Ok(campaigns)
    }

    /// Write a contribution and all of its commitments atomically. Fails with
    /// `DuplicateInput` if any outpoint is already held by another commitment
    /// of the same campaign.
    pub fn add_contribution(&self, new: NewContribution) -> Result<Contribution> {
        let contribution_id = self.next_id()?;
        let mut stored = Vec::with_capacity(new.commitments.len());
        for item in &new.commitments {
            stored.push(StoredCommitment {
                id: self.next_id()?,
                contribution_id,
                campaign_id: new.campaign_id,
                commitment: item.commitment.clone(),
                script_hash: script_hash(&item.locking_script),
                locking_script: item.locking_script.clone(),
            });
        }

        let contribution = Contribution {
            id: contribution_id,
            campaign_id: new.campaign_id,
            alias: new.alias,
            comment: new.comment,
            satoshis: stored.iter().map(|c| c.commitment.satoshis).sum(),
            timestamp: new.timestamp,
            commitment_ids: stored.iter().map(|c| c.id).collect(),
            revocation: None,
        };

        let contribution_bytes = serialize(&contribution)?;
        let mut rows = Vec::with_capacity(stored.len());
        for commitment in &stored {
            let tx_hash = HEXLOWER.encode(&commitment.commitment.previous_tx_hash);
            rows.push((
                id_key(commitment.id),
                serialize(commitment)?,
                outpoint_key(
                    new.campaign_id,
                    &tx_hash,
                    commitment.commitment.previous_output_index,
                ),
                tx_hash,
                commitment.commitment.previous_output_index,
            ));
        }

        (&self.contributions, &self.commitments, &self.outpoints)
            .transaction(|(contributions, commitments, outpoints)| {
                for (key, bytes, outpoint, tx_hash, index) in &rows {
                    if outpoints.get(outpoint.as_slice())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            EngineError::DuplicateInput {
                                tx_hash: tx_hash.clone(),
                                index: *index,
                            },
                        ));
                    }
                    commitments.insert(key, bytes.as_slice())?;
                    outpoints.insert(outpoint.as_slice(), key)?;
                }
                contributions.insert(&id_key(contribution_id), contribution_bytes.as_slice())?;
                Ok(())
            })
            .map_err(|e: TransactionError<EngineError>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => {
                    EngineError::Database(format!("Failed to store contribution: {err}"))
                }
            })?;

        debug!(
            "Stored contribution #{} with {} commitments",
            contribution.id,
            contribution.commitment_ids.len()
        );
        Ok(contribution)
    }

    pub fn get_contribution(&self, contribution_id: u64) -> Result<Option<Contribution>> {
        self.contributions
            .get(id_key(contribution_id))
            .map_err(|e| EngineError::Database(format!("Failed to read contribution: {e}")))?
            .map(|bytes| deserialize(&bytes))
            .transpose()
    }

    /// All contributions, revoked ones included, in creation order.
    pub fn list_contributions(&self, campaign_id: Option<u64>) -> Result<Vec<Contribution>> {
        let mut contributions = vec![];
        for item in self.contributions.iter() {
            let (_, value) = item.map_err(|e| {
                EngineError::Database(format!("Failed to iterate contributions: {e}"))
            })?;
            let contribution: Contribution = deserialize(&value)?;
            if campaign_id.map_or(true, |id| contribution.campaign_id == id) {
                contributions.push(contribution);
            }
        }
        Ok(contributions)
    }

    pub fn get_commitment(&self, commitment_id: u64) -> Result<Option<StoredCommitment>> {
        self.commitments
            .get(id_key(commitment_id))
            .map_err(|e| EngineError::Database(format!("Failed to read commitment: {e}")))?
            .map(|bytes| deserialize(&bytes))
            .transpose()
    }

    pub fn commitments_of(&self, contribution: &Contribution) -> Result<Vec<StoredCommitment>> {
        let mut out = Vec::with_capacity(contribution.commitment_ids.len());
        for id in &contribution.commitment_ids {
            let commitment = self.get_commitment(*id)?.ok_or_else(|| {
                EngineError::Database(format!(
                    "Contribution #{} references missing commitment #{id}",
                    contribution.id
                ))
            })?;
            out.push(commitment);
        }
        Ok(out)
    }

    pub fn find_commitment_by_outpoint(
        &self,
        campaign_id: u64,
        tx_hash: &str,
        index: u32,
    ) -> Result<Option<StoredCommitment>> {
        let Some(id) = self
            .outpoints
            .get(outpoint_key(campaign_id, tx_hash, index))
            .map_err(|e| EngineError::Database(format!("Failed to read outpoint index: {e}")))?
        else {
            return Ok(None);
        };
        self.get_commitment(decode_id(&id)?)
    }

    /// Commitments of the campaign's unrevoked contributions.
    pub fn active_commitments(&self, campaign_id: u64) -> Result<Vec<StoredCommitment>> {
        let mut out = vec![];
        for contribution in self.list_contributions(Some(campaign_id))? {
            if !contribution.is_revoked() {
                out.extend(self.commitments_of(&contribution)?);
            }
        }
        Ok(out)
    }

    pub fn active_ledger_commitments(&self, campaign_id: u64) -> Result<Vec<Commitment>> {
        Ok(self
            .active_commitments(campaign_id)?
            .into_iter()
            .map(|stored| stored.commitment)
            .collect())
    }

    /// Tombstone a contribution. Returns `None` when it was already revoked,
    /// so replayed notifications never revoke twice.
    pub fn revoke_contribution(
        &self,
        contribution_id: u64,
        revocation: Revocation,
    ) -> Result<Option<Contribution>> {
        let key = id_key(contribution_id);
        let current = self
            .contributions
            .get(key)
            .map_err(|e| EngineError::Database(format!("Failed to read contribution: {e}")))?
            .ok_or_else(|| {
                EngineError::Database(format!("Unknown contribution #{contribution_id}"))
            })?;

        let mut contribution: Contribution = deserialize(&current)?;
        if contribution.is_revoked() {
            return Ok(None);
        }
        contribution.revocation = Some(revocation);

        let swapped = self
            .contributions
            .compare_and_swap(key, Some(current), Some(serialize(&contribution)?))
            .map_err(|e| EngineError::Database(format!("Failed to revoke contribution: {e}")))?;
        if swapped.is_err() {
            // another writer changed it first; whatever it wrote stands
            return Ok(None);
        }
        self.flush()?;
        Ok(Some(contribution))
    }

    /// Store the fulfillment unless one already exists. Returns whether this
    /// call wrote it. The record is flushed before returning.
    pub fn record_fulfillment(&self, fulfillment: &Fulfillment) -> Result<bool> {
        let swapped = self
            .fulfillments
            .compare_and_swap(
                id_key(fulfillment.campaign_id),
                None as Option<&[u8]>,
                Some(serialize(fulfillment)?),
            )
            .map_err(|e| EngineError::Database(format!("Failed to store fulfillment: {e}")))?;
        self.flush()?;
        Ok(swapped.is_ok())
    }

    pub fn get_fulfillment(&self, campaign_id: u64) -> Result<Option<Fulfillment>> {
        self.fulfillments
            .get(id_key(campaign_id))
            .map_err(|e| EngineError::Database(format!("Failed to read fulfillment: {e}")))?
            .map(|bytes| deserialize(&bytes))
            .transpose()
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| EngineError::Database(format!("Failed to flush database: {e}")))?;
        Ok(())
    }
}
