//! The assurance engine
//!
//! [`Engine`] ties admission, revocation and fulfillment to one record store
//! and one chain client. Two locks order the work:
//!
//! - `submissions` admits one pledge at a time across all campaigns, so two
//!   pledges can never both pass the range checks against the same total.
//! - the per-campaign settlement lock makes fulfillment and revocation
//!   writes exclusive, so the contract's own spend is never mistaken for a
//!   contributor withdrawing.
//!
//! Locks are always taken in that order. Notification handling never takes
//! the submission lock.

pub mod admission;
pub mod events;
pub mod fulfillment;
pub mod monitor;
pub mod pledge;

pub use admission::{Admission, AdmissionController};
pub use events::{ContributionView, EventFeed, FeedEvent};
pub use fulfillment::FulfillmentOrchestrator;
pub use monitor::RevocationMonitor;
pub use pledge::{Pledge, PledgeData, PledgeInput};

use crate::chain::{ChainClient, ChainNotification, HistoryEntry};
use crate::core::address::Network;
use crate::core::transaction::Transaction;
use crate::error::{EngineError, Result};
use crate::storage::{Contribution, Fulfillment, RecordStore, Revocation, StoredCommitment};
use crate::utils::current_timestamp;
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// Answer to a pledge submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub contribution_id: u64,
    pub satoshis: u64,
    /// The inputs had been admitted before
    pub duplicate: bool,
    /// Transaction hash once the campaign is fulfilled
    pub fulfillment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStatus {
    pub campaign_id: u64,
    pub title: String,
    pub starts_at: i64,
    pub expires_at: i64,
    pub requested_satoshis: u64,
    pub committed_satoshis: u64,
    pub remaining_satoshis: u64,
    pub miner_fee: u64,
    pub minimum_contribution: u64,
    pub contribution_count: usize,
    pub fulfillment: Option<Fulfillment>,
}

/// What [`Engine::resume`] found on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub subscriptions: usize,
    pub revocations: usize,
    pub fulfillments: usize,
}

/// One lock per campaign, created on first use.
#[derive(Default)]
pub struct SettlementLocks {
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl SettlementLocks {
    pub fn for_campaign(&self, campaign_id: u64) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire settlement table: {e}")))?;
        Ok(Arc::clone(locks.entry(campaign_id).or_default()))
    }
}

pub struct Engine {
    store: RecordStore,
    chain: Arc<dyn ChainClient>,
    network: Network,
    monitor: RevocationMonitor,
    feed: EventFeed,
    submissions: Mutex<()>,
    settlement: SettlementLocks,
}

impl Engine {
    pub fn new(store: RecordStore, chain: Arc<dyn ChainClient>, network: Network) -> Engine {
        Engine {
            store,
            chain,
            network,
            monitor: RevocationMonitor::new(),
            feed: EventFeed::new(),
            submissions: Mutex::new(()),
            settlement: SettlementLocks::default(),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn monitor(&self) -> &RevocationMonitor {
        &self.monitor
    }

    pub fn submit_pledge(&self, campaign_id: u64, pledge: &Pledge) -> Result<Receipt> {
        let _submission = self
            .submissions
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire submission lock: {e}")))?;
        let now = current_timestamp()?;

        let admission =
            AdmissionController::new(&self.store, self.chain.as_ref()).admit(campaign_id, pledge, now)?;
        let contribution = match admission {
            Admission::Duplicate(contribution) => {
                return Ok(Receipt {
                    contribution_id: contribution.id,
                    satoshis: contribution.satoshis,
                    duplicate: true,
                    fulfillment: self.fulfillment_hash(campaign_id)?,
                })
            }
            Admission::Accepted(contribution) => contribution,
        };

        for commitment in self.store.commitments_of(&contribution)? {
            // resume() subscribes anything missed here
            if let Err(e) =
                self.monitor
                    .watch(self.chain.as_ref(), &commitment.script_hash, commitment.id)
            {
                warn!("Failed to watch commitment #{}: {e}", commitment.id);
            }
        }
        self.feed
            .publish(FeedEvent::Contribution(ContributionView::from(&contribution)))?;

        if let Err(e) = self.settle(campaign_id, now) {
            error!("Fulfillment of campaign #{campaign_id} failed: {e}");
        }

        Ok(Receipt {
            contribution_id: contribution.id,
            satoshis: contribution.satoshis,
            duplicate: false,
            fulfillment: self.fulfillment_hash(campaign_id)?,
        })
    }

    /// Try the fulfillment broadcast again, e.g. after `BroadcastFailed`.
    pub fn retry_fulfillment(&self, campaign_id: u64) -> Result<Option<Fulfillment>> {
        let _submission = self
            .submissions
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire submission lock: {e}")))?;
        if self.store.get_campaign(campaign_id)?.is_none() {
            return Err(EngineError::UnknownCampaign(campaign_id));
        }
        self.settle(campaign_id, current_timestamp()?)
    }

    fn settle(&self, campaign_id: u64, now: i64) -> Result<Option<Fulfillment>> {
        let lock = self.settlement.for_campaign(campaign_id)?;
        let _settlement = lock
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire settlement lock: {e}")))?;

        let Some(fulfillment) =
            FulfillmentOrchestrator::new(&self.store, self.chain.as_ref()).fulfill(campaign_id, now)?
        else {
            return Ok(None);
        };

        // watches stay until each input is seen spent by this transaction
        self.feed.publish(FeedEvent::Fulfillment(fulfillment.clone()))?;
        Ok(Some(fulfillment))
    }

    fn fulfillment_hash(&self, campaign_id: u64) -> Result<Option<String>> {
        Ok(self
            .store
            .get_fulfillment(campaign_id)?
            .map(|fulfillment| fulfillment.transaction_hash))
    }

    pub fn handle_notification(&self, notification: &ChainNotification) -> Result<()> {
        let status = notification.status.as_deref();
        if self.monitor.pending(&notification.script_hash, status)?.is_none() {
            debug!(
                "Nothing to do for {} at status {status:?}",
                notification.script_hash
            );
            return Ok(());
        }
        self.inspect_script_hash(&notification.script_hash)?;
        self.monitor
            .mark_handled(&notification.script_hash, notification.status.clone())
    }

    /// Revoke every watched commitment under `script_hash` whose output is
    /// no longer unspent. Returns how many contributions were revoked.
    pub fn inspect_script_hash(&self, script_hash: &str) -> Result<usize> {
        let commitment_ids = self.monitor.commitments(script_hash)?;
        if commitment_ids.is_empty() {
            return Ok(0);
        }

        let unspent = self.chain.get_unspent_outputs(script_hash)?;
        let mut history = None;
        let mut revoked = 0;
        for commitment_id in commitment_ids {
            let Some(commitment) = self.store.get_commitment(commitment_id)? else {
                self.monitor
                    .release(self.chain.as_ref(), script_hash, commitment_id)?;
                continue;
            };
            let tx_hash = HEXLOWER.encode(&commitment.commitment.previous_tx_hash);
            let index = commitment.commitment.previous_output_index;
            if unspent
                .iter()
                .any(|u| u.tx_hash.eq_ignore_ascii_case(&tx_hash) && u.tx_pos == index)
            {
                continue;
            }

            let spender = self.find_spender(script_hash, &commitment, &mut history);
            if self.revoke(&commitment, spender)? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    fn revoke(&self, commitment: &StoredCommitment, spender: Option<String>) -> Result<bool> {
        let lock = self.settlement.for_campaign(commitment.campaign_id)?;
        let _settlement = lock
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire settlement lock: {e}")))?;

        let contribution = self
            .store
            .get_contribution(commitment.contribution_id)?
            .ok_or_else(|| {
                EngineError::Database(format!(
                    "Commitment #{} has no contribution",
                    commitment.id
                ))
            })?;

        if let Some(fulfillment) = self.store.get_fulfillment(commitment.campaign_id)? {
            match spender.as_deref() {
                Some(hash) if hash == fulfillment.transaction_hash => {
                    debug!("{} was spent by the contract", commitment.commitment.outpoint());
                    self.release_contribution(&contribution)?;
                    return Ok(false);
                }
                Some(hash) => warn!(
                    "Contract {} of campaign #{} lost input {} to {hash}",
                    fulfillment.transaction_hash,
                    commitment.campaign_id,
                    commitment.commitment.outpoint()
                ),
                None => {
                    // the next status change tells which transaction it was
                    debug!(
                        "Spender of {} not in the history yet",
                        commitment.commitment.outpoint()
                    );
                    return Ok(false);
                }
            }
        }

        let revocation = Revocation {
            timestamp: current_timestamp()?,
            spending_tx_hash: spender,
        };
        let revoked = self
            .store
            .revoke_contribution(contribution.id, revocation.clone())?;
        self.release_contribution(&contribution)?;
        let Some(revoked) = revoked else {
            return Ok(false);
        };

        info!(
            "Revoked contribution #{} to campaign #{}: {} was spent by {}",
            revoked.id,
            revoked.campaign_id,
            commitment.commitment.outpoint(),
            revocation.spending_tx_hash.as_deref().unwrap_or("an unknown transaction")
        );
        self.feed.publish(FeedEvent::Revocation {
            contribution_id: revoked.id,
            campaign_id: revoked.campaign_id,
            timestamp: revocation.timestamp,
            spending_tx_hash: revocation.spending_tx_hash,
        })?;
        Ok(true)
    }

    fn release_contribution(&self, contribution: &Contribution) -> Result<()> {
        for commitment in self.store.commitments_of(contribution)? {
            self.monitor
                .release(self.chain.as_ref(), &commitment.script_hash, commitment.id)?;
        }
        Ok(())
    }

    /// Hash of the transaction in the script hash's history that spends
    /// the committed outpoint. Lookup failures only cost the hash.
    fn find_spender(
        &self,
        script_hash: &str,
        commitment: &StoredCommitment,
        history: &mut Option<Vec<HistoryEntry>>,
    ) -> Option<String> {
        if history.is_none() {
            match self.chain.get_history(script_hash) {
                Ok(entries) => *history = Some(entries),
                Err(e) => {
                    warn!("Failed to fetch history of {script_hash}: {e}");
                    return None;
                }
            }
        }

        let outpoint = &commitment.commitment;
        for entry in history.iter().flatten().rev() {
            let raw = match self.chain.get_transaction(&entry.tx_hash) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to fetch {}: {e}", entry.tx_hash);
                    continue;
                }
            };
            let Ok(tx) = Transaction::decode(&raw) else {
                continue;
            };
            if tx.get_vin().iter().any(|input| {
                input.spends(&outpoint.previous_tx_hash, outpoint.previous_output_index)
            }) {
                return Some(entry.tx_hash.clone());
            }
        }
        None
    }

    /// Rebuild subscriptions after a restart, catch revocations that
    /// happened while the engine was down and retry pending fulfillments.
    /// Fulfilled campaigns are not watched again; a double spend of their
    /// inputs is only caught while the engine that broadcast them runs.
    pub fn resume(&self) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();
        let mut open = vec![];
        for campaign in self.store.list_campaigns()? {
            if self.store.get_fulfillment(campaign.id)?.is_some() {
                continue;
            }
            for commitment in self.store.active_commitments(campaign.id)? {
                if self
                    .monitor
                    .watch(self.chain.as_ref(), &commitment.script_hash, commitment.id)?
                {
                    report.subscriptions += 1;
                }
            }
            open.push(campaign.id);
        }

        for script_hash in self.monitor.watched_script_hashes()? {
            match self.inspect_script_hash(&script_hash) {
                Ok(revoked) => report.revocations += revoked,
                Err(e) => error!("Failed to inspect {script_hash}: {e}"),
            }
        }

        for campaign_id in open {
            match self.retry_fulfillment(campaign_id) {
                Ok(Some(_)) => report.fulfillments += 1,
                Ok(None) => {}
                Err(e) => error!("Fulfillment of campaign #{campaign_id} failed: {e}"),
            }
        }
        info!(
            "Resumed with {} subscriptions, {} revocations, {} fulfillments",
            report.subscriptions, report.revocations, report.fulfillments
        );
        Ok(report)
    }

    pub fn campaign_status(&self, campaign_id: u64) -> Result<CampaignStatus> {
        campaign_status(&self.store, campaign_id)
    }

    /// Register a feed observer; the snapshot holds every contribution of
    /// the campaign (or of all campaigns), revoked ones included.
    pub fn observe(&self, campaign_id: Option<u64>) -> Result<(Uuid, Receiver<FeedEvent>)> {
        self.feed.subscribe(campaign_id, || {
            Ok(self
                .store
                .list_contributions(campaign_id)?
                .iter()
                .map(ContributionView::from)
                .collect())
        })
    }

    pub fn stop_observing(&self, id: &Uuid) -> Result<bool> {
        self.feed.unsubscribe(id)
    }

    /// Handle chain notifications on a thread each, so one slow script hash
    /// does not hold up the others.
    pub fn spawn_notification_dispatcher(
        engine: Arc<Engine>,
        notifications: Receiver<ChainNotification>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            for notification in notifications {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    if let Err(e) = engine.handle_notification(&notification) {
                        error!(
                            "Failed to handle notification for {}: {e}",
                            notification.script_hash
                        );
                    }
                });
            }
            debug!("Notification channel closed");
        })
    }
}

/// Funding state of a campaign as the record store sees it.
pub fn campaign_status(store: &RecordStore, campaign_id: u64) -> Result<CampaignStatus> {
    let campaign = store
        .get_campaign(campaign_id)?
        .ok_or(EngineError::UnknownCampaign(campaign_id))?;
    let mut ledger = campaign.ledger()?;
    for commitment in store.active_ledger_commitments(campaign_id)? {
        ledger.add_commitment(commitment);
    }
    let contribution_count = store
        .list_contributions(Some(campaign_id))?
        .iter()
        .filter(|c| !c.is_revoked())
        .count();

    Ok(CampaignStatus {
        campaign_id,
        title: campaign.title.clone(),
        starts_at: campaign.starts_at,
        expires_at: campaign.expires_at,
        requested_satoshis: ledger.total_output_value(),
        committed_satoshis: ledger.total_committed_value(),
        remaining_satoshis: ledger.remaining_value(),
        miner_fee: ledger.miner_fee(),
        minimum_contribution: ledger.minimum_contribution(),
        contribution_count,
        fulfillment: store.get_fulfillment(campaign_id)?,
    })
}
