//! Contract completion
//!
//! Callers hold the campaign's settlement lock for the whole of
//! [`FulfillmentOrchestrator::fulfill`], so no revocation can be written
//! between assembling the transaction and recording that it was broadcast.

use crate::chain::ChainClient;
use crate::error::{EngineError, Result};
use crate::storage::{Fulfillment, RecordStore};
use log::{error, info, warn};

pub struct FulfillmentOrchestrator<'a> {
    store: &'a RecordStore,
    chain: &'a dyn ChainClient,
}

impl<'a> FulfillmentOrchestrator<'a> {
    pub fn new(store: &'a RecordStore, chain: &'a dyn ChainClient) -> Self {
        Self { store, chain }
    }

    /// Broadcast the contract if it is fully funded and not yet fulfilled.
    ///
    /// Returns the new record, or `None` when there was nothing to do. A
    /// failed broadcast writes nothing and can simply be retried.
    pub fn fulfill(&self, campaign_id: u64, now: i64) -> Result<Option<Fulfillment>> {
        if self.store.get_fulfillment(campaign_id)?.is_some() {
            return Ok(None);
        }
        let campaign = self
            .store
            .get_campaign(campaign_id)?
            .ok_or(EngineError::UnknownCampaign(campaign_id))?;

        let mut ledger = campaign.ledger()?;
        for commitment in self.store.active_ledger_commitments(campaign_id)? {
            ledger.add_commitment(commitment);
        }
        if !ledger.is_complete() {
            return Ok(None);
        }

        let transaction = ledger.assemble_transaction()?;
        let raw_tx = transaction.to_hex()?;
        let expected_hash = transaction.hash_hex()?;
        info!(
            "Campaign #{campaign_id} is funded, broadcasting {expected_hash} with {} inputs",
            ledger.commitment_count()
        );

        let transaction_hash = match self.chain.broadcast(&raw_tx) {
            Ok(hash) => hash,
            Err(e) => {
                error!("Broadcast for campaign #{campaign_id} failed: {e}");
                return Err(match e {
                    EngineError::BroadcastFailed(_) => e,
                    other => EngineError::BroadcastFailed(other.to_string()),
                });
            }
        };
        if transaction_hash != expected_hash {
            warn!("Indexer reported {transaction_hash} for transaction {expected_hash}");
        }

        let fulfillment = Fulfillment {
            campaign_id,
            timestamp: now,
            transaction_hash: expected_hash,
        };
        if !self.store.record_fulfillment(&fulfillment)? {
            warn!("Campaign #{campaign_id} was fulfilled concurrently");
            return Ok(None);
        }
        info!(
            "Campaign #{campaign_id} fulfilled by {}",
            fulfillment.transaction_hash
        );
        Ok(Some(fulfillment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::engine::admission::AdmissionController;
    use crate::storage::{Campaign, Recipient};
    use crate::testnet::{TestWallet, TEST_RECIPIENT};

    fn funded_campaign(store: &RecordStore, chain: &MemoryChain, pledged: &[u64]) -> Campaign {
        let recipients = vec![Recipient {
            name: "Recipient 1".to_string(),
            address: TEST_RECIPIENT.to_string(),
            satoshis: 1_000_000,
        }];
        let campaign = store.add_campaign("Contract", 0, 10_000, recipients).unwrap();
        for (seed, satoshis) in pledged.iter().enumerate() {
            let wallet = TestWallet::from_seed(seed as u8 + 10).unwrap();
            let output = wallet.fund(chain, *satoshis).unwrap();
            let pledge = wallet.sign_pledge(&campaign, &[output], "funder").unwrap();
            AdmissionController::new(store, chain)
                .admit(campaign.id, &pledge, 100)
                .unwrap();
        }
        campaign
    }

    #[test]
    fn test_incomplete_campaign_is_left_alone() {
        let store = RecordStore::temporary().unwrap();
        let chain = MemoryChain::new();
        let campaign = funded_campaign(&store, &chain, &[400_000]);

        let orchestrator = FulfillmentOrchestrator::new(&store, &chain);
        assert_eq!(orchestrator.fulfill(campaign.id, 200).unwrap(), None);
        assert_eq!(chain.broadcast_count().unwrap(), 0);
    }

    #[test]
    fn test_fulfills_exactly_once() {
        let store = RecordStore::temporary().unwrap();
        let chain = MemoryChain::new();
        let campaign = funded_campaign(&store, &chain, &[1_000_750]);

        let orchestrator = FulfillmentOrchestrator::new(&store, &chain);
        let fulfillment = orchestrator.fulfill(campaign.id, 200).unwrap().unwrap();
        assert_eq!(fulfillment.campaign_id, campaign.id);
        assert_eq!(fulfillment.timestamp, 200);
        assert_eq!(chain.broadcasts().unwrap(), vec![fulfillment.transaction_hash.clone()]);
        assert_eq!(store.get_fulfillment(campaign.id).unwrap(), Some(fulfillment));

        assert_eq!(orchestrator.fulfill(campaign.id, 300).unwrap(), None);
        assert_eq!(chain.broadcast_count().unwrap(), 1);
    }

    #[test]
    fn test_rejected_broadcast_writes_nothing() {
        let store = RecordStore::temporary().unwrap();
        let chain = MemoryChain::new();
        let campaign = funded_campaign(&store, &chain, &[1_000_750]);
        chain.set_fail_broadcasts(true);

        let orchestrator = FulfillmentOrchestrator::new(&store, &chain);
        assert!(matches!(
            orchestrator.fulfill(campaign.id, 200),
            Err(EngineError::BroadcastFailed(_))
        ));
        assert_eq!(store.get_fulfillment(campaign.id).unwrap(), None);

        chain.set_fail_broadcasts(false);
        assert!(orchestrator.fulfill(campaign.id, 300).unwrap().is_some());
    }
}
