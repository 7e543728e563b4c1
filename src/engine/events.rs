//! Observer feed
//!
//! New observers first receive a snapshot of every contribution, then each
//! contribution, revocation and fulfillment as it happens. Observers whose
//! receiver went away are dropped on the next publish.

use crate::error::{EngineError, Result};
use crate::storage::{Contribution, Fulfillment, Revocation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Contribution fields shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionView {
    pub id: u64,
    pub campaign_id: u64,
    pub alias: String,
    pub comment: String,
    pub satoshis: u64,
    pub timestamp: i64,
    pub revocation: Option<Revocation>,
}

impl From<&Contribution> for ContributionView {
    fn from(contribution: &Contribution) -> Self {
        ContributionView {
            id: contribution.id,
            campaign_id: contribution.campaign_id,
            alias: contribution.alias.clone(),
            comment: contribution.comment.clone(),
            satoshis: contribution.satoshis,
            timestamp: contribution.timestamp,
            revocation: contribution.revocation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    Snapshot {
        contributions: Vec<ContributionView>,
    },
    Contribution(ContributionView),
    Revocation {
        contribution_id: u64,
        campaign_id: u64,
        timestamp: i64,
        spending_tx_hash: Option<String>,
    },
    Fulfillment(Fulfillment),
}

impl FeedEvent {
    pub fn campaign_id(&self) -> Option<u64> {
        match self {
            FeedEvent::Snapshot { .. } => None,
            FeedEvent::Contribution(view) => Some(view.campaign_id),
            FeedEvent::Revocation { campaign_id, .. } => Some(*campaign_id),
            FeedEvent::Fulfillment(fulfillment) => Some(fulfillment.campaign_id),
        }
    }
}

struct Observer {
    campaign_id: Option<u64>,
    sender: Sender<FeedEvent>,
}

#[derive(Default)]
pub struct EventFeed {
    observers: Mutex<HashMap<Uuid, Observer>>,
}

impl EventFeed {
    pub fn new() -> EventFeed {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Observer>>> {
        self.observers
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire observers: {e}")))
    }

    /// Register an observer, optionally limited to one campaign.
    ///
    /// `snapshot` runs while publishing is blocked, so every event either
    /// shows up in the snapshot or is delivered after it. Records are written
    /// before their event is published, so a contribution stored just before
    /// the snapshot can also arrive again as the first incremental event.
    /// Events carry the record's id; observers apply them by id and a repeat
    /// changes nothing.
    pub fn subscribe<F>(
        &self,
        campaign_id: Option<u64>,
        snapshot: F,
    ) -> Result<(Uuid, Receiver<FeedEvent>)>
    where
        F: FnOnce() -> Result<Vec<ContributionView>>,
    {
        let mut observers = self.lock()?;
        let (sender, receiver) = mpsc::channel();
        let contributions = snapshot()?;
        // receiver is alive, this cannot fail
        let _ = sender.send(FeedEvent::Snapshot { contributions });

        let id = Uuid::new_v4();
        observers.insert(
            id,
            Observer {
                campaign_id,
                sender,
            },
        );
        debug!("Observer {id} subscribed");
        Ok((id, receiver))
    }

    pub fn unsubscribe(&self, id: &Uuid) -> Result<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    pub fn publish(&self, event: FeedEvent) -> Result<()> {
        let mut observers = self.lock()?;
        let campaign_id = event.campaign_id();
        observers.retain(|id, observer| {
            if observer.campaign_id.is_some() && observer.campaign_id != campaign_id {
                return true;
            }
            let delivered = observer.sender.send(event.clone()).is_ok();
            if !delivered {
                debug!("Observer {id} went away");
            }
            delivered
        });
        Ok(())
    }

    pub fn observer_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: u64, campaign_id: u64) -> ContributionView {
        ContributionView {
            id,
            campaign_id,
            alias: "carol".to_string(),
            comment: String::new(),
            satoshis: 100_000,
            timestamp: 10,
            revocation: None,
        }
    }

    #[test]
    fn test_snapshot_then_increments() {
        let feed = EventFeed::new();
        let (_, events) = feed.subscribe(None, || Ok(vec![view(1, 1)])).unwrap();
        feed.publish(FeedEvent::Contribution(view(2, 1))).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            FeedEvent::Snapshot {
                contributions: vec![view(1, 1)]
            }
        );
        assert_eq!(events.try_recv().unwrap(), FeedEvent::Contribution(view(2, 1)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stored_but_unpublished_contribution_arrives_twice() {
        let feed = EventFeed::new();
        // already in the store when the observer joins, published right after
        let (_, events) = feed.subscribe(Some(1), || Ok(vec![view(7, 1)])).unwrap();
        feed.publish(FeedEvent::Contribution(view(7, 1))).unwrap();

        let Ok(FeedEvent::Snapshot { contributions }) = events.try_recv() else {
            panic!("snapshot comes first");
        };
        assert_eq!(contributions, vec![view(7, 1)]);
        assert_eq!(events.try_recv().unwrap(), FeedEvent::Contribution(view(7, 1)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_campaign_filter_and_disconnect() {
        let feed = EventFeed::new();
        let (_, only_two) = feed.subscribe(Some(2), || Ok(vec![])).unwrap();
        let (_, dropped) = feed.subscribe(None, || Ok(vec![])).unwrap();
        drop(dropped);

        feed.publish(FeedEvent::Contribution(view(5, 1))).unwrap();
        feed.publish(FeedEvent::Revocation {
            contribution_id: 6,
            campaign_id: 2,
            timestamp: 11,
            spending_tx_hash: None,
        })
        .unwrap();

        assert!(matches!(only_two.try_recv(), Ok(FeedEvent::Snapshot { .. })));
        assert!(matches!(
            only_two.try_recv(),
            Ok(FeedEvent::Revocation {
                contribution_id: 6,
                ..
            })
        ));
        assert!(only_two.try_recv().is_err());
        assert_eq!(feed.observer_count().unwrap(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(FeedEvent::Fulfillment(Fulfillment {
            campaign_id: 3,
            timestamp: 9,
            transaction_hash: "ff".to_string(),
        }))
        .unwrap();
        assert_eq!(json["event"], "fulfillment");
        assert_eq!(json["transaction_hash"], "ff");
    }
}
