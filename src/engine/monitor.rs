//! Subscription table for committed outputs
//!
//! One chain subscription per script hash, reference counted by the
//! commitments that depend on it. The table only decides *whether* a
//! notification needs work; checking the chain and writing revocations is
//! left to the engine.
//!
//! The table lock is never held across a chain call. Subscribe and
//! unsubscribe for one script hash are ordered by a lock of their own, so a
//! slow indexer only delays work on that hash.

use crate::chain::ChainClient;
use crate::error::{EngineError, Result};
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct WatchEntry {
    commitments: BTreeSet<u64>,
    /// Set once the chain accepted the subscription
    subscribed: bool,
    /// Status of the last notification that was fully handled
    last_status: Option<String>,
}

#[derive(Debug, Default)]
pub struct RevocationMonitor {
    watches: Mutex<HashMap<String, WatchEntry>>,
    call_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RevocationMonitor {
    pub fn new() -> RevocationMonitor {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, WatchEntry>>> {
        self.watches
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire watch table: {e}")))
    }

    fn call_lock(&self, script_hash: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .call_locks
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire call locks: {e}")))?;
        Ok(Arc::clone(locks.entry(script_hash.to_string()).or_default()))
    }

    fn forget_call_lock(&self, script_hash: &str, lock: &Arc<Mutex<()>>) -> Result<()> {
        let mut locks = self
            .call_locks
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire call locks: {e}")))?;
        // held only by the map and the caller
        if Arc::strong_count(lock) == 2 {
            locks.remove(script_hash);
        }
        Ok(())
    }

    /// Track `commitment_id` under `script_hash`, subscribing on the chain
    /// only if nothing watched the hash yet. Returns whether a subscription
    /// was opened.
    ///
    /// The commitment is visible in the table while the subscribe call is in
    /// flight. If the call fails it is taken out again; commitments other
    /// watches added meanwhile stay and the next watch retries.
    pub fn watch(
        &self,
        chain: &dyn ChainClient,
        script_hash: &str,
        commitment_id: u64,
    ) -> Result<bool> {
        {
            let mut watches = self.lock()?;
            let entry = watches.entry(script_hash.to_string()).or_default();
            entry.commitments.insert(commitment_id);
            if entry.subscribed {
                return Ok(false);
            }
        }

        let lock = self.call_lock(script_hash)?;
        let _calls = lock
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire call lock: {e}")))?;
        // another watch may have subscribed, or a release emptied the entry
        let needed = self
            .lock()?
            .get(script_hash)
            .map_or(false, |entry| !entry.subscribed);
        if !needed {
            return Ok(false);
        }

        if let Err(e) = chain.subscribe(script_hash) {
            let mut watches = self.lock()?;
            if let Some(entry) = watches.get_mut(script_hash) {
                entry.commitments.remove(&commitment_id);
                if entry.commitments.is_empty() {
                    watches.remove(script_hash);
                }
            }
            return Err(e);
        }
        if let Some(entry) = self.lock()?.get_mut(script_hash) {
            entry.subscribed = true;
        }
        debug!("Watching {script_hash} for commitment #{commitment_id}");
        Ok(true)
    }

    /// Drop `commitment_id`, unsubscribing once no commitment needs the
    /// hash. Returns whether the hash stopped being watched.
    pub fn release(
        &self,
        chain: &dyn ChainClient,
        script_hash: &str,
        commitment_id: u64,
    ) -> Result<bool> {
        {
            let mut watches = self.lock()?;
            let Some(entry) = watches.get_mut(script_hash) else {
                return Ok(false);
            };
            entry.commitments.remove(&commitment_id);
            if !entry.commitments.is_empty() {
                return Ok(false);
            }
            watches.remove(script_hash);
        }

        let lock = self.call_lock(script_hash)?;
        {
            let _calls = lock
                .lock()
                .map_err(|e| EngineError::Lock(format!("Failed to acquire call lock: {e}")))?;
            // a watch that arrived in between keeps the subscription
            if self.is_watching(script_hash)? {
                return Ok(true);
            }
            if let Err(e) = chain.unsubscribe(script_hash) {
                // the server drops it with the connection anyway
                warn!("Failed to unsubscribe {script_hash}: {e}");
            }
        }
        self.forget_call_lock(script_hash, &lock)?;
        debug!("Released {script_hash}");
        Ok(true)
    }

    /// Commitments to re-check for a notification, or `None` when the hash
    /// is not watched or the status was already handled.
    pub fn pending(&self, script_hash: &str, status: Option<&str>) -> Result<Option<Vec<u64>>> {
        let watches = self.lock()?;
        let Some(entry) = watches.get(script_hash) else {
            return Ok(None);
        };
        if status.is_some() && entry.last_status.as_deref() == status {
            return Ok(None);
        }
        Ok(Some(entry.commitments.iter().copied().collect()))
    }

    pub fn mark_handled(&self, script_hash: &str, status: Option<String>) -> Result<()> {
        if let Some(entry) = self.lock()?.get_mut(script_hash) {
            entry.last_status = status;
        }
        Ok(())
    }

    pub fn commitments(&self, script_hash: &str) -> Result<Vec<u64>> {
        Ok(self
            .lock()?
            .get(script_hash)
            .map(|entry| entry.commitments.iter().copied().collect())
            .unwrap_or_default())
    }

    pub fn watched_script_hashes(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    pub fn is_watching(&self, script_hash: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(script_hash))
    }

    pub fn subscription_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{HistoryEntry, MemoryChain, UnspentOutput};
    use std::sync::mpsc::{self, Sender};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Indexer whose subscribe call is slow or refused.
    struct SluggishChain {
        delay: Duration,
        refuse: bool,
        started: Mutex<Option<Sender<()>>>,
    }

    impl SluggishChain {
        fn new(delay: Duration, refuse: bool) -> SluggishChain {
            SluggishChain {
                delay,
                refuse,
                started: Mutex::new(None),
            }
        }
    }

    impl ChainClient for SluggishChain {
        fn get_transaction(&self, _tx_hash: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn get_unspent_outputs(&self, _script_hash: &str) -> Result<Vec<UnspentOutput>> {
            Ok(vec![])
        }

        fn get_history(&self, _script_hash: &str) -> Result<Vec<HistoryEntry>> {
            Ok(vec![])
        }

        fn subscribe(&self, _script_hash: &str) -> Result<Option<String>> {
            if let Some(started) = self.started.lock().unwrap().take() {
                started.send(()).unwrap();
            }
            thread::sleep(self.delay);
            if self.refuse {
                return Err(EngineError::Chain("connection reset".to_string()));
            }
            Ok(None)
        }

        fn unsubscribe(&self, _script_hash: &str) -> Result<bool> {
            Ok(true)
        }

        fn broadcast(&self, _raw_tx_hex: &str) -> Result<String> {
            Err(EngineError::BroadcastFailed("read only".to_string()))
        }
    }

    #[test]
    fn test_one_subscription_per_script_hash() {
        let chain = MemoryChain::new();
        let monitor = RevocationMonitor::new();

        assert!(monitor.watch(&chain, "aa", 1).unwrap());
        assert!(!monitor.watch(&chain, "aa", 2).unwrap());
        assert!(!monitor.watch(&chain, "aa", 2).unwrap());
        assert!(monitor.watch(&chain, "bb", 3).unwrap());

        assert_eq!(chain.subscribe_calls().unwrap(), 2);
        assert_eq!(monitor.subscription_count().unwrap(), 2);
        assert_eq!(monitor.commitments("aa").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_release_unsubscribes_when_unused() {
        let chain = MemoryChain::new();
        let monitor = RevocationMonitor::new();
        monitor.watch(&chain, "aa", 1).unwrap();
        monitor.watch(&chain, "aa", 2).unwrap();

        assert!(!monitor.release(&chain, "aa", 1).unwrap());
        assert!(chain.is_subscribed("aa").unwrap());
        assert!(monitor.release(&chain, "aa", 2).unwrap());
        assert!(!chain.is_subscribed("aa").unwrap());
        assert!(!monitor.is_watching("aa").unwrap());
        // releasing again is harmless
        assert!(!monitor.release(&chain, "aa", 2).unwrap());
    }

    #[test]
    fn test_repeated_status_is_skipped() {
        let chain = MemoryChain::new();
        let monitor = RevocationMonitor::new();
        monitor.watch(&chain, "aa", 7).unwrap();

        assert_eq!(monitor.pending("aa", Some("s1")).unwrap(), Some(vec![7]));
        monitor.mark_handled("aa", Some("s1".to_string())).unwrap();
        assert_eq!(monitor.pending("aa", Some("s1")).unwrap(), None);
        assert_eq!(monitor.pending("aa", Some("s2")).unwrap(), Some(vec![7]));
        assert_eq!(monitor.pending("zz", Some("s2")).unwrap(), None);
    }

    #[test]
    fn test_slow_subscribe_leaves_other_hashes_alone() {
        let monitor = Arc::new(RevocationMonitor::new());
        monitor.watch(&MemoryChain::new(), "aa", 1).unwrap();

        let slow = SluggishChain::new(Duration::from_millis(600), false);
        let (started, subscribing) = mpsc::channel();
        *slow.started.lock().unwrap() = Some(started);
        let watcher = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.watch(&slow, "bb", 2))
        };
        subscribing.recv().unwrap();

        let begun = Instant::now();
        assert_eq!(monitor.pending("aa", Some("s1")).unwrap(), Some(vec![1]));
        assert_eq!(monitor.commitments("bb").unwrap(), vec![2]);
        assert!(begun.elapsed() < Duration::from_millis(300));

        assert!(watcher.join().unwrap().unwrap());
        assert_eq!(monitor.subscription_count().unwrap(), 2);
    }

    #[test]
    fn test_refused_subscribe_is_rolled_back() {
        let monitor = RevocationMonitor::new();
        let refusing = SluggishChain::new(Duration::ZERO, true);

        assert!(matches!(
            monitor.watch(&refusing, "aa", 1),
            Err(EngineError::Chain(_))
        ));
        assert!(!monitor.is_watching("aa").unwrap());

        let chain = MemoryChain::new();
        assert!(monitor.watch(&chain, "aa", 1).unwrap());
        assert!(chain.is_subscribed("aa").unwrap());
    }
}
