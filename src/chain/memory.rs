//! In-process chain index
//!
//! Keeps every transaction it is given, indexes outputs and history by
//! script hash, and notifies subscribers the way an Electrum server would.
//! Broadcasts are checked before they are accepted: every input must be
//! unspent and every P2PKH input must carry a valid contract signature.

use crate::chain::{history_status, ChainClient, ChainNotification, HistoryEntry, UnspentOutput};
use crate::core::script::{self, parse_p2pkh_unlock, ScriptKind};
use crate::core::sighash;
use crate::core::transaction::{TXInput, TXOutput, Transaction};
use crate::error::{EngineError, Result};
use crate::utils::{decode_hex, hash160};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

type OutPoint = (String, u32);

#[derive(Default)]
struct ChainState {
    transactions: HashMap<String, Vec<u8>>,
    outputs: HashMap<OutPoint, TXOutput>,
    by_script: HashMap<String, Vec<OutPoint>>,
    history: HashMap<String, Vec<HistoryEntry>>,
    spent: HashMap<OutPoint, String>,
    subscriptions: HashSet<String>,
    subscribe_calls: usize,
    broadcasts: Vec<String>,
}

pub struct MemoryChain {
    state: Mutex<ChainState>,
    notifier: Mutex<Option<Sender<ChainNotification>>>,
    fail_broadcasts: AtomicBool,
    broadcast_delay: Mutex<Option<Duration>>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> MemoryChain {
        MemoryChain {
            state: Mutex::new(ChainState::default()),
            notifier: Mutex::new(None),
            fail_broadcasts: AtomicBool::new(false),
            broadcast_delay: Mutex::new(None),
        }
    }

    pub fn set_notifier(&self, sender: Sender<ChainNotification>) -> Result<()> {
        *self
            .notifier
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire notifier: {e}")))? =
            Some(sender);
        Ok(())
    }

    /// Reject every broadcast until switched off again.
    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    /// Hold each broadcast for `delay`, widening race windows.
    pub fn set_broadcast_delay(&self, delay: Option<Duration>) -> Result<()> {
        *self
            .broadcast_delay
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire delay: {e}")))? = delay;
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ChainState>> {
        self.state
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire chain state: {e}")))
    }

    /// Index a transaction without validating it, the way a block would
    /// deliver it. Returns its id.
    pub fn add_transaction(&self, tx: &Transaction) -> Result<String> {
        let tx_hash = tx.hash_hex()?;
        let raw = tx.encode()?;
        let mut touched = HashSet::new();

        {
            let mut state = self.lock_state()?;
            if state.transactions.contains_key(&tx_hash) {
                return Ok(tx_hash);
            }

            for input in tx.get_vin() {
                let outpoint = (input.get_txid_hex(), input.get_vout());
                let Some(previous) = state.outputs.get(&outpoint) else {
                    continue;
                };
                let script_hash = script::script_hash(previous.get_locking_script());
                state.spent.insert(outpoint, tx_hash.clone());
                push_history(&mut state, &script_hash, &tx_hash);
                touched.insert(script_hash);
            }

            for (index, output) in tx.get_vout().iter().enumerate() {
                let outpoint = (tx_hash.clone(), index as u32);
                let script_hash = script::script_hash(output.get_locking_script());
                state.outputs.insert(outpoint.clone(), output.clone());
                state
                    .by_script
                    .entry(script_hash.clone())
                    .or_default()
                    .push(outpoint);
                push_history(&mut state, &script_hash, &tx_hash);
                touched.insert(script_hash);
            }

            state.transactions.insert(tx_hash.clone(), raw);
        }

        for script_hash in touched {
            self.notify(&script_hash)?;
        }
        Ok(tx_hash)
    }

    /// Spend an output outside the contract, e.g. a contributor moving their
    /// coins. Returns the spending transaction's id.
    pub fn spend_outpoint(&self, tx_hash: &str, index: u32, to_script: Vec<u8>) -> Result<String> {
        let value = {
            let state = self.lock_state()?;
            state
                .outputs
                .get(&(tx_hash.to_string(), index))
                .map(TXOutput::get_value)
                .ok_or_else(|| EngineError::Chain(format!("Unknown output {tx_hash}:{index}")))?
        };
        let txid = <[u8; 32]>::try_from(decode_hex(tx_hash)?.as_slice())
            .map_err(|_| EngineError::Codec(format!("Bad transaction hash {tx_hash}")))?;
        let spend = Transaction::new(
            2,
            vec![TXInput::new(txid, index, vec![], 0xffff_ffff)],
            vec![TXOutput::new(value.saturating_sub(300), to_script)],
            0,
        );
        self.add_transaction(&spend)
    }

    /// Push the current status of `script_hash` to the notifier if it is
    /// subscribed. Calling it again replays the same notification.
    pub fn notify(&self, script_hash: &str) -> Result<()> {
        let status = {
            let state = self.lock_state()?;
            if !state.subscriptions.contains(script_hash) {
                return Ok(());
            }
            history_status(state.history.get(script_hash).map(Vec::as_slice).unwrap_or(&[]))
        };
        let notifier = self
            .notifier
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire notifier: {e}")))?;
        if let Some(sender) = notifier.as_ref() {
            let notification = ChainNotification {
                script_hash: script_hash.to_string(),
                status,
            };
            if sender.send(notification).is_err() {
                debug!("Notification receiver dropped");
            }
        }
        Ok(())
    }

    pub fn is_spent(&self, tx_hash: &str, index: u32) -> Result<bool> {
        Ok(self
            .lock_state()?
            .spent
            .contains_key(&(tx_hash.to_string(), index)))
    }

    pub fn broadcasts(&self) -> Result<Vec<String>> {
        Ok(self.lock_state()?.broadcasts.clone())
    }

    pub fn broadcast_count(&self) -> Result<usize> {
        Ok(self.lock_state()?.broadcasts.len())
    }

    pub fn is_subscribed(&self, script_hash: &str) -> Result<bool> {
        Ok(self.lock_state()?.subscriptions.contains(script_hash))
    }

    pub fn subscription_count(&self) -> Result<usize> {
        Ok(self.lock_state()?.subscriptions.len())
    }

    /// Subscribe requests received, including repeats.
    pub fn subscribe_calls(&self) -> Result<usize> {
        Ok(self.lock_state()?.subscribe_calls)
    }

    fn validate_spend(&self, tx: &Transaction) -> Result<()> {
        let state = self.lock_state()?;
        for (position, input) in tx.get_vin().iter().enumerate() {
            let outpoint = (input.get_txid_hex(), input.get_vout());
            let previous = state.outputs.get(&outpoint).ok_or_else(|| {
                EngineError::BroadcastFailed(format!("missing input {}:{}", outpoint.0, outpoint.1))
            })?;
            if state.spent.contains_key(&outpoint) {
                return Err(EngineError::BroadcastFailed(format!(
                    "input {}:{} already spent",
                    outpoint.0, outpoint.1
                )));
            }

            let ScriptKind::P2PKH(key_hash) = script::classify(previous.get_locking_script()) else {
                continue;
            };
            let unlock = parse_p2pkh_unlock(input.get_unlock_script())
                .map_err(|e| EngineError::BroadcastFailed(format!("input {position}: {e}")))?;
            let digest = sighash::build_signing_digest(
                input.get_txid(),
                input.get_vout(),
                previous.get_value(),
                previous.get_locking_script(),
                tx.get_vout(),
                input.get_sequence(),
            )?;
            if hash160(&unlock.public_key) != key_hash
                || !sighash::verify(&unlock.signature, &unlock.public_key, &digest)
            {
                return Err(EngineError::BroadcastFailed(format!(
                    "mandatory-script-verify-flag-failed on input {position}"
                )));
            }
        }
        Ok(())
    }
}

fn push_history(state: &mut ChainState, script_hash: &str, tx_hash: &str) {
    let history = state.history.entry(script_hash.to_string()).or_default();
    if !history.iter().any(|entry| entry.tx_hash == tx_hash) {
        history.push(HistoryEntry {
            tx_hash: tx_hash.to_string(),
            height: 0,
        });
    }
}

impl ChainClient for MemoryChain {
    fn get_transaction(&self, tx_hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_state()?.transactions.get(tx_hash).cloned())
    }

    fn get_unspent_outputs(&self, script_hash: &str) -> Result<Vec<UnspentOutput>> {
        let state = self.lock_state()?;
        let Some(outpoints) = state.by_script.get(script_hash) else {
            return Ok(vec![]);
        };
        Ok(outpoints
            .iter()
            .filter(|outpoint| !state.spent.contains_key(*outpoint))
            .filter_map(|outpoint| {
                state.outputs.get(outpoint).map(|output| UnspentOutput {
                    tx_hash: outpoint.0.clone(),
                    tx_pos: outpoint.1,
                    value: output.get_value(),
                    height: 0,
                })
            })
            .collect())
    }

    fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .lock_state()?
            .history
            .get(script_hash)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(&self, script_hash: &str) -> Result<Option<String>> {
        let mut state = self.lock_state()?;
        state.subscribe_calls += 1;
        state.subscriptions.insert(script_hash.to_string());
        Ok(history_status(
            state.history.get(script_hash).map(Vec::as_slice).unwrap_or(&[]),
        ))
    }

    fn unsubscribe(&self, script_hash: &str) -> Result<bool> {
        Ok(self.lock_state()?.subscriptions.remove(script_hash))
    }

    fn broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        let delay = *self
            .broadcast_delay
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire delay: {e}")))?;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(EngineError::BroadcastFailed(
                "the transaction was rejected by network rules".to_string(),
            ));
        }

        let raw = decode_hex(raw_tx_hex)
            .map_err(|e| EngineError::BroadcastFailed(format!("TX decode failed: {e}")))?;
        let tx = Transaction::decode(&raw)
            .map_err(|e| EngineError::BroadcastFailed(format!("TX decode failed: {e}")))?;
        self.validate_spend(&tx)?;

        let tx_hash = tx.hash_hex()?;
        self.lock_state()?.broadcasts.push(tx_hash.clone());
        self.add_transaction(&tx)?;
        debug!("Accepted broadcast {tx_hash} ({} bytes)", raw.len());
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::p2pkh_locking_script;
    use std::sync::mpsc;

    fn funding(seed: u8, value: u64, lock: Vec<u8>) -> Transaction {
        Transaction::new(
            2,
            vec![TXInput::new([seed; 32], 0, vec![], 0xffff_ffff)],
            vec![TXOutput::new(value, lock)],
            0,
        )
    }

    #[test]
    fn test_indexes_outputs_by_script_hash() {
        let chain = MemoryChain::new();
        let lock = p2pkh_locking_script(&[1; 20]);
        let tx_hash = chain.add_transaction(&funding(1, 5_000, lock.clone())).unwrap();

        let script_hash = script::script_hash(&lock);
        let unspent = chain.get_unspent_outputs(&script_hash).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].tx_hash, tx_hash);
        assert_eq!(unspent[0].value, 5_000);
        assert!(chain.get_transaction(&tx_hash).unwrap().is_some());
        assert!(chain.get_transaction(&"00".repeat(32)).unwrap().is_none());
    }

    #[test]
    fn test_spend_notifies_subscribers() {
        let chain = MemoryChain::new();
        let (tx, rx) = mpsc::channel();
        chain.set_notifier(tx).unwrap();

        let lock = p2pkh_locking_script(&[2; 20]);
        let script_hash = script::script_hash(&lock);
        let funding_hash = chain.add_transaction(&funding(2, 9_000, lock)).unwrap();
        let before = chain.subscribe(&script_hash).unwrap();
        assert!(before.is_some());

        let spender = chain
            .spend_outpoint(&funding_hash, 0, p2pkh_locking_script(&[3; 20]))
            .unwrap();
        let notification = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(notification.script_hash, script_hash);
        assert_ne!(notification.status, before);

        assert!(chain.get_unspent_outputs(&script_hash).unwrap().is_empty());
        let history = chain.get_history(&script_hash).unwrap();
        assert_eq!(history.last().unwrap().tx_hash, spender);
        assert!(chain.is_spent(&funding_hash, 0).unwrap());
    }

    #[test]
    fn test_broadcast_rejects_unknown_and_unsigned_inputs() {
        let chain = MemoryChain::new();
        let unknown = funding(4, 1_000, vec![0x51]);
        assert!(matches!(
            chain.broadcast(&unknown.to_hex().unwrap()),
            Err(EngineError::BroadcastFailed(_))
        ));

        let lock = p2pkh_locking_script(&[5; 20]);
        let funding_hash = chain.add_transaction(&funding(5, 1_000, lock)).unwrap();
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&decode_hex(&funding_hash).unwrap());
        let unsigned = Transaction::new(
            2,
            vec![TXInput::new(txid, 0, vec![0x01, 0x00], 0xffff_ffff)],
            vec![TXOutput::new(700, vec![0x51])],
            0,
        );
        assert!(chain.broadcast(&unsigned.to_hex().unwrap()).is_err());
        assert_eq!(chain.broadcast_count().unwrap(), 0);
    }

    #[test]
    fn test_failure_switch() {
        let chain = MemoryChain::new();
        chain.set_fail_broadcasts(true);
        assert!(matches!(
            chain.broadcast("00"),
            Err(EngineError::BroadcastFailed(_))
        ));
    }

    #[test]
    fn test_subscription_bookkeeping() {
        let chain = MemoryChain::new();
        chain.subscribe("aa").unwrap();
        chain.subscribe("aa").unwrap();
        assert_eq!(chain.subscription_count().unwrap(), 1);
        assert_eq!(chain.subscribe_calls().unwrap(), 2);
        assert!(chain.unsubscribe("aa").unwrap());
        assert!(!chain.is_subscribed("aa").unwrap());
    }
}
