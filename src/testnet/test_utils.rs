//! Test utilities for assurance engine testing

use crate::chain::{ChainClient, ChainNotification, MemoryChain};
use crate::core::address::{Address, AddressKind, Network};
use crate::core::script::{build_p2pkh_unlock, p2pkh_locking_script};
use crate::core::sighash;
use crate::core::transaction::{TXInput, TXOutput, Transaction};
use crate::engine::{Engine, Pledge, PledgeData, PledgeInput};
use crate::error::{EngineError, Result};
use crate::storage::{Campaign, Recipient, RecordStore};
use crate::utils::{current_timestamp, decode_hex, hash160};
use data_encoding::HEXLOWER;
use rand::RngCore;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// Recipient addresses with known hashes, usable on mainnet campaigns
pub const TEST_RECIPIENT: &str = "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2";
pub const TEST_RECIPIENT_2: &str = "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a";

/// An output a wallet received on the test chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundedOutput {
    pub tx_hash: String,
    pub index: u32,
    pub satoshis: u64,
}

/// Single-key P2PKH wallet
pub struct TestWallet {
    private_key: [u8; 32],
    public_key: Vec<u8>,
}

impl TestWallet {
    pub fn generate() -> Result<TestWallet> {
        let mut rng = rand::thread_rng();
        loop {
            let mut private_key = [0u8; 32];
            rng.fill_bytes(&mut private_key);
            // out-of-range scalars are astronomically rare, just draw again
            if let Ok(wallet) = Self::from_private_key(private_key) {
                return Ok(wallet);
            }
        }
    }

    /// Deterministic wallet; any seed other than 0 and 0xff is a valid key.
    pub fn from_seed(seed: u8) -> Result<TestWallet> {
        Self::from_private_key([seed; 32])
    }

    pub fn from_private_key(private_key: [u8; 32]) -> Result<TestWallet> {
        let public_key = sighash::public_key_for(&private_key)?;
        Ok(TestWallet {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn locking_script(&self) -> Vec<u8> {
        p2pkh_locking_script(&hash160(&self.public_key))
    }

    pub fn address(&self, network: Network) -> Address {
        Address::new(network, AddressKind::P2PKH, hash160(&self.public_key))
    }

    /// Pay `satoshis` to this wallet with a transaction spending nothing
    /// the chain knows about.
    pub fn fund(&self, chain: &MemoryChain, satoshis: u64) -> Result<FundedOutput> {
        let mut coinbase = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut coinbase);
        let tx = Transaction::new(
            2,
            vec![TXInput::new(coinbase, 0, vec![0x51], 0xffff_ffff)],
            vec![TXOutput::new(satoshis, self.locking_script())],
            0,
        );
        let tx_hash = chain.add_transaction(&tx)?;
        Ok(FundedOutput {
            tx_hash,
            index: 0,
            satoshis,
        })
    }

    /// Sign `outputs` into a pledge for `campaign`, declaring their total.
    pub fn sign_pledge(
        &self,
        campaign: &Campaign,
        outputs: &[FundedOutput],
        alias: &str,
    ) -> Result<Pledge> {
        let declared = outputs.iter().map(|output| output.satoshis).sum::<u64>();
        self.sign_pledge_declaring(campaign, outputs, alias, declared)
    }

    /// Like [`TestWallet::sign_pledge`] but with any declared amount.
    pub fn sign_pledge_declaring(
        &self,
        campaign: &Campaign,
        outputs: &[FundedOutput],
        alias: &str,
        declared: u64,
    ) -> Result<Pledge> {
        let ledger = campaign.ledger()?;
        let locking_script = self.locking_script();
        let mut inputs = Vec::with_capacity(outputs.len());
        for output in outputs {
            let tx_hash = <[u8; 32]>::try_from(decode_hex(&output.tx_hash)?.as_slice())
                .map_err(|_| EngineError::Codec(format!("Bad transaction hash {}", output.tx_hash)))?;
            let digest =
                ledger.signing_digest(&tx_hash, output.index, output.satoshis, &locking_script)?;
            let signature = sighash::sign(&self.private_key, &digest)?;
            inputs.push(PledgeInput {
                previous_output_transaction_hash: output.tx_hash.clone(),
                previous_output_index: output.index,
                unlocking_script: HEXLOWER.encode(&build_p2pkh_unlock(&signature, &self.public_key)),
            });
        }

        Ok(Pledge {
            inputs,
            data: PledgeData {
                alias: alias.to_string(),
                comment: String::new(),
                amount: serde_json::Number::from(declared),
            },
        })
    }
}

/// Temporary store, in-memory chain and engine wired together.
///
/// Chain notifications queue up until [`TestHarness::process_notifications`]
/// handles them, so tests decide when revocations happen.
pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub chain: Arc<MemoryChain>,
    notifications: Receiver<ChainNotification>,
}

impl TestHarness {
    pub fn new() -> Result<TestHarness> {
        Self::with_store(RecordStore::temporary()?)
    }

    pub fn with_store(store: RecordStore) -> Result<TestHarness> {
        Self::with_chain(store, Arc::new(MemoryChain::new()))
    }

    /// Engine over an existing chain, e.g. to restart against the same
    /// chain state.
    pub fn with_chain(store: RecordStore, chain: Arc<MemoryChain>) -> Result<TestHarness> {
        let (sender, notifications) = mpsc::channel();
        chain.set_notifier(sender)?;
        let client: Arc<dyn ChainClient> = chain.clone();
        let engine = Arc::new(Engine::new(store, client, Network::Mainnet));
        Ok(TestHarness {
            engine,
            chain,
            notifications,
        })
    }

    /// Campaign that opened a minute ago and runs for a day.
    pub fn open_campaign(&self, recipients: &[(&str, u64)]) -> Result<Campaign> {
        let now = current_timestamp()?;
        let recipients = recipients
            .iter()
            .enumerate()
            .map(|(position, (address, satoshis))| Recipient {
                name: format!("Recipient {}", position + 1),
                address: address.to_string(),
                satoshis: *satoshis,
            })
            .collect();
        self.engine
            .store()
            .add_campaign("Test campaign", now - 60, now + 86_400, recipients)
    }

    /// Handle every queued notification on this thread. Returns how many.
    pub fn process_notifications(&self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(notification) = self.notifications.try_recv() {
            self.engine.handle_notification(&notification)?;
            handled += 1;
        }
        Ok(handled)
    }
}
