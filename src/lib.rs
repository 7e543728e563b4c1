//! # Assurance Engine - Crowdfunding by assurance contract on Bitcoin Cash
//!
//! Contributors sign one of their own outputs over to a fixed set of
//! recipients. Nothing moves until the signed inputs cover every recipient
//! plus the miner fee; then all of them go out in a single transaction.
//! Until that moment any contributor can take their pledge back simply by
//! spending the output elsewhere.
//!
//! ## How the code is organized
//! - `core/`: wire encoding, addresses and scripts, the contract sighash,
//!   the fee model and the per-campaign ledger
//! - `chain/`: what the engine asks of an indexer, over Electrum or in memory
//! - `storage/`: campaigns, contributions and fulfillments in sled
//! - `engine/`: admission, revocation watching, fulfillment, the event feed
//! - `network/`: the JSON-over-TCP service for contributors and observers
//! - `config/`, `cli/`: settings and the command line
//! - `testnet/`: wallets and a harness for driving the engine in tests
//!
//! ## Where to start reading
//! 1. `engine/admission.rs` for the checks a pledge goes through
//! 2. `core/sighash.rs` for what a contributor actually signs
//! 3. `engine/mod.rs` for how revocation and fulfillment stay out of each
//!    other's way

pub mod chain;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod network;
pub mod storage;
pub mod testnet;
pub mod utils;

// Re-export commonly used types for convenience
pub use chain::{ChainClient, ChainNotification, ElectrumClient, MemoryChain};
pub use cli::{Command, Opt};
pub use config::Settings;
pub use core::{
    Address, Commitment, ContractLedger, FeeCalculator, Network, TXInput, TXOutput, Transaction,
};
pub use engine::{CampaignStatus, Engine, FeedEvent, Pledge, Receipt};
pub use error::{EngineError, Result};
pub use network::Server;
pub use storage::{Campaign, Contribution, Fulfillment, Recipient, RecordStore, Revocation};
