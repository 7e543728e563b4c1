//! Contract primitives
//!
//! Wire encoding, addresses and scripts, the contract sighash, the fee model
//! and the per-campaign ledger built from them.

pub mod address;
pub mod codec;
pub mod fees;
pub mod ledger;
pub mod monetary;
pub mod script;
pub mod sighash;
pub mod transaction;

pub use address::{
    address_to_locking_script, is_well_formed_address, locking_script_to_address,
    validate_address, Address, AddressKind, Network,
};
pub use fees::FeeCalculator;
pub use ledger::{Commitment, ContractLedger};
pub use monetary::{DUST_THRESHOLD, MAX_OUTPUT_SATOSHIS, MAX_SAFE_SATOSHIS, SATOSHIS_PER_COIN};
pub use script::{parse_p2pkh_unlock, script_hash, P2PKHUnlock, ScriptKind};
pub use transaction::{TXInput, TXOutput, Transaction};
