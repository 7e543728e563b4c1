//! Durable records
//!
//! Campaigns, contributions and their commitments, and fulfillments live in
//! one sled database. Every admission or revocation that has been reported
//! to a caller is on disk first.

pub mod records;
pub mod store;

pub use records::{
    Campaign, Contribution, Fulfillment, NewCommitment, NewContribution, Recipient, Revocation,
    StoredCommitment,
};
pub use store::RecordStore;
