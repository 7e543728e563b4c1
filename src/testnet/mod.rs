//! Fixtures for exercising the engine without a network
//!
//! Wallets that fund outputs on a [`MemoryChain`](crate::chain::MemoryChain)
//! and sign pledges against a campaign, plus a harness that wires a
//! temporary record store, the in-memory chain and an engine together.

pub mod test_utils;

pub use test_utils::*;
