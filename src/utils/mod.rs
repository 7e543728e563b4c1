//! Utility functions and helpers
//!
//! Hashing, base58 and hex helpers plus the bincode layer used by the
//! record store.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, decode_hex, decode_reversed_hash, hash160,
    hash256, reversed_hex, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};
