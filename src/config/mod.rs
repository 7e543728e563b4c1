//! Configuration management
//!
//! Where the service listens, where its records live, which network its
//! addresses belong to and which Electrum servers it asks about the chain.

pub mod settings;

pub use settings::Settings;
