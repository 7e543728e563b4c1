//! Command-line interface
//!
//! This module contains the CLI commands and argument parsing
//! for the assurance service.

pub mod commands;

pub use commands::{Command, Opt, RecipientArg};
