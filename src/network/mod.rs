//! Client-facing TCP service
//!
//! Contributors submit pledges and query campaign status; observers switch
//! their connection to the live event feed.

pub mod server;

pub use server::{Request, Response, Server};
