//! ESG Sync: real-time change notification broker.
//!
//! The broker lives under [`server`]; the wire protocol and the reconnecting
//! client are in the `esg-sync-core` crate.

pub mod config;
pub mod server;
