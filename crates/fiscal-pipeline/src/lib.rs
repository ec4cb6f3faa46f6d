//! Electronic fiscal document pipeline.
//!
//! Posted accounting documents are captured as immutable snapshots, turned into
//! jurisdiction-specific payloads, signed, submitted to the tax authority and
//! tracked in an append-only submission ledger.

pub mod config;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod telemetry;
