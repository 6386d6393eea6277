//! Shared domain types for the Weft workflow engine.
//!
//! This crate contains the canonical workflow definition model, run/step
//! execution records, the append-only run event log, and shared error types.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod error;
pub mod run;
pub mod workflow;
