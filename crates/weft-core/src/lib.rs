//! Weft workflow engine.
//!
//! Loads YAML workflow definitions, validates the step DAG, and drives runs
//! through an event-driven scheduler with retries, backoff, timeouts,
//! conditional skips, parallel fan-out, cancellation, and an append-only run
//! state log.
//!
//! The engine has two external seams: [`dispatch::AgentDispatcher`] for agent
//! invocation and [`store::RunStore`] for run state persistence. Triggers are
//! outside the core; a trigger adapter resolves its event into a flat input
//! map and calls [`engine::Engine::start_run`].

pub mod context;
pub mod dag;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod expr;
pub mod inspect;
pub mod policy;
pub mod store;

pub use dispatch::{AgentDispatcher, DispatchError};
pub use engine::{Engine, EngineError, RunOutcome};
pub use store::{MemoryRunStore, RunStore};
