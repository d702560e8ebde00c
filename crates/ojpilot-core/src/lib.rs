/// Core library for the ojpilot contest-problem pipeline.
///
/// This crate contains the batch execution engine: the per-problem
/// workspace store, judge adapter registry, concurrency gates, LLM
/// client pool, stage executors, pipeline runner, task service, event
/// bus, and the SQLite persistence layer. Transport bindings (HTTP,
/// WebSocket) live in separate crates and consume the operations
/// exposed here.
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod judge;
pub mod llm;
pub mod pipeline;
pub mod storage;
pub mod task;
pub mod workspace;

pub use error::*;

/// Returns the version of the ojpilot-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
