//! Cost-governance escalation engine.
//!
//! Library crate shared by the `costgov` binary and the integration tests in `tests/`.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod notification;
pub mod store;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub engine: engine::EscalationEngine,
    pub config: config::Config,
}
