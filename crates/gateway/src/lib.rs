//! Cortex gateway — the orchestrator service that ties classification,
//! daemon execution, the event bus, scheduling, and the MCP bridge into
//! one binary.

pub mod api;
pub mod auth;
pub mod bridge;
pub mod bus;
pub mod classifier;
pub mod context;
pub mod cron;
pub mod daemon;
pub mod limiter;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod state;

pub use orchestrator::CortexOrchestrator;
pub use state::AppState;
