//! LLM gateway access: the chat-completions client, per-model health
//! tracking, and capability-tagged model selection with failover.

pub mod client;
pub mod health;
pub mod pool;

pub use client::{ChatBackend, ChatRequest, ChatResponse, HttpLlmClient, ResponseFormat};
pub use health::HealthTracker;
pub use pool::{ModelCandidate, ModelPool};
