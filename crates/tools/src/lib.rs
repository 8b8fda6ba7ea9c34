//! Tool catalog and LLM-driven tool subsetting.

pub mod predictor;
pub mod registry;

pub use predictor::ToolPredictor;
pub use registry::{ToolHandler, ToolRegistry};
