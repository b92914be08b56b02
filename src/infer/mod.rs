//! Artifact testing: load, prompt, generate, extract.

pub mod engine;
pub mod extract;

pub use engine::{GenerationConfig, InferenceEngine, TestBackend};
pub use extract::extract_reply;
