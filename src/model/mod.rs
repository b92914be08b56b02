//! Model graph, weight loading, and adapter types.

pub mod llama;
pub mod loader;
pub mod lora;

#[cfg(test)]
pub mod test_fixtures;

pub use llama::{KvCache, LlamaModel, ModelConfig};
pub use lora::{AdapterArtifact, AdapterConfig, LoraHyperparams};
