//! Shared fixtures for model-level tests: a tiny pretrained directory that
//! the loader, merger, trainer, and inference engine can all consume.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;

use super::llama::{LlamaModel, ModelConfig};
use super::loader::{CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::hardware::ComputeProfile;

pub const TINY_CONFIG_JSON: &str = r#"{
    "hidden_size": 16,
    "intermediate_size": 32,
    "vocab_size": 32,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "rms_norm_eps": 1e-5,
    "rope_theta": 10000.0,
    "max_position_embeddings": 512,
    "tie_word_embeddings": false,
    "eos_token_id": 2
}"#;

/// Minimal but loadable tokenizer definition.
pub const TINY_TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {"type": "WordLevel", "vocab": {"[UNK]": 0, "hola": 1, "mundo": 2}, "unk_token": "[UNK]"}
}"#;

pub fn tiny_model_config() -> ModelConfig {
    serde_json::from_str(TINY_CONFIG_JSON).unwrap()
}

pub fn cpu_profile() -> ComputeProfile {
    ComputeProfile {
        device: Device::Cpu,
        dtype: DType::F32,
        quantized_load: false,
    }
}

/// Write a complete tiny pretrained directory with random weights.
pub fn write_tiny_model(dir: &Path) {
    let device = Device::Cpu;
    let config = tiny_model_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = LlamaModel::load(vb, &config, None).unwrap();
    candle_core::safetensors::save(&model.export_tensors(), dir.join(WEIGHTS_FILE)).unwrap();
    std::fs::write(dir.join(CONFIG_FILE), TINY_CONFIG_JSON).unwrap();
    std::fs::write(dir.join(TOKENIZER_FILE), TINY_TOKENIZER_JSON).unwrap();
}
