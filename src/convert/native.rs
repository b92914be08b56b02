//! Native GGUF exporter.
//!
//! Fallback used when no llama.cpp checkout is found: loads the merged
//! safetensors directly and writes a GGUF file through candle's own writer.
//! Only three schemes have a defined mapping onto the writer's dtypes; every
//! other scheme maps to the 4-bit default. That approximation mirrors the
//! upstream converter's best-effort policy and is intentional.

use anyhow::{anyhow, Context, Result};
use candle_core::quantized::{gguf_file, GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tracing::{info, warn};

use super::QuantScheme;
use crate::model::loader;

/// Map a requested scheme onto the writer's quantization. Only `f16`,
/// `q8_0`, and `q4_k_m` are defined; the rest silently use the 4-bit
/// default.
pub fn map_scheme(scheme: QuantScheme) -> (&'static str, GgmlDType) {
    match scheme {
        QuantScheme::F16 => ("f16", GgmlDType::F16),
        QuantScheme::Q8_0 => ("q8_0", GgmlDType::Q8_0),
        QuantScheme::Q4KM => ("q4_k_m", GgmlDType::Q4K),
        _ => ("q4_k_m", GgmlDType::Q4K),
    }
}

/// The exporter's own output name inside the target directory.
pub fn default_file_name(mapped: &str) -> String {
    format!("model.{}.gguf", mapped.to_uppercase())
}

/// GGUF tensor name for a pretrained weight key. Unknown keys are skipped.
pub fn map_tensor_name(key: &str) -> Option<String> {
    match key {
        "model.embed_tokens.weight" => return Some("token_embd.weight".to_string()),
        "model.norm.weight" => return Some("output_norm.weight".to_string()),
        "lm_head.weight" => return Some("output.weight".to_string()),
        _ => {}
    }
    let rest = key.strip_prefix("model.layers.")?;
    let (layer, suffix) = rest.split_once('.')?;
    let layer: usize = layer.parse().ok()?;
    let mapped = match suffix {
        "self_attn.q_proj.weight" => "attn_q.weight",
        "self_attn.k_proj.weight" => "attn_k.weight",
        "self_attn.v_proj.weight" => "attn_v.weight",
        "self_attn.o_proj.weight" => "attn_output.weight",
        "mlp.gate_proj.weight" => "ffn_gate.weight",
        "mlp.up_proj.weight" => "ffn_up.weight",
        "mlp.down_proj.weight" => "ffn_down.weight",
        "input_layernorm.weight" => "attn_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        _ => return None,
    };
    Some(format!("blk.{layer}.{mapped}"))
}

/// Export a merged model directory as a GGUF file at `output_path`.
pub fn export(model_path: &Path, output_path: &Path, scheme: QuantScheme) -> Result<()> {
    let (mapped, dtype) = map_scheme(scheme);
    if mapped != scheme.as_str() {
        warn!("No native mapping for {scheme}, using {mapped}");
    }

    let out_dir = output_path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let default_path = out_dir
        .unwrap_or_else(|| Path::new("."))
        .join(default_file_name(mapped));

    let model_ref = model_path
        .to_str()
        .ok_or_else(|| anyhow!("invalid model path"))?;
    let files = loader::resolve(model_ref)?;
    let config = loader::load_model_config(&files)?;

    let device = Device::Cpu;
    let mut qtensors: Vec<(String, QTensor)> = Vec::new();
    for file in &files.weights {
        let tensors = candle_core::safetensors::load(file, &device)?;
        for (key, tensor) in tensors {
            let Some(name) = map_tensor_name(&key) else {
                warn!("Skipping unmapped tensor: {key}");
                continue;
            };
            qtensors.push((name, quantize_tensor(&tensor, dtype)?));
        }
    }
    qtensors.sort_by(|a, b| a.0.cmp(&b.0));

    let metadata = model_metadata(&config, model_ref);
    write_gguf(&default_path, &metadata, &qtensors)?;
    info!("Wrote {} tensors to {}", qtensors.len(), default_path.display());

    if default_path.exists() && default_path != output_path {
        std::fs::rename(&default_path, output_path)?;
    }
    info!("Model saved: {}", output_path.display());
    Ok(())
}

/// Quantize a matrix to the target dtype; vectors and block-unaligned
/// tensors keep full precision.
fn quantize_tensor(tensor: &Tensor, dtype: GgmlDType) -> Result<QTensor> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let dims = tensor.dims();
    let eligible = dims.len() == 2 && dims[dims.len() - 1] % dtype.block_size() == 0;
    let dtype = if eligible { dtype } else { GgmlDType::F32 };
    Ok(QTensor::quantize(&tensor, dtype)?)
}

fn model_metadata(config: &crate::model::ModelConfig, model_ref: &str) -> Vec<(String, gguf_file::Value)> {
    use candle_core::quantized::gguf_file::Value;
    let name = Path::new(model_ref)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_ref.to_string());
    vec![
        ("general.architecture".to_string(), Value::String("llama".to_string())),
        ("general.name".to_string(), Value::String(name)),
        (
            "llama.context_length".to_string(),
            Value::U32(config.max_position_embeddings as u32),
        ),
        (
            "llama.embedding_length".to_string(),
            Value::U32(config.hidden_size as u32),
        ),
        (
            "llama.block_count".to_string(),
            Value::U32(config.num_hidden_layers as u32),
        ),
        (
            "llama.feed_forward_length".to_string(),
            Value::U32(config.intermediate_size as u32),
        ),
        (
            "llama.attention.head_count".to_string(),
            Value::U32(config.num_attention_heads as u32),
        ),
        (
            "llama.attention.head_count_kv".to_string(),
            Value::U32(config.kv_heads() as u32),
        ),
        (
            "llama.attention.layer_norm_rms_epsilon".to_string(),
            Value::F32(config.rms_norm_eps as f32),
        ),
        (
            "llama.rope.freq_base".to_string(),
            Value::F32(config.rope_theta as f32),
        ),
        (
            "llama.vocab_size".to_string(),
            Value::U32(config.vocab_size as u32),
        ),
    ]
}

fn write_gguf(
    path: &Path,
    metadata: &[(String, gguf_file::Value)],
    qtensors: &[(String, QTensor)],
) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let metadata_refs: Vec<(&str, &gguf_file::Value)> = metadata
        .iter()
        .map(|(key, value)| (key.as_str(), value))
        .collect();
    let tensor_refs: Vec<(&str, &QTensor)> = qtensors
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();
    gguf_file::write(&mut file, metadata_refs.as_slice(), tensor_refs.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_three_schemes_have_defined_mappings() {
        assert_eq!(map_scheme(QuantScheme::F16).0, "f16");
        assert_eq!(map_scheme(QuantScheme::Q8_0).0, "q8_0");
        assert_eq!(map_scheme(QuantScheme::Q4KM).0, "q4_k_m");
        // Everything else falls back to the 4-bit default.
        for scheme in [
            QuantScheme::F32,
            QuantScheme::Q4_0,
            QuantScheme::Q4_1,
            QuantScheme::Q4KS,
            QuantScheme::Q5_0,
            QuantScheme::Q5_1,
            QuantScheme::Q5KM,
            QuantScheme::Q6K,
        ] {
            let (mapped, dtype) = map_scheme(scheme);
            assert_eq!(mapped, "q4_k_m");
            assert_eq!(dtype, GgmlDType::Q4K);
        }
    }

    #[test]
    fn default_name_uses_the_mapped_scheme() {
        assert_eq!(default_file_name("q4_k_m"), "model.Q4_K_M.gguf");
        assert_eq!(default_file_name("f16"), "model.F16.gguf");
    }

    #[test]
    fn tensor_name_mapping() {
        assert_eq!(
            map_tensor_name("model.embed_tokens.weight").unwrap(),
            "token_embd.weight"
        );
        assert_eq!(
            map_tensor_name("model.layers.3.self_attn.q_proj.weight").unwrap(),
            "blk.3.attn_q.weight"
        );
        assert_eq!(
            map_tensor_name("model.layers.10.mlp.down_proj.weight").unwrap(),
            "blk.10.ffn_down.weight"
        );
        assert_eq!(
            map_tensor_name("model.layers.0.post_attention_layernorm.weight").unwrap(),
            "blk.0.ffn_norm.weight"
        );
        assert_eq!(map_tensor_name("lm_head.weight").unwrap(), "output.weight");
        assert!(map_tensor_name("model.layers.0.unknown.weight").is_none());
        assert!(map_tensor_name("rotary.inv_freq").is_none());
    }

    #[test]
    fn writes_a_gguf_container() {
        let device = Device::Cpu;
        let tensor = Tensor::ones((4, 64), DType::F32, &device).unwrap();
        let qtensor = quantize_tensor(&tensor, GgmlDType::F16).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        let metadata = vec![(
            "general.architecture".to_string(),
            gguf_file::Value::String("llama".to_string()),
        )];
        write_gguf(&path, &metadata, &[("token_embd.weight".to_string(), qtensor)]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 8);
        assert_eq!(&bytes[..4], b"GGUF");
    }

    #[test]
    fn vectors_are_not_quantized() {
        let device = Device::Cpu;
        let vector = Tensor::ones(64, DType::F32, &device).unwrap();
        let qtensor = quantize_tensor(&vector, GgmlDType::Q4K).unwrap();
        assert_eq!(qtensor.dtype(), GgmlDType::F32);
    }
}
