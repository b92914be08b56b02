//! Base-model resolution and weight loading.
//!
//! A base-model reference is either a local pretrained directory or a
//! HuggingFace hub id. Resolution yields the same file set either way:
//! `config.json`, tokenizer files, and one or more safetensors shards.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::llama::ModelConfig;
use crate::hardware::ComputeProfile;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Resolved on-disk file set of a pretrained model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub reference: String,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// Resolve a model reference to local files, downloading from the hub when
/// it is not a directory.
pub fn resolve(model_ref: &str) -> Result<ModelFiles> {
    let path = Path::new(model_ref);
    if path.is_dir() {
        resolve_local(model_ref, path)
    } else {
        resolve_hub(model_ref)
    }
}

fn resolve_local(model_ref: &str, dir: &Path) -> Result<ModelFiles> {
    debug!("Resolving local model directory: {}", dir.display());
    let config = dir.join(CONFIG_FILE);
    if !config.exists() {
        bail!("no {CONFIG_FILE} in {}", dir.display());
    }
    let tokenizer = dir.join(TOKENIZER_FILE);
    if !tokenizer.exists() {
        bail!("no {TOKENIZER_FILE} in {}", dir.display());
    }
    let tokenizer_config = {
        let path = dir.join(crate::data::template::TOKENIZER_CONFIG_FILE);
        path.exists().then_some(path)
    };

    let index = dir.join(WEIGHTS_INDEX_FILE);
    let weights = if index.exists() {
        shard_names(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else if dir.join(WEIGHTS_FILE).exists() {
        vec![dir.join(WEIGHTS_FILE)]
    } else {
        // Last resort: anything that looks like a weight shard.
        let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("safetensors"))
            .collect();
        shards.sort();
        if shards.is_empty() {
            bail!("no safetensors weights in {}", dir.display());
        }
        shards
    };

    Ok(ModelFiles {
        reference: model_ref.to_string(),
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

fn resolve_hub(model_id: &str) -> Result<ModelFiles> {
    info!("Resolving model from HuggingFace Hub: {model_id}");
    let api = Api::new().context("failed to initialize hub client")?;
    let repo = api.model(model_id.to_string());
    let config = repo
        .get(CONFIG_FILE)
        .with_context(|| format!("failed to fetch {CONFIG_FILE} for {model_id}"))?;
    let tokenizer = repo
        .get(TOKENIZER_FILE)
        .with_context(|| format!("failed to fetch {TOKENIZER_FILE} for {model_id}"))?;
    let tokenizer_config = repo.get(crate::data::template::TOKENIZER_CONFIG_FILE).ok();

    let weights = match repo.get(WEIGHTS_INDEX_FILE) {
        Ok(index) => {
            let mut files = Vec::new();
            for name in shard_names(&index)? {
                files.push(
                    repo.get(&name)
                        .with_context(|| format!("failed to fetch shard {name}"))?,
                );
            }
            files
        }
        Err(_) => vec![repo
            .get(WEIGHTS_FILE)
            .with_context(|| format!("failed to fetch {WEIGHTS_FILE} for {model_id}"))?],
    };

    Ok(ModelFiles {
        reference: model_id.to_string(),
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

/// Unique shard file names listed by a safetensors index, sorted.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_path)
        .with_context(|| format!("failed to read {}", index_path.display()))?;
    let index: WeightsIndex =
        serde_json::from_str(&raw).with_context(|| format!("invalid {}", index_path.display()))?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

pub fn load_model_config(files: &ModelFiles) -> Result<ModelConfig> {
    let raw = std::fs::read_to_string(&files.config)
        .with_context(|| format!("failed to read {}", files.config.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid {}", files.config.display()))
}

pub fn load_tokenizer(files: &ModelFiles) -> Result<Tokenizer> {
    Tokenizer::from_file(&files.tokenizer)
        .map_err(|err| anyhow!("failed to load tokenizer {}: {err}", files.tokenizer.display()))
}

/// Load all weight tensors in the profile's compute dtype. With
/// `quantized_load`, eligible matrices pass through 4-bit storage first and
/// are dequantized back for adapter training.
pub fn load_weights(files: &ModelFiles, profile: &ComputeProfile) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for file in &files.weights {
        let loaded = candle_core::safetensors::load(file, &profile.device)
            .with_context(|| format!("failed to load {}", file.display()))?;
        for (name, tensor) in loaded {
            let tensor = if profile.quantized_load {
                four_bit_roundtrip(&tensor)?
            } else {
                tensor
            };
            tensors.insert(name, tensor.to_dtype(profile.dtype)?);
        }
    }
    info!(
        "Loaded {} tensors from {} file(s)",
        tensors.len(),
        files.weights.len()
    );
    Ok(tensors)
}

/// Total parameter count of a loaded weight map.
pub fn num_parameters(tensors: &HashMap<String, Tensor>) -> usize {
    tensors.values().map(Tensor::elem_count).sum()
}

/// Build a weight source from a loaded map.
pub fn var_builder(
    tensors: HashMap<String, Tensor>,
    profile: &ComputeProfile,
) -> VarBuilder<'static> {
    VarBuilder::from_tensors(tensors, profile.dtype, &profile.device)
}

/// Store a matrix 4-bit, then rebuild it for compute. Only 2-D matrices with
/// a block-aligned row length are eligible; everything else keeps full
/// precision.
fn four_bit_roundtrip(tensor: &Tensor) -> Result<Tensor> {
    let dims = tensor.dims();
    if dims.len() != 2 || dims[1] % GgmlDType::Q4_0.block_size() != 0 {
        return Ok(tensor.clone());
    }
    let quantized = QTensor::quantize(&tensor.to_dtype(candle_core::DType::F32)?, GgmlDType::Q4_0)?;
    Ok(quantized.dequantize(tensor.device())?)
}
