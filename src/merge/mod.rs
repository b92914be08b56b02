//! Adapter merging.
//!
//! Folds a trained adapter into the base weights and persists a standalone
//! model directory loadable by the standard pretrained loader. Two
//! backends, selected once from the build's capabilities: the fused path
//! streams tensors straight out of the memory-mapped safetensors files and
//! writes 16-bit merged weights directly; the generic path builds the full
//! model graph with the adapter attached, merges in-graph, and persists the
//! plain model and tokenizer separately.

use anyhow::{bail, Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::backend::Capabilities;
use crate::hardware::ComputeProfile;
use crate::model::loader::{self, ModelFiles, CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::model::lora::{merge_delta, AdapterArtifact};
use crate::model::LlamaModel;

/// Merge execution path, first available wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBackend {
    Fused,
    Generic,
}

impl MergeBackend {
    pub fn select(caps: &Capabilities) -> Self {
        if caps.fused {
            Self::Fused
        } else {
            Self::Generic
        }
    }
}

pub fn run(
    base_model: &str,
    lora_path: &Path,
    output_dir: &Path,
    profile: &ComputeProfile,
) -> Result<()> {
    match MergeBackend::select(&Capabilities::detect()) {
        MergeBackend::Fused => {
            info!("Using fused merge");
            fused_merge(base_model, lora_path, output_dir, profile)
        }
        MergeBackend::Generic => {
            info!("Using layer-wise merge");
            generic_merge(base_model, lora_path, output_dir, profile)
        }
    }
}

/// Stream base tensors from the memory-mapped weight files, fold adapter
/// deltas in, and write full F16 merged weights.
pub fn fused_merge(
    base_model: &str,
    lora_path: &Path,
    output_dir: &Path,
    profile: &ComputeProfile,
) -> Result<()> {
    info!("Loading base model: {base_model}");
    let files = loader::resolve(base_model)?;
    info!("Loading adapter: {}", lora_path.display());
    let adapter = AdapterArtifact::load(lora_path, &profile.device)?;
    let scaling = adapter.config.scaling();

    let mmap = unsafe { MmapedSafetensors::multi(&files.weights)? };
    let mut merged: HashMap<String, Tensor> = HashMap::new();
    let mut merged_count = 0usize;
    for (name, _) in mmap.tensors() {
        let tensor = mmap.load(&name, &profile.device)?;
        let tensor = match adapter.delta_for(&name) {
            Some((lora_a, lora_b)) => {
                merged_count += 1;
                debug!("Merging layer: {name}");
                merge_delta(&tensor, lora_a, lora_b, scaling)?
            }
            None => tensor,
        };
        merged.insert(name, tensor.to_dtype(DType::F16)?);
    }

    if merged_count == 0 {
        bail!("no adapter layers matched the base model weights");
    }
    info!("Merge complete: {merged_count} layers merged");

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    candle_core::safetensors::save(&merged, output_dir.join(WEIGHTS_FILE))?;
    copy_model_metadata(&files, output_dir)?;
    Ok(())
}

/// Build the model graph with the adapter attached, merge-and-unload, and
/// persist the plain model and tokenizer separately.
pub fn generic_merge(
    base_model: &str,
    lora_path: &Path,
    output_dir: &Path,
    profile: &ComputeProfile,
) -> Result<()> {
    info!("Loading base model: {base_model}");
    let files = loader::resolve(base_model)?;
    let model_config = loader::load_model_config(&files)?;
    let tokenizer = loader::load_tokenizer(&files)?;

    info!("Loading adapter: {}", lora_path.display());
    let adapter = AdapterArtifact::load(lora_path, &profile.device)?;
    let hyperparams = adapter.config.hyperparams();
    let lora_vb = VarBuilder::from_tensors(adapter.tensors.clone(), DType::F32, &profile.device);

    let weights = loader::load_weights(&files, profile)?;
    let mut model = LlamaModel::load(
        loader::var_builder(weights, profile),
        &model_config,
        Some((&hyperparams, lora_vb)),
    )?;

    info!("Merging adapter into base weights");
    model.merge_adapter()?;

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    candle_core::safetensors::save(&model.export_tensors(), output_dir.join(WEIGHTS_FILE))?;
    std::fs::copy(&files.config, output_dir.join(CONFIG_FILE))?;
    tokenizer
        .save(output_dir.join(TOKENIZER_FILE), false)
        .map_err(|err| anyhow::anyhow!("failed to save tokenizer: {err}"))?;
    if let Some(tokenizer_config) = &files.tokenizer_config {
        std::fs::copy(
            tokenizer_config,
            output_dir.join(crate::data::template::TOKENIZER_CONFIG_FILE),
        )?;
    }
    Ok(())
}

/// Carry the base model's metadata files into the merged artifact.
fn copy_model_metadata(files: &ModelFiles, output_dir: &Path) -> Result<()> {
    std::fs::copy(&files.config, output_dir.join(CONFIG_FILE))?;
    std::fs::copy(&files.tokenizer, output_dir.join(TOKENIZER_FILE))?;
    if let Some(tokenizer_config) = &files.tokenizer_config {
        std::fs::copy(
            tokenizer_config,
            output_dir.join(crate::data::template::TOKENIZER_CONFIG_FILE),
        )?;
    }
    Ok(())
}
