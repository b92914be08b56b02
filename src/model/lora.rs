//! Low-rank adapter layers and the on-disk adapter artifact.
//!
//! An adapter is a small set of trainable A/B matrix pairs attached to the
//! frozen attention projections of the base model. On disk it is a standard
//! PEFT-shaped directory: `adapter_model.safetensors` plus
//! `adapter_config.json`, so the artifact stays loadable by the usual
//! ecosystem tooling.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Prefix PEFT puts in front of base-model tensor paths.
const ADAPTER_KEY_PREFIX: &str = "base_model.model.";

/// Adapter hyperparameters. Fixed constants in the CLI, but carried as an
/// explicit structure so the contract is visible and overridable in tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraHyperparams {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
    pub target_modules: Vec<String>,
}

impl Default for LoraHyperparams {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: vec![
                "q_proj".to_string(),
                "k_proj".to_string(),
                "v_proj".to_string(),
                "o_proj".to_string(),
            ],
        }
    }
}

impl LoraHyperparams {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }
}

/// A frozen projection with a trainable low-rank bypass.
///
/// Forward: `y = W·x + (B·(A·x)) · alpha/rank` until merged; after merging
/// the delta lives in `W` and the bypass is skipped.
#[derive(Debug)]
pub struct LoraLinear {
    base: Linear,
    lora_a: Linear,
    lora_b: Linear,
    scaling: f64,
    merged: bool,
}

impl LoraLinear {
    /// Attach fresh adapter matrices: A Kaiming-initialized, B zero, so the
    /// bypass starts as the identity delta.
    pub fn new(
        base: Linear,
        in_features: usize,
        out_features: usize,
        hp: &LoraHyperparams,
        vb: VarBuilder,
    ) -> Result<Self> {
        let lora_a = vb.get_with_hints(
            (hp.rank, in_features),
            "lora_A.weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let lora_b = vb.get_with_hints((out_features, hp.rank), "lora_B.weight", candle_nn::init::ZERO)?;
        Ok(Self {
            base,
            lora_a: Linear::new(lora_a, None),
            lora_b: Linear::new(lora_b, None),
            scaling: hp.scaling(),
            merged: false,
        })
    }

    /// Fold the adapter delta into the base weight and drop out of the
    /// bypass path.
    pub fn merge(&mut self) -> Result<()> {
        if self.merged {
            return Ok(());
        }
        let merged = merge_delta(
            self.base.weight(),
            self.lora_a.weight(),
            self.lora_b.weight(),
            self.scaling,
        )?;
        self.base = Linear::new(merged, self.base.bias().cloned());
        self.merged = true;
        Ok(())
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn weight(&self) -> &Tensor {
        self.base.weight()
    }

    pub fn num_adapter_parameters(&self) -> usize {
        self.lora_a.weight().elem_count() + self.lora_b.weight().elem_count()
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let base_out = self.base.forward(x)?;
        if self.merged {
            return Ok(base_out);
        }
        // Adapter matrices stay F32 even when the base model is F16.
        let x = x.to_dtype(self.lora_a.weight().dtype())?;
        let lora_out = self
            .lora_a
            .forward(&x)?
            .apply(&self.lora_b)?
            .affine(self.scaling, 0.0)?
            .to_dtype(base_out.dtype())?;
        base_out + lora_out
    }
}

/// `W' = W + (B·A) · scaling`, computed in F32 and cast back to the base
/// dtype.
pub fn merge_delta(base: &Tensor, lora_a: &Tensor, lora_b: &Tensor, scaling: f64) -> Result<Tensor> {
    let dtype = base.dtype();
    let delta = lora_b
        .to_dtype(DType::F32)?
        .matmul(&lora_a.to_dtype(DType::F32)?)?
        .affine(scaling, 0.0)?;
    let merged = (base.to_dtype(DType::F32)? + delta)?;
    Ok(merged.to_dtype(dtype)?)
}

/// `adapter_config.json`, PEFT-shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_model_name_or_path: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    pub peft_type: String,
    pub task_type: String,
}

impl AdapterConfig {
    pub fn new(base_model: &str, hp: &LoraHyperparams) -> Self {
        Self {
            base_model_name_or_path: base_model.to_string(),
            r: hp.rank,
            lora_alpha: hp.alpha,
            lora_dropout: hp.dropout,
            target_modules: hp.target_modules.clone(),
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
        }
    }

    pub fn hyperparams(&self) -> LoraHyperparams {
        LoraHyperparams {
            rank: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
        }
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Whether a path looks like an adapter directory rather than a full model.
pub fn is_adapter_dir(path: &Path) -> bool {
    path.join(ADAPTER_CONFIG_FILE).exists()
}

/// Key of one adapter matrix in the saved safetensors (PEFT layout), e.g.
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`.
pub fn adapter_key(layer_idx: usize, module: &str, matrix: &str) -> String {
    format!("{ADAPTER_KEY_PREFIX}model.layers.{layer_idx}.self_attn.{module}.{matrix}.weight")
}

/// A trained adapter loaded back from disk.
#[derive(Debug)]
pub struct AdapterArtifact {
    pub config: AdapterConfig,
    pub tensors: HashMap<String, Tensor>,
}

impl AdapterArtifact {
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config = AdapterConfig::load(dir)?;
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.exists() {
            return Err(anyhow!("adapter weights not found: {}", weights_path.display()));
        }
        let tensors = candle_core::safetensors::load(&weights_path, device)?;
        debug!("Loaded {} adapter tensors from {}", tensors.len(), dir.display());
        Ok(Self { config, tensors })
    }

    /// A/B pair for a base-model weight key, when that projection is adapted.
    /// `model.layers.0.self_attn.q_proj.weight` looks up the matching
    /// `…lora_A.weight` / `…lora_B.weight` entries.
    pub fn delta_for(&self, base_key: &str) -> Option<(&Tensor, &Tensor)> {
        let prefix = base_key.strip_suffix(".weight")?;
        let a = self
            .tensors
            .get(&format!("{ADAPTER_KEY_PREFIX}{prefix}.lora_A.weight"))?;
        let b = self
            .tensors
            .get(&format!("{ADAPTER_KEY_PREFIX}{prefix}.lora_B.weight"))?;
        Some((a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn default_hyperparams_match_training_constants() {
        let hp = LoraHyperparams::default();
        assert_eq!(hp.rank, 8);
        assert_eq!(hp.alpha, 16.0);
        assert_eq!(hp.dropout, 0.05);
        assert_eq!(hp.target_modules, ["q_proj", "k_proj", "v_proj", "o_proj"]);
        assert_eq!(hp.scaling(), 2.0);
        assert!(hp.targets("q_proj"));
        assert!(!hp.targets("gate_proj"));
    }

    #[test]
    fn merge_delta_is_w_plus_scaled_ba() {
        let device = Device::Cpu;
        let base = Tensor::from_slice(&[1f32, 0.0, 0.0, 1.0], (2, 2), &device).unwrap();
        let a = Tensor::from_slice(&[1f32, 0.0], (1, 2), &device).unwrap();
        let b = Tensor::from_slice(&[0f32, 1.0], (2, 1), &device).unwrap();
        // B·A = [[0, 0], [1, 0]], scaling 2 -> delta [[0, 0], [2, 0]]
        let merged = merge_delta(&base, &a, &b, 2.0).unwrap();
        let values = merged.to_vec2::<f32>().unwrap();
        assert_eq!(values, vec![vec![1.0, 0.0], vec![2.0, 1.0]]);
    }

    #[test]
    fn zero_b_matrix_merge_is_identity() {
        let device = Device::Cpu;
        let base = Tensor::from_slice(&[3f32, 1.0, 4.0, 1.0], (2, 2), &device).unwrap();
        let a = Tensor::from_slice(&[1f32, 2.0], (1, 2), &device).unwrap();
        let b = Tensor::zeros((2, 1), DType::F32, &device).unwrap();
        let merged = merge_delta(&base, &a, &b, 2.0).unwrap();
        assert_eq!(
            merged.to_vec2::<f32>().unwrap(),
            base.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn adapter_key_layout() {
        assert_eq!(
            adapter_key(3, "q_proj", "lora_A"),
            "base_model.model.model.layers.3.self_attn.q_proj.lora_A.weight"
        );
    }

    #[test]
    fn delta_for_resolves_target_projections() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        let a = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let b = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        tensors.insert(adapter_key(0, "q_proj", "lora_A"), a);
        tensors.insert(adapter_key(0, "q_proj", "lora_B"), b);
        let artifact = AdapterArtifact {
            config: AdapterConfig::new("base", &LoraHyperparams::default()),
            tensors,
        };
        assert!(artifact
            .delta_for("model.layers.0.self_attn.q_proj.weight")
            .is_some());
        assert!(artifact
            .delta_for("model.layers.0.self_attn.k_proj.weight")
            .is_none());
        assert!(artifact.delta_for("model.norm.weight").is_none());
    }

    #[test]
    fn adapter_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig::new("some/base", &LoraHyperparams::default());
        config.save(dir.path()).unwrap();
        assert!(is_adapter_dir(dir.path()));
        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.base_model_name_or_path, "some/base");
        assert_eq!(loaded.hyperparams(), LoraHyperparams::default());
    }
}
