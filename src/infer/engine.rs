//! Prompt testing against a trained artifact.
//!
//! Loads an adapter or merged-model directory, renders one prompt through
//! the artifact's template, runs bounded sampled generation, and extracts
//! the assistant reply from the decoded output. The optimized path folds an
//! adapter into the base weights at load time; the generic path attaches it
//! unmerged over the `--base-model` reference.

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

use super::extract::extract_reply;
use crate::backend::Capabilities;
use crate::data::template::{PromptTemplate, TOKENIZER_CONFIG_FILE};
use crate::hardware::ComputeProfile;
use crate::model::loader::{self, ModelFiles, TOKENIZER_FILE};
use crate::model::lora::{is_adapter_dir, AdapterArtifact};
use crate::model::{KvCache, LlamaModel, ModelConfig};

/// Artifact loading path, first available wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBackend {
    Optimized,
    Generic,
}

impl TestBackend {
    pub fn select(caps: &Capabilities) -> Self {
        if caps.fused {
            Self::Optimized
        } else {
            Self::Generic
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_new_tokens: 256,
            seed: rand::random(),
        }
    }
}

pub struct InferenceEngine {
    model: LlamaModel,
    tokenizer: Tokenizer,
    template: PromptTemplate,
    eos_ids: Vec<u32>,
    config: GenerationConfig,
}

impl InferenceEngine {
    pub fn load(
        artifact: &Path,
        base_model: &str,
        profile: &ComputeProfile,
        caps: &Capabilities,
    ) -> Result<Self> {
        match TestBackend::select(caps) {
            TestBackend::Optimized => Self::load_optimized(artifact, profile),
            TestBackend::Generic => Self::load_generic(artifact, base_model, profile),
        }
    }

    /// Resolve the base reference from the artifact itself and fold any
    /// adapter into the weights for inference.
    fn load_optimized(artifact: &Path, profile: &ComputeProfile) -> Result<Self> {
        if is_adapter_dir(artifact) {
            let adapter = AdapterArtifact::load(artifact, &profile.device)?;
            let base = adapter.config.base_model_name_or_path.clone();
            info!("Loading adapter {} over {base}", artifact.display());

            let files = loader::resolve(&base)?;
            let model_config = loader::load_model_config(&files)?;
            let hyperparams = adapter.config.hyperparams();
            let lora_vb =
                VarBuilder::from_tensors(adapter.tensors.clone(), DType::F32, &profile.device);
            let weights = loader::load_weights(&files, profile)?;
            let mut model = LlamaModel::load(
                loader::var_builder(weights, profile),
                &model_config,
                Some((&hyperparams, lora_vb)),
            )?;
            model.merge_adapter()?;

            let tokenizer = artifact_tokenizer(artifact, &files)?;
            let template = resolve_template(artifact, &files);
            Ok(Self::assemble(model, model_config, tokenizer, template))
        } else {
            info!("Loading model: {}", artifact.display());
            let files = loader::resolve(path_str(artifact)?)?;
            let model_config = loader::load_model_config(&files)?;
            let weights = loader::load_weights(&files, profile)?;
            let model =
                LlamaModel::load(loader::var_builder(weights, profile), &model_config, None)?;
            let tokenizer = loader::load_tokenizer(&files)?;
            let template = resolve_template(artifact, &files);
            Ok(Self::assemble(model, model_config, tokenizer, template))
        }
    }

    /// Load the given base model and attach the adapter without merging.
    fn load_generic(artifact: &Path, base_model: &str, profile: &ComputeProfile) -> Result<Self> {
        if is_adapter_dir(artifact) {
            info!("Loading base model: {base_model}");
            let files = loader::resolve(base_model)?;
            let model_config = loader::load_model_config(&files)?;
            info!("Loading adapter: {}", artifact.display());
            let adapter = AdapterArtifact::load(artifact, &profile.device)?;
            let hyperparams = adapter.config.hyperparams();
            let lora_vb =
                VarBuilder::from_tensors(adapter.tensors.clone(), DType::F32, &profile.device);
            let weights = loader::load_weights(&files, profile)?;
            let model = LlamaModel::load(
                loader::var_builder(weights, profile),
                &model_config,
                Some((&hyperparams, lora_vb)),
            )?;
            let tokenizer = loader::load_tokenizer(&files)?;
            let template = resolve_template(artifact, &files);
            Ok(Self::assemble(model, model_config, tokenizer, template))
        } else {
            info!("Loading model: {}", artifact.display());
            let files = loader::resolve(path_str(artifact)?)?;
            let model_config = loader::load_model_config(&files)?;
            let weights = loader::load_weights(&files, profile)?;
            let model =
                LlamaModel::load(loader::var_builder(weights, profile), &model_config, None)?;
            let tokenizer = loader::load_tokenizer(&files)?;
            let template = resolve_template(artifact, &files);
            Ok(Self::assemble(model, model_config, tokenizer, template))
        }
    }

    fn assemble(
        model: LlamaModel,
        model_config: ModelConfig,
        tokenizer: Tokenizer,
        template: PromptTemplate,
    ) -> Self {
        let mut eos_ids = model_config.eos_ids();
        if eos_ids.is_empty() {
            if let Some(id) = tokenizer.token_to_id("</s>") {
                eos_ids.push(id);
            }
        }
        Self {
            model,
            tokenizer,
            template,
            eos_ids,
            config: GenerationConfig::default(),
        }
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Generate a reply for one prompt.
    pub fn generate(&self, prompt: &str) -> Result<String> {
        let input_text = self.template.format_prompt(prompt);
        let encoding = self
            .tokenizer
            .encode(input_text, true)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            bail!("prompt produced no tokens");
        }

        let mut processor = LogitsProcessor::from_sampling(
            self.config.seed,
            Sampling::TopP {
                p: self.config.top_p,
                temperature: self.config.temperature,
            },
        );

        let device = self.model.device();
        let mut cache = KvCache::new(self.model.num_layers());
        let mut index_pos = 0usize;
        for index in 0..self.config.max_new_tokens {
            let context = if index > 0 {
                &tokens[tokens.len() - 1..]
            } else {
                &tokens[..]
            };
            let input = Tensor::new(context, device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos, &mut cache)?;
            let logits = logits
                .i((0, context.len() - 1, ..))?
                .to_dtype(DType::F32)?;
            index_pos += context.len();

            let next = processor.sample(&logits)?;
            tokens.push(next);
            if self.eos_ids.contains(&next) {
                break;
            }
        }

        let decoded = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|err| anyhow!("decoding failed: {err}"))?;
        Ok(extract_reply(&decoded))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("invalid path: {}", path.display()))
}

/// Tokenizer persisted with the adapter wins over the base model's.
fn artifact_tokenizer(artifact: &Path, files: &ModelFiles) -> Result<Tokenizer> {
    let local = artifact.join(TOKENIZER_FILE);
    if local.exists() {
        Tokenizer::from_file(&local)
            .map_err(|err| anyhow!("failed to load tokenizer {}: {err}", local.display()))
    } else {
        loader::load_tokenizer(files)
    }
}

fn resolve_template(artifact: &Path, files: &ModelFiles) -> PromptTemplate {
    if artifact.join(TOKENIZER_CONFIG_FILE).exists() {
        PromptTemplate::from_artifact(artifact)
    } else {
        files
            .tokenizer_config
            .as_deref()
            .map_or(PromptTemplate::Plain, PromptTemplate::from_config_file)
    }
}
