//! Supervised fine-tuning loop over a frozen base model.
//!
//! The base weights are loaded once (optionally through the 4-bit path) and
//! never updated; only the adapter matrices are registered with the
//! optimizer. Examples are rendered with the artifact's prompt template,
//! tokenized, truncated, and consumed with a fixed gradient accumulation
//! factor. On completion only the adapter and tokenizer config are
//! persisted.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::data::records::InstructionRecord;
use crate::data::template::PromptTemplate;
use crate::hardware::ComputeProfile;
use crate::model::loader::{self, ModelFiles, TOKENIZER_FILE};
use crate::model::lora::{AdapterConfig, LoraHyperparams, ADAPTER_WEIGHTS_FILE};
use crate::model::{KvCache, LlamaModel};
use crate::train::config::TrainingConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub examples: usize,
    pub optimizer_steps: usize,
    pub final_loss: Option<f32>,
}

pub struct SftTrainer {
    model: LlamaModel,
    tokenizer: Tokenizer,
    template: PromptTemplate,
    files: ModelFiles,
    config: TrainingConfig,
    hyperparams: LoraHyperparams,
    lora_vars: VarMap,
    output_dir: PathBuf,
}

impl SftTrainer {
    pub fn new(
        base_model: &str,
        hyperparams: LoraHyperparams,
        config: TrainingConfig,
        profile: &ComputeProfile,
        output_dir: &Path,
    ) -> Result<Self> {
        let files = loader::resolve(base_model)?;
        let model_config = loader::load_model_config(&files)?;
        let tokenizer = loader::load_tokenizer(&files)?;
        let template = files
            .tokenizer_config
            .as_deref()
            .map_or(PromptTemplate::Plain, PromptTemplate::from_config_file);

        let weights = loader::load_weights(&files, profile)?;
        let total_params = loader::num_parameters(&weights);

        let lora_vars = VarMap::new();
        // Adapter matrices stay F32 regardless of the base dtype.
        let lora_vb = VarBuilder::from_varmap(&lora_vars, DType::F32, &profile.device);
        let model = LlamaModel::load(
            loader::var_builder(weights, profile),
            &model_config,
            Some((&hyperparams, lora_vb)),
        )?;

        let trainable = model.num_adapter_parameters();
        info!(
            "Trainable parameters: {} / {} ({:.2}%)",
            trainable,
            total_params + trainable,
            100.0 * trainable as f64 / (total_params + trainable) as f64
        );

        Ok(Self {
            model,
            tokenizer,
            template,
            files,
            config,
            hyperparams,
            lora_vars,
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    /// Run the fine-tuning loop and persist the adapter.
    pub fn train(&mut self, records: &[InstructionRecord]) -> Result<TrainingSummary> {
        let examples = self.prepare_examples(records)?;
        info!("Training on {} examples", examples.len());

        let mut optimizer = AdamW::new(
            self.lora_vars.all_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                ..Default::default()
            },
        )?;

        let group_size = self.config.examples_per_step().max(1);
        let steps_per_epoch = examples.len().div_ceil(group_size);
        let total_steps = steps_per_epoch * self.config.epochs;
        let progress = ProgressBar::new(total_steps as u64);
        progress.set_style(ProgressStyle::default_bar());

        let mut step = 0usize;
        let mut last_loss = None;
        for epoch in 0..self.config.epochs {
            for group in examples.chunks(group_size) {
                let loss = self.group_loss(group)?;
                optimizer.backward_step(&loss)?;
                step += 1;
                progress.inc(1);

                let loss_value = loss.to_scalar::<f32>()?;
                last_loss = Some(loss_value);
                if step % self.config.logging_steps == 0 {
                    info!(
                        "epoch {}/{} | step {} | loss {:.4}",
                        epoch + 1,
                        self.config.epochs,
                        step,
                        loss_value
                    );
                }
                if step % self.config.save_steps == 0 {
                    let checkpoint = self.output_dir.join(format!("checkpoint-{step}"));
                    self.save_adapter(&checkpoint)?;
                    debug!("Checkpoint written to {}", checkpoint.display());
                }
            }
        }
        progress.finish_and_clear();

        info!("Saving adapter to {}", self.output_dir.display());
        self.save_adapter(&self.output_dir)?;

        Ok(TrainingSummary {
            examples: examples.len(),
            optimizer_steps: step,
            final_loss: last_loss,
        })
    }

    /// Format, tokenize, and truncate the dataset. Sequences shorter than
    /// two tokens cannot produce a next-token target and are dropped.
    fn prepare_examples(&self, records: &[InstructionRecord]) -> Result<Vec<Vec<u32>>> {
        let mut examples = Vec::with_capacity(records.len());
        for record in records {
            let text = self
                .template
                .format_example(&record.instruction, &record.response);
            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|err| anyhow::anyhow!("tokenization failed: {err}"))?;
            let mut ids = encoding.get_ids().to_vec();
            ids.truncate(self.config.max_seq_length);
            if ids.len() >= 2 {
                examples.push(ids);
            }
        }
        Ok(examples)
    }

    /// Mean next-token loss over one accumulation group.
    fn group_loss(&self, group: &[Vec<u32>]) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for ids in group {
            let loss = self.example_loss(ids)?;
            total = Some(match total {
                Some(acc) => (acc + loss)?,
                None => loss,
            });
        }
        let total = total.context("empty accumulation group")?;
        Ok((total / group.len() as f64)?)
    }

    fn example_loss(&self, ids: &[u32]) -> Result<Tensor> {
        let len = ids.len();
        let device = self.model.device();
        let input = Tensor::new(&ids[..len - 1], device)?.unsqueeze(0)?;
        let targets = Tensor::new(&ids[1..], device)?;
        let logits = self
            .model
            .forward(&input, 0, &mut KvCache::disabled())?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }

    /// Persist adapter weights plus tokenizer config; the base model is
    /// never written.
    pub fn save_adapter(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let tensors: HashMap<String, Tensor> = {
            let data = self.lora_vars.data().lock().unwrap();
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        candle_core::safetensors::save(&tensors, dir.join(ADAPTER_WEIGHTS_FILE))?;

        AdapterConfig::new(&self.files.reference, &self.hyperparams).save(dir)?;

        std::fs::copy(&self.files.tokenizer, dir.join(TOKENIZER_FILE))?;
        if let Some(tokenizer_config) = &self.files.tokenizer_config {
            std::fs::copy(
                tokenizer_config,
                dir.join(crate::data::template::TOKENIZER_CONFIG_FILE),
            )?;
        }
        Ok(())
    }
}
