use clap::Args;
use std::path::PathBuf;
use tracing::info;

use crate::cli::{logging, CliResult};
use crate::data;
use crate::hardware::ComputeProfile;
use crate::model::LoraHyperparams;
use crate::train::{SftTrainer, TrainingConfig};

#[derive(Args, Debug)]
pub struct TrainCommand {
    /// Path to the CSV dataset, one example per row
    #[arg(long = "dataset")]
    pub dataset: PathBuf,

    /// Base model to fine-tune (hub id or local directory)
    #[arg(long = "base-model", default_value = "unsloth/Llama-3.2-1B-Instruct")]
    pub base_model: String,

    /// Directory for the trained adapter
    #[arg(long = "output-dir", default_value = "/app/models/lora_adapter")]
    pub output_dir: PathBuf,

    /// Maximum sequence length
    #[arg(long = "max-seq-length", default_value_t = 512)]
    pub max_seq_length: usize,

    /// Number of training epochs
    #[arg(long = "epochs", default_value_t = 3)]
    pub epochs: usize,

    /// Per-device batch size
    #[arg(long = "batch-size", default_value_t = 1)]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long = "learning-rate", default_value_t = 2e-4)]
    pub learning_rate: f64,
}

pub async fn execute(cmd: TrainCommand) -> CliResult<()> {
    logging::banner("LoRA Fine-Tuning");

    let profile = ComputeProfile::detect();

    let config = TrainingConfig {
        epochs: cmd.epochs,
        batch_size: cmd.batch_size,
        learning_rate: cmd.learning_rate,
        max_seq_length: cmd.max_seq_length,
        ..TrainingConfig::default()
    };

    info!("Loading model: {}", cmd.base_model);
    let mut trainer = SftTrainer::new(
        &cmd.base_model,
        LoraHyperparams::default(),
        config,
        &profile,
        &cmd.output_dir,
    )?;

    info!("Loading dataset: {}", cmd.dataset.display());
    let records = data::load_csv(&cmd.dataset)?;

    let summary = trainer.train(&records)?;
    if let Some(loss) = summary.final_loss {
        info!(
            "Training finished: {} examples, {} steps, final loss {:.4}",
            summary.examples, summary.optimizer_steps, loss
        );
    }

    logging::success(&format!("Adapter saved to {}", cmd.output_dir.display()));
    logging::info("Next step: run `afinar merge`");
    Ok(())
}
