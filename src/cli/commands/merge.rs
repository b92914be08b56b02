use clap::Args;
use std::path::PathBuf;

use crate::cli::{logging, CliResult};
use crate::hardware::ComputeProfile;
use crate::merge;

#[derive(Args, Debug)]
pub struct MergeCommand {
    /// Original base model (hub id or local directory)
    #[arg(long = "base-model", default_value = "unsloth/Llama-3.2-1B-Instruct")]
    pub base_model: String,

    /// Path to the trained adapter
    #[arg(long = "lora-path", default_value = "/app/models/lora_adapter")]
    pub lora_path: PathBuf,

    /// Directory for the merged model
    #[arg(long = "output-dir", default_value = "/app/models/merged")]
    pub output_dir: PathBuf,
}

pub async fn execute(cmd: MergeCommand) -> CliResult<()> {
    logging::banner("Adapter Merge");

    let profile = ComputeProfile::detect();
    merge::run(&cmd.base_model, &cmd.lora_path, &cmd.output_dir, &profile)?;

    logging::success(&format!(
        "Merged model saved to {}",
        cmd.output_dir.display()
    ));
    logging::info("Next step: run `afinar convert` to produce a GGUF file");
    Ok(())
}
