use clap::Args;
use std::path::PathBuf;

use crate::backend::Capabilities;
use crate::cli::{logging, CliResult};
use crate::hardware::ComputeProfile;
use crate::infer::InferenceEngine;

#[derive(Args, Debug)]
pub struct TestCommand {
    /// Path to the artifact under test (adapter or merged model)
    #[arg(long = "model-path", default_value = "/app/models/lora_adapter")]
    pub model_path: PathBuf,

    /// Base model, used when the adapter is attached without merging
    #[arg(long = "base-model", default_value = "unsloth/Llama-3.2-1B-Instruct")]
    pub base_model: String,

    /// Prompt to send to the model
    #[arg(long = "prompt", default_value = "¿Qué es fine-tuning?")]
    pub prompt: String,
}

pub async fn execute(cmd: TestCommand) -> CliResult<()> {
    logging::banner("Model Test");

    let profile = ComputeProfile::detect();
    let caps = Capabilities::detect();
    let engine = InferenceEngine::load(&cmd.model_path, &cmd.base_model, &profile, &caps)?;

    println!("\nPrompt: {}", cmd.prompt);
    println!("{}", "-".repeat(40));

    let reply = engine.generate(&cmd.prompt)?;
    println!("Response:\n{reply}");
    Ok(())
}
