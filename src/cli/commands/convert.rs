use clap::Args;
use std::path::PathBuf;
use tracing::info;

use crate::backend::Capabilities;
use crate::cli::error::CliError;
use crate::cli::{logging, CliResult};
use crate::convert::{self, QuantScheme};

#[derive(Args, Debug)]
pub struct ConvertCommand {
    /// Path to the merged model directory
    #[arg(long = "model-path", default_value = "/app/models/merged")]
    pub model_path: PathBuf,

    /// Output path for the GGUF file
    #[arg(long = "output-path", default_value = "/app/models/gguf/model.gguf")]
    pub output_path: PathBuf,

    /// Quantization scheme
    #[arg(long = "quantization", value_enum, default_value = "q4_k_m")]
    pub quantization: QuantScheme,
}

pub async fn execute(cmd: ConvertCommand) -> CliResult<()> {
    logging::banner("GGUF Conversion");

    info!("Source model: {}", cmd.model_path.display());
    info!("Destination: {}", cmd.output_path.display());
    info!("Quantization: {}", cmd.quantization);

    // Artifact existence is the only precondition; content is the
    // converter's problem.
    if !cmd.model_path.exists() {
        return Err(CliError::ModelNotFound(cmd.model_path));
    }

    let caps = Capabilities::detect();
    convert::run(&cmd.model_path, &cmd.output_path, cmd.quantization, caps)?;

    logging::success(&format!("GGUF file: {}", cmd.output_path.display()));
    logging::info("The model is ready to deploy with llama.cpp or Ollama");
    Ok(())
}
