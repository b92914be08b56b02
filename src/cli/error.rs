use colored::*;
use std::path::PathBuf;
use thiserror::Error;

use crate::convert::ConvertError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(PathBuf),

    #[error("Model not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Adapter not found: {0}")]
    AdapterNotFound(PathBuf),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("No usable GGUF toolchain")]
    ToolchainUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message
    pub fn print_error(&self) {
        match self {
            // Propagated library errors keep their full context chain.
            CliError::Other(err) => {
                eprintln!("{} {:#}", "Error:".red().bold(), err);
            }
            _ => {
                eprintln!("{} {}", "Error:".red().bold(), self);
            }
        }

        // Add helpful suggestions based on error type
        match self {
            CliError::DatasetNotFound(path) => {
                eprintln!(
                    "\n{} Make sure the dataset file exists: {}",
                    "Hint:".yellow(),
                    path.display().to_string().cyan()
                );
            }
            CliError::ModelNotFound(_) => {
                eprintln!(
                    "\n{} Run {} first to produce the merged model",
                    "Hint:".yellow(),
                    "afinar merge".cyan()
                );
            }
            CliError::AdapterNotFound(_) => {
                eprintln!(
                    "\n{} Run {} first to produce the adapter",
                    "Hint:".yellow(),
                    "afinar train".cyan()
                );
            }
            CliError::ToolchainUnavailable => {
                eprintln!(
                    "\n{} Install llama.cpp (set {}) or build with the {} feature",
                    "Hint:".yellow(),
                    "LLAMA_CPP_DIR".cyan(),
                    "gguf-native".cyan()
                );
            }
            _ => {}
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<ConvertError> for CliError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::NoToolchain => CliError::ToolchainUnavailable,
            ConvertError::ConverterFailed { .. } => CliError::Conversion(err.to_string()),
            ConvertError::Io(err) => CliError::Io(err),
            ConvertError::Other(err) => CliError::Other(err),
        }
    }
}
