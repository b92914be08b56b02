//! GGUF conversion.
//!
//! Turns a merged model directory into a single quantized GGUF file. The
//! preferred toolchain is an external llama.cpp checkout (converter script +
//! quantizer binary); without one, the native exporter writes GGUF directly.
//! Failure policy: the outer conversion fails hard, but a missing or failing
//! quantizer degrades to delivering the F16 artifact under the requested
//! output name.

pub mod toolchain;

#[cfg(feature = "gguf-native")]
pub mod native;

use clap::ValueEnum;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::Capabilities;
pub use toolchain::{f16_temp_path, Toolchain};

/// Quantization schemes accepted by the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QuantScheme {
    #[value(name = "f16")]
    F16,
    #[value(name = "f32")]
    F32,
    #[value(name = "q4_0")]
    Q4_0,
    #[value(name = "q4_1")]
    Q4_1,
    #[value(name = "q4_k_m")]
    Q4KM,
    #[value(name = "q4_k_s")]
    Q4KS,
    #[value(name = "q5_0")]
    Q5_0,
    #[value(name = "q5_1")]
    Q5_1,
    #[value(name = "q5_k_m")]
    Q5KM,
    #[value(name = "q6_k")]
    Q6K,
    #[value(name = "q8_0")]
    Q8_0,
}

impl QuantScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q4KM => "q4_k_m",
            Self::Q4KS => "q4_k_s",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q5KM => "q5_k_m",
            Self::Q6K => "q6_k",
            Self::Q8_0 => "q8_0",
        }
    }

    /// Positional argument the external quantizer expects.
    pub fn quantizer_arg(&self) -> String {
        self.as_str().to_uppercase()
    }

    pub fn is_f16(&self) -> bool {
        matches!(self, Self::F16)
    }
}

impl std::fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("converter exited with an error:\n{stderr}")]
    ConverterFailed { stderr: String },

    #[error("neither llama.cpp nor the native exporter is available")]
    NoToolchain,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convert a merged model to a quantized GGUF file.
pub fn run(
    model_path: &Path,
    output_path: &Path,
    scheme: QuantScheme,
    caps: Capabilities,
) -> Result<(), ConvertError> {
    run_with(Toolchain::discover(), model_path, output_path, scheme, caps)
}

/// Same as [`run`], with toolchain discovery already performed.
pub fn run_with(
    toolchain: Option<Toolchain>,
    model_path: &Path,
    output_path: &Path,
    scheme: QuantScheme,
    caps: Capabilities,
) -> Result<(), ConvertError> {
    match toolchain {
        Some(toolchain) => {
            info!("Using llama.cpp at: {}", toolchain.root().display());
            run_with_toolchain(&toolchain, model_path, output_path, scheme)
        }
        None => run_native(model_path, output_path, scheme, caps),
    }
}

pub fn run_with_toolchain(
    toolchain: &Toolchain,
    model_path: &Path,
    output_path: &Path,
    scheme: QuantScheme,
) -> Result<(), ConvertError> {
    let intermediate = f16_temp_path(output_path);
    toolchain.convert_to_f16(model_path, &intermediate)?;
    info!("Model converted to F16: {}", intermediate.display());

    if scheme.is_f16() {
        std::fs::rename(&intermediate, output_path)?;
        return Ok(());
    }

    match toolchain.ensure_quantizer() {
        Some(quantizer) => {
            info!("Quantizing to {scheme}...");
            if toolchain.quantize(&quantizer, &intermediate, output_path, scheme) {
                std::fs::remove_file(&intermediate)?;
                info!("Quantized model: {}", output_path.display());
            } else {
                // Deliver the F16 artifact rather than failing the run.
                warn!("Quantization failed, keeping the F16 artifact");
                std::fs::rename(&intermediate, output_path)?;
            }
        }
        None => {
            warn!("{} not available, using F16", toolchain::QUANTIZE_BIN);
            std::fs::rename(&intermediate, output_path)?;
        }
    }
    Ok(())
}

fn run_native(
    model_path: &Path,
    output_path: &Path,
    scheme: QuantScheme,
    caps: Capabilities,
) -> Result<(), ConvertError> {
    if !caps.native_gguf {
        return Err(ConvertError::NoToolchain);
    }
    #[cfg(feature = "gguf-native")]
    {
        info!("llama.cpp not found, using the native GGUF exporter");
        native::export(model_path, output_path, scheme)?;
        Ok(())
    }
    #[cfg(not(feature = "gguf-native"))]
    {
        let _ = (model_path, output_path, scheme);
        Err(ConvertError::NoToolchain)
    }
}
