//! llama.cpp toolchain discovery and subprocess pipeline.
//!
//! Discovery order: the `LLAMA_CPP_DIR` override, then three fixed
//! well-known locations. A candidate counts only if it carries the
//! converter script. Subprocess invocations block until exit and capture
//! their output; the quantizer is built on demand with the checkout's own
//! build system.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use super::{ConvertError, QuantScheme};

pub const CONVERT_SCRIPT: &str = "convert_hf_to_gguf.py";
pub const QUANTIZE_BIN: &str = "llama-quantize";
pub const ENV_LLAMA_CPP_DIR: &str = "LLAMA_CPP_DIR";

#[derive(Debug, Clone)]
pub struct Toolchain {
    root: PathBuf,
    python: PathBuf,
}

impl Toolchain {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            python: PathBuf::from("python3"),
        }
    }

    /// Override the interpreter used for the converter script.
    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    /// Locate a llama.cpp checkout: environment override first, then the
    /// fixed candidates in order; the first directory containing the
    /// converter script wins.
    pub fn discover() -> Option<Self> {
        Self::discover_in(
            std::env::var_os(ENV_LLAMA_CPP_DIR).map(PathBuf::from),
            default_candidates(),
        )
    }

    pub fn discover_in(env_override: Option<PathBuf>, fixed: Vec<PathBuf>) -> Option<Self> {
        env_override
            .into_iter()
            .chain(fixed)
            .find(|dir| dir.join(CONVERT_SCRIPT).exists())
            .map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn convert_script(&self) -> PathBuf {
        self.root.join(CONVERT_SCRIPT)
    }

    pub fn quantize_binary(&self) -> PathBuf {
        self.root.join(QUANTIZE_BIN)
    }

    /// Run the converter script to produce an F16 GGUF file.
    pub fn convert_to_f16(&self, model_path: &Path, outfile: &Path) -> Result<(), ConvertError> {
        if let Some(parent) = outfile.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut command = Command::new(&self.python);
        command
            .arg(self.convert_script())
            .arg(model_path)
            .arg("--outfile")
            .arg(outfile)
            .arg("--outtype")
            .arg("f16");
        debug!("Running: {command:?}");
        let output = command.output()?;
        if !output.status.success() {
            return Err(ConvertError::ConverterFailed {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Locate the quantizer binary, attempting to build it when missing.
    /// `None` means the caller should degrade to the F16 artifact.
    pub fn ensure_quantizer(&self) -> Option<PathBuf> {
        let binary = self.quantize_binary();
        if !binary.exists() {
            info!("Building {QUANTIZE_BIN}...");
            let status = Command::new("make")
                .arg(QUANTIZE_BIN)
                .current_dir(&self.root)
                .status();
            if let Err(err) = status {
                warn!("Could not run make: {err}");
            }
        }
        binary.exists().then_some(binary)
    }

    /// Invoke the quantizer with positional arguments. Returns whether it
    /// succeeded; failures are reported but never fatal.
    pub fn quantize(
        &self,
        quantizer: &Path,
        input: &Path,
        output: &Path,
        scheme: QuantScheme,
    ) -> bool {
        let result = Command::new(quantizer)
            .arg(input)
            .arg(output)
            .arg(scheme.quantizer_arg())
            .output();
        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    "Quantization error: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(err) => {
                warn!("Failed to run {QUANTIZE_BIN}: {err}");
                false
            }
        }
    }
}

fn default_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/opt/llama.cpp")];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(Path::new(&home).join("llama.cpp"));
    }
    candidates.push(PathBuf::from("./llama.cpp"));
    candidates
}

/// Intermediate F16 path alongside the requested output:
/// `model.gguf` becomes `model_f16.gguf`.
pub fn f16_temp_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model.gguf".to_string());
    let temp_name = match name.strip_suffix(".gguf") {
        Some(stem) => format!("{stem}_f16.gguf"),
        None => format!("{name}_f16.gguf"),
    };
    output.with_file_name(temp_name)
}
