//! Compiled-in backend capabilities.
//!
//! Optional acceleration paths are selected once from a capability probe
//! rather than re-checked at each call site. The fused loader/merger and the
//! native GGUF exporter are cargo features; the probe reports what this build
//! carries so that backend selection stays a pure, testable function.

/// Capabilities of the running build, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Fused weight loader: memory-mapped merge and merged-weight inference.
    pub fused: bool,
    /// Native GGUF exporter usable when no llama.cpp checkout is found.
    pub native_gguf: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Self {
            fused: cfg!(feature = "fused"),
            native_gguf: cfg!(feature = "gguf-native"),
        }
    }
}
