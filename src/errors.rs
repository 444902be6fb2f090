// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture-to-render pipeline
//!
//! Errors are grouped by how far they propagate:
//! - frame-level ([`PipelineError::PoolExhausted`]) is signalled and absorbed
//! - build-level ([`BuildError`]) aborts filter activation
//! - session-level ([`PipelineError::Session`], [`PipelineError::Device`]) stops the pipeline

use crate::gpu::ShaderStage;
use std::fmt;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Top-level pipeline error
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Device selection or attach failure
    Device(CaptureError),
    /// Shader program could not be built
    Build(BuildError),
    /// No preview buffer was free for the current frame
    PoolExhausted,
    /// The capture session failed and the pipeline stopped
    Session(String),
    /// GPU context could not be created or stopped working
    Gpu(GpuError),
    /// Operation needs a running (or previously started) pipeline
    NotStarted,
}

/// Shader build errors, each carrying the compiler or linker log
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// A shader stage did not compile
    Compile { stage: ShaderStage, log: String },
    /// The program did not link
    Link { log: String },
    /// The program linked but failed validation (only fatal in strict mode)
    Validate { log: String },
}

/// Errors reported by the acquisition subsystem
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Requested device does not exist
    DeviceNotFound(String),
    /// Device exists but could not be attached
    AttachFailed(String),
    /// Device went away while capturing
    Disconnected,
    /// No device attached when one was required
    NoDevice,
    /// Backend failure (GStreamer bus error, etc.)
    Backend(String),
}

/// GPU context errors
#[derive(Debug, Clone, PartialEq)]
pub enum GpuError {
    /// No adapter matched the request
    NoAdapter(String),
    /// Adapter refused to create a device
    DeviceRequest(String),
    /// Nothing is bound with `use_program`, or the bound program is not linked
    NoProgram,
    /// Frame or target does not fit the uploaded texture
    InvalidFrame(String),
    /// Readback of the render target failed
    Readback(String),
    /// wgpu reported a validation error
    Validation(String),
}

/// Configuration and preference storage errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// File could not be read or written
    Io(String),
    /// File contents were not valid
    Parse(String),
    /// No per-user configuration directory on this platform
    NoConfigDir,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Device(e) => write!(f, "Device error: {}", e),
            PipelineError::Build(e) => write!(f, "Shader build error: {}", e),
            PipelineError::PoolExhausted => write!(f, "Preview buffer pool exhausted"),
            PipelineError::Session(msg) => write!(f, "Capture session failed: {}", msg),
            PipelineError::Gpu(e) => write!(f, "GPU error: {}", e),
            PipelineError::NotStarted => write!(f, "Pipeline has not been started"),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Compile { stage, log } => {
                write!(f, "failed to compile {} shader:\n{}", stage, log)
            }
            BuildError::Link { log } => write!(f, "failed to link program:\n{}", log),
            BuildError::Validate { log } => write!(f, "program failed validation:\n{}", log),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceNotFound(id) => write!(f, "Device not found: {}", id),
            CaptureError::AttachFailed(msg) => write!(f, "Failed to attach device: {}", msg),
            CaptureError::Disconnected => write!(f, "Device disconnected"),
            CaptureError::NoDevice => write!(f, "No capture device attached"),
            CaptureError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoAdapter(msg) => write!(f, "No suitable GPU adapter: {}", msg),
            GpuError::DeviceRequest(msg) => write!(f, "Failed to create GPU device: {}", msg),
            GpuError::NoProgram => write!(f, "No linked program is in use"),
            GpuError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            GpuError::Readback(msg) => write!(f, "Readback failed: {}", msg),
            GpuError::Validation(msg) => write!(f, "GPU validation error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for PipelineError {}
impl std::error::Error for BuildError {}
impl std::error::Error for CaptureError {}
impl std::error::Error for GpuError {}
impl std::error::Error for ConfigError {}

impl From<CaptureError> for PipelineError {
    fn from(err: CaptureError) -> Self {
        PipelineError::Device(err)
    }
}

impl From<BuildError> for PipelineError {
    fn from(err: BuildError) -> Self {
        PipelineError::Build(err)
    }
}

impl From<GpuError> for PipelineError {
    fn from(err: GpuError) -> Self {
        PipelineError::Gpu(err)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_carries_log() {
        let err = BuildError::Compile {
            stage: ShaderStage::Fragment,
            log: "expected ';'".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("fragment"));
        assert!(text.contains("expected ';'"));
    }

    #[test]
    fn test_conversions() {
        let err: PipelineError = CaptureError::Disconnected.into();
        assert_eq!(err, PipelineError::Device(CaptureError::Disconnected));

        let err: PipelineError = BuildError::Link {
            log: String::new(),
        }
        .into();
        assert!(matches!(err, PipelineError::Build(BuildError::Link { .. })));
    }
}
