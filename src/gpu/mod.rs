// SPDX-License-Identifier: GPL-3.0-only

//! Explicit GPU context abstraction
//!
//! Every GPU operation in the crate goes through a [`GpuContext`] handle that is
//! passed explicitly. The render thread owns exactly one context for its whole
//! lifetime; nothing relies on an ambient "current" context.
//!
//! The object model is shader/program shaped (create, compile, attach, link,
//! validate, query locations) so that the program builder can report
//! diagnostics per stage. Two implementations exist:
//!
//! - [`WgpuContext`]: the production context on wgpu, with WGSL sources
//!   compiled and reflected through naga
//! - [`RecordingContext`]: a headless test double that counts GPU calls and
//!   tracks live objects

pub mod recording;
pub mod reflect;
mod wgpu_context;

pub use recording::{GpuCallCounter, RecordingContext};
pub use wgpu_context::WgpuContext;

use crate::backends::camera::FrameBuffer;
use crate::errors::GpuError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub use wgpu;

/// Handle to a shader object inside a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub(crate) u32);

/// Handle to a program object inside a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub(crate) u32);

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shader#{}", self.0)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program#{}", self.0)
    }
}

/// Programmable pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// Outcome of a compile, link or validate step, with the diagnostic log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub success: bool,
    pub log: String,
}

impl StageStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            log: String::new(),
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
        }
    }
}

/// Value written to a uniform location
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Vec4([f32; 4]),
    /// Column-major 3x3 matrix
    Mat3([f32; 9]),
}

impl UniformValue {
    /// Bytes in uniform-buffer layout (mat3 columns padded to vec4)
    pub fn to_uniform_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Vec4(v) => bytemuck::cast_slice(v).to_vec(),
            UniformValue::Mat3(m) => {
                let padded: [f32; 12] = [
                    m[0], m[1], m[2], 0.0, //
                    m[3], m[4], m[5], 0.0, //
                    m[6], m[7], m[8], 0.0, //
                ];
                bytemuck::cast_slice(&padded).to_vec()
            }
        }
    }
}

/// An explicit rendering context
///
/// Object handles are only meaningful inside the context that created them.
/// Location queries return -1 for names the program does not use, which
/// callers must tolerate; `set_uniform` at location -1 is a no-op.
///
/// Contexts are created on the render thread but may be handed to another
/// thread between sessions, hence `Send`.
pub trait GpuContext: Send {
    /// Human-readable adapter/backend description
    fn description(&self) -> String;

    fn create_shader(&mut self, stage: ShaderStage) -> ShaderId;
    /// Concatenate `sources` and compile them for the shader's stage
    fn compile_shader(&mut self, shader: ShaderId, sources: &[&str]) -> StageStatus;
    fn delete_shader(&mut self, shader: ShaderId);

    fn create_program(&mut self) -> ProgramId;
    fn attach_shader(&mut self, program: ProgramId, shader: ShaderId);
    /// Request an attribute location; only effective before linking
    fn bind_attrib_location(&mut self, program: ProgramId, location: u32, name: &str);
    fn link_program(&mut self, program: ProgramId) -> StageStatus;
    fn validate_program(&mut self, program: ProgramId) -> StageStatus;
    fn uniform_location(&self, program: ProgramId, name: &str) -> i32;
    fn attrib_location(&self, program: ProgramId, name: &str) -> i32;
    fn delete_program(&mut self, program: ProgramId);

    /// Bind a linked program for subsequent uniform writes and draws
    fn use_program(&mut self, program: ProgramId);
    fn set_uniform(&mut self, location: i32, value: UniformValue);

    /// Upload a captured frame as the input texture
    fn upload_texture(&mut self, frame: &FrameBuffer) -> Result<(), GpuError>;
    /// Draw the bound program over the input texture and read the result
    /// back as tightly packed RGBA into `output`
    fn render_into(&mut self, width: u32, height: u32, output: &mut [u8]) -> Result<(), GpuError>;

    /// Number of shader and program objects currently alive
    fn live_objects(&self) -> usize;
}

/// Creates the render thread's context on that thread
///
/// Called once per capture session, so contexts never cross threads.
pub type GpuContextFactory = Box<dyn FnMut() -> Result<Box<dyn GpuContext>, GpuError> + Send>;

/// Factory for [`WgpuContext`]s
pub fn wgpu_factory(allow_fallback: bool) -> GpuContextFactory {
    Box::new(move || {
        let ctx = WgpuContext::new(allow_fallback)?;
        Ok(Box::new(ctx) as Box<dyn GpuContext>)
    })
}

/// Information about the created GPU device
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    /// Name of the GPU adapter
    pub adapter_name: String,
    /// Backend being used (Vulkan, Metal, GL, ...)
    pub backend: wgpu::Backend,
    /// Whether the adapter is a software rasterizer
    pub software: bool,
}

/// Create a wgpu device and queue for offscreen rendering.
///
/// Tries a hardware adapter first and falls back to a software adapter when
/// `allow_fallback` is set.
pub async fn create_render_device(
    label: &str,
    allow_fallback: bool,
) -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>, GpuDeviceInfo), GpuError> {
    info!(label = label, "Creating GPU device for rendering");

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = match instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
    {
        Ok(adapter) => adapter,
        Err(e) if allow_fallback => {
            debug!(error = %e, "No hardware adapter, trying fallback adapter");
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::LowPower,
                    compatible_surface: None,
                    force_fallback_adapter: true,
                })
                .await
                .map_err(|e| GpuError::NoAdapter(e.to_string()))?
        }
        Err(e) => return Err(GpuError::NoAdapter(e.to_string())),
    };

    let adapter_info = adapter.get_info();

    info!(
        adapter = %adapter_info.name,
        backend = ?adapter_info.backend,
        device_type = ?adapter_info.device_type,
        "GPU adapter selected for rendering"
    );

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some(label),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

    let info = GpuDeviceInfo {
        adapter_name: adapter_info.name.clone(),
        backend: adapter_info.backend,
        software: adapter_info.device_type == wgpu::DeviceType::Cpu,
    };

    Ok((Arc::new(device), Arc::new(queue), info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mat3_uniform_layout() {
        let bytes = UniformValue::Mat3([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0])
            .to_uniform_bytes();
        assert_eq!(bytes.len(), 48);
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(&floats[0..4], &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(&floats[8..12], &[7.0, 8.0, 9.0, 0.0]);
    }

    #[test]
    fn test_vec4_uniform_layout() {
        let bytes = UniformValue::Vec4([0.5; 4]).to_uniform_bytes();
        assert_eq!(bytes.len(), 16);
    }

    #[tokio::test]
    async fn test_create_render_device() {
        // This test requires a GPU, so it may be skipped in CI
        match create_render_device("test_device", true).await {
            Ok((device, queue, info)) => {
                println!("Created device: {:?}", info);
                assert!(!info.adapter_name.is_empty() || info.software);
                drop(queue);
                drop(device);
            }
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
            }
        }
    }
}
