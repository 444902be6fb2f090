// SPDX-License-Identifier: GPL-3.0-only

//! daltocam - live camera preview through a color vision deficiency filter
//!
//! Frames from a capture device are rendered on a dedicated thread through a
//! GPU shader filter and handed to a consumer as pooled preview buffers.
//!
//! # Architecture
//!
//! - [`backends`]: capture sources (GStreamer, synthetic test pattern) and
//!   device selection
//! - [`gpu`]: the explicit GPU context used for every GPU call
//! - [`shaders`]: program building, the filter capability and the color
//!   vision filter
//! - [`pipeline`]: the capture pipeline, its delegate, buffer pool and
//!   orientation transforms
//! - [`config`]: persisted user configuration
//!
//! # Example
//!
//! ```ignore
//! let pipeline = CapturePipeline::new(
//!     Box::new(GstCaptureSource::new()?),
//!     gpu::wgpu_factory(true),
//!     PipelineConfig::default(),
//! );
//! pipeline.set_delegate(Arc::downgrade(&delegate) as _, Arc::new(SerialQueue::new("preview")?));
//! pipeline.select_device(&device);
//! pipeline.start_running()?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod gpu;
pub mod pipeline;
pub mod shaders;

// Re-export commonly used types
pub use backends::camera::{CaptureSource, Device, DevicePosition, FrameBuffer, VideoOrientation};
pub use config::Config;
pub use errors::{BuildError, CaptureError, GpuError, PipelineError, PipelineResult};
pub use pipeline::{
    AffineTransform, CallbackQueue, CapturePipeline, CapturePipelineDelegate, PipelineConfig,
    PipelineState, PreviewBuffer, SerialQueue,
};
pub use shaders::{
    ColorVisionFilter, Filter, FilterPreferences, ShaderFilter, Simulation, VisionType,
};
