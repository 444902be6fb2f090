// SPDX-License-Identifier: GPL-3.0-only
// Shared types for capture sources

//! Shared types for capture sources

use crate::errors::GpuError;
use gstreamer::buffer::{MappedBuffer, Readable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Frame pixel storage - either owned bytes or a zero-copy GStreamer buffer
///
/// The `Mapped` variant keeps the GStreamer buffer mapped and alive until all
/// references are dropped.
#[derive(Clone)]
pub enum FrameData {
    /// Owned bytes (synthetic sources, still images, tests)
    Copied(Arc<[u8]>),
    /// Mapped GStreamer buffer, reference counted
    Mapped(Arc<MappedBuffer<Readable>>),
}

impl FrameData {
    pub fn from_mapped_buffer(buffer: MappedBuffer<Readable>) -> Self {
        FrameData::Mapped(Arc::new(buffer))
    }

    pub fn len(&self) -> usize {
        match self {
            FrameData::Copied(data) => data.len(),
            FrameData::Mapped(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for FrameData {
    fn from(data: Vec<u8>) -> Self {
        FrameData::Copied(Arc::from(data.into_boxed_slice()))
    }
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameData::Copied(data) => write!(f, "FrameData::Copied({} bytes)", data.len()),
            FrameData::Mapped(buf) => write!(f, "FrameData::Mapped({} bytes)", buf.len()),
        }
    }
}

impl AsRef<[u8]> for FrameData {
    fn as_ref(&self) -> &[u8] {
        match self {
            FrameData::Copied(data) => data.as_ref(),
            FrameData::Mapped(buf) => buf.as_slice(),
        }
    }
}

impl std::ops::Deref for FrameData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_ref()
    }
}

/// Where a device sits relative to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DevicePosition {
    /// Facing the user; previews are usually mirrored
    Front,
    /// Facing away from the user
    Back,
    /// USB webcams and anything else without a fixed mounting
    #[default]
    External,
}

impl DevicePosition {
    /// Parse a location string as reported by libcamera/PipeWire ("front", "back", ...)
    pub fn from_location(location: &str) -> Self {
        match location.trim().to_ascii_lowercase().as_str() {
            "front" => DevicePosition::Front,
            "back" | "rear" => DevicePosition::Back,
            _ => DevicePosition::External,
        }
    }
}

impl std::fmt::Display for DevicePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevicePosition::Front => write!(f, "front"),
            DevicePosition::Back => write!(f, "back"),
            DevicePosition::External => write!(f, "external"),
        }
    }
}

/// Orientation of a video buffer or of the display it is shown on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VideoOrientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl VideoOrientation {
    pub const ALL: [VideoOrientation; 4] = [
        VideoOrientation::Portrait,
        VideoOrientation::PortraitUpsideDown,
        VideoOrientation::LandscapeRight,
        VideoOrientation::LandscapeLeft,
    ];

    /// Orientation of a buffer whose content is rotated clockwise by `degrees`
    /// (sensor mounting rotation, normalised to 0-360)
    pub fn from_rotation_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => VideoOrientation::LandscapeRight,
            180 => VideoOrientation::PortraitUpsideDown,
            270 => VideoOrientation::LandscapeLeft,
            _ => VideoOrientation::Portrait,
        }
    }

    pub fn is_portrait(&self) -> bool {
        matches!(
            self,
            VideoOrientation::Portrait | VideoOrientation::PortraitUpsideDown
        )
    }
}

impl std::fmt::Display for VideoOrientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoOrientation::Portrait => write!(f, "portrait"),
            VideoOrientation::PortraitUpsideDown => write!(f, "portrait-upside-down"),
            VideoOrientation::LandscapeRight => write!(f, "landscape-right"),
            VideoOrientation::LandscapeLeft => write!(f, "landscape-left"),
        }
    }
}

/// Pixel dimensions of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An addressable capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity (V4L2 path, PipeWire node id, `synthetic:N`, ...)
    pub id: String,
    pub name: String,
    pub position: DevicePosition,
    /// Orientation of the buffers this device produces
    pub native_orientation: VideoOrientation,
    /// Preferred capture size, when the backend reports one
    pub dimensions: Option<Dimensions>,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.id, self.position)
    }
}

/// A captured RGBA frame
///
/// Transiently owned by the capture thread and never retained past one
/// frame's processing; cloning only bumps the data reference count.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: FrameData,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`
    pub stride: u32,
    /// Presentation timestamp
    pub timestamp: Duration,
    pub orientation: VideoOrientation,
}

impl FrameBuffer {
    /// Frame over tightly packed RGBA bytes
    pub fn from_rgba(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: Duration,
        orientation: VideoOrientation,
    ) -> Self {
        Self {
            data: FrameData::from(data),
            width,
            height,
            stride: width * 4,
            timestamp,
            orientation,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Size in bytes of the same frame without row padding
    pub fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Check that stride and data length describe a complete RGBA frame
    pub fn check_layout(&self) -> Result<(), GpuError> {
        if self.width == 0 || self.height == 0 {
            return Err(GpuError::InvalidFrame("empty frame".to_string()));
        }
        if self.stride < self.width * 4 {
            return Err(GpuError::InvalidFrame(format!(
                "stride {} is shorter than a {} pixel row",
                self.stride, self.width
            )));
        }
        let needed = self.stride as usize * (self.height as usize - 1) + self.width as usize * 4;
        if self.data.len() < needed {
            return Err(GpuError::InvalidFrame(format!(
                "{} bytes for a {}x{} frame with stride {}",
                self.data.len(),
                self.width,
                self.height,
                self.stride
            )));
        }
        Ok(())
    }

    /// Copy the frame into `out` without row padding
    pub fn copy_packed_into(&self, out: &mut [u8]) -> Result<(), GpuError> {
        self.check_layout()?;
        let row = self.width as usize * 4;
        if out.len() != self.packed_len() {
            return Err(GpuError::InvalidFrame(format!(
                "destination holds {} bytes, frame needs {}",
                out.len(),
                self.packed_len()
            )));
        }
        if self.stride as usize == row {
            out.copy_from_slice(&self.data[..out.len()]);
        } else {
            for (y, dst) in out.chunks_exact_mut(row).enumerate() {
                let start = y * self.stride as usize;
                dst.copy_from_slice(&self.data[start..start + row]);
            }
        }
        Ok(())
    }

    /// Frame contents as tightly packed RGBA
    pub fn packed_rgba(&self) -> Result<Vec<u8>, GpuError> {
        let mut out = vec![0u8; self.packed_len()];
        self.copy_packed_into(&mut out)?;
        Ok(out)
    }
}
