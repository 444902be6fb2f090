// SPDX-License-Identifier: GPL-3.0-only

//! Capture sources
//!
//! The pipeline does not own device enumeration; it only binds one device at
//! a time through a [`CaptureSource`] and pulls frames from it on the capture
//! thread.
//!
//! ```text
//! ┌─────────────────────┐
//! │   CapturePipeline   │  ← lifecycle, hot swap, frame delivery
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureSource trait │  ← attach / detach / next_frame
//! └──────────┬──────────┘
//!            │
//!       ┌────┴──────┐
//!       ▼           ▼
//!  ┌─────────┐ ┌─────────┐
//!  │GStreamer│ │Synthetic│
//!  └─────────┘ └─────────┘
//! ```

pub mod gst_source;
pub mod selection;
pub mod synthetic;
pub mod types;

pub use gst_source::{GstCaptureSource, enumerate_devices};
pub use selection::{DeviceParams, best_device, next_device};
pub use synthetic::SyntheticSource;
pub use types::*;

use crate::errors::CaptureError;
use std::time::Duration;

/// Acquisition subsystem seen from the capture thread
///
/// A source is created on the control side, then moved into the capture
/// thread which is its only user from that point on.
pub trait CaptureSource: Send {
    /// Bind `device`, replacing whatever was attached.
    ///
    /// On failure nothing is attached.
    fn attach(&mut self, device: &Device) -> Result<(), CaptureError>;

    /// Release the current device, if any
    fn detach(&mut self);

    /// Check that `device` can be attached without disturbing the current
    /// one. Passing is no guarantee that `attach` succeeds.
    fn check_device(&self, _device: &Device) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means no frame arrived in time; errors are session-level.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, CaptureError>;

    /// Currently attached device
    fn current_device(&self) -> Option<&Device>;
}

impl<T: CaptureSource + ?Sized> CaptureSource for Box<T> {
    fn attach(&mut self, device: &Device) -> Result<(), CaptureError> {
        (**self).attach(device)
    }

    fn detach(&mut self) {
        (**self).detach()
    }

    fn check_device(&self, device: &Device) -> Result<(), CaptureError> {
        (**self).check_device(device)
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, CaptureError> {
        (**self).next_frame(timeout)
    }

    fn current_device(&self) -> Option<&Device> {
        (**self).current_device()
    }
}
