// SPDX-License-Identifier: GPL-3.0-only

//! Deterministic test-pattern capture source
//!
//! Produces SMPTE-style colour bars at a fixed rate. Used by the CLI's
//! `--synthetic` flag on machines without a camera and by the pipeline tests,
//! which script frame limits and session failures through the builder methods.

use super::CaptureSource;
use super::types::*;
use crate::errors::CaptureError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 75% colour bars, left to right
const BARS: [[u8; 4]; 8] = [
    [191, 191, 191, 255],
    [191, 191, 0, 255],
    [0, 191, 191, 255],
    [0, 191, 0, 255],
    [191, 0, 191, 255],
    [191, 0, 0, 255],
    [0, 0, 191, 255],
    [0, 0, 0, 255],
];

/// Test-pattern source over a fixed device set
pub struct SyntheticSource {
    devices: Vec<Device>,
    device: Option<Device>,
    frame_interval: Duration,
    paced: bool,
    frame_limit: Option<u64>,
    fail_after: Option<u64>,
    frames: u64,
    next_due: Option<Instant>,
    attached: Arc<Mutex<Vec<String>>>,
}

impl SyntheticSource {
    /// Source over `devices`; attaching any other id fails
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            device: None,
            frame_interval: Duration::from_secs(1) / 30,
            paced: true,
            frame_limit: None,
            fail_after: None,
            frames: 0,
            next_due: None,
            attached: Arc::default(),
        }
    }

    /// A back camera at 640x480 and a front camera at 320x240
    pub fn default_devices() -> Vec<Device> {
        vec![
            Device {
                id: "synthetic:0".to_string(),
                name: "Synthetic Back Camera".to_string(),
                position: DevicePosition::Back,
                native_orientation: VideoOrientation::LandscapeRight,
                dimensions: Some(Dimensions::new(640, 480)),
            },
            Device {
                id: "synthetic:1".to_string(),
                name: "Synthetic Front Camera".to_string(),
                position: DevicePosition::Front,
                native_orientation: VideoOrientation::LandscapeRight,
                dimensions: Some(Dimensions::new(320, 240)),
            },
        ]
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_interval = Duration::from_secs(1) / fps.max(1);
        self
    }

    /// Deliver frames as fast as they are pulled
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Stop producing frames after `frames` (the session stays healthy)
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Fail the session with `Disconnected` after `frames`
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Ids of every successful attach, in order, shared with the source
    pub fn attach_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.attached)
    }

    /// RGBA color bars of frame `offset`, scrolled one pixel per frame
    pub fn pattern(width: u32, height: u32, offset: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        let bar_width = (width / BARS.len() as u32).max(1);
        for _ in 0..height {
            for x in 0..width {
                let shifted = (x as u64 + offset) % width.max(1) as u64;
                let bar = ((shifted as u32 / bar_width) as usize).min(BARS.len() - 1);
                data.extend_from_slice(&BARS[bar]);
            }
        }
        data
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(Self::default_devices())
    }
}

impl CaptureSource for SyntheticSource {
    fn check_device(&self, device: &Device) -> Result<(), CaptureError> {
        if self.devices.iter().any(|d| d.id == device.id) {
            Ok(())
        } else {
            Err(CaptureError::DeviceNotFound(device.id.clone()))
        }
    }

    fn attach(&mut self, device: &Device) -> Result<(), CaptureError> {
        let Some(known) = self.devices.iter().find(|d| d.id == device.id) else {
            return Err(CaptureError::DeviceNotFound(device.id.clone()));
        };
        info!(device = %known, "Attaching synthetic device");
        self.device = Some(known.clone());
        self.next_due = None;
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(known.id.clone());
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(id = %device.id, "Detaching synthetic device");
        }
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, CaptureError> {
        let Some(device) = self.device.as_ref() else {
            return Err(CaptureError::NoDevice);
        };

        if self.fail_after.is_some_and(|n| self.frames >= n) {
            return Err(CaptureError::Disconnected);
        }
        if self.frame_limit.is_some_and(|n| self.frames >= n) {
            thread::sleep(timeout);
            return Ok(None);
        }

        if self.paced {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now + timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            if due > now {
                thread::sleep(due - now);
            }
            self.next_due = Some(due + self.frame_interval);
        }

        let dims = device.dimensions.unwrap_or(Dimensions::new(640, 480));
        let frame = FrameBuffer::from_rgba(
            Self::pattern(dims.width, dims.height, self.frames),
            dims.width,
            dims.height,
            self.frame_interval * self.frames as u32,
            device.native_orientation,
        );
        self.frames += 1;
        Ok(Some(frame))
    }

    fn current_device(&self) -> Option<&Device> {
        self.device.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_is_rejected() {
        let mut source = SyntheticSource::default();
        let mut bogus = SyntheticSource::default_devices()[0].clone();
        bogus.id = "synthetic:9".to_string();
        assert_eq!(
            source.attach(&bogus),
            Err(CaptureError::DeviceNotFound("synthetic:9".to_string()))
        );
        assert!(source.current_device().is_none());
        assert!(source.check_device(&bogus).is_err());
        assert!(source.attach_log().lock().unwrap().is_empty());
    }

    #[test]
    fn test_frames_match_device_dimensions() {
        let mut source = SyntheticSource::default().unpaced();
        let front = SyntheticSource::default_devices()[1].clone();
        source.attach(&front).unwrap();

        let frame = source.next_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(frame.dimensions(), Dimensions::new(320, 240));
        assert_eq!(frame.data.len(), 320 * 240 * 4);
        // First bar is 75% white
        assert_eq!(&frame.data[0..4], &[191, 191, 191, 255]);
    }

    #[test]
    fn test_frame_limit_and_failure() {
        let device = SyntheticSource::default_devices()[0].clone();

        let mut limited = SyntheticSource::default().unpaced().with_frame_limit(1);
        limited.attach(&device).unwrap();
        assert!(limited.next_frame(Duration::from_millis(1)).unwrap().is_some());
        assert!(limited.next_frame(Duration::from_millis(1)).unwrap().is_none());

        let mut failing = SyntheticSource::default().unpaced().fail_after(1);
        failing.attach(&device).unwrap();
        assert!(failing.next_frame(Duration::from_millis(1)).unwrap().is_some());
        assert_eq!(
            failing.next_frame(Duration::from_millis(1)).unwrap_err(),
            CaptureError::Disconnected
        );
    }
}
