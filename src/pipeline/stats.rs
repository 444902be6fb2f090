// SPDX-License-Identifier: GPL-3.0-only

//! Frame statistics exposed as read-only snapshots

use crate::backends::camera::{Dimensions, FrameBuffer, VideoOrientation};
use crate::constants::stats::FRAME_RATE_SMOOTHING;
use std::time::Duration;

/// Statistics of the frames seen by the capture thread
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    frame_rate: f32,
    dimensions: Option<Dimensions>,
    orientation: Option<VideoOrientation>,
    last_timestamp: Option<Duration>,
    frames: u64,
}

impl FrameStats {
    pub fn record(&mut self, frame: &FrameBuffer) {
        if let Some(last) = self.last_timestamp
            && frame.timestamp > last
        {
            let instant = 1.0 / (frame.timestamp - last).as_secs_f32();
            self.frame_rate = if self.frame_rate == 0.0 {
                instant
            } else {
                self.frame_rate + FRAME_RATE_SMOOTHING * (instant - self.frame_rate)
            };
        }
        self.last_timestamp = Some(frame.timestamp);
        self.dimensions = Some(frame.dimensions());
        self.orientation = Some(frame.orientation);
        self.frames += 1;
    }

    /// Forget the timing history, e.g. after a device swap.
    ///
    /// Dimensions and orientation stay until the next frame replaces them.
    pub fn restart_timing(&mut self) {
        self.frame_rate = 0.0;
        self.last_timestamp = None;
    }

    /// Smoothed frames per second, 0 until two frames arrived
    pub fn frame_rate(&self) -> f32 {
        self.frame_rate
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.dimensions
    }

    pub fn orientation(&self) -> Option<VideoOrientation> {
        self.orientation
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ms: u64, width: u32) -> FrameBuffer {
        FrameBuffer::from_rgba(
            vec![0; width as usize * 4],
            width,
            1,
            Duration::from_millis(ms),
            VideoOrientation::LandscapeRight,
        )
    }

    #[test]
    fn test_frame_rate_converges() {
        let mut stats = FrameStats::default();
        for i in 0..200 {
            stats.record(&frame(i * 40, 4));
        }
        assert!((stats.frame_rate() - 25.0).abs() < 0.1);
        assert_eq!(stats.frames(), 200);
        assert_eq!(stats.dimensions(), Some(Dimensions::new(4, 1)));
    }

    #[test]
    fn test_backwards_timestamp_does_not_poison_rate() {
        let mut stats = FrameStats::default();
        stats.record(&frame(100, 4));
        stats.record(&frame(50, 8));
        assert_eq!(stats.frame_rate(), 0.0);
        assert_eq!(stats.dimensions(), Some(Dimensions::new(8, 1)));

        stats.restart_timing();
        stats.record(&frame(1000, 8));
        assert_eq!(stats.frame_rate(), 0.0);
    }
}
