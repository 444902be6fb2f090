// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

/// Application identity
pub mod app {
    /// Directory name under the user's config dir
    pub const CONFIG_DIR_NAME: &str = "daltocam";
    /// Pipeline configuration file
    pub const CONFIG_FILE_NAME: &str = "config.json";
    /// Persisted user preferences (vision type, ...)
    pub const PREFERENCES_FILE_NAME: &str = "preferences.json";

    /// Version string stamped by build.rs
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

/// Timeouts and intervals for the capture thread
pub mod timing {
    use std::time::Duration;

    /// How long `start_running` waits for the capture thread to report in
    pub const START_TIMEOUT: Duration = Duration::from_secs(5);
    /// Bounded teardown deadline for `stop_running`
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);
    /// How long the capture thread blocks waiting for a frame before
    /// re-checking the stop flag and the command queue
    pub const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// How long `select_device` waits for the capture thread to answer
    pub const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
    /// Log per-frame statistics every N frames
    pub const FRAME_LOG_INTERVAL: u64 = 120;
}

/// GStreamer capture pipeline
pub mod capture {
    /// Frames queued in the appsink before old ones are dropped
    pub const APPSINK_MAX_BUFFERS: u32 = 2;
    /// Device id that selects `autovideosrc`
    pub const AUTO_DEVICE_ID: &str = "auto";
    /// Prefix of PipeWire node device ids
    pub const PIPEWIRE_PREFIX: &str = "pipewire:";
}

/// Preview buffer pool
pub mod pool {
    /// Buffers kept in flight between the render thread and the consumer
    pub const DEFAULT_PREVIEW_BUFFERS: usize = 6;
}

/// Frame statistics
pub mod stats {
    /// Weight of the newest sample in the frame-rate moving average
    pub const FRAME_RATE_SMOOTHING: f32 = 0.1;
}

/// Fixed GPU vertex layout shared by every filter
///
/// The render quad interleaves one `vec2<f32>` per attribute slot, so an
/// attribute bound at location `n` reads from byte offset `n * 8`.
pub mod vertex {
    /// Clip-space position attribute slot
    pub const ATTRIB_POSITION: u32 = 0;
    /// Texture coordinate attribute slot
    pub const ATTRIB_TEX_COORD: u32 = 1;
    /// Number of attribute slots the quad provides
    pub const ATTRIB_SLOTS: u32 = 2;
    /// Bytes per vertex
    pub const STRIDE: u64 = (ATTRIB_SLOTS as u64) * 8;
    /// Triangle-strip quad: position.xy, tex_coord.xy per vertex
    pub const QUAD: [f32; 16] = [
        -1.0, -1.0, 0.0, 1.0, //
        1.0, -1.0, 1.0, 1.0, //
        -1.0, 1.0, 0.0, 0.0, //
        1.0, 1.0, 1.0, 0.0, //
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_matches_stride() {
        let floats_per_vertex = (vertex::STRIDE / 4) as usize;
        assert_eq!(vertex::QUAD.len() % floats_per_vertex, 0);
        assert_eq!(vertex::QUAD.len() / floats_per_vertex, 4);
    }

    #[test]
    fn test_stop_deadline_is_bounded() {
        assert!(timing::STOP_TIMEOUT > timing::FRAME_POLL_INTERVAL);
    }
}
