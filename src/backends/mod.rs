// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for frame acquisition
//!
//! - [`camera`]: capture sources (GStreamer, synthetic test pattern) and
//!   device selection

pub mod camera;
