// SPDX-License-Identifier: GPL-3.0-only

//! GStreamer capture source
//!
//! Every device is captured through the same pipeline shape, only the source
//! element changes:
//!
//! ```text
//! v4l2src | pipewiresrc | autovideosrc ! videoconvert ! video/x-raw,format=RGBA ! appsink
//! ```
//!
//! The appsink drops old buffers when the capture thread falls behind, and
//! frames are pulled synchronously with a timeout so the capture thread can
//! keep observing its stop flag.

use super::CaptureSource;
use super::types::*;
use crate::constants::{capture, timing};
use crate::errors::CaptureError;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct ActivePipeline {
    pipeline: gstreamer::Pipeline,
    appsink: AppSink,
    attached_at: Instant,
}

impl Drop for ActivePipeline {
    fn drop(&mut self) {
        // Release the device immediately
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Camera capture through GStreamer
#[derive(Default)]
pub struct GstCaptureSource {
    device: Option<Device>,
    active: Option<ActivePipeline>,
    frame_count: u64,
}

impl GstCaptureSource {
    pub fn new() -> Result<Self, CaptureError> {
        gstreamer::init().map_err(|e| CaptureError::Backend(e.to_string()))?;
        Ok(Self::default())
    }
}

/// Source element description for a device id
fn source_element(device: &Device) -> String {
    if device.id == capture::AUTO_DEVICE_ID {
        "autovideosrc".to_string()
    } else if let Some(node) = device.id.strip_prefix(capture::PIPEWIRE_PREFIX) {
        format!("pipewiresrc target-object={} do-timestamp=true", node)
    } else {
        format!("v4l2src device=\"{}\" do-timestamp=true", device.id)
    }
}

fn build_pipeline(device: &Device) -> Result<(gstreamer::Pipeline, AppSink), CaptureError> {
    let caps = match device.dimensions {
        Some(dims) => format!(
            "video/x-raw,format=RGBA,width=(int){},height=(int){}",
            dims.width, dims.height
        ),
        None => "video/x-raw,format=RGBA".to_string(),
    };
    let pipeline_str = format!(
        "{} ! videoconvert ! videoscale ! {} ! appsink name=sink max-buffers={} drop=true sync=false",
        source_element(device),
        caps,
        capture::APPSINK_MAX_BUFFERS
    );
    debug!(pipeline = %pipeline_str, "Building capture pipeline");

    let pipeline = gstreamer::parse::launch(&pipeline_str)
        .map_err(|e| CaptureError::AttachFailed(format!("Failed to create pipeline: {}", e)))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| CaptureError::AttachFailed("Failed to downcast to Pipeline".into()))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| CaptureError::AttachFailed("Failed to find appsink".into()))?
        .downcast::<AppSink>()
        .map_err(|_| CaptureError::AttachFailed("Failed to downcast to AppSink".into()))?;
    appsink.set_property("enable-last-sample", false);

    Ok((pipeline, appsink))
}

/// First error or end-of-stream message waiting on the bus
fn pending_bus_error(pipeline: &gstreamer::Pipeline) -> Option<CaptureError> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gstreamer::MessageType::Error, gstreamer::MessageType::Eos])?;
    match msg.view() {
        gstreamer::MessageView::Error(err) => Some(CaptureError::Backend(format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
        ))),
        gstreamer::MessageView::Eos(_) => Some(CaptureError::Disconnected),
        _ => None,
    }
}

impl CaptureSource for GstCaptureSource {
    fn check_device(&self, device: &Device) -> Result<(), CaptureError> {
        build_pipeline(device).map(|_| ())
    }

    fn attach(&mut self, device: &Device) -> Result<(), CaptureError> {
        info!(device = %device, "Attaching capture device");
        // Most cameras only open once, so the old pipeline must stop before
        // the new one plays; building it first keeps a bad description from
        // costing the current device
        let (pipeline, appsink) = build_pipeline(device)?;
        self.detach();

        let active = ActivePipeline {
            pipeline,
            appsink,
            attached_at: Instant::now(),
        };

        active
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CaptureError::AttachFailed(format!("Failed to start pipeline: {}", e)))?;

        let (result, state, pending) = active.pipeline.state(gstreamer::ClockTime::from_mseconds(
            timing::START_TIMEOUT.as_millis() as u64,
        ));
        debug!(result = ?result, state = ?state, pending = ?pending, "Pipeline state");
        if let Some(err) = pending_bus_error(&active.pipeline) {
            return Err(CaptureError::AttachFailed(err.to_string()));
        }
        if result.is_err() {
            return Err(CaptureError::AttachFailed(format!(
                "{} did not reach PLAYING",
                device.id
            )));
        }

        self.active = Some(active);
        self.device = Some(device.clone());
        self.frame_count = 0;
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(active) = self.active.take() {
            info!(device = ?self.device.as_ref().map(|d| &d.id), "Detaching capture device");
            drop(active);
        }
        self.device = None;
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, CaptureError> {
        let Some(active) = self.active.as_ref() else {
            return Err(CaptureError::NoDevice);
        };
        if let Some(err) = pending_bus_error(&active.pipeline) {
            return Err(err);
        }

        let Some(sample) = active
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_nseconds(timeout.as_nanos() as u64))
        else {
            if active.appsink.is_eos() {
                return Err(CaptureError::Disconnected);
            }
            return Ok(None);
        };

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Backend("No caps on sample".into()))?;
        let video_info = VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Backend(format!("Failed to get video info: {}", e)))?;
        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| CaptureError::Backend("No buffer in sample".into()))?;

        if buffer.flags().contains(gstreamer::BufferFlags::CORRUPTED) {
            warn!(frame = self.frame_count, "Buffer marked as corrupted, skipping frame");
            return Ok(None);
        }

        let timestamp = buffer
            .pts()
            .map(|pts| Duration::from_nanos(pts.nseconds()))
            .unwrap_or_else(|| active.attached_at.elapsed());

        let map = buffer
            .into_mapped_buffer_readable()
            .map_err(|_| CaptureError::Backend("Failed to map buffer".into()))?;

        self.frame_count += 1;
        if self.frame_count % timing::FRAME_LOG_INTERVAL == 0 {
            debug!(
                frame = self.frame_count,
                width = video_info.width(),
                height = video_info.height(),
                stride = video_info.stride()[0],
                "Captured frame"
            );
        }

        Ok(Some(FrameBuffer {
            data: FrameData::from_mapped_buffer(map),
            width: video_info.width(),
            height: video_info.height(),
            stride: video_info.stride()[0] as u32,
            timestamp,
            orientation: self
                .device
                .as_ref()
                .map(|d| d.native_orientation)
                .unwrap_or_default(),
        }))
    }

    fn current_device(&self) -> Option<&Device> {
        self.device.as_ref()
    }
}

fn prop_string(props: &gstreamer::StructureRef, key: &str) -> Option<String> {
    props
        .get::<String>(key)
        .ok()
        .or_else(|| props.get::<u64>(key).ok().map(|v| v.to_string()))
        .or_else(|| props.get::<i32>(key).ok().map(|v| v.to_string()))
}

/// List video capture devices known to GStreamer's device providers
pub fn enumerate_devices() -> Result<Vec<Device>, CaptureError> {
    gstreamer::init().map_err(|e| CaptureError::Backend(e.to_string()))?;

    let monitor = gstreamer::DeviceMonitor::new();
    monitor.add_filter(Some("Video/Source"), None);
    monitor
        .start()
        .map_err(|e| CaptureError::Backend(format!("Device monitor failed: {}", e)))?;
    let found = monitor.devices();
    monitor.stop();

    let mut devices = Vec::new();
    for gst_device in found {
        let name = gst_device.display_name().to_string();
        let Some(props) = gst_device.properties() else {
            debug!(name = %name, "Device without properties, skipped");
            continue;
        };

        let api = prop_string(&props, "device.api").unwrap_or_default();
        let id = match api.as_str() {
            "pipewire" => match prop_string(&props, "object.serial") {
                Some(serial) => format!("{}{}", capture::PIPEWIRE_PREFIX, serial),
                None => continue,
            },
            _ => match prop_string(&props, "device.path")
                .or_else(|| prop_string(&props, "api.v4l2.path"))
            {
                Some(path) => path,
                None => continue,
            },
        };

        let position = prop_string(&props, "api.libcamera.location")
            .map(|l| DevicePosition::from_location(&l))
            .unwrap_or_default();
        let native_orientation = prop_string(&props, "api.libcamera.rotation")
            .and_then(|r| r.trim().parse::<i32>().ok())
            .map(VideoOrientation::from_rotation_degrees)
            .unwrap_or_default();
        let dimensions = gst_device.caps().and_then(|caps| {
            let s = caps.structure(0)?;
            let width = s.get::<i32>("width").ok()?;
            let height = s.get::<i32>("height").ok()?;
            Some(Dimensions::new(width as u32, height as u32))
        });

        debug!(id = %id, name = %name, api = %api, "Found capture device");
        devices.push(Device {
            id,
            name,
            position,
            native_orientation,
            dimensions,
        });
    }

    info!(count = devices.len(), "Enumerated capture devices");
    Ok(devices)
}
