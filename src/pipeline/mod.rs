// SPDX-License-Identifier: GPL-3.0-only

//! Capture-to-render pipeline
//!
//! [`CapturePipeline`] drives one capture device through the active
//! [`Filter`] on a dedicated capture/render thread and delivers the result to
//! a [`CapturePipelineDelegate`] as pooled [`PreviewBuffer`]s.
//!
//! ```text
//!  control side                      capture thread
//!  ────────────                      ──────────────
//!  start_running ──spawn──────────▶  attach device, build filter
//!                ◀──sync_channel───  started / error
//!  select_device ──Command─────────▶  (applied between frames)
//!                                    next_frame → pool → GPU → delegate queue
//!  stop_running  ──stop flag──────▶  teardown, hand resources back
//! ```
//!
//! Every public method takes `&self` and is serialized internally, so the
//! pipeline can be shared across threads behind an `Arc`.

mod capture_thread;
pub mod delegate;
pub mod orientation;
pub mod pool;
pub mod state;
pub mod stats;

pub use delegate::{CallbackQueue, CapturePipelineDelegate, Job, SerialQueue};
pub use orientation::{AffineTransform, angle_offset_from_portrait, transform_for};
pub use pool::{PreviewBuffer, PreviewBufferPool};
pub use state::PipelineState;
pub use stats::FrameStats;

use crate::backends::camera::{CaptureSource, Device, Dimensions, VideoOrientation};
use crate::constants::{pool as pool_consts, timing};
use crate::errors::{CaptureError, PipelineError, PipelineResult};
use crate::gpu::GpuContextFactory;
use crate::shaders::{Filter, FilterPreferences, VisionType};
use capture_thread::{CaptureThread, ColorVisionUpdate, Command, RenderResources, Shared};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pipeline tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Preview buffers in flight between the render thread and the consumer
    pub pool_size: usize,
    /// Keep delivering CPU copies of the raw frames while rendering is off
    pub raw_passthrough: bool,
    /// Initial value of the rendering switch
    pub rendering_enabled: bool,
    /// How long `start_running` waits for the capture thread
    pub start_timeout: Duration,
    /// How long `stop_running` waits before detaching the capture thread
    pub teardown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: pool_consts::DEFAULT_PREVIEW_BUFFERS,
            raw_passthrough: true,
            rendering_enabled: true,
            start_timeout: timing::START_TIMEOUT,
            teardown_timeout: timing::STOP_TIMEOUT,
        }
    }
}

/// Control-side state, only touched with the control lock held
#[derive(Default)]
struct Control {
    /// Present while no capture thread owns them
    resources: Option<RenderResources>,
    /// Filter set while the resources were out of reach
    pending_filter: Option<Filter>,
    selected: Option<Device>,
    thread: Option<CaptureThread>,
    /// Thread that missed its teardown deadline
    lingering: Option<CaptureThread>,
}

/// Live capture session feeding a shader filter
pub struct CapturePipeline {
    shared: Arc<Shared>,
    config: PipelineConfig,
    control: Mutex<Control>,
}

impl CapturePipeline {
    /// Pipeline over `source` with a passthrough filter.
    ///
    /// Nothing is opened until [`start_running`](Self::start_running); the
    /// GPU context is created on the capture thread by `gpu_factory`.
    pub fn new(
        source: Box<dyn CaptureSource>,
        gpu_factory: GpuContextFactory,
        config: PipelineConfig,
    ) -> Self {
        let shared = Shared::new(
            config.pool_size,
            config.rendering_enabled,
            config.raw_passthrough,
        );
        let control = Control {
            resources: Some(RenderResources::new(source, gpu_factory)),
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
            config,
            control: Mutex::new(control),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register the delegate and the queue every callback is dispatched on.
    ///
    /// The pipeline keeps only a weak reference; a delegate that has been
    /// dropped simply stops receiving callbacks.
    pub fn set_delegate(
        &self,
        delegate: Weak<dyn CapturePipelineDelegate>,
        queue: Arc<dyn CallbackQueue>,
    ) {
        self.shared.delegate.set(delegate, queue);
    }

    pub fn clear_delegate(&self) {
        self.shared.delegate.clear();
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    /// True only while a session is running
    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Start capturing from the selected device.
    ///
    /// Returns once the device is attached and the filter is built, or once
    /// that failed. A failure leaves the pipeline [`PipelineState::Failed`]
    /// and is also reported through `did_stop_running`. No-op while running.
    pub fn start_running(&self) -> PipelineResult<()> {
        let mut control = self.lock_control();

        match self.shared.state.get() {
            PipelineState::Running | PipelineState::Starting => return Ok(()),
            PipelineState::Failed => {
                if let Some(thread) = control.thread.take() {
                    self.reap(&mut control, thread);
                }
            }
            PipelineState::Stopped | PipelineState::Stopping => {}
        }

        if let Some(lingering) = control.lingering.take() {
            debug!("Waiting for the previous capture thread");
            self.reclaim(&mut control, lingering, self.config.start_timeout);
        }

        let Some(device) = control.selected.clone() else {
            return self.fail_start(PipelineError::Device(CaptureError::NoDevice));
        };
        let Some(mut resources) = control.resources.take() else {
            return self.fail_start(PipelineError::Session(
                "capture thread of the previous session is still running".to_string(),
            ));
        };
        if let Some(filter) = control.pending_filter.take() {
            resources.replace_filter(filter);
        }

        info!(device = %device, "Starting capture pipeline");
        self.shared.state.set(PipelineState::Starting);

        let thread = match CaptureThread::spawn(device, resources, Arc::clone(&self.shared)) {
            Ok(thread) => thread,
            Err(e) => return self.fail_start(e),
        };

        let timeout = self.config.start_timeout;
        let outcome = match thread.wait_started(timeout) {
            Some(outcome) => outcome,
            None if self
                .shared
                .state
                .transition(PipelineState::Starting, PipelineState::Failed) =>
            {
                Err(PipelineError::Session(format!(
                    "capture thread did not start within {:?}",
                    timeout
                )))
            }
            // The thread got to Running first; its answer is on the way
            None => thread.wait_started(timeout).unwrap_or_else(|| {
                Err(PipelineError::Session("capture thread stopped answering".to_string()))
            }),
        };

        match outcome {
            Ok(device) => {
                info!(device = %device.id, "Capture pipeline running");
                control.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                thread.request_stop();
                self.reclaim(&mut control, thread, self.config.teardown_timeout);
                self.fail_start(e)
            }
        }
    }

    /// Stop capturing and wait (bounded) for the capture thread to exit.
    ///
    /// Reports `did_stop_running(None)` for a running session. After a
    /// failure it only cleans up, since the failure was already reported.
    pub fn stop_running(&self) {
        let mut control = self.lock_control();

        match self.shared.state.get() {
            PipelineState::Stopped => return,
            PipelineState::Failed => {
                if let Some(thread) = control.thread.take() {
                    self.reap(&mut control, thread);
                }
                self.shared.state.set(PipelineState::Stopped);
                return;
            }
            PipelineState::Running | PipelineState::Starting | PipelineState::Stopping => {}
        }

        let reported = self
            .shared
            .state
            .transition(PipelineState::Running, PipelineState::Stopping);

        info!("Stopping capture pipeline");
        if let Some(thread) = control.thread.take() {
            self.reap(&mut control, thread);
        }
        self.shared.state.set(PipelineState::Stopped);

        if reported {
            self.shared.delegate.notify(|d| d.did_stop_running(None));
        }
    }

    /// Use `device` for capture.
    ///
    /// While running this swaps devices without a stop/start cycle and
    /// returns false, with the previous device still attached, if `device`
    /// cannot be attached. A device the source refuses up front leaves the
    /// previous one streaming; one that fails later in attaching costs a
    /// short gap while the previous device is re-attached. Otherwise it only
    /// records the choice for the next start.
    pub fn select_device(&self, device: &Device) -> bool {
        let mut guard = self.lock_control();
        let control = &mut *guard;

        let thread = match (&control.thread, self.shared.state.get()) {
            (Some(thread), PipelineState::Running) => thread,
            _ => {
                debug!(device = %device.id, "Device selected for next start");
                control.selected = Some(device.clone());
                return true;
            }
        };

        let (reply_tx, reply_rx) = sync_channel(1);
        let sent = thread.send(Command::SelectDevice {
            device: device.clone(),
            reply: reply_tx,
        });
        if !sent {
            return false;
        }

        match reply_rx.recv_timeout(timing::COMMAND_REPLY_TIMEOUT) {
            Ok(true) => {
                control.selected = Some(device.clone());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(device = %device.id, error = %e, "No answer to device swap");
                false
            }
        }
    }

    /// Attached device while running, otherwise the one selected for the
    /// next start
    pub fn video_device(&self) -> Option<Device> {
        if self.is_running() {
            return self.shared.session().device;
        }
        self.lock_control().selected.clone()
    }

    /// Turn the GPU path on or off.
    ///
    /// Once this returns `false`, no GPU call is made until rendering is
    /// enabled again; frames are still captured and, with
    /// [`PipelineConfig::raw_passthrough`], delivered unfiltered. A session
    /// stopped meanwhile keeps its GPU context for the next start rather than
    /// destroying it; only dropping the pipeline frees a parked context.
    pub fn set_rendering_enabled(&self, enabled: bool) {
        debug!(enabled, "Rendering switch");
        self.shared.gate.set_enabled(enabled);
    }

    pub fn rendering_enabled(&self) -> bool {
        self.shared.gate.is_enabled()
    }

    /// Replace the active filter.
    ///
    /// While running the new filter is built before it is swapped in; on a
    /// build error the previous filter stays active.
    pub fn set_filter(&self, filter: Filter) -> PipelineResult<()> {
        let mut guard = self.lock_control();
        let control = &mut *guard;

        if let (Some(thread), PipelineState::Running) = (&control.thread, self.shared.state.get()) {
            let (reply_tx, reply_rx) = sync_channel(1);
            if !thread.send(Command::SetFilter {
                filter,
                reply: reply_tx,
            }) {
                return Err(PipelineError::Session("capture thread is gone".to_string()));
            }
            return match reply_rx.recv_timeout(timing::COMMAND_REPLY_TIMEOUT) {
                Ok(result) => result.map_err(PipelineError::Build),
                Err(_) => Err(PipelineError::Session(
                    "capture thread did not answer".to_string(),
                )),
            };
        }

        match control.resources.as_mut() {
            Some(resources) => resources.replace_filter(filter),
            None => control.pending_filter = Some(filter),
        }
        Ok(())
    }

    /// Change the simulated vision type of a color vision filter
    pub fn set_vision_type(&self, vision_type: VisionType) {
        self.update_color_vision(ColorVisionUpdate::VisionType(vision_type));
    }

    /// Hand freshly read preferences to a color vision filter.
    ///
    /// A filter with a fixed vision type ignores them. Switching the
    /// simulation rebuilds the program on the next rendered frame.
    pub fn apply_filter_preferences(&self, preferences: FilterPreferences) {
        self.update_color_vision(ColorVisionUpdate::Preferences(preferences));
    }

    fn update_color_vision(&self, update: ColorVisionUpdate) {
        let mut guard = self.lock_control();
        let control = &mut *guard;

        if let (Some(thread), PipelineState::Running) = (&control.thread, self.shared.state.get()) {
            thread.send(Command::UpdateColorVision(update));
            return;
        }

        let filter = match control.resources.as_mut() {
            Some(resources) => Some(&mut resources.filter),
            None => control.pending_filter.as_mut(),
        };
        match filter {
            Some(filter) => update.apply(filter),
            None => debug!(?update, "No filter to update"),
        }
    }

    /// Transform that shows the video buffer upright in `orientation`.
    ///
    /// Needs the buffer orientation of a started session.
    pub fn transform_from_video_buffer_orientation_to_orientation(
        &self,
        orientation: VideoOrientation,
        mirroring: bool,
    ) -> PipelineResult<AffineTransform> {
        let session = self.shared.session();
        let (Some(video_orientation), Some(device)) = (session.video_orientation, session.device)
        else {
            return Err(PipelineError::NotStarted);
        };
        Ok(transform_for(
            video_orientation,
            device.position,
            orientation,
            mirroring,
        ))
    }

    /// Smoothed capture frame rate
    pub fn video_frame_rate(&self) -> f32 {
        self.shared.stats().frame_rate()
    }

    /// Dimensions of the last captured frame
    pub fn video_dimensions(&self) -> Option<Dimensions> {
        self.shared.stats().dimensions()
    }

    /// Orientation of the video buffers
    pub fn video_orientation(&self) -> Option<VideoOrientation> {
        self.shared.session().video_orientation
    }

    pub fn stats(&self) -> FrameStats {
        self.shared.stats()
    }

    /// Pool the preview buffers are drawn from
    pub fn preview_pool(&self) -> &PreviewBufferPool {
        &self.shared.pool
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail_start(&self, error: PipelineError) -> PipelineResult<()> {
        error!(error = %error, "Capture pipeline failed to start");
        self.shared.state.set(PipelineState::Failed);
        let reported = error.clone();
        self.shared
            .delegate
            .notify(move |d| d.did_stop_running(Some(reported)));
        Err(error)
    }

    /// Stop `thread` and take its resources back within the teardown deadline
    fn reap(&self, control: &mut Control, thread: CaptureThread) {
        thread.request_stop();
        self.reclaim(control, thread, self.config.teardown_timeout);
    }

    fn reclaim(&self, control: &mut Control, thread: CaptureThread, timeout: Duration) {
        match thread.finish(timeout) {
            Ok(Some(resources)) => control.resources = Some(resources),
            Ok(None) => error!("Capture thread died, its capture source is lost"),
            Err(thread) => {
                warn!(
                    timeout = ?timeout,
                    "Capture thread missed its deadline, detaching"
                );
                control.lingering = Some(thread);
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop_running();
    }
}
