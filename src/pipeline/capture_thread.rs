// SPDX-License-Identifier: GPL-3.0-only

//! Capture/render thread
//!
//! The thread owns the capture source, the GPU context and the active filter
//! for the whole session. Control requests reach it as [`Command`]s and are
//! applied between frames; the stop flag is checked at the same boundary.
//!
//! Startup reports back over a `sync_channel` so that `start_running` can
//! return only once the device is attached and the filter is built.

use super::delegate::DelegateSlot;
use super::pool::{PreviewBuffer, PreviewBufferPool};
use super::state::{PipelineState, StateCell};
use super::stats::FrameStats;
use crate::backends::camera::{CaptureSource, Device, FrameBuffer, VideoOrientation};
use crate::constants::timing::{FRAME_LOG_INTERVAL, FRAME_POLL_INTERVAL};
use crate::errors::{BuildError, GpuError, PipelineError};
use crate::gpu::{GpuContext, GpuContextFactory};
use crate::shaders::{Filter, FilterPreferences, ShaderFilter, SurfaceDescriptor, VisionType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the capture thread owns while a session runs
///
/// Handed back when the thread exits so the next session can reuse it.
pub(crate) struct RenderResources {
    pub(crate) source: Box<dyn CaptureSource>,
    pub(crate) filter: Filter,
    /// Replaced filters whose programs may still live in `parked_ctx`
    pub(crate) retired: Vec<Filter>,
    pub(crate) gpu_factory: GpuContextFactory,
    /// Context kept alive because rendering was disabled at teardown
    pub(crate) parked_ctx: Option<Box<dyn GpuContext>>,
}

impl RenderResources {
    pub(crate) fn new(source: Box<dyn CaptureSource>, gpu_factory: GpuContextFactory) -> Self {
        Self {
            source,
            filter: Filter::default(),
            retired: Vec::new(),
            gpu_factory,
            parked_ctx: None,
        }
    }

    /// Swap in `filter`; the old one is released by the next session
    pub(crate) fn replace_filter(&mut self, filter: Filter) {
        let previous = std::mem::replace(&mut self.filter, filter);
        self.retired.push(previous);
    }
}

/// Control requests applied at the next frame boundary
pub(crate) enum Command {
    SelectDevice {
        device: Device,
        reply: SyncSender<bool>,
    },
    SetFilter {
        filter: Filter,
        reply: SyncSender<Result<(), BuildError>>,
    },
    UpdateColorVision(ColorVisionUpdate),
}

/// Change to the settings of an active color vision filter
#[derive(Debug, Clone, Copy)]
pub(crate) enum ColorVisionUpdate {
    VisionType(VisionType),
    Preferences(FilterPreferences),
}

impl ColorVisionUpdate {
    /// Apply to `filter`; other filters ignore the update
    pub(crate) fn apply(self, filter: &mut Filter) {
        let Some(filter) = filter.as_color_vision_mut() else {
            debug!(update = ?self, "Active filter has no vision settings");
            return;
        };
        match self {
            ColorVisionUpdate::VisionType(vision_type) => filter.set_vision_type(vision_type),
            ColorVisionUpdate::Preferences(preferences) => {
                filter.apply_preferences(&preferences);
            }
        }
    }
}

/// Rendering switch
///
/// GPU work happens only while holding `gpu`, and the flag is checked after
/// taking it. Disabling waits for the lock once, so no GPU call can start
/// after `set_enabled(false)` returns.
#[derive(Debug)]
pub(crate) struct RenderGate {
    enabled: AtomicBool,
    gpu: Mutex<()>,
}

impl RenderGate {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            gpu: Mutex::new(()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            drop(self.gpu.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    /// Enter the GPU section, or `None` while rendering is disabled
    pub(crate) fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.gpu.lock().unwrap_or_else(|e| e.into_inner());
        self.is_enabled().then_some(guard)
    }
}

/// Device and orientation of the current (or last) session
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionInfo {
    pub(crate) device: Option<Device>,
    pub(crate) video_orientation: Option<VideoOrientation>,
}

/// State shared between the pipeline handle and its capture thread
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) gate: RenderGate,
    pub(crate) pool: PreviewBufferPool,
    pub(crate) delegate: DelegateSlot,
    pub(crate) raw_passthrough: bool,
    stats: Mutex<FrameStats>,
    session: Mutex<SessionInfo>,
}

impl Shared {
    pub(crate) fn new(pool_size: usize, rendering_enabled: bool, raw_passthrough: bool) -> Self {
        Self {
            state: StateCell::default(),
            gate: RenderGate::new(rendering_enabled),
            pool: PreviewBufferPool::new(pool_size),
            delegate: DelegateSlot::default(),
            raw_passthrough,
            stats: Mutex::new(FrameStats::default()),
            session: Mutex::new(SessionInfo::default()),
        }
    }

    pub(crate) fn stats(&self) -> FrameStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn session(&self) -> SessionInfo {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn begin_session(&self, device: &Device) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.device = Some(device.clone());
        session.video_orientation = Some(device.native_orientation);
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .restart_timing();
    }

    fn record_frame(&self, frame: &FrameBuffer) -> FrameStats {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .video_orientation = Some(frame.orientation);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.record(frame);
        stats.clone()
    }
}

/// Handle to a running capture thread
pub(crate) struct CaptureThread {
    handle: JoinHandle<()>,
    init_rx: Receiver<Result<Device, PipelineError>>,
    done_rx: Receiver<RenderResources>,
    stop_flag: Arc<AtomicBool>,
    commands: Sender<Command>,
}

impl CaptureThread {
    pub(crate) fn spawn(
        device: Device,
        resources: RenderResources,
        shared: Arc<Shared>,
    ) -> Result<Self, PipelineError> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::channel();
        let (init_tx, init_rx) = sync_channel(1);
        let (done_tx, done_rx) = sync_channel(1);

        let thread_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("daltocam-capture".to_string())
            .spawn(move || {
                let worker = Worker {
                    source: resources.source,
                    filter: resources.filter,
                    retired: resources.retired,
                    gpu_factory: resources.gpu_factory,
                    ctx: resources.parked_ctx,
                    target: None,
                    shared,
                    stop_flag: thread_stop,
                    commands: command_rx,
                };
                worker.run(device, init_tx, done_tx);
            })
            .map_err(|e| PipelineError::Session(format!("failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            handle,
            init_rx,
            done_rx,
            stop_flag,
            commands: command_tx,
        })
    }

    /// Outcome of startup, or `None` if it is still pending after `timeout`
    pub(crate) fn wait_started(
        &self,
        timeout: Duration,
    ) -> Option<Result<Device, PipelineError>> {
        match self.init_rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::Session(
                "capture thread exited during start".to_string(),
            ))),
        }
    }

    pub(crate) fn request_stop(&self) {
        debug!("Requesting capture thread stop");
        self.stop_flag.store(true, Ordering::Release);
    }

    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Wait up to `timeout` for the thread to exit and take back its
    /// resources.
    ///
    /// Gives the handle back when the deadline passes. `Ok(None)` means the
    /// thread panicked and its resources are gone.
    pub(crate) fn finish(self, timeout: Duration) -> Result<Option<RenderResources>, CaptureThread> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(resources) => {
                self.join();
                Ok(Some(resources))
            }
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                Ok(None)
            }
        }
    }

    fn join(self) {
        if let Err(e) = self.handle.join() {
            error!("Capture thread panicked: {:?}", e);
        }
    }
}

struct Worker {
    source: Box<dyn CaptureSource>,
    filter: Filter,
    /// Replaced filters whose programs still live in the context
    retired: Vec<Filter>,
    gpu_factory: GpuContextFactory,
    ctx: Option<Box<dyn GpuContext>>,
    target: Option<SurfaceDescriptor>,
    shared: Arc<Shared>,
    stop_flag: Arc<AtomicBool>,
    commands: Receiver<Command>,
}

impl Worker {
    fn run(
        mut self,
        device: Device,
        init_tx: SyncSender<Result<Device, PipelineError>>,
        done_tx: SyncSender<RenderResources>,
    ) {
        debug!(device = %device.id, "Capture thread started, initializing");

        if let Err(e) = self.initialize(&device) {
            warn!(device = %device.id, error = %e, "Capture thread initialization failed");
            self.teardown();
            let _ = init_tx.send(Err(e));
            let _ = done_tx.send(self.into_resources());
            return;
        }

        // Loses only if start_running already gave up on us
        if !self
            .shared
            .state
            .transition(PipelineState::Starting, PipelineState::Running)
        {
            debug!("Start was abandoned, exiting");
            self.teardown();
            let _ = done_tx.send(self.into_resources());
            return;
        }

        let started = device.clone();
        self.shared
            .delegate
            .notify(move |d| d.did_start_running(&started));
        let _ = init_tx.send(Ok(device));

        if let Err(e) = self.run_loop() {
            if self
                .shared
                .state
                .transition(PipelineState::Running, PipelineState::Failed)
            {
                error!(error = %e, "Capture session failed");
                self.shared
                    .delegate
                    .notify(move |d| d.did_stop_running(Some(e)));
            } else {
                debug!(error = %e, "Session error while stopping");
            }
        }

        self.teardown();
        info!("Capture thread exiting");
        let _ = done_tx.send(self.into_resources());
    }

    fn initialize(&mut self, device: &Device) -> Result<(), PipelineError> {
        self.source.attach(device)?;
        self.shared.begin_session(device);

        let shared = Arc::clone(&self.shared);
        if let Some(_gpu) = shared.gate.enter() {
            let target = device
                .dimensions
                .map(|dims| SurfaceDescriptor::new(dims.width, dims.height));
            self.with_context(|worker, ctx| {
                if let Some(target) = target {
                    worker.filter.prepare(ctx, &target)?;
                    worker.target = Some(target);
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn run_loop(&mut self) -> Result<(), PipelineError> {
        while !self.stop_flag.load(Ordering::Acquire) {
            self.apply_commands()?;
            match self.source.next_frame(FRAME_POLL_INTERVAL) {
                Ok(Some(frame)) => self.process_frame(frame)?,
                Ok(None) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Stop signal received");
        Ok(())
    }

    fn apply_commands(&mut self) -> Result<(), PipelineError> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::SelectDevice { device, reply } => match self.swap_device(&device) {
                    Ok(swapped) => {
                        let _ = reply.send(swapped);
                    }
                    Err(e) => {
                        let _ = reply.send(false);
                        return Err(e);
                    }
                },
                Command::SetFilter { filter, reply } => {
                    let _ = reply.send(self.install_filter(filter));
                }
                Command::UpdateColorVision(update) => update.apply(&mut self.filter),
            }
        }
        Ok(())
    }

    /// Attach `device` in place of the current one.
    ///
    /// A device that fails the source's check is refused without touching
    /// the current one. Past the check the current device is detached first,
    /// so a failing attach re-attaches it after a gap. Returns false when the
    /// previous device is kept; errors only if neither can be attached.
    fn swap_device(&mut self, device: &Device) -> Result<bool, PipelineError> {
        let previous = self.source.current_device().cloned();
        if previous.as_ref().is_some_and(|p| p.id == device.id) {
            return Ok(true);
        }
        if let Err(e) = self.source.check_device(device) {
            warn!(device = %device.id, error = %e, "Device refused, keeping the current one");
            return Ok(false);
        }

        info!(
            from = previous.as_ref().map(|p| p.id.as_str()).unwrap_or("none"),
            to = %device.id,
            "Swapping capture device"
        );
        self.source.detach();

        match self.source.attach(device) {
            Ok(()) => {
                self.shared.begin_session(device);
                Ok(true)
            }
            Err(e) => {
                warn!(device = %device.id, error = %e, "Device swap failed, restoring previous device");
                let Some(previous) = previous else {
                    return Err(e.into());
                };
                self.source.attach(&previous)?;
                Ok(false)
            }
        }
    }

    fn install_filter(&mut self, mut filter: Filter) -> Result<(), BuildError> {
        let shared = Arc::clone(&self.shared);
        if let Some(_gpu) = shared.gate.enter()
            && let Some(target) = self.target
            && let Some(ctx) = self.ctx.as_deref_mut()
        {
            filter.prepare(ctx, &target)?;
        }
        info!(filter = filter.name(), "Filter installed");
        let previous = std::mem::replace(&mut self.filter, filter);
        self.retired.push(previous);
        Ok(())
    }

    fn process_frame(&mut self, frame: FrameBuffer) -> Result<(), PipelineError> {
        let stats = self.shared.record_frame(&frame);
        if stats.frames() % FRAME_LOG_INTERVAL == 0 {
            debug!(
                frames = stats.frames(),
                fps = stats.frame_rate(),
                dimensions = %frame.dimensions(),
                available = self.shared.pool.available(),
                "Capture stats"
            );
        }

        let shared = Arc::clone(&self.shared);
        let gpu = shared.gate.enter();
        if gpu.is_none() && !shared.raw_passthrough {
            return Ok(());
        }

        let Some(mut buffer) = shared.pool.acquire(frame.dimensions()) else {
            debug!(timestamp = ?frame.timestamp, "Out of preview buffers, dropping frame");
            shared.delegate.notify(|d| d.did_run_out_of_preview_buffers());
            return Ok(());
        };

        let rendered = match gpu {
            Some(_gpu) => self.with_context(|worker, ctx| worker.render(ctx, &frame, &mut buffer)),
            None => frame.copy_packed_into(buffer.data_mut()).map_err(PipelineError::from),
        };
        match rendered {
            Ok(()) => {}
            Err(PipelineError::Gpu(GpuError::InvalidFrame(reason))) => {
                warn!(%reason, "Dropping malformed frame");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        buffer.stamp(frame.timestamp, frame.orientation);
        shared
            .delegate
            .notify(move |d| d.preview_buffer_ready(buffer));
        Ok(())
    }

    fn render(
        &mut self,
        ctx: &mut dyn GpuContext,
        frame: &FrameBuffer,
        buffer: &mut PreviewBuffer,
    ) -> Result<(), PipelineError> {
        for mut retired in self.retired.drain(..) {
            retired.release(ctx);
        }

        let target = SurfaceDescriptor::new(frame.width, frame.height);
        self.filter.prepare(ctx, &target)?;
        self.target = Some(target);

        let program = self.filter.program().ok_or(GpuError::NoProgram)?;
        ctx.use_program(program);
        ctx.upload_texture(frame)?;
        self.filter
            .apply_parameters(ctx, frame.width, frame.height);
        ctx.render_into(frame.width, frame.height, buffer.data_mut())?;
        Ok(())
    }

    /// Run `f` with the session's GPU context, creating it on first use
    fn with_context<R>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut dyn GpuContext) -> Result<R, PipelineError>,
    ) -> Result<R, PipelineError> {
        let mut ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => {
                let ctx = (self.gpu_factory)()?;
                info!(context = %ctx.description(), "GPU context created");
                ctx
            }
        };
        let result = f(self, &mut *ctx);
        self.ctx = Some(ctx);
        result
    }

    /// Detach the device and release GPU state.
    ///
    /// With rendering disabled nothing GPU-side is touched, not even by
    /// dropping: the context, its programs and the retired filters are parked
    /// for the next session.
    fn teardown(&mut self) {
        self.source.detach();
        self.target = None;

        let shared = Arc::clone(&self.shared);
        if let Some(_gpu) = shared.gate.enter() {
            if let Some(mut ctx) = self.ctx.take() {
                self.filter.release(&mut *ctx);
                for mut retired in self.retired.drain(..) {
                    retired.release(&mut *ctx);
                }
                drop(ctx);
            }
        } else if self.ctx.is_some() {
            debug!("Rendering disabled, parking the GPU context");
        }

        if self.ctx.is_none() {
            // Without a context there are no programs to free
            self.filter.abandon();
            for mut retired in self.retired.drain(..) {
                retired.abandon();
            }
        }
    }

    fn into_resources(self) -> RenderResources {
        RenderResources {
            source: self.source,
            filter: self.filter,
            retired: self.retired,
            gpu_factory: self.gpu_factory,
            parked_ctx: self.ctx,
        }
    }
}
