// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture pipeline
//!
//! These run the real capture thread against the synthetic source and the
//! recording GPU context, so they need neither a camera nor a GPU.

use daltocam::backends::camera::{Device, Dimensions, SyntheticSource};
use daltocam::gpu::{GpuCallCounter, GpuContext, GpuContextFactory, RecordingContext};
use daltocam::pipeline::{CapturePipelineDelegate, PreviewBuffer, SerialQueue};
use daltocam::{
    BuildError, CaptureError, CapturePipeline, ColorVisionFilter, FilterPreferences,
    PipelineConfig, PipelineError, PipelineState, Simulation, VideoOrientation, VisionType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started(String),
    Stopped(Option<PipelineError>),
    OutOfBuffers,
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    buffers: AtomicUsize,
    /// Keep delivered buffers instead of returning them to the pool
    hold: bool,
    held: Mutex<Vec<PreviewBuffer>>,
    /// Copy the pixels of each delivered buffer into `last`
    keep_last: bool,
    last: Mutex<Option<Vec<u8>>>,
}

impl Recorder {
    fn holding() -> Self {
        Self {
            hold: true,
            ..Default::default()
        }
    }

    fn keeping_last() -> Self {
        Self {
            keep_last: true,
            ..Default::default()
        }
    }

    fn last(&self) -> Option<Vec<u8>> {
        self.last.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, wanted: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| wanted(e)).count()
    }

    fn buffers(&self) -> usize {
        self.buffers.load(Ordering::SeqCst)
    }
}

impl CapturePipelineDelegate for Recorder {
    fn did_start_running(&self, device: &Device) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Started(device.id.clone()));
    }

    fn did_stop_running(&self, error: Option<PipelineError>) {
        self.events.lock().unwrap().push(Event::Stopped(error));
    }

    fn preview_buffer_ready(&self, buffer: PreviewBuffer) {
        if self.keep_last {
            *self.last.lock().unwrap() = Some(buffer.data().to_vec());
        }
        self.buffers.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            self.held.lock().unwrap().push(buffer);
        }
    }

    fn did_run_out_of_preview_buffers(&self) {
        self.events.lock().unwrap().push(Event::OutOfBuffers);
    }
}

struct Harness {
    pipeline: CapturePipeline,
    recorder: Arc<Recorder>,
    queue: Arc<SerialQueue>,
    counter: GpuCallCounter,
    devices: Vec<Device>,
}

impl Harness {
    fn new(source: SyntheticSource, recorder: Recorder, config: PipelineConfig) -> Self {
        Self::with_context(source, recorder, config, RecordingContext::with_counter)
    }

    fn with_context(
        source: SyntheticSource,
        recorder: Recorder,
        config: PipelineConfig,
        make: fn(GpuCallCounter) -> RecordingContext,
    ) -> Self {
        let counter = GpuCallCounter::default();
        let factory_counter = counter.clone();
        let factory: GpuContextFactory = Box::new(move || {
            Ok(Box::new(make(factory_counter.clone())) as Box<dyn GpuContext>)
        });

        let devices = source.devices().to_vec();
        let pipeline = CapturePipeline::new(Box::new(source), factory, config);
        let recorder = Arc::new(recorder);
        let queue = Arc::new(SerialQueue::new("pipeline-test").unwrap());
        let delegate: Weak<dyn CapturePipelineDelegate> = Arc::<Recorder>::downgrade(&recorder);
        pipeline.set_delegate(delegate, queue.clone());
        Self {
            pipeline,
            recorder,
            queue,
            counter,
            devices,
        }
    }

    fn start(&self) {
        assert!(self.pipeline.select_device(&self.devices[0]));
        self.pipeline.start_running().unwrap();
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

const WAIT: Duration = Duration::from_secs(5);

/// The synthetic color bars as seen through `vision` and `simulation`
fn bar_colors(vision: VisionType, simulation: Simulation) -> Vec<[u8; 4]> {
    let mut bars = SyntheticSource::pattern(8, 1, 0);
    vision.simulator(simulation).apply_rgba(&mut bars);
    bars.chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect()
}

fn only_colors(frame: &[u8], colors: &[[u8; 4]]) -> bool {
    frame
        .chunks_exact(4)
        .all(|px| colors.iter().any(|c| c[..] == *px))
}

#[test]
fn test_start_and_stop_notify_once() {
    let h = Harness::new(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    assert_eq!(h.pipeline.state(), PipelineState::Running);
    assert!(wait_until(WAIT, || h.recorder.buffers() > 0));

    h.pipeline.stop_running();
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    h.queue.flush();

    let events = h.recorder.events();
    assert_eq!(events.first(), Some(&Event::Started("synthetic:0".to_string())));
    assert_eq!(events.last(), Some(&Event::Stopped(None)));
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Started(_))), 1);
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Stopped(_))), 1);

    // A second stop is a no-op
    h.pipeline.stop_running();
    h.queue.flush();
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Stopped(_))), 1);
}

#[test]
fn test_restart_after_stop() {
    let h = Harness::new(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    h.pipeline.stop_running();
    h.pipeline.start_running().unwrap();
    assert!(h.pipeline.is_running());
    h.pipeline.stop_running();
    h.queue.flush();

    assert_eq!(h.recorder.count(|e| matches!(e, Event::Started(_))), 2);
    assert_eq!(h.recorder.count(|e| *e == Event::Stopped(None)), 2);
    assert_eq!(
        h.pipeline.video_device().map(|d| d.id),
        Some("synthetic:0".to_string())
    );
}

#[test]
fn test_build_failure_at_start() {
    let h = Harness::with_context(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
        |counter| RecordingContext::with_counter(counter).with_link_failure("varying mismatch"),
    );
    assert!(h.pipeline.select_device(&h.devices[0]));

    let err = h.pipeline.start_running().unwrap_err();
    assert!(
        matches!(err, PipelineError::Build(BuildError::Link { .. })),
        "unexpected error {:?}",
        err
    );
    assert_eq!(h.pipeline.state(), PipelineState::Failed);
    h.queue.flush();
    assert_eq!(h.recorder.events(), vec![Event::Stopped(Some(err))]);

    // Stopping after a failure only cleans up
    h.pipeline.stop_running();
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    h.queue.flush();
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Stopped(_))), 1);
}

#[test]
fn test_unknown_device_fails_start() {
    let h = Harness::new(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
    );
    let mut bogus = h.devices[0].clone();
    bogus.id = "synthetic:9".to_string();
    assert!(h.pipeline.select_device(&bogus));

    let err = h.pipeline.start_running().unwrap_err();
    assert_eq!(
        err,
        PipelineError::Device(CaptureError::DeviceNotFound("synthetic:9".to_string()))
    );
    assert_eq!(h.pipeline.state(), PipelineState::Failed);

    // The source came back, so a valid device starts fine
    assert!(h.pipeline.select_device(&h.devices[0]));
    h.pipeline.start_running().unwrap();
    assert!(h.pipeline.is_running());
    h.pipeline.stop_running();
}

#[test]
fn test_pool_exhaustion_is_signalled_once() {
    const CAPACITY: usize = 3;
    let h = Harness::new(
        SyntheticSource::default()
            .unpaced()
            .with_frame_limit(CAPACITY as u64 + 1),
        Recorder::holding(),
        PipelineConfig {
            pool_size: CAPACITY,
            ..PipelineConfig::default()
        },
    );
    h.start();

    assert!(wait_until(WAIT, || {
        h.recorder.buffers() == CAPACITY && h.recorder.count(|e| *e == Event::OutOfBuffers) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    h.queue.flush();
    assert_eq!(h.recorder.buffers(), CAPACITY);
    assert_eq!(h.recorder.count(|e| *e == Event::OutOfBuffers), 1);
    assert_eq!(h.pipeline.preview_pool().outstanding(), CAPACITY);

    h.pipeline.stop_running();
    h.recorder.held.lock().unwrap().clear();
    assert_eq!(h.pipeline.preview_pool().outstanding(), 0);
}

#[test]
fn test_disabled_rendering_makes_no_gpu_calls() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    assert!(wait_until(WAIT, || h.recorder.buffers() >= 3));

    h.pipeline.set_rendering_enabled(false);
    assert!(!h.pipeline.rendering_enabled());
    let calls = h.counter.get();
    let delivered = h.recorder.buffers();

    // Raw frames keep flowing without touching the GPU
    assert!(wait_until(WAIT, || h.recorder.buffers() >= delivered + 10));
    assert_eq!(h.counter.get(), calls);

    // The filter can be replaced while rendering is off
    h.pipeline
        .set_filter(ColorVisionFilter::new(VisionType::Tritanopia).into())
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.counter.get(), calls);

    h.pipeline.set_rendering_enabled(true);
    assert!(wait_until(WAIT, || h.counter.get() > calls));
    h.pipeline.stop_running();
}

#[test]
fn test_disabled_rendering_without_passthrough_delivers_nothing() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::default(),
        PipelineConfig {
            raw_passthrough: false,
            rendering_enabled: false,
            ..PipelineConfig::default()
        },
    );
    h.start();
    assert!(wait_until(WAIT, || h.pipeline.stats().frames() >= 10));
    h.queue.flush();

    assert_eq!(h.recorder.buffers(), 0);
    assert_eq!(h.counter.get(), 0);
    h.pipeline.stop_running();
}

#[test]
fn test_hot_swap_device() {
    let source = SyntheticSource::default().with_frame_rate(120);
    let attached = source.attach_log();
    let h = Harness::new(source, Recorder::default(), PipelineConfig::default());
    h.start();
    assert!(wait_until(WAIT, || {
        h.pipeline.video_dimensions() == Some(Dimensions::new(640, 480))
    }));

    assert!(h.pipeline.select_device(&h.devices[1]));
    assert_eq!(
        h.pipeline.video_device().map(|d| d.id),
        Some("synthetic:1".to_string())
    );
    assert!(wait_until(WAIT, || {
        h.pipeline.video_dimensions() == Some(Dimensions::new(320, 240))
    }));
    assert!(h.pipeline.is_running());

    // No stop/start cycle is reported for a swap
    h.queue.flush();
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Started(_))), 1);
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Stopped(_))), 0);
    assert_eq!(
        *attached.lock().unwrap(),
        vec!["synthetic:0".to_string(), "synthetic:1".to_string()]
    );
    h.pipeline.stop_running();
}

#[test]
fn test_failed_hot_swap_keeps_previous_device() {
    let source = SyntheticSource::default().with_frame_rate(120);
    let attached = source.attach_log();
    let h = Harness::new(source, Recorder::default(), PipelineConfig::default());
    h.start();

    let mut bogus = h.devices[1].clone();
    bogus.id = "synthetic:9".to_string();
    assert!(!h.pipeline.select_device(&bogus));

    assert!(h.pipeline.is_running());
    assert_eq!(
        h.pipeline.video_device().map(|d| d.id),
        Some("synthetic:0".to_string())
    );
    let frames = h.pipeline.stats().frames();
    assert!(wait_until(WAIT, || h.pipeline.stats().frames() > frames + 5));

    // The refused device was never attached, so the stream had no gap
    assert_eq!(*attached.lock().unwrap(), vec!["synthetic:0".to_string()]);
    h.pipeline.stop_running();
}

#[test]
fn test_session_failure_stops_pipeline() {
    let h = Harness::new(
        SyntheticSource::default().unpaced().fail_after(5),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();

    assert!(wait_until(WAIT, || {
        h.recorder.count(|e| matches!(e, Event::Stopped(_))) == 1
    }));
    assert_eq!(h.pipeline.state(), PipelineState::Failed);
    assert_eq!(
        h.recorder.events().last(),
        Some(&Event::Stopped(Some(PipelineError::Device(
            CaptureError::Disconnected
        ))))
    );

    h.pipeline.stop_running();
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    h.queue.flush();
    assert_eq!(h.recorder.count(|e| matches!(e, Event::Stopped(_))), 1);
}

#[test]
fn test_filter_swap_while_running() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();

    h.pipeline
        .set_filter(ColorVisionFilter::new(VisionType::Deuteranopia).into())
        .unwrap();
    h.pipeline.set_vision_type(VisionType::Monochromacy);
    let delivered = h.recorder.buffers();
    assert!(wait_until(WAIT, || h.recorder.buffers() > delivered + 3));
    h.pipeline.stop_running();
}

#[test]
fn test_color_vision_filter_changes_delivered_pixels() {
    for simulation in Simulation::ALL {
        let h = Harness::new(
            SyntheticSource::default().unpaced().with_frame_limit(1),
            Recorder::keeping_last(),
            PipelineConfig::default(),
        );
        h.pipeline
            .set_filter(
                ColorVisionFilter::new(VisionType::Deuteranopia)
                    .with_simulation(simulation)
                    .into(),
            )
            .unwrap();
        h.start();
        assert!(wait_until(WAIT, || h.recorder.last().is_some()));

        let raw = SyntheticSource::pattern(640, 480, 0);
        let mut expected = raw.clone();
        VisionType::Deuteranopia
            .simulator(simulation)
            .apply_rgba(&mut expected);
        let delivered = h.recorder.last().unwrap();
        assert_ne!(delivered, raw, "{} left the frame unchanged", simulation);
        assert_eq!(delivered, expected, "{} frame differs", simulation);
        h.pipeline.stop_running();
    }
}

#[test]
fn test_preferences_apply_to_running_filter() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::keeping_last(),
        PipelineConfig::default(),
    );
    h.pipeline
        .set_filter(ColorVisionFilter::new(VisionType::Normal).into())
        .unwrap();
    h.start();
    let normal = bar_colors(VisionType::Normal, Simulation::Machado);
    assert!(wait_until(WAIT, || {
        h.recorder.last().is_some_and(|f| only_colors(&f, &normal))
    }));

    h.pipeline.apply_filter_preferences(FilterPreferences {
        vision_type: VisionType::Protanopia,
        simulation: Simulation::Hcirn,
    });
    let protan = bar_colors(VisionType::Protanopia, Simulation::Hcirn);
    assert!(wait_until(WAIT, || {
        h.recorder.last().is_some_and(|f| only_colors(&f, &protan))
    }));
    let last = h.recorder.last().unwrap();
    assert!(!only_colors(&last, &normal));
    h.pipeline.stop_running();
}

#[test]
fn test_preferences_leave_fixed_filter_alone() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::keeping_last(),
        PipelineConfig::default(),
    );
    h.pipeline
        .set_filter(ColorVisionFilter::fixed(VisionType::Deuteranopia).into())
        .unwrap();
    h.start();

    h.pipeline.apply_filter_preferences(FilterPreferences {
        vision_type: VisionType::Tritanopia,
        simulation: Simulation::Hcirn,
    });
    let delivered = h.recorder.buffers();
    assert!(wait_until(WAIT, || h.recorder.buffers() > delivered + 5));

    let deutan = bar_colors(VisionType::Deuteranopia, Simulation::Machado);
    assert!(only_colors(&h.recorder.last().unwrap(), &deutan));
    h.pipeline.stop_running();
}

#[test]
fn test_stop_with_rendering_disabled_parks_context() {
    let h = Harness::new(
        SyntheticSource::default().with_frame_rate(120),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    assert!(wait_until(WAIT, || h.counter.get() > 0 && h.recorder.buffers() > 0));
    assert_eq!(h.counter.live_contexts(), 1);

    h.pipeline.set_rendering_enabled(false);
    let calls = h.counter.get();
    h.pipeline.stop_running();

    // Neither the programs nor the context were released
    assert_eq!(h.counter.get(), calls);
    assert_eq!(h.counter.live_contexts(), 1);

    // The next session renders with the same context
    h.pipeline.set_rendering_enabled(true);
    h.pipeline.start_running().unwrap();
    let delivered = h.recorder.buffers();
    assert!(wait_until(WAIT, || {
        h.counter.get() > calls && h.recorder.buffers() > delivered
    }));
    assert_eq!(h.counter.live_contexts(), 1);

    h.pipeline.stop_running();
    assert_eq!(h.counter.live_contexts(), 0);
}

#[test]
fn test_display_transform_for_running_session() {
    let h = Harness::new(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    assert_eq!(
        h.pipeline.video_orientation(),
        Some(VideoOrientation::LandscapeRight)
    );

    let upright = h
        .pipeline
        .transform_from_video_buffer_orientation_to_orientation(
            VideoOrientation::LandscapeRight,
            false,
        )
        .unwrap();
    assert!(upright.is_identity());

    let portrait = h
        .pipeline
        .transform_from_video_buffer_orientation_to_orientation(VideoOrientation::Portrait, false)
        .unwrap();
    assert!(!portrait.is_identity());
    assert!((portrait.determinant() - 1.0).abs() < 1e-5);
    h.pipeline.stop_running();
}

#[test]
fn test_dropped_pipeline_stops_capture_thread() {
    let h = Harness::new(
        SyntheticSource::default(),
        Recorder::default(),
        PipelineConfig::default(),
    );
    h.start();
    let Harness {
        pipeline,
        recorder,
        queue,
        ..
    } = h;

    drop(pipeline);
    queue.flush();
    assert_eq!(recorder.events().last(), Some(&Event::Stopped(None)));
}
