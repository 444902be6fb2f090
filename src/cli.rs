// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing capture devices
//! - Running the pipeline against a device
//! - Filtering still images
//! - Managing the stored vision type

use chrono::Local;
use daltocam::backends::camera::{
    Device, DeviceParams, Dimensions, GstCaptureSource, SyntheticSource, best_device,
    enumerate_devices,
};
use daltocam::gpu::{self, GpuContext, WgpuContext};
use daltocam::pipeline::{
    CallbackQueue, CapturePipeline, CapturePipelineDelegate, PreviewBuffer, SerialQueue,
};
use daltocam::shaders::{
    ColorVisionFilter, FilterPreferences, JsonPreferenceStore, PreferenceStore,
    SIM_VISION_TYPE_KEY, SIMULATION_KEY, ShaderFilter, SurfaceDescriptor, register_defaults,
};
use daltocam::{
    CaptureSource, Config, FrameBuffer, GpuError, PipelineError, Simulation, VideoOrientation,
    VisionType,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

/// List capture devices
pub fn list_devices(synthetic: bool) -> Result<(), Box<dyn std::error::Error>> {
    let devices = if synthetic {
        SyntheticSource::default_devices()
    } else {
        enumerate_devices()?
    };

    if devices.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }

    println!("Available devices:");
    println!();
    for (index, device) in devices.iter().enumerate() {
        println!("  [{}] {}", index, device.name);
        println!("      Id: {}", device.id);
        println!("      Position: {}", device.position);
        if let Some(dimensions) = device.dimensions {
            println!("      Size: {}", dimensions);
        }
        println!();
    }

    Ok(())
}

/// Options for [`preview`]
pub struct PreviewOptions {
    pub device: Option<usize>,
    pub duration: u64,
    pub vision: Option<VisionType>,
    pub simulation: Option<Simulation>,
    pub synthetic: bool,
    pub render: bool,
    pub output: Option<PathBuf>,
}

/// Delegate that counts deliveries and keeps the last frame when asked to
struct PreviewDelegate {
    keep_last: bool,
    frames: AtomicU64,
    exhausted: AtomicU64,
    last: Mutex<Option<(Dimensions, Vec<u8>)>>,
    stopped: AtomicBool,
    error: Mutex<Option<PipelineError>>,
}

impl PreviewDelegate {
    fn new(keep_last: bool) -> Self {
        Self {
            keep_last,
            frames: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            last: Mutex::new(None),
            stopped: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }
}

impl CapturePipelineDelegate for PreviewDelegate {
    fn did_start_running(&self, device: &Device) {
        println!("Capturing from {}", device);
    }

    fn did_stop_running(&self, error: Option<PipelineError>) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.error.lock() {
            *slot = error;
        }
    }

    fn preview_buffer_ready(&self, buffer: PreviewBuffer) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if self.keep_last
            && let Ok(mut last) = self.last.lock()
        {
            let mut data = last.take().map(|(_, data)| data).unwrap_or_default();
            data.clear();
            data.extend_from_slice(buffer.data());
            *last = Some((buffer.dimensions(), data));
        }
        buffer.release();
    }

    fn did_run_out_of_preview_buffers(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run the pipeline for a while and report statistics
pub fn preview(options: PreviewOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Could not load config, using defaults");
        Config::default()
    });

    let (source, devices): (Box<dyn CaptureSource>, Vec<Device>) = if options.synthetic {
        let source = SyntheticSource::default();
        let devices = source.devices().to_vec();
        (Box::new(source), devices)
    } else {
        (Box::new(GstCaptureSource::new()?), enumerate_devices()?)
    };

    let device = match options.device {
        Some(index) => devices.get(index).ok_or_else(|| {
            format!(
                "Device index {} out of range ({} devices)",
                index,
                devices.len()
            )
        })?,
        None => best_device(&devices, &config.device).ok_or("No capture devices found")?,
    };

    let store = JsonPreferenceStore::open_default()?;
    register_defaults(&store)?;
    let mut preferences = FilterPreferences::load(&store);

    // Explicit options pin the filter; otherwise it follows the stored preferences
    let filter = if options.vision.is_some() || options.simulation.is_some() {
        ColorVisionFilter::fixed(options.vision.unwrap_or(preferences.vision_type))
            .with_simulation(options.simulation.unwrap_or(preferences.simulation))
    } else {
        ColorVisionFilter::from_preferences(&store)
    };
    let follow_preferences = !filter.fixed_vision_type();
    println!(
        "Simulating: {} ({})",
        filter.vision_type(),
        filter.simulation()
    );

    let mut pipeline_config = config.pipeline_config();
    pipeline_config.rendering_enabled = options.render;
    let pipeline = CapturePipeline::new(
        source,
        gpu::wgpu_factory(config.allow_software_gpu),
        pipeline_config,
    );

    let delegate = Arc::new(PreviewDelegate::new(options.output.is_some()));
    let queue: Arc<dyn CallbackQueue> = Arc::new(SerialQueue::new("daltocam-preview")?);
    let weak_delegate: Weak<dyn CapturePipelineDelegate> = Arc::<PreviewDelegate>::downgrade(&delegate);
    pipeline.set_delegate(weak_delegate, queue);
    pipeline.set_filter(filter.into())?;
    pipeline.select_device(device);
    pipeline.start_running()?;

    config.device = DeviceParams::for_device(device);
    if let Err(e) = config.save() {
        warn!(error = %e, "Could not save config");
    }

    if let Ok(transform) = pipeline.transform_from_video_buffer_orientation_to_orientation(
        VideoOrientation::Portrait,
        config.mirroring,
    ) {
        println!(
            "Display transform: [{:.2} {:.2} {:.2} {:.2}]",
            transform.a, transform.b, transform.c, transform.d
        );
    }

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!("Running... (press Ctrl+C to stop early)");
    let start = Instant::now();
    let target_duration = Duration::from_secs(options.duration);
    let mut last_reload = Instant::now();
    while start.elapsed() < target_duration {
        if stop_flag.load(Ordering::SeqCst) || delegate.stopped.load(Ordering::SeqCst) {
            break;
        }
        if follow_preferences && last_reload.elapsed() >= Duration::from_secs(1) {
            last_reload = Instant::now();
            match store.reload() {
                Ok(()) => {
                    let current = FilterPreferences::load(&store);
                    if current != preferences {
                        println!(
                            "\nNow simulating: {} ({})",
                            current.vision_type, current.simulation
                        );
                        pipeline.apply_filter_preferences(current);
                        preferences = current;
                    }
                }
                Err(e) => warn!(error = %e, "Could not reload preferences"),
            }
        }
        let dimensions = pipeline
            .video_dimensions()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        print!(
            "\r{:>6} frames  {:>5.1} fps  {}  dropped {}",
            delegate.frames.load(Ordering::Relaxed),
            pipeline.video_frame_rate(),
            dimensions,
            delegate.exhausted.load(Ordering::Relaxed),
        );
        std::io::Write::flush(&mut std::io::stdout())?;
        std::thread::sleep(Duration::from_millis(200));
    }
    println!();

    pipeline.stop_running();

    if let Some(error) = delegate.error.lock().ok().and_then(|e| e.clone()) {
        return Err(error.into());
    }

    if let Some(output) = options.output {
        let last = delegate.last.lock().ok().and_then(|mut l| l.take());
        match last {
            Some((dimensions, data)) => {
                let path = resolve_output(&output, "preview")?;
                save_png(&path, dimensions, data)?;
                println!("Frame saved: {}", path.display());
            }
            None => println!("No frame was delivered, nothing saved"),
        }
    }

    Ok(())
}

/// Filter a still image through the color vision filter
pub fn simulate(
    input: &Path,
    vision: VisionType,
    simulation: Option<Simulation>,
    output: Option<PathBuf>,
    cpu: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = image::open(input)?.to_rgba8();
    let dimensions = Dimensions::new(image.width(), image.height());

    let mut filter = ColorVisionFilter::fixed(vision);
    match simulation {
        Some(simulation) => filter.set_simulation(simulation),
        None => match JsonPreferenceStore::open_default() {
            Ok(store) => filter.set_simulation(FilterPreferences::load(&store).simulation),
            Err(e) => warn!(error = %e, "Could not read preferences, using the default simulation"),
        },
    }
    println!("Input: {} ({})", input.display(), dimensions);
    println!("Simulating: {} ({})", vision, filter.simulation());

    let frame = FrameBuffer::from_rgba(
        image.into_raw(),
        dimensions.width,
        dimensions.height,
        Duration::ZERO,
        VideoOrientation::default(),
    );

    let filtered = if cpu {
        filter_on_cpu(&frame, &filter)?
    } else {
        match filter_on_gpu(&frame, &mut filter) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "GPU filtering failed, falling back to CPU");
                filter_on_cpu(&frame, &filter)?
            }
        }
    };

    let path = match output {
        Some(path) => path,
        None => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let name = format!("{}_{}.png", stem, format!("{:?}", vision).to_lowercase());
            input.with_file_name(name)
        }
    };
    save_png(&path, dimensions, filtered)?;
    println!("Saved: {}", path.display());
    Ok(())
}

fn filter_on_gpu(
    frame: &FrameBuffer,
    filter: &mut ColorVisionFilter,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut ctx = WgpuContext::new(true)?;
    println!("GPU: {}", ctx.description());

    let target = SurfaceDescriptor::new(frame.width, frame.height);
    filter.prepare(&mut ctx, &target)?;
    let program = filter.program().ok_or("filter has no program")?;

    ctx.use_program(program);
    ctx.upload_texture(frame)?;
    filter.apply_parameters(&mut ctx, frame.width, frame.height);
    let mut output = vec![0u8; frame.packed_len()];
    let rendered = ctx.render_into(frame.width, frame.height, &mut output);
    filter.release(&mut ctx);
    rendered?;
    Ok(output)
}

fn filter_on_cpu(frame: &FrameBuffer, filter: &ColorVisionFilter) -> Result<Vec<u8>, GpuError> {
    let mut pixels = frame.packed_rgba()?;
    filter.simulator().apply_rgba(&mut pixels);
    Ok(pixels)
}

/// List vision types and simulations with their stored ordinals
pub fn list_vision_types() -> Result<(), Box<dyn std::error::Error>> {
    let selected = JsonPreferenceStore::open_default()
        .ok()
        .filter(|store| store.contains(SIM_VISION_TYPE_KEY) || store.contains(SIMULATION_KEY))
        .map(|store| FilterPreferences::load(&store));

    println!("Vision types:");
    for vision in VisionType::ALL {
        let marker = if selected.is_some_and(|p| p.vision_type == vision) {
            "*"
        } else {
            " "
        };
        println!(
            "{} [{}] {:<22} {}",
            marker,
            vision.ordinal(),
            vision.name(),
            vision.description()
        );
    }

    println!();
    println!("Simulations:");
    for simulation in Simulation::ALL {
        let marker = if selected.is_some_and(|p| p.simulation == simulation) {
            "*"
        } else {
            " "
        };
        println!("{} [{}] {}", marker, simulation.ordinal(), simulation.name());
    }
    Ok(())
}

/// Persist the vision type and simulation used when none is given
pub fn select_preferences(
    vision: Option<VisionType>,
    simulation: Option<Simulation>,
) -> Result<(), Box<dyn std::error::Error>> {
    if vision.is_none() && simulation.is_none() {
        return Err("nothing to select: give a vision type, --simulation, or both".into());
    }
    let store = JsonPreferenceStore::open_default()?;
    if let Some(vision) = vision {
        store.set_integer(SIM_VISION_TYPE_KEY, vision.ordinal())?;
        println!("Selected {}", vision);
    }
    if let Some(simulation) = simulation {
        store.set_integer(SIMULATION_KEY, simulation.ordinal())?;
        println!("Selected {}", simulation);
    }
    println!("Saved to {}", store.path().display());
    Ok(())
}

fn save_png(
    path: &Path,
    dimensions: Dimensions,
    data: Vec<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = image::RgbaImage::from_raw(dimensions.width, dimensions.height, data)
        .ok_or("frame data does not match its dimensions")?;
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// A directory gets a timestamped file name; anything else is used as is
fn resolve_output(output: &Path, prefix: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if output.is_dir() {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        return Ok(output.join(format!("{}_{}.png", prefix, timestamp)));
    }
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(output.to_path_buf())
}
