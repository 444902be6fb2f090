// SPDX-License-Identifier: GPL-3.0-only

//! Headless GPU context for tests and diagnostics
//!
//! Compiles and links exactly like [`WgpuContext`](super::WgpuContext) (same naga
//! front-end, same interface checks) but never touches a GPU. Every trait call
//! bumps a shared [`GpuCallCounter`], so a test can hand the context to the
//! render thread and still observe whether GPU work happened.
//! `render_into` runs the color vision fragment stage on the CPU from the
//! uniforms last written to the program in use; programs without those
//! uniforms copy the uploaded texture.
//!
//! Compile and link failures can be scripted to exercise error paths with
//! otherwise valid sources.

use super::reflect::{self, LinkedInterface, ModuleReflection};
use super::{GpuContext, ProgramId, ShaderId, ShaderStage, StageStatus, UniformValue};
use crate::backends::camera::FrameBuffer;
use crate::errors::GpuError;
use crate::shaders::color_vision::{ColorTransform, HcirnTransform};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared count of GPU calls made through a context, and of the contexts
/// still alive
#[derive(Debug, Clone, Default)]
pub struct GpuCallCounter {
    calls: Arc<AtomicU64>,
    contexts: Arc<AtomicU64>,
}

impl GpuCallCounter {
    pub fn get(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts created on this counter and not yet dropped
    pub fn live_contexts(&self) -> u64 {
        self.contexts.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordedShader {
    stage: ShaderStage,
    reflection: Option<ModuleReflection>,
}

#[derive(Default)]
struct RecordedProgram {
    attached: Vec<ShaderId>,
    requested_attributes: Vec<(u32, String)>,
    stages: Option<(ModuleReflection, ModuleReflection)>,
    linked: Option<LinkedInterface>,
    uniforms: HashMap<i32, UniformValue>,
}

/// Counting, non-rendering [`GpuContext`]
pub struct RecordingContext {
    counter: GpuCallCounter,
    next_id: u32,
    shaders: HashMap<ShaderId, RecordedShader>,
    programs: HashMap<ProgramId, RecordedProgram>,
    current: Option<ProgramId>,
    texture: Option<(u32, u32, Vec<u8>)>,
    compile_failure: Option<(ShaderStage, String)>,
    link_failure: Option<String>,
}

impl Default for RecordingContext {
    fn default() -> Self {
        Self::with_counter(GpuCallCounter::default())
    }
}

impl Drop for RecordingContext {
    fn drop(&mut self) {
        self.counter.contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose calls are added to an existing counter
    pub fn with_counter(counter: GpuCallCounter) -> Self {
        counter.contexts.fetch_add(1, Ordering::SeqCst);
        Self {
            counter,
            next_id: 0,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            current: None,
            texture: None,
            compile_failure: None,
            link_failure: None,
        }
    }

    /// Make every compile of `stage` fail with `log`
    pub fn with_compile_failure(mut self, stage: ShaderStage, log: impl Into<String>) -> Self {
        self.compile_failure = Some((stage, log.into()));
        self
    }

    /// Make every link fail with `log`
    pub fn with_link_failure(mut self, log: impl Into<String>) -> Self {
        self.link_failure = Some(log.into());
        self
    }

    /// Counter this context reports to
    pub fn counter(&self) -> GpuCallCounter {
        self.counter.clone()
    }

    /// Last value written to `location` of the program in use
    pub fn uniform(&self, location: i32) -> Option<UniformValue> {
        self.current
            .and_then(|id| self.programs.get(&id))
            .and_then(|p| p.uniforms.get(&location).copied())
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl RecordedProgram {
    fn uniform(&self, name: &str) -> Option<UniformValue> {
        let location = self.linked.as_ref()?.uniform_location(name);
        self.uniforms.get(&location).copied()
    }

    /// Run the color vision fragment stage on the CPU
    fn shade(&self, pixels: &mut [u8]) {
        let Some(UniformValue::Vec4([r, g, b, intensity])) = self.uniform("monochrome") else {
            return;
        };
        let luma = [r, g, b];
        if let Some(UniformValue::Mat3(matrix)) = self.uniform("color_matrix") {
            ColorTransform {
                matrix,
                luma,
                intensity,
            }
            .apply_rgba(pixels);
        } else if let Some(UniformValue::Vec4(confusion)) = self.uniform("confusion") {
            let anomaly = match self.uniform("anomaly") {
                Some(UniformValue::Vec4([anomaly, ..])) => anomaly,
                _ => 0.0,
            };
            HcirnTransform {
                confusion,
                anomaly,
                luma,
                intensity,
            }
            .apply_rgba(pixels);
        }
    }
}

impl GpuContext for RecordingContext {
    fn description(&self) -> String {
        "recording context (headless)".to_string()
    }

    fn create_shader(&mut self, stage: ShaderStage) -> ShaderId {
        self.counter.bump();
        let id = ShaderId(self.next_id());
        self.shaders.insert(
            id,
            RecordedShader {
                stage,
                reflection: None,
            },
        );
        id
    }

    fn compile_shader(&mut self, shader: ShaderId, sources: &[&str]) -> StageStatus {
        self.counter.bump();
        let Some(object) = self.shaders.get_mut(&shader) else {
            return StageStatus::failed(format!("unknown {}", shader));
        };
        if let Some((stage, log)) = &self.compile_failure
            && *stage == object.stage
        {
            return StageStatus::failed(log.clone());
        }
        match reflect::compile_wgsl(object.stage, &sources.concat()) {
            Ok(reflection) => {
                object.reflection = Some(reflection);
                StageStatus::ok()
            }
            Err(log) => StageStatus::failed(log),
        }
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.counter.bump();
        self.shaders.remove(&shader);
    }

    fn create_program(&mut self) -> ProgramId {
        self.counter.bump();
        let id = ProgramId(self.next_id());
        self.programs.insert(id, RecordedProgram::default());
        id
    }

    fn attach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        self.counter.bump();
        if let Some(p) = self.programs.get_mut(&program) {
            p.attached.push(shader);
        }
    }

    fn bind_attrib_location(&mut self, program: ProgramId, location: u32, name: &str) {
        self.counter.bump();
        if let Some(p) = self.programs.get_mut(&program) {
            p.requested_attributes.push((location, name.to_string()));
        }
    }

    fn link_program(&mut self, program: ProgramId) -> StageStatus {
        self.counter.bump();
        let Some(p) = self.programs.get(&program) else {
            return StageStatus::failed(format!("unknown {}", program));
        };

        let mut vertex = None;
        let mut fragment = None;
        for id in &p.attached {
            match self.shaders.get(id) {
                Some(RecordedShader {
                    stage: ShaderStage::Vertex,
                    reflection: Some(r),
                }) => vertex = Some(r.clone()),
                Some(RecordedShader {
                    stage: ShaderStage::Fragment,
                    reflection: Some(r),
                }) => fragment = Some(r.clone()),
                _ => return StageStatus::failed(format!("{} is not a compiled shader", id)),
            }
        }
        let (Some(vertex), Some(fragment)) = (vertex, fragment) else {
            return StageStatus::failed("program needs a compiled vertex and fragment shader");
        };
        if let Some(log) = &self.link_failure {
            return StageStatus::failed(log.clone());
        }

        match reflect::link_interface(&vertex, &fragment, &p.requested_attributes) {
            Ok(linked) => {
                if let Some(p) = self.programs.get_mut(&program) {
                    p.linked = Some(linked);
                    p.stages = Some((vertex, fragment));
                }
                StageStatus::ok()
            }
            Err(log) => StageStatus::failed(log),
        }
    }

    fn validate_program(&mut self, program: ProgramId) -> StageStatus {
        self.counter.bump();
        match self.programs.get(&program).and_then(|p| p.stages.as_ref()) {
            Some((vertex, fragment)) => match reflect::validate_interface(vertex, fragment) {
                Ok(()) => StageStatus::ok(),
                Err(log) => StageStatus::failed(log),
            },
            None => StageStatus::failed(format!("{} is not linked", program)),
        }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> i32 {
        self.counter.bump();
        self.programs
            .get(&program)
            .and_then(|p| p.linked.as_ref())
            .map(|l| l.uniform_location(name))
            .unwrap_or(-1)
    }

    fn attrib_location(&self, program: ProgramId, name: &str) -> i32 {
        self.counter.bump();
        self.programs
            .get(&program)
            .and_then(|p| p.linked.as_ref())
            .map(|l| l.attrib_location(name))
            .unwrap_or(-1)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.counter.bump();
        self.programs.remove(&program);
        if self.current == Some(program) {
            self.current = None;
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.counter.bump();
        self.current = Some(program);
    }

    fn set_uniform(&mut self, location: i32, value: UniformValue) {
        self.counter.bump();
        if location < 0 {
            return;
        }
        if let Some(p) = self.current.and_then(|id| self.programs.get_mut(&id)) {
            p.uniforms.insert(location, value);
        }
    }

    fn upload_texture(&mut self, frame: &FrameBuffer) -> Result<(), GpuError> {
        self.counter.bump();
        let packed = frame.packed_rgba()?;
        self.texture = Some((frame.width, frame.height, packed));
        Ok(())
    }

    fn render_into(&mut self, width: u32, height: u32, output: &mut [u8]) -> Result<(), GpuError> {
        self.counter.bump();
        let Some(program) = self
            .current
            .and_then(|id| self.programs.get(&id))
            .filter(|p| p.linked.is_some())
        else {
            return Err(GpuError::NoProgram);
        };
        match &self.texture {
            Some((w, h, data)) if *w == width && *h == height && output.len() == data.len() => {
                output.copy_from_slice(data);
                program.shade(output);
                Ok(())
            }
            _ => Err(GpuError::InvalidFrame(format!(
                "render target {}x{} does not match the uploaded texture",
                width, height
            ))),
        }
    }

    fn live_objects(&self) -> usize {
        self.shaders.len() + self.programs.len()
    }
}
