// SPDX-License-Identifier: GPL-3.0-only

//! Shader filter abstraction
//!
//! Building a program is expensive and depends on the render target, so it
//! happens in [`ShaderFilter::prepare`], which is idempotent for an unchanged
//! target. Per-frame work is limited to [`ShaderFilter::apply_parameters`],
//! which only writes uniforms.

use super::color_vision::ColorVisionFilter;
use super::program::{BuildOptions, Program, build_program};
use crate::constants::vertex;
use crate::errors::BuildError;
use crate::gpu::{GpuContext, ProgramId};
use tracing::{debug, info};

/// Vertex attributes every filter binds before linking
pub const QUAD_ATTRIBUTES: &[(&str, u32)] = &[
    ("position", vertex::ATTRIB_POSITION),
    ("tex_coord", vertex::ATTRIB_TEX_COORD),
];

/// Vertex stage shared by the built-in filters
pub const QUAD_VERTEX_SOURCE: &str = include_str!("filter_vertex.wgsl");

/// Render target a filter is prepared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDescriptor {
    pub width: u32,
    pub height: u32,
}

impl SurfaceDescriptor {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A per-frame GPU color transform
pub trait ShaderFilter: Send {
    fn name(&self) -> &str;

    fn vertex_source(&self) -> &'static str;

    fn fragment_source(&self) -> &'static str;

    /// (attribute name, requested location) pairs bound before linking
    fn attribute_bindings(&self) -> &'static [(&'static str, u32)] {
        QUAD_ATTRIBUTES
    }

    /// Build GPU state for `target`; a no-op when already prepared for it
    fn prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        target: &SurfaceDescriptor,
    ) -> Result<(), BuildError>;

    /// Linked program, once prepared
    fn program(&self) -> Option<ProgramId>;

    /// Push per-frame uniforms for a texture of the given size.
    ///
    /// Runs on the render thread with the filter's program in use; must not
    /// create GPU objects.
    fn apply_parameters(&self, ctx: &mut dyn GpuContext, width: u32, height: u32);

    /// Delete the program; the next `prepare` rebuilds it
    fn release(&mut self, ctx: &mut dyn GpuContext);

    /// Forget the program without GPU calls, for when its context is being
    /// torn down anyway
    fn abandon(&mut self);
}

#[derive(Debug)]
struct Prepared {
    program: Program,
    target: SurfaceDescriptor,
    filter_name: String,
}

/// Program state shared by the concrete filters
///
/// The program is keyed by the filter name and the render target; a filter
/// with several shader variants gives each its own name.
#[derive(Debug, Default)]
pub struct PreparedProgram {
    prepared: Option<Prepared>,
}

impl PreparedProgram {
    /// Build the program for `target` unless it already exists for it
    pub fn ensure(
        &mut self,
        ctx: &mut dyn GpuContext,
        filter_name: &str,
        sources: (&str, &str),
        attributes: &[(&str, u32)],
        uniform_names: &[&str],
        target: &SurfaceDescriptor,
    ) -> Result<(), BuildError> {
        if let Some(prepared) = &self.prepared {
            if prepared.filter_name != filter_name {
                debug!(
                    from = %prepared.filter_name,
                    to = filter_name,
                    "Filter variant changed, rebuilding program"
                );
            } else if prepared.target != *target {
                debug!(filter = filter_name, ?target, "Render target changed, rebuilding program");
            } else {
                return Ok(());
            }
        }
        self.release(ctx);

        let bindings: Vec<(u32, &str)> = attributes
            .iter()
            .map(|(name, location)| (*location, *name))
            .collect();
        let program = build_program(
            ctx,
            sources.0,
            sources.1,
            &bindings,
            uniform_names,
            BuildOptions::default(),
        )?;

        info!(
            filter = filter_name,
            program = %program.id,
            width = target.width,
            height = target.height,
            "Filter prepared"
        );
        self.prepared = Some(Prepared {
            program,
            target: *target,
            filter_name: filter_name.to_string(),
        });
        Ok(())
    }

    pub fn program(&self) -> Option<&Program> {
        self.prepared.as_ref().map(|p| &p.program)
    }

    pub fn release(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(prepared) = self.prepared.take() {
            prepared.program.release(ctx);
        }
    }

    pub fn abandon(&mut self) {
        self.prepared = None;
    }
}

/// Copies frames unchanged
#[derive(Debug, Default)]
pub struct PassthroughFilter {
    program: PreparedProgram,
}

impl PassthroughFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShaderFilter for PassthroughFilter {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn vertex_source(&self) -> &'static str {
        QUAD_VERTEX_SOURCE
    }

    fn fragment_source(&self) -> &'static str {
        include_str!("passthrough.wgsl")
    }

    fn prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        target: &SurfaceDescriptor,
    ) -> Result<(), BuildError> {
        let sources = (self.vertex_source(), self.fragment_source());
        let attributes = self.attribute_bindings();
        self.program
            .ensure(ctx, "passthrough", sources, attributes, &[], target)
    }

    fn program(&self) -> Option<ProgramId> {
        self.program.program().map(|p| p.id)
    }

    fn apply_parameters(&self, _ctx: &mut dyn GpuContext, _width: u32, _height: u32) {}

    fn release(&mut self, ctx: &mut dyn GpuContext) {
        self.program.release(ctx);
    }

    fn abandon(&mut self) {
        self.program.abandon();
    }
}

/// Filter selected at configuration time
#[derive(Debug)]
pub enum Filter {
    Passthrough(PassthroughFilter),
    ColorVision(ColorVisionFilter),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Passthrough(PassthroughFilter::new())
    }
}

impl Filter {
    pub fn as_color_vision_mut(&mut self) -> Option<&mut ColorVisionFilter> {
        match self {
            Filter::ColorVision(f) => Some(f),
            Filter::Passthrough(_) => None,
        }
    }

    fn inner(&self) -> &dyn ShaderFilter {
        match self {
            Filter::Passthrough(f) => f,
            Filter::ColorVision(f) => f,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ShaderFilter {
        match self {
            Filter::Passthrough(f) => f,
            Filter::ColorVision(f) => f,
        }
    }
}

impl From<ColorVisionFilter> for Filter {
    fn from(filter: ColorVisionFilter) -> Self {
        Filter::ColorVision(filter)
    }
}

impl ShaderFilter for Filter {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn vertex_source(&self) -> &'static str {
        self.inner().vertex_source()
    }

    fn fragment_source(&self) -> &'static str {
        self.inner().fragment_source()
    }

    fn attribute_bindings(&self) -> &'static [(&'static str, u32)] {
        self.inner().attribute_bindings()
    }

    fn prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        target: &SurfaceDescriptor,
    ) -> Result<(), BuildError> {
        self.inner_mut().prepare(ctx, target)
    }

    fn program(&self) -> Option<ProgramId> {
        self.inner().program()
    }

    fn apply_parameters(&self, ctx: &mut dyn GpuContext, width: u32, height: u32) {
        self.inner().apply_parameters(ctx, width, height)
    }

    fn release(&mut self, ctx: &mut dyn GpuContext) {
        self.inner_mut().release(ctx)
    }

    fn abandon(&mut self) {
        self.inner_mut().abandon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingContext;

    #[test]
    fn test_prepare_is_idempotent() {
        let mut ctx = RecordingContext::new();
        let counter = ctx.counter();
        let mut filter = Filter::default();
        let target = SurfaceDescriptor::new(64, 48);

        filter.prepare(&mut ctx, &target).unwrap();
        let program = filter.program();
        let calls = counter.get();

        filter.prepare(&mut ctx, &target).unwrap();
        assert_eq!(filter.program(), program);
        assert_eq!(counter.get(), calls);
        assert_eq!(ctx.live_objects(), 1);
    }

    #[test]
    fn test_new_target_rebuilds() {
        let mut ctx = RecordingContext::new();
        let mut filter = Filter::default();

        filter.prepare(&mut ctx, &SurfaceDescriptor::new(64, 48)).unwrap();
        let first = filter.program();
        filter.prepare(&mut ctx, &SurfaceDescriptor::new(32, 24)).unwrap();

        assert_ne!(filter.program(), first);
        assert_eq!(ctx.live_objects(), 1);

        filter.release(&mut ctx);
        assert!(filter.program().is_none());
        assert_eq!(ctx.live_objects(), 0);
    }

    #[test]
    fn test_failed_prepare_leaves_no_program() {
        let mut ctx = RecordingContext::new().with_link_failure("scripted");
        let mut filter = Filter::default();
        let err = filter
            .prepare(&mut ctx, &SurfaceDescriptor::new(8, 8))
            .unwrap_err();
        assert!(matches!(err, BuildError::Link { .. }));
        assert!(filter.program().is_none());
        assert_eq!(ctx.live_objects(), 0);
    }
}
