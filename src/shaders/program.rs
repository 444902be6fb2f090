// SPDX-License-Identifier: GPL-3.0-only

//! Shader program builder
//!
//! Compile, link and validate are separate steps so that each can report its
//! own diagnostic log, while [`build_program`] keeps the common path atomic:
//! it returns a fully usable [`Program`] or nothing, and never leaves shader
//! or program objects behind in the context.

use crate::errors::BuildError;
use crate::gpu::{GpuContext, ProgramId, ShaderId, ShaderStage};
use tracing::{debug, warn};

/// A linked program with resolved locations
///
/// `uniforms[i]` and `attributes[i]` correspond to the i-th requested name;
/// -1 means the name was empty or is not used by the program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub id: ProgramId,
    pub uniforms: Vec<i32>,
    pub attributes: Vec<i32>,
    uniform_names: Vec<String>,
}

impl Program {
    /// Location of a requested uniform by name, or -1
    pub fn uniform(&self, name: &str) -> i32 {
        self.uniform_names
            .iter()
            .position(|n| !n.is_empty() && n == name)
            .map(|i| self.uniforms[i])
            .unwrap_or(-1)
    }

    /// Delete the program object
    pub fn release(self, ctx: &mut dyn GpuContext) {
        debug!(program = %self.id, "Releasing program");
        ctx.delete_program(self.id);
    }
}

/// Options for [`build_program`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Treat a validation failure as a build failure
    pub strict_validation: bool,
}

/// What kind of name [`resolve_locations`] looks up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Attribute,
    Uniform,
}

/// Create and compile a shader from the concatenation of `sources`.
///
/// On failure the shader object is deleted and the compiler log returned.
pub fn compile_shader(
    ctx: &mut dyn GpuContext,
    stage: ShaderStage,
    sources: &[&str],
) -> Result<ShaderId, BuildError> {
    let shader = ctx.create_shader(stage);
    let status = ctx.compile_shader(shader, sources);
    if !status.success {
        ctx.delete_shader(shader);
        return Err(BuildError::Compile {
            stage,
            log: status.log,
        });
    }
    if !status.log.is_empty() {
        debug!(%stage, log = %status.log, "Shader compile log");
    }
    Ok(shader)
}

/// Attach both shaders to a new program, bind attribute locations and link.
///
/// The shaders stay owned by the caller, who releases them once this
/// returns whatever the outcome. A program that fails to link is deleted.
pub fn link_program(
    ctx: &mut dyn GpuContext,
    vertex: ShaderId,
    fragment: ShaderId,
    attribute_bindings: &[(u32, &str)],
) -> Result<ProgramId, BuildError> {
    let program = ctx.create_program();
    ctx.attach_shader(program, vertex);
    ctx.attach_shader(program, fragment);
    for (location, name) in attribute_bindings {
        if !name.is_empty() {
            ctx.bind_attrib_location(program, *location, name);
        }
    }

    let status = ctx.link_program(program);
    if !status.success {
        ctx.delete_program(program);
        return Err(BuildError::Link { log: status.log });
    }
    Ok(program)
}

/// Run the context's validation pass over a linked program.
///
/// Failure is reported, not acted upon; callers decide whether it is fatal.
pub fn validate_program(ctx: &mut dyn GpuContext, program: ProgramId) -> Result<(), BuildError> {
    let status = ctx.validate_program(program);
    if status.success {
        Ok(())
    } else {
        Err(BuildError::Validate { log: status.log })
    }
}

/// Look up locations for `names`; empty names are skipped and stay -1
pub fn resolve_locations(
    ctx: &dyn GpuContext,
    program: ProgramId,
    kind: LocationKind,
    names: &[&str],
) -> Vec<i32> {
    names
        .iter()
        .map(|name| {
            if name.is_empty() {
                return -1;
            }
            match kind {
                LocationKind::Attribute => ctx.attrib_location(program, name),
                LocationKind::Uniform => ctx.uniform_location(program, name),
            }
        })
        .collect()
}

/// Compile, link, validate and resolve a vertex/fragment pair.
///
/// On error every object created here has been released and the first error
/// encountered is returned.
pub fn build_program(
    ctx: &mut dyn GpuContext,
    vertex_source: &str,
    fragment_source: &str,
    attribute_bindings: &[(u32, &str)],
    uniform_names: &[&str],
    options: BuildOptions,
) -> Result<Program, BuildError> {
    let vertex = compile_shader(ctx, ShaderStage::Vertex, &[vertex_source])?;
    let fragment = match compile_shader(ctx, ShaderStage::Fragment, &[fragment_source]) {
        Ok(fragment) => fragment,
        Err(e) => {
            ctx.delete_shader(vertex);
            return Err(e);
        }
    };

    let linked = link_program(ctx, vertex, fragment, attribute_bindings);
    ctx.delete_shader(vertex);
    ctx.delete_shader(fragment);
    let program = linked?;

    if let Err(e) = validate_program(ctx, program) {
        if options.strict_validation {
            ctx.delete_program(program);
            return Err(e);
        }
        warn!(%program, error = %e, "Program failed validation");
    }

    let attribute_names: Vec<&str> = attribute_bindings.iter().map(|(_, name)| *name).collect();
    let attributes = resolve_locations(ctx, program, LocationKind::Attribute, &attribute_names);
    let uniforms = resolve_locations(ctx, program, LocationKind::Uniform, uniform_names);

    debug!(%program, ?attributes, ?uniforms, "Program built");

    Ok(Program {
        id: program,
        uniforms,
        attributes,
        uniform_names: uniform_names.iter().map(|n| n.to_string()).collect(),
    })
}
