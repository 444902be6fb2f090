// SPDX-License-Identifier: GPL-3.0-only
//! Shader programs and per-frame filters
//!
//! - [`program`]: compile/link/validate with per-stage diagnostics
//! - [`filter`]: the [`ShaderFilter`] capability and the built-in [`Filter`] set
//! - [`color_vision`]: color vision deficiency simulation
//! - [`preferences`]: where the selected vision type and simulation are persisted
//!
//! WGSL sources live next to the module that uses them.

pub mod color_vision;
pub mod filter;
pub mod preferences;
pub mod program;

pub use color_vision::{
    ColorTransform, ColorVisionFilter, FilterPreferences, HcirnTransform, SIM_VISION_TYPE_KEY,
    SIMULATION_KEY, Simulation, Simulator, VisionType, register_defaults,
};
pub use filter::{Filter, PassthroughFilter, ShaderFilter, SurfaceDescriptor};
pub use preferences::{JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use program::{
    BuildOptions, LocationKind, Program, build_program, compile_shader, link_program,
    resolve_locations, validate_program,
};
