// SPDX-License-Identifier: GPL-3.0-only

//! Color vision deficiency simulation
//!
//! Two simulations are available:
//!
//! - [`Simulation::Machado`]: the Machado, Oliveira and Fernandes (2009)
//!   matrices at full and 0.6 severity
//! - [`Simulation::Hcirn`]: Wickline's projection onto the dichromat's
//!   confusion line (the HCIRN Color Laboratory algorithm), mixed with the
//!   original color for anomalous trichromacy
//!
//! Both mix the result towards its Rec. 709 luminance for monochromacy. All
//! transforms operate in linear light: the GPU path samples an sRGB texture,
//! and [`Simulator::apply_rgba`] converts explicitly.

use super::filter::{PreparedProgram, QUAD_VERTEX_SOURCE, ShaderFilter, SurfaceDescriptor};
use super::preferences::PreferenceStore;
use crate::errors::{BuildError, ConfigError};
use crate::gpu::{GpuContext, ProgramId, UniformValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Preference key holding the selected [`VisionType`] ordinal
pub const SIM_VISION_TYPE_KEY: &str = "SimVisionType";
/// Preference key holding the selected [`Simulation`] ordinal
pub const SIMULATION_KEY: &str = "SimulationKey";

pub const VERTEX_SOURCE: &str = QUAD_VERTEX_SOURCE;
pub const FRAGMENT_SOURCE: &str = include_str!("color_vision.wgsl");
pub const HCIRN_FRAGMENT_SOURCE: &str = include_str!("hcirn.wgsl");

/// Uniforms written by [`ColorVisionFilter::apply_parameters`] for Machado
pub const UNIFORM_NAMES: &[&str] = &["color_matrix", "monochrome", "texture_size"];
/// Uniforms written by [`ColorVisionFilter::apply_parameters`] for HCIRN
pub const HCIRN_UNIFORM_NAMES: &[&str] = &["confusion", "anomaly", "monochrome", "texture_size"];

/// Rec. 709 luminance weights
const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

const IDENTITY: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

// Column-major
const DEUTERANOPIA: [f32; 9] = [
    0.367322, 0.280085, -0.011820, 0.860646, 0.672501, 0.042940, -0.227968, 0.047413, 0.968881,
];
const DEUTERANOMALY: [f32; 9] = [
    0.457771, 0.226409, -0.011595, 0.731899, 0.731012, 0.034333, -0.189670, 0.042579, 0.977261,
];
const PROTANOPIA: [f32; 9] = [
    0.152286, 0.114503, -0.003882, 1.052583, 0.786281, -0.048116, -0.204868, 0.099216, 1.051998,
];
const PROTANOMALY: [f32; 9] = [
    0.319627, 0.106241, -0.007025, 0.849633, 0.815969, -0.028051, -0.169261, 0.077790, 1.035076,
];
const TRITANOPIA: [f32; 9] = [
    1.255528, -0.078411, 0.004733, -0.076749, 0.930809, 0.691367, -0.178779, 0.147602, 0.303900,
];
const TRITANOMALY: [f32; 9] = [
    1.193214, -0.058496, -0.002346, -0.109812, 0.979410, 0.403492, -0.083402, 0.079086, 0.598854,
];

/// CIE 1931 chromaticities of a dichromat's confusion point and of the two
/// ends of the axis that keeps its colors
struct ConfusionLine {
    point: [f32; 2],
    axis_start: [f32; 2],
    axis_end: [f32; 2],
}

impl ConfusionLine {
    /// `[point u, point v, axis slope, axis intercept]`
    fn uniform(&self) -> [f32; 4] {
        let slope =
            (self.axis_end[1] - self.axis_start[1]) / (self.axis_end[0] - self.axis_start[0]);
        let intercept = self.axis_start[1] - self.axis_start[0] * slope;
        [self.point[0], self.point[1], slope, intercept]
    }
}

const PROTAN_LINE: ConfusionLine = ConfusionLine {
    point: [0.735, 0.265],
    axis_start: [0.115807, 0.073581],
    axis_end: [0.471899, 0.527051],
};
const DEUTAN_LINE: ConfusionLine = ConfusionLine {
    point: [1.14, -0.14],
    axis_start: [0.102776, 0.102864],
    axis_end: [0.505845, 0.493211],
};
const TRITAN_LINE: ConfusionLine = ConfusionLine {
    point: [0.171, -0.003],
    axis_start: [0.045391, 0.294976],
    axis_end: [0.665764, 0.334011],
};

/// Weight of the dichromat projection for anomalous trichromacy
const ANOMALY: f32 = 0.66;

// Linear RGB <-> CIE XYZ, row-major
const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.430574, 0.341550, 0.178325],
    [0.222015, 0.706655, 0.071330],
    [0.020183, 0.129553, 0.939180],
];
const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.063218, -1.393325, -0.475802],
    [-0.969243, 1.875966, 0.041555],
    [0.067871, -0.228834, 1.069251],
];
const WHITE_XYZ: [f32; 3] = [0.312713, 0.329016, 0.358271];

/// Simulation algorithm
///
/// The discriminants are persisted; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Simulation {
    Hcirn = 0,
    #[default]
    Machado = 1,
}

impl Simulation {
    pub const ALL: [Simulation; 2] = [Simulation::Hcirn, Simulation::Machado];

    pub fn ordinal(self) -> i64 {
        self as u8 as i64
    }

    /// Simulation for a persisted ordinal; unknown values fall back to `Machado`
    pub fn from_ordinal(ordinal: i64) -> Self {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        match self {
            Simulation::Hcirn => "Wickline (HCIRN)",
            Simulation::Machado => "Machado et al.",
        }
    }
}

impl fmt::Display for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Simulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "0" | "hcirn" | "wickline" => Ok(Simulation::Hcirn),
            "1" | "machado" => Ok(Simulation::Machado),
            _ => Err(format!("unknown simulation '{}'", s)),
        }
    }
}

/// Simulated vision
///
/// The discriminants are persisted; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum VisionType {
    #[default]
    Normal = 0,
    Deuteranopia = 1,
    Deuteranomaly = 2,
    Protanopia = 3,
    Protanomaly = 4,
    Tritanopia = 5,
    Tritanomaly = 6,
    Monochromacy = 7,
    PartialMonochromacy = 8,
}

impl VisionType {
    pub const ALL: [VisionType; 9] = [
        VisionType::Normal,
        VisionType::Deuteranopia,
        VisionType::Deuteranomaly,
        VisionType::Protanopia,
        VisionType::Protanomaly,
        VisionType::Tritanopia,
        VisionType::Tritanomaly,
        VisionType::Monochromacy,
        VisionType::PartialMonochromacy,
    ];

    pub fn ordinal(self) -> i64 {
        self as u8 as i64
    }

    /// Vision type for a persisted ordinal; unknown values fall back to `Normal`
    pub fn from_ordinal(ordinal: i64) -> Self {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        match self {
            VisionType::Normal => "Normal Vision",
            VisionType::Deuteranopia => "Deuteranopia",
            VisionType::Deuteranomaly => "Deuteranomaly",
            VisionType::Protanopia => "Protanopia",
            VisionType::Protanomaly => "Protanomaly",
            VisionType::Tritanopia => "Tritanopia",
            VisionType::Tritanomaly => "Tritanomaly",
            VisionType::Monochromacy => "Monochromacy",
            VisionType::PartialMonochromacy => "Partial Monochromacy",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            VisionType::Normal => "Trichromatic: red, green, and blue cones",
            VisionType::Deuteranopia => "No green cones",
            VisionType::Deuteranomaly => "Anomalous green cones",
            VisionType::Protanopia => "No red cones",
            VisionType::Protanomaly => "Anomalous red cones",
            VisionType::Tritanopia => "No blue cones",
            VisionType::Tritanomaly => "Anomalous blue cones",
            VisionType::Monochromacy => "Absent or non-functionning cones",
            VisionType::PartialMonochromacy => "Reduced sensitivity to colors",
        }
    }

    /// Color transform simulating this vision type
    pub fn transform(self) -> ColorTransform {
        let (matrix, intensity) = match self {
            VisionType::Normal => (IDENTITY, 0.0),
            VisionType::Deuteranopia => (DEUTERANOPIA, 0.0),
            VisionType::Deuteranomaly => (DEUTERANOMALY, 0.0),
            VisionType::Protanopia => (PROTANOPIA, 0.0),
            VisionType::Protanomaly => (PROTANOMALY, 0.0),
            VisionType::Tritanopia => (TRITANOPIA, 0.0),
            VisionType::Tritanomaly => (TRITANOMALY, 0.0),
            VisionType::Monochromacy => (IDENTITY, 1.0),
            VisionType::PartialMonochromacy => (IDENTITY, 0.66),
        };
        ColorTransform {
            matrix,
            luma: LUMA,
            intensity,
        }
    }

    /// Confusion-line projection simulating this vision type
    pub fn hcirn_transform(self) -> HcirnTransform {
        let (line, anomaly, intensity) = match self {
            VisionType::Normal => (None, 0.0, 0.0),
            VisionType::Deuteranopia => (Some(&DEUTAN_LINE), 1.0, 0.0),
            VisionType::Deuteranomaly => (Some(&DEUTAN_LINE), ANOMALY, 0.0),
            VisionType::Protanopia => (Some(&PROTAN_LINE), 1.0, 0.0),
            VisionType::Protanomaly => (Some(&PROTAN_LINE), ANOMALY, 0.0),
            VisionType::Tritanopia => (Some(&TRITAN_LINE), 1.0, 0.0),
            VisionType::Tritanomaly => (Some(&TRITAN_LINE), ANOMALY, 0.0),
            VisionType::Monochromacy => (None, 0.0, 1.0),
            VisionType::PartialMonochromacy => (None, 0.0, 0.66),
        };
        HcirnTransform {
            confusion: line.map(ConfusionLine::uniform).unwrap_or_default(),
            anomaly,
            luma: LUMA,
            intensity,
        }
    }

    /// CPU mirror of the filter for this vision type under `simulation`
    pub fn simulator(self, simulation: Simulation) -> Simulator {
        match simulation {
            Simulation::Machado => Simulator::Machado(self.transform()),
            Simulation::Hcirn => Simulator::Hcirn(self.hcirn_transform()),
        }
    }
}

impl fmt::Display for VisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses an ordinal or a name, ignoring case, spaces and dashes
/// ("deuteranopia", "partial-monochromacy", "7")
impl std::str::FromStr for VisionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ordinal) = s.trim().parse::<usize>() {
            return Self::ALL
                .get(ordinal)
                .copied()
                .ok_or_else(|| format!("no vision type with ordinal {}", ordinal));
        }
        let normalize = |name: &str| {
            name.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        };
        let wanted = normalize(s);
        Self::ALL
            .into_iter()
            .find(|v| normalize(v.name()) == wanted || normalize(&format!("{:?}", v)) == wanted)
            .ok_or_else(|| format!("unknown vision type '{}'", s))
    }
}

/// Linear-light color transform: a 3x3 matrix followed by a mix towards
/// luminance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransform {
    /// Column-major
    pub matrix: [f32; 9],
    pub luma: [f32; 3],
    /// 0 keeps the matrix output, 1 is fully monochrome
    pub intensity: f32,
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

impl ColorTransform {
    pub fn is_identity(&self) -> bool {
        self.matrix == IDENTITY && self.intensity == 0.0
    }

    /// Transform one linear RGB color
    pub fn apply_linear(&self, rgb: [f32; 3]) -> [f32; 3] {
        let m = &self.matrix;
        let mut out = [0.0f32; 3];
        for (row, value) in out.iter_mut().enumerate() {
            *value = (m[row] * rgb[0] + m[3 + row] * rgb[1] + m[6 + row] * rgb[2]).clamp(0.0, 1.0);
        }
        let luma = out[0] * self.luma[0] + out[1] * self.luma[1] + out[2] * self.luma[2];
        out.map(|c| c * (1.0 - self.intensity) + luma * self.intensity)
    }

    /// Transform tightly packed 8-bit sRGB RGBA pixels in place; alpha is kept
    pub fn apply_rgba(&self, pixels: &mut [u8]) {
        if !self.is_identity() {
            map_srgb_pixels(pixels, |rgb| self.apply_linear(rgb));
        }
    }

    fn uniforms(&self) -> (UniformValue, UniformValue) {
        (
            UniformValue::Mat3(self.matrix),
            monochrome_uniform(self.luma, self.intensity),
        )
    }
}

fn map_srgb_pixels(pixels: &mut [u8], transform: impl Fn([f32; 3]) -> [f32; 3]) {
    for px in pixels.chunks_exact_mut(4) {
        let rgb = [px[0], px[1], px[2]].map(|c| srgb_to_linear(c as f32 / 255.0));
        let out = transform(rgb);
        for (dst, c) in px.iter_mut().zip(out) {
            *dst = (linear_to_srgb(c) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn monochrome_uniform(luma: [f32; 3], intensity: f32) -> UniformValue {
    let [r, g, b] = luma;
    UniformValue::Vec4([r, g, b, intensity])
}

fn mul3(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    m.map(|row| row[0] * v[0] + row[1] * v[1] + row[2] * v[2])
}

/// Keeps a divisor away from zero
fn nonzero(x: f32) -> f32 {
    if x.abs() < 1e-6 { 1e-6 } else { x }
}

/// Linear-light confusion-line projection followed by a mix towards
/// luminance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HcirnTransform {
    /// Confusion point u, v, then the slope and intercept of the kept axis
    pub confusion: [f32; 4],
    /// Weight of the projected color: 1 for dichromacy, 0 leaves it unchanged
    pub anomaly: f32,
    pub luma: [f32; 3],
    /// 0 keeps the projected color, 1 is fully monochrome
    pub intensity: f32,
}

impl HcirnTransform {
    pub fn is_identity(&self) -> bool {
        self.anomaly == 0.0 && self.intensity == 0.0
    }

    /// Color a dichromat confuses `rgb` with
    fn project(&self, rgb: [f32; 3]) -> [f32; 3] {
        let [point_u, point_v, axis_slope, axis_intercept] = self.confusion;
        let [x, y, z] = mul3(&RGB_TO_XYZ, rgb);
        let sum = x + y + z;
        if sum <= 0.0 {
            return rgb;
        }
        let (u, v) = (x / sum, y / sum);

        // Where the confusion line through this color meets the kept axis
        let slope = (point_v - v) / nonzero(point_u - u);
        let intercept = v - u * slope;
        let du = (axis_intercept - intercept) / nonzero(slope - axis_slope);
        let dv = nonzero(slope * du + intercept);
        let simulated = [du * y / dv, y, (1.0 - (du + dv)) * y / dv];

        // Shift towards neutral grey of the same luminance until in gamut
        let neutral = [WHITE_XYZ[0] * y / WHITE_XYZ[1], WHITE_XYZ[2] * y / WHITE_XYZ[1]];
        let s = mul3(&XYZ_TO_RGB, simulated);
        let d = mul3(
            &XYZ_TO_RGB,
            [neutral[0] - simulated[0], 0.0, neutral[1] - simulated[2]],
        );
        let adjust = s
            .iter()
            .zip(d)
            .map(|(&s, d)| {
                if d == 0.0 {
                    return 0.0;
                }
                let a = (if s < 0.0 { 0.0 } else { 1.0 } - s) / d;
                if (0.0..=1.0).contains(&a) { a } else { 0.0 }
            })
            .fold(0.0f32, f32::max);

        [0, 1, 2].map(|i| (s[i] + adjust * d[i]).clamp(0.0, 1.0))
    }

    /// Transform one linear RGB color
    pub fn apply_linear(&self, rgb: [f32; 3]) -> [f32; 3] {
        let out = if self.anomaly > 0.0 {
            let projected = self.project(rgb);
            [0, 1, 2].map(|i| rgb[i] + (projected[i] - rgb[i]) * self.anomaly)
        } else {
            rgb
        };
        let luma = out[0] * self.luma[0] + out[1] * self.luma[1] + out[2] * self.luma[2];
        out.map(|c| c * (1.0 - self.intensity) + luma * self.intensity)
    }

    /// Transform tightly packed 8-bit sRGB RGBA pixels in place; alpha is kept
    pub fn apply_rgba(&self, pixels: &mut [u8]) {
        if !self.is_identity() {
            map_srgb_pixels(pixels, |rgb| self.apply_linear(rgb));
        }
    }
}

/// CPU mirror of a color vision filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Simulator {
    Machado(ColorTransform),
    Hcirn(HcirnTransform),
}

impl Simulator {
    pub fn is_identity(&self) -> bool {
        match self {
            Simulator::Machado(t) => t.is_identity(),
            Simulator::Hcirn(t) => t.is_identity(),
        }
    }

    pub fn apply_linear(&self, rgb: [f32; 3]) -> [f32; 3] {
        match self {
            Simulator::Machado(t) => t.apply_linear(rgb),
            Simulator::Hcirn(t) => t.apply_linear(rgb),
        }
    }

    pub fn apply_rgba(&self, pixels: &mut [u8]) {
        match self {
            Simulator::Machado(t) => t.apply_rgba(pixels),
            Simulator::Hcirn(t) => t.apply_rgba(pixels),
        }
    }
}

/// Filter settings as persisted by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterPreferences {
    pub vision_type: VisionType,
    pub simulation: Simulation,
}

impl FilterPreferences {
    /// Read both settings; missing or unknown values fall back to the defaults
    pub fn load(store: &dyn PreferenceStore) -> Self {
        Self {
            vision_type: store
                .integer(SIM_VISION_TYPE_KEY)
                .map(VisionType::from_ordinal)
                .unwrap_or_default(),
            simulation: store
                .integer(SIMULATION_KEY)
                .map(Simulation::from_ordinal)
                .unwrap_or_default(),
        }
    }
}

/// Seed preference defaults for the color vision filter.
///
/// Existing values are never overwritten.
pub fn register_defaults(store: &dyn PreferenceStore) -> Result<(), ConfigError> {
    let defaults = [
        (SIM_VISION_TYPE_KEY, VisionType::default().ordinal()),
        (SIMULATION_KEY, Simulation::default().ordinal()),
    ];
    for (key, value) in defaults {
        if !store.contains(key) {
            debug!(key, value, "Registering preference default");
            store.set_integer(key, value)?;
        }
    }
    Ok(())
}

/// Color vision simulation filter
///
/// With `fixed_vision_type` set, preference refreshes are ignored and the
/// explicitly set vision type and simulation are always used. Changing the
/// vision type only changes uniforms; changing the simulation swaps the
/// fragment stage, so the program is rebuilt on the next `prepare`.
#[derive(Debug, Default)]
pub struct ColorVisionFilter {
    vision_type: VisionType,
    simulation: Simulation,
    fixed_vision_type: bool,
    program: PreparedProgram,
}

impl ColorVisionFilter {
    pub fn new(vision_type: VisionType) -> Self {
        Self {
            vision_type,
            ..Default::default()
        }
    }

    /// Filter pinned to `vision_type`
    pub fn fixed(vision_type: VisionType) -> Self {
        Self {
            vision_type,
            fixed_vision_type: true,
            ..Default::default()
        }
    }

    pub fn with_simulation(mut self, simulation: Simulation) -> Self {
        self.simulation = simulation;
        self
    }

    /// Filter using the persisted settings
    pub fn from_preferences(store: &dyn PreferenceStore) -> Self {
        let mut filter = Self::default();
        filter.refresh_from_preferences(store);
        filter
    }

    pub fn vision_type(&self) -> VisionType {
        self.vision_type
    }

    pub fn set_vision_type(&mut self, vision_type: VisionType) {
        self.vision_type = vision_type;
    }

    pub fn simulation(&self) -> Simulation {
        self.simulation
    }

    pub fn set_simulation(&mut self, simulation: Simulation) {
        self.simulation = simulation;
    }

    pub fn fixed_vision_type(&self) -> bool {
        self.fixed_vision_type
    }

    pub fn set_fixed_vision_type(&mut self, fixed: bool) {
        self.fixed_vision_type = fixed;
    }

    /// Adopt `preferences` unless the vision type is fixed. Returns whether
    /// anything changed.
    pub fn apply_preferences(&mut self, preferences: &FilterPreferences) -> bool {
        if self.fixed_vision_type {
            return false;
        }
        let mut changed = false;
        if preferences.vision_type != self.vision_type {
            info!(
                from = %self.vision_type,
                to = %preferences.vision_type,
                "Vision type changed in preferences"
            );
            self.vision_type = preferences.vision_type;
            changed = true;
        }
        if preferences.simulation != self.simulation {
            info!(
                from = %self.simulation,
                to = %preferences.simulation,
                "Simulation changed in preferences"
            );
            self.simulation = preferences.simulation;
            changed = true;
        }
        changed
    }

    /// Re-read the persisted settings unless fixed. Returns whether anything
    /// changed.
    pub fn refresh_from_preferences(&mut self, store: &dyn PreferenceStore) -> bool {
        self.apply_preferences(&FilterPreferences::load(store))
    }

    pub fn transform(&self) -> ColorTransform {
        self.vision_type.transform()
    }

    pub fn simulator(&self) -> Simulator {
        self.vision_type.simulator(self.simulation)
    }

    fn variant(&self) -> (&'static str, &'static str, &'static [&'static str]) {
        match self.simulation {
            Simulation::Machado => ("color-vision/machado", FRAGMENT_SOURCE, UNIFORM_NAMES),
            Simulation::Hcirn => (
                "color-vision/hcirn",
                HCIRN_FRAGMENT_SOURCE,
                HCIRN_UNIFORM_NAMES,
            ),
        }
    }
}

impl ShaderFilter for ColorVisionFilter {
    fn name(&self) -> &str {
        self.variant().0
    }

    fn vertex_source(&self) -> &'static str {
        VERTEX_SOURCE
    }

    fn fragment_source(&self) -> &'static str {
        self.variant().1
    }

    fn prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        target: &SurfaceDescriptor,
    ) -> Result<(), BuildError> {
        let attributes = self.attribute_bindings();
        let (name, fragment, uniforms) = self.variant();
        self.program
            .ensure(ctx, name, (VERTEX_SOURCE, fragment), attributes, uniforms, target)
    }

    fn program(&self) -> Option<ProgramId> {
        self.program.program().map(|p| p.id)
    }

    fn apply_parameters(&self, ctx: &mut dyn GpuContext, width: u32, height: u32) {
        let Some(program) = self.program.program() else {
            return;
        };
        match self.simulator() {
            Simulator::Machado(transform) => {
                let (matrix, monochrome) = transform.uniforms();
                ctx.set_uniform(program.uniform("color_matrix"), matrix);
                ctx.set_uniform(program.uniform("monochrome"), monochrome);
            }
            Simulator::Hcirn(transform) => {
                ctx.set_uniform(
                    program.uniform("confusion"),
                    UniformValue::Vec4(transform.confusion),
                );
                ctx.set_uniform(
                    program.uniform("anomaly"),
                    UniformValue::Vec4([transform.anomaly, 0.0, 0.0, 0.0]),
                );
                ctx.set_uniform(
                    program.uniform("monochrome"),
                    monochrome_uniform(transform.luma, transform.intensity),
                );
            }
        }

        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        ctx.set_uniform(
            program.uniform("texture_size"),
            UniformValue::Vec4([w, h, 1.0 / w, 1.0 / h]),
        );
    }

    fn release(&mut self, ctx: &mut dyn GpuContext) {
        self.program.release(ctx);
    }

    fn abandon(&mut self) {
        self.program.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingContext;
    use crate::shaders::preferences::MemoryPreferenceStore;

    #[test]
    fn test_ordinals_are_stable() {
        for (i, vision) in VisionType::ALL.iter().enumerate() {
            assert_eq!(vision.ordinal(), i as i64);
            assert_eq!(VisionType::from_ordinal(i as i64), *vision);
        }
        assert_eq!(VisionType::from_ordinal(9), VisionType::Normal);
        assert_eq!(VisionType::from_ordinal(-1), VisionType::Normal);
    }

    #[test]
    fn test_names() {
        assert_eq!(VisionType::Normal.name(), "Normal Vision");
        assert_eq!(
            VisionType::PartialMonochromacy.description(),
            "Reduced sensitivity to colors"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("normal".parse::<VisionType>(), Ok(VisionType::Normal));
        assert_eq!("Normal Vision".parse::<VisionType>(), Ok(VisionType::Normal));
        assert_eq!(
            "partial-monochromacy".parse::<VisionType>(),
            Ok(VisionType::PartialMonochromacy)
        );
        assert_eq!("3".parse::<VisionType>(), Ok(VisionType::Protanopia));
        assert!("9".parse::<VisionType>().is_err());
        assert!("purple".parse::<VisionType>().is_err());
    }

    #[test]
    fn test_normal_is_identity() {
        let transform = VisionType::Normal.transform();
        assert!(transform.is_identity());

        let original: Vec<u8> = (0..=255u8).flat_map(|v| [v, 255 - v, v / 2, 200]).collect();
        let mut pixels = original.clone();
        transform.apply_rgba(&mut pixels);
        assert_eq!(pixels, original);

        let rgb = transform.apply_linear([0.25, 0.5, 0.75]);
        for (a, b) in rgb.iter().zip([0.25, 0.5, 0.75]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_simulations_preserve_white() {
        for vision in VisionType::ALL {
            let white = vision.transform().apply_linear([1.0, 1.0, 1.0]);
            for c in white {
                assert!((c - 1.0).abs() < 1e-3, "{} maps white to {:?}", vision, white);
            }
        }
    }

    #[test]
    fn test_monochromacy_is_grey() {
        let mut pixels = vec![200, 30, 90, 255];
        VisionType::Monochromacy.transform().apply_rgba(&mut pixels);
        assert_eq!(pixels[0], pixels[1]);
        assert_eq!(pixels[1], pixels[2]);
        assert_eq!(pixels[3], 255);
    }

    #[test]
    fn test_protanopia_confuses_red_and_green() {
        let t = VisionType::Protanopia.transform();
        let red = t.apply_linear([1.0, 0.0, 0.0]);
        // Red loses most of its red channel
        assert!(red[0] < 0.2);
    }

    #[test]
    fn test_register_defaults_never_overwrites() {
        let store = MemoryPreferenceStore::new();
        register_defaults(&store).unwrap();
        assert_eq!(store.integer(SIM_VISION_TYPE_KEY), Some(0));

        store.set_integer(SIM_VISION_TYPE_KEY, 5).unwrap();
        register_defaults(&store).unwrap();
        assert_eq!(store.integer(SIM_VISION_TYPE_KEY), Some(5));
    }

    #[test]
    fn test_fixed_vision_type_ignores_preferences() {
        let store = MemoryPreferenceStore::new();
        store.set_integer(SIM_VISION_TYPE_KEY, 3).unwrap();

        let mut filter = ColorVisionFilter::from_preferences(&store);
        assert_eq!(filter.vision_type(), VisionType::Protanopia);

        filter.set_vision_type(VisionType::Tritanopia);
        filter.set_fixed_vision_type(true);
        assert!(!filter.refresh_from_preferences(&store));
        assert_eq!(filter.vision_type(), VisionType::Tritanopia);

        filter.set_fixed_vision_type(false);
        assert!(filter.refresh_from_preferences(&store));
        assert_eq!(filter.vision_type(), VisionType::Protanopia);
    }

    #[test]
    fn test_apply_parameters_writes_uniforms() {
        let mut ctx = RecordingContext::new();
        let mut filter = ColorVisionFilter::fixed(VisionType::PartialMonochromacy);
        filter
            .prepare(&mut ctx, &SurfaceDescriptor::new(640, 480))
            .unwrap();
        let program = filter.program().unwrap();
        ctx.use_program(program);

        filter.apply_parameters(&mut ctx, 640, 480);

        let monochrome = ctx.uniform(ctx.uniform_location(program, "monochrome"));
        assert_eq!(
            monochrome,
            Some(UniformValue::Vec4([0.2126, 0.7152, 0.0722, 0.66]))
        );
        let size = ctx.uniform(ctx.uniform_location(program, "texture_size"));
        assert_eq!(
            size,
            Some(UniformValue::Vec4([640.0, 480.0, 1.0 / 640.0, 1.0 / 480.0]))
        );
    }

    #[test]
    fn test_simulation_ordinals() {
        assert_eq!(Simulation::Hcirn.ordinal(), 0);
        assert_eq!(Simulation::Machado.ordinal(), 1);
        assert_eq!(Simulation::default(), Simulation::Machado);
        assert_eq!(Simulation::from_ordinal(0), Simulation::Hcirn);
        assert_eq!(Simulation::from_ordinal(2), Simulation::Machado);
        assert_eq!(Simulation::from_ordinal(-1), Simulation::Machado);
        assert_eq!("Wickline".parse::<Simulation>(), Ok(Simulation::Hcirn));
        assert_eq!("1".parse::<Simulation>(), Ok(Simulation::Machado));
        assert!("brettel".parse::<Simulation>().is_err());
    }

    #[test]
    fn test_hcirn_preserves_white() {
        for vision in VisionType::ALL {
            let white = vision.hcirn_transform().apply_linear([1.0, 1.0, 1.0]);
            for c in white {
                assert!((c - 1.0).abs() < 1e-2, "{} maps white to {:?}", vision, white);
            }
        }
    }

    #[test]
    fn test_hcirn_projects_onto_confusion_line() {
        let red = VisionType::Protanopia
            .hcirn_transform()
            .apply_linear([1.0, 0.0, 0.0]);
        assert!(red[0] < 0.5, "protan red is {:?}", red);
        assert!(red[1] > 0.1);

        // Anomalous vision lands between the original and the dichromat
        let anomalous = VisionType::Protanomaly
            .hcirn_transform()
            .apply_linear([1.0, 0.0, 0.0]);
        assert!(anomalous[0] > red[0] && anomalous[0] < 1.0);

        let machado = VisionType::Protanopia.transform().apply_linear([1.0, 0.0, 0.0]);
        assert_ne!(red, machado);
    }

    #[test]
    fn test_hcirn_monochromacy_is_grey() {
        let mut pixels = vec![200, 30, 90, 255];
        VisionType::Monochromacy
            .simulator(Simulation::Hcirn)
            .apply_rgba(&mut pixels);
        assert_eq!(pixels[0], pixels[1]);
        assert_eq!(pixels[1], pixels[2]);
    }

    #[test]
    fn test_register_defaults_seeds_simulation() {
        let store = MemoryPreferenceStore::new();
        register_defaults(&store).unwrap();
        assert_eq!(store.integer(SIMULATION_KEY), Some(1));
        assert_eq!(
            FilterPreferences::load(&store),
            FilterPreferences {
                vision_type: VisionType::Normal,
                simulation: Simulation::Machado,
            }
        );
    }

    #[test]
    fn test_apply_preferences() {
        let preferences = FilterPreferences {
            vision_type: VisionType::Tritanomaly,
            simulation: Simulation::Hcirn,
        };

        let mut filter = ColorVisionFilter::new(VisionType::Normal);
        assert!(filter.apply_preferences(&preferences));
        assert_eq!(filter.vision_type(), VisionType::Tritanomaly);
        assert_eq!(filter.simulation(), Simulation::Hcirn);
        assert!(!filter.apply_preferences(&preferences));

        let mut fixed = ColorVisionFilter::fixed(VisionType::Protanopia);
        assert!(!fixed.apply_preferences(&preferences));
        assert_eq!(fixed.vision_type(), VisionType::Protanopia);
        assert_eq!(fixed.simulation(), Simulation::Machado);
    }

    #[test]
    fn test_hcirn_apply_parameters_writes_uniforms() {
        let mut ctx = RecordingContext::new();
        let mut filter =
            ColorVisionFilter::fixed(VisionType::Deuteranomaly).with_simulation(Simulation::Hcirn);
        filter
            .prepare(&mut ctx, &SurfaceDescriptor::new(8, 8))
            .unwrap();
        let program = filter.program().unwrap();
        ctx.use_program(program);

        filter.apply_parameters(&mut ctx, 8, 8);

        let confusion = VisionType::Deuteranomaly.hcirn_transform().confusion;
        assert_eq!(
            ctx.uniform(ctx.uniform_location(program, "confusion")),
            Some(UniformValue::Vec4(confusion))
        );
        assert_eq!(
            ctx.uniform(ctx.uniform_location(program, "anomaly")),
            Some(UniformValue::Vec4([ANOMALY, 0.0, 0.0, 0.0]))
        );
        assert_eq!(ctx.uniform_location(program, "color_matrix"), -1);
    }

    #[test]
    fn test_simulation_change_rebuilds_program() {
        let mut ctx = RecordingContext::new();
        let target = SurfaceDescriptor::new(8, 8);
        let mut filter = ColorVisionFilter::new(VisionType::Protanopia);
        filter.prepare(&mut ctx, &target).unwrap();
        let machado = filter.program().unwrap();
        let objects = ctx.live_objects();

        // A vision type change keeps the program
        filter.set_vision_type(VisionType::Tritanopia);
        filter.prepare(&mut ctx, &target).unwrap();
        assert_eq!(filter.program(), Some(machado));

        filter.set_simulation(Simulation::Hcirn);
        filter.prepare(&mut ctx, &target).unwrap();
        assert_eq!(filter.name(), "color-vision/hcirn");
        assert_ne!(filter.program(), Some(machado));
        assert_eq!(ctx.live_objects(), objects);

        filter.release(&mut ctx);
        assert_eq!(ctx.live_objects(), 0);
    }

    #[test]
    fn test_shaders_validate() {
        let vertex = naga::front::wgsl::parse_str(VERTEX_SOURCE).expect("vertex parses");
        let fragment = naga::front::wgsl::parse_str(FRAGMENT_SOURCE).expect("fragment parses");
        let hcirn = naga::front::wgsl::parse_str(HCIRN_FRAGMENT_SOURCE).expect("hcirn parses");
        for module in [vertex, fragment, hcirn] {
            naga::valid::Validator::new(
                naga::valid::ValidationFlags::all(),
                naga::valid::Capabilities::all(),
            )
            .validate(&module)
            .expect("shader validates");
        }
    }
}
