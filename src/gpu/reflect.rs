// SPDX-License-Identifier: GPL-3.0-only

//! WGSL compilation and interface reflection
//!
//! Shader sources are parsed and validated with naga. The reflected interface
//! (entry point, location-bound inputs/outputs, group-0 resources) is what
//! both contexts use to resolve attribute and uniform locations and to check
//! that a vertex/fragment pair fits together.

use super::ShaderStage;

/// Kind of a bound shader resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Texture,
    Sampler,
    Uniform { size: u64 },
}

/// A `@group(g) @binding(b)` global
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub kind: ResourceKind,
}

/// A `@location(n)` entry point input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceVar {
    pub name: String,
    pub location: u32,
}

/// Interface of one compiled stage
#[derive(Debug, Clone, Default)]
pub struct ModuleReflection {
    pub entry_point: String,
    pub inputs: Vec<InterfaceVar>,
    pub outputs: Vec<InterfaceVar>,
    pub resources: Vec<Resource>,
}

/// Interface of a linked vertex/fragment pair
#[derive(Debug, Clone, Default)]
pub struct LinkedInterface {
    pub vertex_entry: String,
    pub fragment_entry: String,
    /// Vertex inputs, sorted by location
    pub attributes: Vec<InterfaceVar>,
    /// Union of both stages' resources, sorted by binding
    pub resources: Vec<Resource>,
}

impl LinkedInterface {
    /// Binding index of a named resource, or -1
    pub fn uniform_location(&self, name: &str) -> i32 {
        self.resources
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.binding as i32)
            .unwrap_or(-1)
    }

    /// Location of a named vertex input, or -1
    pub fn attrib_location(&self, name: &str) -> i32 {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.location as i32)
            .unwrap_or(-1)
    }
}

/// Parse, validate and reflect a WGSL source for one stage.
///
/// On failure the returned string is the compiler log.
pub fn compile_wgsl(stage: ShaderStage, source: &str) -> Result<ModuleReflection, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| e.emit_to_string(source))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga_stage)
        .ok_or_else(|| format!("source has no @{} entry point", stage))?;

    let mut inputs = Vec::new();
    for argument in &entry.function.arguments {
        collect_locations(
            &module,
            argument.name.as_deref(),
            argument.ty,
            argument.binding.as_ref(),
            &mut inputs,
        );
    }

    let mut outputs = Vec::new();
    if let Some(result) = &entry.function.result {
        collect_locations(&module, None, result.ty, result.binding.as_ref(), &mut outputs);
    }

    let mut resources = Vec::new();
    for (_, global) in module.global_variables.iter() {
        let Some(binding) = &global.binding else {
            continue;
        };
        let name = global.name.clone().unwrap_or_default();
        let inner = &module.types[global.ty].inner;
        let kind = match (global.space, inner) {
            (naga::AddressSpace::Uniform, inner) => ResourceKind::Uniform {
                size: inner.size(module.to_ctx()) as u64,
            },
            (_, naga::TypeInner::Image { .. }) => ResourceKind::Texture,
            (_, naga::TypeInner::Sampler { .. }) => ResourceKind::Sampler,
            _ => {
                return Err(format!(
                    "resource `{}` uses an address space the filter pipeline does not support",
                    name
                ));
            }
        };
        resources.push(Resource {
            name,
            group: binding.group,
            binding: binding.binding,
            kind,
        });
    }

    Ok(ModuleReflection {
        entry_point: entry.name.clone(),
        inputs,
        outputs,
        resources,
    })
}

fn collect_locations(
    module: &naga::Module,
    name: Option<&str>,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
    out: &mut Vec<InterfaceVar>,
) {
    match binding {
        Some(naga::Binding::Location { location, .. }) => out.push(InterfaceVar {
            name: name.unwrap_or_default().to_string(),
            location: *location,
        }),
        Some(naga::Binding::BuiltIn(_)) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    collect_locations(
                        module,
                        member.name.as_deref(),
                        member.ty,
                        member.binding.as_ref(),
                        out,
                    );
                }
            }
        }
    }
}

/// Check requested attribute locations and merge both stages' resources.
///
/// A requested attribute that the vertex stage does not declare is ignored;
/// one declared at a different location fails the link.
pub fn link_interface(
    vertex: &ModuleReflection,
    fragment: &ModuleReflection,
    requested_attributes: &[(u32, String)],
) -> Result<LinkedInterface, String> {
    for (location, name) in requested_attributes {
        if let Some(input) = vertex.inputs.iter().find(|i| &i.name == name)
            && input.location != *location
        {
            return Err(format!(
                "attribute `{}` is declared at location {} but was bound to {}",
                name, input.location, location
            ));
        }
    }

    let mut resources: Vec<Resource> = Vec::new();
    for resource in vertex.resources.iter().chain(&fragment.resources) {
        if resource.group != 0 {
            return Err(format!(
                "resource `{}` is in bind group {}; only group 0 is supported",
                resource.name, resource.group
            ));
        }
        match resources.iter().find(|r| r.binding == resource.binding) {
            Some(existing) if existing.name != resource.name || existing.kind != resource.kind => {
                return Err(format!(
                    "binding {} is declared as both `{}` and `{}`",
                    resource.binding, existing.name, resource.name
                ));
            }
            Some(_) => {}
            None => resources.push(resource.clone()),
        }
    }
    resources.sort_by_key(|r| r.binding);

    let mut attributes = vertex.inputs.clone();
    attributes.sort_by_key(|a| a.location);

    Ok(LinkedInterface {
        vertex_entry: vertex.entry_point.clone(),
        fragment_entry: fragment.entry_point.clone(),
        attributes,
        resources,
    })
}

/// Check that every fragment input is written by the vertex stage
pub fn validate_interface(
    vertex: &ModuleReflection,
    fragment: &ModuleReflection,
) -> Result<(), String> {
    let missing: Vec<String> = fragment
        .inputs
        .iter()
        .filter(|input| !vertex.outputs.iter().any(|o| o.location == input.location))
        .map(|input| format!("`{}` (location {})", input.name, input.location))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "fragment inputs not written by the vertex stage: {}",
            missing.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) tex_coord: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.uv = tex_coord;
    return out;
}
"#;

    const FRAGMENT: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(2) var<uniform> tint: vec4<f32>;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let texel = textureLoad(source, vec2<i32>(uv * 4.0), 0);
    return texel * tint;
}
"#;

    #[test]
    fn test_reflects_vertex_inputs() {
        let vertex = compile_wgsl(ShaderStage::Vertex, VERTEX).unwrap();
        assert_eq!(vertex.entry_point, "vs_main");
        assert_eq!(vertex.inputs.len(), 2);
        assert_eq!(vertex.inputs[1].name, "tex_coord");
        assert_eq!(vertex.inputs[1].location, 1);
        assert_eq!(vertex.outputs.len(), 1);
    }

    #[test]
    fn test_reflects_resources() {
        let fragment = compile_wgsl(ShaderStage::Fragment, FRAGMENT).unwrap();
        assert_eq!(fragment.resources.len(), 2);
        let tint = fragment.resources.iter().find(|r| r.name == "tint").unwrap();
        assert_eq!(tint.binding, 2);
        assert_eq!(tint.kind, ResourceKind::Uniform { size: 16 });
    }

    #[test]
    fn test_missing_entry_point_fails() {
        let err = compile_wgsl(ShaderStage::Fragment, VERTEX).unwrap_err();
        assert!(err.contains("fragment"));
    }

    #[test]
    fn test_syntax_error_has_log() {
        let err = compile_wgsl(ShaderStage::Vertex, "fn broken( {").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_link_resolves_locations() {
        let vertex = compile_wgsl(ShaderStage::Vertex, VERTEX).unwrap();
        let fragment = compile_wgsl(ShaderStage::Fragment, FRAGMENT).unwrap();
        let linked = link_interface(&vertex, &fragment, &[(0, "position".to_string())]).unwrap();
        assert_eq!(linked.uniform_location("tint"), 2);
        assert_eq!(linked.uniform_location("source"), 0);
        assert_eq!(linked.uniform_location("missing"), -1);
        assert_eq!(linked.attrib_location("tex_coord"), 1);
        assert!(validate_interface(&vertex, &fragment).is_ok());
    }

    #[test]
    fn test_link_rejects_conflicting_attribute() {
        let vertex = compile_wgsl(ShaderStage::Vertex, VERTEX).unwrap();
        let fragment = compile_wgsl(ShaderStage::Fragment, FRAGMENT).unwrap();
        let err = link_interface(&vertex, &fragment, &[(3, "position".to_string())]).unwrap_err();
        assert!(err.contains("position"));
    }
}
