// SPDX-License-Identifier: GPL-3.0-only

//! wgpu-backed [`GpuContext`]
//!
//! Programs map onto render pipelines: compiling a shader validates the WGSL
//! with naga and creates the shader module, linking builds an explicit
//! bind-group layout from the reflected group-0 resources and creates the
//! render pipeline inside a validation error scope. Each uniform resource gets
//! its own small uniform buffer, addressed by its binding index.
//!
//! The input texture, render target and readback buffer are cached per frame
//! dimensions and only reallocated when the camera resolution changes.

use super::reflect::{self, LinkedInterface, ModuleReflection, ResourceKind};
use super::{
    GpuContext, GpuDeviceInfo, ProgramId, ShaderId, ShaderStage, StageStatus, UniformValue,
};
use crate::backends::camera::FrameBuffer;
use crate::constants::vertex;
use crate::errors::GpuError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

/// Color format of the input texture and render target. The sRGB view makes
/// filters operate on linear light.
const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

struct CompiledShader {
    module: wgpu::ShaderModule,
    reflection: ModuleReflection,
}

struct ShaderObject {
    stage: ShaderStage,
    compiled: Option<CompiledShader>,
}

struct LinkedProgram {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    interface: LinkedInterface,
    fragment_inputs: ModuleReflection,
    vertex_outputs: ModuleReflection,
    uniform_buffers: HashMap<u32, wgpu::Buffer>,
}

#[derive(Default)]
struct ProgramObject {
    attached: Vec<ShaderId>,
    requested_attributes: Vec<(u32, String)>,
    linked: Option<LinkedProgram>,
}

/// Input texture, render target and staging buffer for one frame size
struct FrameTargets {
    width: u32,
    height: u32,
    input: wgpu::Texture,
    target: wgpu::Texture,
    staging: wgpu::Buffer,
    /// Staging row pitch, a multiple of `COPY_BYTES_PER_ROW_ALIGNMENT`
    staging_row: u32,
}

impl FrameTargets {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = |label, usage| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: COLOR_FORMAT,
                usage,
                view_formats: &[],
            })
        };

        let input = texture(
            "filter_input_texture",
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let target = texture(
            "filter_target_texture",
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );

        let staging_row = (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("filter_staging_buffer"),
            size: staging_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Self {
            width,
            height,
            input,
            target,
            staging,
            staging_row,
        }
    }

    fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    fn copy_target_to_staging(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.staging_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Wait for the staging copy and strip the row padding into `output`
    fn read_staging(&self, device: &wgpu::Device, output: &mut [u8]) -> Result<(), GpuError> {
        let slice = self.staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        let _ = device.poll(wgpu::PollType::wait_indefinitely());

        pollster::block_on(receiver)
            .map_err(|_| GpuError::Readback("mapping callback dropped".to_string()))?
            .map_err(|e| GpuError::Readback(format!("{:?}", e)))?;

        {
            let mapped = slice.get_mapped_range();
            let row_bytes = self.width as usize * 4;
            for (row, chunk) in output.chunks_exact_mut(row_bytes).enumerate() {
                let start = row * self.staging_row as usize;
                chunk.copy_from_slice(&mapped[start..start + row_bytes]);
            }
        }
        self.staging.unmap();
        Ok(())
    }
}

/// Production GPU context
pub struct WgpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: GpuDeviceInfo,
    next_id: u32,
    shaders: HashMap<ShaderId, ShaderObject>,
    programs: HashMap<ProgramId, ProgramObject>,
    current: Option<ProgramId>,
    quad: wgpu::Buffer,
    sampler: wgpu::Sampler,
    frame: Option<FrameTargets>,
}

impl WgpuContext {
    /// Create a context on a fresh device
    pub fn new(allow_fallback: bool) -> Result<Self, GpuError> {
        let (device, queue, info) =
            pollster::block_on(super::create_render_device("daltocam_render", allow_fallback))?;

        info!(
            adapter_name = %info.adapter_name,
            adapter_backend = ?info.backend,
            software = info.software,
            "GPU device created for filter rendering"
        );

        Ok(Self::with_device(device, queue, info))
    }

    /// Create a context on an existing device
    pub fn with_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        info: GpuDeviceInfo,
    ) -> Self {
        let quad = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("filter_quad"),
            contents: bytemuck::cast_slice(&vertex::QUAD),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("filter_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Self {
            device,
            queue,
            info,
            next_id: 0,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            current: None,
            quad,
            sampler,
            frame: None,
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Reallocate per-frame resources when the frame size changes
    fn ensure_frame_targets(&mut self, width: u32, height: u32) {
        if self.frame.as_ref().is_some_and(|f| f.matches(width, height)) {
            return;
        }
        debug!(width, height, "Allocating filter render resources");
        self.frame = Some(FrameTargets::new(&self.device, width, height));
    }

    fn create_pipeline(
        &self,
        vertex: &CompiledShader,
        fragment: &CompiledShader,
        interface: &LinkedInterface,
    ) -> Result<(wgpu::RenderPipeline, wgpu::BindGroupLayout), String> {
        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = interface
            .resources
            .iter()
            .map(|resource| wgpu::BindGroupLayoutEntry {
                binding: resource.binding,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: match resource.kind {
                    ResourceKind::Texture => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    ResourceKind::Sampler => {
                        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
                    }
                    ResourceKind::Uniform { size } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(size),
                    },
                },
                count: None,
            })
            .collect();

        let mut attributes = Vec::with_capacity(interface.attributes.len());
        for attribute in &interface.attributes {
            if attribute.location >= vertex::ATTRIB_SLOTS {
                return Err(format!(
                    "vertex input `{}` at location {} is not fed by the render quad",
                    attribute.name, attribute.location
                ));
            }
            attributes.push(wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x2,
                offset: attribute.location as u64 * 8,
                shader_location: attribute.location,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("filter_bind_group_layout"),
                    entries: &layout_entries,
                });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("filter_pipeline_layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("filter_pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: Some(&interface.vertex_entry),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: vertex::STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment.module,
                    entry_point: Some(&interface.fragment_entry),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(error.to_string());
        }

        Ok((pipeline, bind_group_layout))
    }

    fn current_program(&self) -> Result<&LinkedProgram, GpuError> {
        self.current
            .and_then(|id| self.programs.get(&id))
            .and_then(|p| p.linked.as_ref())
            .ok_or(GpuError::NoProgram)
    }
}

impl GpuContext for WgpuContext {
    fn description(&self) -> String {
        format!("{} ({:?})", self.info.adapter_name, self.info.backend)
    }

    fn create_shader(&mut self, stage: ShaderStage) -> ShaderId {
        let id = ShaderId(self.next_id());
        self.shaders.insert(
            id,
            ShaderObject {
                stage,
                compiled: None,
            },
        );
        id
    }

    fn compile_shader(&mut self, shader: ShaderId, sources: &[&str]) -> StageStatus {
        let Some(stage) = self.shaders.get(&shader).map(|s| s.stage) else {
            return StageStatus::failed(format!("unknown {}", shader));
        };

        let source = sources.concat();
        let reflection = match reflect::compile_wgsl(stage, &source) {
            Ok(reflection) => reflection,
            Err(log) => return StageStatus::failed(log),
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("{}_{}", stage, shader)),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return StageStatus::failed(error.to_string());
        }

        if let Some(object) = self.shaders.get_mut(&shader) {
            object.compiled = Some(CompiledShader { module, reflection });
        }
        StageStatus::ok()
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.shaders.remove(&shader);
    }

    fn create_program(&mut self) -> ProgramId {
        let id = ProgramId(self.next_id());
        self.programs.insert(id, ProgramObject::default());
        id
    }

    fn attach_shader(&mut self, program: ProgramId, shader: ShaderId) {
        if let Some(p) = self.programs.get_mut(&program) {
            p.attached.push(shader);
        }
    }

    fn bind_attrib_location(&mut self, program: ProgramId, location: u32, name: &str) {
        if let Some(p) = self.programs.get_mut(&program) {
            p.requested_attributes.push((location, name.to_string()));
        }
    }

    fn link_program(&mut self, program: ProgramId) -> StageStatus {
        let Some(object) = self.programs.get(&program) else {
            return StageStatus::failed(format!("unknown {}", program));
        };

        let mut vertex = None;
        let mut fragment = None;
        for id in &object.attached {
            match self.shaders.get(id) {
                Some(ShaderObject {
                    stage: ShaderStage::Vertex,
                    compiled: Some(c),
                }) => vertex = Some(c),
                Some(ShaderObject {
                    stage: ShaderStage::Fragment,
                    compiled: Some(c),
                }) => fragment = Some(c),
                _ => return StageStatus::failed(format!("{} is not a compiled shader", id)),
            }
        }
        let (Some(vertex), Some(fragment)) = (vertex, fragment) else {
            return StageStatus::failed("program needs a compiled vertex and fragment shader");
        };

        let interface = match reflect::link_interface(
            &vertex.reflection,
            &fragment.reflection,
            &object.requested_attributes,
        ) {
            Ok(interface) => interface,
            Err(log) => return StageStatus::failed(log),
        };

        let (pipeline, bind_group_layout) =
            match self.create_pipeline(vertex, fragment, &interface) {
                Ok(created) => created,
                Err(log) => return StageStatus::failed(log),
            };

        let uniform_buffers = interface
            .resources
            .iter()
            .filter_map(|resource| match resource.kind {
                ResourceKind::Uniform { size } => Some((
                    resource.binding,
                    self.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(&format!("uniform_{}", resource.name)),
                        size,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    }),
                )),
                _ => None,
            })
            .collect();

        let linked = LinkedProgram {
            pipeline,
            bind_group_layout,
            interface,
            fragment_inputs: fragment.reflection.clone(),
            vertex_outputs: vertex.reflection.clone(),
            uniform_buffers,
        };

        if let Some(object) = self.programs.get_mut(&program) {
            object.linked = Some(linked);
        }
        StageStatus::ok()
    }

    fn validate_program(&mut self, program: ProgramId) -> StageStatus {
        match self.programs.get(&program).and_then(|p| p.linked.as_ref()) {
            Some(linked) => {
                match reflect::validate_interface(&linked.vertex_outputs, &linked.fragment_inputs)
                {
                    Ok(()) => StageStatus::ok(),
                    Err(log) => StageStatus::failed(log),
                }
            }
            None => StageStatus::failed(format!("{} is not linked", program)),
        }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> i32 {
        self.programs
            .get(&program)
            .and_then(|p| p.linked.as_ref())
            .map(|l| l.interface.uniform_location(name))
            .unwrap_or(-1)
    }

    fn attrib_location(&self, program: ProgramId, name: &str) -> i32 {
        self.programs
            .get(&program)
            .and_then(|p| p.linked.as_ref())
            .map(|l| l.interface.attrib_location(name))
            .unwrap_or(-1)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        if self.current == Some(program) {
            self.current = None;
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.current = Some(program);
    }

    fn set_uniform(&mut self, location: i32, value: UniformValue) {
        if location < 0 {
            return;
        }
        let Ok(linked) = self.current_program() else {
            warn!(location, "set_uniform without a linked program in use");
            return;
        };
        match linked.uniform_buffers.get(&(location as u32)) {
            Some(buffer) => {
                let bytes = value.to_uniform_bytes();
                if bytes.len() as u64 > buffer.size() {
                    warn!(location, "Uniform value larger than its binding, ignored");
                    return;
                }
                self.queue.write_buffer(buffer, 0, &bytes);
            }
            None => debug!(location, "No uniform buffer at location"),
        }
    }

    fn upload_texture(&mut self, frame: &FrameBuffer) -> Result<(), GpuError> {
        frame.check_layout()?;
        self.ensure_frame_targets(frame.width, frame.height);
        let Some(targets) = self.frame.as_ref() else {
            return Err(GpuError::InvalidFrame("input texture not allocated".to_string()));
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.input,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.stride),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );

        Ok(())
    }

    fn render_into(&mut self, width: u32, height: u32, output: &mut [u8]) -> Result<(), GpuError> {
        let Some(targets) = self.frame.as_ref() else {
            return Err(GpuError::InvalidFrame("no texture uploaded".to_string()));
        };
        if !targets.matches(width, height) {
            return Err(GpuError::InvalidFrame(format!(
                "render target {}x{} does not match the uploaded texture {}x{}",
                width, height, targets.width, targets.height
            )));
        }
        let row_bytes = (width * 4) as usize;
        if output.len() != row_bytes * height as usize {
            return Err(GpuError::InvalidFrame(format!(
                "output holds {} bytes, expected {}",
                output.len(),
                row_bytes * height as usize
            )));
        }

        let linked = self.current_program()?;
        let input_view = targets.input.create_view(&wgpu::TextureViewDescriptor::default());
        let target_view = targets.target.create_view(&wgpu::TextureViewDescriptor::default());

        let mut entries = Vec::with_capacity(linked.interface.resources.len());
        for resource in &linked.interface.resources {
            let resource_binding = match resource.kind {
                ResourceKind::Texture => wgpu::BindingResource::TextureView(&input_view),
                ResourceKind::Sampler => wgpu::BindingResource::Sampler(&self.sampler),
                ResourceKind::Uniform { .. } => linked
                    .uniform_buffers
                    .get(&resource.binding)
                    .ok_or(GpuError::NoProgram)?
                    .as_entire_binding(),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: resource.binding,
                resource: resource_binding,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("filter_bind_group"),
            layout: &linked.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("filter_encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("filter_render_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&linked.pipeline);
            pass.set_bind_group(0, Some(&bind_group), &[]);
            pass.set_vertex_buffer(0, self.quad.slice(..));
            pass.draw(0..4, 0..1);
        }

        targets.copy_target_to_staging(&mut encoder);
        self.queue.submit(std::iter::once(encoder.finish()));
        targets.read_staging(&self.device, output)
    }

    fn live_objects(&self) -> usize {
        self.shaders.len() + self.programs.len()
    }
}
