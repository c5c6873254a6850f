//! Translation of the rendering state into pipeline state and bound resources
//! before a draw or dispatch.

use ash::vk;
use d3dvk_tracing::trace_span;

use crate::backend::Device;
use crate::options::CreationFlags;
use crate::pipeline::{
    BlendAttachmentKey, DepthBiasKey, DepthStencilKey, MultisampleKey, RasterizerKey,
    ScissorKey, ShaderStage, StencilFaceKey, VertexAttribute, VertexBinding, VertexDivisor,
    ViewportKey,
};
use crate::shader::{DescriptorKind, GraphicsProgram, ShaderType, ShaderTypes};
use crate::state::{
    Blend, ComputeStates, DepthStencilState, Format, Framebuffer, GraphicsStates, PipelineKind,
    RasterizerState, ResourceId, ResourceLayer, State, StencilOpDesc, StreamOutputTarget,
    UpdateFlags, MAX_STREAMS,
};
use crate::{Context, Error};

/// Stores `value` in `slot`. Returns `true` if the value changed.
fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Returns the sample count shared by all attachments of `fb`.
fn sample_count(fb: &Framebuffer) -> vk::SampleCountFlags {
    let mut samples = None;

    let views = fb
        .render_targets
        .iter()
        .flatten()
        .filter(|view| view.format.vk != vk::Format::UNDEFINED)
        .chain(fb.depth_stencil.as_ref());

    for view in views {
        let count = view.samples();
        match samples {
            None => samples = Some(count),
            Some(samples) if samples != count => {
                tracing::warn!(
                    "inconsistent sample counts ({:?} != {:?})",
                    samples,
                    count
                );
            }
            Some(_) => (),
        }
    }

    samples.unwrap_or(vk::SampleCountFlags::TYPE_1)
}

fn stencil_face(desc: &StencilOpDesc, state: &DepthStencilState) -> StencilFaceKey {
    StencilFaceKey {
        fail_op: desc.fail_op.op(),
        pass_op: desc.pass_op.op(),
        depth_fail_op: desc.depth_fail_op.op(),
        compare_op: desc.func.op(),
        compare_mask: state.stencil_read_mask.into(),
        write_mask: state.stencil_write_mask.into(),
    }
}

fn depth_stencil_key(state: &State) -> DepthStencilKey {
    let Some(ds) = &state.depth_stencil else {
        return DepthStencilKey {
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            ..Default::default()
        };
    };

    let stencil_test = ds.stencil && state.fb.depth_stencil.is_some();
    let (front, back) = if stencil_test {
        (stencil_face(&ds.front, ds), stencil_face(&ds.back, ds))
    } else {
        Default::default()
    };

    DepthStencilKey {
        depth_test: ds.depth,
        depth_write: ds.depth_write,
        depth_compare: ds.depth_func.op(),
        stencil_test,
        front,
        back,
    }
}

fn depth_bias(
    rasterizer: &RasterizerState,
    depth_stencil: Option<&Format>,
    flags: CreationFlags,
) -> Option<DepthBiasKey> {
    if rasterizer.depth_bias == 0.0 && rasterizer.scale_bias == 0.0 {
        return None;
    }

    let (constant, slope) = if flags.contains(CreationFlags::LEGACY_DEPTH_BIAS) {
        // The bias is an integer stored in the bits of the float.
        let bias = rasterizer.depth_bias.to_bits() as f32;
        match depth_stencil {
            Some(format) => (-bias / format.depth_bias_scale, -bias),
            None => (0.0, 0.0),
        }
    } else {
        (rasterizer.depth_bias, rasterizer.scale_bias)
    };

    Some(DepthBiasKey {
        constant: constant.into(),
        clamp: rasterizer.depth_bias_clamp.into(),
        slope: slope.into(),
    })
}

fn rasterizer_key(
    state: &State,
    program: &GraphicsProgram,
    flags: CreationFlags,
) -> RasterizerKey {
    let Some(rasterizer) = &state.rasterizer else {
        return RasterizerKey {
            depth_clamp: false,
            discard: program.rasterizer_discard,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias: None,
        };
    };

    RasterizerKey {
        depth_clamp: !rasterizer.depth_clip,
        discard: program.rasterizer_discard,
        cull_mode: rasterizer.cull_mode.flags(),
        front_face: if rasterizer.front_ccw {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        },
        depth_bias: depth_bias(
            rasterizer,
            state.fb.depth_stencil.as_ref().map(|view| &view.format),
            flags,
        ),
    }
}

fn blend_keys(state: &State, rt_count: u32) -> Vec<BlendAttachmentKey> {
    let disabled = BlendAttachmentKey {
        write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    };

    let Some(blend) = &state.blend else {
        return vec![disabled; rt_count as usize];
    };

    (0..rt_count as usize)
        .map(|index| {
            let rt = &blend.rt[if blend.independent { index } else { 0 }];
            let write_mask = rt.write_mask.components();
            if !rt.enable {
                return BlendAttachmentKey {
                    write_mask,
                    ..Default::default()
                };
            }

            let format = state.fb.render_targets[index]
                .as_ref()
                .map_or(Format::UNDEFINED, |view| view.format);

            let (src, dst) = match rt.src {
                Blend::BothSrcAlpha => (Blend::SrcAlpha, Blend::InvSrcAlpha),
                Blend::BothInvSrcAlpha => (Blend::InvSrcAlpha, Blend::SrcAlpha),
                src => (src, rt.dst),
            };

            BlendAttachmentKey {
                enable: true,
                src_color: src.factor(&format, false),
                dst_color: dst.factor(&format, false),
                color_op: rt.op.op(),
                src_alpha: rt.src_alpha.factor(&format, true),
                dst_alpha: rt.dst_alpha.factor(&format, true),
                alpha_op: rt.op_alpha.op(),
                write_mask,
            }
        })
        .collect()
}

/// Records the buffers of consecutive bound slots with one call each.
///
/// `bind` receives the first slot and the buffers of one run.
fn bind_runs<T, F>(slots: &[Option<T>], mut bind: F)
where
    T: Copy,
    F: FnMut(u32, &[T]),
{
    let mut first = 0;
    let mut run = Vec::with_capacity(slots.len());

    for (index, slot) in slots.iter().enumerate() {
        if let Some(slot) = slot {
            run.push(*slot);
            continue;
        }

        if !run.is_empty() {
            bind(first, &run);
            run.clear();
        }
        first = index as u32 + 1;
    }

    if !run.is_empty() {
        bind(first, &run);
    }
}

impl<D: Device> Context<D> {
    /// Prepares the current command buffer for a draw with `state`.
    ///
    /// `indexed` draws load the index buffer, `indirect` names the buffer
    /// holding the draw arguments. Returns the command buffer to record the
    /// draw into.
    pub fn apply_draw_state(
        &mut self,
        state: &State,
        resources: &mut dyn ResourceLayer,
        indexed: bool,
        indirect: Option<ResourceId>,
    ) -> Result<vk::CommandBuffer, Error> {
        let _span = trace_span!("Context::apply_draw_state").entered();

        self.resolve_draw(state, resources, indexed, indirect)
            .inspect_err(|err| tracing::error!("failed to apply draw state: {}", err))
    }

    /// Prepares the current command buffer for a dispatch with `state`.
    pub fn apply_compute_state(
        &mut self,
        state: &State,
        resources: &mut dyn ResourceLayer,
        indirect: Option<ResourceId>,
    ) -> Result<vk::CommandBuffer, Error> {
        let _span = trace_span!("Context::apply_compute_state").entered();

        self.resolve_dispatch(state, resources, indirect)
            .inspect_err(|err| tracing::error!("failed to apply compute state: {}", err))
    }

    fn resolve_draw(
        &mut self,
        state: &State,
        resources: &mut dyn ResourceLayer,
        indexed: bool,
        indirect: Option<ResourceId>,
    ) -> Result<vk::CommandBuffer, Error> {
        let dirty = self.dirty_graphics;
        if dirty.intersects(GraphicsStates::SHADER_PIXEL | GraphicsStates::FRAMEBUFFER) {
            self.shader_update |= ShaderTypes::PIXEL;
        }
        if dirty.contains(GraphicsStates::SHADER_VERTEX) {
            self.shader_update |= ShaderTypes::VERTEX;
        }
        if dirty.contains(GraphicsStates::SHADER_GEOMETRY) {
            self.shader_update |= ShaderTypes::GEOMETRY;
        }
        if dirty.contains(GraphicsStates::SHADER_HULL) {
            self.shader_update |= ShaderTypes::HULL | ShaderTypes::DOMAIN;
        }
        if dirty.contains(GraphicsStates::SHADER_DOMAIN) {
            self.shader_update |= ShaderTypes::DOMAIN;
        }

        for view in state.fb.render_targets.iter().flatten().chain(&state.fb.depth_stencil) {
            if view.format.vk != vk::Format::UNDEFINED && resources.load(view.resource) {
                self.dirty_graphics |= GraphicsStates::FRAMEBUFFER;
            }
        }
        self.sample_count = sample_count(&state.fb);

        if self.shader_update.intersects(ShaderTypes::GRAPHICS) {
            self.select_graphics_program(state)?;
        }

        self.load_shader_resources(state, resources, PipelineKind::Graphics);
        self.load_vertex_input(state, resources, indexed);
        if let Some(indirect) = indirect {
            resources.load(indirect);
        }

        let buffer = self.get_command_buffer()?;

        if self.dirty_graphics.contains(GraphicsStates::FRAMEBUFFER) {
            self.end_current_render_pass();
        }
        self.begin_render_pass(buffer, &state.fb, resources)?;

        let layout = self.graphics.layout.ok_or(Error::NoPipelineLayout)?;
        if self.update_graphics_pipeline_key(state, layout.layout) || self.graphics.pipeline.is_none()
        {
            // A failed lookup leaves the key updated, so the next draw must not
            // reuse the pipeline of the previous key.
            self.graphics.pipeline = None;
            let pipeline = self.get_graphics_pipeline()?;
            self.device
                .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
            self.graphics.pipeline = Some(pipeline);
        }

        let dirty = self.dirty_graphics;
        if dirty.contains(GraphicsStates::STENCIL_REF) {
            if let Some(view) = &state.fb.depth_stencil {
                let mask = 1u32
                    .checked_shl(view.format.stencil_size.into())
                    .map_or(u32::MAX, |bit| bit - 1);
                self.device
                    .cmd_set_stencil_reference(buffer, state.stencil_ref & mask);
            }
        }

        if dirty.contains(GraphicsStates::STREAMSRC) {
            self.bind_vertex_buffers(buffer, state, resources);
        }

        if dirty.contains(GraphicsStates::STREAM_OUTPUT) {
            self.update |= UpdateFlags::STREAM_OUTPUT;
        }
        if self.transform_feedback_active && self.update.contains(UpdateFlags::STREAM_OUTPUT) {
            self.bind_stream_output_buffers(buffer, state, resources);
            self.update.remove(UpdateFlags::STREAM_OUTPUT);
        }

        if dirty.contains(GraphicsStates::INDEXBUFFER) {
            if let Some(index_buffer) = state.index_buffer {
                let info = resources.buffer_info(index_buffer);
                resources.reference(index_buffer, self.commands.current_id);
                self.device.cmd_bind_index_buffer(
                    buffer,
                    info.buffer,
                    info.offset + state.index_offset,
                    state.index_format.index_type(),
                );
            }
        }

        if dirty.intersects(
            GraphicsStates::CONSTANT_BUFFER | GraphicsStates::SHADER_RESOURCE_BINDING,
        ) {
            self.update |= UpdateFlags::SHADER_RESOURCE_BINDINGS;
        }
        if dirty.contains(GraphicsStates::UNORDERED_ACCESS_VIEW_BINDING) {
            self.update |= UpdateFlags::UNORDERED_ACCESS_VIEW_BINDINGS;
        }

        let bindings = UpdateFlags::SHADER_RESOURCE_BINDINGS
            | UpdateFlags::UNORDERED_ACCESS_VIEW_BINDINGS;
        if self.update.intersects(bindings) {
            self.update_descriptors(buffer, state, resources, PipelineKind::Graphics)?;
            self.update.remove(bindings);
        }

        if dirty.contains(GraphicsStates::BLEND_FACTOR) {
            self.device
                .cmd_set_blend_constants(buffer, state.blend_factor);
        }

        self.dirty_graphics = GraphicsStates::empty();
        self.shader_update &= ShaderTypes::COMPUTE;

        Ok(buffer)
    }

    fn resolve_dispatch(
        &mut self,
        state: &State,
        resources: &mut dyn ResourceLayer,
        indirect: Option<ResourceId>,
    ) -> Result<vk::CommandBuffer, Error> {
        self.end_current_render_pass();

        if self.dirty_compute.contains(ComputeStates::SHADER) {
            self.shader_update |= ShaderTypes::COMPUTE;
        }

        if self.shader_update.contains(ShaderTypes::COMPUTE) {
            let program = self.shaders.select_compute(state)?;
            if program.module == vk::ShaderModule::null() {
                return Err(Error::NoComputePipeline);
            }

            let layout = self.get_pipeline_layout(&program.layout)?;
            let pipeline = self.get_compute_pipeline(program.module, layout.layout)?;

            self.compute.program = program;
            self.compute.layout = Some(layout);
            self.compute.pipeline = Some(pipeline);
            self.update |= UpdateFlags::COMPUTE_SHADER_RESOURCE_BINDINGS
                | UpdateFlags::COMPUTE_UNORDERED_ACCESS_VIEW_BINDINGS
                | UpdateFlags::COMPUTE_PIPELINE;
        }

        self.load_shader_resources(state, resources, PipelineKind::Compute);
        if let Some(indirect) = indirect {
            resources.load(indirect);
        }

        let buffer = self.get_command_buffer()?;

        if self.update.contains(UpdateFlags::COMPUTE_PIPELINE) {
            let pipeline = self.compute.pipeline.ok_or(Error::NoComputePipeline)?;
            self.device
                .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
            self.update.remove(UpdateFlags::COMPUTE_PIPELINE);
        }

        let dirty = self.dirty_compute;
        if dirty.intersects(ComputeStates::CONSTANT_BUFFER | ComputeStates::SHADER_RESOURCE_BINDING) {
            self.update |= UpdateFlags::COMPUTE_SHADER_RESOURCE_BINDINGS;
        }
        if dirty.contains(ComputeStates::UNORDERED_ACCESS_VIEW_BINDING) {
            self.update |= UpdateFlags::COMPUTE_UNORDERED_ACCESS_VIEW_BINDINGS;
        }

        let bindings = UpdateFlags::COMPUTE_SHADER_RESOURCE_BINDINGS
            | UpdateFlags::COMPUTE_UNORDERED_ACCESS_VIEW_BINDINGS;
        if self.update.intersects(bindings) {
            self.update_descriptors(buffer, state, resources, PipelineKind::Compute)?;
            self.update.remove(bindings);
        }

        self.dirty_compute = ComputeStates::empty();
        self.shader_update.remove(ShaderTypes::COMPUTE);

        Ok(buffer)
    }

    fn select_graphics_program(&mut self, state: &State) -> Result<(), Error> {
        let changed = self.shader_update & ShaderTypes::GRAPHICS;
        let program = self.shaders.select_graphics(state, changed)?;

        if program
            .modules
            .iter()
            .all(|module| *module == vk::ShaderModule::null())
        {
            return Err(Error::NoShaderModules);
        }

        let layout = self.get_pipeline_layout(&program.layout)?;
        self.graphics.program = program;
        self.graphics.layout = Some(layout);
        self.update |=
            UpdateFlags::SHADER_RESOURCE_BINDINGS | UpdateFlags::UNORDERED_ACCESS_VIEW_BINDINGS;

        Ok(())
    }

    /// Loads every resource the current program of `kind` reads.
    fn load_shader_resources(
        &mut self,
        state: &State,
        resources: &mut dyn ResourceLayer,
        kind: PipelineKind,
    ) {
        let bindings = match kind {
            PipelineKind::Graphics => &self.graphics.program.bindings,
            PipelineKind::Compute => &self.compute.program.bindings,
        };

        let mut constant_buffers = false;
        let mut shader_resources = false;
        let mut unordered_access_views = false;

        for binding in bindings {
            let stage = state.stage(binding.shader_type);
            let slot = binding.register as usize;

            match binding.kind {
                DescriptorKind::ConstantBuffer => {
                    if let Some(resource) = stage.constant_buffers.get(slot).copied().flatten() {
                        constant_buffers |= resources.load(resource);
                    }
                }
                DescriptorKind::ShaderResourceView => {
                    if let Some(view) = stage.shader_resource_views.get(slot).copied().flatten() {
                        shader_resources |= resources.load(view.resource);
                    }
                }
                DescriptorKind::UnorderedAccessView => {
                    let views = state.unordered_access_views(kind);
                    if let Some(view) = views.get(slot).copied().flatten() {
                        unordered_access_views |= resources.load(view.resource);
                    }
                }
                DescriptorKind::UnorderedAccessViewCounter | DescriptorKind::Sampler => (),
            }
        }

        match kind {
            PipelineKind::Graphics => {
                if constant_buffers {
                    self.dirty_graphics |= GraphicsStates::CONSTANT_BUFFER;
                }
                if shader_resources {
                    self.dirty_graphics |= GraphicsStates::SHADER_RESOURCE_BINDING;
                }
                if unordered_access_views {
                    self.dirty_graphics |= GraphicsStates::UNORDERED_ACCESS_VIEW_BINDING;
                }
            }
            PipelineKind::Compute => {
                if constant_buffers {
                    self.dirty_compute |= ComputeStates::CONSTANT_BUFFER;
                }
                if shader_resources {
                    self.dirty_compute |= ComputeStates::SHADER_RESOURCE_BINDING;
                }
                if unordered_access_views {
                    self.dirty_compute |= ComputeStates::UNORDERED_ACCESS_VIEW_BINDING;
                }
            }
        }
    }

    /// Loads the vertex, stream output and index buffers.
    fn load_vertex_input(&mut self, state: &State, resources: &mut dyn ResourceLayer, indexed: bool) {
        for stream in &state.streams {
            if let Some(buffer) = stream.buffer {
                if resources.load(buffer) {
                    self.dirty_graphics |= GraphicsStates::STREAMSRC;
                }
            }
        }

        self.transform_feedback_active = state.transform_feedback && self.info.transform_feedback;
        if self.transform_feedback_active {
            for target in &state.stream_output {
                if let Some(buffer) = target.buffer {
                    if resources.load(buffer) {
                        self.update |= UpdateFlags::STREAM_OUTPUT;
                    }
                }
            }
        }

        if let Some(buffer) = state.index_buffer {
            if (indexed || self.dirty_graphics.contains(GraphicsStates::INDEXBUFFER))
                && resources.load(buffer)
            {
                self.dirty_graphics |= GraphicsStates::INDEXBUFFER;
            }
        } else if indexed {
            tracing::warn!("indexed draw without an index buffer");
        }
    }

    fn bind_vertex_buffers(
        &self,
        buffer: vk::CommandBuffer,
        state: &State,
        resources: &mut dyn ResourceLayer,
    ) {
        let id = self.commands.current_id;
        let streams: Vec<_> = state
            .streams
            .iter()
            .map(|stream| {
                let resource = stream.buffer?;
                let info = resources.buffer_info(resource);
                resources.reference(resource, id);
                Some((info.buffer, info.offset + stream.offset))
            })
            .collect();

        let device = &self.device;
        bind_runs(&streams, |first, run| {
            let buffers: Vec<_> = run.iter().map(|(buffer, _)| *buffer).collect();
            let offsets: Vec<_> = run.iter().map(|(_, offset)| *offset).collect();
            device.cmd_bind_vertex_buffers(buffer, first, &buffers, &offsets);
        });
    }

    fn bind_stream_output_buffers(
        &self,
        buffer: vk::CommandBuffer,
        state: &State,
        resources: &mut dyn ResourceLayer,
    ) {
        let id = self.commands.current_id;
        let targets: Vec<_> = state
            .stream_output
            .iter()
            .map(|target| {
                let resource = target.buffer?;
                let info = resources.buffer_info(resource);
                resources.reference(resource, id);

                let mut offset = u64::from(target.offset);
                if target.offset == StreamOutputTarget::APPEND {
                    tracing::warn!("appending to stream output buffers is not supported");
                    offset = 0;
                }

                let size = info.range.saturating_sub(offset);
                Some((info.buffer, info.offset + offset, size))
            })
            .collect();

        let device = &self.device;
        bind_runs(&targets, |first, run| {
            let buffers: Vec<_> = run.iter().map(|(buffer, _, _)| *buffer).collect();
            let offsets: Vec<_> = run.iter().map(|(_, offset, _)| *offset).collect();
            let sizes: Vec<_> = run.iter().map(|(_, _, size)| *size).collect();
            device.cmd_bind_transform_feedback_buffers(buffer, first, &buffers, &offsets, &sizes);
        });
    }

    /// Brings the graphics pipeline key up to date with `state`.
    ///
    /// Returns `true` if the key changed.
    fn update_graphics_pipeline_key(
        &mut self,
        state: &State,
        layout: vk::PipelineLayout,
    ) -> bool {
        let dirty = self.dirty_graphics;
        let program = &self.graphics.program;
        let key = &mut self.graphics.key;
        let mut changed = false;

        if self.shader_update.intersects(ShaderTypes::GRAPHICS) {
            let stages = ShaderType::GRAPHICS
                .iter()
                .zip(&program.modules)
                .filter(|(_, module)| **module != vk::ShaderModule::null())
                .map(|(ty, module)| ShaderStage {
                    stage: ty.stage(),
                    module: *module,
                })
                .collect();
            changed |= update(&mut key.stages, stages);
        }

        if dirty.intersects(
            GraphicsStates::VERTEX_DECLARATION
                | GraphicsStates::STREAMSRC
                | GraphicsStates::SHADER_VERTEX,
        ) {
            let mut bindings = Vec::new();
            let mut attributes = Vec::new();
            let mut divisors = Vec::new();
            let mut mask = 0u32;

            for (location, element) in state.vertex_elements.iter().enumerate() {
                let Some(stream) = state.streams.get(element.stream as usize) else {
                    tracing::warn!(
                        "vertex element {} uses stream {} out of {}",
                        location,
                        element.stream,
                        MAX_STREAMS
                    );
                    continue;
                };

                attributes.push(VertexAttribute {
                    location: location as u32,
                    binding: element.stream,
                    format: element.format,
                    offset: element.offset,
                });

                if mask & (1 << element.stream) != 0 {
                    continue;
                }
                mask |= 1 << element.stream;

                bindings.push(VertexBinding {
                    binding: element.stream,
                    stride: stream.stride,
                    input_rate: if element.instanced {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    },
                });

                if element.instanced {
                    divisors.push(VertexDivisor {
                        binding: element.stream,
                        divisor: element.divisor,
                    });
                }
            }

            changed |= update(&mut key.vertex_bindings, bindings);
            changed |= update(&mut key.vertex_attributes, attributes);
            changed |= update(&mut key.divisors, divisors);
        }

        let topology = state.primitive_type.topology();
        if key.topology != topology {
            key.topology = topology;
            key.primitive_restart = !self.flags.contains(CreationFlags::NO_PRIMITIVE_RESTART)
                && !state.primitive_type.is_list();
            changed = true;
        }

        changed |= update(&mut key.patch_control_points, state.patch_vertex_count);

        if dirty.intersects(
            GraphicsStates::VIEWPORT | GraphicsStates::SCISSOR | GraphicsStates::RASTERIZER,
        ) {
            let viewport = state.viewport;
            let scissor = match &state.rasterizer {
                Some(rasterizer) if rasterizer.scissor => {
                    let rect = state.scissor_rect;
                    ScissorKey {
                        x: rect.left,
                        y: rect.top,
                        width: rect.right.saturating_sub(rect.left).max(0) as u32,
                        height: rect.bottom.saturating_sub(rect.top).max(0) as u32,
                    }
                }
                _ => ScissorKey {
                    x: viewport.x as i32,
                    y: viewport.y as i32,
                    width: viewport.width as u32,
                    height: viewport.height as u32,
                },
            };

            // Flip Y so that the origin is at the top left corner.
            let viewport = ViewportKey {
                x: viewport.x.into(),
                y: (viewport.y + viewport.height).into(),
                width: viewport.width.into(),
                height: (-viewport.height).into(),
                min_depth: viewport.min_z.into(),
                max_depth: viewport.max_z.into(),
            };

            changed |= update(&mut key.scissor, scissor);
            changed |= update(&mut key.viewport, viewport);
        }

        if dirty.intersects(GraphicsStates::RASTERIZER | GraphicsStates::SHADER_GEOMETRY) {
            changed |= update(&mut key.rasterizer, rasterizer_key(state, program, self.flags));
        }

        if key.multisample.samples != self.sample_count
            || dirty.intersects(GraphicsStates::BLEND | GraphicsStates::SAMPLE_MASK)
        {
            let multisample = MultisampleKey {
                samples: self.sample_count,
                alpha_to_coverage: state.blend.is_some_and(|blend| blend.alpha_to_coverage),
                sample_mask: state.sample_mask,
            };
            changed |= update(&mut key.multisample, multisample);
        }

        if dirty.intersects(GraphicsStates::DEPTH_STENCIL | GraphicsStates::FRAMEBUFFER) {
            changed |= update(&mut key.depth_stencil, depth_stencil_key(state));
        }

        if dirty.intersects(GraphicsStates::BLEND | GraphicsStates::FRAMEBUFFER) {
            changed |= update(&mut key.blend, blend_keys(state, self.rt_count));
        }

        changed |= update(&mut key.layout, layout);
        if let Some(render_pass) = self.render_pass {
            changed |= update(&mut key.render_pass, render_pass);
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};
    use glam::UVec2;

    use crate::backend::mock::{Command, MockDevice};
    use crate::context::tests::{test_context, test_context_with};
    use crate::options::CreationFlags;
    use crate::shader::testing::FixedShaders;
    use crate::state::testing::TestResources;
    use crate::state::{
        Blend, BlendState, ComputeStates, DepthStencilState, Format, GraphicsStates,
        IndexFormat, PrimitiveType, RasterizerState, RenderTargetBlend, RenderTargetView,
        ResourceId, ScissorRect, State, StreamOutputTarget, StreamSource, Viewport,
    };
    use crate::Error;

    fn render_target(resource: u64, sample_count: u32) -> RenderTargetView {
        RenderTargetView {
            resource: ResourceId(resource),
            view: vk::ImageView::from_raw(resource),
            format: Format {
                vk: vk::Format::R8G8B8A8_UNORM,
                alpha_size: 8,
                ..Format::UNDEFINED
            },
            sample_count,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            extent: UVec2::new(800, 600),
            layer_count: 1,
        }
    }

    fn depth_stencil(resource: u64) -> RenderTargetView {
        RenderTargetView {
            format: Format {
                vk: vk::Format::D24_UNORM_S8_UINT,
                alpha_size: 0,
                stencil_size: 8,
                depth_bias_scale: 16_777_216.0,
            },
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..render_target(resource, 1)
        }
    }

    fn state() -> State {
        let mut state = State::default();
        state.fb.render_targets[0] = Some(render_target(1, 1));
        state.fb.depth_stencil = Some(depth_stencil(2));
        state.viewport = Viewport {
            x: 0.0,
            y: 0.0,
            width: 800.0,
            height: 600.0,
            min_z: 0.0,
            max_z: 1.0,
        };
        state
    }

    fn count(commands: &[Command], pred: impl Fn(&Command) -> bool) -> usize {
        commands.iter().filter(|command| pred(command)).count()
    }

    #[test]
    fn first_draw_binds_everything() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();
        state.stencil_ref = 0x1ff;
        state.blend_factor = [0.5; 4];

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();

        let commands = ctx.device.commands();
        assert!(matches!(commands[0], Command::BeginRenderPass { .. }));
        assert!(matches!(
            commands[1],
            Command::BindPipeline(vk::PipelineBindPoint::GRAPHICS, _)
        ));
        assert!(commands.contains(&Command::SetStencilReference(0xff)));
        assert!(commands.contains(&Command::SetBlendConstants([0.5; 4])));

        assert!(ctx.dirty_graphics.is_empty());
        assert!(ctx.shader_update.contains(crate::shader::ShaderTypes::COMPUTE));
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 1);

        let key = &ctx.graphics.key;
        assert_eq!(key.stages.len(), 2);
        assert_eq!(key.stages[0].stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(key.stages[1].stage, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(key.blend.len(), 1);
        assert_eq!(key.blend[0].write_mask, vk::ColorComponentFlags::RGBA);
        assert!(key.depth_stencil.depth_test);
        assert_eq!(key.depth_stencil.depth_compare, vk::CompareOp::LESS);
        assert_eq!(key.render_pass, ctx.render_pass.unwrap());
    }

    #[test]
    fn blend_factor_change_only_sets_constants() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        ctx.device.clear_commands();

        state.blend_factor = [0.25, 0.5, 0.75, 1.0];
        ctx.invalidate_graphics_state(GraphicsStates::BLEND_FACTOR);
        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();

        assert_eq!(
            ctx.device.commands(),
            [Command::SetBlendConstants([0.25, 0.5, 0.75, 1.0])]
        );
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 1);
    }

    #[test]
    fn viewport_change_selects_new_pipeline() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        ctx.device.clear_commands();

        state.viewport.width = 400.0;
        ctx.invalidate_graphics_state(GraphicsStates::VIEWPORT);
        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();

        let commands = ctx.device.commands();
        assert_eq!(
            count(&commands, |c| matches!(c, Command::BindPipeline(..))),
            1
        );
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 2);

        // Restoring the old viewport reuses the cached pipeline.
        state.viewport.width = 800.0;
        ctx.invalidate_graphics_state(GraphicsStates::VIEWPORT);
        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 2);
    }

    #[test]
    fn viewport_is_flipped() {
        let mut ctx = test_context();
        let mut state = state();
        state.viewport.y = 10.0;

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let key = &ctx.graphics.key;
        assert_eq!(key.viewport.y.0, 610.0);
        assert_eq!(key.viewport.height.0, -600.0);
        assert_eq!(key.scissor.y, 10);
        assert_eq!(key.scissor.height, 600);

        state.rasterizer = Some(RasterizerState {
            scissor: true,
            ..Default::default()
        });
        state.scissor_rect = ScissorRect {
            left: 5,
            top: 6,
            right: 105,
            bottom: 56,
        };
        ctx.invalidate_graphics_state(GraphicsStates::RASTERIZER);
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let scissor = ctx.graphics.key.scissor;
        assert_eq!((scissor.x, scissor.y), (5, 6));
        assert_eq!((scissor.width, scissor.height), (100, 50));
    }

    #[test]
    fn vertex_buffers_are_bound_in_runs() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();
        for (slot, resource) in [(0, 10), (1, 11), (3, 13)] {
            state.streams[slot] = StreamSource {
                buffer: Some(ResourceId(resource)),
                offset: 4,
                stride: 16,
            };
        }

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();

        let binds: Vec<_> = ctx
            .device
            .commands()
            .into_iter()
            .filter(|c| matches!(c, Command::BindVertexBuffers { .. }))
            .collect();
        assert_eq!(
            binds,
            [
                Command::BindVertexBuffers {
                    first: 0,
                    buffers: vec![
                        TestResources::buffer(ResourceId(10)),
                        TestResources::buffer(ResourceId(11)),
                    ],
                    offsets: vec![260, 260],
                },
                Command::BindVertexBuffers {
                    first: 3,
                    buffers: vec![TestResources::buffer(ResourceId(13))],
                    offsets: vec![260],
                },
            ]
        );
        assert!(resources.referenced(ResourceId(13)));
    }

    #[test]
    fn changed_backing_rebinds_vertex_buffers() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();
        state.streams[0].buffer = Some(ResourceId(10));

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        ctx.device.clear_commands();

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        assert!(ctx.device.commands().is_empty());

        resources.changed.insert(ResourceId(10));
        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        assert!(matches!(
            ctx.device.commands()[..],
            [Command::BindVertexBuffers { first: 0, .. }]
        ));
    }

    #[test]
    fn vertex_input_uses_one_binding_per_stream() {
        use crate::state::VertexElement;

        let mut ctx = test_context();
        let mut state = state();
        state.streams[1].stride = 32;
        state.vertex_elements = vec![
            VertexElement {
                stream: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
                instanced: false,
                divisor: 0,
            },
            VertexElement {
                stream: 1,
                format: vk::Format::R32G32_SFLOAT,
                offset: 12,
                instanced: false,
                divisor: 0,
            },
            VertexElement {
                stream: 2,
                format: vk::Format::R8G8B8A8_UNORM,
                offset: 0,
                instanced: true,
                divisor: 3,
            },
        ];

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let key = &ctx.graphics.key;
        assert_eq!(key.vertex_attributes.len(), 3);
        assert_eq!(key.vertex_attributes[1].location, 1);
        assert_eq!(key.vertex_attributes[1].offset, 12);
        assert_eq!(key.vertex_bindings.len(), 2);
        assert_eq!(key.vertex_bindings[0].stride, 32);
        assert_eq!(
            key.vertex_bindings[1].input_rate,
            vk::VertexInputRate::INSTANCE
        );
        assert_eq!(key.divisors.len(), 1);
        assert_eq!(key.divisors[0].divisor, 3);
    }

    #[test]
    fn index_buffer_binding() {
        let mut ctx = test_context();
        let mut state = state();
        state.index_buffer = Some(ResourceId(20));
        state.index_format = IndexFormat::R16Uint;
        state.index_offset = 64;

        let mut resources = TestResources::default();
        ctx.apply_draw_state(&state, &mut resources, true, None)
            .unwrap();

        assert!(ctx.device.commands().contains(&Command::BindIndexBuffer {
            buffer: TestResources::buffer(ResourceId(20)),
            offset: 256 + 64,
            ty: vk::IndexType::UINT16,
        }));
        assert!(resources.loads.contains(&ResourceId(20)));
    }

    #[test]
    fn stream_output_append_binds_at_start() {
        let mut ctx = test_context();
        let mut state = state();
        state.transform_feedback = true;
        state.stream_output[1] = StreamOutputTarget {
            buffer: Some(ResourceId(30)),
            offset: StreamOutputTarget::APPEND,
        };
        state.stream_output[2] = StreamOutputTarget {
            buffer: Some(ResourceId(31)),
            offset: 128,
        };

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        assert!(ctx
            .device
            .commands()
            .contains(&Command::BindTransformFeedbackBuffers {
                first: 1,
                buffers: vec![
                    TestResources::buffer(ResourceId(30)),
                    TestResources::buffer(ResourceId(31)),
                ],
                offsets: vec![256, 256 + 128],
                sizes: vec![1024, 1024 - 128],
            }));

        // Without transform feedback support nothing is bound.
        let mut ctx = test_context();
        ctx.info.transform_feedback = false;
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        assert!(!ctx
            .device
            .commands()
            .iter()
            .any(|c| matches!(c, Command::BindTransformFeedbackBuffers { .. })));
    }

    #[test]
    fn legacy_depth_bias() {
        let mut ctx = test_context();
        ctx.flags = CreationFlags::LEGACY_DEPTH_BIAS;

        let mut state = state();
        state.rasterizer = Some(RasterizerState {
            depth_bias: f32::from_bits(2),
            depth_bias_clamp: 0.5,
            ..Default::default()
        });

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let bias = ctx.graphics.key.rasterizer.depth_bias.unwrap();
        assert_eq!(bias.constant.0, -2.0 / 16_777_216.0);
        assert_eq!(bias.slope.0, -2.0);
        assert_eq!(bias.clamp.0, 0.5);

        // Without a depth buffer the legacy bias is zero.
        state.fb.depth_stencil = None;
        ctx.invalidate_graphics_state(GraphicsStates::RASTERIZER | GraphicsStates::FRAMEBUFFER);
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let bias = ctx.graphics.key.rasterizer.depth_bias.unwrap();
        assert_eq!(bias.constant.0, 0.0);
        assert_eq!(bias.slope.0, 0.0);
    }

    #[test]
    fn rasterizer_state_mapping() {
        let mut ctx = test_context();
        let mut state = state();
        state.rasterizer = Some(RasterizerState {
            front_ccw: true,
            depth_clip: false,
            depth_bias: 1.5,
            scale_bias: 2.0,
            ..Default::default()
        });

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let rasterizer = ctx.graphics.key.rasterizer;
        assert!(rasterizer.depth_clamp);
        assert_eq!(rasterizer.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(rasterizer.cull_mode, vk::CullModeFlags::BACK);
        let bias = rasterizer.depth_bias.unwrap();
        assert_eq!((bias.constant.0, bias.slope.0), (1.5, 2.0));

        state.rasterizer = None;
        ctx.invalidate_graphics_state(GraphicsStates::RASTERIZER);
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        assert!(ctx.graphics.key.rasterizer.depth_bias.is_none());
        assert!(!ctx.graphics.key.rasterizer.depth_clamp);
    }

    #[test]
    fn primitive_restart_for_strips() {
        let mut ctx = test_context();
        let mut state = state();
        state.primitive_type = PrimitiveType::TriangleStrip;

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        assert!(ctx.graphics.key.primitive_restart);

        let mut ctx = test_context();
        ctx.flags = CreationFlags::NO_PRIMITIVE_RESTART;
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        assert!(!ctx.graphics.key.primitive_restart);
        assert_eq!(
            ctx.graphics.key.topology,
            vk::PrimitiveTopology::TRIANGLE_STRIP
        );
    }

    #[test]
    fn blend_state_mapping() {
        let mut ctx = test_context();
        let mut state = state();
        state.fb.render_targets[2] = Some(render_target(3, 1));

        let mut blend = BlendState {
            alpha_to_coverage: true,
            ..Default::default()
        };
        blend.rt[0] = RenderTargetBlend {
            enable: true,
            src: Blend::BothInvSrcAlpha,
            dst: Blend::One,
            ..Default::default()
        };
        state.blend = Some(blend);

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let key = &ctx.graphics.key;
        // Slot 1 is a gap below the highest render target.
        assert_eq!(key.blend.len(), 3);
        for attachment in &key.blend {
            assert!(attachment.enable);
            assert_eq!(attachment.src_color, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
            assert_eq!(attachment.dst_color, vk::BlendFactor::SRC_ALPHA);
        }
        assert!(key.multisample.alpha_to_coverage);
    }

    #[test]
    fn stencil_needs_depth_stencil_view() {
        let mut ctx = test_context();
        let mut state = state();
        state.depth_stencil = Some(DepthStencilState {
            stencil: true,
            stencil_read_mask: 0x0f,
            ..Default::default()
        });

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        let key = ctx.graphics.key.depth_stencil;
        assert!(key.stencil_test);
        assert_eq!(key.front.compare_mask, 0x0f);
        assert_eq!(key.back.compare_mask, 0x0f);

        state.fb.depth_stencil = None;
        ctx.invalidate_graphics_state(GraphicsStates::FRAMEBUFFER);
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        let key = ctx.graphics.key.depth_stencil;
        assert!(!key.stencil_test);
        assert_eq!(key.front.compare_mask, 0);
    }

    #[test]
    fn first_sample_count_wins() {
        let mut ctx = test_context();
        let mut state = state();
        state.fb.render_targets[0] = Some(render_target(1, 4));
        state.fb.depth_stencil = None;
        state.fb.render_targets[1] = Some(render_target(3, 2));

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        assert_eq!(ctx.sample_count, vk::SampleCountFlags::TYPE_4);
        assert_eq!(
            ctx.graphics.key.multisample.samples,
            vk::SampleCountFlags::TYPE_4
        );
    }

    #[test]
    fn framebuffer_change_restarts_render_pass() {
        let mut ctx = test_context();
        let mut state = state();

        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();
        ctx.device.clear_commands();

        state.fb.depth_stencil = None;
        ctx.invalidate_graphics_state(GraphicsStates::FRAMEBUFFER);
        ctx.apply_draw_state(&state, &mut TestResources::default(), false, None)
            .unwrap();

        let commands = ctx.device.commands();
        assert_eq!(commands[0], Command::EndRenderPass);
        assert!(matches!(commands[1], Command::PipelineBarrier { .. }));
        assert!(matches!(commands[2], Command::BeginRenderPass { .. }));
        assert_eq!(ctx.device.stats().created(MockDevice::RENDER_PASS), 2);
        assert_eq!(ctx.retired.len(), 1);
    }

    #[test]
    fn failed_pipeline_is_not_reused() {
        let mut ctx = test_context();
        let mut resources = TestResources::default();
        let mut state = state();

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();

        state.viewport.width = 400.0;
        ctx.invalidate_graphics_state(GraphicsStates::VIEWPORT);
        ctx.device.fail_next(MockDevice::PIPELINE);
        assert!(ctx
            .apply_draw_state(&state, &mut resources, false, None)
            .is_err());
        assert!(ctx.graphics.pipeline.is_none());
        ctx.device.clear_commands();

        ctx.apply_draw_state(&state, &mut resources, false, None)
            .unwrap();
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 2);
        assert_eq!(
            count(&ctx.device.commands(), |c| matches!(c, Command::BindPipeline(..))),
            1
        );
        assert_eq!(ctx.device.pipelines().last().unwrap().viewport.width.0, 400.0);
    }

    #[test]
    fn missing_shader_modules_fail() {
        let mut ctx = test_context_with(FixedShaders::default());

        let res = ctx.apply_draw_state(&state(), &mut TestResources::default(), false, None);
        assert_eq!(res, Err(Error::NoShaderModules));
        assert!(ctx.device.commands().is_empty());
        assert!(!ctx.shader_update.is_empty());
    }

    #[test]
    fn dispatch_binds_pipeline_once() {
        let mut ctx = test_context();
        ctx.apply_draw_state(&state(), &mut TestResources::default(), false, None)
            .unwrap();
        ctx.device.clear_commands();

        let compute = State::default();
        ctx.apply_compute_state(&compute, &mut TestResources::default(), None)
            .unwrap();
        ctx.apply_compute_state(&compute, &mut TestResources::default(), None)
            .unwrap();

        let commands = ctx.device.commands();
        assert_eq!(commands[0], Command::EndRenderPass);
        assert_eq!(
            count(&commands, |c| matches!(
                c,
                Command::BindPipeline(vk::PipelineBindPoint::COMPUTE, _)
            )),
            1
        );
        assert!(ctx.dirty_compute.is_empty());
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 2);

        // A new command buffer binds it again.
        ctx.submit(&[], &[], &[]).unwrap();
        ctx.device.clear_commands();
        ctx.invalidate_compute_state(ComputeStates::CONSTANT_BUFFER);
        ctx.apply_compute_state(&compute, &mut TestResources::default(), None)
            .unwrap();
        assert_eq!(
            count(&ctx.device.commands(), |c| matches!(c, Command::BindPipeline(..))),
            1
        );
        assert_eq!(ctx.device.stats().created(MockDevice::PIPELINE), 2);
    }

    #[test]
    fn missing_compute_module_fails() {
        let mut shaders = FixedShaders::vertex_pixel();
        shaders.compute.module = vk::ShaderModule::null();
        let mut ctx = test_context_with(shaders);

        let res = ctx.apply_compute_state(&State::default(), &mut TestResources::default(), None);
        assert_eq!(res, Err(Error::NoComputePipeline));
    }
}
