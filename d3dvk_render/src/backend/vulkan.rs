//! [`Device`] implementation on top of `ash`.

use std::ptr::NonNull;

use ash::prelude::VkResult;
use ash::vk;
use glam::UVec2;
use parking_lot::Mutex;

use super::{
    DescriptorBinding, DescriptorInfo, DescriptorWrite, Device, DeviceInfo, DeviceLimits,
    ImageBarrier, ImageDescriptor, RenderPassDescriptor, Submission,
};
use crate::pipeline::{GraphicsPipelineKey, StencilFaceKey};

/// A logical Vulkan device and the queue commands are submitted to.
///
/// The caller keeps ownership of the `ash::Device`. It must outlive every
/// context using this device.
pub struct VulkanDevice {
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    transform_feedback: Option<ash::ext::transform_feedback::Device>,
}

impl VulkanDevice {
    /// Wraps `device`.
    ///
    /// `transform_feedback` must only be `true` if `VK_EXT_transform_feedback`
    /// was enabled when `device` was created.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        queue: vk::Queue,
        transform_feedback: bool,
    ) -> Self {
        let transform_feedback = transform_feedback
            .then(|| ash::ext::transform_feedback::Device::new(instance, &device));

        Self {
            device,
            queue: Mutex::new(queue),
            transform_feedback,
        }
    }

    /// Queries the capabilities a context needs from `physical_device`.
    pub fn device_info(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        transform_feedback: bool,
    ) -> DeviceInfo {
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = &properties.limits;

        let memory_types = memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .map(|ty| ty.property_flags)
            .collect();

        DeviceInfo {
            memory_types,
            limits: DeviceLimits {
                min_texel_buffer_offset_alignment: limits.min_texel_buffer_offset_alignment,
                min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
                min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
                max_framebuffer_width: limits.max_framebuffer_width,
                max_framebuffer_height: limits.max_framebuffer_height,
                max_framebuffer_layers: limits.max_framebuffer_layers,
            },
            queue_family_index,
            transform_feedback,
        }
    }

    #[inline]
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn transform_feedback(&self) -> Option<&ash::ext::transform_feedback::Device> {
        if self.transform_feedback.is_none() {
            tracing::error!("VK_EXT_transform_feedback is not enabled");
        }

        self.transform_feedback.as_ref()
    }
}

fn stencil_face(face: &StencilFaceKey) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: face.fail_op,
        pass_op: face.pass_op,
        depth_fail_op: face.depth_fail_op,
        compare_op: face.compare_op,
        compare_mask: face.compare_mask,
        write_mask: face.write_mask,
        reference: 0,
    }
}

impl Device for VulkanDevice {
    fn allocate_memory(&self, memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);

        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.device.free_memory(memory, None);
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        // SAFETY: The allocator maps each memory object at most once at a
        // time, so `memory` is not already mapped.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };

        NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.device.unmap_memory(memory);
        }
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe { self.device.create_buffer(&info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .flags(descriptor.flags)
            .image_type(descriptor.image_type)
            .format(descriptor.format)
            .extent(descriptor.extent)
            .mip_levels(descriptor.mip_levels)
            .array_layers(descriptor.array_layers)
            .samples(descriptor.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe { self.device.create_image(&info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe {
            self.device.destroy_image(image, None);
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe {
            self.device.destroy_buffer_view(view, None);
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe {
            self.device.destroy_image_view(view, None);
        }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe {
            self.device.destroy_sampler(sampler, None);
        }
    }

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> VkResult<vk::RenderPass> {
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&descriptor.color_attachments);
        if let Some(depth_stencil) = &descriptor.depth_stencil_attachment {
            subpass = subpass.depth_stencil_attachment(depth_stencil);
        }
        let subpasses = [subpass];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptor.attachments)
            .subpasses(&subpasses);

        unsafe { self.device.create_render_pass(&info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe {
            self.device.destroy_render_pass(render_pass, None);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: UVec2,
        layers: u32,
    ) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.x)
            .height(extent.y)
            .layers(layers);

        unsafe { self.device.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe {
            self.device.destroy_framebuffer(framebuffer, None);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe {
            self.device.destroy_descriptor_set_layout(layout, None);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);

        unsafe { self.device.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> VkResult<vk::Pipeline> {
        let stages: Vec<_> = key
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(GraphicsPipelineKey::ENTRY_POINT)
            })
            .collect();

        let bindings: Vec<_> = key
            .vertex_bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect();
        let attributes: Vec<_> = key
            .vertex_attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let divisors: Vec<_> = key
            .divisors
            .iter()
            .map(|divisor| vk::VertexInputBindingDivisorDescriptionEXT {
                binding: divisor.binding,
                divisor: divisor.divisor,
            })
            .collect();

        let mut divisor_state = vk::PipelineVertexInputDivisorStateCreateInfoEXT::default()
            .vertex_binding_divisors(&divisors);
        let mut vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        // `vertexBindingDivisorCount` must be greater than 0.
        if !divisors.is_empty() {
            vertex_input = vertex_input.push_next(&mut divisor_state);
        }

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(key.topology)
            .primitive_restart_enable(key.primitive_restart);

        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(key.patch_control_points);

        let viewports = [vk::Viewport {
            x: key.viewport.x.0,
            y: key.viewport.y.0,
            width: key.viewport.width.0,
            height: key.viewport.height.0,
            min_depth: key.viewport.min_depth.0,
            max_depth: key.viewport.max_depth.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D {
                x: key.scissor.x,
                y: key.scissor.y,
            },
            extent: vk::Extent2D {
                width: key.scissor.width,
                height: key.scissor.height,
            },
        }];
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let depth_bias = key.rasterizer.depth_bias.unwrap_or_default();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(key.rasterizer.depth_clamp)
            .rasterizer_discard_enable(key.rasterizer.discard)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(key.rasterizer.cull_mode)
            .front_face(key.rasterizer.front_face)
            .depth_bias_enable(key.rasterizer.depth_bias.is_some())
            .depth_bias_constant_factor(depth_bias.constant.0)
            .depth_bias_clamp(depth_bias.clamp.0)
            .depth_bias_slope_factor(depth_bias.slope.0)
            .line_width(GraphicsPipelineKey::LINE_WIDTH);

        let sample_mask = [key.multisample.sample_mask];
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(key.multisample.samples)
            .sample_mask(&sample_mask)
            .alpha_to_coverage_enable(key.multisample.alpha_to_coverage);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(key.depth_stencil.depth_test)
            .depth_write_enable(key.depth_stencil.depth_write)
            .depth_compare_op(key.depth_stencil.depth_compare)
            .stencil_test_enable(key.depth_stencil.stencil_test)
            .front(stencil_face(&key.depth_stencil.front))
            .back(stencil_face(&key.depth_stencil.back))
            .max_depth_bounds(GraphicsPipelineKey::MAX_DEPTH_BOUNDS);

        let attachments: Vec<_> = key
            .blend
            .iter()
            .map(|attachment| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(attachment.enable)
                    .src_color_blend_factor(attachment.src_color)
                    .dst_color_blend_factor(attachment.dst_color)
                    .color_blend_op(attachment.color_op)
                    .src_alpha_blend_factor(attachment.src_alpha)
                    .dst_alpha_blend_factor(attachment.dst_alpha)
                    .alpha_blend_op(attachment.alpha_op)
                    .color_write_mask(attachment.write_mask)
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op(GraphicsPipelineKey::LOGIC_OP)
            .attachments(&attachments)
            .blend_constants(GraphicsPipelineKey::BLEND_CONSTANTS);

        let dynamic = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&GraphicsPipelineKey::DYNAMIC_STATES);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .tessellation_state(&tessellation)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(key.layout)
            .render_pass(key.render_pass)
            .base_pipeline_index(-1);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        };

        Ok(pipelines[0])
    }

    fn create_compute_pipeline(
        &self,
        module: vk::ShaderModule,
        layout: vk::PipelineLayout,
    ) -> VkResult<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(GraphicsPipelineKey::ENTRY_POINT);

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout)
            .base_pipeline_index(-1);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        };

        Ok(pipelines[0])
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);

        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.device.destroy_descriptor_pool(pool, None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        Ok(sets[0])
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let writes: Vec<_> = writes
            .iter()
            .map(|write| {
                let info = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .descriptor_type(write.ty);

                match &write.info {
                    DescriptorInfo::Buffer(buffer) => info.buffer_info(std::slice::from_ref(buffer)),
                    DescriptorInfo::Image(image) => info.image_info(std::slice::from_ref(image)),
                    DescriptorInfo::TexelBuffer(view) => {
                        info.texel_buffer_view(std::slice::from_ref(view))
                    }
                }
            })
            .collect();

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);

        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(pool, &[buffer]);
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(buffer, &info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let command_buffers = [submission.command_buffer];
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(submission.signal_semaphores);

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[info], fence) }
    }

    fn create_query_pool(
        &self,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> VkResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(ty)
            .query_count(count)
            .pipeline_statistics(statistics);

        unsafe { self.device.create_query_pool(&info, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe {
            self.device.destroy_query_pool(pool, None);
        }
    }

    fn query_results(&self, pool: vk::QueryPool, query: u32, data: &mut [u64]) -> VkResult<bool> {
        let size = std::mem::size_of_val(data);

        // One query with all of its values packed into `data`.
        // SAFETY: `data` is valid for `size` bytes and the stride equals
        // `size`, so the driver writes exactly one query into it.
        let res = unsafe {
            (self.device.fp_v1_0().get_query_pool_results)(
                self.device.handle(),
                pool,
                query,
                1,
                size,
                data.as_mut_ptr().cast(),
                size as u64,
                vk::QueryResultFlags::TYPE_64,
            )
        };

        match res {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            err => Err(err),
        }
    }

    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: UVec2,
    ) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D {
                    width: extent.x,
                    height: extent.y,
                },
            });

        unsafe {
            self.device
                .cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_render_pass(buffer);
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[],
            );
        }
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.range);

        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device.cmd_bind_pipeline(buffer, bind_point, pipeline);
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(buffer, first_binding, buffers, offsets);
        }
    }

    fn cmd_bind_transform_feedback_buffers(
        &self,
        buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
        sizes: &[u64],
    ) {
        if let Some(ext) = self.transform_feedback() {
            unsafe {
                (ext.fp().cmd_bind_transform_feedback_buffers_ext)(
                    buffer,
                    first_binding,
                    buffers.len() as u32,
                    buffers.as_ptr(),
                    offsets.as_ptr(),
                    sizes.as_ptr(),
                );
            }
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: u64,
        ty: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(buffer, index_buffer, offset, ty);
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(buffer, bind_point, layout, 0, &[set], &[]);
        }
    }

    fn cmd_set_blend_constants(&self, buffer: vk::CommandBuffer, constants: [f32; 4]) {
        unsafe {
            self.device.cmd_set_blend_constants(buffer, &constants);
        }
    }

    fn cmd_set_stencil_reference(&self, buffer: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.device.cmd_set_stencil_reference(
                buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
        }
    }

    fn cmd_reset_query(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device.cmd_reset_query_pool(buffer, pool, query, 1);
        }
    }

    fn cmd_begin_query(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
    ) {
        unsafe {
            self.device.cmd_begin_query(buffer, pool, query, flags);
        }
    }

    fn cmd_begin_query_indexed(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
        index: u32,
    ) {
        if let Some(ext) = self.transform_feedback() {
            unsafe {
                (ext.fp().cmd_begin_query_indexed_ext)(buffer, pool, query, flags, index);
            }
        }
    }

    fn cmd_end_query(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device.cmd_end_query(buffer, pool, query);
        }
    }

    fn cmd_end_query_indexed(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        index: u32,
    ) {
        if let Some(ext) = self.transform_feedback() {
            unsafe {
                (ext.fp().cmd_end_query_indexed_ext)(buffer, pool, query, index);
            }
        }
    }

    fn cmd_write_timestamp(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device.cmd_write_timestamp(
                buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                pool,
                query,
            );
        }
    }
}
