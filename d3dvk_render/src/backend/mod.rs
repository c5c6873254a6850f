//! The device seam.
//!
//! Every call that reaches the GPU goes through the [`Device`] trait. The
//! [`vulkan`] module implements it on top of `ash`.

#[cfg(test)]
pub(crate) mod mock;
pub mod vulkan;

use std::ptr::NonNull;

use ash::prelude::VkResult;
use ash::vk;
use glam::UVec2;

use crate::pipeline::GraphicsPipelineKey;

/// Capabilities and limits of the device a context records for.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Property flags of every memory type, indexed by memory type index.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub limits: DeviceLimits,
    pub queue_family_index: u32,
    /// Whether `VK_EXT_transform_feedback` is enabled on the device.
    pub transform_feedback: bool,
}

impl DeviceInfo {
    /// Returns the first memory type allowed by `type_bits` that has all of `flags`.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(index, props)| type_bits & (1 << *index) != 0 && props.contains(flags))
            .map(|(index, _)| index as u32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_texel_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub max_framebuffer_width: u32,
    pub max_framebuffer_height: u32,
    pub max_framebuffer_layers: u32,
}

/// Descriptors bound in place of resources that are not bound.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullResources {
    pub buffer_info: vk::DescriptorBufferInfo,
    pub buffer_view_float: vk::BufferView,
    pub buffer_view_uint: vk::BufferView,
    pub image_1d: vk::DescriptorImageInfo,
    pub image_2d: vk::DescriptorImageInfo,
    pub image_2dms: vk::DescriptorImageInfo,
    pub image_3d: vk::DescriptorImageInfo,
    pub image_cube: vk::DescriptorImageInfo,
    pub image_2d_array: vk::DescriptorImageInfo,
    pub image_2dms_array: vk::DescriptorImageInfo,
    pub sampler: vk::DescriptorImageInfo,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

/// A single-subpass render pass.
#[derive(Clone, Debug, Default)]
pub struct RenderPassDescriptor {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Copy, Clone, Debug)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub info: DescriptorInfo,
}

#[derive(Copy, Clone, Debug)]
pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    TexelBuffer(vk::BufferView),
}

#[derive(Copy, Clone, Debug)]
pub struct Submission<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Copy, Clone, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
}

impl PartialEq for ImageBarrier {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && self.src_stage == other.src_stage
            && self.dst_stage == other.dst_stage
            && self.src_access == other.src_access
            && self.dst_access == other.dst_access
            && self.old_layout == other.old_layout
            && self.new_layout == other.new_layout
            && self.range.aspect_mask == other.range.aspect_mask
            && self.range.base_mip_level == other.range.base_mip_level
            && self.range.level_count == other.range.level_count
            && self.range.base_array_layer == other.range.base_array_layer
            && self.range.layer_count == other.range.layer_count
    }
}

/// Raw GPU operations used by a [`Context`].
///
/// Handles passed to the destroy functions must not be used by any pending
/// command buffer. The context guarantees this through its retirement queue.
///
/// [`Context`]: crate::Context
pub trait Device {
    fn allocate_memory(&self, memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Maps the whole allocation.
    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    fn create_image(&self, descriptor: &ImageDescriptor) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    fn destroy_buffer_view(&self, view: vk::BufferView);
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: UVec2,
        layers: u32,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> VkResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        module: vk::ShaderModule,
        layout: vk::PipelineLayout,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `true` if the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Blocks until the fence is signaled.
    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()>;

    fn create_query_pool(
        &self,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> VkResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Reads the 64-bit results of one query into `data`.
    ///
    /// Returns `false` if the results are not available yet.
    fn query_results(&self, pool: vk::QueryPool, query: u32, data: &mut [u64]) -> VkResult<bool>;

    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: UVec2,
    );
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    /// Records an execution barrier without memory barriers.
    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    );
    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_vertex_buffers(
        &self,
        buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );
    fn cmd_bind_transform_feedback_buffers(
        &self,
        buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
        sizes: &[u64],
    );
    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: u64,
        ty: vk::IndexType,
    );
    fn cmd_bind_descriptor_set(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_set_blend_constants(&self, buffer: vk::CommandBuffer, constants: [f32; 4]);
    fn cmd_set_stencil_reference(&self, buffer: vk::CommandBuffer, reference: u32);

    fn cmd_reset_query(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32);
    fn cmd_begin_query(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
    );
    fn cmd_begin_query_indexed(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
        index: u32,
    );
    fn cmd_end_query(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32);
    fn cmd_end_query_indexed(
        &self,
        buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        index: u32,
    );
    fn cmd_write_timestamp(&self, buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32);
}
