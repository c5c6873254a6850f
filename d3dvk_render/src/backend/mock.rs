//! A recording [`Device`] used by tests.

use std::ptr::NonNull;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use glam::UVec2;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{
    DescriptorBinding, DescriptorWrite, Device, ImageBarrier, ImageDescriptor,
    RenderPassDescriptor, Submission,
};
use crate::pipeline::GraphicsPipelineKey;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: UVec2,
    },
    EndRenderPass,
    PipelineBarrier {
        src: vk::PipelineStageFlags,
        dst: vk::PipelineStageFlags,
    },
    ImageBarrier(ImageBarrier),
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindVertexBuffers {
        first: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<u64>,
    },
    BindTransformFeedbackBuffers {
        first: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<u64>,
        sizes: Vec<u64>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        ty: vk::IndexType,
    },
    BindDescriptorSet(vk::PipelineBindPoint, vk::PipelineLayout, vk::DescriptorSet),
    SetBlendConstants([f32; 4]),
    SetStencilReference(u32),
    ResetQuery(vk::QueryPool, u32),
    BeginQuery(vk::QueryPool, u32, Option<u32>),
    EndQuery(vk::QueryPool, u32, Option<u32>),
    WriteTimestamp(vk::QueryPool, u32),
}

#[derive(Clone, Debug, Default)]
pub struct MockStats {
    created: HashMap<&'static str, usize>,
    destroyed: HashMap<&'static str, usize>,
}

impl MockStats {
    pub fn created(&self, kind: &str) -> usize {
        self.created.get(kind).copied().unwrap_or(0)
    }

    pub fn destroyed(&self, kind: &str) -> usize {
        self.destroyed.get(kind).copied().unwrap_or(0)
    }

    pub fn live(&self, kind: &str) -> usize {
        self.created(kind) - self.destroyed(kind)
    }
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    stats: MockStats,
    fail_next: Vec<&'static str>,
    descriptor_set_failures: usize,
    fences: HashMap<vk::Fence, bool>,
    submissions: Vec<vk::Fence>,
    commands: Vec<Command>,
    writes: Vec<DescriptorWrite>,
    render_passes: Vec<RenderPassDescriptor>,
    pipelines: Vec<GraphicsPipelineKey>,
    memory_sizes: HashMap<vk::DeviceMemory, u64>,
    mappings: HashMap<vk::DeviceMemory, Vec<u8>>,
    buffer_sizes: HashMap<vk::Buffer, u64>,
    queries_pending: bool,
}

impl MockState {
    fn create<H: Handle>(&mut self, kind: &'static str) -> VkResult<H> {
        if let Some(index) = self.fail_next.iter().position(|k| *k == kind) {
            self.fail_next.remove(index);
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        self.next_handle += 1;
        *self.stats.created.entry(kind).or_default() += 1;
        Ok(H::from_raw(self.next_handle))
    }

    fn destroy(&mut self, kind: &'static str) {
        *self.stats.destroyed.entry(kind).or_default() += 1;
    }
}

#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub const MEMORY: &'static str = "memory";
    pub const BUFFER: &'static str = "buffer";
    pub const IMAGE: &'static str = "image";
    pub const BUFFER_VIEW: &'static str = "buffer view";
    pub const IMAGE_VIEW: &'static str = "image view";
    pub const SAMPLER: &'static str = "sampler";
    pub const RENDER_PASS: &'static str = "render pass";
    pub const FRAMEBUFFER: &'static str = "framebuffer";
    pub const SET_LAYOUT: &'static str = "descriptor set layout";
    pub const PIPELINE_LAYOUT: &'static str = "pipeline layout";
    pub const PIPELINE: &'static str = "pipeline";
    pub const DESCRIPTOR_POOL: &'static str = "descriptor pool";
    pub const COMMAND_POOL: &'static str = "command pool";
    pub const COMMAND_BUFFER: &'static str = "command buffer";
    pub const FENCE: &'static str = "fence";
    pub const QUERY_POOL: &'static str = "query pool";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().stats.clone()
    }

    /// Makes the next creation of `kind` fail.
    pub fn fail_next(&self, kind: &'static str) {
        self.state.lock().fail_next.push(kind);
    }

    /// Makes the next `count` descriptor set allocations report an exhausted pool.
    pub fn fail_descriptor_sets(&self, count: usize) {
        self.state.lock().descriptor_set_failures = count;
    }

    /// Fences of all submissions in submission order.
    pub fn submissions(&self) -> Vec<vk::Fence> {
        self.state.lock().submissions.clone()
    }

    /// Signals the fence of the `index`-th submission.
    pub fn signal_submission(&self, index: usize) {
        let mut state = self.state.lock();
        let fence = state.submissions[index];
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
    }

    pub fn signal_all(&self) {
        let mut state = self.state.lock();
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().writes.clone()
    }

    pub fn render_passes(&self) -> Vec<RenderPassDescriptor> {
        self.state.lock().render_passes.clone()
    }

    pub fn pipelines(&self) -> Vec<GraphicsPipelineKey> {
        self.state.lock().pipelines.clone()
    }

    pub fn buffer_size(&self, buffer: vk::Buffer) -> Option<u64> {
        self.state.lock().buffer_sizes.get(&buffer).copied()
    }

    /// Makes query results report `NOT_READY`.
    pub fn set_queries_pending(&self, pending: bool) {
        self.state.lock().queries_pending = pending;
    }

    fn record(&self, command: Command) {
        self.state.lock().commands.push(command);
    }
}

impl Device for MockDevice {
    fn allocate_memory(&self, _memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        let memory = state.create(Self::MEMORY)?;
        state.memory_sizes.insert(memory, size);
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.memory_sizes.remove(&memory);
        state.mappings.remove(&memory);
        state.destroy(Self::MEMORY);
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let size = *state
            .memory_sizes
            .get(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

        let data = state
            .mappings
            .entry(memory)
            .or_insert_with(|| vec![0; size as usize]);
        NonNull::new(data.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().mappings.remove(&memory);
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = state.create(Self::BUFFER)?;
        state.buffer_sizes.insert(buffer, size);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffer_sizes.remove(&buffer);
        state.destroy(Self::BUFFER);
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.buffer_size(buffer).unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: !0,
        }
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
        _offset: u64,
    ) -> VkResult<()> {
        Ok(())
    }

    fn create_image(&self, _descriptor: &ImageDescriptor) -> VkResult<vk::Image> {
        self.state.lock().create(Self::IMAGE)
    }

    fn destroy_image(&self, _image: vk::Image) {
        self.state.lock().destroy(Self::IMAGE);
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 64 * 1024,
            alignment: 4096,
            memory_type_bits: !0,
        }
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: u64,
    ) -> VkResult<()> {
        Ok(())
    }

    fn destroy_buffer_view(&self, _view: vk::BufferView) {
        self.state.lock().destroy(Self::BUFFER_VIEW);
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.state.lock().destroy(Self::IMAGE_VIEW);
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.state.lock().destroy(Self::SAMPLER);
    }

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        let render_pass = state.create(Self::RENDER_PASS)?;
        state.render_passes.push(descriptor.clone());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.state.lock().destroy(Self::RENDER_PASS);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: UVec2,
        _layers: u32,
    ) -> VkResult<vk::Framebuffer> {
        self.state.lock().create(Self::FRAMEBUFFER)
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.state.lock().destroy(Self::FRAMEBUFFER);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        self.state.lock().create(Self::SET_LAYOUT)
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().destroy(Self::SET_LAYOUT);
    }

    fn create_pipeline_layout(
        &self,
        _set_layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::PipelineLayout> {
        self.state.lock().create(Self::PIPELINE_LAYOUT)
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.lock().destroy(Self::PIPELINE_LAYOUT);
    }

    fn create_graphics_pipeline(&self, key: &GraphicsPipelineKey) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let pipeline = state.create(Self::PIPELINE)?;
        state.pipelines.push(key.clone());
        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        _module: vk::ShaderModule,
        _layout: vk::PipelineLayout,
    ) -> VkResult<vk::Pipeline> {
        self.state.lock().create(Self::PIPELINE)
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.state.lock().destroy(Self::PIPELINE);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        self.state.lock().create(Self::DESCRIPTOR_POOL)
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state.lock().destroy(Self::DESCRIPTOR_POOL);
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if state.descriptor_set_failures > 0 {
            state.descriptor_set_failures -= 1;
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        state.next_handle += 1;
        Ok(vk::DescriptorSet::from_raw(state.next_handle))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().writes.extend_from_slice(writes);
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        self.state.lock().create(Self::COMMAND_POOL)
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state.lock().destroy(Self::COMMAND_POOL);
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.state.lock().create(Self::COMMAND_BUFFER)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, _buffer: vk::CommandBuffer) {
        self.state.lock().destroy(Self::COMMAND_BUFFER);
    }

    fn begin_command_buffer(&self, _buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.create(Self::FENCE)?;
        state.fences.insert(fence, false);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.destroy(Self::FENCE);
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        *signaled = true;
        Ok(())
    }

    fn queue_submit(&self, _submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        self.state.lock().submissions.push(fence);
        Ok(())
    }

    fn create_query_pool(
        &self,
        _ty: vk::QueryType,
        _count: u32,
        _statistics: vk::QueryPipelineStatisticFlags,
    ) -> VkResult<vk::QueryPool> {
        self.state.lock().create(Self::QUERY_POOL)
    }

    fn destroy_query_pool(&self, _pool: vk::QueryPool) {
        self.state.lock().destroy(Self::QUERY_POOL);
    }

    fn query_results(&self, _pool: vk::QueryPool, _query: u32, data: &mut [u64]) -> VkResult<bool> {
        if self.state.lock().queries_pending {
            return Ok(false);
        }

        data.fill(1);
        Ok(true)
    }

    fn cmd_begin_render_pass(
        &self,
        _buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: UVec2,
    ) {
        self.record(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
        });
    }

    fn cmd_end_render_pass(&self, _buffer: vk::CommandBuffer) {
        self.record(Command::EndRenderPass);
    }

    fn cmd_pipeline_barrier(
        &self,
        _buffer: vk::CommandBuffer,
        src: vk::PipelineStageFlags,
        dst: vk::PipelineStageFlags,
    ) {
        self.record(Command::PipelineBarrier { src, dst });
    }

    fn cmd_image_barrier(&self, _buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.record(Command::ImageBarrier(*barrier));
    }

    fn cmd_bind_pipeline(
        &self,
        _buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Command::BindPipeline(bind_point, pipeline));
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _buffer: vk::CommandBuffer,
        first: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        self.record(Command::BindVertexBuffers {
            first,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    fn cmd_bind_transform_feedback_buffers(
        &self,
        _buffer: vk::CommandBuffer,
        first: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
        sizes: &[u64],
    ) {
        self.record(Command::BindTransformFeedbackBuffers {
            first,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
            sizes: sizes.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(
        &self,
        _buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        ty: vk::IndexType,
    ) {
        self.record(Command::BindIndexBuffer { buffer, offset, ty });
    }

    fn cmd_bind_descriptor_set(
        &self,
        _buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.record(Command::BindDescriptorSet(bind_point, layout, set));
    }

    fn cmd_set_blend_constants(&self, _buffer: vk::CommandBuffer, constants: [f32; 4]) {
        self.record(Command::SetBlendConstants(constants));
    }

    fn cmd_set_stencil_reference(&self, _buffer: vk::CommandBuffer, reference: u32) {
        self.record(Command::SetStencilReference(reference));
    }

    fn cmd_reset_query(&self, _buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        self.record(Command::ResetQuery(pool, query));
    }

    fn cmd_begin_query(
        &self,
        _buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        _flags: vk::QueryControlFlags,
    ) {
        self.record(Command::BeginQuery(pool, query, None));
    }

    fn cmd_begin_query_indexed(
        &self,
        _buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        _flags: vk::QueryControlFlags,
        index: u32,
    ) {
        self.record(Command::BeginQuery(pool, query, Some(index)));
    }

    fn cmd_end_query(&self, _buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        self.record(Command::EndQuery(pool, query, None));
    }

    fn cmd_end_query_indexed(
        &self,
        _buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        index: u32,
    ) {
        self.record(Command::EndQuery(pool, query, Some(index)));
    }

    fn cmd_write_timestamp(&self, _buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        self.record(Command::WriteTimestamp(pool, query));
    }
}
