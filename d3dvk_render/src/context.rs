use ash::vk;
use d3dvk_tracing::trace_span;

use crate::allocator::{MemoryAllocator, SlabAllocator};
use crate::backend::{DescriptorBinding, Device, DeviceInfo, NullResources};
use crate::cache::ObjectCache;
use crate::command::CommandBufferManager;
use crate::descriptors::DescriptorUpdater;
use crate::options::{ContextOptions, CreationFlags};
use crate::pipeline::{GraphicsPipelineKey, PipelineLayout};
use crate::query::QueryManager;
use crate::render_pass::RenderPassKey;
use crate::retire::RetirementQueue;
use crate::shader::{ComputeProgram, GraphicsProgram, ShaderBackend, ShaderTypes};
use crate::state::{ComputeStates, GraphicsStates, UpdateFlags};
use crate::Error;

#[derive(Debug, Default)]
pub(crate) struct GraphicsPipelineState {
    pub program: GraphicsProgram,
    pub layout: Option<PipelineLayout>,
    /// The pipeline bound in the current command buffer.
    pub pipeline: Option<vk::Pipeline>,
    pub key: GraphicsPipelineKey,
}

#[derive(Debug, Default)]
pub(crate) struct ComputePipelineState {
    pub program: ComputeProgram,
    pub layout: Option<PipelineLayout>,
    pub pipeline: Option<vk::Pipeline>,
}

/// Records rendering work for a single device.
///
/// A context is not thread safe. Commands are recorded into one command
/// buffer at a time and everything the context creates is owned by it.
pub struct Context<D: Device> {
    pub(crate) device: D,
    pub(crate) info: DeviceInfo,
    pub(crate) null_resources: NullResources,
    pub(crate) flags: CreationFlags,
    pub(crate) shaders: Box<dyn ShaderBackend>,

    pub(crate) memory: MemoryAllocator,
    pub(crate) slabs: SlabAllocator,
    pub(crate) retired: RetirementQueue,
    pub(crate) commands: CommandBufferManager,
    pub(crate) queries: QueryManager,
    pub(crate) descriptors: DescriptorUpdater,

    pub(crate) render_passes: ObjectCache<RenderPassKey, vk::RenderPass>,
    pub(crate) pipeline_layouts: ObjectCache<Vec<DescriptorBinding>, PipelineLayout>,
    pub(crate) graphics_pipelines: ObjectCache<GraphicsPipelineKey, vk::Pipeline>,
    pub(crate) compute_pipelines:
        ObjectCache<(vk::ShaderModule, vk::PipelineLayout), vk::Pipeline>,

    /// The render pass recording in the current command buffer.
    pub(crate) render_pass: Option<vk::RenderPass>,
    pub(crate) framebuffer: Option<vk::Framebuffer>,
    /// Number of color attachments of the current render pass.
    pub(crate) rt_count: u32,
    pub(crate) sample_count: vk::SampleCountFlags,

    pub(crate) graphics: GraphicsPipelineState,
    pub(crate) compute: ComputePipelineState,

    pub(crate) dirty_graphics: GraphicsStates,
    pub(crate) dirty_compute: ComputeStates,
    /// Shader stages that need to be selected again.
    pub(crate) shader_update: ShaderTypes,
    pub(crate) update: UpdateFlags,
    pub(crate) transform_feedback_active: bool,
}

impl<D: Device> Context<D> {
    pub fn new(
        device: D,
        info: DeviceInfo,
        null_resources: NullResources,
        shaders: Box<dyn ShaderBackend>,
        options: ContextOptions,
    ) -> Result<Self, Error> {
        let _span = trace_span!("Context::new").entered();

        let commands = CommandBufferManager::new(&device, info.queue_family_index)?;

        Ok(Self {
            memory: MemoryAllocator::new(options.allocator),
            slabs: SlabAllocator::new(),
            retired: RetirementQueue::new(),
            commands,
            queries: QueryManager::new(),
            descriptors: DescriptorUpdater::new(),
            render_passes: ObjectCache::new("render pass"),
            pipeline_layouts: ObjectCache::new("pipeline layout"),
            graphics_pipelines: ObjectCache::new("graphics pipeline"),
            compute_pipelines: ObjectCache::new("compute pipeline"),
            render_pass: None,
            framebuffer: None,
            rt_count: 0,
            sample_count: vk::SampleCountFlags::TYPE_1,
            graphics: GraphicsPipelineState::default(),
            compute: ComputePipelineState::default(),
            dirty_graphics: GraphicsStates::all(),
            dirty_compute: ComputeStates::all(),
            shader_update: ShaderTypes::all(),
            update: UpdateFlags::all(),
            transform_feedback_active: false,
            flags: options.flags,
            device,
            info,
            null_resources,
            shaders,
        })
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Marks graphics state categories as changed.
    pub fn invalidate_graphics_state(&mut self, states: GraphicsStates) {
        self.dirty_graphics |= states;
    }

    /// Marks compute state categories as changed.
    pub fn invalidate_compute_state(&mut self, states: ComputeStates) {
        self.dirty_compute |= states;
    }
}

impl<D: Device> Drop for Context<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}
