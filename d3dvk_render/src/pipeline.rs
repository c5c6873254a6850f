//! Pipeline layouts and pipeline objects.

use std::hash::{Hash, Hasher};

use ash::vk;

use crate::backend::{DescriptorBinding, Device};
use crate::{Context, Error};

/// An `f32` compared and hashed by its bit pattern.
#[derive(Copy, Clone, Debug, Default)]
pub struct FloatBits(pub f32);

impl PartialEq for FloatBits {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatBits {}

impl Hash for FloatBits {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f32> for FloatBits {
    #[inline]
    fn from(value: f32) -> Self {
        Self(value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexDivisor {
    pub binding: u32,
    pub divisor: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ViewportKey {
    pub x: FloatBits,
    pub y: FloatBits,
    pub width: FloatBits,
    pub height: FloatBits,
    pub min_depth: FloatBits,
    pub max_depth: FloatBits,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScissorKey {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthBiasKey {
    pub constant: FloatBits,
    pub clamp: FloatBits,
    pub slope: FloatBits,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RasterizerKey {
    pub depth_clamp: bool,
    pub discard: bool,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    /// `None` disables depth bias.
    pub depth_bias: Option<DepthBiasKey>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MultisampleKey {
    pub samples: vk::SampleCountFlags,
    pub alpha_to_coverage: bool,
    pub sample_mask: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilFaceKey {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilKey {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
    pub front: StencilFaceKey,
    pub back: StencilFaceKey,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlendAttachmentKey {
    pub enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

/// Complete description of a graphics pipeline.
///
/// All stages use the `main` entry point. Blend constants and the stencil
/// reference are dynamic state and not part of the key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub stages: Vec<ShaderStage>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub divisors: Vec<VertexDivisor>,
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub patch_control_points: u32,
    pub viewport: ViewportKey,
    pub scissor: ScissorKey,
    pub rasterizer: RasterizerKey,
    pub multisample: MultisampleKey,
    pub depth_stencil: DepthStencilKey,
    pub blend: Vec<BlendAttachmentKey>,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
}

impl GraphicsPipelineKey {
    pub const ENTRY_POINT: &'static std::ffi::CStr = c"main";
    pub const LINE_WIDTH: f32 = 1.0;
    pub const MAX_DEPTH_BOUNDS: f32 = 1.0;
    pub const LOGIC_OP: vk::LogicOp = vk::LogicOp::COPY;
    pub const BLEND_CONSTANTS: [f32; 4] = [1.0; 4];
    pub const DYNAMIC_STATES: [vk::DynamicState; 2] = [
        vk::DynamicState::BLEND_CONSTANTS,
        vk::DynamicState::STENCIL_REFERENCE,
    ];
}

/// A descriptor set layout and the pipeline layout using it as set 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineLayout {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
}

pub(crate) fn create_pipeline_layout<D: Device>(
    device: &D,
    bindings: &[DescriptorBinding],
) -> Result<PipelineLayout, Error> {
    let set_layout = device.create_descriptor_set_layout(bindings).map_err(|err| {
        tracing::error!("failed to create descriptor set layout: {}", err);
        err
    })?;

    let layout = match device.create_pipeline_layout(set_layout) {
        Ok(layout) => layout,
        Err(err) => {
            tracing::error!("failed to create pipeline layout: {}", err);
            device.destroy_descriptor_set_layout(set_layout);
            return Err(err.into());
        }
    };

    tracing::trace!("created pipeline layout {:?}", layout);
    Ok(PipelineLayout { set_layout, layout })
}

pub(crate) fn destroy_pipeline_layout<D: Device>(device: &D, layout: PipelineLayout) {
    device.destroy_pipeline_layout(layout.layout);
    device.destroy_descriptor_set_layout(layout.set_layout);
}

impl<D: Device> Context<D> {
    /// Returns the pipeline layout for the ordered list of `bindings`.
    pub fn get_pipeline_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> Result<PipelineLayout, Error> {
        let _span = d3dvk_tracing::trace_span!("Context::get_pipeline_layout").entered();

        let device = &self.device;
        self.pipeline_layouts.get_or_create(
            bindings,
            |bindings| create_pipeline_layout(device, bindings),
            |layout| destroy_pipeline_layout(device, layout),
        )
    }

    /// Returns the pipeline for the current graphics pipeline key.
    pub(crate) fn get_graphics_pipeline(&mut self) -> Result<vk::Pipeline, Error> {
        let _span = d3dvk_tracing::trace_span!("Context::get_graphics_pipeline").entered();

        let device = &self.device;
        self.graphics_pipelines.get_or_create(
            &self.graphics.key,
            |key| {
                let pipeline = device.create_graphics_pipeline(key).map_err(|err| {
                    tracing::error!("failed to create graphics pipeline: {}", err);
                    err
                })?;
                tracing::trace!("created graphics pipeline {:?}", pipeline);
                Ok(pipeline)
            },
            |pipeline| device.destroy_pipeline(pipeline),
        )
    }

    pub(crate) fn get_compute_pipeline(
        &mut self,
        module: vk::ShaderModule,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, Error> {
        let _span = d3dvk_tracing::trace_span!("Context::get_compute_pipeline").entered();

        let device = &self.device;
        self.compute_pipelines.get_or_create(
            &(module, layout),
            |&(module, layout)| {
                let pipeline = device.create_compute_pipeline(module, layout).map_err(|err| {
                    tracing::error!("failed to create compute pipeline: {}", err);
                    err
                })?;
                tracing::trace!("created compute pipeline {:?}", pipeline);
                Ok(pipeline)
            },
            |pipeline| device.destroy_pipeline(pipeline),
        )
    }
}
