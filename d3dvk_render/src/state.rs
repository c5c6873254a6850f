//! The generic rendering state consumed by the draw and dispatch resolver.

use ash::vk;
use bitflags::bitflags;
use glam::UVec2;

use crate::shader::ShaderType;

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_STREAMS: usize = 16;
pub const MAX_STREAM_OUTPUT_BUFFERS: usize = 4;

/// Identifies a buffer or texture owned by the [`ResourceLayer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Access to the resources referenced by a [`State`].
pub trait ResourceLayer {
    /// Makes the current contents of `resource` available to the GPU.
    ///
    /// Returns `true` if the Vulkan object backing the resource changed since
    /// the last load.
    fn load(&mut self, resource: ResourceId) -> bool;

    /// Returns the buffer range backing a buffer resource.
    fn buffer_info(&self, resource: ResourceId) -> vk::DescriptorBufferInfo;

    /// Returns the image view used when a texture is bound without an explicit view.
    fn default_image_info(&self, resource: ResourceId) -> vk::DescriptorImageInfo;

    /// Records that a command buffer with `command_buffer_id` uses `resource`.
    fn reference(&mut self, resource: ResourceId, command_buffer_id: u64);
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Format {
    pub vk: vk::Format,
    pub alpha_size: u8,
    pub stencil_size: u8,
    /// Divisor converting a legacy integer depth bias into a constant factor.
    pub depth_bias_scale: f32,
}

impl Format {
    pub const UNDEFINED: Self = Self {
        vk: vk::Format::UNDEFINED,
        alpha_size: 0,
        stencil_size: 0,
        depth_bias_scale: 1.0,
    };
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderTargetView {
    pub resource: ResourceId,
    pub view: vk::ImageView,
    pub format: Format,
    pub sample_count: u32,
    pub layout: vk::ImageLayout,
    pub extent: UVec2,
    pub layer_count: u32,
}

impl RenderTargetView {
    pub fn samples(&self) -> vk::SampleCountFlags {
        vk::SampleCountFlags::from_raw(self.sample_count.max(1))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Framebuffer {
    pub render_targets: [Option<RenderTargetView>; MAX_RENDER_TARGETS],
    pub depth_stencil: Option<RenderTargetView>,
}

#[derive(Copy, Clone, Debug)]
pub enum ViewTarget {
    Buffer(vk::BufferView),
    /// A texture view. `None` binds the texture's default view.
    Image(Option<vk::DescriptorImageInfo>),
}

#[derive(Copy, Clone, Debug)]
pub struct ShaderResourceView {
    pub resource: ResourceId,
    pub target: ViewTarget,
}

#[derive(Copy, Clone, Debug)]
pub struct UnorderedAccessView {
    pub resource: ResourceId,
    pub target: ViewTarget,
    /// Buffer view of the append/consume counter.
    pub counter_view: Option<vk::BufferView>,
}

#[derive(Copy, Clone, Debug)]
pub struct Sampler {
    pub info: vk::DescriptorImageInfo,
}

/// Resources bound to a single shader stage.
#[derive(Clone, Debug, Default)]
pub struct StageResources {
    pub constant_buffers: Vec<Option<ResourceId>>,
    pub shader_resource_views: Vec<Option<ShaderResourceView>>,
    pub samplers: Vec<Option<Sampler>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSource {
    pub buffer: Option<ResourceId>,
    pub offset: u64,
    pub stride: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOutputTarget {
    pub buffer: Option<ResourceId>,
    /// Byte offset into the buffer. [`StreamOutputTarget::APPEND`] continues
    /// after the previously written data.
    pub offset: u32,
}

impl StreamOutputTarget {
    pub const APPEND: u32 = u32::MAX;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexElement {
    pub stream: u32,
    pub format: vk::Format,
    /// Offset relative to the start of a vertex in the stream.
    pub offset: u32,
    pub instanced: bool,
    pub divisor: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    R16Uint,
    #[default]
    R32Uint,
}

impl IndexFormat {
    pub const fn index_type(self) -> vk::IndexType {
        match self {
            Self::R16Uint => vk::IndexType::UINT16,
            Self::R32Uint => vk::IndexType::UINT32,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    LineListAdj,
    LineStripAdj,
    TriangleListAdj,
    TriangleStripAdj,
    Patch,
}

impl PrimitiveType {
    pub const fn topology(self) -> vk::PrimitiveTopology {
        match self {
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            Self::LineListAdj => vk::PrimitiveTopology::LINE_LIST_WITH_ADJACENCY,
            Self::LineStripAdj => vk::PrimitiveTopology::LINE_STRIP_WITH_ADJACENCY,
            Self::TriangleListAdj => vk::PrimitiveTopology::TRIANGLE_LIST_WITH_ADJACENCY,
            Self::TriangleStripAdj => vk::PrimitiveTopology::TRIANGLE_STRIP_WITH_ADJACENCY,
            Self::Patch => vk::PrimitiveTopology::PATCH_LIST,
        }
    }

    pub const fn is_list(self) -> bool {
        matches!(
            self,
            Self::PointList
                | Self::LineList
                | Self::TriangleList
                | Self::LineListAdj
                | Self::TriangleListAdj
                | Self::Patch
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

impl CullMode {
    pub const fn flags(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RasterizerState {
    pub cull_mode: CullMode,
    pub front_ccw: bool,
    pub depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub scale_bias: f32,
    pub depth_clip: bool,
    pub scissor: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            front_ccw: false,
            depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            scale_bias: 0.0,
            depth_clip: true,
            scissor: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Blend {
    Zero,
    #[default]
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
    SrcAlphaSat,
    /// Source alpha for the source and inverse source alpha for the destination.
    BothSrcAlpha,
    /// Inverse source alpha for the source and source alpha for the destination.
    BothInvSrcAlpha,
    BlendFactor,
    InvBlendFactor,
    Src1Color,
    InvSrc1Color,
    Src1Alpha,
    InvSrc1Alpha,
}

impl Blend {
    /// Maps the blend factor for a target of `format`.
    ///
    /// `alpha` selects the factor used for the alpha channel.
    pub fn factor(self, format: &Format, alpha: bool) -> vk::BlendFactor {
        match self {
            Self::Zero => vk::BlendFactor::ZERO,
            Self::One => vk::BlendFactor::ONE,
            Self::SrcColor => vk::BlendFactor::SRC_COLOR,
            Self::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            Self::SrcAlpha | Self::BothSrcAlpha => vk::BlendFactor::SRC_ALPHA,
            Self::InvSrcAlpha | Self::BothInvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            Self::DestAlpha if format.alpha_size != 0 => vk::BlendFactor::DST_ALPHA,
            Self::DestAlpha => vk::BlendFactor::ONE,
            Self::InvDestAlpha if format.alpha_size != 0 => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            Self::InvDestAlpha => vk::BlendFactor::ZERO,
            Self::DestColor => vk::BlendFactor::DST_COLOR,
            Self::InvDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            Self::SrcAlphaSat => vk::BlendFactor::SRC_ALPHA_SATURATE,
            Self::BlendFactor if alpha => vk::BlendFactor::CONSTANT_ALPHA,
            Self::BlendFactor => vk::BlendFactor::CONSTANT_COLOR,
            Self::InvBlendFactor if alpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
            Self::InvBlendFactor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
            Self::Src1Color => vk::BlendFactor::SRC1_COLOR,
            Self::InvSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
            Self::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
            Self::InvSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub const fn op(self) -> vk::BlendOp {
        match self {
            Self::Add => vk::BlendOp::ADD,
            Self::Subtract => vk::BlendOp::SUBTRACT,
            Self::RevSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            Self::Min => vk::BlendOp::MIN,
            Self::Max => vk::BlendOp::MAX,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
    }
}

impl ColorWriteMask {
    pub fn components(self) -> vk::ColorComponentFlags {
        let mut flags = vk::ColorComponentFlags::empty();
        if self.contains(Self::RED) {
            flags |= vk::ColorComponentFlags::R;
        }
        if self.contains(Self::GREEN) {
            flags |= vk::ColorComponentFlags::G;
        }
        if self.contains(Self::BLUE) {
            flags |= vk::ColorComponentFlags::B;
        }
        if self.contains(Self::ALPHA) {
            flags |= vk::ColorComponentFlags::A;
        }
        flags
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetBlend {
    pub enable: bool,
    pub src: Blend,
    pub dst: Blend,
    pub op: BlendOp,
    pub src_alpha: Blend,
    pub dst_alpha: Blend,
    pub op_alpha: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            enable: false,
            src: Blend::One,
            dst: Blend::Zero,
            op: BlendOp::Add,
            src_alpha: Blend::One,
            dst_alpha: Blend::Zero,
            op_alpha: BlendOp::Add,
            write_mask: ColorWriteMask::all(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub alpha_to_coverage: bool,
    /// Use a separate blend description for every render target instead of
    /// the first one for all.
    pub independent: bool,
    pub rt: [RenderTargetBlend; MAX_RENDER_TARGETS],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    pub const fn op(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

impl StencilOp {
    pub const fn op(self) -> vk::StencilOp {
        match self {
            Self::Keep => vk::StencilOp::KEEP,
            Self::Zero => vk::StencilOp::ZERO,
            Self::Replace => vk::StencilOp::REPLACE,
            Self::IncrSat => vk::StencilOp::INCREMENT_AND_CLAMP,
            Self::DecrSat => vk::StencilOp::DECREMENT_AND_CLAMP,
            Self::Invert => vk::StencilOp::INVERT,
            Self::Incr => vk::StencilOp::INCREMENT_AND_WRAP,
            Self::Decr => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilOpDesc {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: CompareFunc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
    pub stencil: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilOpDesc,
    pub back: StencilOpDesc,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth: true,
            depth_write: true,
            depth_func: CompareFunc::Less,
            stencil: false,
            stencil_read_mask: u8::MAX,
            stencil_write_mask: u8::MAX,
            front: StencilOpDesc::default(),
            back: StencilOpDesc::default(),
        }
    }
}

/// Which of the two pipelines a set of unordered access views belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// The complete rendering state of a context.
#[derive(Clone, Debug)]
pub struct State {
    pub fb: Framebuffer,
    /// Resources per shader stage, indexed by [`ShaderType`].
    pub stages: [StageResources; ShaderType::COUNT],
    /// Unordered access views, indexed by [`PipelineKind`].
    pub unordered_access_views: [Vec<Option<UnorderedAccessView>>; 2],
    pub streams: [StreamSource; MAX_STREAMS],
    pub index_buffer: Option<ResourceId>,
    pub index_format: IndexFormat,
    pub index_offset: u64,
    pub stream_output: [StreamOutputTarget; MAX_STREAM_OUTPUT_BUFFERS],
    pub vertex_elements: Vec<VertexElement>,
    pub primitive_type: PrimitiveType,
    pub patch_vertex_count: u32,
    pub viewport: Viewport,
    pub scissor_rect: ScissorRect,
    pub rasterizer: Option<RasterizerState>,
    pub blend: Option<BlendState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,
    pub stencil_ref: u32,
    /// Whether the current draw writes to the stream output targets.
    pub transform_feedback: bool,
}

impl State {
    #[inline]
    pub fn stage(&self, ty: ShaderType) -> &StageResources {
        &self.stages[ty as usize]
    }

    #[inline]
    pub fn unordered_access_views(&self, kind: PipelineKind) -> &[Option<UnorderedAccessView>] {
        &self.unordered_access_views[kind as usize]
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            fb: Framebuffer::default(),
            stages: Default::default(),
            unordered_access_views: Default::default(),
            streams: [StreamSource::default(); MAX_STREAMS],
            index_buffer: None,
            index_format: IndexFormat::default(),
            index_offset: 0,
            stream_output: [StreamOutputTarget::default(); MAX_STREAM_OUTPUT_BUFFERS],
            vertex_elements: Vec::new(),
            primitive_type: PrimitiveType::default(),
            patch_vertex_count: 0,
            viewport: Viewport::default(),
            scissor_rect: ScissorRect::default(),
            rasterizer: None,
            blend: None,
            depth_stencil: None,
            blend_factor: [1.0; 4],
            sample_mask: u32::MAX,
            stencil_ref: 0,
            transform_feedback: false,
        }
    }
}

bitflags! {
    /// Graphics state categories changed since the last draw.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct GraphicsStates: u32 {
        const SHADER_VERTEX = 1 << 0;
        const SHADER_HULL = 1 << 1;
        const SHADER_DOMAIN = 1 << 2;
        const SHADER_GEOMETRY = 1 << 3;
        const SHADER_PIXEL = 1 << 4;
        const FRAMEBUFFER = 1 << 5;
        const VERTEX_DECLARATION = 1 << 6;
        const STREAMSRC = 1 << 7;
        const INDEXBUFFER = 1 << 8;
        const STREAM_OUTPUT = 1 << 9;
        const VIEWPORT = 1 << 10;
        const SCISSOR = 1 << 11;
        const RASTERIZER = 1 << 12;
        const BLEND = 1 << 13;
        const BLEND_FACTOR = 1 << 14;
        const SAMPLE_MASK = 1 << 15;
        const DEPTH_STENCIL = 1 << 16;
        const STENCIL_REF = 1 << 17;
        const CONSTANT_BUFFER = 1 << 18;
        const SHADER_RESOURCE_BINDING = 1 << 19;
        const UNORDERED_ACCESS_VIEW_BINDING = 1 << 20;
    }
}

bitflags! {
    /// Compute state categories changed since the last dispatch.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ComputeStates: u32 {
        const SHADER = 1 << 0;
        const CONSTANT_BUFFER = 1 << 1;
        const SHADER_RESOURCE_BINDING = 1 << 2;
        const UNORDERED_ACCESS_VIEW_BINDING = 1 << 3;
    }
}

bitflags! {
    /// Work deferred to the next draw or dispatch.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct UpdateFlags: u32 {
        const SHADER_RESOURCE_BINDINGS = 1 << 0;
        const UNORDERED_ACCESS_VIEW_BINDINGS = 1 << 1;
        const COMPUTE_SHADER_RESOURCE_BINDINGS = 1 << 2;
        const COMPUTE_UNORDERED_ACCESS_VIEW_BINDINGS = 1 << 3;
        const COMPUTE_PIPELINE = 1 << 4;
        const STREAM_OUTPUT = 1 << 5;
    }
}
