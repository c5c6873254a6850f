//! Interface to the shader translation layer.

use ash::vk;
use bitflags::bitflags;

use crate::backend::DescriptorBinding;
use crate::state::State;
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
}

impl ShaderType {
    pub const COUNT: usize = 6;

    /// Graphics stages in pipeline order.
    pub const GRAPHICS: [Self; 5] = [
        Self::Vertex,
        Self::Hull,
        Self::Domain,
        Self::Geometry,
        Self::Pixel,
    ];

    pub const fn stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Hull => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::Domain => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Pixel => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderTypes: u8 {
        const VERTEX = 1 << 0;
        const HULL = 1 << 1;
        const DOMAIN = 1 << 2;
        const GEOMETRY = 1 << 3;
        const PIXEL = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

impl ShaderTypes {
    pub const GRAPHICS: Self = Self::COMPUTE.complement();
}

/// Dimension of the resource a binding expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Buffer,
    Texture1D,
    Texture2D,
    Texture2DMs,
    Texture3D,
    TextureCube,
    Texture1DArray,
    Texture2DArray,
    Texture2DMsArray,
    TextureCubeArray,
}

/// Component type of a typed buffer binding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Uint,
    Int,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    ConstantBuffer,
    ShaderResourceView,
    UnorderedAccessView,
    UnorderedAccessViewCounter,
    Sampler,
}

/// A resource slot read by a shader and the descriptor binding it lives at.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceBinding {
    pub shader_type: ShaderType,
    pub kind: DescriptorKind,
    pub resource_type: ResourceType,
    pub data_type: DataType,
    /// Register index in the shader.
    pub register: u32,
    pub binding: u32,
}

/// Shaders selected for the graphics pipeline.
#[derive(Clone, Debug, Default)]
pub struct GraphicsProgram {
    /// Modules indexed like [`ShaderType::GRAPHICS`]. Missing stages are null.
    pub modules: [vk::ShaderModule; 5],
    /// Descriptor set layout shared by all stages.
    pub layout: Vec<DescriptorBinding>,
    pub bindings: Vec<ResourceBinding>,
    /// The geometry shader only feeds stream output.
    pub rasterizer_discard: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ComputeProgram {
    pub module: vk::ShaderModule,
    pub layout: Vec<DescriptorBinding>,
    pub bindings: Vec<ResourceBinding>,
}

/// Produces shader modules and their binding layout for a [`State`].
pub trait ShaderBackend {
    /// Selects the graphics shaders for `state`.
    ///
    /// `changed` contains the stages that changed since the last selection.
    fn select_graphics(&mut self, state: &State, changed: ShaderTypes)
        -> Result<GraphicsProgram, Error>;

    fn select_compute(&mut self, state: &State) -> Result<ComputeProgram, Error>;
}
