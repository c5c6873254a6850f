//! Resource and command core translating D3D-style rendering state onto Vulkan.
//!
//! A [`Context`] owns all GPU objects it creates: device memory chunks and
//! buffer slabs, the current command buffer, the structural caches for render
//! passes, pipeline layouts and pipelines, descriptor pools and query pools.
//! Objects that may still be referenced by in-flight command buffers are
//! retired and destroyed once their command buffer id completed.

pub mod allocator;
pub mod backend;
mod cache;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod options;
pub mod pipeline;
pub mod query;
pub mod render_pass;
mod resolver;
pub mod resource;
pub mod retire;
pub mod shader;
pub mod state;
pub mod statistics;

use ash::vk;
use thiserror::Error;

pub use context::Context;
pub use options::{AllocatorOptions, ContextOptions, CreationFlags};
pub use query::{QueryId, QueryType};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// A Vulkan call failed.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("no memory type in {type_bits:#x} with properties {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    /// Growing a cache or bookkeeping array failed.
    #[error("failed to insert {0}")]
    CacheInsert(&'static str),
    #[error("unsupported query type: {0:?}")]
    UnsupportedQuery(QueryType),
    #[error("unsupported resource type: {0:?}")]
    UnsupportedResourceType(shader::ResourceType),
    #[error("null unordered access view at slot {0}")]
    NullUnorderedAccessView(u32),
    #[error("missing unordered access view counter at slot {0}")]
    MissingCounterView(u32),
    #[error("no pipeline layout selected")]
    NoPipelineLayout,
    #[error("no compute pipeline selected")]
    NoComputePipeline,
    #[error("no shader modules selected for draw")]
    NoShaderModules,
    #[error("invalid query id")]
    InvalidQuery,
}
