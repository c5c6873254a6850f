use d3dvk_tracing::trace_span;

use crate::backend::Device;
use crate::Context;

/// A device memory chunk shared by sub-allocated blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkStatistics {
    pub memory_type: u32,
    pub size: u64,
    /// Bytes handed out as blocks.
    pub used: u64,
    pub mapped: bool,
}

/// A live allocation with its own device memory object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DedicatedStatistics {
    pub memory_type: u32,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    pub chunks: Vec<ChunkStatistics>,
    pub dedicated: Vec<DedicatedStatistics>,
    /// Number of buffer slabs serving small buffers.
    pub slabs: usize,
}

impl MemoryStatistics {
    /// Returns the total size of all device memory objects.
    pub fn allocated(&self) -> u64 {
        let chunks: u64 = self.chunks.iter().map(|chunk| chunk.size).sum();
        let dedicated: u64 = self.dedicated.iter().map(|alloc| alloc.size).sum();
        chunks + dedicated
    }
}

impl<D: Device> Context<D> {
    /// Returns a snapshot of the device memory owned by the context.
    pub fn memory_statistics(&self) -> MemoryStatistics {
        let _span = trace_span!("Context::memory_statistics").entered();

        MemoryStatistics {
            chunks: self.memory.chunk_statistics(),
            dedicated: self.memory.dedicated_statistics(),
            slabs: self.slabs.len(),
        }
    }
}
