use bitflags::bitflags;

bitflags! {
    /// Compatibility switches fixed when a context is created.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CreationFlags: u32 {
        /// Interpret depth bias with the legacy integer convention.
        const LEGACY_DEPTH_BIAS = 1 << 0;
        /// Never enable primitive restart for strip topologies.
        const NO_PRIMITIVE_RESTART = 1 << 1;
    }
}

#[derive(Clone, Debug, Default)]
pub struct ContextOptions {
    pub flags: CreationFlags,
    pub allocator: AllocatorOptions,
}

/// Sizes used by the device memory allocators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// Size of one device memory chunk. Must be a power of two.
    ///
    /// Requests larger than half a chunk get a dedicated allocation.
    pub chunk_size: u64,
    /// Smallest block the chunk allocator hands out. Must be a power of two.
    pub min_block_size: u64,
    /// Minimum alignment of objects placed in buffer slabs.
    pub slab_min_object_align: u64,
}

impl AllocatorOptions {
    /// Largest request served from a buffer slab.
    #[inline]
    pub const fn max_slab_object_size(&self) -> u64 {
        self.min_block_size / 2
    }

    /// Largest request served from a chunk.
    #[inline]
    pub const fn max_block_size(&self) -> u64 {
        self.chunk_size / 2
    }
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        let chunk_size = 64 * 1024 * 1024;

        Self {
            chunk_size,
            // 15 orders between a chunk and its smallest block.
            min_block_size: chunk_size >> 14,
            slab_min_object_align: 16,
        }
    }
}
