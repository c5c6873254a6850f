//! Device memory sub-allocation.
//!
//! Requests up to half a chunk are carved out of per-memory-type chunks by a
//! [`BuddyAllocator`]. Larger requests get their own dedicated allocation.
//! Small buffers are packed into [`buffer_slab`]s on top of that.

pub mod buddy;
pub mod buffer_slab;

use std::ptr::NonNull;

use ash::vk;
use d3dvk_tracing::trace_span;
use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;
use slab::Slab;

use crate::backend::Device;
use crate::options::AllocatorOptions;
use crate::statistics::{ChunkStatistics, DedicatedStatistics};
use crate::Error;

pub use buddy::BuddyAllocator;
pub use buffer_slab::{SlabAllocator, SlabKey, SlabSlot};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub const fn start(&self) -> u64 {
        self.offset
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A range of a memory chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Index of the owning chunk.
    pub chunk: usize,
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    Block(Block),
    /// A device allocation used by a single resource.
    Dedicated { memory: vk::DeviceMemory, size: u64 },
}

impl Allocation {
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        match self {
            Self::Block(block) => block.memory,
            Self::Dedicated { memory, .. } => *memory,
        }
    }

    /// Offset of the allocation in [`memory`](Self::memory).
    #[inline]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Block(block) => block.offset,
            Self::Dedicated { .. } => 0,
        }
    }
}

#[derive(Debug)]
struct Chunk {
    memory_type: u32,
    memory: vk::DeviceMemory,
    allocator: BuddyAllocator,
    map_ptr: Option<NonNull<u8>>,
    map_count: u32,
}

#[derive(Copy, Clone, Debug)]
struct Dedicated {
    memory_type: u32,
    size: u64,
}

#[derive(Debug)]
pub struct MemoryAllocator {
    options: AllocatorOptions,
    chunks: Slab<Chunk>,
    /// Chunk indices by memory type index.
    by_type: std::collections::HashMap<u32, Vec<usize>, BuildNoHashHasher<u32>>,
    dedicated: HashMap<vk::DeviceMemory, Dedicated>,
}

impl MemoryAllocator {
    pub fn new(options: AllocatorOptions) -> Self {
        assert!(options.chunk_size.is_power_of_two());
        assert!(options.min_block_size.is_power_of_two());

        Self {
            options,
            chunks: Slab::new(),
            by_type: Default::default(),
            dedicated: HashMap::new(),
        }
    }

    #[inline]
    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    /// Allocates `size` bytes of `memory_type` aligned to `align`.
    pub fn allocate<D: Device>(
        &mut self,
        device: &D,
        memory_type: u32,
        size: u64,
        align: u64,
    ) -> Result<Allocation, Error> {
        let _span = trace_span!("MemoryAllocator::allocate").entered();

        if size > self.options.max_block_size() {
            let memory = device.allocate_memory(memory_type, size).map_err(|err| {
                tracing::error!(
                    "failed to allocate {} bytes of dedicated memory of type {}: {}",
                    size,
                    memory_type,
                    err
                );
                err
            })?;

            if self.dedicated.try_reserve(1).is_err() {
                tracing::error!("failed to track dedicated allocation");
                device.free_memory(memory);
                return Err(Error::CacheInsert("dedicated allocation"));
            }

            self.dedicated
                .insert(memory, Dedicated { memory_type, size });
            tracing::trace!("allocated dedicated memory {:?} ({} bytes)", memory, size);
            return Ok(Allocation::Dedicated { memory, size });
        }

        let align = align.max(1).next_power_of_two();

        if let Some(indices) = self.by_type.get(&memory_type) {
            for &index in indices {
                let chunk = &mut self.chunks[index];
                if let Some(region) = chunk.allocator.alloc(size, align) {
                    return Ok(Allocation::Block(Block {
                        chunk: index,
                        memory: chunk.memory,
                        offset: region.offset,
                        size: region.size,
                    }));
                }
            }
        }

        let index = self.create_chunk(device, memory_type)?;
        let chunk = &mut self.chunks[index];
        let region = chunk
            .allocator
            .alloc(size, align)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        Ok(Allocation::Block(Block {
            chunk: index,
            memory: chunk.memory,
            offset: region.offset,
            size: region.size,
        }))
    }

    fn create_chunk<D: Device>(&mut self, device: &D, memory_type: u32) -> Result<usize, Error> {
        let size = self.options.chunk_size;
        let memory = device.allocate_memory(memory_type, size).map_err(|err| {
            tracing::error!(
                "failed to allocate {} byte chunk of memory type {}: {}",
                size,
                memory_type,
                err
            );
            err
        })?;

        let indices = self.by_type.entry(memory_type).or_default();
        if indices.try_reserve(1).is_err() {
            tracing::error!("failed to track memory chunk");
            device.free_memory(memory);
            return Err(Error::CacheInsert("memory chunk"));
        }

        let index = self.chunks.insert(Chunk {
            memory_type,
            memory,
            allocator: BuddyAllocator::new(size, self.options.min_block_size),
            map_ptr: None,
            map_count: 0,
        });
        indices.push(index);

        tracing::trace!(
            "created memory chunk {:?} of type {} ({} bytes)",
            memory,
            memory_type,
            size
        );
        Ok(index)
    }

    /// Returns a block to its chunk.
    pub fn free_block(&mut self, block: Block) {
        let _span = trace_span!("MemoryAllocator::free_block").entered();

        let freed = self
            .chunks
            .get_mut(block.chunk)
            .and_then(|chunk| chunk.allocator.dealloc(block.offset));

        if freed.is_none() {
            tracing::error!("freeing unknown block {:?}", block);
        }
    }

    /// Frees a dedicated allocation.
    pub fn free_dedicated<D: Device>(&mut self, device: &D, memory: vk::DeviceMemory) {
        if self.dedicated.remove(&memory).is_none() {
            tracing::warn!("freeing untracked memory {:?}", memory);
        }

        device.free_memory(memory);
        tracing::trace!("freed memory {:?}", memory);
    }

    /// Maps the whole chunk and returns its base address.
    ///
    /// Every call must be paired with [`unmap_chunk`](Self::unmap_chunk).
    pub fn map_chunk<D: Device>(&mut self, device: &D, chunk: usize) -> Result<NonNull<u8>, Error> {
        let _span = trace_span!("MemoryAllocator::map_chunk").entered();

        let chunk = self
            .chunks
            .get_mut(chunk)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

        let ptr = match chunk.map_ptr {
            Some(ptr) => ptr,
            None => {
                let ptr = device.map_memory(chunk.memory).map_err(|err| {
                    tracing::error!("failed to map chunk memory {:?}: {}", chunk.memory, err);
                    err
                })?;
                chunk.map_ptr = Some(ptr);
                ptr
            }
        };

        chunk.map_count += 1;
        Ok(ptr)
    }

    pub fn unmap_chunk<D: Device>(&mut self, device: &D, chunk: usize) {
        let Some(chunk) = self.chunks.get_mut(chunk) else {
            return;
        };

        if chunk.map_count == 0 {
            tracing::warn!("unmapping chunk {:?} that is not mapped", chunk.memory);
            return;
        }

        chunk.map_count -= 1;
        if chunk.map_count == 0 {
            device.unmap_memory(chunk.memory);
            chunk.map_ptr = None;
        }
    }

    /// Frees every chunk.
    ///
    /// Blocks still handed out become dangling.
    pub fn destroy<D: Device>(&mut self, device: &D) {
        let _span = trace_span!("MemoryAllocator::destroy").entered();

        for chunk in self.chunks.drain() {
            if !chunk.allocator.is_empty() {
                tracing::warn!(
                    "destroying chunk {:?} with {} bytes in use",
                    chunk.memory,
                    chunk.allocator.used()
                );
            }

            if chunk.map_ptr.is_some() {
                device.unmap_memory(chunk.memory);
            }
            device.free_memory(chunk.memory);
        }
        self.by_type.clear();

        if !self.dedicated.is_empty() {
            tracing::warn!("leaking {} dedicated allocations", self.dedicated.len());
        }
    }

    pub fn chunk_statistics(&self) -> Vec<ChunkStatistics> {
        self.chunks
            .iter()
            .map(|(_, chunk)| ChunkStatistics {
                memory_type: chunk.memory_type,
                size: chunk.allocator.size(),
                used: chunk.allocator.used(),
                mapped: chunk.map_ptr.is_some(),
            })
            .collect()
    }

    pub fn dedicated_statistics(&self) -> Vec<DedicatedStatistics> {
        self.dedicated
            .values()
            .map(|dedicated| DedicatedStatistics {
                memory_type: dedicated.memory_type,
                size: dedicated.size,
            })
            .collect()
    }
}
