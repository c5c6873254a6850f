//! Packing of small buffers into shared device buffers.
//!
//! A slab is a single buffer split into [`SLAB_OBJECTS`] equally sized
//! objects. Slabs with at least one free object are chained per
//! [`SlabKey`]; the head of a chain is the slab objects are taken from.

use ash::vk;
use d3dvk_tracing::trace_span;
use hashbrown::HashMap;
use slab::Slab;

use crate::backend::DeviceLimits;
use crate::options::AllocatorOptions;
use crate::resource::BufferObject;

/// Number of objects in a slab.
pub const SLAB_OBJECTS: u32 = u32::BITS;

/// Slabs are only shared between buffers with equal keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlabKey {
    /// Memory properties requested for the buffer.
    pub memory_flags: vk::MemoryPropertyFlags,
    pub usage: vk::BufferUsageFlags,
    /// Size of the whole slab.
    pub size: u64,
}

impl SlabKey {
    /// Returns the key of the slab serving a buffer of `size` bytes.
    pub fn new(
        options: &AllocatorOptions,
        limits: &DeviceLimits,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        let mut align = options.slab_min_object_align;

        if usage.intersects(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        ) && limits.min_texel_buffer_offset_alignment > align
        {
            align = limits.min_texel_buffer_offset_alignment;
        }

        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
            && limits.min_uniform_buffer_offset_alignment != 0
        {
            align = limits.min_uniform_buffer_offset_alignment;
        }

        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER)
            && limits.min_storage_buffer_offset_alignment != 0
        {
            align = limits.min_storage_buffer_offset_alignment;
        }

        let object_size = size
            .next_multiple_of(align)
            .max(options.min_block_size / u64::from(SLAB_OBJECTS));

        Self {
            memory_flags,
            usage,
            size: object_size * u64::from(SLAB_OBJECTS),
        }
    }

    #[inline]
    pub const fn object_size(&self) -> u64 {
        self.size / SLAB_OBJECTS as u64
    }
}

/// An object in a slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlabSlot {
    pub slab: usize,
    pub index: u32,
}

#[derive(Debug)]
pub(crate) struct BufferSlab {
    /// The buffer backing all objects.
    pub buffer: BufferObject,
    pub key: SlabKey,
    /// Number of mapped objects.
    pub map_count: u32,
    /// Set bits are free objects.
    map: u32,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct SlabAllocator {
    slabs: Slab<BufferSlab>,
    /// Head of the chain of slabs with free objects for every key.
    available: HashMap<SlabKey, usize>,
}

impl SlabAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a free object from the slabs of `key`.
    pub fn alloc(&mut self, key: &SlabKey) -> Option<SlabSlot> {
        let _span = trace_span!("SlabAllocator::alloc").entered();

        let head = *self.available.get(key)?;
        let slab = &mut self.slabs[head];
        debug_assert_ne!(slab.map, 0);

        let index = slab.map.trailing_zeros();
        slab.map &= !(1 << index);

        if slab.map == 0 {
            match slab.next.take() {
                Some(next) => {
                    self.available.insert(*key, next);
                }
                None => {
                    self.available.remove(key);
                }
            }
        }

        Some(SlabSlot { slab: head, index })
    }

    /// Adds a new slab with all objects free.
    ///
    /// Gives `buffer` back if the slab cannot be tracked.
    pub fn insert(&mut self, key: SlabKey, buffer: BufferObject) -> Result<usize, BufferObject> {
        if self.available.try_reserve(1).is_err() {
            tracing::error!("failed to add buffer slab");
            return Err(buffer);
        }

        let next = self.available.get(&key).copied();
        let index = self.slabs.insert(BufferSlab {
            buffer,
            key,
            map_count: 0,
            map: !0,
            next,
        });
        self.available.insert(key, index);

        tracing::trace!("created buffer slab {} for {:?}", index, key);
        Ok(index)
    }

    /// Returns an object to its slab.
    ///
    /// A slab that was full becomes the head of its chain again.
    pub fn free(&mut self, slot: SlabSlot) {
        let _span = trace_span!("SlabAllocator::free").entered();

        let Some(slab) = self.slabs.get_mut(slot.slab) else {
            tracing::error!("freeing object {} of unknown slab {}", slot.index, slot.slab);
            return;
        };

        let bit = 1 << slot.index;
        if slab.map & bit != 0 {
            tracing::error!("object {} of slab {} is already free", slot.index, slot.slab);
            return;
        }

        if slab.map == 0 {
            if self.available.try_reserve(1).is_err() {
                tracing::error!("failed to make slab {} available", slot.slab);
            } else {
                slab.next = self.available.insert(slab.key, slot.slab);
            }
        }

        slab.map |= bit;
    }

    pub(crate) fn get(&self, slab: usize) -> Option<&BufferSlab> {
        self.slabs.get(slab)
    }

    pub(crate) fn get_mut(&mut self, slab: usize) -> Option<&mut BufferSlab> {
        self.slabs.get_mut(slab)
    }

    /// Number of slabs, including fully used ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.slabs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    /// Number of keys with free objects.
    #[inline]
    pub fn available_keys(&self) -> usize {
        self.available.len()
    }

    /// Removes every slab and returns the backing buffers.
    pub fn drain(&mut self) -> Vec<BufferObject> {
        self.available.clear();
        self.slabs.drain().map(|slab| slab.buffer).collect()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use super::{SlabAllocator, SlabKey, SLAB_OBJECTS};
    use crate::backend::DeviceLimits;
    use crate::options::AllocatorOptions;
    use crate::resource::{Backing, BufferObject};

    fn limits() -> DeviceLimits {
        DeviceLimits {
            min_texel_buffer_offset_alignment: 64,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 32,
            max_framebuffer_width: 4096,
            max_framebuffer_height: 4096,
            max_framebuffer_layers: 256,
        }
    }

    fn key() -> SlabKey {
        SlabKey {
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            size: 4096,
        }
    }

    fn buffer(raw: u64) -> BufferObject {
        BufferObject {
            buffer: vk::Buffer::from_raw(raw),
            memory: vk::DeviceMemory::from_raw(raw),
            backing: Backing::Dedicated,
            buffer_offset: 0,
            memory_offset: 0,
            size: 4096,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            command_buffer_id: 0,
            map_ptr: None,
        }
    }

    #[test]
    fn slab_key_alignment() {
        let options = AllocatorOptions::default();
        let limits = limits();
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        // Small objects are at least 1/32 of the minimum block.
        let key = SlabKey::new(&options, &limits, 1, vk::BufferUsageFlags::VERTEX_BUFFER, flags);
        assert_eq!(key.object_size(), 128);
        assert_eq!(key.size, 128 * 32);

        let key = SlabKey::new(
            &options,
            &limits,
            300,
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            flags,
        );
        assert_eq!(key.object_size(), 320);

        // The storage alignment overrides the uniform alignment.
        let key = SlabKey::new(
            &options,
            &limits,
            300,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            flags,
        );
        assert_eq!(key.object_size(), 320);

        let key = SlabKey::new(&options, &limits, 300, vk::BufferUsageFlags::UNIFORM_BUFFER, flags);
        assert_eq!(key.object_size(), 512);
    }

    #[test]
    fn objects_are_taken_lowest_first() {
        let mut slabs = SlabAllocator::new();
        assert!(slabs.alloc(&key()).is_none());

        let slab = slabs.insert(key(), buffer(1)).unwrap();
        for index in 0..SLAB_OBJECTS {
            let slot = slabs.alloc(&key()).unwrap();
            assert_eq!(slot.slab, slab);
            assert_eq!(slot.index, index);
        }

        assert!(slabs.alloc(&key()).is_none());
        assert_eq!(slabs.available_keys(), 0);
    }

    #[test]
    fn full_slab_becomes_available_once() {
        let mut slabs = SlabAllocator::new();
        slabs.insert(key(), buffer(1)).unwrap();

        let slots: Vec<_> = (0..SLAB_OBJECTS)
            .map(|_| slabs.alloc(&key()).unwrap())
            .collect();
        assert_eq!(slabs.available_keys(), 0);

        for slot in slots {
            slabs.free(slot);
            assert_eq!(slabs.available_keys(), 1);
        }

        // All objects are free again and the slab is still cached.
        assert_eq!(slabs.len(), 1);
        for _ in 0..SLAB_OBJECTS {
            slabs.alloc(&key()).unwrap();
        }
        assert!(slabs.alloc(&key()).is_none());
    }

    #[test]
    fn freed_slab_moves_to_chain_head() {
        let mut slabs = SlabAllocator::new();
        let first = slabs.insert(key(), buffer(1)).unwrap();
        let slot = slabs.alloc(&key()).unwrap();
        for _ in 1..SLAB_OBJECTS {
            slabs.alloc(&key()).unwrap();
        }

        let second = slabs.insert(key(), buffer(2)).unwrap();
        assert_eq!(slabs.alloc(&key()).unwrap().slab, second);

        slabs.free(slot);
        assert_eq!(slabs.alloc(&key()).unwrap(), slot);
        assert_eq!(slot.slab, first);

        // The first slab is full again and the chain continues with the second.
        assert_eq!(slabs.alloc(&key()).unwrap().slab, second);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut slabs = SlabAllocator::new();
        slabs.insert(key(), buffer(1)).unwrap();

        let slot = slabs.alloc(&key()).unwrap();
        slabs.free(slot);
        slabs.free(slot);

        assert_eq!(slabs.alloc(&key()).unwrap(), slot);
        assert_eq!(slabs.alloc(&key()).unwrap().index, 1);
    }
}
