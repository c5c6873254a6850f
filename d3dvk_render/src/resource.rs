//! Buffers and images backed by context-owned device memory.

use std::ptr::NonNull;

use ash::vk;
use d3dvk_tracing::trace_span;

use crate::allocator::{Allocation, Block, MemoryAllocator, SlabKey, SlabSlot};
use crate::backend::{Device, ImageDescriptor};
use crate::retire::RetiredObject;
use crate::{Context, Error};

/// Where the memory of a [`BufferObject`] comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    /// An object in a shared slab buffer.
    Slab(SlabSlot),
    /// A block of a memory chunk.
    Block(Block),
    /// Memory allocated for this buffer alone.
    Dedicated,
}

/// A buffer range with its memory.
#[derive(Copy, Clone, Debug)]
pub struct BufferObject {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub backing: Backing,
    /// Offset of the object in `buffer`.
    pub buffer_offset: u64,
    /// Offset of the object in `memory`.
    pub memory_offset: u64,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Properties of the memory type the buffer lives in.
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Id of the last command buffer using the buffer.
    pub command_buffer_id: u64,
    pub map_ptr: Option<NonNull<u8>>,
}

impl BufferObject {
    #[inline]
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: self.buffer_offset,
            range: self.size,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Image {
    pub image: vk::Image,
    pub allocation: Allocation,
    pub command_buffer_id: u64,
}

impl<D: Device> Context<D> {
    /// Allocates raw device memory of `memory_type`.
    ///
    /// The result is released by retiring its block or memory.
    pub fn allocate_memory(&mut self, memory_type: u32, size: u64) -> Result<Allocation, Error> {
        let _span = trace_span!("Context::allocate_memory").entered();
        self.memory.allocate(&self.device, memory_type, size, 1)
    }

    /// Creates a buffer of `size` bytes in memory with at least `memory_flags`.
    ///
    /// Small buffers are placed in a shared slab.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<BufferObject, Error> {
        let _span = trace_span!("Context::create_buffer").entered();

        if size <= self.memory.options().max_slab_object_size() {
            if let Some(buffer) = self.create_slab_buffer(size, usage, memory_flags) {
                return Ok(buffer);
            }
        }

        self.create_buffer_object(size, usage, memory_flags)
    }

    fn create_slab_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Option<BufferObject> {
        let key = SlabKey::new(
            self.memory.options(),
            &self.info.limits,
            size,
            usage,
            memory_flags,
        );

        let slot = match self.slabs.alloc(&key) {
            Some(slot) => slot,
            None => {
                let buffer = match self.create_buffer_object(key.size, usage, memory_flags) {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        tracing::error!("failed to create slab buffer: {}", err);
                        return None;
                    }
                };

                if let Err(buffer) = self.slabs.insert(key, buffer) {
                    self.destroy_buffer(buffer);
                    return None;
                }

                self.slabs.alloc(&key)?
            }
        };

        let slab = &self.slabs.get(slot.slab)?.buffer;
        let buffer_offset = u64::from(slot.index) * key.object_size();

        tracing::trace!(
            "placed {} byte buffer in slab {} at offset {}",
            size,
            slot.slab,
            buffer_offset
        );

        Some(BufferObject {
            buffer: slab.buffer,
            memory: slab.memory,
            backing: Backing::Slab(slot),
            buffer_offset,
            memory_offset: slab.memory_offset + buffer_offset,
            size,
            usage,
            memory_flags: slab.memory_flags,
            command_buffer_id: 0,
            map_ptr: None,
        })
    }

    fn create_buffer_object(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<BufferObject, Error> {
        let buffer = self.device.create_buffer(size, usage).map_err(|err| {
            tracing::error!("failed to create buffer: {}", err);
            err
        })?;

        let req = self.device.buffer_memory_requirements(buffer);
        let Some(memory_type) = self
            .info
            .find_memory_type(req.memory_type_bits, memory_flags)
        else {
            tracing::error!(
                "no memory type for buffer in {:#x} with {:?}",
                req.memory_type_bits,
                memory_flags
            );
            self.device.destroy_buffer(buffer);
            return Err(Error::NoMemoryType {
                type_bits: req.memory_type_bits,
                flags: memory_flags,
            });
        };

        let allocation =
            match self
                .memory
                .allocate(&self.device, memory_type, req.size, req.alignment)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    tracing::error!("failed to allocate buffer memory: {}", err);
                    self.device.destroy_buffer(buffer);
                    return Err(err);
                }
            };

        if let Err(err) =
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            tracing::error!("failed to bind buffer memory: {}", err);
            free_allocation(&self.device, &mut self.memory, allocation);
            self.device.destroy_buffer(buffer);
            return Err(err.into());
        }

        let backing = match allocation {
            Allocation::Block(block) => Backing::Block(block),
            Allocation::Dedicated { .. } => Backing::Dedicated,
        };

        tracing::trace!(
            "created buffer {:?} in memory {:?} at {}",
            buffer,
            allocation.memory(),
            allocation.offset()
        );

        Ok(BufferObject {
            buffer,
            memory: allocation.memory(),
            backing,
            buffer_offset: 0,
            memory_offset: allocation.offset(),
            size,
            usage,
            memory_flags: self.info.memory_types[memory_type as usize],
            command_buffer_id: 0,
            map_ptr: None,
        })
    }

    /// Creates an optimally tiled image in device-local memory.
    pub fn create_image(&mut self, descriptor: &ImageDescriptor) -> Result<Image, Error> {
        let _span = trace_span!("Context::create_image").entered();

        let image = self.device.create_image(descriptor).map_err(|err| {
            tracing::error!("failed to create image: {}", err);
            err
        })?;

        let req = self.device.image_memory_requirements(image);
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let Some(memory_type) = self.info.find_memory_type(req.memory_type_bits, flags) else {
            tracing::error!("no memory type for image in {:#x}", req.memory_type_bits);
            self.device.destroy_image(image);
            return Err(Error::NoMemoryType {
                type_bits: req.memory_type_bits,
                flags,
            });
        };

        let allocation =
            match self
                .memory
                .allocate(&self.device, memory_type, req.size, req.alignment)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    tracing::error!("failed to allocate image memory: {}", err);
                    self.device.destroy_image(image);
                    return Err(err);
                }
            };

        if let Err(err) =
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        {
            tracing::error!("failed to bind image memory: {}", err);
            self.device.destroy_image(image);
            free_allocation(&self.device, &mut self.memory, allocation);
            return Err(err.into());
        }

        tracing::trace!("created image {:?}", image);

        Ok(Image {
            image,
            allocation,
            command_buffer_id: 0,
        })
    }

    /// Maps the buffer and returns a pointer to its first byte.
    pub fn map_buffer(&mut self, buffer: &mut BufferObject) -> Result<NonNull<u8>, Error> {
        let _span = trace_span!("Context::map_buffer").entered();

        if let Some(ptr) = buffer.map_ptr {
            return Ok(ptr);
        }

        let ptr = match buffer.backing {
            Backing::Slab(slot) => {
                let slab = self
                    .slabs
                    .get_mut(slot.slab)
                    .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

                let base = match slab.buffer.map_ptr {
                    Some(ptr) => ptr,
                    None => {
                        let ptr = map_backing(&self.device, &mut self.memory, &slab.buffer)?;
                        slab.buffer.map_ptr = Some(ptr);
                        ptr
                    }
                };
                slab.map_count += 1;

                // SAFETY: The object lies within the mapped slab buffer.
                unsafe { base.add(buffer.buffer_offset as usize) }
            }
            Backing::Block(_) | Backing::Dedicated => {
                map_backing(&self.device, &mut self.memory, buffer)?
            }
        };

        buffer.map_ptr = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap_buffer(&mut self, buffer: &mut BufferObject) {
        let _span = trace_span!("Context::unmap_buffer").entered();

        if buffer.map_ptr.take().is_none() {
            return;
        }

        match buffer.backing {
            Backing::Slab(slot) => self.unmap_slab(slot.slab),
            _ => unmap_backing(&self.device, &mut self.memory, buffer),
        }
    }

    fn unmap_slab(&mut self, slab: usize) {
        let Some(slab) = self.slabs.get_mut(slab) else {
            return;
        };

        slab.map_count = slab.map_count.saturating_sub(1);
        if slab.map_count == 0 && slab.buffer.map_ptr.take().is_some() {
            unmap_backing(&self.device, &mut self.memory, &slab.buffer);
        }
    }

    /// Releases the buffer once the last command buffer using it completed.
    pub fn destroy_buffer(&mut self, buffer: BufferObject) {
        let _span = trace_span!("Context::destroy_buffer").entered();

        let id = buffer.command_buffer_id;
        match buffer.backing {
            Backing::Slab(slot) => {
                if buffer.map_ptr.is_some() {
                    self.unmap_slab(slot.slab);
                }
                self.retire(RetiredObject::SlabSlot(slot), id);
            }
            Backing::Block(block) => {
                self.retire(RetiredObject::Buffer(buffer.buffer), id);
                if buffer.map_ptr.is_some() {
                    self.memory.unmap_chunk(&self.device, block.chunk);
                }
                self.retire(RetiredObject::Block(block), id);
            }
            Backing::Dedicated => {
                self.retire(RetiredObject::Buffer(buffer.buffer), id);
                if buffer.map_ptr.is_some() {
                    self.device.unmap_memory(buffer.memory);
                }
                self.retire(RetiredObject::Memory(buffer.memory), id);
            }
        }
    }

    pub fn destroy_image(&mut self, image: Image) {
        let _span = trace_span!("Context::destroy_image").entered();

        let id = image.command_buffer_id;
        self.retire(RetiredObject::Image(image.image), id);
        match image.allocation {
            Allocation::Block(block) => self.retire(RetiredObject::Block(block), id),
            Allocation::Dedicated { memory, .. } => self.retire(RetiredObject::Memory(memory), id),
        }
    }

    pub fn destroy_buffer_view(&mut self, view: vk::BufferView, command_buffer_id: u64) {
        self.retire(RetiredObject::BufferView(view), command_buffer_id);
    }

    pub fn destroy_image_view(&mut self, view: vk::ImageView, command_buffer_id: u64) {
        self.retire(RetiredObject::ImageView(view), command_buffer_id);
    }

    pub fn destroy_sampler(&mut self, sampler: vk::Sampler, command_buffer_id: u64) {
        self.retire(RetiredObject::Sampler(sampler), command_buffer_id);
    }
}

fn free_allocation<D: Device>(device: &D, memory: &mut MemoryAllocator, allocation: Allocation) {
    match allocation {
        Allocation::Block(block) => memory.free_block(block),
        Allocation::Dedicated { memory: raw, .. } => memory.free_dedicated(device, raw),
    }
}

fn map_backing<D: Device>(
    device: &D,
    memory: &mut MemoryAllocator,
    buffer: &BufferObject,
) -> Result<NonNull<u8>, Error> {
    match buffer.backing {
        Backing::Block(block) => {
            let base = memory.map_chunk(device, block.chunk)?;
            // SAFETY: The block lies within the mapped chunk.
            Ok(unsafe { base.add(buffer.memory_offset as usize) })
        }
        Backing::Dedicated => device.map_memory(buffer.memory).map_err(|err| {
            tracing::error!("failed to map memory {:?}: {}", buffer.memory, err);
            err.into()
        }),
        Backing::Slab(_) => Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into()),
    }
}

fn unmap_backing<D: Device>(device: &D, memory: &mut MemoryAllocator, buffer: &BufferObject) {
    match buffer.backing {
        Backing::Block(block) => memory.unmap_chunk(device, block.chunk),
        Backing::Dedicated => device.unmap_memory(buffer.memory),
        Backing::Slab(_) => (),
    }
}
