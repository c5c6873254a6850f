//! Deferred destruction of objects used by in-flight command buffers.

use ash::vk;
use d3dvk_tracing::trace_span;

use crate::allocator::{Block, SlabSlot};
use crate::backend::Device;
use crate::Context;

/// An object waiting for a command buffer to complete before it is destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetiredObject {
    Framebuffer(vk::Framebuffer),
    DescriptorPool(vk::DescriptorPool),
    /// A dedicated device allocation.
    Memory(vk::DeviceMemory),
    Block(Block),
    SlabSlot(SlabSlot),
    Buffer(vk::Buffer),
    Image(vk::Image),
    BufferView(vk::BufferView),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
}

#[derive(Copy, Clone, Debug)]
struct Retired {
    object: RetiredObject,
    command_buffer_id: u64,
}

/// Retired objects with the id of the command buffer that must complete first.
///
/// Slots of destroyed objects in the middle of the list are reused by later
/// retirements.
#[derive(Debug, Default)]
pub struct RetirementQueue {
    entries: Vec<Option<Retired>>,
    free: Vec<usize>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects waiting for destruction.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `object` until `command_buffer_id` completed.
    ///
    /// Returns the object back if no slot could be allocated.
    pub fn push(
        &mut self,
        object: RetiredObject,
        command_buffer_id: u64,
    ) -> Result<(), RetiredObject> {
        let entry = Some(Retired {
            object,
            command_buffer_id,
        });

        if let Some(index) = self.free.pop() {
            self.entries[index] = entry;
            return Ok(());
        }

        // `reclaim` pushes into `free` without allocating, so it needs room
        // for every entry.
        if self.entries.try_reserve(1).is_err()
            || self.free.try_reserve(self.entries.len() + 1).is_err()
        {
            return Err(object);
        }

        self.entries.push(entry);
        Ok(())
    }

    /// Removes every object whose command buffer id is at most `completed` and
    /// passes it to `destroy`.
    pub fn reclaim(&mut self, completed: u64, mut destroy: impl FnMut(RetiredObject)) {
        let _span = trace_span!("RetirementQueue::reclaim").entered();

        for index in (0..self.entries.len()).rev() {
            match self.entries[index] {
                Some(entry) if entry.command_buffer_id > completed => continue,
                Some(entry) => destroy(entry.object),
                None => (),
            }

            if index == self.entries.len() - 1 {
                self.entries.pop();
            } else if self.entries[index].take().is_some() {
                self.free.push(index);
            }
        }

        let len = self.entries.len();
        self.free.retain(|index| *index < len);
    }
}

impl<D: Device> Context<D> {
    /// Destroys `object` once the command buffer with `command_buffer_id`
    /// completed.
    ///
    /// If the id already completed the object is destroyed immediately.
    pub fn retire(&mut self, object: RetiredObject, command_buffer_id: u64) {
        let _span = trace_span!("Context::retire").entered();

        if self.commands.completed_id >= command_buffer_id {
            self.destroy_object(object);
            return;
        }

        if let Err(object) = self.retired.push(object, command_buffer_id) {
            tracing::error!("leaking {:?}", object);
        }
    }

    /// Polls submitted command buffers and destroys every retired object whose
    /// command buffer completed.
    pub fn cleanup_resources(&mut self) {
        let _span = trace_span!("Context::cleanup_resources").entered();

        self.poll_command_buffers();
        self.reclaim_retired();
    }

    pub(crate) fn reclaim_retired(&mut self) {
        let completed = self.commands.completed_id;

        let mut retired = std::mem::take(&mut self.retired);
        retired.reclaim(completed, |object| self.destroy_object(object));
        self.retired = retired;
    }

    fn destroy_object(&mut self, object: RetiredObject) {
        match object {
            RetiredObject::Framebuffer(framebuffer) => {
                self.device.destroy_framebuffer(framebuffer);
            }
            RetiredObject::DescriptorPool(pool) => {
                self.device.destroy_descriptor_pool(pool);
            }
            RetiredObject::Memory(memory) => {
                self.memory.free_dedicated(&self.device, memory);
            }
            RetiredObject::Block(block) => self.memory.free_block(block),
            RetiredObject::SlabSlot(slot) => self.slabs.free(slot),
            RetiredObject::Buffer(buffer) => self.device.destroy_buffer(buffer),
            RetiredObject::Image(image) => self.device.destroy_image(image),
            RetiredObject::BufferView(view) => self.device.destroy_buffer_view(view),
            RetiredObject::ImageView(view) => self.device.destroy_image_view(view),
            RetiredObject::Sampler(sampler) => self.device.destroy_sampler(sampler),
        }

        tracing::trace!("destroyed {:?}", object);
    }
}
