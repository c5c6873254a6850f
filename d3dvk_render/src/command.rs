//! Command buffer recording, submission and completion tracking.
//!
//! Every command buffer gets a 64-bit id when recording starts. Objects used
//! by a command buffer remember its id and are only destroyed once that id
//! completed.

use ash::vk;
use d3dvk_tracing::trace_span;

use crate::backend::{Device, ImageBarrier, Submission};
use crate::pipeline::destroy_pipeline_layout;
use crate::retire::RetiredObject;
use crate::state::{GraphicsStates, UpdateFlags};
use crate::{Context, Error};

#[derive(Copy, Clone, Debug)]
struct SubmittedBuffer {
    buffer: vk::CommandBuffer,
    id: u64,
    fence: vk::Fence,
}

#[derive(Debug)]
pub struct CommandBufferManager {
    pool: Option<vk::CommandPool>,
    current: Option<vk::CommandBuffer>,
    /// Id of the command buffer that is recorded next or right now.
    pub(crate) current_id: u64,
    /// All command buffers with an id up to this one completed.
    pub(crate) completed_id: u64,
    /// Submitted buffers in no particular order.
    submitted: Vec<SubmittedBuffer>,
}

impl CommandBufferManager {
    pub(crate) fn new<D: Device>(device: &D, queue_family_index: u32) -> Result<Self, Error> {
        let pool = device
            .create_command_pool(queue_family_index)
            .map_err(|err| {
                tracing::error!("failed to create command pool: {}", err);
                err
            })?;

        Ok(Self {
            pool: Some(pool),
            current: None,
            current_id: 1,
            completed_id: 0,
            submitted: Vec::new(),
        })
    }

    /// Number of submitted command buffers that were not seen completing yet.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }

    /// The command buffer that is recording right now.
    #[inline]
    pub fn current_buffer(&self) -> Option<vk::CommandBuffer> {
        self.current
    }

    /// Advances the completed id to just before the oldest buffer still in flight.
    fn update_completed_id(&mut self) {
        let oldest = self
            .submitted
            .iter()
            .map(|buffer| buffer.id)
            .min()
            .unwrap_or(self.current_id);

        self.completed_id = self.completed_id.max(oldest - 1);
    }
}

impl<D: Device> Context<D> {
    #[inline]
    pub fn current_command_buffer_id(&self) -> u64 {
        self.commands.current_id
    }

    #[inline]
    pub fn completed_command_buffer_id(&self) -> u64 {
        self.commands.completed_id
    }

    /// Returns the command buffer that is currently recorded, beginning a new
    /// one if necessary.
    pub fn get_command_buffer(&mut self) -> Result<vk::CommandBuffer, Error> {
        let _span = trace_span!("Context::get_command_buffer").entered();

        if let Some(buffer) = self.commands.current {
            return Ok(buffer);
        }

        let pool = self
            .commands
            .pool
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;

        let buffer = self.device.allocate_command_buffer(pool).map_err(|err| {
            tracing::error!("failed to allocate command buffer: {}", err);
            err
        })?;

        if let Err(err) = self.device.begin_command_buffer(buffer) {
            tracing::error!("failed to begin command buffer: {}", err);
            self.device.free_command_buffer(pool, buffer);
            return Err(err.into());
        }

        tracing::trace!(
            "began command buffer {:?} with id {}",
            buffer,
            self.commands.current_id
        );
        self.commands.current = Some(buffer);

        self.accumulate_pending_queries();
        self.resume_queries(buffer);

        Ok(buffer)
    }

    /// Submits the current command buffer.
    ///
    /// Does nothing if no command buffer is recording.
    pub fn submit(
        &mut self,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
    ) -> Result<(), Error> {
        let _span = trace_span!("Context::submit").entered();

        let Some(buffer) = self.commands.current else {
            return Ok(());
        };
        let pool = self
            .commands
            .pool
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;

        self.suspend_queries(buffer);
        self.end_current_render_pass();

        // Nothing stays bound across command buffers.
        self.graphics.pipeline = None;
        self.update |= UpdateFlags::all();
        self.dirty_graphics |= GraphicsStates::STREAMSRC
            | GraphicsStates::INDEXBUFFER
            | GraphicsStates::BLEND_FACTOR
            | GraphicsStates::STENCIL_REF;

        self.commands.current = None;

        if self.commands.submitted.try_reserve(1).is_err() {
            tracing::error!("failed to track submitted command buffer");
            self.device.free_command_buffer(pool, buffer);
            return Err(Error::CacheInsert("submitted command buffer"));
        }

        if let Err(err) = self.device.end_command_buffer(buffer) {
            tracing::error!("failed to end command buffer: {}", err);
            self.device.free_command_buffer(pool, buffer);
            return Err(err.into());
        }

        let fence = match self.device.create_fence() {
            Ok(fence) => fence,
            Err(err) => {
                tracing::error!("failed to create fence: {}", err);
                self.device.free_command_buffer(pool, buffer);
                return Err(err.into());
            }
        };

        let submission = Submission {
            command_buffer: buffer,
            wait_semaphores,
            wait_stages,
            signal_semaphores,
        };
        if let Err(err) = self.device.queue_submit(&submission, fence) {
            tracing::error!("failed to submit command buffer: {}", err);
            self.device.destroy_fence(fence);
            self.device.free_command_buffer(pool, buffer);
            return Err(err.into());
        }

        let id = self.commands.current_id;
        self.commands.submitted.push(SubmittedBuffer { buffer, id, fence });
        tracing::trace!("submitted command buffer {:?} with id {}", buffer, id);

        match id.checked_add(1) {
            Some(next) => self.commands.current_id = next,
            None => {
                tracing::trace!("command buffer id wrapped around");
                self.drain_command_buffers();
                self.commands.completed_id = 0;
                self.commands.current_id = 1;
            }
        }

        self.cleanup_resources();
        Ok(())
    }

    /// Blocks until the command buffer with `id` and every buffer submitted
    /// before it completed.
    pub fn wait(&mut self, id: u64) {
        let _span = trace_span!("Context::wait").entered();

        if id <= self.commands.completed_id || id > self.commands.current_id {
            return;
        }

        let mut waited = false;
        for buffer in self.commands.submitted.iter().filter(|buffer| buffer.id <= id) {
            if let Err(err) = self.device.wait_for_fence(buffer.fence) {
                tracing::error!("failed to wait for command buffer {}: {}", buffer.id, err);
            }
            waited = true;
        }

        if !waited {
            tracing::error!("command buffer {} was not submitted", id);
        }

        self.cleanup_resources();
    }

    /// Releases every submitted command buffer whose fence signaled.
    pub fn poll_command_buffers(&mut self) {
        let _span = trace_span!("Context::poll_command_buffers").entered();

        let commands = &mut self.commands;
        let Some(pool) = commands.pool else {
            return;
        };

        let mut index = 0;
        while index < commands.submitted.len() {
            let buffer = commands.submitted[index];

            match self.device.fence_status(buffer.fence) {
                Ok(true) => (),
                Ok(false) => {
                    index += 1;
                    continue;
                }
                Err(err) => {
                    tracing::error!("failed to get status of fence {:?}: {}", buffer.fence, err);
                    index += 1;
                    continue;
                }
            }

            self.device.destroy_fence(buffer.fence);
            self.device.free_command_buffer(pool, buffer.buffer);
            commands.submitted.swap_remove(index);

            tracing::trace!("command buffer {} completed", buffer.id);
        }

        commands.update_completed_id();
    }

    /// Waits for every submitted command buffer and destroys all retired objects.
    fn drain_command_buffers(&mut self) {
        for buffer in &self.commands.submitted {
            if let Err(err) = self.device.wait_for_fence(buffer.fence) {
                tracing::error!("failed to wait for command buffer {}: {}", buffer.id, err);
            }
        }
        self.poll_command_buffers();

        // Buffers whose fence could not be waited on are abandoned.
        if let Some(pool) = self.commands.pool {
            for buffer in self.commands.submitted.drain(..) {
                self.device.destroy_fence(buffer.fence);
                self.device.free_command_buffer(pool, buffer.buffer);
            }
        }

        self.commands.completed_id = self.commands.current_id;
        self.reclaim_retired();
    }

    /// Ends the current render pass if one is recording.
    pub fn end_current_render_pass(&mut self) {
        let _span = trace_span!("Context::end_current_render_pass").entered();

        if let Some(buffer) = self.commands.current {
            if self.render_pass.take().is_some() {
                self.device.cmd_end_render_pass(buffer);
                self.device.cmd_pipeline_barrier(
                    buffer,
                    vk::PipelineStageFlags::ALL_GRAPHICS,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                );
            }
        }
        self.render_pass = None;

        if let Some(framebuffer) = self.framebuffer.take() {
            self.retire(
                RetiredObject::Framebuffer(framebuffer),
                self.commands.current_id,
            );
        }
    }

    /// Records an image layout transition outside of any render pass.
    pub fn image_barrier(&mut self, barrier: &ImageBarrier) -> Result<(), Error> {
        let _span = trace_span!("Context::image_barrier").entered();

        self.end_current_render_pass();
        let buffer = self.get_command_buffer()?;
        self.device.cmd_image_barrier(buffer, barrier);
        Ok(())
    }

    /// Destroys everything the context owns.
    ///
    /// Blocks until all submitted work completed. Calling this more than once
    /// does nothing.
    pub(crate) fn destroy(&mut self) {
        let _span = trace_span!("Context::destroy").entered();

        let Some(pool) = self.commands.pool else {
            return;
        };

        if let Some(buffer) = self.commands.current.take() {
            self.device.free_command_buffer(pool, buffer);
        }
        self.render_pass = None;

        self.drain_command_buffers();
        self.commands.pool = None;

        if let Some(descriptor_pool) = self.descriptors.pool.take() {
            self.device.destroy_descriptor_pool(descriptor_pool);
        }
        if let Some(framebuffer) = self.framebuffer.take() {
            self.device.destroy_framebuffer(framebuffer);
        }
        self.device.destroy_command_pool(pool);

        self.reclaim_retired();
        self.queries.destroy(&self.device);

        for buffer in self.slabs.drain() {
            self.destroy_buffer(buffer);
        }

        let device = &self.device;
        self.graphics_pipelines
            .clear(|pipeline| device.destroy_pipeline(pipeline));
        self.compute_pipelines
            .clear(|pipeline| device.destroy_pipeline(pipeline));
        self.pipeline_layouts
            .clear(|layout| destroy_pipeline_layout(device, layout));
        self.render_passes
            .clear(|render_pass| device.destroy_render_pass(render_pass));

        self.memory.destroy(&self.device);
    }
}
