//! Render pass keys, the render pass cache and lazy render pass begin.

use ash::vk;
use bitflags::bitflags;
use d3dvk_tracing::trace_span;
use glam::UVec2;

use crate::backend::{Device, RenderPassDescriptor};
use crate::state::{Framebuffer, RenderTargetView, ResourceLayer, MAX_RENDER_TARGETS};
use crate::{Context, Error};

bitflags! {
    /// Attachments cleared when the render pass begins.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const TARGET = 1 << 0;
        const ZBUFFER = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub layout: vk::ImageLayout,
}

impl AttachmentKey {
    fn new(view: &RenderTargetView) -> Self {
        Self {
            format: view.format.vk,
            samples: view.samples(),
            layout: view.layout,
        }
    }

    fn description(
        &self,
        load_op: vk::AttachmentLoadOp,
        stencil_load_op: vk::AttachmentLoadOp,
        stencil_store_op: vk::AttachmentStoreOp,
    ) -> vk::AttachmentDescription {
        vk::AttachmentDescription {
            format: self.format,
            samples: self.samples.max(vk::SampleCountFlags::TYPE_1),
            load_op,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op,
            stencil_store_op,
            initial_layout: self.layout,
            final_layout: self.layout,
            ..Default::default()
        }
    }
}

/// Everything a render pass object depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub render_targets: [AttachmentKey; MAX_RENDER_TARGETS],
    /// Bit `i` is set if render target `i` is bound.
    pub rt_mask: u32,
    pub depth_stencil: Option<AttachmentKey>,
    pub clear_flags: ClearFlags,
}

impl RenderPassKey {
    pub fn new(framebuffer: &Framebuffer, clear_flags: ClearFlags) -> Self {
        let mut key = Self {
            clear_flags,
            ..Default::default()
        };

        for (index, view) in framebuffer.render_targets.iter().enumerate() {
            let Some(view) = view else {
                continue;
            };
            if view.format.vk == vk::Format::UNDEFINED {
                continue;
            }

            key.render_targets[index] = AttachmentKey::new(view);
            key.rt_mask |= 1 << index;
        }

        key.depth_stencil = framebuffer.depth_stencil.as_ref().map(AttachmentKey::new);
        key
    }

    pub fn descriptor(&self) -> RenderPassDescriptor {
        let mut descriptor = RenderPassDescriptor::default();

        let color_load = if self.clear_flags.contains(ClearFlags::TARGET) {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };

        let rt_count = (u32::BITS - self.rt_mask.leading_zeros()) as usize;
        for (index, attachment) in self.render_targets[..rt_count].iter().enumerate() {
            if self.rt_mask & (1 << index) == 0 {
                descriptor.color_attachments.push(vk::AttachmentReference {
                    attachment: vk::ATTACHMENT_UNUSED,
                    layout: vk::ImageLayout::UNDEFINED,
                });
                continue;
            }

            descriptor.color_attachments.push(vk::AttachmentReference {
                attachment: descriptor.attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            descriptor.attachments.push(attachment.description(
                color_load,
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentStoreOp::DONT_CARE,
            ));
        }

        if let Some(attachment) = &self.depth_stencil {
            let load_op = |flag| {
                if self.clear_flags.contains(flag) {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                }
            };

            descriptor.depth_stencil_attachment = Some(vk::AttachmentReference {
                attachment: descriptor.attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
            descriptor.attachments.push(attachment.description(
                load_op(ClearFlags::ZBUFFER),
                load_op(ClearFlags::STENCIL),
                vk::AttachmentStoreOp::STORE,
            ));
        }

        descriptor
    }
}

impl<D: Device> Context<D> {
    pub fn get_render_pass(&mut self, key: &RenderPassKey) -> Result<vk::RenderPass, Error> {
        let _span = trace_span!("Context::get_render_pass").entered();

        let device = &self.device;
        self.render_passes.get_or_create(
            key,
            |key| {
                let render_pass = device.create_render_pass(&key.descriptor()).map_err(|err| {
                    tracing::error!("failed to create render pass: {}", err);
                    err
                })?;
                tracing::trace!("created render pass {:?}", render_pass);
                Ok(render_pass)
            },
            |render_pass| device.destroy_render_pass(render_pass),
        )
    }

    /// Begins a render pass over the bound render targets unless one is
    /// already recording.
    pub(crate) fn begin_render_pass(
        &mut self,
        buffer: vk::CommandBuffer,
        framebuffer: &Framebuffer,
        resources: &mut dyn ResourceLayer,
    ) -> Result<(), Error> {
        let _span = trace_span!("Context::begin_render_pass").entered();

        if self.render_pass.is_some() {
            return Ok(());
        }

        let limits = self.info.limits;
        let mut extent = UVec2::new(limits.max_framebuffer_width, limits.max_framebuffer_height);
        let mut layers = limits.max_framebuffer_layers;
        let mut views = Vec::with_capacity(MAX_RENDER_TARGETS + 1);
        let id = self.commands.current_id;

        let mut add_view = |view: &RenderTargetView| {
            views.push(view.view);
            resources.reference(view.resource, id);
            extent = extent.min(view.extent);
            layers = layers.min(view.layer_count);
        };

        self.rt_count = 0;
        for (index, view) in framebuffer.render_targets.iter().enumerate() {
            let Some(view) = view else {
                continue;
            };
            if view.format.vk == vk::Format::UNDEFINED {
                continue;
            }

            add_view(view);
            self.rt_count = index as u32 + 1;
        }

        if let Some(view) = &framebuffer.depth_stencil {
            add_view(view);
        }

        let key = RenderPassKey::new(framebuffer, ClearFlags::empty());
        let render_pass = self.get_render_pass(&key)?;

        let vk_framebuffer = self
            .device
            .create_framebuffer(render_pass, &views, extent, layers)
            .map_err(|err| {
                tracing::error!("failed to create framebuffer: {}", err);
                err
            })?;

        self.device
            .cmd_begin_render_pass(buffer, render_pass, vk_framebuffer, extent);
        self.render_pass = Some(render_pass);
        self.framebuffer = Some(vk_framebuffer);

        tracing::trace!(
            "began render pass {:?} with {} color attachments at {}",
            render_pass,
            self.rt_count,
            extent
        );
        Ok(())
    }
}
