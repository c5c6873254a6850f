//! Descriptor set allocation and resource binding writes.

use ash::vk;
use d3dvk_tracing::trace_span;

use crate::backend::{DescriptorInfo, DescriptorWrite, Device, NullResources};
use crate::retire::RetiredObject;
use crate::shader::{DataType, DescriptorKind, ResourceBinding, ResourceType};
use crate::state::{PipelineKind, ResourceId, ResourceLayer, State, ViewTarget};
use crate::{Context, Error};

/// Descriptors of every type a single pool provides.
const POOL_DESCRIPTORS: u32 = 1024;
const POOL_MAX_SETS: u32 = 512;

const POOL_TYPES: [vk::DescriptorType; 6] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::SAMPLER,
];

#[derive(Debug, Default)]
pub(crate) struct DescriptorUpdater {
    /// The pool new sets are allocated from.
    pub pool: Option<vk::DescriptorPool>,
    /// Write batch reused between updates.
    writes: Vec<DescriptorWrite>,
}

impl DescriptorUpdater {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create_pool<D: Device>(device: &D) -> Result<vk::DescriptorPool, Error> {
    let sizes = POOL_TYPES.map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: POOL_DESCRIPTORS,
    });

    let pool = device
        .create_descriptor_pool(POOL_MAX_SETS, &sizes)
        .map_err(|err| {
            tracing::error!("failed to create descriptor pool: {}", err);
            err
        })?;

    tracing::trace!("created descriptor pool {:?}", pool);
    Ok(pool)
}

fn null_view(
    null: &NullResources,
    binding: &ResourceBinding,
) -> Result<(vk::DescriptorType, DescriptorInfo), Error> {
    let image = match binding.resource_type {
        ResourceType::Buffer => {
            let view = match binding.data_type {
                DataType::Float => null.buffer_view_float,
                DataType::Uint | DataType::Int => null.buffer_view_uint,
            };
            return Ok((
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                DescriptorInfo::TexelBuffer(view),
            ));
        }
        ResourceType::Texture1D => null.image_1d,
        ResourceType::Texture2D => null.image_2d,
        ResourceType::Texture2DMs => null.image_2dms,
        ResourceType::Texture3D => null.image_3d,
        ResourceType::TextureCube => null.image_cube,
        ResourceType::Texture2DArray => null.image_2d_array,
        ResourceType::Texture2DMsArray => null.image_2dms_array,
        ty @ (ResourceType::Texture1DArray | ResourceType::TextureCubeArray) => {
            tracing::error!("no null view for {:?}", ty);
            return Err(Error::UnsupportedResourceType(ty));
        }
    };

    Ok((
        vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorInfo::Image(image),
    ))
}

/// Resolves the descriptor for a view target.
///
/// `texel_ty` and `image_ty` are the descriptor types used for buffer and
/// texture resources.
fn view_info(
    resources: &dyn ResourceLayer,
    resource: ResourceId,
    target: ViewTarget,
    texel_ty: vk::DescriptorType,
    image_ty: vk::DescriptorType,
) -> (vk::DescriptorType, DescriptorInfo) {
    match target {
        ViewTarget::Buffer(view) => (texel_ty, DescriptorInfo::TexelBuffer(view)),
        ViewTarget::Image(Some(info)) if info.image_view != vk::ImageView::null() => {
            (image_ty, DescriptorInfo::Image(info))
        }
        ViewTarget::Image(_) => (
            image_ty,
            DescriptorInfo::Image(resources.default_image_info(resource)),
        ),
    }
}

/// Fills `writes` with one write per binding.
#[allow(clippy::too_many_arguments)]
fn write_bindings(
    writes: &mut Vec<DescriptorWrite>,
    null: &NullResources,
    set: vk::DescriptorSet,
    state: &State,
    kind: PipelineKind,
    bindings: &[ResourceBinding],
    resources: &mut dyn ResourceLayer,
    command_buffer_id: u64,
) -> Result<(), Error> {
    writes.clear();
    writes
        .try_reserve(bindings.len())
        .map_err(|_| Error::CacheInsert("descriptor writes"))?;

    for binding in bindings {
        let stage = state.stage(binding.shader_type);
        let slot = binding.register as usize;

        let (ty, info) = match binding.kind {
            DescriptorKind::ConstantBuffer => {
                let info = match stage.constant_buffers.get(slot).copied().flatten() {
                    Some(resource) => {
                        resources.reference(resource, command_buffer_id);
                        resources.buffer_info(resource)
                    }
                    None => null.buffer_info,
                };
                (
                    vk::DescriptorType::UNIFORM_BUFFER,
                    DescriptorInfo::Buffer(info),
                )
            }
            DescriptorKind::ShaderResourceView => {
                match stage.shader_resource_views.get(slot).copied().flatten() {
                    Some(view) => {
                        resources.reference(view.resource, command_buffer_id);
                        view_info(
                            resources,
                            view.resource,
                            view.target,
                            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                            vk::DescriptorType::SAMPLED_IMAGE,
                        )
                    }
                    None => null_view(null, binding)?,
                }
            }
            DescriptorKind::UnorderedAccessView => {
                let Some(view) = state.unordered_access_views(kind).get(slot).copied().flatten()
                else {
                    tracing::error!("null unordered access view at slot {}", slot);
                    return Err(Error::NullUnorderedAccessView(binding.register));
                };

                resources.reference(view.resource, command_buffer_id);
                view_info(
                    resources,
                    view.resource,
                    view.target,
                    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                    vk::DescriptorType::STORAGE_IMAGE,
                )
            }
            DescriptorKind::UnorderedAccessViewCounter => {
                let counter = state
                    .unordered_access_views(kind)
                    .get(slot)
                    .copied()
                    .flatten()
                    .and_then(|view| view.counter_view);
                let Some(counter) = counter else {
                    tracing::error!("missing counter view at slot {}", slot);
                    return Err(Error::MissingCounterView(binding.register));
                };

                (
                    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                    DescriptorInfo::TexelBuffer(counter),
                )
            }
            DescriptorKind::Sampler => {
                let info = stage
                    .samplers
                    .get(slot)
                    .copied()
                    .flatten()
                    .map_or(null.sampler, |sampler| sampler.info);
                (vk::DescriptorType::SAMPLER, DescriptorInfo::Image(info))
            }
        };

        writes.push(DescriptorWrite {
            set,
            binding: binding.binding,
            ty,
            info,
        });
    }

    Ok(())
}

impl<D: Device> Context<D> {
    /// Allocates a descriptor set with `layout`.
    ///
    /// An exhausted pool is retired and replaced by a new one once.
    pub(crate) fn create_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, Error> {
        let pool = match self.descriptors.pool {
            Some(pool) => pool,
            None => {
                let pool = create_pool(&self.device)?;
                self.descriptors.pool = Some(pool);
                pool
            }
        };

        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => return Ok(set),
            Err(vk::Result::ERROR_FRAGMENTED_POOL | vk::Result::ERROR_OUT_OF_POOL_MEMORY) => (),
            Err(err) => {
                tracing::error!("failed to allocate descriptor set: {}", err);
                return Err(err.into());
            }
        }

        self.descriptors.pool = None;
        self.retire(
            RetiredObject::DescriptorPool(pool),
            self.commands.current_id,
        );

        let pool = create_pool(&self.device)?;
        self.descriptors.pool = Some(pool);

        self.device
            .allocate_descriptor_set(pool, layout)
            .map_err(|err| {
                tracing::error!("failed to allocate descriptor set: {}", err);
                err.into()
            })
    }

    /// Writes and binds a descriptor set for the resources the current
    /// program of `kind` reads.
    pub(crate) fn update_descriptors(
        &mut self,
        buffer: vk::CommandBuffer,
        state: &State,
        resources: &mut dyn ResourceLayer,
        kind: PipelineKind,
    ) -> Result<(), Error> {
        let _span = trace_span!("Context::update_descriptors").entered();

        let (layout, bind_point, empty) = match kind {
            PipelineKind::Graphics => (
                self.graphics.layout,
                vk::PipelineBindPoint::GRAPHICS,
                self.graphics.program.bindings.is_empty(),
            ),
            PipelineKind::Compute => (
                self.compute.layout,
                vk::PipelineBindPoint::COMPUTE,
                self.compute.program.bindings.is_empty(),
            ),
        };

        if empty {
            return Ok(());
        }

        let layout = layout.ok_or(Error::NoPipelineLayout)?;
        let set = self.create_descriptor_set(layout.set_layout)?;

        let bindings = match kind {
            PipelineKind::Graphics => &self.graphics.program.bindings,
            PipelineKind::Compute => &self.compute.program.bindings,
        };
        write_bindings(
            &mut self.descriptors.writes,
            &self.null_resources,
            set,
            state,
            kind,
            bindings,
            resources,
            self.commands.current_id,
        )?;

        self.device.update_descriptor_sets(&self.descriptors.writes);
        self.device
            .cmd_bind_descriptor_set(buffer, bind_point, layout.layout, set);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use crate::backend::mock::{Command, MockDevice};
    use crate::backend::DescriptorInfo;
    use crate::context::tests::test_context;
    use crate::pipeline::PipelineLayout;
    use crate::shader::{DataType, DescriptorKind, ResourceBinding, ResourceType, ShaderType};
    use crate::state::testing::TestResources;
    use crate::state::{
        PipelineKind, ResourceId, ShaderResourceView, State, UnorderedAccessView, ViewTarget,
    };
    use crate::Error;

    fn binding(
        shader_type: ShaderType,
        kind: DescriptorKind,
        resource_type: ResourceType,
        register: u32,
        binding: u32,
    ) -> ResourceBinding {
        ResourceBinding {
            shader_type,
            kind,
            resource_type,
            data_type: DataType::Float,
            register,
            binding,
        }
    }

    fn layout() -> PipelineLayout {
        PipelineLayout {
            set_layout: vk::DescriptorSetLayout::from_raw(0x500),
            layout: vk::PipelineLayout::from_raw(0x501),
        }
    }

    #[test]
    fn unbound_slots_use_null_resources() {
        let mut ctx = test_context();
        ctx.graphics.layout = Some(layout());
        ctx.graphics.program.bindings = vec![
            binding(
                ShaderType::Pixel,
                DescriptorKind::ConstantBuffer,
                ResourceType::Buffer,
                3,
                0,
            ),
            binding(
                ShaderType::Pixel,
                DescriptorKind::ShaderResourceView,
                ResourceType::Texture2D,
                0,
                1,
            ),
            ResourceBinding {
                data_type: DataType::Uint,
                ..binding(
                    ShaderType::Vertex,
                    DescriptorKind::ShaderResourceView,
                    ResourceType::Buffer,
                    1,
                    2,
                )
            },
            binding(
                ShaderType::Pixel,
                DescriptorKind::Sampler,
                ResourceType::Texture2D,
                0,
                3,
            ),
        ];

        let state = State::default();
        let mut resources = TestResources::default();
        let buffer = ctx.get_command_buffer().unwrap();
        ctx.update_descriptors(buffer, &state, &mut resources, PipelineKind::Graphics)
            .unwrap();

        let writes = ctx.device.writes();
        assert_eq!(writes.len(), 4);
        assert!(matches!(
            writes[0].info,
            DescriptorInfo::Buffer(info) if info.buffer == vk::Buffer::from_raw(0x9000)
        ));
        assert_eq!(writes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(matches!(
            writes[1].info,
            DescriptorInfo::Image(info) if info.image_view == vk::ImageView::from_raw(0x9011)
        ));
        assert!(matches!(
            writes[2].info,
            DescriptorInfo::TexelBuffer(view) if view == vk::BufferView::from_raw(0x9002)
        ));
        assert!(matches!(
            writes[3].info,
            DescriptorInfo::Image(info) if info.sampler == vk::Sampler::from_raw(0x9020)
        ));
        assert!(resources.references.is_empty());

        assert!(matches!(
            ctx.device.commands()[..],
            [Command::BindDescriptorSet(vk::PipelineBindPoint::GRAPHICS, layout, _)]
                if layout == vk::PipelineLayout::from_raw(0x501)
        ));
    }

    #[test]
    fn bound_views_are_referenced() {
        let mut ctx = test_context();
        ctx.compute.layout = Some(layout());
        ctx.compute.program.bindings = vec![
            binding(
                ShaderType::Compute,
                DescriptorKind::ShaderResourceView,
                ResourceType::Texture2D,
                0,
                0,
            ),
            binding(
                ShaderType::Compute,
                DescriptorKind::UnorderedAccessView,
                ResourceType::Buffer,
                0,
                1,
            ),
            binding(
                ShaderType::Compute,
                DescriptorKind::UnorderedAccessViewCounter,
                ResourceType::Buffer,
                0,
                2,
            ),
        ];

        let mut state = State::default();
        state.stages[ShaderType::Compute as usize].shader_resource_views =
            vec![Some(ShaderResourceView {
                resource: ResourceId(7),
                target: ViewTarget::Image(None),
            })];
        state.unordered_access_views[PipelineKind::Compute as usize] =
            vec![Some(UnorderedAccessView {
                resource: ResourceId(8),
                target: ViewTarget::Buffer(vk::BufferView::from_raw(0x80)),
                counter_view: Some(vk::BufferView::from_raw(0x81)),
            })];

        let mut resources = TestResources::default();
        let buffer = ctx.get_command_buffer().unwrap();
        ctx.update_descriptors(buffer, &state, &mut resources, PipelineKind::Compute)
            .unwrap();

        let writes = ctx.device.writes();
        assert_eq!(writes[0].ty, vk::DescriptorType::SAMPLED_IMAGE);
        assert!(matches!(
            writes[0].info,
            DescriptorInfo::Image(info) if info.image_view == vk::ImageView::from_raw(0x207)
        ));
        assert_eq!(writes[1].ty, vk::DescriptorType::STORAGE_TEXEL_BUFFER);
        assert!(matches!(
            writes[2].info,
            DescriptorInfo::TexelBuffer(view) if view == vk::BufferView::from_raw(0x81)
        ));

        assert!(resources.referenced(ResourceId(7)));
        assert!(resources.referenced(ResourceId(8)));
    }

    #[test]
    fn null_unordered_access_view_fails() {
        let mut ctx = test_context();
        ctx.compute.layout = Some(layout());
        ctx.compute.program.bindings = vec![binding(
            ShaderType::Compute,
            DescriptorKind::UnorderedAccessView,
            ResourceType::Texture2D,
            2,
            0,
        )];

        let buffer = ctx.get_command_buffer().unwrap();
        let res = ctx.update_descriptors(
            buffer,
            &State::default(),
            &mut TestResources::default(),
            PipelineKind::Compute,
        );
        assert_eq!(res, Err(Error::NullUnorderedAccessView(2)));
    }

    #[test]
    fn unsupported_null_view_type_fails() {
        let mut ctx = test_context();
        ctx.graphics.layout = Some(layout());
        ctx.graphics.program.bindings = vec![binding(
            ShaderType::Pixel,
            DescriptorKind::ShaderResourceView,
            ResourceType::TextureCubeArray,
            0,
            0,
        )];

        let buffer = ctx.get_command_buffer().unwrap();
        let res = ctx.update_descriptors(
            buffer,
            &State::default(),
            &mut TestResources::default(),
            PipelineKind::Graphics,
        );
        assert_eq!(
            res,
            Err(Error::UnsupportedResourceType(ResourceType::TextureCubeArray))
        );
    }

    #[test]
    fn exhausted_pool_is_retired_and_replaced() {
        let mut ctx = test_context();
        ctx.get_command_buffer().unwrap();

        ctx.create_descriptor_set(layout().set_layout).unwrap();
        let first = ctx.descriptors.pool.unwrap();

        ctx.device.fail_descriptor_sets(1);
        ctx.create_descriptor_set(layout().set_layout).unwrap();

        assert_ne!(ctx.descriptors.pool, Some(first));
        assert_eq!(ctx.device.stats().created(MockDevice::DESCRIPTOR_POOL), 2);
        // The old pool lives until the command buffer completes.
        assert_eq!(ctx.device.stats().destroyed(MockDevice::DESCRIPTOR_POOL), 0);
        assert_eq!(ctx.retired.len(), 1);

        ctx.device.fail_descriptor_sets(2);
        assert!(ctx.create_descriptor_set(layout().set_layout).is_err());
    }
}
