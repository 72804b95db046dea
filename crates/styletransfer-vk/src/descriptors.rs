//! Descriptor provisioning. Every set the effect will ever bind is
//! allocated from one exactly-sized pool and written once at construction;
//! recording never updates a descriptor afterwards.

use ash::vk;
use log::debug;

use crate::context::DeviceContext;
use crate::memory::DeviceBuffers;
use crate::operators::OperatorRegistry;
use crate::plan::{ImageRole, Third, WeightFamily, pool_sizes};
use crate::{Result, vk_call};

/// Sets belonging to one frame in flight: the two storage-image sets and
/// one set per scratch third.
pub struct FrameSets {
    input_image: vk::DescriptorSet,
    output_image: vk::DescriptorSet,
    thirds: [vk::DescriptorSet; Third::COUNT],
}

impl FrameSets {
    const SET_COUNT: usize = 2 + Third::COUNT;

    pub fn image_set(&self, role: ImageRole) -> vk::DescriptorSet {
        match role {
            ImageRole::Input => self.input_image,
            ImageRole::Output => self.output_image,
        }
    }

    pub fn third(&self, third: Third) -> vk::DescriptorSet {
        self.thirds[third.index()]
    }
}

pub struct DescriptorBank {
    ctx: DeviceContext,
    pool: vk::DescriptorPool,
    weight_sets: [vk::DescriptorSet; WeightFamily::COUNT],
    frame_sets: Vec<FrameSets>,
}

impl DescriptorBank {
    pub fn provision(
        ctx: &DeviceContext,
        registry: &OperatorRegistry,
        buffers: &DeviceBuffers,
        input_views: &[vk::ImageView],
        output_views: &[vk::ImageView],
    ) -> Result<Self> {
        let mut bank = Self {
            ctx: ctx.clone(),
            pool: vk::DescriptorPool::null(),
            weight_sets: [vk::DescriptorSet::null(); WeightFamily::COUNT],
            frame_sets: Vec::with_capacity(input_views.len()),
        };
        bank.fill(registry, buffers, input_views, output_views)?;
        Ok(bank)
    }

    fn fill(
        &mut self,
        registry: &OperatorRegistry,
        buffers: &DeviceBuffers,
        input_views: &[vk::ImageView],
        output_views: &[vk::ImageView],
    ) -> Result<()> {
        let frames = input_views.len();
        let sizes = pool_sizes(frames as u32);

        let descriptor_counts = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(sizes.storage_images),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(sizes.storage_buffers),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(sizes.dynamic_uniforms),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&descriptor_counts)
            .max_sets(sizes.max_sets);
        self.pool = vk_call("vkCreateDescriptorPool", unsafe {
            self.ctx.device().create_descriptor_pool(&pool_info, None)
        })?;

        let mut layouts = Vec::with_capacity(sizes.max_sets as usize);
        layouts.extend(std::iter::repeat_n(
            registry.weights_set_layout(),
            WeightFamily::COUNT,
        ));
        for _ in 0..frames {
            layouts.push(registry.image_set_layout());
            layouts.push(registry.image_set_layout());
            layouts.extend(std::iter::repeat_n(registry.buffer_set_layout(), Third::COUNT));
        }
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = vk_call("vkAllocateDescriptorSets", unsafe {
            self.ctx.device().allocate_descriptor_sets(&alloc_info)
        })?;

        self.weight_sets.copy_from_slice(&sets[..WeightFamily::COUNT]);
        self.frame_sets = sets[WeightFamily::COUNT..]
            .chunks_exact(FrameSets::SET_COUNT)
            .map(|chunk| FrameSets {
                input_image: chunk[0],
                output_image: chunk[1],
                thirds: [chunk[2], chunk[3], chunk[4]],
            })
            .collect();

        self.write_all(buffers, input_views, output_views);
        debug!("descriptor bank provisioned: {} sets written once", sets.len());
        Ok(())
    }

    /// One batched update covering every set. The weight sets window the
    /// family's block at its base offset; the dispatch-time dynamic offset
    /// slides that window to the direction's slice.
    fn write_all(
        &self,
        buffers: &DeviceBuffers,
        input_views: &[vk::ImageView],
        output_views: &[vk::ImageView],
    ) {
        let chunk = buffers.chunk();

        let mut buffer_infos =
            Vec::with_capacity(WeightFamily::COUNT + self.frame_sets.len() * Third::COUNT);
        for family in WeightFamily::ALL {
            buffer_infos.push(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffers.weight_buffer())
                    .offset(family.base_offset())
                    .range(family.block_len()),
            );
        }
        for frame in 0..self.frame_sets.len() {
            for third in Third::ALL {
                buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffers.tensor_buffer(frame))
                        .offset(third.offset(chunk))
                        .range(chunk),
                );
            }
        }

        let mut image_infos = Vec::with_capacity(2 * self.frame_sets.len());
        for (&input, &output) in input_views.iter().zip(output_views) {
            for view in [input, output] {
                image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::GENERAL),
                );
            }
        }

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
        for (family, info) in WeightFamily::ALL.iter().zip(&buffer_infos) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.weight_sets[family.index()])
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (frame, sets) in self.frame_sets.iter().enumerate() {
            for (slot, third) in Third::ALL.into_iter().enumerate() {
                let info = &buffer_infos[WeightFamily::COUNT + frame * Third::COUNT + slot];
                writes.push(
                    vk::WriteDescriptorSet::default()
                        .dst_set(sets.third(third))
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(info)),
                );
            }
            for (slot, role) in [ImageRole::Input, ImageRole::Output].into_iter().enumerate() {
                let info = &image_infos[2 * frame + slot];
                writes.push(
                    vk::WriteDescriptorSet::default()
                        .dst_set(sets.image_set(role))
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(std::slice::from_ref(info)),
                );
            }
        }

        unsafe {
            self.ctx.device().update_descriptor_sets(&writes, &[]);
        }
    }

    pub fn weight_set(&self, family: WeightFamily) -> vk::DescriptorSet {
        self.weight_sets[family.index()]
    }

    pub fn frame(&self, index: usize) -> &FrameSets {
        &self.frame_sets[index]
    }

    pub fn frames(&self) -> usize {
        self.frame_sets.len()
    }
}

impl Drop for DescriptorBank {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_descriptor_pool(self.pool, None);
        }
    }
}
