//! The effect orchestrator: owns every GPU resource of one style-transfer
//! instance and records the forward pass into host command buffers.

use std::path::PathBuf;

use ash::vk;
use log::{debug, trace};

use crate::context::DeviceContext;
use crate::descriptors::{DescriptorBank, FrameSets};
use crate::memory::DeviceBuffers;
use crate::operators::OperatorRegistry;
use crate::plan::{Binding, Extent, Extents, Pass, PlanItem, forward_plan};
use crate::{Error, Result, vk_call};

/// Host configuration. The weight file is the single tunable; everything
/// else about the network is a compile-time constant.
#[derive(Clone, Debug)]
pub struct StyleTransferOptions {
    pub weight_path: PathBuf,
}

/// One effect instance bound to a fixed extent, format, and set of
/// per-frame image pairs.
///
/// Construction validates and uploads the weights, builds all pipelines,
/// provisions every descriptor, and leaves each image in
/// `PRESENT_SRC_KHR`. Afterwards the only per-frame work is [`record`],
/// which appends commands and never waits on the device.
///
/// Field order is teardown order: sets, buffers, views, then pipelines.
/// The caller must fence out any submitted command buffer recorded through
/// this instance before dropping it.
///
/// [`record`]: StyleTransferEffect::record
pub struct StyleTransferEffect {
    descriptors: DescriptorBank,
    buffers: DeviceBuffers,
    input_views: ImageViews,
    output_views: ImageViews,
    registry: OperatorRegistry,
    ctx: DeviceContext,
    plan: Vec<PlanItem>,
    input_images: Vec<vk::Image>,
    output_images: Vec<vk::Image>,
}

impl StyleTransferEffect {
    /// Builds the effect over the host's images. `input_images` and
    /// `output_images` are parallel per frame in flight; both arrays are
    /// relayouted to `PRESENT_SRC_KHR` here so the first [`record`] sees
    /// the same image state as every later one.
    ///
    /// [`record`]: StyleTransferEffect::record
    pub fn new(
        ctx: &DeviceContext,
        format: vk::Format,
        extent: vk::Extent2D,
        input_images: &[vk::Image],
        output_images: &[vk::Image],
        options: &StyleTransferOptions,
    ) -> Result<Self> {
        assert_eq!(
            input_images.len(),
            output_images.len(),
            "one output image per input image"
        );
        assert!(!input_images.is_empty(), "at least one frame in flight");
        let frames = input_images.len() as u32;
        let extents = Extents::new(Extent::new(extent.width, extent.height));

        let buffers = DeviceBuffers::allocate(ctx, &options.weight_path, extents.high, frames)?;
        let registry = OperatorRegistry::create(ctx)?;
        let input_views = ImageViews::create(ctx, input_images, format)?;
        let output_views = ImageViews::create(ctx, output_images, format)?;
        let descriptors = DescriptorBank::provision(
            ctx,
            &registry,
            &buffers,
            &input_views.views,
            &output_views.views,
        )?;

        let effect = Self {
            descriptors,
            buffers,
            input_views,
            output_views,
            registry,
            ctx: ctx.clone(),
            plan: forward_plan(&extents),
            input_images: input_images.to_vec(),
            output_images: output_images.to_vec(),
        };
        effect.relayout_images()?;
        debug!(
            "style transfer effect ready: {}x{} at {frames} frames in flight",
            extent.width, extent.height
        );
        Ok(effect)
    }

    /// Moves every borrowed image from its freshly-created undefined state
    /// to `PRESENT_SRC_KHR`, synchronously, so per-frame transitions always
    /// start from a known layout.
    fn relayout_images(&self) -> Result<()> {
        let barriers: Vec<vk::ImageMemoryBarrier> = self
            .input_images
            .iter()
            .chain(&self.output_images)
            .map(|&image| {
                image_barrier(
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::empty(),
                )
            })
            .collect();
        self.ctx
            .submit_once("image relayout", |command_buffer| unsafe {
                self.ctx.device().cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                );
            })
    }

    /// Appends the full forward pass for `frame_index` to a command buffer
    /// already in the recording state. The caller owns submission and must
    /// not interleave recording calls on the same command buffer.
    ///
    /// Both images are expected in `PRESENT_SRC_KHR` and are returned to it
    /// by the final batched barrier.
    pub fn record(&self, frame_index: u32, command_buffer: vk::CommandBuffer) -> Result<()> {
        let frames = self.descriptors.frames() as u32;
        if frame_index >= frames {
            return Err(Error::FrameIndexOutOfRange {
                index: frame_index,
                frames,
            });
        }
        let index = frame_index as usize;
        let frame = self.descriptors.frame(index);
        let device = self.ctx.device();
        trace!("recording forward pass for frame {frame_index}");

        let entry = [
            image_barrier(
                self.input_images[index],
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::SHADER_READ,
            ),
            image_barrier(
                self.output_images[index],
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::SHADER_WRITE,
            ),
        ];
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &entry,
            );
        }

        // One conservative whole-buffer barrier between dependent
        // dispatches; the thirds never alias within a pass, so write
        // availability is all that must be ordered.
        let scratch_barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffers.tensor_buffer(index))
            .offset(0)
            .size(vk::WHOLE_SIZE);

        for item in &self.plan {
            match item {
                PlanItem::Barrier => unsafe {
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        std::slice::from_ref(&scratch_barrier),
                        &[],
                    );
                },
                PlanItem::Pass(pass) => self.record_pass(command_buffer, frame, pass),
            }
        }

        let exit = [
            image_barrier(
                self.input_images[index],
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::empty(),
            ),
            image_barrier(
                self.output_images[index],
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::empty(),
            ),
        ];
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &exit,
            );
        }
        Ok(())
    }

    fn record_pass(&self, command_buffer: vk::CommandBuffer, frame: &FrameSets, pass: &Pass) {
        let device = self.ctx.device();
        let layout = self.registry.pipeline_layout(pass.op);
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.registry.pipeline(pass.op),
            );
            match pass.binding {
                Binding::ImageTensor { image, tensor } => {
                    let sets = [frame.image_set(image), frame.third(tensor)];
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        vk::PipelineBindPoint::COMPUTE,
                        layout,
                        0,
                        &sets,
                        &[],
                    );
                }
                Binding::TensorPair { src, dst, weights } => {
                    let sets = [
                        frame.third(src),
                        frame.third(dst),
                        self.descriptors.weight_set(weights.family),
                    ];
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        vk::PipelineBindPoint::COMPUTE,
                        layout,
                        0,
                        &sets,
                        &[weights.dynamic_offset],
                    );
                }
            }
            device.cmd_push_constants(
                command_buffer,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&pass.push),
            );
            device.cmd_dispatch(command_buffer, pass.groups[0], pass.groups[1], pass.groups[2]);
        }
    }

    /// Frames in flight this instance was built for.
    pub fn frames(&self) -> u32 {
        self.descriptors.frames() as u32
    }
}

struct ImageViews {
    ctx: DeviceContext,
    views: Vec<vk::ImageView>,
}

impl ImageViews {
    fn create(ctx: &DeviceContext, images: &[vk::Image], format: vk::Format) -> Result<Self> {
        let mut this = Self {
            ctx: ctx.clone(),
            views: Vec::with_capacity(images.len()),
        };
        for &image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(color_range());
            this.views.push(vk_call("vkCreateImageView", unsafe {
                ctx.device().create_image_view(&view_info, None)
            })?);
        }
        Ok(this)
    }
}

impl Drop for ImageViews {
    fn drop(&mut self) {
        for view in self.views.drain(..) {
            unsafe {
                self.ctx.device().destroy_image_view(view, None);
            }
        }
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range())
}
