//! Style Transfer CLI
//!
//! A command-line tool that runs the style-transfer network over a single
//! image with Vulkan compute. It stands in for the compositor or swapchain
//! layer a real host would provide: it creates a headless device, uploads
//! the image, records one frame of the effect, and reads the result back.
//!
//! # Usage
//! ```bash
//! stylize input.png output.png --weights style.bin
//! ```

use ash::vk;
use clap::Parser;
use std::path::PathBuf;
use styletransfer_vk::{DeviceContext, StyleTransferEffect, StyleTransferOptions};

/// Command-line arguments for the stylizer
#[derive(Parser)]
#[command(version, about = "CLI tool for stylizing images with Vulkan compute")]
struct Args {
    /// Input image file path
    input: PathBuf,

    /// Output image file path
    output: PathBuf,

    /// Network weight file (flat little-endian f32 tensors)
    #[arg(long, short)]
    weights: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    // Load input image
    println!("Loading image from: {}", args.input.display());
    let input_image = image::open(&args.input)?.to_rgba8();
    let (width, height) = input_image.dimensions();
    println!("Input image: {width}x{height}");

    // Bring up a compute-only device; no surface or swapchain is involved
    println!("Initializing GPU...");
    let gpu = Gpu::headless()?;
    println!("GPU initialized successfully");

    let extent = vk::Extent2D { width, height };
    let input = gpu.create_image(extent)?;
    let output = gpu.create_image(extent)?;

    // Construction compiles the pipelines, uploads the weights, and leaves
    // both images in the layout the per-frame recording expects
    println!(
        "Building style transfer effect from weights: {}",
        args.weights.display()
    );
    let options = StyleTransferOptions {
        weight_path: args.weights.clone(),
    };
    let effect = StyleTransferEffect::new(
        &gpu.ctx,
        vk::Format::R8G8B8A8_UNORM,
        extent,
        &[input.image],
        &[output.image],
        &options,
    )?;

    println!("Uploading image to GPU...");
    gpu.write_pixels(input.image, extent, input_image.as_raw())?;

    println!("Executing forward pass...");
    gpu.run_frame(&effect)?;

    println!("Saving result to: {}", args.output.display());
    let pixels = gpu.read_pixels(output.image, extent)?;
    let result = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or("readback returned fewer bytes than the image needs")?;
    result.save(&args.output)?;

    println!("Successfully stylized {width}x{height} image");

    drop(effect);
    gpu.destroy_image(input);
    gpu.destroy_image(output);
    Ok(())
}

/// Headless Vulkan state standing in for the host the effect normally
/// borrows from.
struct Gpu {
    ctx: DeviceContext,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    instance: ash::Instance,
    _entry: ash::Entry,
}

/// A bound image plus its dedicated allocation.
struct GpuImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl Gpu {
    /// Creates an instance and a single-queue compute device on the first
    /// physical device that offers a compute queue family.
    fn headless() -> Result<Self, Box<dyn std::error::Error>> {
        let entry = unsafe { ash::Entry::load()? };

        // The effect parks images in PRESENT_SRC_KHR, an enum owned by
        // VK_KHR_swapchain. Enable the extension pair where the platform
        // offers it so the barriers are valid under validation layers.
        let has_surface = unsafe { entry.enumerate_instance_extension_properties(None) }
            .unwrap_or_default()
            .iter()
            .any(|ext| {
                ext.extension_name_as_c_str()
                    .is_ok_and(|name| name == ash::khr::surface::NAME)
            });
        let mut instance_extensions = Vec::new();
        if has_surface {
            instance_extensions.push(ash::khr::surface::NAME.as_ptr());
        }

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let (physical, family) = unsafe { instance.enumerate_physical_devices()? }
            .into_iter()
            .find_map(|physical| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(physical) };
                families
                    .iter()
                    .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
                    .map(|index| (physical, index as u32))
            })
            .ok_or("no physical device with a compute queue")?;

        let has_swapchain = has_surface
            && unsafe { instance.enumerate_device_extension_properties(physical) }
                .unwrap_or_default()
                .iter()
                .any(|ext| {
                    ext.extension_name_as_c_str()
                        .is_ok_and(|name| name == ash::khr::swapchain::NAME)
                });
        let mut device_extensions = Vec::new();
        if has_swapchain {
            device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family)
            .queue_priorities(&priorities);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_extensions);
        let device = unsafe { instance.create_device(physical, &device_info, None)? };

        let queue = unsafe { device.get_device_queue(family, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical) };
        let ctx = unsafe {
            DeviceContext::new(
                device.clone(),
                queue,
                family,
                command_pool,
                memory_properties,
            )
        };

        Ok(Self {
            ctx,
            device,
            queue,
            command_pool,
            instance,
            _entry: entry,
        })
    }

    /// Creates an rgba8 image the effect can sample from and store to,
    /// with transfer usage for the upload and readback paths.
    fn create_image(&self, extent: vk::Extent2D) -> Result<GpuImage, Box<dyn std::error::Error>> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let type_index = self
            .ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .ok_or("no device-local memory type for images")?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None)? };
        unsafe { self.device.bind_image_memory(image, memory, 0)? };
        Ok(GpuImage { image, memory })
    }

    fn destroy_image(&self, image: GpuImage) {
        unsafe {
            self.device.destroy_image(image.image, None);
            self.device.free_memory(image.memory, None);
        }
    }

    /// Uploads tightly packed rgba8 pixels. The image must already be in
    /// `PRESENT_SRC_KHR` and is returned to it.
    fn write_pixels(
        &self,
        image: vk::Image,
        extent: vk::Extent2D,
        pixels: &[u8],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (buffer, memory) =
            self.host_buffer(pixels.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr.cast::<u8>(), pixels.len());
            self.device.unmap_memory(memory);
        }

        let region = copy_region(extent);
        self.ctx.submit_once("image upload", |command_buffer| unsafe {
            transition(
                &self.device,
                command_buffer,
                image,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            transition(
                &self.device,
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        })?;

        unsafe {
            self.device.destroy_buffer(buffer, None);
            self.device.free_memory(memory, None);
        }
        Ok(())
    }

    /// Reads the image back as tightly packed rgba8 pixels.
    fn read_pixels(
        &self,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let size = 4 * extent.width as u64 * extent.height as u64;
        let (buffer, memory) = self.host_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;

        let region = copy_region(extent);
        self.ctx
            .submit_once("image readback", |command_buffer| unsafe {
                transition(
                    &self.device,
                    command_buffer,
                    image,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                self.device.cmd_copy_image_to_buffer(
                    command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    buffer,
                    &[region],
                );
                transition(
                    &self.device,
                    command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                );
            })?;

        let mut pixels = vec![0u8; size as usize];
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), pixels.as_mut_ptr(), pixels.len());
            self.device.unmap_memory(memory);
            self.device.destroy_buffer(buffer, None);
            self.device.free_memory(memory, None);
        }
        Ok(pixels)
    }

    /// Records one frame of the effect and blocks until the queue drains.
    fn run_frame(&self, effect: &StyleTransferEffect) -> Result<(), Box<dyn std::error::Error>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };
        effect.record(0, command_buffer)?;
        unsafe { self.device.end_command_buffer(command_buffer)? };

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)?;
            self.device
                .free_command_buffers(self.command_pool, &command_buffers);
        }
        Ok(())
    }

    fn host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory), Box<dyn std::error::Error>> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let type_index = self
            .ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or("no host-visible memory type for staging")?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None)? };
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0)? };
        Ok((buffer, memory))
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn copy_region(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
}

unsafe fn transition(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
