//! The device context every component borrows: logical device, compute
//! queue, command pool, and memory properties, owned by the effect host.

use ash::vk;
use log::debug;

use crate::{Error, Result, vk_call};

/// Bounded wait for the construction-time synchronous submits. Expiry is
/// fatal; nothing in this crate waits on the GPU after construction.
const SETUP_FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Borrowed handles of the owning host. The context never creates or
/// destroys any of them; it is cloned into each component so no component
/// outlives a handle it records against.
#[derive(Clone)]
pub struct DeviceContext {
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Bundles the host's handles for injection into the engine.
    ///
    /// # Safety
    /// `device` must be a live logical device; `queue` must be a compute
    /// queue of family `queue_family_index` on that device; `command_pool`
    /// must allocate for that family; `memory_properties` must describe the
    /// physical device `device` was created from. All handles must outlive
    /// the engine and every command buffer it records into.
    pub unsafe fn new(
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        command_pool: vk::CommandPool,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        Self {
            device,
            queue,
            queue_family_index,
            command_pool,
            memory_properties,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Index of a memory type matching `type_bits` with all of `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_properties.memory_types[..self.memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(properties)
            })
            .map(|(index, _)| index as u32)
    }

    /// Records a one-shot command buffer, submits it, and blocks on a fence
    /// with a bounded timeout. The engine itself only submits this way during
    /// construction (weight upload, image relayout); per-frame recording
    /// never waits.
    pub fn submit_once<F>(&self, what: &'static str, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = vk_call("vkAllocateCommandBuffers", unsafe {
            self.device.allocate_command_buffers(&alloc_info)
        })?[0];

        let result = self.record_and_wait(command_buffer, what, record);
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }
        result
    }

    fn record_and_wait<F>(
        &self,
        command_buffer: vk::CommandBuffer,
        what: &'static str,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_call("vkBeginCommandBuffer", unsafe {
            self.device.begin_command_buffer(command_buffer, &begin_info)
        })?;
        record(command_buffer);
        vk_call("vkEndCommandBuffer", unsafe {
            self.device.end_command_buffer(command_buffer)
        })?;

        let fence = vk_call("vkCreateFence", unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        })?;
        let result = self.submit_and_wait(command_buffer, fence, what);
        unsafe { self.device.destroy_fence(fence, None) };
        result
    }

    fn submit_and_wait(
        &self,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        what: &'static str,
    ) -> Result<()> {
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        vk_call("vkQueueSubmit", unsafe {
            self.device.queue_submit(self.queue, &[submit_info], fence)
        })?;
        match unsafe {
            self.device
                .wait_for_fences(&[fence], true, SETUP_FENCE_TIMEOUT_NS)
        } {
            Ok(()) => {
                debug!("one-time {what} submitted and finished");
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => Err(Error::SetupTimeout { what }),
            Err(result) => Err(Error::Vulkan {
                call: "vkWaitForFences",
                result,
            }),
        }
    }
}
