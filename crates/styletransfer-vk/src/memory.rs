//! Device storage: the packed weight blob and one scratch buffer per frame
//! in flight, bound into a single device-local allocation. Construction
//! validates and uploads the weight file before any frame can be recorded.

use std::fs;
use std::path::Path;

use ash::vk;
use log::debug;

use crate::context::DeviceContext;
use crate::plan::{
    Extent, WEIGHT_BUFFER_LEN, WEIGHT_FILE_LEN, WEIGHT_SLICES, align_up, chunk_len, scratch_len,
};
use crate::{Error, Result, vk_call};

pub struct DeviceBuffers {
    ctx: DeviceContext,
    weight_buffer: vk::Buffer,
    tensor_buffers: Vec<vk::Buffer>,
    memory: vk::DeviceMemory,
    chunk: u64,
}

impl DeviceBuffers {
    /// Reads and validates the weight file, creates and binds every buffer,
    /// and scatters the weights to their aligned device offsets. The file is
    /// checked before any device resource exists; a wrong-sized file leaves
    /// nothing to clean up.
    pub fn allocate(
        ctx: &DeviceContext,
        weight_path: &Path,
        high: Extent,
        frames: u32,
    ) -> Result<Self> {
        let weights = fs::read(weight_path).map_err(|source| Error::WeightIo {
            path: weight_path.to_owned(),
            source,
        })?;
        if weights.len() as u64 != WEIGHT_FILE_LEN {
            return Err(Error::WeightLength {
                path: weight_path.to_owned(),
                expected: WEIGHT_FILE_LEN,
                actual: weights.len() as u64,
            });
        }
        debug!(
            "weight file {} verified at {WEIGHT_FILE_LEN} bytes",
            weight_path.display()
        );

        let mut buffers = Self {
            ctx: ctx.clone(),
            weight_buffer: vk::Buffer::null(),
            tensor_buffers: Vec::with_capacity(frames as usize),
            memory: vk::DeviceMemory::null(),
            chunk: chunk_len(high),
        };
        buffers.bind_all(high, frames)?;
        buffers.upload_weights(&weights)?;
        Ok(buffers)
    }

    fn bind_all(&mut self, high: Extent, frames: u32) -> Result<()> {
        self.weight_buffer = self.raw_buffer(
            WEIGHT_BUFFER_LEN,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        for _ in 0..frames {
            let buffer = self.raw_buffer(scratch_len(high), vk::BufferUsageFlags::STORAGE_BUFFER)?;
            self.tensor_buffers.push(buffer);
        }

        let requirements: Vec<vk::MemoryRequirements> = self
            .all_buffers()
            .map(|buffer| unsafe { self.ctx.device().get_buffer_memory_requirements(buffer) })
            .collect();
        let packing = pack(&requirements);
        let type_index = self
            .ctx
            .find_memory_type(packing.type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or(Error::NoCompatibleMemory)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(packing.total)
            .memory_type_index(type_index);
        self.memory = vk_call("vkAllocateMemory", unsafe {
            self.ctx.device().allocate_memory(&alloc_info, None)
        })?;

        for (buffer, &offset) in self.all_buffers().zip(&packing.offsets) {
            vk_call("vkBindBufferMemory", unsafe {
                self.ctx
                    .device()
                    .bind_buffer_memory(buffer, self.memory, offset)
            })?;
        }
        debug!(
            "device buffers bound: {} bytes across {} buffers in one allocation",
            packing.total,
            1 + frames
        );
        Ok(())
    }

    fn all_buffers(&self) -> impl Iterator<Item = vk::Buffer> + '_ {
        std::iter::once(self.weight_buffer).chain(self.tensor_buffers.iter().copied())
    }

    fn raw_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        vk_call("vkCreateBuffer", unsafe {
            self.ctx.device().create_buffer(&buffer_info, None)
        })
    }

    /// Copies each tightly packed file slice to its aligned device offset
    /// through a host-visible staging buffer, synchronously.
    fn upload_weights(&self, bytes: &[u8]) -> Result<()> {
        let staging = StagingBuffer::filled(&self.ctx, bytes)?;
        let regions: Vec<vk::BufferCopy> = WEIGHT_SLICES
            .iter()
            .map(|slice| {
                vk::BufferCopy::default()
                    .src_offset(slice.file_offset)
                    .dst_offset(slice.offset)
                    .size(slice.len())
            })
            .collect();
        self.ctx.submit_once("weight upload", |command_buffer| unsafe {
            self.ctx.device().cmd_copy_buffer(
                command_buffer,
                staging.buffer,
                self.weight_buffer,
                &regions,
            );
        })
    }

    pub fn weight_buffer(&self) -> vk::Buffer {
        self.weight_buffer
    }

    pub fn tensor_buffer(&self, frame: usize) -> vk::Buffer {
        self.tensor_buffers[frame]
    }

    /// Byte size of one scratch third of every frame's tensor buffer.
    pub fn chunk(&self) -> u64 {
        self.chunk
    }
}

impl Drop for DeviceBuffers {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for buffer in self.tensor_buffers.drain(..) {
                device.destroy_buffer(buffer, None);
            }
            device.destroy_buffer(self.weight_buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

struct Packing {
    offsets: Vec<u64>,
    total: u64,
    type_bits: u32,
}

/// Lays consecutive buffers into one allocation, respecting each buffer's
/// own alignment, and intersects their admissible memory types.
fn pack(requirements: &[vk::MemoryRequirements]) -> Packing {
    let mut offsets = Vec::with_capacity(requirements.len());
    let mut total = 0;
    let mut type_bits = u32::MAX;
    for requirement in requirements {
        let offset = align_up(total, requirement.alignment);
        offsets.push(offset);
        total = offset + requirement.size;
        type_bits &= requirement.memory_type_bits;
    }
    Packing {
        offsets,
        total,
        type_bits,
    }
}

/// Host-visible upload source, torn down once the copy's fence signals.
struct StagingBuffer {
    ctx: DeviceContext,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl StagingBuffer {
    fn filled(ctx: &DeviceContext, bytes: &[u8]) -> Result<Self> {
        let mut staging = Self {
            ctx: ctx.clone(),
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(bytes.len() as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        staging.buffer = vk_call("vkCreateBuffer", unsafe {
            ctx.device().create_buffer(&buffer_info, None)
        })?;

        let requirements = unsafe { ctx.device().get_buffer_memory_requirements(staging.buffer) };
        let type_index = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or(Error::NoCompatibleMemory)?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        staging.memory = vk_call("vkAllocateMemory", unsafe {
            ctx.device().allocate_memory(&alloc_info, None)
        })?;
        vk_call("vkBindBufferMemory", unsafe {
            ctx.device()
                .bind_buffer_memory(staging.buffer, staging.memory, 0)
        })?;

        let ptr = vk_call("vkMapMemory", unsafe {
            ctx.device().map_memory(
                staging.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        })?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            ctx.device().unmap_memory(staging.memory);
        }
        Ok(staging)
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_buffer(self.buffer, None);
            self.ctx.device().free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(size: u64, alignment: u64, memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        }
    }

    #[test]
    fn packing_respects_each_alignment() {
        let packing = pack(&[
            requirement(100, 16, 0b0111),
            requirement(30, 64, 0b0110),
            requirement(4096, 256, 0b1110),
        ]);
        assert_eq!(packing.offsets, [0, 128, 256]);
        assert_eq!(packing.total, 256 + 4096);
        assert_eq!(packing.type_bits, 0b0110);
    }

    #[test]
    fn packing_never_overlaps() {
        let sizes = [(13, 4), (257, 256), (1, 1), (300, 128)];
        let requirements: Vec<_> = sizes
            .iter()
            .map(|&(size, alignment)| requirement(size, alignment, u32::MAX))
            .collect();
        let packing = pack(&requirements);
        for (i, (&offset, &(size, alignment))) in
            packing.offsets.iter().zip(&sizes).enumerate()
        {
            assert_eq!(offset % alignment, 0);
            if let Some(&next) = packing.offsets.get(i + 1) {
                assert!(offset + size <= next);
            }
        }
    }
}
