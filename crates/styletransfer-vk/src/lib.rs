//! Style-transfer inference as Vulkan compute, for post-process effect chains
//!
//! This crate runs a small convolutional encoder/decoder network entirely on
//! the GPU: thirteen compute dispatches recorded into a caller-supplied
//! command buffer, with the network parameters uploaded once from a flat
//! weight file at construction. It carries no machine-learning runtime; every
//! stage is a precompiled compute pipeline and the host side only computes
//! layouts, writes descriptors, and records the fixed dispatch sequence.
//!
//! The owning host keeps the instance, device, queue, swapchain, and frame
//! pacing; see [`DeviceContext`] for what is borrowed and
//! [`StyleTransferEffect::record`] for the per-frame contract.

mod context;
mod descriptors;
mod effect;
mod memory;
mod operators;
pub mod plan;
mod shaders;

pub use context::DeviceContext;
pub use effect::{StyleTransferEffect, StyleTransferOptions};

use std::path::PathBuf;

use ash::vk;

/// Failures surfaced during construction or frame recording. Everything here
/// is fatal to the effect instance; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
    #[error("could not read weight file {path}: {source}")]
    WeightIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("weight file {path} holds {actual} bytes, expected exactly {expected}")]
    WeightLength {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("no memory type with the required properties covers the engine's buffers")]
    NoCompatibleMemory,
    #[error("device did not finish the one-time {what} within the bounded wait")]
    SetupTimeout { what: &'static str },
    #[error("frame index {index} outside the {frames} configured frames in flight")]
    FrameIndexOutOfRange { index: u32, frames: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn vk_call<T>(call: &'static str, result: ash::prelude::VkResult<T>) -> Result<T> {
    result.map_err(|result| Error::Vulkan { call, result })
}
