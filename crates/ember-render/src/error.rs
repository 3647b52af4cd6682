// SPDX-License-Identifier: CEPL-1.0
//! Error taxonomy for the frame engine.
//!
//! Out-of-date and suboptimal presentation are not errors; they are reported
//! through [`crate::gpu::AcquireOutcome`] and [`crate::gpu::PresentOutcome`].

use std::time::Duration;

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    // --- setup ---
    #[error("failed to load Vulkan loader: {0}")]
    Loader(String),

    #[error("instance creation failed: {0}")]
    InstanceCreation(String),

    #[error("surface creation failed: {0}")]
    SurfaceCreation(String),

    #[error("no suitable GPU found: {0}")]
    NoSuitableDevice(String),

    #[error("logical device creation failed: {0}")]
    DeviceCreation(String),

    #[error("surface reports no usable {0}")]
    SurfaceUnsupported(&'static str),

    #[error("swapchain creation failed: {0}")]
    SwapchainCreation(String),

    #[error("shader error: {0}")]
    Shader(String),

    #[error("pipeline creation failed: {0}")]
    Pipeline(String),

    #[error("invalid config: {0}")]
    Config(String),

    // --- transfer ---
    #[error("upload source for {0} is empty")]
    InvalidUploadSize(String),

    #[error("transfer batch did not complete within {0:?}")]
    TransferTimeout(Duration),

    #[error("no memory type matches bits {type_bits:#x} with {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    // --- runtime ---
    #[error("in-flight fence not signaled within {0:?}")]
    FenceTimeout(Duration),

    #[error("frame slot {slot} is {actual}, expected {expected}")]
    InvalidFrameState {
        slot: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

impl RenderError {
    /// Setup failures abort startup and are never retried.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            RenderError::Loader(_)
                | RenderError::InstanceCreation(_)
                | RenderError::SurfaceCreation(_)
                | RenderError::NoSuitableDevice(_)
                | RenderError::DeviceCreation(_)
                | RenderError::SurfaceUnsupported(_)
                | RenderError::SwapchainCreation(_)
                | RenderError::Shader(_)
                | RenderError::Pipeline(_)
                | RenderError::Config(_)
        )
    }

    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            RenderError::InvalidUploadSize(_)
                | RenderError::TransferTimeout(_)
                | RenderError::NoSuitableMemoryType { .. }
        )
    }
}
