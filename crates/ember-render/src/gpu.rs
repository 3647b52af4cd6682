// SPDX-License-Identifier: CEPL-1.0
//! The device seam.
//!
//! Everything the frame engine asks of the GPU goes through [`Gpu`]. Handles
//! are plain `ash::vk` handles: the Vulkan backend passes them straight to the
//! driver, the timeline simulator in [`crate::sim`] mints its own.
//!
//! Methods take `&self`; implementations are driven from a single host thread.

use std::time::Duration;

use ash::vk;

use crate::device::QueueFamilyIndices;
use crate::error::RenderResult;

/// A buffer together with the memory bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

/// Everything a surface reports about itself for one adapter.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    /// Graphics and present family indices, in that order.
    Concurrent([u32; 2]),
}

/// Fully resolved swapchain parameters handed to the backend.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing: ImageSharing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Present,
}

/// One command buffer submission with at most one wait and one signal.
#[derive(Clone, Copy, Debug)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

impl Submission {
    pub fn commands(command_buffer: vk::CommandBuffer) -> Self {
        Submission {
            command_buffer,
            wait: None,
            signal: None,
            fence: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn wants_recreate(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

pub trait Gpu {
    fn queue_families(&self) -> QueueFamilyIndices;

    // --- synchronization ---
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Waits until all `fences` are signaled or `timeout` expires.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RenderResult<FenceStatus>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RenderResult<()>;
    fn device_wait_idle(&self) -> RenderResult<()>;

    // --- commands ---
    fn create_command_pool(&self) -> RenderResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> RenderResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );
    fn submit(&self, queue: QueueRole, submission: &Submission) -> RenderResult<()>;

    // --- memory ---
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> RenderResult<BufferAllocation>;
    fn destroy_buffer(&self, allocation: BufferAllocation);
    /// Map, copy `bytes` to offset 0, unmap. Memory must be host-visible.
    fn write_mapped(&self, allocation: &BufferAllocation, bytes: &[u8]) -> RenderResult<()>;
    /// Map, copy `len` bytes from offset 0, unmap. Memory must be host-visible.
    fn read_mapped(&self, allocation: &BufferAllocation, len: usize) -> RenderResult<Vec<u8>>;

    // --- presentation ---
    fn surface_support(&self) -> RenderResult<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> RenderResult<AcquireOutcome>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome>;
}

/// Nanoseconds for a fence/acquire timeout, saturating at `u64::MAX`.
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
