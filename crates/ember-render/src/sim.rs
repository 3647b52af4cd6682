// SPDX-License-Identifier: CEPL-1.0
//! Timeline simulator backend.
//!
//! `SimGpu` implements [`Gpu`] without a driver. Submissions queue up on a
//! simulated GPU timeline and only complete when the host waits on a fence
//! (or idles the device), which makes the number of outstanding submissions
//! observable. Misuse that a real driver would flag through validation
//! (resetting a command buffer still in flight, signaling a semaphore twice,
//! destroying an object the GPU still references) is recorded as a violation
//! instead of crashing.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use ash::vk::{self, Handle};
use tracing::{debug, trace};

use crate::device::{AdapterSource, QueueFamilyIndices};
use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    AcquireOutcome, BufferAllocation, FenceStatus, Gpu, PresentOutcome, QueueRole, Submission,
    SurfaceSupport, SwapchainDesc,
};
use crate::mesh::GeometryBuffer;
use crate::render_loop::{FrameRecorder, RenderTarget};
use crate::swapchain::ExtentSource;

/// A window-managed surface: the app picks the extent within 1..=4096.
pub fn default_surface() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub submissions: u64,
    pub acquires: u64,
    pub presents: u64,
    pub draws: u64,
    pub buffers_created: u64,
    pub swapchains_created: u64,
    pub wait_idles: u64,
    /// Highest number of submissions pending on the timeline at once.
    pub max_outstanding: usize,
}

#[derive(Debug)]
struct SimCommandBuffer {
    pool: u64,
    recording: bool,
    copies: Vec<(u64, u64, usize)>,
    in_flight: usize,
}

#[derive(Debug)]
struct SimBuffer {
    memory: u64,
    bytes: Vec<u8>,
    flags: vk::MemoryPropertyFlags,
}

#[derive(Debug)]
struct SimSwapchain {
    desc: SwapchainDesc,
    images: Vec<vk::Image>,
    next_image: u32,
    out_of_date: bool,
}

#[derive(Debug)]
struct Pending {
    command_buffer: u64,
    fence: Option<u64>,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u64,
    families: QueueFamilyIndices,
    surface: SurfaceSupport,

    semaphores: HashMap<u64, bool>,
    fences: HashMap<u64, bool>,
    pools: HashSet<u64>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    buffers: HashMap<u64, SimBuffer>,
    swapchains: HashMap<u64, SimSwapchain>,
    views: HashSet<u64>,
    framebuffers: HashSet<u64>,
    render_passes: HashSet<u64>,

    timeline: VecDeque<Pending>,
    stalled: bool,
    fail_buffers_after: Option<u64>,
    forced_acquire: VecDeque<AcquireOutcome>,
    forced_present: VecDeque<PresentOutcome>,
    swapchain_history: Vec<SwapchainDesc>,

    stats: SimStats,
    violations: Vec<String>,
    destroy_log: Vec<u64>,
}

impl SimState {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, msg: String) {
        debug!("sim violation: {msg}");
        self.violations.push(msg);
    }

    fn complete_front(&mut self) {
        let Some(done) = self.timeline.pop_front() else {
            return;
        };
        let copies = match self.command_buffers.get_mut(&done.command_buffer) {
            Some(cb) => {
                cb.in_flight = cb.in_flight.saturating_sub(1);
                cb.copies.clone()
            }
            None => Vec::new(),
        };
        for (src, dst, size) in copies {
            let data = self
                .buffers
                .get(&src)
                .map(|b| b.bytes[..size.min(b.bytes.len())].to_vec());
            let copied = match (data, self.buffers.get_mut(&dst)) {
                (Some(data), Some(dst)) => {
                    let n = data.len().min(dst.bytes.len());
                    dst.bytes[..n].copy_from_slice(&data[..n]);
                    true
                }
                _ => false,
            };
            if !copied {
                self.violation(format!("copy {src:#x} -> {dst:#x} on a dead buffer"));
            }
        }
        if let Some(f) = done.fence {
            self.fences.insert(f, true);
        }
        trace!("sim: completed cmd {:#x}", done.command_buffer);
    }

    /// Completes submissions in order up to the last one signaling `fence`.
    fn complete_through(&mut self, fence: u64) -> bool {
        let Some(last) = self.timeline.iter().rposition(|p| p.fence == Some(fence)) else {
            return false;
        };
        for _ in 0..=last {
            self.complete_front();
        }
        true
    }

    fn drain(&mut self) {
        while !self.timeline.is_empty() {
            self.complete_front();
        }
    }

    fn cmd_in_flight(&self, cmd: u64) -> bool {
        self.command_buffers
            .get(&cmd)
            .is_some_and(|cb| cb.in_flight > 0)
    }

    fn buffer_in_flight(&self, buffer: u64) -> bool {
        self.timeline.iter().any(|p| {
            self.command_buffers
                .get(&p.command_buffer)
                .is_some_and(|cb| cb.copies.iter().any(|&(s, d, _)| s == buffer || d == buffer))
        })
    }

    fn fence_in_flight(&self, fence: u64) -> bool {
        self.timeline.iter().any(|p| p.fence == Some(fence))
    }

    fn forget(&mut self, what: &str, raw: u64, removed: bool) {
        if removed {
            self.destroy_log.push(raw);
        } else {
            self.violation(format!("destroy of unknown {what} {raw:#x}"));
        }
    }

    fn free_command_buffer(&mut self, raw: u64) {
        if self.cmd_in_flight(raw) {
            self.violation(format!("command buffer {raw:#x} freed while in flight"));
        }
        let removed = self.command_buffers.remove(&raw).is_some();
        self.forget("command buffer", raw, removed);
    }
}

/// Simulated device. See the module docs.
#[derive(Debug)]
pub struct SimGpu {
    state: RefCell<SimState>,
}

impl Default for SimGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGpu {
    pub fn new() -> Self {
        Self::with_surface(default_surface())
    }

    pub fn with_surface(surface: SurfaceSupport) -> Self {
        SimGpu {
            state: RefCell::new(SimState {
                surface,
                ..SimState::default()
            }),
        }
    }

    pub fn with_families(self, graphics: u32, present: u32) -> Self {
        self.state.borrow_mut().families = QueueFamilyIndices { graphics, present };
        self
    }

    // --- scripting ---

    /// While stalled, bounded fence waits time out. Device idle still drains.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.borrow_mut().stalled = stalled;
    }

    /// Buffer creation fails once `n` buffers have been created in total.
    pub fn fail_buffer_creation_after(&self, n: u64) {
        self.state.borrow_mut().fail_buffers_after = Some(n);
    }

    pub fn force_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().forced_acquire.push_back(outcome);
    }

    pub fn force_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().forced_present.push_back(outcome);
    }

    /// Marks every live chain out of date, as a resize would.
    pub fn invalidate_surface(&self) {
        for sc in self.state.borrow_mut().swapchains.values_mut() {
            sc.out_of_date = true;
        }
    }

    pub fn set_surface(&self, surface: SurfaceSupport) {
        self.state.borrow_mut().surface = surface;
    }

    // --- inspection ---

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }

    pub fn reset_stats(&self) {
        self.state.borrow_mut().stats = SimStats::default();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Raw handles in the order they were destroyed or freed.
    pub fn destroy_log(&self) -> Vec<u64> {
        self.state.borrow().destroy_log.clone()
    }

    pub fn outstanding(&self) -> usize {
        self.state.borrow().timeline.len()
    }

    pub fn swapchain_history(&self) -> Vec<SwapchainDesc> {
        self.state.borrow().swapchain_history.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    /// Every object still alive, by kind. Empty after a clean teardown.
    pub fn leaks(&self) -> Vec<String> {
        let s = self.state.borrow();
        [
            ("semaphore", s.semaphores.len()),
            ("fence", s.fences.len()),
            ("command pool", s.pools.len()),
            ("command buffer", s.command_buffers.len()),
            ("buffer", s.buffers.len()),
            ("swapchain", s.swapchains.len()),
            ("image view", s.views.len()),
            ("framebuffer", s.framebuffers.len()),
            ("render pass", s.render_passes.len()),
        ]
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(kind, n)| format!("{n} {kind}(s)"))
        .collect()
    }

    // --- objects outside the device seam ---

    pub fn create_render_pass(&self) -> vk::RenderPass {
        let mut s = self.state.borrow_mut();
        let raw = s.mint();
        s.render_passes.insert(raw);
        vk::RenderPass::from_raw(raw)
    }

    pub fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut s = self.state.borrow_mut();
        let raw = render_pass.as_raw();
        let removed = s.render_passes.remove(&raw);
        s.forget("render pass", raw, removed);
    }

    pub fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, _index_count: u32) {
        let mut s = self.state.borrow_mut();
        let recording = s
            .command_buffers
            .get(&cmd.as_raw())
            .is_some_and(|cb| cb.recording);
        if !recording {
            s.violation(format!("draw into {:#x} outside recording", cmd.as_raw()));
        }
        s.stats.draws += 1;
    }
}

impl Gpu for SimGpu {
    fn queue_families(&self) -> QueueFamilyIndices {
        self.state.borrow().families
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut s = self.state.borrow_mut();
        let raw = s.mint();
        s.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.state.borrow_mut();
        let raw = semaphore.as_raw();
        let removed = s.semaphores.remove(&raw).is_some();
        s.forget("semaphore", raw, removed);
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut s = self.state.borrow_mut();
        let raw = s.mint();
        s.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.state.borrow_mut();
        let raw = fence.as_raw();
        if s.fence_in_flight(raw) {
            s.violation(format!("fence {raw:#x} destroyed while pending"));
        }
        let removed = s.fences.remove(&raw).is_some();
        s.forget("fence", raw, removed);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: Duration) -> RenderResult<FenceStatus> {
        let mut s = self.state.borrow_mut();
        for fence in fences {
            let raw = fence.as_raw();
            match s.fences.get(&raw).copied() {
                None => {
                    s.violation(format!("wait on unknown fence {raw:#x}"));
                    return Err(RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
                }
                Some(true) => continue,
                Some(false) => {}
            }
            // Unsignaled and never submitted: a real wait would run into the timeout.
            if s.stalled || !s.complete_through(raw) {
                return Ok(FenceStatus::TimedOut);
            }
        }
        Ok(FenceStatus::Signaled)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        for fence in fences {
            let raw = fence.as_raw();
            if s.fence_in_flight(raw) {
                s.violation(format!("fence {raw:#x} reset while pending"));
            }
            s.fences.insert(raw, false);
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        s.drain();
        s.stats.wait_idles += 1;
        Ok(())
    }

    fn create_command_pool(&self) -> RenderResult<vk::CommandPool> {
        let mut s = self.state.borrow_mut();
        let raw = s.mint();
        s.pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut s = self.state.borrow_mut();
        let raw = pool.as_raw();
        let owned: Vec<u64> = s
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == raw)
            .map(|(&k, _)| k)
            .collect();
        for cmd in owned {
            s.free_command_buffer(cmd);
        }
        let removed = s.pools.remove(&raw);
        s.forget("command pool", raw, removed);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let mut s = self.state.borrow_mut();
        if !s.pools.contains(&pool.as_raw()) {
            return Err(RenderError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok((0..count)
            .map(|_| {
                let raw = s.mint();
                s.command_buffers.insert(
                    raw,
                    SimCommandBuffer {
                        pool: pool.as_raw(),
                        recording: false,
                        copies: Vec::new(),
                        in_flight: 0,
                    },
                );
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut s = self.state.borrow_mut();
        for cmd in buffers {
            s.free_command_buffer(cmd.as_raw());
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        let raw = cmd.as_raw();
        if s.cmd_in_flight(raw) {
            s.violation(format!("command buffer {raw:#x} reset while in flight"));
        }
        if let Some(cb) = s.command_buffers.get_mut(&raw) {
            cb.recording = false;
            cb.copies.clear();
        }
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time: bool) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        let raw = cmd.as_raw();
        if s.cmd_in_flight(raw) {
            s.violation(format!("command buffer {raw:#x} re-recorded while in flight"));
        }
        let cb = s
            .command_buffers
            .get_mut(&raw)
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        cb.recording = true;
        cb.copies.clear();
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        let cb = s
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        cb.recording = false;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let mut s = self.state.borrow_mut();
        let raw = cmd.as_raw();
        let recording = s
            .command_buffers
            .get(&raw)
            .is_some_and(|cb| cb.recording);
        if !recording {
            s.violation(format!("copy recorded into {raw:#x} outside recording"));
            return;
        }
        if let Some(cb) = s.command_buffers.get_mut(&raw) {
            cb.copies.push((src.as_raw(), dst.as_raw(), size as usize));
        }
    }

    fn submit(&self, queue: QueueRole, submission: &Submission) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        let cmd = submission.command_buffer.as_raw();
        if s.cmd_in_flight(cmd) {
            s.violation(format!("command buffer {cmd:#x} submitted while in flight"));
        }
        if let Some((sem, _stage)) = submission.wait {
            let raw = sem.as_raw();
            if s.semaphores.get(&raw) != Some(&true) {
                s.violation(format!("submit waits on unsignaled semaphore {raw:#x}"));
            }
            s.semaphores.insert(raw, false);
        }
        if let Some(sem) = submission.signal {
            let raw = sem.as_raw();
            if s.semaphores.get(&raw) == Some(&true) {
                s.violation(format!("semaphore {raw:#x} signaled twice"));
            }
            s.semaphores.insert(raw, true);
        }
        if let Some(fence) = submission.fence {
            let raw = fence.as_raw();
            if s.fences.get(&raw) != Some(&false) {
                s.violation(format!("submit with fence {raw:#x} not reset"));
            }
        }
        match s.command_buffers.get_mut(&cmd) {
            Some(cb) => cb.in_flight += 1,
            None => return Err(RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
        }
        s.timeline.push_back(Pending {
            command_buffer: cmd,
            fence: submission.fence.map(|f| f.as_raw()),
        });
        s.stats.submissions += 1;
        s.stats.max_outstanding = s.stats.max_outstanding.max(s.timeline.len());
        trace!("sim: submit {cmd:#x} on {queue:?}, {} pending", s.timeline.len());
        Ok(())
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> RenderResult<BufferAllocation> {
        let mut s = self.state.borrow_mut();
        if s.fail_buffers_after.is_some_and(|n| s.stats.buffers_created >= n) {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let buffer = s.mint();
        let mem = s.mint();
        s.buffers.insert(
            buffer,
            SimBuffer {
                memory: mem,
                bytes: vec![0; size as usize],
                flags: memory,
            },
        );
        s.stats.buffers_created += 1;
        Ok(BufferAllocation {
            buffer: vk::Buffer::from_raw(buffer),
            memory: vk::DeviceMemory::from_raw(mem),
            size,
        })
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) {
        let mut s = self.state.borrow_mut();
        let raw = allocation.buffer.as_raw();
        if s.buffer_in_flight(raw) {
            s.violation(format!("buffer {raw:#x} destroyed while a copy is pending"));
        }
        match s.buffers.remove(&raw) {
            Some(b) if b.memory != allocation.memory.as_raw() => {
                s.violation(format!("buffer {raw:#x} freed with foreign memory"));
                s.destroy_log.push(raw);
            }
            Some(_) => s.destroy_log.push(raw),
            None => s.forget("buffer", raw, false),
        }
    }

    fn write_mapped(&self, allocation: &BufferAllocation, bytes: &[u8]) -> RenderResult<()> {
        let mut s = self.state.borrow_mut();
        let b = s
            .buffers
            .get_mut(&allocation.buffer.as_raw())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if !b.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) || bytes.len() > b.bytes.len() {
            return Err(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        b.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_mapped(&self, allocation: &BufferAllocation, len: usize) -> RenderResult<Vec<u8>> {
        let s = self.state.borrow();
        let b = s
            .buffers
            .get(&allocation.buffer.as_raw())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if !b.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) || len > b.bytes.len() {
            return Err(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        Ok(b.bytes[..len].to_vec())
    }

    fn surface_support(&self) -> RenderResult<SurfaceSupport> {
        Ok(self.state.borrow().surface.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let mut s = self.state.borrow_mut();
        let raw = s.mint();
        let images = (0..desc.min_image_count)
            .map(|_| vk::Image::from_raw(s.mint()))
            .collect();
        s.swapchains.insert(
            raw,
            SimSwapchain {
                desc: *desc,
                images,
                next_image: 0,
                out_of_date: false,
            },
        );
        s.swapchain_history.push(*desc);
        s.stats.swapchains_created += 1;
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.state.borrow_mut();
        let raw = swapchain.as_raw();
        let removed = s.swapchains.remove(&raw).is_some();
        s.forget("swapchain", raw, removed);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.images.clone())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView> {
        let mut s = self.state.borrow_mut();
        let owner_format = s
            .swapchains
            .values()
            .find(|sc| sc.images.contains(&image))
            .map(|sc| sc.desc.format.format);
        if owner_format != Some(format) {
            s.violation(format!("view of {:#x} with format {format:?}", image.as_raw()));
        }
        let raw = s.mint();
        s.views.insert(raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut s = self.state.borrow_mut();
        let raw = view.as_raw();
        let removed = s.views.remove(&raw);
        s.forget("image view", raw, removed);
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer> {
        let mut s = self.state.borrow_mut();
        if !s.render_passes.contains(&render_pass.as_raw()) || !s.views.contains(&view.as_raw()) {
            return Err(RenderError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let raw = s.mint();
        s.framebuffers.insert(raw);
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut s = self.state.borrow_mut();
        let raw = framebuffer.as_raw();
        let removed = s.framebuffers.remove(&raw);
        s.forget("framebuffer", raw, removed);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout: Duration,
    ) -> RenderResult<AcquireOutcome> {
        let mut s = self.state.borrow_mut();
        s.stats.acquires += 1;
        let forced = s.forced_acquire.pop_front();
        let sc = s
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))?;

        let outcome = match forced {
            Some(o) => o,
            None if sc.out_of_date => AcquireOutcome::OutOfDate,
            None => {
                let image_index = sc.next_image;
                sc.next_image = (sc.next_image + 1) % sc.images.len().max(1) as u32;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }
        };
        if let AcquireOutcome::Acquired { .. } = outcome {
            let raw = signal.as_raw();
            if s.semaphores.get(&raw) == Some(&true) {
                s.violation(format!("acquire signals busy semaphore {raw:#x}"));
            }
            s.semaphores.insert(raw, true);
        }
        Ok(outcome)
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let mut s = self.state.borrow_mut();
        let raw = wait.as_raw();
        if s.semaphores.get(&raw) != Some(&true) {
            s.violation(format!("present waits on unsignaled semaphore {raw:#x}"));
        }
        s.semaphores.insert(raw, false);
        s.stats.presents += 1;

        let forced = s.forced_present.pop_front();
        let sc = s
            .swapchains
            .get(&swapchain.as_raw())
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))?;
        if image_index as usize >= sc.images.len() {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        Ok(match forced {
            Some(o) => o,
            None if sc.out_of_date => PresentOutcome::OutOfDate,
            None => PresentOutcome::Presented,
        })
    }
}

/// Recorder for the simulator: one indexed draw per mesh.
#[derive(Debug)]
pub struct SimRecorder {
    render_pass: vk::RenderPass,
    /// Image index of every recorded frame, in order.
    pub recorded: Vec<u32>,
}

impl SimRecorder {
    pub fn new(gpu: &SimGpu) -> Self {
        Self {
            render_pass: gpu.create_render_pass(),
            recorded: Vec::new(),
        }
    }
}

impl FrameRecorder<SimGpu> for SimRecorder {
    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    fn record(
        &mut self,
        gpu: &SimGpu,
        cmd: vk::CommandBuffer,
        target: &RenderTarget,
        geometry: &[GeometryBuffer],
    ) -> RenderResult<()> {
        for g in geometry {
            gpu.cmd_draw_indexed(cmd, g.index_count);
        }
        self.recorded.push(target.image_index);
        Ok(())
    }

    fn release(&mut self, gpu: &SimGpu) {
        if self.render_pass != vk::RenderPass::null() {
            gpu.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
        }
    }
}

/// Extent source that never changes.
#[derive(Clone, Copy, Debug)]
pub struct FixedExtent(pub (u32, u32));

impl ExtentSource for FixedExtent {
    fn framebuffer_extent(&mut self) -> (u32, u32) {
        self.0
    }

    fn wait_events(&mut self) {}
}

/// Replays a fixed sequence of polled extents; the last one repeats.
#[derive(Debug)]
pub struct ScriptedExtents<'a> {
    script: VecDeque<(u32, u32)>,
    last: (u32, u32),
    gpu: Option<&'a SimGpu>,
    pub polls: usize,
    pub waits: usize,
    /// Chains created so far, sampled at every poll when observing a device.
    pub swapchains_at_poll: Vec<u64>,
}

impl<'a> ScriptedExtents<'a> {
    pub fn new(script: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: (0, 0),
            gpu: None,
            polls: 0,
            waits: 0,
            swapchains_at_poll: Vec::new(),
        }
    }

    pub fn observing(gpu: &'a SimGpu, script: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            gpu: Some(gpu),
            ..Self::new(script)
        }
    }
}

impl ExtentSource for ScriptedExtents<'_> {
    fn framebuffer_extent(&mut self) -> (u32, u32) {
        self.polls += 1;
        if let Some(gpu) = self.gpu {
            self.swapchains_at_poll.push(gpu.stats().swapchains_created);
        }
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last
    }

    fn wait_events(&mut self) {
        self.waits += 1;
    }
}

/// Adapter description for [`SimAdapters`].
#[derive(Clone, Debug)]
pub struct SimAdapter {
    pub name: String,
    pub graphics: Vec<bool>,
    pub present: Vec<bool>,
    pub extensions: Vec<String>,
    pub surface: SurfaceSupport,
}

impl SimAdapter {
    /// One family doing graphics and present, swapchain extension, default surface.
    pub fn capable(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            graphics: vec![true],
            present: vec![true],
            extensions: vec![crate::config::SWAPCHAIN_EXTENSION.to_owned()],
            surface: default_surface(),
        }
    }

    pub fn with_graphics(mut self, graphics: Vec<bool>) -> Self {
        self.graphics = graphics;
        self
    }

    pub fn with_present(mut self, present: Vec<bool>) -> Self {
        self.present = present;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct SimAdapters {
    adapters: Vec<SimAdapter>,
}

impl SimAdapters {
    pub fn new(adapters: Vec<SimAdapter>) -> Self {
        Self { adapters }
    }
}

impl AdapterSource for SimAdapters {
    type Adapter = usize;

    fn adapters(&self) -> RenderResult<Vec<usize>> {
        Ok((0..self.adapters.len()).collect())
    }

    fn adapter_name(&self, adapter: usize) -> String {
        self.adapters[adapter].name.clone()
    }

    fn graphics_families(&self, adapter: usize) -> Vec<bool> {
        self.adapters[adapter].graphics.clone()
    }

    fn supports_present(&self, adapter: usize, family: u32) -> RenderResult<bool> {
        Ok(self.adapters[adapter]
            .present
            .get(family as usize)
            .copied()
            .unwrap_or(false))
    }

    fn extensions(&self, adapter: usize) -> RenderResult<Vec<String>> {
        Ok(self.adapters[adapter].extensions.clone())
    }

    fn surface_support(&self, adapter: usize) -> RenderResult<SurfaceSupport> {
        Ok(self.adapters[adapter].surface.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wait_completes_timeline_in_order() {
        let gpu = SimGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let cmds = gpu.allocate_command_buffers(pool, 2).unwrap();
        let fences = [gpu.create_fence(false).unwrap(), gpu.create_fence(false).unwrap()];
        for (cmd, fence) in cmds.iter().zip(fences) {
            gpu.begin_command_buffer(*cmd, true).unwrap();
            gpu.end_command_buffer(*cmd).unwrap();
            let sub = Submission {
                fence: Some(fence),
                ..Submission::commands(*cmd)
            };
            gpu.submit(QueueRole::Graphics, &sub).unwrap();
        }
        assert_eq!(gpu.outstanding(), 2);
        // waiting on the second fence retires the first submission too
        let status = gpu.wait_for_fences(&fences[1..], Duration::ZERO).unwrap();
        assert_eq!(status, FenceStatus::Signaled);
        assert_eq!(gpu.outstanding(), 0);
        assert_eq!(gpu.stats().max_outstanding, 2);
    }

    #[test]
    fn stalled_timeline_times_out() {
        let gpu = SimGpu::new();
        let fence = gpu.create_fence(false).unwrap();
        gpu.set_stalled(true);
        assert_eq!(
            gpu.wait_for_fences(&[fence], Duration::ZERO).unwrap(),
            FenceStatus::TimedOut
        );
    }

    #[test]
    fn resetting_in_flight_command_buffer_is_flagged() {
        let gpu = SimGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let cmd = gpu.allocate_command_buffers(pool, 1).unwrap()[0];
        gpu.begin_command_buffer(cmd, false).unwrap();
        gpu.end_command_buffer(cmd).unwrap();
        gpu.submit(QueueRole::Graphics, &Submission::commands(cmd)).unwrap();
        gpu.reset_command_buffer(cmd).unwrap();
        assert_eq!(gpu.violations().len(), 1);
        gpu.device_wait_idle().unwrap();
        gpu.destroy_command_pool(pool);
        assert!(gpu.leaks().is_empty());
    }
}
