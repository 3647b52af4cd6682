// SPDX-License-Identifier: CEPL-1.0
//! Swapchain lifecycle: selection policy, create, destroy, recreate.

use ash::vk;
use tracing::{debug, info};

use crate::error::{RenderError, RenderResult};
use crate::gpu::{Gpu, ImageSharing, SurfaceSupport, SwapchainDesc};

/// Where the current framebuffer size comes from while a chain is rebuilt.
pub trait ExtentSource {
    fn framebuffer_extent(&mut self) -> (u32, u32);
    /// Blocks until the windowing system delivers at least one event.
    fn wait_events(&mut self);
}

// Info only
fn format_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        _ => "OTHER",
    }
}

fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// First 8-bit BGRA sRGB with a non-linear sRGB color space, else the first
/// entry. `None` only for an empty list.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// IMMEDIATE when offered, else the first mode.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> Option<vk::PresentModeKHR> {
    modes
        .iter()
        .copied()
        .find(|&m| m == vk::PresentModeKHR::IMMEDIATE)
        .or_else(|| modes.first().copied())
}

/// A `current_extent` of `u32::MAX` means the window decides; the hint is
/// then clamped per axis.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, hint: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: hint
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: hint
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 == unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

pub fn choose_sharing(graphics: u32, present: u32) -> ImageSharing {
    if graphics == present {
        ImageSharing::Exclusive
    } else {
        ImageSharing::Concurrent([graphics, present])
    }
}

/// Resolves the full creation parameters for a surface.
pub fn describe(
    support: &SurfaceSupport,
    graphics: u32,
    present: u32,
    hint: (u32, u32),
) -> RenderResult<SwapchainDesc> {
    let format =
        choose_surface_format(&support.formats).ok_or(RenderError::SurfaceUnsupported("formats"))?;
    let present_mode = choose_present_mode(&support.present_modes)
        .ok_or(RenderError::SurfaceUnsupported("present modes"))?;
    let caps = &support.capabilities;
    Ok(SwapchainDesc {
        min_image_count: choose_image_count(caps),
        format,
        present_mode,
        extent: choose_extent(caps, hint),
        pre_transform: caps.current_transform,
        sharing: choose_sharing(graphics, present),
    })
}

/// A live chain with its per-image views and framebuffers.
#[derive(Debug)]
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl SwapchainState {
    pub fn create<G: Gpu>(
        gpu: &G,
        render_pass: vk::RenderPass,
        hint: (u32, u32),
    ) -> RenderResult<Self> {
        let families = gpu.queue_families();
        let support = gpu
            .surface_support()
            .map_err(|e| RenderError::SwapchainCreation(format!("surface query: {e}")))?;
        let desc = describe(&support, families.graphics, families.present, hint)?;

        let swapchain = gpu
            .create_swapchain(&desc)
            .map_err(|e| RenderError::SwapchainCreation(e.to_string()))?;
        // From here on a partially built state cleans up after itself.
        let mut state = SwapchainState {
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            format: desc.format,
            present_mode: desc.present_mode,
            extent: desc.extent,
        };
        if let Err(e) = state.populate(gpu, render_pass) {
            state.destroy(gpu);
            return Err(RenderError::SwapchainCreation(e.to_string()));
        }

        info!(
            "swapchain: format {} / {:?}, present mode {}, extent {}x{}, {} image(s)",
            format_name(state.format.format),
            state.format.color_space,
            present_mode_name(state.present_mode),
            state.extent.width,
            state.extent.height,
            state.images.len()
        );
        Ok(state)
    }

    fn populate<G: Gpu>(&mut self, gpu: &G, render_pass: vk::RenderPass) -> RenderResult<()> {
        self.images = gpu.swapchain_images(self.swapchain)?;
        for &image in &self.images {
            self.views
                .push(gpu.create_image_view(image, self.format.format)?);
        }
        for &view in &self.views {
            self.framebuffers
                .push(gpu.create_framebuffer(render_pass, view, self.extent)?);
        }
        Ok(())
    }

    /// Framebuffers, then views, then the chain.
    pub fn destroy<G: Gpu>(mut self, gpu: &G) {
        for fb in self.framebuffers.drain(..) {
            gpu.destroy_framebuffer(fb);
        }
        for view in self.views.drain(..) {
            gpu.destroy_image_view(view);
        }
        gpu.destroy_swapchain(self.swapchain);
        debug!("swapchain destroyed");
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn extent_tuple(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }
}

/// Owns the current chain; `create`, `recreate` and `destroy` are its only
/// mutators.
#[derive(Debug, Default)]
pub struct SwapchainManager {
    current: Option<SwapchainState>,
    generation: u64,
}

impl SwapchainManager {
    pub fn create<G: Gpu>(
        gpu: &G,
        render_pass: vk::RenderPass,
        hint: (u32, u32),
    ) -> RenderResult<Self> {
        Ok(Self {
            current: Some(SwapchainState::create(gpu, render_pass, hint)?),
            generation: 1,
        })
    }

    pub fn current(&self) -> Option<&SwapchainState> {
        self.current.as_ref()
    }

    /// Live chain, or an error when a failed recreate left none.
    pub fn state(&self) -> RenderResult<&SwapchainState> {
        self.current
            .as_ref()
            .ok_or_else(|| RenderError::SwapchainCreation("no live swapchain".into()))
    }

    /// Number of chains created so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits out a minimized window, idles the device and rebuilds the chain
    /// at the freshly polled extent. Safe to call repeatedly.
    pub fn recreate<G: Gpu, E: ExtentSource + ?Sized>(
        &mut self,
        gpu: &G,
        render_pass: vk::RenderPass,
        extents: &mut E,
    ) -> RenderResult<()> {
        let mut extent = extents.framebuffer_extent();
        while extent.0 == 0 || extent.1 == 0 {
            debug!("framebuffer is {}x{}; waiting for events", extent.0, extent.1);
            extents.wait_events();
            extent = extents.framebuffer_extent();
        }

        gpu.device_wait_idle()?;
        if let Some(old) = self.current.take() {
            old.destroy(gpu);
        }
        self.current = Some(SwapchainState::create(gpu, render_pass, extent)?);
        self.generation += 1;
        Ok(())
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &G) {
        if let Some(state) = self.current.take() {
            state.destroy(gpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        }
    }

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn undefined_extent_clamps_hint_per_axis() {
        let c = caps((u32::MAX, u32::MAX), (100, 100), (800, 800));
        let e = choose_extent(&c, (1000, 10));
        assert_eq!((e.width, e.height), (800, 100));
    }

    #[test]
    fn defined_extent_is_used_verbatim() {
        let c = caps((1280, 720), (100, 100), (800, 800));
        let e = choose_extent(&c, (10, 10));
        assert_eq!((e.width, e.height), (1280, 720));
    }

    #[test]
    fn srgb_bgra_preferred_else_first() {
        let linear = fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::PASS_THROUGH_EXT);
        let srgb = fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let picked = choose_surface_format(&[linear, srgb]).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(picked.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let picked = choose_surface_format(&[linear]).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn immediate_preferred_else_first() {
        use vk::PresentModeKHR as M;
        assert_eq!(choose_present_mode(&[M::FIFO, M::IMMEDIATE]), Some(M::IMMEDIATE));
        assert_eq!(choose_present_mode(&[M::MAILBOX, M::FIFO]), Some(M::MAILBOX));
        assert_eq!(choose_present_mode(&[]), None);
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 3);
    }

    #[test]
    fn sharing_is_concurrent_only_across_families() {
        assert_eq!(choose_sharing(0, 0), ImageSharing::Exclusive);
        assert_eq!(choose_sharing(0, 2), ImageSharing::Concurrent([0, 2]));
    }

    #[test]
    fn empty_support_is_unsupported() {
        let support = SurfaceSupport {
            capabilities: caps((640, 480), (1, 1), (4096, 4096)),
            formats: vec![fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![],
        };
        assert!(matches!(
            describe(&support, 0, 0, (640, 480)),
            Err(RenderError::SurfaceUnsupported("present modes"))
        ));
    }
}
