// SPDX-License-Identifier: CEPL-1.0
//! The per-tick driver tying the synchronizer, the swapchain and the recorder
//! together, plus startup and ordered teardown.

use ash::vk;
use ember_math::Mesh;
use tracing::{debug, info, warn};

use crate::config::RenderConfig;
use crate::error::RenderResult;
use crate::frame::{Acquired, FrameSynchronizer};
use crate::gpu::{Gpu, PresentOutcome};
use crate::ledger::{Ledger, Owned};
use crate::mesh::GeometryBuffer;
use crate::swapchain::{ExtentSource, SwapchainManager, SwapchainState};
use crate::upload::StagedUploader;

/// Framebuffer an acquired image renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub image_index: u32,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

/// Records the draw commands of one frame. Owns the render pass and
/// pipeline; the loop owns everything else.
pub trait FrameRecorder<G: Gpu> {
    fn render_pass(&self) -> vk::RenderPass;

    /// Called between begin and end of `cmd`.
    fn record(
        &mut self,
        gpu: &G,
        cmd: vk::CommandBuffer,
        target: &RenderTarget,
        geometry: &[GeometryBuffer],
    ) -> RenderResult<()>;

    /// Destroys pipeline objects. The device is idle when this runs.
    fn release(&mut self, gpu: &G);
}

/// What the windowing side observed since the previous tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickInput {
    pub framebuffer_extent: (u32, u32),
    /// Raised by a resize notification.
    pub surface_invalidated: bool,
}

impl TickInput {
    pub fn new(framebuffer_extent: (u32, u32)) -> Self {
        Self {
            framebuffer_extent,
            surface_invalidated: false,
        }
    }

    pub fn invalidated(mut self) -> Self {
        self.surface_invalidated = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Presented { image_index: u32 },
    /// The chain was rebuilt; true when a frame was still presented first.
    Recreated { presented: bool },
    /// Nothing to draw into (minimized).
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub presented: u64,
    pub recreated: u64,
    pub skipped: u64,
}

pub struct RenderLoop<'g, G: Gpu, R: FrameRecorder<G>> {
    gpu: &'g G,
    recorder: R,
    ledger: Ledger<'g, G>,
    swapchain: SwapchainManager,
    frames: FrameSynchronizer,
    geometry: Vec<GeometryBuffer>,
    stats: LoopStats,
    torn_down: bool,
}

impl<'g, G: Gpu, R: FrameRecorder<G>> RenderLoop<'g, G, R> {
    /// Uploads `meshes`, creates the frame slots and the first chain. On
    /// failure everything created so far, the recorder included, is released.
    pub fn new(
        gpu: &'g G,
        mut recorder: R,
        config: &RenderConfig,
        meshes: &[Mesh],
        initial_extent: (u32, u32),
    ) -> RenderResult<Self> {
        let mut ledger = Ledger::new(gpu);
        let built = Self::build(gpu, &recorder, config, meshes, initial_extent, &mut ledger);
        match built {
            Ok((swapchain, frames, geometry)) => {
                info!(
                    "render loop ready: {} frame(s) in flight, {} mesh(es)",
                    frames.slot_count(),
                    geometry.len()
                );
                Ok(Self {
                    gpu,
                    recorder,
                    ledger,
                    swapchain,
                    frames,
                    geometry,
                    stats: LoopStats::default(),
                    torn_down: false,
                })
            }
            Err(e) => {
                drop(ledger);
                recorder.release(gpu);
                Err(e)
            }
        }
    }

    fn build(
        gpu: &'g G,
        recorder: &R,
        config: &RenderConfig,
        meshes: &[Mesh],
        initial_extent: (u32, u32),
        ledger: &mut Ledger<'g, G>,
    ) -> RenderResult<(SwapchainManager, FrameSynchronizer, Vec<GeometryBuffer>)> {
        let config = config.clone().validated()?;
        let pool = gpu.create_command_pool()?;
        ledger.push(Owned::CommandPool(pool));

        let uploader = StagedUploader::new(gpu, pool, config.fence_timeout());
        let geometry = uploader.upload_meshes(meshes)?;
        for g in &geometry {
            g.register(ledger);
        }

        let frames = FrameSynchronizer::new(
            gpu,
            ledger,
            pool,
            config.frames_in_flight,
            config.fence_timeout(),
        )?;
        let swapchain = SwapchainManager::create(gpu, recorder.render_pass(), initial_extent)?;
        Ok((swapchain, frames, geometry))
    }

    pub fn frame_index(&self) -> usize {
        self.frames.frame_index()
    }

    pub fn frames(&self) -> &FrameSynchronizer {
        &self.frames
    }

    pub fn swapchain(&self) -> Option<&SwapchainState> {
        self.swapchain.current()
    }

    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain.generation()
    }

    pub fn geometry(&self) -> &[GeometryBuffer] {
        &self.geometry
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    fn recreate<E: ExtentSource + ?Sized>(&mut self, extents: &mut E) -> RenderResult<()> {
        self.swapchain
            .recreate(self.gpu, self.recorder.render_pass(), extents)?;
        self.stats.recreated += 1;
        Ok(())
    }

    /// One frame. Out-of-date and suboptimal results and a raised
    /// invalidation flag all end in one recreate.
    pub fn tick<E: ExtentSource + ?Sized>(
        &mut self,
        input: TickInput,
        extents: &mut E,
    ) -> RenderResult<TickOutcome> {
        self.stats.ticks += 1;
        if input.framebuffer_extent.0 == 0 || input.framebuffer_extent.1 == 0 {
            self.stats.skipped += 1;
            return Ok(TickOutcome::Skipped);
        }

        let state = self.swapchain.state()?;
        let chain = state.swapchain;

        let (image_index, cmd, acquire_suboptimal) = match self.frames.acquire(self.gpu, chain)? {
            Acquired::OutOfDate => {
                debug!("acquire reported out of date");
                self.recreate(extents)?;
                return Ok(TickOutcome::Recreated { presented: false });
            }
            Acquired::Image {
                image_index,
                command_buffer,
                suboptimal,
            } => (image_index, command_buffer, suboptimal),
        };

        let state = self.swapchain.state()?;
        let target = RenderTarget {
            image_index,
            framebuffer: state.framebuffers[image_index as usize],
            extent: state.extent,
        };
        self.gpu.begin_command_buffer(cmd, false)?;
        self.recorder
            .record(self.gpu, cmd, &target, &self.geometry)?;
        self.gpu.end_command_buffer(cmd)?;

        self.frames.submit(self.gpu)?;
        let presented = self.frames.present(self.gpu, chain, image_index)?;
        self.stats.presented += 1;

        if presented.wants_recreate() || acquire_suboptimal || input.surface_invalidated {
            debug!(
                "recreating: present {:?}, suboptimal acquire {}, invalidated {}",
                presented, acquire_suboptimal, input.surface_invalidated
            );
            self.recreate(extents)?;
            return Ok(TickOutcome::Recreated { presented: true });
        }
        debug_assert_eq!(presented, PresentOutcome::Presented);
        Ok(TickOutcome::Presented { image_index })
    }

    /// Device idle, chain, ledger (slots, geometry, pool), recorder.
    pub fn shutdown(mut self) -> RenderResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> RenderResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let idle = self.gpu.device_wait_idle();
        if let Err(e) = &idle {
            warn!("device idle before teardown failed: {e}");
        }
        self.swapchain.destroy(self.gpu);
        let released = self.ledger.release_all();
        self.geometry.clear();
        self.recorder.release(self.gpu);
        info!(
            "render loop torn down ({released} object(s), {} tick(s))",
            self.stats.ticks
        );
        idle
    }
}

impl<G: Gpu, R: FrameRecorder<G>> Drop for RenderLoop<'_, G, R> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
