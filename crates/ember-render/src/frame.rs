// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! Each slot cycles `Idle -> Acquiring -> Recording -> Submitted ->
//! Presenting -> Idle`. A slot's command buffer and image-available semaphore
//! are only touched again after its in-flight fence was observed signaled,
//! which caps outstanding GPU work at the number of slots.

use std::fmt;
use std::time::Duration;

use ash::vk;
use tracing::{debug, trace};

use crate::error::{RenderError, RenderResult};
use crate::gpu::{AcquireOutcome, FenceStatus, Gpu, PresentOutcome, QueueRole, Submission};
use crate::ledger::{Ledger, Owned};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Acquiring => "acquiring",
            SlotState::Recording => "recording",
            SlotState::Submitted => "submitted",
            SlotState::Presenting => "presenting",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_done: vk::Semaphore,
    /// Created signaled so the first wait returns at once.
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    state: SlotState,
}

impl FrameSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Result of [`FrameSynchronizer::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image {
        image_index: u32,
        command_buffer: vk::CommandBuffer,
        suboptimal: bool,
    },
    /// The chain must be rebuilt; the tick is abandoned.
    OutOfDate,
}

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    frame_index: usize,
    fence_timeout: Duration,
}

impl FrameSynchronizer {
    /// Creates `count` slots, registering every object with `ledger`.
    pub fn new<G: Gpu>(
        gpu: &G,
        ledger: &mut Ledger<'_, G>,
        pool: vk::CommandPool,
        count: usize,
        fence_timeout: Duration,
    ) -> RenderResult<Self> {
        if count == 0 {
            return Err(RenderError::Config(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        let command_buffers = gpu.allocate_command_buffers(pool, count as u32)?;
        ledger.push(Owned::CommandBuffers(pool, command_buffers.clone()));

        let mut slots = Vec::with_capacity(count);
        for command_buffer in command_buffers {
            let image_available = gpu.create_semaphore()?;
            ledger.push(Owned::Semaphore(image_available));
            let render_done = gpu.create_semaphore()?;
            ledger.push(Owned::Semaphore(render_done));
            let in_flight = gpu.create_fence(true)?;
            ledger.push(Owned::Fence(in_flight));

            slots.push(FrameSlot {
                image_available,
                render_done,
                in_flight,
                command_buffer,
                state: SlotState::Idle,
            });
        }
        debug!("{count} frame slot(s) ready");
        Ok(Self {
            slots,
            frame_index: 0,
            fence_timeout,
        })
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.frame_index]
    }

    fn transition(&mut self, from: SlotState, to: SlotState) -> RenderResult<&FrameSlot> {
        let slot = self.frame_index;
        let s = &mut self.slots[slot];
        if s.state != from {
            return Err(RenderError::InvalidFrameState {
                slot,
                expected: from.name(),
                actual: s.state.name(),
            });
        }
        trace!("slot {slot}: {} -> {}", s.state, to);
        s.state = to;
        Ok(s)
    }

    /// Steps 1-3: fence wait, image acquisition and command buffer reset.
    pub fn acquire<G: Gpu>(
        &mut self,
        gpu: &G,
        swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Acquired> {
        let timeout = self.fence_timeout;
        let slot = self.transition(SlotState::Idle, SlotState::Acquiring)?;
        let (fence, image_available, cmd) =
            (slot.in_flight, slot.image_available, slot.command_buffer);

        let outcome = gpu
            .wait_for_fences(&[fence], timeout)
            .and_then(|status| match status {
                FenceStatus::Signaled => Ok(()),
                FenceStatus::TimedOut => Err(RenderError::FenceTimeout(timeout)),
            })
            .and_then(|()| gpu.acquire_next_image(swapchain, image_available, timeout));
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.slots[self.frame_index].state = SlotState::Idle;
                return Err(e);
            }
        };

        match outcome {
            AcquireOutcome::OutOfDate => {
                self.transition(SlotState::Acquiring, SlotState::Idle)?;
                Ok(Acquired::OutOfDate)
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                gpu.reset_command_buffer(cmd)?;
                self.transition(SlotState::Acquiring, SlotState::Recording)?;
                Ok(Acquired::Image {
                    image_index,
                    command_buffer: cmd,
                    suboptimal,
                })
            }
        }
    }

    /// Step 4: fence reset, then submit on the graphics queue.
    pub fn submit<G: Gpu>(&mut self, gpu: &G) -> RenderResult<()> {
        let slot = self.transition(SlotState::Recording, SlotState::Submitted)?;
        let submission = Submission {
            command_buffer: slot.command_buffer,
            wait: Some((
                slot.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )),
            signal: Some(slot.render_done),
            fence: Some(slot.in_flight),
        };
        gpu.reset_fences(&[slot.in_flight])?;
        gpu.submit(QueueRole::Graphics, &submission)
    }

    /// Steps 5-6: present, return the slot to idle and advance the frame.
    pub fn present<G: Gpu>(
        &mut self,
        gpu: &G,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> RenderResult<PresentOutcome> {
        let render_done = self
            .transition(SlotState::Submitted, SlotState::Presenting)?
            .render_done;
        let outcome = gpu.queue_present(swapchain, image_index, render_done);
        self.transition(SlotState::Presenting, SlotState::Idle)?;
        self.frame_index = (self.frame_index + 1) % self.slots.len();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpu;

    #[test]
    fn submit_before_acquire_is_rejected() {
        let gpu = SimGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let mut ledger = Ledger::new(&gpu);
        ledger.push(Owned::CommandPool(pool));
        let mut frames =
            FrameSynchronizer::new(&gpu, &mut ledger, pool, 2, Duration::from_secs(1)).unwrap();

        let err = frames.submit(&gpu).unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidFrameState { slot: 0, expected: "recording", actual: "idle" }
        ));
        assert_eq!(frames.current().state(), SlotState::Idle);
    }

    #[test]
    fn zero_slots_rejected() {
        let gpu = SimGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let mut ledger = Ledger::new(&gpu);
        ledger.push(Owned::CommandPool(pool));
        let err = FrameSynchronizer::new(&gpu, &mut ledger, pool, 0, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, RenderError::Config(_)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn slots_register_with_ledger() {
        let gpu = SimGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let mut ledger = Ledger::new(&gpu);
        ledger.push(Owned::CommandPool(pool));
        let frames =
            FrameSynchronizer::new(&gpu, &mut ledger, pool, 3, Duration::from_secs(1)).unwrap();
        assert_eq!(frames.slot_count(), 3);
        // pool + command buffers + 3 objects per slot
        assert_eq!(ledger.len(), 2 + 3 * 3);
        drop(ledger);
        assert!(gpu.leaks().is_empty());
    }
}
