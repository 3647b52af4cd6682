// SPDX-License-Identifier: CEPL-1.0
//! Creation ledger.
//!
//! Long-lived children of the device are pushed here as they are created and
//! released by popping, so teardown always runs in reverse creation order.
//! Whatever is still recorded when the ledger drops is released then.

use ash::vk;
use tracing::debug;

use crate::gpu::{BufferAllocation, Gpu};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owned {
    CommandPool(vk::CommandPool),
    CommandBuffers(vk::CommandPool, Vec<vk::CommandBuffer>),
    Buffer(BufferAllocation),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

impl Owned {
    pub fn kind(&self) -> &'static str {
        match self {
            Owned::CommandPool(_) => "command pool",
            Owned::CommandBuffers(..) => "command buffers",
            Owned::Buffer(_) => "buffer",
            Owned::Semaphore(_) => "semaphore",
            Owned::Fence(_) => "fence",
        }
    }

    fn release<G: Gpu>(self, gpu: &G) {
        match self {
            Owned::CommandPool(pool) => gpu.destroy_command_pool(pool),
            Owned::CommandBuffers(pool, bufs) => gpu.free_command_buffers(pool, &bufs),
            Owned::Buffer(alloc) => gpu.destroy_buffer(alloc),
            Owned::Semaphore(s) => gpu.destroy_semaphore(s),
            Owned::Fence(f) => gpu.destroy_fence(f),
        }
    }
}

pub struct Ledger<'g, G: Gpu> {
    gpu: &'g G,
    entries: Vec<Owned>,
}

impl<'g, G: Gpu> Ledger<'g, G> {
    pub fn new(gpu: &'g G) -> Self {
        Self {
            gpu,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, owned: Owned) {
        debug!("ledger: +{} (#{})", owned.kind(), self.entries.len());
        self.entries.push(owned);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Owned] {
        &self.entries
    }

    /// Pops and releases everything, newest first. The caller must have
    /// idled the device.
    pub fn release_all(&mut self) -> usize {
        let n = self.entries.len();
        while let Some(owned) = self.entries.pop() {
            debug!("ledger: -{}", owned.kind());
            owned.release(self.gpu);
        }
        n
    }
}

impl<G: Gpu> Drop for Ledger<'_, G> {
    fn drop(&mut self) {
        self.release_all();
    }
}
