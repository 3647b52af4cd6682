// SPDX-License-Identifier: CEPL-1.0
//! Staged uploads: host bytes -> host-visible staging -> device-local buffer.
//!
//! A batch records one copy per source, submits each on the graphics queue
//! with its own fence and only then waits on all of them at once. Either every
//! destination comes back valid or none does.

use std::time::Duration;

use ash::vk;
use ember_math::Mesh;
use tracing::{debug, info, warn};

use crate::error::{RenderError, RenderResult};
use crate::gpu::{BufferAllocation, FenceStatus, Gpu, QueueRole, Submission};
use crate::mesh::GeometryBuffer;

const STAGING_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    Vertex,
    Index,
}

impl BufferRole {
    pub fn usage(self) -> vk::BufferUsageFlags {
        let role = match self {
            BufferRole::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferRole::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        };
        // TRANSFER_SRC keeps `read_back` possible on any uploaded buffer.
        role | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UploadSource<'a> {
    pub label: &'a str,
    pub bytes: &'a [u8],
    pub role: BufferRole,
}

impl<'a> UploadSource<'a> {
    pub fn vertex(label: &'a str, bytes: &'a [u8]) -> Self {
        Self { label, bytes, role: BufferRole::Vertex }
    }

    pub fn index(label: &'a str, bytes: &'a [u8]) -> Self {
        Self { label, bytes, role: BufferRole::Index }
    }
}

/// Everything one batch has created so far. Dropping it releases all of it;
/// [`TransferBatch::finish`] pulls the destinations out first.
struct TransferBatch<'g, G: Gpu> {
    gpu: &'g G,
    pool: vk::CommandPool,
    staging: Vec<BufferAllocation>,
    destinations: Vec<BufferAllocation>,
    command_buffers: Vec<vk::CommandBuffer>,
    fences: Vec<vk::Fence>,
    /// Set once anything was submitted and cleared when all fences signaled.
    in_flight: bool,
}

impl<'g, G: Gpu> TransferBatch<'g, G> {
    fn new(gpu: &'g G, pool: vk::CommandPool, capacity: usize) -> Self {
        Self {
            gpu,
            pool,
            staging: Vec::with_capacity(capacity),
            destinations: Vec::with_capacity(capacity),
            command_buffers: Vec::with_capacity(capacity),
            fences: Vec::with_capacity(capacity),
            in_flight: false,
        }
    }

    fn stage(&mut self, bytes: &[u8]) -> RenderResult<BufferAllocation> {
        let staging = self.gpu.create_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            STAGING_MEMORY,
        )?;
        self.staging.push(staging);
        self.gpu.write_mapped(&staging, bytes)?;
        Ok(staging)
    }

    fn copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RenderResult<()> {
        let cmd = self
            .gpu
            .allocate_command_buffers(self.pool, 1)?
            .into_iter()
            .next()
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;
        self.command_buffers.push(cmd);
        self.gpu.begin_command_buffer(cmd, true)?;
        self.gpu.cmd_copy_buffer(cmd, src, dst, size);
        self.gpu.end_command_buffer(cmd)?;

        let fence = self.gpu.create_fence(false)?;
        self.fences.push(fence);
        let submission = Submission {
            fence: Some(fence),
            ..Submission::commands(cmd)
        };
        self.gpu.submit(QueueRole::Graphics, &submission)?;
        self.in_flight = true;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> RenderResult<()> {
        if self.fences.is_empty() {
            return Ok(());
        }
        match self.gpu.wait_for_fences(&self.fences, timeout)? {
            FenceStatus::Signaled => {
                self.in_flight = false;
                Ok(())
            }
            FenceStatus::TimedOut => Err(RenderError::TransferTimeout(timeout)),
        }
    }

    fn finish(mut self) -> Vec<BufferAllocation> {
        std::mem::take(&mut self.destinations)
    }
}

impl<G: Gpu> Drop for TransferBatch<'_, G> {
    fn drop(&mut self) {
        if self.in_flight {
            // Copies may still reference these buffers.
            if let Err(e) = self.gpu.device_wait_idle() {
                warn!("device idle before transfer cleanup failed: {e}");
            }
        }
        if !self.command_buffers.is_empty() {
            self.gpu.free_command_buffers(self.pool, &self.command_buffers);
        }
        for fence in self.fences.drain(..) {
            self.gpu.destroy_fence(fence);
        }
        for staging in self.staging.drain(..) {
            self.gpu.destroy_buffer(staging);
        }
        if !self.destinations.is_empty() {
            debug!("discarding {} destination buffer(s)", self.destinations.len());
        }
        for dst in self.destinations.drain(..) {
            self.gpu.destroy_buffer(dst);
        }
    }
}

pub struct StagedUploader<'g, G: Gpu> {
    gpu: &'g G,
    pool: vk::CommandPool,
    timeout: Duration,
}

impl<'g, G: Gpu> StagedUploader<'g, G> {
    /// `pool` must belong to the graphics family and stay alive while the
    /// uploader is used.
    pub fn new(gpu: &'g G, pool: vk::CommandPool, timeout: Duration) -> Self {
        Self { gpu, pool, timeout }
    }

    /// Uploads every source as one unit and returns the device-local buffers
    /// in source order. Ownership of those passes to the caller.
    pub fn upload(&self, sources: &[UploadSource<'_>]) -> RenderResult<Vec<BufferAllocation>> {
        if let Some(empty) = sources.iter().find(|s| s.bytes.is_empty()) {
            return Err(RenderError::InvalidUploadSize(empty.label.to_owned()));
        }
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = TransferBatch::new(self.gpu, self.pool, sources.len());
        for source in sources {
            let size = source.bytes.len() as vk::DeviceSize;
            let staging = batch.stage(source.bytes)?;
            let dst = self.gpu.create_buffer(
                size,
                source.role.usage(),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            batch.destinations.push(dst);
            batch.copy(staging.buffer, dst.buffer, size)?;
            debug!("staged {} ({} bytes)", source.label, size);
        }
        batch.wait(self.timeout)?;

        let total: usize = sources.iter().map(|s| s.bytes.len()).sum();
        info!("uploaded {} buffer(s), {total} bytes", sources.len());
        Ok(batch.finish())
    }

    /// Uploads positions, attributes and indices of every mesh in a single batch.
    pub fn upload_meshes(&self, meshes: &[Mesh]) -> RenderResult<Vec<GeometryBuffer>> {
        let labels: Vec<[String; 3]> = (0..meshes.len())
            .map(|i| {
                [
                    format!("mesh {i} positions"),
                    format!("mesh {i} attributes"),
                    format!("mesh {i} indices"),
                ]
            })
            .collect();

        let mut sources = Vec::with_capacity(meshes.len() * 3);
        for (mesh, [pos, attr, idx]) in meshes.iter().zip(&labels) {
            if !mesh.is_consistent() {
                warn!(
                    "{attr}: {} entries for {} positions",
                    mesh.attributes.len(),
                    mesh.positions.len()
                );
            }
            sources.push(UploadSource::vertex(pos, mesh.positions_bytes()));
            sources.push(UploadSource::vertex(attr, mesh.attributes.as_bytes()));
            sources.push(UploadSource::index(idx, mesh.indices.as_bytes()));
        }

        let buffers = self.upload(&sources)?;
        Ok(buffers
            .chunks_exact(3)
            .zip(meshes)
            .map(|(b, mesh)| GeometryBuffer {
                positions: b[0],
                attributes: b[1],
                indices: b[2],
                index_count: mesh.index_count(),
                index_width: mesh.indices.width(),
                attribute_format: mesh.attributes.format(),
            })
            .collect())
    }

    /// Debug path: copies a device-local buffer back to the host.
    pub fn read_back(&self, buffer: &BufferAllocation) -> RenderResult<Vec<u8>> {
        let mut batch = TransferBatch::new(self.gpu, self.pool, 1);
        let staging = self.gpu.create_buffer(
            buffer.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            STAGING_MEMORY,
        )?;
        batch.staging.push(staging);
        batch.copy(buffer.buffer, staging.buffer, buffer.size)?;
        batch.wait(self.timeout)?;
        self.gpu.read_mapped(&staging, buffer.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpu;

    fn uploader(gpu: &SimGpu) -> (StagedUploader<'_, SimGpu>, vk::CommandPool) {
        let pool = gpu.create_command_pool().unwrap();
        (StagedUploader::new(gpu, pool, Duration::from_secs(1)), pool)
    }

    #[test]
    fn vertex_and_index_roles_carry_transfer_bits() {
        let v = BufferRole::Vertex.usage();
        assert!(v.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        let i = BufferRole::Index.usage();
        assert!(i.contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(!i.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let gpu = SimGpu::new();
        let (up, _) = uploader(&gpu);
        let before = gpu.stats().submissions;
        assert!(up.upload(&[]).unwrap().is_empty());
        assert_eq!(gpu.stats().submissions, before);
    }

    #[test]
    fn zero_length_rejected_before_allocating() {
        let gpu = SimGpu::new();
        let (up, pool) = uploader(&gpu);
        let ok = [1u8, 2, 3];
        let err = up
            .upload(&[UploadSource::vertex("ok", &ok), UploadSource::index("idx", &[])])
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidUploadSize(ref l) if l == "idx"));
        assert_eq!(gpu.stats().buffers_created, 0);
        gpu.destroy_command_pool(pool);
        assert!(gpu.leaks().is_empty());
    }

    #[test]
    fn staging_is_released_and_destinations_kept() {
        let gpu = SimGpu::new();
        let (up, pool) = uploader(&gpu);
        let bytes = [7u8; 64];
        let out = up.upload(&[UploadSource::vertex("v", &bytes)]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(gpu.live_buffers(), 1);
        assert_eq!(gpu.live_fences(), 0);
        assert_eq!(up.read_back(&out[0]).unwrap(), bytes.to_vec());

        gpu.destroy_buffer(out[0]);
        gpu.destroy_command_pool(pool);
        assert!(gpu.leaks().is_empty());
    }

    #[test]
    fn failure_midway_releases_earlier_destinations() {
        let gpu = SimGpu::new();
        let (up, pool) = uploader(&gpu);
        // 2 buffers per source: the third source's staging allocation fails.
        gpu.fail_buffer_creation_after(4);
        let a = [1u8; 4];
        let err = up
            .upload(&[
                UploadSource::vertex("a", &a),
                UploadSource::vertex("b", &a),
                UploadSource::vertex("c", &a),
            ])
            .unwrap_err();
        assert!(matches!(err, RenderError::Vulkan(_)));
        gpu.destroy_command_pool(pool);
        assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
    }
}
