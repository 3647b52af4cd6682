// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use ember_math::{AttributeData, AttributeFormat, IndexWidth, Indices, Mesh, Vec2, Vec3};
use ember_render::gpu::Gpu;
use ember_render::sim::SimGpu;
use ember_render::vk;
use ember_render::{RenderError, StagedUploader, UploadSource};

fn with_uploader(test: impl FnOnce(&SimGpu, &StagedUploader<'_, SimGpu>)) {
    let gpu = SimGpu::new();
    let pool = gpu.create_command_pool().unwrap();
    {
        let up = StagedUploader::new(&gpu, pool, Duration::from_secs(10));
        test(&gpu, &up);
    }
    gpu.destroy_command_pool(pool);
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn round_trip_preserves_bytes() {
    with_uploader(|gpu, up| {
        for len in [1, 3, 4, 255, 4096, 65_537] {
            let bytes = pattern(len);
            let out = up.upload(&[UploadSource::vertex("blob", &bytes)]).unwrap();
            assert_eq!(out[0].size, len as vk::DeviceSize);
            assert_eq!(up.read_back(&out[0]).unwrap(), bytes, "len {len}");
            gpu.destroy_buffer(out[0]);
        }
    });
}

#[test]
fn batch_waits_once_for_all_copies() {
    with_uploader(|gpu, up| {
        let a = pattern(16);
        let b = pattern(32);
        let c = pattern(8);
        let out = up
            .upload(&[
                UploadSource::vertex("a", &a),
                UploadSource::vertex("b", &b),
                UploadSource::index("c", &c),
            ])
            .unwrap();
        assert_eq!(gpu.stats().submissions, 3);
        assert_eq!(gpu.stats().max_outstanding, 3);
        assert_eq!(gpu.outstanding(), 0);
        for (dst, src) in out.iter().zip([&a, &b, &c]) {
            assert_eq!(&up.read_back(dst).unwrap(), src);
            gpu.destroy_buffer(*dst);
        }
    });
}

#[test]
fn zero_length_source_fails() {
    with_uploader(|gpu, up| {
        let err = up.upload(&[UploadSource::vertex("empty", &[])]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidUploadSize(_)));
        assert!(err.is_transfer());
        assert_eq!(gpu.stats().buffers_created, 0);
    });
}

#[test]
fn stalled_transfer_times_out_without_leaking() {
    with_uploader(|gpu, up| {
        gpu.set_stalled(true);
        let bytes = pattern(128);
        let err = up
            .upload(&[UploadSource::vertex("a", &bytes), UploadSource::index("b", &bytes)])
            .unwrap_err();
        assert!(matches!(err, RenderError::TransferTimeout(_)));
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_fences(), 0);
    });
}

#[test]
fn meshes_upload_as_soa_streams() {
    let small = Mesh {
        positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
        attributes: AttributeData::Vec2(vec![Vec2::ZERO, Vec2::X, Vec2::Y]),
        indices: Indices::U16(vec![0, 1, 2]),
    };
    let meshes = [Mesh::quad(), small];

    with_uploader(|gpu, up| {
        let geometry = up.upload_meshes(&meshes).unwrap();
        assert_eq!(geometry.len(), 2);
        assert_eq!(gpu.stats().submissions, 6);

        assert_eq!(geometry[0].index_count, 6);
        assert_eq!(geometry[0].index_width, IndexWidth::U32);
        assert_eq!(geometry[0].attribute_format, AttributeFormat::Vec3);
        assert_eq!(geometry[1].index_width, IndexWidth::U16);
        assert_eq!(geometry[1].attribute_format, AttributeFormat::Vec2);

        for (g, mesh) in geometry.iter().zip(&meshes) {
            assert_eq!(up.read_back(&g.positions).unwrap(), mesh.positions_bytes());
            assert_eq!(up.read_back(&g.attributes).unwrap(), mesh.attributes.as_bytes());
            assert_eq!(up.read_back(&g.indices).unwrap(), mesh.indices.as_bytes());
            for b in [g.positions, g.attributes, g.indices] {
                gpu.destroy_buffer(b);
            }
        }
    });
}
