// SPDX-License-Identifier: CEPL-1.0
use ember_math::Mesh;
use ember_render::sim::{FixedExtent, SimGpu, SimRecorder};
use ember_render::{RenderConfig, RenderLoop, TickInput};

const EXTENT: (u32, u32) = (640, 480);

fn run(frames_in_flight: usize, ticks: usize) -> SimGpu {
    let gpu = SimGpu::new();
    {
        let cfg = RenderConfig {
            frames_in_flight,
            ..RenderConfig::default()
        };
        let mut lp =
            RenderLoop::new(&gpu, SimRecorder::new(&gpu), &cfg, &[Mesh::quad()], EXTENT).unwrap();
        // upload submissions are not frames
        gpu.reset_stats();

        let mut extents = FixedExtent(EXTENT);
        for _ in 0..ticks {
            lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
            assert!(gpu.outstanding() <= frames_in_flight);
        }
        lp.shutdown().unwrap();
    }
    gpu
}

#[test]
fn outstanding_submissions_never_exceed_slot_count() {
    for n in 1..=4 {
        let gpu = run(n, 25);
        let stats = gpu.stats();
        assert_eq!(stats.submissions, 25);
        assert_eq!(stats.max_outstanding, n, "N = {n}");
        assert!(gpu.violations().is_empty(), "N = {n}: {:?}", gpu.violations());
        assert!(gpu.leaks().is_empty(), "N = {n}: {:?}", gpu.leaks());
    }
}

#[test]
fn single_slot_serializes_every_frame() {
    let gpu = run(1, 5);
    assert_eq!(gpu.stats().max_outstanding, 1);
    assert_eq!(gpu.stats().presents, 5);
}
