// SPDX-License-Identifier: CEPL-1.0
use ember_math::Mesh;
use ember_render::sim::{FixedExtent, SimGpu, SimRecorder};
use ember_render::vk::Handle;
use ember_render::{FrameRecorder, RenderConfig, RenderLoop, TickInput};

const EXTENT: (u32, u32) = (320, 240);

#[test]
fn shutdown_releases_in_reverse_dependency_order() {
    let gpu = SimGpu::new();
    let mut lp = RenderLoop::new(
        &gpu,
        SimRecorder::new(&gpu),
        &RenderConfig::default(),
        &[Mesh::quad()],
        EXTENT,
    )
    .unwrap();
    let mut extents = FixedExtent(EXTENT);
    for _ in 0..3 {
        lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    }

    let swapchain = lp.swapchain().unwrap().swapchain.as_raw();
    let geometry = lp.geometry()[0];
    let slot_fence = lp.frames().slots()[0].in_flight.as_raw();
    let render_pass = lp.recorder().render_pass().as_raw();
    let idles = gpu.stats().wait_idles;

    lp.shutdown().unwrap();
    assert_eq!(gpu.stats().wait_idles, idles + 1);

    let log = gpu.destroy_log();
    let at = |raw: u64| log.iter().position(|&r| r == raw).unwrap();
    // chain, then frame slots, then geometry (newest stream first), then the recorder
    assert!(at(swapchain) < at(slot_fence));
    assert!(at(slot_fence) < at(geometry.indices.buffer.as_raw()));
    assert!(at(geometry.indices.buffer.as_raw()) < at(geometry.attributes.buffer.as_raw()));
    assert!(at(geometry.attributes.buffer.as_raw()) < at(geometry.positions.buffer.as_raw()));
    assert_eq!(*log.last().unwrap(), render_pass);

    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn dropping_the_loop_tears_down_too() {
    let gpu = SimGpu::new();
    {
        let mut lp = RenderLoop::new(
            &gpu,
            SimRecorder::new(&gpu),
            &RenderConfig::default(),
            &[Mesh::quad(), Mesh::quad()],
            EXTENT,
        )
        .unwrap();
        lp.tick(TickInput::new(EXTENT), &mut FixedExtent(EXTENT))
            .unwrap();
        assert!(gpu.outstanding() > 0);
    }
    assert_eq!(gpu.outstanding(), 0);
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}
