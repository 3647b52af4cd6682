// SPDX-License-Identifier: CEPL-1.0
use ember_math::Mesh;
use ember_render::gpu::{AcquireOutcome, PresentOutcome};
use ember_render::sim::{default_surface, FixedExtent, SimGpu, SimRecorder};
use ember_render::vk;
use ember_render::{RenderConfig, RenderError, RenderLoop, SlotState, TickInput, TickOutcome};

const EXTENT: (u32, u32) = (800, 600);

fn config(frames_in_flight: usize) -> RenderConfig {
    RenderConfig {
        frames_in_flight,
        ..RenderConfig::default()
    }
}

fn start(gpu: &SimGpu, frames_in_flight: usize) -> RenderLoop<'_, SimGpu, SimRecorder> {
    RenderLoop::new(
        gpu,
        SimRecorder::new(gpu),
        &config(frames_in_flight),
        &[Mesh::quad()],
        EXTENT,
    )
    .unwrap()
}

#[test]
fn ten_ticks_cycle_frame_index() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent(EXTENT);

    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(lp.frame_index());
        let out = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
        assert!(matches!(out, TickOutcome::Presented { .. }), "{out:?}");
        assert!(lp.frames().slots().iter().all(|s| s.state() == SlotState::Idle));
    }
    assert_eq!(seen, [0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);

    // three swapchain images, handed out round-robin
    assert_eq!(lp.recorder().recorded, [0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(gpu.stats().presents, 10);
    assert_eq!(gpu.stats().draws, 10);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());

    lp.shutdown().unwrap();
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
}

#[test]
fn out_of_date_acquire_recreates_without_advancing() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent(EXTENT);

    lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    assert_eq!(lp.frame_index(), 1);

    gpu.force_acquire(AcquireOutcome::OutOfDate);
    let out = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    assert_eq!(out, TickOutcome::Recreated { presented: false });
    assert_eq!(lp.frame_index(), 1);
    assert_eq!(lp.swapchain_generation(), 2);

    let out = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    assert!(matches!(out, TickOutcome::Presented { .. }));
    assert_eq!(lp.frame_index(), 0);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn invalidation_and_suboptimal_present_recreate_once() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent(EXTENT);
    let created = gpu.stats().swapchains_created;

    gpu.force_present(PresentOutcome::Suboptimal);
    let out = lp
        .tick(TickInput::new(EXTENT).invalidated(), &mut extents)
        .unwrap();
    assert_eq!(out, TickOutcome::Recreated { presented: true });
    assert_eq!(gpu.stats().swapchains_created, created + 1);
    assert_eq!(lp.stats().recreated, 1);
    // the frame still advanced
    assert_eq!(lp.frame_index(), 1);
}

#[test]
fn out_of_date_present_recreates() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent(EXTENT);

    lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    gpu.invalidate_surface();
    // acquire reports out of date before anything is presented
    let out = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    assert_eq!(out, TickOutcome::Recreated { presented: false });

    gpu.force_present(PresentOutcome::OutOfDate);
    let out = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    assert_eq!(out, TickOutcome::Recreated { presented: true });
    assert_eq!(lp.swapchain_generation(), 3);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn resized_framebuffer_rebuilds_at_new_extent() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent((1024, 768));

    let out = lp
        .tick(TickInput::new((1024, 768)).invalidated(), &mut extents)
        .unwrap();
    assert_eq!(out, TickOutcome::Recreated { presented: true });
    assert_eq!(lp.swapchain().unwrap().extent_tuple(), (1024, 768));

    let out = lp.tick(TickInput::new((1024, 768)), &mut extents).unwrap();
    assert!(matches!(out, TickOutcome::Presented { .. }));
}

#[test]
fn fixed_surface_extent_keeps_presenting_without_recreate() {
    let mut surface = default_surface();
    surface.capabilities.current_extent = vk::Extent2D { width: 1280, height: 720 };
    let gpu = SimGpu::with_surface(surface);
    let window = (1278, 720);
    let mut lp = RenderLoop::new(
        &gpu,
        SimRecorder::new(&gpu),
        &config(2),
        &[Mesh::quad()],
        window,
    )
    .unwrap();
    assert_eq!(lp.swapchain().unwrap().extent_tuple(), (1280, 720));

    let mut extents = FixedExtent(window);
    for _ in 0..5 {
        let out = lp.tick(TickInput::new(window), &mut extents).unwrap();
        assert!(matches!(out, TickOutcome::Presented { .. }), "{out:?}");
    }
    assert_eq!(lp.stats().recreated, 0);
    assert_eq!(lp.swapchain_generation(), 1);
}

#[test]
fn zero_frames_in_flight_is_rejected_at_startup() {
    let gpu = SimGpu::new();
    let err = RenderLoop::new(
        &gpu,
        SimRecorder::new(&gpu),
        &config(0),
        &[Mesh::quad()],
        EXTENT,
    )
    .err()
    .unwrap();
    assert!(matches!(err, RenderError::Config(_)));
    assert!(err.is_setup());
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
}

#[test]
fn minimized_tick_is_skipped() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent((0, 0));

    let out = lp.tick(TickInput::new((0, 0)), &mut extents).unwrap();
    assert_eq!(out, TickOutcome::Skipped);
    assert_eq!(gpu.stats().acquires, 0);
    assert_eq!(lp.frame_index(), 0);
    assert_eq!(lp.stats().skipped, 1);
}

#[test]
fn hung_gpu_surfaces_fence_timeout() {
    let gpu = SimGpu::new();
    let mut lp = start(&gpu, 2);
    let mut extents = FixedExtent(EXTENT);

    lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    gpu.set_stalled(true);
    // slot 1 has never been submitted, its fence is still signaled
    lp.tick(TickInput::new(EXTENT), &mut extents).unwrap();
    let err = lp.tick(TickInput::new(EXTENT), &mut extents).unwrap_err();
    assert!(matches!(err, RenderError::FenceTimeout(_)));
    assert_eq!(lp.frames().current().state(), SlotState::Idle);

    drop(lp);
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
}

#[test]
fn failed_startup_releases_everything() {
    let mut surface = ember_render::sim::default_surface();
    surface.formats.clear();
    let gpu = SimGpu::with_surface(surface);

    let err = RenderLoop::new(
        &gpu,
        SimRecorder::new(&gpu),
        &config(2),
        &[Mesh::quad()],
        EXTENT,
    )
    .err()
    .unwrap();
    assert!(matches!(err, RenderError::SurfaceUnsupported("formats")));
    assert!(gpu.leaks().is_empty(), "{:?}", gpu.leaks());
}
