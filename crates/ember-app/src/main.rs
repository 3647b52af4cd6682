// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ember_core::init_tracing;
use ember_math::{AttributeData, Indices, Mesh, Vec2, Vec3};
use ember_platform::Platform;
use ember_render::gpu::Gpu;
use ember_render::sim::{FixedExtent, SimGpu, SimRecorder};
use ember_render::swapchain::choose_surface_format;
use ember_render::{
    ExtentSource, FrameRecorder, RenderConfig, RenderError, RenderLoop, TickInput, TickOutcome,
};
use ember_render_vk::{DeviceContext, MeshPipeline};
use serde::Deserialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing file means defaults
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Vertex shader SPIR-V, overrides `[shaders] vertex`
    #[arg(long)]
    vert: Option<PathBuf>,
    /// Fragment shader SPIR-V, overrides `[shaders] fragment`
    #[arg(long)]
    frag: Option<PathBuf>,
    /// Drive the render loop against the timeline simulator, no window
    #[arg(long)]
    headless: bool,
    /// Stop after this many ticks (headless default: 120)
    #[arg(long)]
    ticks: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: "ember".into(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
struct ShaderCfg {
    vertex: PathBuf,
    fragment: PathBuf,
}

impl Default for ShaderCfg {
    fn default() -> Self {
        ShaderCfg {
            vertex: "shaders/mesh.vert.spv".into(),
            fragment: "shaders/mesh.frag.spv".into(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
struct AppCfg {
    window: WindowCfg,
    render: RenderConfig,
    shaders: ShaderCfg,
}

fn load_cfg(path: &Path) -> Result<AppCfg> {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str(&s).with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("{} not found; using defaults", path.display());
            Ok(AppCfg::default())
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// A quad plus a small triangle carrying `vec2` attributes.
fn demo_meshes() -> Vec<Mesh> {
    let triangle = Mesh {
        positions: vec![
            Vec3::new(-0.9, -0.9, 0.0),
            Vec3::new(-0.6, -0.9, 0.0),
            Vec3::new(-0.75, -0.6, 0.0),
        ],
        attributes: AttributeData::Vec2(vec![Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0), Vec2::ONE]),
        indices: Indices::U16(vec![0, 1, 2]),
    };
    vec![Mesh::quad(), triangle]
}

/// Per-second frame counter for the log.
struct FpsLog {
    frames: u32,
    since: Instant,
}

impl FpsLog {
    fn new() -> Self {
        FpsLog {
            frames: 0,
            since: Instant::now(),
        }
    }

    fn frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
        let dt = self.since.elapsed();
        if dt.as_secs() >= 1 {
            info!("fps ~ {:.1}", self.frames as f64 / dt.as_secs_f64());
            self.frames = 0;
            self.since = Instant::now();
        }
    }
}

/// Runs ticks until `keep_going` says stop. Skipped ticks block on events.
fn drive<G, R, E>(
    lp: &mut RenderLoop<'_, G, R>,
    extents: &mut E,
    mut next_input: impl FnMut(&mut E) -> Option<TickInput>,
    limit: Option<u64>,
) -> Result<()>
where
    G: Gpu,
    R: FrameRecorder<G>,
    E: ExtentSource,
{
    let mut fps = FpsLog::new();
    while limit.map_or(true, |n| lp.stats().ticks < n) {
        let Some(input) = next_input(extents) else {
            break;
        };
        match lp.tick(input, extents).context("render tick")? {
            TickOutcome::Skipped => extents.wait_events(),
            TickOutcome::Presented { .. } | TickOutcome::Recreated { presented: true } => {
                fps.frame()
            }
            TickOutcome::Recreated { presented: false } => {}
        }
    }
    Ok(())
}

fn run_headless(cfg: &AppCfg, ticks: u64) -> Result<()> {
    let gpu = SimGpu::new();
    let extent = (cfg.window.width, cfg.window.height);
    let mut lp = RenderLoop::new(
        &gpu,
        SimRecorder::new(&gpu),
        &cfg.render,
        &demo_meshes(),
        extent,
    )
    .context("headless setup")?;

    let mut extents = FixedExtent(extent);
    drive(
        &mut lp,
        &mut extents,
        |e| Some(TickInput::new(e.framebuffer_extent())),
        Some(ticks),
    )?;

    let stats = lp.stats();
    lp.shutdown().context("headless teardown")?;
    let sim = gpu.stats();
    info!(
        "headless: {} tick(s), {} presented, {} recreate(s); {} submission(s), peak {} in flight",
        stats.ticks, stats.presented, stats.recreated, sim.submissions, sim.max_outstanding
    );
    if !gpu.leaks().is_empty() || !gpu.violations().is_empty() {
        bail!(
            "simulator reported leaks {:?} and violations {:?}",
            gpu.leaks(),
            gpu.violations()
        );
    }
    Ok(())
}

fn run_windowed(cfg: &AppCfg, ticks: Option<u64>) -> Result<()> {
    let vert = fs::read(&cfg.shaders.vertex)
        .with_context(|| format!("reading {}", cfg.shaders.vertex.display()))?;
    let frag = fs::read(&cfg.shaders.fragment)
        .with_context(|| format!("reading {}", cfg.shaders.fragment.display()))?;

    let mut platform = Platform::new(&cfg.window.title, (cfg.window.width, cfg.window.height))?;
    let window = platform.window()?;
    let ctx = DeviceContext::new(window, window, &cfg.render).context("device setup")?;
    info!("adapter = {}", ctx.adapter_name());

    let surface_format = choose_surface_format(&ctx.surface_support()?.formats)
        .ok_or(RenderError::SurfaceUnsupported("formats"))?;
    let meshes = demo_meshes();
    let formats: Vec<_> = meshes.iter().map(|m| m.attributes.format()).collect();
    let pipeline = MeshPipeline::new(&ctx, surface_format.format, &vert, &frag, &formats)
        .context("pipeline setup")?;

    let extent = platform.framebuffer_extent();
    let mut lp =
        RenderLoop::new(&ctx, pipeline, &cfg.render, &meshes, extent).context("render setup")?;

    drive(
        &mut lp,
        &mut platform,
        |p| {
            let input = p.poll_input();
            (!p.should_close()).then_some(input)
        },
        ticks,
    )?;

    let stats = lp.stats();
    lp.shutdown().context("teardown")?;
    info!(
        "exiting after {} tick(s): {} presented, {} recreate(s), {} skipped",
        stats.ticks, stats.presented, stats.recreated, stats.skipped
    );
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut cfg = load_cfg(&args.config)?;
    if let Some(v) = args.vert {
        cfg.shaders.vertex = v;
    }
    if let Some(f) = args.frag {
        cfg.shaders.fragment = f;
    }
    cfg.render = cfg.render.validated()?;

    if args.headless {
        run_headless(&cfg, args.ticks.unwrap_or(120))
    } else {
        run_windowed(&cfg, args.ticks)
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
