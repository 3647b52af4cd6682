// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Window and event pumping.
//!
//! The app owns the frame loop; winit events are pumped between ticks with
//! `pump_app_events`, so the renderer never runs inside a winit callback.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ember_render::{ExtentSource, TickInput};
use tracing::{debug, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

pub use winit;

/// Window state fed by winit callbacks.
struct Shell {
    title: String,
    requested: (u32, u32),
    window: Option<Window>,
    size: (u32, u32),
    last_visible: (u32, u32),
    invalidated: bool,
    close_requested: bool,
    create_error: Option<String>,
}

impl Shell {
    fn set_size(&mut self, size: PhysicalSize<u32>) {
        self.size = (size.width, size.height);
        if size.width > 0 && size.height > 0 {
            self.last_visible = self.size;
        }
    }
}

impl ApplicationHandler for Shell {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(self.requested.0, self.requested.1));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                self.set_size(window.inner_size());
                info!("window created ({}x{})", self.size.0, self.size.1);
                self.window = Some(window);
            }
            Err(e) => {
                self.create_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_some_and(|w| w.id() != id) {
            return;
        }
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                debug!("Resized -> {}x{}", size.width, size.height);
                self.set_size(size);
                self.invalidated = true;
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                self.invalidated = true;
            }
            _ => {}
        }
    }
}

pub struct Platform {
    event_loop: EventLoop<()>,
    shell: Shell,
}

impl Platform {
    /// Creates the event loop and pumps it until the window exists.
    pub fn new(title: &str, size: (u32, u32)) -> Result<Self> {
        let event_loop = EventLoop::new().context("event loop")?;
        let mut platform = Platform {
            event_loop,
            shell: Shell {
                title: title.to_owned(),
                requested: size,
                window: None,
                size: (0, 0),
                last_visible: size,
                invalidated: false,
                close_requested: false,
                create_error: None,
            },
        };
        while platform.shell.window.is_none() {
            if let Some(e) = platform.shell.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if !platform.pump(Some(Duration::from_millis(16))) {
                return Err(anyhow!("event loop exited before the window was created"));
            }
        }
        Ok(platform)
    }

    /// Dispatches pending events, blocking up to `timeout` (`None` blocks
    /// until one arrives). Returns false once the loop has exited.
    fn pump(&mut self, timeout: Option<Duration>) -> bool {
        let status = self.event_loop.pump_app_events(timeout, &mut self.shell);
        !matches!(status, PumpStatus::Exit(_))
    }

    pub fn window(&self) -> Result<&Window> {
        self.shell.window.as_ref().context("window not created")
    }

    pub fn should_close(&self) -> bool {
        self.shell.close_requested
    }

    /// Pumps without blocking and returns what the next tick should see.
    /// The invalidation flag is cleared once reported.
    pub fn poll_input(&mut self) -> TickInput {
        if !self.pump(Some(Duration::ZERO)) {
            self.shell.close_requested = true;
        }
        let input = TickInput::new(self.shell.size);
        if std::mem::take(&mut self.shell.invalidated) {
            input.invalidated()
        } else {
            input
        }
    }
}

impl ExtentSource for Platform {
    fn framebuffer_extent(&mut self) -> (u32, u32) {
        // A closing window no longer reports resizes; hand back the last
        // visible size so a pending recreate can finish.
        if self.shell.close_requested {
            return self.shell.last_visible;
        }
        self.shell.size
    }

    fn wait_events(&mut self) {
        if !self.pump(None) {
            self.shell.close_requested = true;
        }
    }
}
