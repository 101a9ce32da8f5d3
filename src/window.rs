// Window collaborator
//
// The frame loop only needs four things from a window: its drawable size,
// a way to pump events, a bounded blocking wait (used while minimized) and a
// close flag. `WinitSurface` provides them on top of winit's pump API so the
// loop stays in our hands instead of winit's.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::WindowConfig;

/// How long one `wait_events` call may block while the window has no area
const EVENT_WAIT_INTERVAL: Duration = Duration::from_millis(16);

/// What the presentation chain and frame loop need from the window system
pub trait WindowSurface {
    /// Current drawable size in pixels
    fn drawable_size(&self) -> (u32, u32);

    /// Process pending events without blocking
    fn poll_events(&mut self);

    /// Block until an event arrives or a short interval passes
    fn wait_events(&mut self);

    fn should_close(&self) -> bool;
}

/// Pending-resize flag shared between the window callback and the frame loop
#[derive(Clone, Debug, Default)]
pub struct ResizeSignal {
    flag: Arc<AtomicBool>,
}

impl ResizeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// WINIT IMPLEMENTATION
// =============================================================================

/// Event handler state; winit calls into this while we pump
struct WindowHost {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    resize: ResizeSignal,
    close_requested: bool,
    creation_error: Option<String>,
}

impl ApplicationHandler for WindowHost {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.creation_error = Some(e.to_string());
                self.close_requested = true;
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize.raise();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }

            _ => {}
        }
    }
}

/// A winit window driven by explicit event pumping
pub struct WinitSurface {
    event_loop: EventLoop<()>,
    host: WindowHost,
}

impl WinitSurface {
    pub fn new(config: &WindowConfig, resize: ResizeSignal) -> Result<Self> {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;

        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(config.width, config.height));

        let mut surface = Self {
            event_loop,
            host: WindowHost {
                attributes,
                window: None,
                resize,
                close_requested: false,
                creation_error: None,
            },
        };

        // The window only exists once winit has delivered `resumed`
        pump_until(|timeout| {
            if surface.host.window.is_some() {
                return Ok(true);
            }
            if let Some(err) = surface.host.creation_error.take() {
                anyhow::bail!("Failed to create window: {}", err);
            }
            if surface.pump(Some(timeout)) {
                anyhow::bail!("Event loop exited before the window was created");
            }
            Ok(false)
        })?;

        Ok(surface)
    }

    pub fn window(&self) -> Option<&Arc<Window>> {
        self.host.window.as_ref()
    }

    /// Returns true when winit reports the loop has exited
    fn pump(&mut self, timeout: Option<Duration>) -> bool {
        match self.event_loop.pump_app_events(timeout, &mut self.host) {
            PumpStatus::Continue => false,
            PumpStatus::Exit(code) => {
                log::info!("Event loop exited with code {}", code);
                self.host.close_requested = true;
                true
            }
        }
    }
}

/// Call `step` with a bounded wait until it reports done
fn pump_until(mut step: impl FnMut(Duration) -> Result<bool>) -> Result<()> {
    while !step(EVENT_WAIT_INTERVAL)? {}
    Ok(())
}

impl WindowSurface for WinitSurface {
    fn drawable_size(&self) -> (u32, u32) {
        self.host
            .window
            .as_ref()
            .map(|w| {
                let size = w.inner_size();
                (size.width, size.height)
            })
            .unwrap_or((0, 0))
    }

    fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn wait_events(&mut self) {
        self.pump(Some(EVENT_WAIT_INTERVAL));
    }

    fn should_close(&self) -> bool {
        self.host.close_requested
    }
}
