// Windowing collaborator
//
// The renderer needs four things from a window: the platform display handle
// (instance extensions), a surface, the current framebuffer size and a
// "was resized" flag it polls once per frame. Blocking for events while
// minimised is left to the event loop (`ControlFlow::Wait`).

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use winit::window::Window;

pub trait WindowSurface {
    fn display_handle(&self) -> RawDisplayHandle;

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR>;

    /// Drawable size in pixels; zero while minimised
    fn framebuffer_size(&self) -> (u32, u32);

    /// Read and clear the resize flag
    fn take_resized(&self) -> bool;
}

/// winit window plus the resize flag set from its event handler
pub struct WinitSurface {
    window: Arc<Window>,
    resized: AtomicBool,
}

impl WinitSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            resized: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Called from `WindowEvent::Resized`
    pub fn notify_resized(&self) {
        self.resized.store(true, Ordering::Release);
    }
}

impl WindowSurface for WinitSurface {
    fn display_handle(&self) -> RawDisplayHandle {
        self.window.raw_display_handle()
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .context("ash_window::create_surface failed")
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn take_resized(&self) -> bool {
        self.resized.swap(false, Ordering::AcqRel)
    }
}
