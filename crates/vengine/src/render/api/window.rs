//! Windowing collaborator
//!
//! The render core never owns a window. It asks the collaborator for the
//! instance extensions the platform needs, for a surface on a given instance,
//! and for the current framebuffer size. Resize events flow the other way via
//! `RenderApi::frame_buffer_resize`.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::CStr;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Window-side services consumed at initialization
pub trait WindowSurface {
    /// Instance extensions required to create a surface for this window
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>>;

    /// Create a presentation surface on `instance`
    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> VulkanResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

/// [`WindowSurface`] for any window exposing raw window and display handles
pub struct RawWindowSurface<'a, W> {
    window: &'a W,
    framebuffer_size: (u32, u32),
}

impl<'a, W: HasRawWindowHandle + HasRawDisplayHandle> RawWindowSurface<'a, W> {
    /// Wrap `window` whose framebuffer currently measures `framebuffer_size`
    pub const fn new(window: &'a W, framebuffer_size: (u32, u32)) -> Self {
        Self {
            window,
            framebuffer_size,
        }
    }
}

impl<W: HasRawWindowHandle + HasRawDisplayHandle> WindowSurface for RawWindowSurface<'_, W> {
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
        let names = ash_window::enumerate_required_extensions(self.window.raw_display_handle())
            .map_err(VulkanError::Api)?;

        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            .collect())
    }

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> VulkanResult<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
            .map_err(VulkanError::Api)
        }
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        self.framebuffer_size
    }
}
