//! Swapchain lifecycle
//!
//! Negotiates format, present mode, extent and image count against the
//! surface, owns the swapchain images' views, and rebuilds everything on
//! resize or when presentation reports the swapchain stale.
//!
//! Negotiation is intentionally simple: the preferred format and mode are
//! taken when offered, otherwise the first format and FIFO.

use ash::vk;

use crate::render::backends::gpu::{GpuDevice, QueueRole, SwapchainRequest};
use crate::render::backends::vulkan::{
    QueueFamilyAssignment, SwapchainSupport, VulkanError, VulkanResult,
};

/// Pick an 8-bit BGRA/RGBA sRGB format in the sRGB-nonlinear space, else the first one offered
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|format| {
            matches!(format.format, vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB)
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when offered, else FIFO (always supported)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the framebuffer size clamped to the surface limits
/// when the surface leaves the choice to the swapchain
///
/// Some drivers report a minimum above the maximum; the maximum wins.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let (width, height) = framebuffer_size;
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: width.max(min.width).min(max.width),
        height: height.max(min.height).min(max.height),
    }
}

/// Whether a swapchain can be built at `extent`
pub const fn has_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

/// One more than the surface minimum, capped by the maximum (0 = unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Swapchain handle plus everything negotiated for it
#[derive(Debug, Clone)]
pub struct SwapchainState {
    /// Swapchain handle
    pub handle: vk::SwapchainKHR,
    /// Format and color space
    pub surface_format: vk::SurfaceFormatKHR,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Requested minimum image count
    pub image_count: u32,
    /// Presentable images, in index order
    pub images: Vec<vk::Image>,
    /// One view per image
    pub image_views: Vec<vk::ImageView>,
}

/// Owner of the current swapchain
#[derive(Debug)]
pub struct SwapchainManager {
    state: SwapchainState,
    framebuffer_size: (u32, u32),
    stale: bool,
}

impl SwapchainManager {
    /// Create the swapchain for a framebuffer of `framebuffer_size`
    ///
    /// Fails when the surface has no area to present into.
    pub fn create<D: GpuDevice>(device: &D, framebuffer_size: (u32, u32)) -> VulkanResult<Self> {
        let support = device.surface_support()?;
        let extent = choose_extent(&support.capabilities, framebuffer_size);
        if !has_area(extent) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Cannot create a swapchain of {}x{}", extent.width, extent.height),
            });
        }
        let state = Self::build(device, &support, extent)?;
        Ok(Self {
            state,
            framebuffer_size,
            stale: false,
        })
    }

    fn build<D: GpuDevice>(
        device: &D,
        support: &SwapchainSupport,
        extent: vk::Extent2D,
    ) -> VulkanResult<SwapchainState> {
        let surface_format =
            choose_surface_format(&support.formats).ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Surface reports no formats".to_string(),
            })?;
        let present_mode = choose_present_mode(&support.present_modes);
        let image_count = choose_image_count(&support.capabilities);

        let families: QueueFamilyAssignment = device.queue_families();
        let queue_families = families.sharing_between(QueueRole::Graphics, QueueRole::Present);

        let handle = device.create_swapchain(&SwapchainRequest {
            surface_format,
            present_mode,
            extent,
            image_count,
            pre_transform: support.capabilities.current_transform,
            queue_families: &queue_families,
        })?;

        let images = device.swapchain_images(handle)?;
        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let aspect = vk::ImageAspectFlags::COLOR;
            match device.create_image_view(image, surface_format.format, aspect) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        device.destroy_image_view(view);
                    }
                    device.destroy_swapchain(handle);
                    return Err(e);
                }
            }
        }

        log::info!(
            "Swapchain created: {}x{}, {:?}/{:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            images.len()
        );

        Ok(SwapchainState {
            handle,
            surface_format,
            present_mode,
            extent,
            image_count,
            images,
            image_views,
        })
    }

    /// Destroy the image views and the swapchain
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        for view in self.state.image_views.drain(..) {
            device.destroy_image_view(view);
        }
        if self.state.handle != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.state.handle);
            self.state.handle = vk::SwapchainKHR::null();
        }
        self.state.images.clear();
    }

    /// Wait for the device to idle, destroy the current swapchain and build a
    /// new one for the current framebuffer size
    ///
    /// Returns `false` and leaves the swapchain stale when the surface
    /// currently reports a zero extent, as minimized windows do on some
    /// platforms.
    pub fn recreate<D: GpuDevice>(&mut self, device: &D) -> VulkanResult<bool> {
        let support = device.surface_support()?;
        let extent = choose_extent(&support.capabilities, self.framebuffer_size);
        if !has_area(extent) {
            log::debug!(
                "Surface reports {}x{}, keeping the stale swapchain",
                extent.width,
                extent.height
            );
            return Ok(false);
        }

        device.wait_idle()?;
        self.destroy(device);
        self.state = Self::build(device, &support, extent)?;
        self.stale = false;
        Ok(true)
    }

    /// Record a new framebuffer size and mark the swapchain stale
    pub fn set_framebuffer_size(&mut self, width: u32, height: u32) {
        self.framebuffer_size = (width, height);
        self.stale = true;
    }

    /// Flag the swapchain for recreation
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Whether recreation is pending
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Framebuffer size used for the next creation
    pub const fn framebuffer_size(&self) -> (u32, u32) {
        self.framebuffer_size
    }

    /// Whether the framebuffer has zero area (minimized window)
    pub const fn is_minimized(&self) -> bool {
        self.framebuffer_size.0 == 0 || self.framebuffer_size.1 == 0
    }

    /// Current swapchain state
    pub const fn state(&self) -> &SwapchainState {
        &self.state
    }

    /// Swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.state.handle
    }

    /// Current extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.state.extent
    }

    /// Color format of the images
    pub const fn format(&self) -> vk::Format {
        self.state.surface_format.format
    }

    /// Image at `index`
    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.state.images.get(index as usize).copied()
    }

    /// View of the image at `index`
    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.state.image_views.get(index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::mock::{default_surface_support, Call, ObjectKind, RecordingDevice};

    fn capabilities(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 100, height: 100 },
            max_image_extent: vk::Extent2D {
                width: 4000,
                height: 4000,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_extent_clamps_sentinel_to_limits() {
        let caps = capabilities((u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&caps, (50, 50)), vk::Extent2D { width: 100, height: 100 });
        assert_eq!(choose_extent(&caps, (5000, 5000)), vk::Extent2D { width: 4000, height: 4000 });
        assert_eq!(choose_extent(&caps, (800, 600)), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_extent_with_inverted_limits_does_not_panic() {
        let mut caps = capabilities((u32::MAX, u32::MAX));
        caps.min_image_extent = vk::Extent2D { width: 900, height: 700 };
        caps.max_image_extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(choose_extent(&caps, (50, 50)), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(choose_extent(&caps, (5000, 5000)), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_extent_uses_reported_extent_verbatim() {
        let caps = capabilities((1280, 720));
        assert_eq!(choose_extent(&caps, (50, 50)), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn test_image_count_respects_maximum() {
        let mut caps = capabilities((800, 600));
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn test_format_preference_and_fallback() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen =
            |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(chosen(&[unorm, srgb]), Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(chosen(&[unorm]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(chosen(&[]), None);
    }

    #[test]
    fn test_present_mode_preference() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_create_on_shared_family_uses_exclusive_sharing() {
        let device = RecordingDevice::new();
        let manager = SwapchainManager::create(&device, (800, 600)).unwrap();
        assert_eq!(manager.extent(), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(manager.state().images.len(), 3);
        assert_eq!(manager.state().image_views.len(), 3);
        assert_eq!(manager.state().present_mode, vk::PresentModeKHR::MAILBOX);

        let sharing: Vec<Vec<u32>> = device
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateSwapchain { queue_families, .. } => Some(queue_families),
                _ => None,
            })
            .collect();
        assert_eq!(sharing, vec![Vec::<u32>::new()]);
    }

    #[test]
    fn test_create_on_split_families_uses_concurrent_sharing() {
        let mut families = crate::render::backends::mock::default_queue_families();
        families.present = Some(2);
        let device = RecordingDevice::with_setup(default_surface_support(), families);
        SwapchainManager::create(&device, (640, 480)).unwrap();
        let concurrent = device.count_calls(|call| {
            matches!(
                call,
                Call::CreateSwapchain { queue_families, .. } if queue_families == &vec![0, 2]
            )
        });
        assert_eq!(concurrent, 1);
    }

    #[test]
    fn test_recreate_releases_everything_it_replaces() {
        let device = RecordingDevice::new();
        let mut manager = SwapchainManager::create(&device, (800, 600)).unwrap();
        manager.set_framebuffer_size(1024, 768);
        assert!(manager.is_stale());

        assert!(manager.recreate(&device).unwrap());
        assert!(!manager.is_stale());
        assert_eq!(manager.extent(), vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(device.live(ObjectKind::Swapchain), 1);
        assert_eq!(device.live(ObjectKind::ImageView), 3);
        assert_eq!(device.count_calls(|call| matches!(call, Call::WaitIdle)), 1);

        manager.destroy(&device);
        assert_eq!(device.created(ObjectKind::Swapchain), device.destroyed(ObjectKind::Swapchain));
        assert_eq!(device.created(ObjectKind::ImageView), device.destroyed(ObjectKind::ImageView));
    }

    #[test]
    fn test_zero_surface_extent_defers_recreation() {
        let device = RecordingDevice::new();
        let mut manager = SwapchainManager::create(&device, (800, 600)).unwrap();
        let handle = manager.handle();
        manager.mark_stale();
        device.set_current_extent(0, 0);

        assert!(!manager.recreate(&device).unwrap());
        assert!(manager.is_stale());
        assert_eq!(manager.handle(), handle);
        assert_eq!(device.count_calls(|call| matches!(call, Call::CreateSwapchain { .. })), 1);
        assert_eq!(device.count_calls(|call| matches!(call, Call::WaitIdle)), 0);

        device.set_current_extent(640, 480);
        assert!(manager.recreate(&device).unwrap());
        assert_eq!(manager.extent(), vk::Extent2D { width: 640, height: 480 });
        manager.destroy(&device);
    }

    #[test]
    fn test_create_rejects_zero_surface_extent() {
        let device = RecordingDevice::new();
        device.set_current_extent(0, 0);
        assert!(matches!(
            SwapchainManager::create(&device, (800, 600)),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert_eq!(device.live(ObjectKind::Swapchain), 0);
    }
}
