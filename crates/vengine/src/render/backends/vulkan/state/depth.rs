//! Depth attachment sized to the swapchain

use ash::vk;

use crate::render::backends::gpu::{GpuDevice, ImageAllocation, ImageRequest, QueueRole};
use crate::render::backends::vulkan::{ImageState, ImageStateTracker, UploadCommands, VulkanResult};

/// Depth buffer wrapper; rebuilt after every swapchain recreation
#[derive(Debug)]
pub struct DepthTarget {
    allocation: Option<ImageAllocation>,
}

impl DepthTarget {
    /// Depth format used for every depth target
    pub const FORMAT: vk::Format = vk::Format::D32_SFLOAT;

    /// Create the depth image at `extent` and move it into the depth
    /// attachment layout with a single-time command on the graphics queue
    pub fn create<D: GpuDevice>(
        device: &D,
        uploads: &UploadCommands,
        tracker: &mut ImageStateTracker,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let allocation = device.create_image(&ImageRequest {
            extent,
            format: Self::FORMAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        })?;

        tracker.register(allocation.image, vk::ImageAspectFlags::DEPTH, ImageState::UNDEFINED);
        let transitioned = uploads.run(device, QueueRole::Graphics, |command_buffer| {
            let barrier = tracker.transition(allocation.image, ImageState::DEPTH_ATTACHMENT);
            if let Some(barrier) = barrier {
                device.cmd_image_barrier(command_buffer, &barrier);
            }
        });
        if let Err(e) = transitioned {
            tracker.forget(allocation.image);
            device.destroy_image(&allocation);
            return Err(e);
        }

        log::debug!("Depth target created: {}x{}", extent.width, extent.height);
        Ok(Self {
            allocation: Some(allocation),
        })
    }

    /// Destroy the old image and build a new one at `extent`
    pub fn recreate<D: GpuDevice>(
        &mut self,
        device: &D,
        uploads: &UploadCommands,
        tracker: &mut ImageStateTracker,
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        self.destroy(device, tracker);
        *self = Self::create(device, uploads, tracker, extent)?;
        Ok(())
    }

    /// Image handle
    pub fn image(&self) -> Option<vk::Image> {
        self.allocation.map(|allocation| allocation.image)
    }

    /// View handle
    pub fn view(&self) -> Option<vk::ImageView> {
        self.allocation.map(|allocation| allocation.view)
    }

    /// Current extent
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.allocation.map(|allocation| allocation.extent)
    }

    /// Destroy image, view and memory
    pub fn destroy<D: GpuDevice>(&mut self, device: &D, tracker: &mut ImageStateTracker) {
        if let Some(allocation) = self.allocation.take() {
            tracker.forget(allocation.image);
            device.destroy_image(&allocation);
        }
    }
}
