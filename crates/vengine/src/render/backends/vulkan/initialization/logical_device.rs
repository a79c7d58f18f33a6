//! Logical device creation
//!
//! One queue per unique family at priority 1.0; each role then reads the queue
//! of its family. Features are enabled explicitly: dynamic rendering and
//! synchronization2 are required, maintenance4 and pipeline creation cache
//! control are switched on only when the device reports them.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device, Instance};
use std::ffi::{c_char, CString};

use crate::render::backends::gpu::QueueRole;
use crate::render::backends::vulkan::{
    DeviceFeatures, PhysicalDeviceRecord, QueueFamilyAssignment, VulkanError, VulkanResult,
};

/// Swapchain extension followed by `extra`, without duplicates
pub fn required_device_extensions(extra: &[String]) -> Vec<String> {
    let mut extensions = vec![SwapchainLoader::name().to_string_lossy().into_owned()];
    for name in extra {
        if !extensions.contains(name) {
            extensions.push(name.clone());
        }
    }
    extensions
}

/// Features to enable on a device reporting `supported`
pub fn features_to_enable(supported: DeviceFeatures) -> VulkanResult<DeviceFeatures> {
    let missing = DeviceFeatures::REQUIRED - supported;
    if !missing.is_empty() {
        return Err(VulkanError::MissingDeviceFeatures(format!("{missing:?}")));
    }

    Ok(DeviceFeatures::REQUIRED | (supported & DeviceFeatures::OPTIONAL))
}

/// Queue handle per role
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueues {
    /// Graphics queue
    pub graphics: vk::Queue,
    /// Present queue
    pub present: vk::Queue,
    /// Transfer queue
    pub transfer: vk::Queue,
    /// Compute queue, when the device has a compute family
    pub compute: Option<vk::Queue>,
}

/// Logical device plus its queues; destroyed explicitly by the owning context
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue handles
    pub queues: DeviceQueues,
    /// Family index per role
    pub families: QueueFamilyAssignment,
    /// Features enabled at creation
    pub enabled_features: DeviceFeatures,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create the device for `physical_device` with `extensions` enabled
    pub fn new(
        instance: &Instance,
        physical_device: &PhysicalDeviceRecord,
        extensions: &[String],
    ) -> VulkanResult<Self> {
        let families = physical_device.queues;
        let (Some(graphics_family), Some(present_family), Some(transfer_family)) =
            (families.graphics, families.present, families.transfer)
        else {
            return Err(VulkanError::IncompleteQueueFamilies);
        };

        let enabled_features = features_to_enable(physical_device.features)?;

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_cstrs = extensions
            .iter()
            .map(|name| {
                CString::new(name.as_str()).map_err(|_| {
                    VulkanError::InitializationFailed(format!("Invalid extension name: {name:?}"))
                })
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> =
            extension_cstrs.iter().map(|name| name.as_ptr()).collect();

        let core_features = vk::PhysicalDeviceFeatures::builder()
            .geometry_shader(physical_device.features.contains(DeviceFeatures::GEOMETRY_SHADER))
            .build();

        let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true)
            .maintenance4(enabled_features.contains(DeviceFeatures::MAINTENANCE_4))
            .pipeline_creation_cache_control(
                enabled_features.contains(DeviceFeatures::PIPELINE_CREATION_CACHE_CONTROL),
            );

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&core_features)
            .push_next(&mut vulkan_13);

        let device = unsafe {
            instance
                .create_device(physical_device.handle, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let queues = unsafe {
            DeviceQueues {
                graphics: device.get_device_queue(graphics_family, 0),
                present: device.get_device_queue(present_family, 0),
                transfer: device.get_device_queue(transfer_family, 0),
                compute: families.compute.map(|family| device.get_device_queue(family, 0)),
            }
        };

        let swapchain_loader = SwapchainLoader::new(instance, &device);

        log::info!(
            "Created logical device on '{}' with families {:?}, features {:?}",
            physical_device.name,
            families,
            enabled_features
        );

        Ok(Self {
            device,
            queues,
            families,
            enabled_features,
            swapchain_loader,
        })
    }

    /// Destroy the device. Every child object must already be gone and the
    /// device must not be used afterwards.
    pub fn destroy(&self) {
        unsafe {
            self.device.destroy_device(None);
        }
    }

    /// Queue serving `role`
    pub fn queue(&self, role: QueueRole) -> VulkanResult<vk::Queue> {
        match role {
            QueueRole::Graphics => Ok(self.queues.graphics),
            QueueRole::Present => Ok(self.queues.present),
            QueueRole::Transfer => Ok(self.queues.transfer),
            QueueRole::Compute => self.queues.compute.ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Device has no compute queue family".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_extensions_start_with_swapchain() {
        let extensions = required_device_extensions(&[
            "VK_EXT_memory_budget".to_string(),
            "VK_KHR_swapchain".to_string(),
        ]);
        assert_eq!(
            extensions,
            vec!["VK_KHR_swapchain".to_string(), "VK_EXT_memory_budget".to_string()]
        );
    }

    #[test]
    fn test_features_to_enable_requires_dynamic_rendering_and_sync2() {
        let missing =
            features_to_enable(DeviceFeatures::GEOMETRY_SHADER | DeviceFeatures::DYNAMIC_RENDERING);
        assert!(matches!(missing, Err(VulkanError::MissingDeviceFeatures(_))));

        let enabled = features_to_enable(DeviceFeatures::REQUIRED).unwrap();
        assert_eq!(enabled, DeviceFeatures::REQUIRED);
    }

    #[test]
    fn test_features_to_enable_adds_only_reported_optionals() {
        let enabled = features_to_enable(
            DeviceFeatures::SCORED - DeviceFeatures::PIPELINE_CREATION_CACHE_CONTROL,
        )
        .unwrap();
        assert!(enabled.contains(DeviceFeatures::MAINTENANCE_4));
        assert!(!enabled.contains(DeviceFeatures::PIPELINE_CREATION_CACHE_CONTROL));
        assert!(!enabled.contains(DeviceFeatures::SAMPLER_FILTER_MINMAX));
        assert!(!enabled.contains(DeviceFeatures::GEOMETRY_SHADER));
    }
}
