//! Physical device inventory
//!
//! Enumerates every physical device once, captures what selection needs to
//! know about it in a [`PhysicalDeviceRecord`], and picks the best one with a
//! weighted score:
//!
//! | criterion                                        | points |
//! |--------------------------------------------------|--------|
//! | each scored feature bit (see [`DeviceFeatures`]) | 1000   |
//! | discrete GPU                                     | 10000  |
//! | complete queue family assignment                 | 10000  |
//! | non-empty surface formats and present modes      | 10000  |
//!
//! A device without geometry shaders, or missing a required extension, scores 0.
//! Ties go to the first device enumerated.

use ash::extensions::khr::Surface;
use ash::{vk, Instance};
use bitflags::bitflags;
use std::collections::BTreeSet;
use std::ffi::CStr;

use crate::render::backends::gpu::QueueRole;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Points per scored feature bit
pub const FEATURE_SCORE: u32 = 1000;
/// Points for a discrete GPU
pub const DISCRETE_GPU_SCORE: u32 = 10000;
/// Points for a complete queue family assignment
pub const COMPLETE_QUEUES_SCORE: u32 = 10000;
/// Points for usable surface formats and present modes
pub const SWAPCHAIN_SUPPORT_SCORE: u32 = 10000;

bitflags! {
    /// Device features the renderer scores or enables, grouped by API tier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        /// Core: geometry shaders
        const GEOMETRY_SHADER = 1 << 0;
        /// 1.2: min/max sampler reduction
        const SAMPLER_FILTER_MINMAX = 1 << 1;
        /// 1.2: buffer device address capture/replay
        const BUFFER_DEVICE_ADDRESS_CAPTURE_REPLAY = 1 << 2;
        /// 1.3: dynamic rendering
        const DYNAMIC_RENDERING = 1 << 3;
        /// 1.3: synchronization2
        const SYNCHRONIZATION_2 = 1 << 4;
        /// 1.3: maintenance4
        const MAINTENANCE_4 = 1 << 5;
        /// 1.3: pipeline creation cache control
        const PIPELINE_CREATION_CACHE_CONTROL = 1 << 6;
        /// 1.3: demote to helper invocation
        const SHADER_DEMOTE_TO_HELPER_INVOCATION = 1 << 7;
        /// 1.3: terminate invocation
        const SHADER_TERMINATE_INVOCATION = 1 << 8;

        /// Every 1.2-tier bit
        const VULKAN_1_2 = Self::SAMPLER_FILTER_MINMAX.bits()
            | Self::BUFFER_DEVICE_ADDRESS_CAPTURE_REPLAY.bits();
        /// Every 1.3-tier bit
        const VULKAN_1_3 = Self::DYNAMIC_RENDERING.bits()
            | Self::SYNCHRONIZATION_2.bits()
            | Self::MAINTENANCE_4.bits()
            | Self::PIPELINE_CREATION_CACHE_CONTROL.bits()
            | Self::SHADER_DEMOTE_TO_HELPER_INVOCATION.bits()
            | Self::SHADER_TERMINATE_INVOCATION.bits();
        /// Bits that earn points during selection
        const SCORED = Self::GEOMETRY_SHADER.bits()
            | Self::VULKAN_1_2.bits()
            | Self::VULKAN_1_3.bits();
        /// Bits the renderer cannot run without
        const REQUIRED = Self::DYNAMIC_RENDERING.bits() | Self::SYNCHRONIZATION_2.bits();
        /// Bits enabled when the device reports them
        const OPTIONAL = Self::MAINTENANCE_4.bits() | Self::PIPELINE_CREATION_CACHE_CONTROL.bits();
    }
}

/// Capabilities of one queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    /// Operation classes supported by the family
    pub flags: vk::QueueFlags,
    /// Number of queues in the family
    pub queue_count: u32,
    /// Whether the family can present to the target surface
    pub present: bool,
}

/// Queue family index per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    /// Graphics family
    pub graphics: Option<u32>,
    /// Present family
    pub present: Option<u32>,
    /// Transfer family
    pub transfer: Option<u32>,
    /// Compute family
    pub compute: Option<u32>,
}

impl QueueFamilyAssignment {
    /// Assign families to roles.
    ///
    /// Graphics takes the first graphics family. Present prefers the graphics
    /// family, then the first presenting family. Transfer and compute prefer a
    /// dedicated family (no graphics bit) and fall back to a shared one; a
    /// graphics family always accepts transfer work.
    pub fn assign(families: &[QueueFamilyCaps]) -> Self {
        let indexed = || families.iter().enumerate().map(|(index, caps)| (index as u32, caps));

        let graphics = indexed()
            .find(|(_, caps)| caps.flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(index, _)| index);

        let present = graphics
            .filter(|&index| families[index as usize].present)
            .or_else(|| indexed().find(|(_, caps)| caps.present).map(|(index, _)| index));

        let dedicated = |flag: vk::QueueFlags| {
            indexed()
                .find(|(_, caps)| {
                    caps.flags.contains(flag) && !caps.flags.contains(vk::QueueFlags::GRAPHICS)
                })
                .map(|(index, _)| index)
        };

        let transfer = dedicated(vk::QueueFlags::TRANSFER).or(graphics);

        let compute = dedicated(vk::QueueFlags::COMPUTE).or_else(|| {
            indexed()
                .find(|(_, caps)| caps.flags.contains(vk::QueueFlags::COMPUTE))
                .map(|(index, _)| index)
        });

        Self {
            graphics,
            present,
            transfer,
            compute,
        }
    }

    /// Graphics, present and transfer are all assigned
    pub const fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some() && self.transfer.is_some()
    }

    /// Family serving `role`
    pub const fn family(&self, role: QueueRole) -> Option<u32> {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Transfer => self.transfer,
            QueueRole::Compute => self.compute,
        }
    }

    /// Distinct assigned families, ascending
    pub fn unique_families(&self) -> Vec<u32> {
        let families: BTreeSet<u32> = [self.graphics, self.present, self.transfer, self.compute]
            .into_iter()
            .flatten()
            .collect();
        families.into_iter().collect()
    }

    /// Families that must share an image or buffer used by both `a` and `b`.
    ///
    /// Empty when they coincide (exclusive sharing), otherwise both indices
    /// (concurrent sharing).
    pub fn sharing_between(&self, a: QueueRole, b: QueueRole) -> Vec<u32> {
        match (self.family(a), self.family(b)) {
            (Some(first), Some(second)) if first != second => vec![first, second],
            _ => Vec::new(),
        }
    }
}

/// Surface capabilities, formats and present modes for one device
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    /// Surface capabilities
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    /// Query surface support of `device` for `surface`
    pub fn query(
        surface_loader: &Surface,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VulkanResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(device, surface)
                    .map_err(VulkanError::Api)?,
                formats: surface_loader
                    .get_physical_device_surface_formats(device, surface)
                    .map_err(VulkanError::Api)?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(device, surface)
                    .map_err(VulkanError::Api)?,
            })
        }
    }

    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Everything selection needs to know about one physical device
#[derive(Debug, Clone)]
pub struct PhysicalDeviceRecord {
    /// Native handle
    pub handle: vk::PhysicalDevice,
    /// Driver-reported device name
    pub name: String,
    /// Device type
    pub device_type: vk::PhysicalDeviceType,
    /// Supported features
    pub features: DeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Per-family capabilities, in family index order
    pub queue_families: Vec<QueueFamilyCaps>,
    /// Role assignment derived from `queue_families`
    pub queues: QueueFamilyAssignment,
    /// Surface support for the target surface
    pub swapchain_support: SwapchainSupport,
    /// Supported device extension names
    pub extensions: BTreeSet<String>,
}

impl PhysicalDeviceRecord {
    /// Whether every extension in `required` is supported
    pub fn supports_extensions<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|name| self.extensions.contains(name.as_ref()))
    }

    /// Selection score against `required` extensions
    pub fn score<S: AsRef<str>>(&self, required: &[S]) -> u32 {
        if !self.features.contains(DeviceFeatures::GEOMETRY_SHADER)
            || !self.supports_extensions(required)
        {
            return 0;
        }

        let scored = self.features & DeviceFeatures::SCORED;
        let mut score = FEATURE_SCORE * scored.bits().count_ones();

        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += DISCRETE_GPU_SCORE;
        }
        if self.queues.is_complete() {
            score += COMPLETE_QUEUES_SCORE;
        }
        if self.swapchain_support.is_adequate() {
            score += SWAPCHAIN_SUPPORT_SCORE;
        }

        score
    }

    fn query(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let features = Self::query_features(instance, device);
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

        let family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut queue_families = Vec::with_capacity(family_properties.len());
        for (index, family) in family_properties.iter().enumerate() {
            let present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index as u32, surface)
                    .map_err(VulkanError::Api)?
            };
            queue_families.push(QueueFamilyCaps {
                flags: family.queue_flags,
                queue_count: family.queue_count,
                present,
            });
        }

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        }
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();

        Ok(Self {
            handle: device,
            name,
            device_type: properties.device_type,
            features,
            memory_properties,
            queues: QueueFamilyAssignment::assign(&queue_families),
            queue_families,
            swapchain_support: SwapchainSupport::query(surface_loader, device, surface)?,
            extensions,
        })
    }

    fn query_features(instance: &Instance, device: vk::PhysicalDevice) -> DeviceFeatures {
        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
        let core = {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut vulkan_12)
                .push_next(&mut vulkan_13);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
            features2.features
        };

        let mut features = DeviceFeatures::empty();
        let bits = [
            (core.geometry_shader, DeviceFeatures::GEOMETRY_SHADER),
            (vulkan_12.sampler_filter_minmax, DeviceFeatures::SAMPLER_FILTER_MINMAX),
            (
                vulkan_12.buffer_device_address_capture_replay,
                DeviceFeatures::BUFFER_DEVICE_ADDRESS_CAPTURE_REPLAY,
            ),
            (vulkan_13.dynamic_rendering, DeviceFeatures::DYNAMIC_RENDERING),
            (vulkan_13.synchronization2, DeviceFeatures::SYNCHRONIZATION_2),
            (vulkan_13.maintenance4, DeviceFeatures::MAINTENANCE_4),
            (
                vulkan_13.pipeline_creation_cache_control,
                DeviceFeatures::PIPELINE_CREATION_CACHE_CONTROL,
            ),
            (
                vulkan_13.shader_demote_to_helper_invocation,
                DeviceFeatures::SHADER_DEMOTE_TO_HELPER_INVOCATION,
            ),
            (
                vulkan_13.shader_terminate_invocation,
                DeviceFeatures::SHADER_TERMINATE_INVOCATION,
            ),
        ];
        for (supported, flag) in bits {
            features.set(flag, supported == vk::TRUE);
        }
        features
    }
}

/// The winner of device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedDevice {
    /// Index into the inventory's records
    pub index: usize,
    /// Winning score; 0 means no device met the hard requirements
    pub score: u32,
}

/// All physical devices visible to the instance
#[derive(Debug, Clone, Default)]
pub struct PhysicalDeviceInventory {
    records: Vec<PhysicalDeviceRecord>,
}

impl PhysicalDeviceInventory {
    /// Enumerate and query every physical device against `surface`
    pub fn enumerate(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        let records = devices
            .into_iter()
            .map(|device| PhysicalDeviceRecord::query(instance, device, surface_loader, surface))
            .collect::<VulkanResult<Vec<_>>>()?;

        for record in &records {
            log::debug!(
                "Found GPU '{}' ({:?}), features {:?}, queues {:?}",
                record.name,
                record.device_type,
                record.features,
                record.queues
            );
        }

        Ok(Self { records })
    }

    /// Build an inventory from already-captured records
    pub const fn from_records(records: Vec<PhysicalDeviceRecord>) -> Self {
        Self { records }
    }

    /// Records in enumeration order
    pub fn records(&self) -> &[PhysicalDeviceRecord] {
        &self.records
    }

    /// Record at `index`
    pub fn record(&self, index: usize) -> Option<&PhysicalDeviceRecord> {
        self.records.get(index)
    }

    /// Pick the highest-scoring device; the first one wins ties.
    ///
    /// Fails only when no device was enumerated. A zero winning score is
    /// returned as-is for the caller to judge.
    pub fn select_best<S: AsRef<str>>(
        &self,
        required_extensions: &[S],
    ) -> VulkanResult<SelectedDevice> {
        let mut best: Option<SelectedDevice> = None;
        for (index, record) in self.records.iter().enumerate() {
            let score = record.score(required_extensions);
            log::debug!("GPU '{}' scored {}", record.name, score);
            if best.map_or(true, |current| score > current.score) {
                best = Some(SelectedDevice { index, score });
            }
        }

        best.ok_or(VulkanError::NoPhysicalDevices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWAPCHAIN: &str = "VK_KHR_swapchain";

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count: 1,
            present,
        }
    }

    fn record(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        features: DeviceFeatures,
    ) -> PhysicalDeviceRecord {
        let queue_families = vec![family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            true,
        )];
        PhysicalDeviceRecord {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type,
            features,
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queues: QueueFamilyAssignment::assign(&queue_families),
            queue_families,
            swapchain_support: SwapchainSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR::default()],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
            extensions: [SWAPCHAIN.to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_score_components() {
        let device = record(
            "discrete",
            vk::PhysicalDeviceType::DISCRETE_GPU,
            DeviceFeatures::GEOMETRY_SHADER | DeviceFeatures::DYNAMIC_RENDERING,
        );
        assert_eq!(device.score(&[SWAPCHAIN]), 2 * FEATURE_SCORE + 30000);

        let device =
            record("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, DeviceFeatures::SCORED);
        assert_eq!(device.score(&[SWAPCHAIN]), 9 * FEATURE_SCORE + 20000);
    }

    #[test]
    fn test_disqualifiers_score_zero() {
        let no_geometry =
            record("no-gs", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::VULKAN_1_3);
        assert_eq!(no_geometry.score(&[SWAPCHAIN]), 0);

        let missing_extension =
            record("no-ext", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::SCORED);
        assert_eq!(missing_extension.score(&[SWAPCHAIN, "VK_EXT_mesh_shader"]), 0);
    }

    #[test]
    fn test_select_best_picks_highest() {
        let inventory = PhysicalDeviceInventory::from_records(vec![
            record(
                "integrated",
                vk::PhysicalDeviceType::INTEGRATED_GPU,
                DeviceFeatures::GEOMETRY_SHADER,
            ),
            record(
                "discrete",
                vk::PhysicalDeviceType::DISCRETE_GPU,
                DeviceFeatures::GEOMETRY_SHADER,
            ),
            record("no-gs", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::VULKAN_1_3),
        ]);
        let selected = inventory.select_best(&[SWAPCHAIN]).unwrap();
        assert_eq!(selected.index, 1);
        assert_eq!(selected.score, FEATURE_SCORE + 30000);
    }

    #[test]
    fn test_select_best_ties_resolve_to_first() {
        let inventory = PhysicalDeviceInventory::from_records(vec![
            record("first", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::GEOMETRY_SHADER),
            record("second", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::GEOMETRY_SHADER),
        ]);
        assert_eq!(inventory.select_best(&[SWAPCHAIN]).unwrap().index, 0);
    }

    #[test]
    fn test_select_best_all_insufficient_reports_zero() {
        let inventory = PhysicalDeviceInventory::from_records(vec![
            record("a", vk::PhysicalDeviceType::DISCRETE_GPU, DeviceFeatures::VULKAN_1_3),
            record("b", vk::PhysicalDeviceType::INTEGRATED_GPU, DeviceFeatures::empty()),
        ]);
        let selected = inventory.select_best(&[SWAPCHAIN]).unwrap();
        assert_eq!(selected.score, 0);
        assert_eq!(selected.index, 0);
    }

    #[test]
    fn test_select_best_empty_is_fatal() {
        let inventory = PhysicalDeviceInventory::default();
        assert!(matches!(inventory.select_best(&[SWAPCHAIN]), Err(VulkanError::NoPhysicalDevices)));
    }

    #[test]
    fn test_queue_assignment_prefers_dedicated_transfer() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let queues = QueueFamilyAssignment::assign(&families);
        assert_eq!(queues.graphics, Some(0));
        assert_eq!(queues.present, Some(0));
        assert_eq!(queues.transfer, Some(1));
        assert_eq!(queues.compute, Some(1));
        assert!(queues.is_complete());
        assert_eq!(queues.unique_families(), vec![0, 1]);
    }

    #[test]
    fn test_queue_assignment_separate_present_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let queues = QueueFamilyAssignment::assign(&families);
        assert_eq!(queues.graphics, Some(0));
        assert_eq!(queues.present, Some(1));
        assert_eq!(queues.transfer, Some(0));
        assert_eq!(queues.sharing_between(QueueRole::Graphics, QueueRole::Present), vec![0, 1]);
        assert!(queues.sharing_between(QueueRole::Graphics, QueueRole::Transfer).is_empty());
    }

    #[test]
    fn test_queue_assignment_incomplete_without_present() {
        let families = [family(vk::QueueFlags::GRAPHICS, false)];
        let queues = QueueFamilyAssignment::assign(&families);
        assert!(!queues.is_complete());
        assert_eq!(queues.transfer, Some(0));
    }
}
