//! Vulkan instance bootstrap
//!
//! Loads the Vulkan library, checks every requested layer and instance
//! extension against what the loader reports, creates a 1.3 instance and, when
//! validation is on, a debug messenger that forwards validation output to `log`.

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Khronos validation layer name
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

const ENGINE_NAME: &str = "VEngine";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (validation only)
    debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (validation only)
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create an instance for `app_name` with the window's required extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window_extensions: &[String],
    ) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;

        let mut extension_names: Vec<String> = window_extensions.to_vec();
        let mut layer_names: Vec<String> = Vec::new();
        if enable_validation {
            extension_names.push(DebugUtils::name().to_string_lossy().into_owned());
            layer_names.push(VALIDATION_LAYER.to_string());
        }

        Self::check_layers(&entry, &layer_names)?;
        Self::check_extensions(&entry, &extension_names)?;

        let app_name_cstr = to_cstring(app_name)?;
        let engine_name_cstr = to_cstring(ENGINE_NAME)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let extension_cstrs = extension_names
            .iter()
            .map(|name| to_cstring(name))
            .collect::<VulkanResult<Vec<_>>>()?;
        let layer_cstrs =
            layer_names.iter().map(|name| to_cstring(name)).collect::<VulkanResult<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> =
            extension_cstrs.iter().map(|name| name.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = layer_cstrs.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance =
            unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };

        log::info!(
            "Created Vulkan 1.3 instance for '{}' (validation {})",
            app_name,
            if enable_validation { "on" } else { "off" }
        );

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    /// Whether the debug messenger is active
    pub const fn has_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }

    fn check_layers(entry: &Entry, requested: &[String]) -> VulkanResult<()> {
        if requested.is_empty() {
            return Ok(());
        }

        let available: HashSet<String> = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?
            .iter()
            .map(|layer| {
                unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        match first_missing(requested, &available) {
            Some(missing) => Err(VulkanError::MissingLayer(missing.to_string())),
            None => Ok(()),
        }
    }

    fn check_extensions(entry: &Entry, requested: &[String]) -> VulkanResult<()> {
        let available: HashSet<String> = entry
            .enumerate_instance_extension_properties(None)
            .map_err(VulkanError::Api)?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        match first_missing(requested, &available) {
            Some(missing) => Err(VulkanError::MissingInstanceExtension(missing.to_string())),
            None => Ok(()),
        }
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, self.debug_messenger.take())
            {
                debug_utils.destroy_debug_utils_messenger(debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn to_cstring(name: &str) -> VulkanResult<CString> {
    CString::new(name).map_err(|_| {
        VulkanError::InitializationFailed(format!("Name contains a NUL byte: {name:?}"))
    })
}

fn first_missing<'a>(requested: &'a [String], available: &HashSet<String>) -> Option<&'a str> {
    requested
        .iter()
        .find(|name| !available.contains(name.as_str()))
        .map(String::as_str)
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_missing_reports_first_absent_name() {
        let available: HashSet<String> = ["VK_KHR_surface", "VK_KHR_xcb_surface"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let requested = vec![
            "VK_KHR_surface".to_string(),
            "VK_EXT_debug_utils".to_string(),
            "VK_KHR_wayland_surface".to_string(),
        ];
        assert_eq!(first_missing(&requested, &available), Some("VK_EXT_debug_utils"));
        assert_eq!(first_missing(&requested[..1], &available), None);
    }

    #[test]
    fn test_to_cstring_rejects_interior_nul() {
        assert!(to_cstring("VEngine").is_ok());
        assert!(matches!(to_cstring("bad\0name"), Err(VulkanError::InitializationFailed(_))));
    }
}
