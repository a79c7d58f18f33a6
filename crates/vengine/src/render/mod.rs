//! Rendering system
//!
//! `api` is the backend-neutral surface the application layer programs against;
//! `backends` holds the native device seam, the Vulkan implementation of the
//! core and a recording device for tests.

pub mod api;
pub mod backends;

use thiserror::Error;

use crate::config::ConfigError;
use crate::render::backends::vulkan::VulkanError;

/// Rendering system errors
///
/// Every variant is fatal for the step that produced it. Swapchain staleness is
/// recovered inside the frame protocol and never shows up here.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Renderer initialization failed during setup
    #[error("Renderer initialization failed: {0}")]
    InitializationFailed(String),

    /// A frame operation failed during execution
    #[error("Rendering failed: {0}")]
    RenderingFailed(String),

    /// Buffer or image creation failed
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// Backend error with no more specific category
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<VulkanError> for RenderError {
    fn from(error: VulkanError) -> Self {
        match error {
            VulkanError::Loading(_)
            | VulkanError::MissingLayer(_)
            | VulkanError::MissingInstanceExtension(_)
            | VulkanError::NoPhysicalDevices
            | VulkanError::NoSuitableDevice { .. }
            | VulkanError::MissingDeviceFeatures(_)
            | VulkanError::IncompleteQueueFamilies
            | VulkanError::Shader { .. }
            | VulkanError::InitializationFailed(_) => Self::InitializationFailed(error.to_string()),
            VulkanError::OutOfMemory { .. } => Self::ResourceCreationFailed(error.to_string()),
            VulkanError::Api(_) | VulkanError::InvalidOperation { .. } => {
                Self::BackendError(error.to_string())
            }
        }
    }
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
