//! Vulkan backend implementation
//!
//! Organized into initialization, state, rendering and resources modules, with
//! the [`VulkanRenderer`] facade on top.

/// Instance, physical/logical device and the native device context
pub mod initialization;

/// Swapchain, frame pacing, image layouts and the depth target
pub mod state;

/// Frame command recording and the graphics pipeline
pub mod rendering;

/// Buffers, the resource factory and per-frame uniforms
pub mod resources;

/// Renderer facade
pub mod renderer;

pub use renderer::VulkanRenderer;

pub use initialization::context::{VulkanContext, VulkanError, VulkanResult};
pub use initialization::instance::VulkanInstance;
pub use initialization::logical_device::{required_device_extensions, LogicalDevice};
pub use initialization::physical_device::{
    DeviceFeatures, PhysicalDeviceInventory, PhysicalDeviceRecord, QueueFamilyAssignment,
    QueueFamilyCaps, SelectedDevice, SwapchainSupport,
};

pub use rendering::commands::{CommandSubmissionPipeline, UploadCommands};
pub use rendering::pipeline::{GraphicsPipeline, ShaderBlob};

pub use resources::buffer::{GpuBuffer, IndexBuffer, UniformBuffer, VertexBuffer};
pub use resources::factory::ResourceFactory;
pub use resources::uniforms::UniformRing;

pub use state::depth::DepthTarget;
pub use state::image_state::{ImageState, ImageStateTracker};
pub use state::swapchain::{SwapchainManager, SwapchainState};
pub use state::sync::{FrameSlot, FrameSyncController, SlotState};
