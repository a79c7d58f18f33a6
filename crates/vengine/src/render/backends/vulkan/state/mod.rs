// Vulkan state management

pub mod depth;
pub mod image_state;
pub mod swapchain;
pub mod sync;
