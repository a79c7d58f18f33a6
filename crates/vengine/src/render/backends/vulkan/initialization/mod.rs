// Vulkan initialization components

pub mod context;
pub mod instance;
pub mod logical_device;
pub mod physical_device;
