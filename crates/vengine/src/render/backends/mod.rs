//! Rendering backend implementations
//!
//! [`gpu::GpuDevice`] is the seam between the render core and the native API.
//! The Vulkan context implements it for real hardware; [`mock::RecordingDevice`]
//! implements it by recording calls so the frame and resource logic can be
//! exercised without a GPU.

pub mod gpu;
pub mod mock;
pub mod vulkan;

pub use gpu::GpuDevice;
