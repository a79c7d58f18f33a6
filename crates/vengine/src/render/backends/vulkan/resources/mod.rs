//! Vulkan resource management
//!
//! Buffer handles, the resource factory that creates and uploads them, and
//! the per-frame uniform blocks.

/// Vertex, index and uniform buffer handles
pub mod buffer;

/// Buffer creation, staging uploads and single-time commands
pub mod factory;

/// Per-frame uniform buffers and descriptor sets
pub mod uniforms;
