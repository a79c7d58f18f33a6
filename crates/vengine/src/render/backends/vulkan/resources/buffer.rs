//! Buffer handles returned by the resource factory
//!
//! These are plain handles: the memory behind them is owned by the device and
//! released through the factory's `delete_*` calls, or reported and reclaimed
//! when the renderer terminates. They are deliberately not `Clone`.

use ash::vk;

use crate::render::api::{BufferUsage, IndexWidth};
use crate::render::backends::gpu::{BufferAllocation, MemoryLocation};

/// Buffer wrapper carrying what the draw path needs to know
#[derive(Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    allocation: BufferAllocation,
    element_count: u32,
    usage: BufferUsage,
}

impl GpuBuffer {
    pub(crate) const fn new(
        allocation: BufferAllocation,
        element_count: u32,
        usage: BufferUsage,
    ) -> Self {
        Self {
            allocation,
            element_count,
            usage,
        }
    }

    /// Get buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.allocation.buffer
    }

    /// Get size
    pub const fn size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    /// Number of elements (vertices, indices or 1 for uniforms)
    pub const fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Usage class
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory placement
    pub const fn location(&self) -> MemoryLocation {
        self.allocation.location
    }
}

/// Vertex buffer specifically for vertex data
#[derive(Debug, PartialEq, Eq)]
pub struct VertexBuffer {
    buffer: GpuBuffer,
}

impl VertexBuffer {
    pub(crate) const fn new(buffer: GpuBuffer) -> Self {
        Self { buffer }
    }

    pub(crate) fn into_inner(self) -> GpuBuffer {
        self.buffer
    }

    /// Number of vertices
    pub const fn vertex_count(&self) -> u32 {
        self.buffer.element_count
    }
}

/// Index buffer for indexed rendering
#[derive(Debug, PartialEq, Eq)]
pub struct IndexBuffer {
    buffer: GpuBuffer,
    index_width: IndexWidth,
}

impl IndexBuffer {
    pub(crate) const fn new(buffer: GpuBuffer, index_width: IndexWidth) -> Self {
        Self { buffer, index_width }
    }

    pub(crate) fn into_inner(self) -> GpuBuffer {
        self.buffer
    }

    /// Number of indices
    pub const fn index_count(&self) -> u32 {
        self.buffer.element_count
    }

    /// Width of one index
    pub const fn index_width(&self) -> IndexWidth {
        self.index_width
    }

    /// Native index type; only 16 and 32-bit buffers are ever created
    pub const fn index_type(&self) -> vk::IndexType {
        match self.index_width {
            IndexWidth::U16 => vk::IndexType::UINT16,
            _ => vk::IndexType::UINT32,
        }
    }
}

/// Persistently mapped uniform buffer
#[derive(Debug, PartialEq, Eq)]
pub struct UniformBuffer {
    buffer: GpuBuffer,
}

impl UniformBuffer {
    pub(crate) const fn new(buffer: GpuBuffer) -> Self {
        Self { buffer }
    }

    pub(crate) fn into_inner(self) -> GpuBuffer {
        self.buffer
    }
}

impl AsRef<GpuBuffer> for GpuBuffer {
    fn as_ref(&self) -> &GpuBuffer {
        self
    }
}

impl AsRef<GpuBuffer> for VertexBuffer {
    fn as_ref(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl AsRef<GpuBuffer> for IndexBuffer {
    fn as_ref(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl AsRef<GpuBuffer> for UniformBuffer {
    fn as_ref(&self) -> &GpuBuffer {
        &self.buffer
    }
}
