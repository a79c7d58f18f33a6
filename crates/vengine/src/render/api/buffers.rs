//! Buffer descriptors consumed by the resource factory

use bytemuck::Pod;

/// How often the contents of a buffer change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Written once at creation, device-local afterwards
    Static,
    /// Rewritten occasionally through a persistent mapping
    Dynamic,
    /// Rewritten every frame through a persistent mapping
    Stream,
}

impl BufferUsage {
    /// Whether the buffer lives in host-visible, persistently mapped memory
    pub const fn is_host_mapped(self) -> bool {
        matches!(self, Self::Dynamic | Self::Stream)
    }
}

/// Width of a single index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    /// 8-bit indices
    U8,
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
    /// 64-bit indices
    U64,
}

impl IndexWidth {
    /// Size of one index in bytes
    pub const fn size_in_bytes(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Description of a vertex buffer to create
#[derive(Debug, Clone, Copy)]
pub struct VertexBufferDesc<'a> {
    /// Initial contents; may be empty for mapped buffers filled later
    pub data: &'a [u8],
    /// Size of the buffer in bytes
    pub size_in_bytes: u64,
    /// Number of vertices
    pub element_count: u32,
    /// Usage class
    pub usage: BufferUsage,
}

impl<'a> VertexBufferDesc<'a> {
    /// Describe a buffer holding exactly `vertices`
    pub fn from_slice<T: Pod>(vertices: &'a [T], usage: BufferUsage) -> Self {
        let data: &[u8] = bytemuck::cast_slice(vertices);
        Self {
            data,
            size_in_bytes: data.len() as u64,
            element_count: vertices.len() as u32,
            usage,
        }
    }

    /// Describe an empty mapped buffer of `size_in_bytes` to be filled with `upload_data`
    pub const fn empty(size_in_bytes: u64, element_count: u32, usage: BufferUsage) -> Self {
        Self {
            data: &[],
            size_in_bytes,
            element_count,
            usage,
        }
    }
}

/// Description of an index buffer to create
#[derive(Debug, Clone, Copy)]
pub struct IndexBufferDesc<'a> {
    /// Initial contents; may be empty for mapped buffers filled later
    pub data: &'a [u8],
    /// Size of the buffer in bytes
    pub size_in_bytes: u64,
    /// Number of indices
    pub element_count: u32,
    /// Usage class
    pub usage: BufferUsage,
    /// Width of one index
    pub index_width: IndexWidth,
}

impl<'a> IndexBufferDesc<'a> {
    /// Describe a buffer of 16-bit indices
    pub fn from_u16(indices: &'a [u16], usage: BufferUsage) -> Self {
        Self::from_indices(indices, usage, IndexWidth::U16)
    }

    /// Describe a buffer of 32-bit indices
    pub fn from_u32(indices: &'a [u32], usage: BufferUsage) -> Self {
        Self::from_indices(indices, usage, IndexWidth::U32)
    }

    fn from_indices<T: Pod>(indices: &'a [T], usage: BufferUsage, index_width: IndexWidth) -> Self {
        let data: &[u8] = bytemuck::cast_slice(indices);
        Self {
            data,
            size_in_bytes: data.len() as u64,
            element_count: indices.len() as u32,
            usage,
            index_width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_desc_from_slice() {
        let vertices = [[0.0f32, 1.0, 2.0], [3.0, 4.0, 5.0]];
        let desc = VertexBufferDesc::from_slice(&vertices, BufferUsage::Static);
        assert_eq!(desc.size_in_bytes, 24);
        assert_eq!(desc.element_count, 2);
        assert_eq!(desc.data.len(), 24);
    }

    #[test]
    fn test_index_desc_sizes() {
        let desc = IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static);
        assert_eq!(desc.size_in_bytes, 6);
        assert_eq!(desc.element_count, 3);
        assert_eq!(desc.index_width, IndexWidth::U16);

        let desc = IndexBufferDesc::from_u32(&[0, 1, 2, 2, 3, 0], BufferUsage::Dynamic);
        assert_eq!(desc.size_in_bytes, 24);
        assert_eq!(IndexWidth::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_mapped_usage_classes() {
        assert!(!BufferUsage::Static.is_host_mapped());
        assert!(BufferUsage::Dynamic.is_host_mapped());
        assert!(BufferUsage::Stream.is_host_mapped());
    }
}
