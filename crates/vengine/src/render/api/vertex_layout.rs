//! Vertex input layout description
//!
//! Attributes live in a single interleaved binding (binding 0). Locations are
//! assigned in declaration order and offsets are packed without padding, so the
//! Rust vertex struct must be `#[repr(C)]` with fields in the same order.

use ash::vk;
use serde::{Deserialize, Serialize};

/// Scalar/vector type of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderDataType {
    /// `float`
    Float,
    /// `vec2`
    Float2,
    /// `vec3`
    Float3,
    /// `vec4`
    Float4,
    /// `int`
    Int,
    /// `ivec2`
    Int2,
    /// `ivec3`
    Int3,
    /// `ivec4`
    Int4,
    /// `uint`
    UInt,
    /// `uvec2`
    UInt2,
    /// `uvec3`
    UInt3,
    /// `uvec4`
    UInt4,
}

impl ShaderDataType {
    /// Number of 32-bit components
    pub const fn component_count(self) -> u32 {
        match self {
            Self::Float | Self::Int | Self::UInt => 1,
            Self::Float2 | Self::Int2 | Self::UInt2 => 2,
            Self::Float3 | Self::Int3 | Self::UInt3 => 3,
            Self::Float4 | Self::Int4 | Self::UInt4 => 4,
        }
    }

    /// Size in bytes
    pub const fn size(self) -> u32 {
        self.component_count() * 4
    }

    /// Matching Vulkan vertex format
    pub const fn format(self) -> vk::Format {
        match self {
            Self::Float => vk::Format::R32_SFLOAT,
            Self::Float2 => vk::Format::R32G32_SFLOAT,
            Self::Float3 => vk::Format::R32G32B32_SFLOAT,
            Self::Float4 => vk::Format::R32G32B32A32_SFLOAT,
            Self::Int => vk::Format::R32_SINT,
            Self::Int2 => vk::Format::R32G32_SINT,
            Self::Int3 => vk::Format::R32G32B32_SINT,
            Self::Int4 => vk::Format::R32G32B32A32_SINT,
            Self::UInt => vk::Format::R32_UINT,
            Self::UInt2 => vk::Format::R32G32_UINT,
            Self::UInt3 => vk::Format::R32G32B32_UINT,
            Self::UInt4 => vk::Format::R32G32B32A32_UINT,
        }
    }
}

/// One named vertex attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexAttribute {
    /// Shader-side name, for diagnostics only
    pub name: String,
    /// Attribute type
    pub data_type: ShaderDataType,
}

impl VertexAttribute {
    /// Create a new attribute
    pub fn new(name: impl Into<String>, data_type: ShaderDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Resolved vertex layout: attribute offsets plus the binding stride
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    attributes: Vec<VertexAttribute>,
    offsets: Vec<u32>,
    stride: u32,
}

impl VertexLayout {
    /// Compute offsets and stride for `attributes`
    pub fn new(attributes: &[VertexAttribute]) -> Self {
        let mut offsets = Vec::with_capacity(attributes.len());
        let mut stride = 0;
        for attribute in attributes {
            offsets.push(stride);
            stride += attribute.data_type.size();
        }

        Self {
            attributes: attributes.to_vec(),
            offsets,
            stride,
        }
    }

    /// Distance in bytes between consecutive vertices
    pub const fn stride(&self) -> u32 {
        self.stride
    }

    /// Attributes in location order
    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    /// Vulkan binding description for binding 0
    pub const fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Vulkan attribute descriptions, one location per attribute
    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .zip(&self.offsets)
            .enumerate()
            .map(|(location, (attribute, &offset))| vk::VertexInputAttributeDescription {
                binding: 0,
                location: location as u32,
                format: attribute.data_type.format(),
                offset,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(ShaderDataType::Float.size(), 4);
        assert_eq!(ShaderDataType::Float3.size(), 12);
        assert_eq!(ShaderDataType::UInt4.size(), 16);
        assert_eq!(ShaderDataType::Int2.format(), vk::Format::R32G32_SINT);
    }

    #[test]
    fn test_layout_offsets_and_stride() {
        let layout = VertexLayout::new(&[
            VertexAttribute::new("position", ShaderDataType::Float3),
            VertexAttribute::new("color", ShaderDataType::Float3),
            VertexAttribute::new("uv", ShaderDataType::Float2),
        ]);

        assert_eq!(layout.stride(), 32);
        let descriptions = layout.attribute_descriptions();
        assert_eq!(descriptions.len(), 3);
        assert_eq!(descriptions[1].offset, 12);
        assert_eq!(descriptions[2].offset, 24);
        assert_eq!(descriptions[2].location, 2);
        assert_eq!(descriptions[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(layout.binding_description().stride, 32);
    }
}
