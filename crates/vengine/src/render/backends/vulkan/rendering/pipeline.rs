//! Shader loading and graphics pipeline creation
//!
//! Shaders are pre-compiled SPIR-V read from disk as opaque blobs. The only
//! checks done here are the ones needed to hand the bytes to the driver:
//! word alignment and the SPIR-V magic number.

use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::core::config::ShaderConfig;
use crate::render::api::VertexLayout;
use crate::render::backends::gpu::{GpuDevice, PipelineHandles, PipelineRequest};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A SPIR-V binary loaded from disk
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    path: String,
    bytes: Vec<u8>,
}

impl ShaderBlob {
    /// Read and sanity-check the SPIR-V file at `path`
    pub fn load(path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| VulkanError::Shader {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(display, bytes)
    }

    /// Wrap in-memory SPIR-V; `path` is only used in error messages
    pub fn from_bytes(path: impl Into<String>, bytes: Vec<u8>) -> VulkanResult<Self> {
        let path = path.into();
        let words = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|e| VulkanError::Shader {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(VulkanError::Shader {
                path,
                reason: "Missing SPIR-V magic number".to_string(),
            });
        }

        log::debug!("Loaded shader '{}' ({} bytes)", path, bytes.len());
        Ok(Self { path, bytes })
    }

    /// Load both stages named by `config`
    pub fn load_pair(config: &ShaderConfig) -> VulkanResult<(Self, Self)> {
        Ok((
            Self::load(&config.vertex_shader_path)?,
            Self::load(&config.fragment_shader_path)?,
        ))
    }

    /// Source path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// SPIR-V bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The graphics pipeline plus what is needed to rebuild it for a new color format
#[derive(Debug)]
pub struct GraphicsPipeline {
    handles: PipelineHandles,
    vertex: ShaderBlob,
    fragment: ShaderBlob,
    vertex_layout: VertexLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    color_format: vk::Format,
    depth_format: vk::Format,
}

impl GraphicsPipeline {
    /// Build the pipeline for the given attachment formats
    pub fn create<D: GpuDevice>(
        device: &D,
        (vertex, fragment): (ShaderBlob, ShaderBlob),
        vertex_layout: VertexLayout,
        set_layouts: Vec<vk::DescriptorSetLayout>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VulkanResult<Self> {
        let handles = Self::build(
            device,
            &vertex,
            &fragment,
            &vertex_layout,
            &set_layouts,
            color_format,
            depth_format,
        )?;
        log::info!(
            "Graphics pipeline created ({:?} color, {:?} depth, stride {})",
            color_format,
            depth_format,
            vertex_layout.stride()
        );

        Ok(Self {
            handles,
            vertex,
            fragment,
            vertex_layout,
            set_layouts,
            color_format,
            depth_format,
        })
    }

    fn build<D: GpuDevice>(
        device: &D,
        vertex: &ShaderBlob,
        fragment: &ShaderBlob,
        vertex_layout: &VertexLayout,
        set_layouts: &[vk::DescriptorSetLayout],
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VulkanResult<PipelineHandles> {
        device.create_graphics_pipeline(&PipelineRequest {
            vertex_spirv: vertex.bytes(),
            fragment_spirv: fragment.bytes(),
            vertex_layout,
            color_format,
            depth_format,
            set_layouts,
        })
    }

    /// Rebuild when the swapchain color format changed; returns whether it did
    pub fn recreate_for_format<D: GpuDevice>(
        &mut self,
        device: &D,
        color_format: vk::Format,
    ) -> VulkanResult<bool> {
        if color_format == self.color_format {
            return Ok(false);
        }

        let handles = Self::build(
            device,
            &self.vertex,
            &self.fragment,
            &self.vertex_layout,
            &self.set_layouts,
            color_format,
            self.depth_format,
        )?;
        device.destroy_graphics_pipeline(self.handles);
        log::info!(
            "Graphics pipeline rebuilt for {:?} (was {:?})",
            color_format,
            self.color_format
        );
        self.handles = handles;
        self.color_format = color_format;
        Ok(true)
    }

    /// Pipeline and layout handles
    pub const fn handles(&self) -> PipelineHandles {
        self.handles
    }

    /// Color attachment format the pipeline was built for
    pub const fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// Destroy pipeline and layout
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        if self.handles.pipeline != vk::Pipeline::null() {
            device.destroy_graphics_pipeline(self.handles);
            self.handles = PipelineHandles {
                pipeline: vk::Pipeline::null(),
                layout: vk::PipelineLayout::null(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{ShaderDataType, VertexAttribute};
    use crate::render::backends::mock::{Call, ObjectKind, RecordingDevice};

    fn spirv() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000].iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    fn blobs() -> (ShaderBlob, ShaderBlob) {
        (
            ShaderBlob::from_bytes("vert.spv", spirv()).unwrap(),
            ShaderBlob::from_bytes("frag.spv", spirv()).unwrap(),
        )
    }

    #[test]
    fn test_blob_rejects_misaligned_and_foreign_bytes() {
        assert!(matches!(
            ShaderBlob::from_bytes("odd.spv", vec![1, 2, 3]),
            Err(VulkanError::Shader { .. })
        ));
        assert!(matches!(
            ShaderBlob::from_bytes("text.spv", b"void main() {}\n\0".to_vec()),
            Err(VulkanError::Shader { .. })
        ));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let error = ShaderBlob::load("/nonexistent/shader.spv").unwrap_err();
        assert!(error.to_string().contains("/nonexistent/shader.spv"));
    }

    #[test]
    fn test_recreate_only_on_format_change() {
        let device = RecordingDevice::new();
        let layout =
            VertexLayout::new(&[VertexAttribute::new("in_position", ShaderDataType::Float3)]);
        let mut pipeline = GraphicsPipeline::create(
            &device,
            blobs(),
            layout,
            Vec::new(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT,
        )
        .unwrap();

        assert!(!pipeline.recreate_for_format(&device, vk::Format::B8G8R8A8_SRGB).unwrap());
        assert!(pipeline.recreate_for_format(&device, vk::Format::R8G8B8A8_SRGB).unwrap());
        assert_eq!(pipeline.color_format(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(device.count_calls(|call| matches!(call, Call::CreatePipeline { .. })), 2);
        assert_eq!(device.live(ObjectKind::Pipeline), 1);

        pipeline.destroy(&device);
        pipeline.destroy(&device);
        assert_eq!(device.live(ObjectKind::Pipeline), 0);
    }
}
