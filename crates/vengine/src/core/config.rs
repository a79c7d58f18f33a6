//! # Renderer Configuration
//!
//! Everything the render core needs at `init` time that can be written to disk:
//! the instance name, validation switch, frame pacing depth, the initial
//! framebuffer size, the SPIR-V blobs for the graphics pipeline and its vertex
//! layout. The native surface handle is not part of this struct; it comes from
//! the [`WindowSurface`](crate::render::api::WindowSurface) collaborator.
//!
//! Supports TOML and RON through [`Config`].

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use crate::config::{Config, ConfigError};
use crate::render::api::{ShaderDataType, VertexAttribute};

/// Upper bound on frames in flight
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// # Shader Configuration
///
/// Paths of the pre-compiled SPIR-V binaries, loaded as opaque byte blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Path to the vertex shader SPIR-V file
    pub vertex_shader_path: String,
    /// Path to the fragment shader SPIR-V file
    pub fragment_shader_path: String,
}

impl ShaderConfig {
    /// Create a new shader configuration
    pub fn new(vertex_path: impl Into<String>, fragment_path: impl Into<String>) -> Self {
        Self {
            vertex_shader_path: vertex_path.into(),
            fragment_shader_path: fragment_path.into(),
        }
    }

    /// Validate that shader files exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Path::new(&self.vertex_shader_path).exists() {
            return Err(ConfigError::Invalid(format!(
                "Vertex shader not found: {}",
                self.vertex_shader_path
            )));
        }
        if !Path::new(&self.fragment_shader_path).exists() {
            return Err(ConfigError::Invalid(format!(
                "Fragment shader not found: {}",
                self.fragment_shader_path
            )));
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::new("target/shaders/vert.spv", "target/shaders/frag.spv")
    }
}

/// # Renderer Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Device/application name reported to the instance
    pub name: String,
    /// Whether to enable the Khronos validation layer and debug messenger
    pub enable_validation: bool,
    /// Number of frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Initial framebuffer size (width, height)
    pub framebuffer_size: (u32, u32),
    /// Shader configuration
    pub shaders: ShaderConfig,
    /// Vertex attributes consumed by the vertex shader, binding 0, in location order
    pub vertex_layout: Vec<VertexAttribute>,
    /// Size of the per-frame uniform block, if the shaders read one at set 0, binding 0
    pub uniform_buffer_size: Option<u64>,
    /// Device extensions required in addition to the swapchain extension
    pub device_extensions: Vec<String>,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable_validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            framebuffer_size: (800, 600),
            shaders: ShaderConfig::default(),
            vertex_layout: vec![
                VertexAttribute::new("in_position", ShaderDataType::Float3),
                VertexAttribute::new("in_color", ShaderDataType::Float3),
            ],
            uniform_buffer_size: None,
            device_extensions: Vec::new(),
        }
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Set the number of frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the initial framebuffer size
    pub fn with_framebuffer_size(mut self, width: u32, height: u32) -> Self {
        self.framebuffer_size = (width, height);
        self
    }

    /// Set custom shader configuration
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Set the vertex layout
    pub fn with_vertex_layout(mut self, attributes: Vec<VertexAttribute>) -> Self {
        self.vertex_layout = attributes;
        self
    }

    /// Request a per-frame uniform block of `size` bytes
    pub fn with_uniform_buffer(mut self, size: u64) -> Self {
        self.uniform_buffer_size = Some(size);
        self
    }

    /// Require an additional device extension
    pub fn with_device_extension(mut self, name: impl Into<String>) -> Self {
        self.device_extensions.push(name.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("Renderer name cannot be empty".to_string()));
        }

        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight must be within 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }

        if self.vertex_layout.is_empty() {
            return Err(ConfigError::Invalid(
                "Vertex layout needs at least one attribute".to_string(),
            ));
        }

        if self.uniform_buffer_size == Some(0) {
            return Err(ConfigError::Invalid("Uniform buffer size must be non-zero".to_string()));
        }

        self.shaders.validate()
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("VEngine")
    }
}

impl Config for RendererConfig {}
