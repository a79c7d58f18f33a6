//! # vengine
//!
//! A thin real-time render core over Vulkan. It owns GPU device selection,
//! the swapchain lifecycle, N-frames-in-flight pacing and buffer creation/upload,
//! and exposes a small frame protocol to application code:
//!
//! ```text
//! begin(clear) -> submit_geometry(vb, ib)* -> end() -> render() -> present()
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vengine::prelude::*;
//!
//! fn run(window: &dyn WindowSurface) -> Result<(), RenderError> {
//!     let config = RendererConfig::new("Triangle").with_framebuffer_size(800, 600);
//!     let mut renderer = VulkanRenderer::init(config, window)?;
//!
//!     renderer.begin(ClearColor::new(0.2, 0.2, 0.2, 1.0))?;
//!     renderer.end()?;
//!     renderer.render()?;
//!     renderer.present()?;
//!
//!     renderer.finish()?;
//!     renderer.terminate()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for renderer users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::config::{RendererConfig, ShaderConfig},
        render::{
            api::{
                BackendKind, BufferUsage, ClearColor, IndexBufferDesc, IndexWidth, RenderApi,
                ShaderDataType, VertexAttribute, VertexBufferDesc, WindowSurface,
            },
            backends::vulkan::{IndexBuffer, UniformBuffer, VertexBuffer, VulkanRenderer},
            RenderError, RenderResult,
        },
    };
}
