//! Backend-neutral rendering API
//!
//! Types the application layer uses to talk to the render core without naming
//! the native backend: the [`RenderApi`] frame protocol, buffer descriptors,
//! vertex layouts and the window-surface collaborator.

pub mod buffers;
pub mod render_api;
pub mod vertex_layout;
pub mod window;

pub use buffers::{BufferUsage, IndexBufferDesc, IndexWidth, VertexBufferDesc};
pub use render_api::{BackendKind, ClearColor, RenderApi};
pub use vertex_layout::{ShaderDataType, VertexAttribute, VertexLayout};
pub use window::{RawWindowSurface, WindowSurface};
