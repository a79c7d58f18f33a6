//! Frame protocol trait for rendering backends
//!
//! One logical frame is driven as
//! `begin -> submit_geometry* -> end -> render -> present`, all from a single
//! thread. A frame may be aborted inside `begin` when the swapchain turns out
//! to be stale; the remaining calls of that frame are then no-ops, so callers
//! drive the same sequence unconditionally.

use crate::render::RenderResult;

/// Which native backend a [`RenderApi`] implementation drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Vulkan 1.3 with dynamic rendering
    Vulkan,
}

/// RGBA clear color applied by `begin`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor(pub [f32; 4]);

impl ClearColor {
    /// Create a clear color from components in the 0.0-1.0 range
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self([r, g, b, a])
    }
}

impl Default for ClearColor {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }
}

/// Main rendering API trait
///
/// Implemented once per backend. The resource factory is handed out as a
/// borrowed view so it can never outlive the device it allocates from.
pub trait RenderApi {
    /// Vertex buffer handle type produced by the resource factory
    type VertexBuffer;
    /// Index buffer handle type produced by the resource factory
    type IndexBuffer;
    /// Resource factory view borrowed from the renderer
    type ResourceFactory<'a>
    where
        Self: 'a;

    /// Which backend is active
    fn backend(&self) -> BackendKind;

    /// Wait for the current frame slot, acquire an image and start recording
    fn begin(&mut self, clear: ClearColor) -> RenderResult<()>;

    /// Record an indexed draw of `vertex_buffer` with `index_buffer`
    fn submit_geometry(
        &mut self,
        vertex_buffer: &Self::VertexBuffer,
        index_buffer: &Self::IndexBuffer,
    ) -> RenderResult<()>;

    /// Transition the frame image to a presentable layout and end recording
    fn end(&mut self) -> RenderResult<()>;

    /// Submit the recorded commands to the graphics queue
    fn render(&mut self) -> RenderResult<()>;

    /// Present the frame image and advance the frame cursor
    fn present(&mut self) -> RenderResult<()>;

    /// Block until the device is idle
    fn finish(&mut self) -> RenderResult<()>;

    /// Record a new framebuffer size and mark the swapchain stale
    fn frame_buffer_resize(&mut self, width: u32, height: u32);

    /// Borrow the resource factory
    fn resource_factory(&self) -> Self::ResourceFactory<'_>;

    /// Tear everything down in reverse dependency order
    fn terminate(&mut self) -> RenderResult<()>;
}
