//! Native device seam
//!
//! Every native call the render core issues goes through [`GpuDevice`]. The
//! components above it (swapchain manager, frame sync, command submission,
//! resource factory) are generic over this trait and borrow the device for
//! the duration of each call; only the renderer facade owns it.
//!
//! Handles are plain `ash::vk` handles. Memory behind buffers and images is
//! bookkept by the implementation, keyed by handle.

use ash::vk;

use crate::render::api::VertexLayout;
use crate::render::backends::vulkan::{QueueFamilyAssignment, SwapchainSupport, VulkanResult};

/// Queue a submission or wait targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Graphics queue
    Graphics,
    /// Present queue
    Present,
    /// Transfer queue
    Transfer,
    /// Compute queue
    Compute,
}

/// Where buffer memory lives and how the host reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local, not host visible
    GpuOnly,
    /// Host-visible, coherent and persistently mapped; written sequentially by the CPU
    CpuToGpu,
    /// Host-visible, coherent and persistently mapped; read back by the CPU
    GpuToCpu,
}

impl MemoryLocation {
    /// Whether the memory is persistently mapped
    pub const fn is_mapped(self) -> bool {
        matches!(self, Self::CpuToGpu | Self::GpuToCpu)
    }
}

/// Buffer creation request
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest<'a> {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
    /// Queue families sharing the buffer; fewer than two means exclusive sharing
    pub queue_families: &'a [u32],
}

/// A created buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAllocation {
    /// Native handle
    pub buffer: vk::Buffer,
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Memory placement
    pub location: MemoryLocation,
}

/// Image creation request (2D, single mip, single layer, exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRequest {
    /// Extent in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect used for the default view
    pub aspect: vk::ImageAspectFlags,
}

/// A created device-local image plus its default view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocation {
    /// Native image
    pub image: vk::Image,
    /// Default view
    pub view: vk::ImageView,
    /// Pixel format
    pub format: vk::Format,
    /// Extent in pixels
    pub extent: vk::Extent2D,
    /// Aspect of the view
    pub aspect: vk::ImageAspectFlags,
}

/// Image layout transition with synchronization2 scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image to transition
    pub image: vk::Image,
    /// Aspect of the whole-image subresource range
    pub aspect: vk::ImageAspectFlags,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Source stage scope
    pub src_stage: vk::PipelineStageFlags2,
    /// Source access scope
    pub src_access: vk::AccessFlags2,
    /// Destination stage scope
    pub dst_stage: vk::PipelineStageFlags2,
    /// Destination access scope
    pub dst_access: vk::AccessFlags2,
}

/// Attachments for one dynamic rendering scope
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTarget {
    /// Render area
    pub extent: vk::Extent2D,
    /// Color attachment view, cleared then stored
    pub color_view: vk::ImageView,
    /// Clear color
    pub clear_color: [f32; 4],
    /// Depth attachment view, cleared to 1.0, contents discarded
    pub depth_view: Option<vk::ImageView>,
}

/// One queue submission of a single primary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Command buffer to execute
    pub command_buffer: vk::CommandBuffer,
    /// Semaphore waited on before the given stage
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    /// Semaphore signaled on completion
    pub signal: Option<vk::Semaphore>,
    /// Fence signaled on completion
    pub fence: Option<vk::Fence>,
}

/// Swapchain creation request, already negotiated against the surface
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest<'a> {
    /// Color format and color space
    pub surface_format: vk::SurfaceFormatKHR,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Minimum image count
    pub image_count: u32,
    /// Surface transform
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Queue families sharing the images; fewer than two means exclusive sharing
    pub queue_families: &'a [u32],
}

/// Graphics pipeline creation request
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    /// Vertex shader SPIR-V bytes
    pub vertex_spirv: &'a [u8],
    /// Fragment shader SPIR-V bytes
    pub fragment_spirv: &'a [u8],
    /// Vertex input layout for binding 0
    pub vertex_layout: &'a VertexLayout,
    /// Color attachment format for dynamic rendering
    pub color_format: vk::Format,
    /// Depth attachment format for dynamic rendering
    pub depth_format: vk::Format,
    /// Descriptor set layouts of the pipeline layout
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

/// Pipeline plus its layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandles {
    /// Pipeline
    pub pipeline: vk::Pipeline,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
}

/// Result of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image acquired; `suboptimal` asks for recreation after this frame
    Acquired {
        /// Index into the swapchain images
        image_index: u32,
        /// Swapchain no longer matches the surface exactly
        suboptimal: bool,
    },
    /// Swapchain is stale and must be recreated before use
    OutOfDate,
}

/// Result of presenting a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented
    Presented,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

/// Native device operations used by the render core
///
/// Implementations are driven from a single thread. Command recording methods
/// (`cmd_*`) assume the command buffer is in the recording state.
pub trait GpuDevice {
    // --- device, queues, surface ---

    /// Queue family indices chosen for this device
    fn queue_families(&self) -> QueueFamilyAssignment;

    /// Re-query surface capabilities, formats and present modes
    fn surface_support(&self) -> VulkanResult<SwapchainSupport>;

    /// Block until every queue is idle
    fn wait_idle(&self) -> VulkanResult<()>;

    /// Block until `role`'s queue is idle
    fn queue_wait_idle(&self, role: QueueRole) -> VulkanResult<()>;

    /// Submit one command buffer to `role`'s queue
    fn submit(&self, role: QueueRole, submission: &Submission) -> VulkanResult<()>;

    // --- synchronization ---

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until `fence` is signaled or `timeout` nanoseconds pass
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VulkanResult<()>;

    /// Return `fence` to the unsignaled state
    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()>;

    // --- command pools and buffers ---

    /// Create a command pool for `family`; `transient` marks short-lived buffers
    fn create_command_pool(&self, family: u32, transient: bool) -> VulkanResult<vk::CommandPool>;

    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate `count` primary command buffers
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>>;

    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);

    /// Reset a command buffer to the initial state
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;

    /// Begin recording, optionally with the one-time-submit flag
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> VulkanResult<()>;

    /// End recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;

    // --- command recording ---

    /// Record an image layout transition
    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier);

    /// Begin dynamic rendering into `target`
    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, target: &RenderTarget);

    /// End dynamic rendering
    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer);

    /// Set viewport and scissor to cover `extent`
    fn cmd_set_viewport_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D);

    /// Bind a graphics pipeline
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Bind one descriptor set at set 0
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );

    /// Bind a vertex buffer at binding 0
    fn cmd_bind_vertex_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer);

    /// Bind an index buffer
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    );

    /// Record one indexed, non-instanced draw
    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32);

    /// Record a whole-range buffer copy of `size` bytes
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );

    // --- swapchain ---

    /// Create a swapchain on the device's surface
    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<vk::SwapchainKHR>;

    /// Images owned by `swapchain`, in index order
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VulkanResult<Vec<vk::Image>>;

    /// Destroy a swapchain (its images go with it)
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Create a 2D view over a whole image
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<vk::ImageView>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Acquire the next presentable image, signaling `semaphore` when it is ready
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VulkanResult<AcquireOutcome>;

    /// Queue `image_index` for presentation after `wait` is signaled
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VulkanResult<PresentOutcome>;

    // --- memory ---

    /// Create a buffer with backing memory
    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation>;

    /// Destroy a buffer and release its memory
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Copy `data` into a mapped buffer at `offset`
    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VulkanResult<()>;

    /// Copy `len` bytes out of a mapped buffer
    fn read_buffer(&self, buffer: vk::Buffer, len: vk::DeviceSize) -> VulkanResult<Vec<u8>>;

    /// Make host writes to a mapped range visible to the device. Required
    /// before any submission reads the range; a no-op on coherent memory.
    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// Make device writes to a mapped range visible to host reads; a no-op on
    /// coherent memory
    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// Create a device-local image with memory and a default view
    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation>;

    /// Destroy an image, its view and its memory
    fn destroy_image(&self, image: &ImageAllocation);

    // --- pipelines and descriptors ---

    /// Build a dynamic-rendering graphics pipeline and its layout
    fn create_graphics_pipeline(&self, request: &PipelineRequest) -> VulkanResult<PipelineHandles>;

    /// Destroy a pipeline and its layout
    fn destroy_graphics_pipeline(&self, handles: PipelineHandles);

    /// Create a set layout with one uniform buffer at `binding`
    fn create_uniform_set_layout(
        &self,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a pool able to hold `max_sets` single-uniform sets
    fn create_descriptor_pool(&self, max_sets: u32) -> VulkanResult<vk::DescriptorPool>;

    /// Destroy a descriptor pool and its sets
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate `count` sets of `layout`
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> VulkanResult<Vec<vk::DescriptorSet>>;

    /// Point `binding` of `set` at `range` bytes of `buffer`
    fn write_uniform_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    );

    // --- teardown ---

    /// Release the memory allocator; buffers still alive are reported and freed
    fn release_allocator(&mut self);

    /// Destroy the device, surface, debug messenger and instance, in that order
    fn shutdown(&mut self);
}
