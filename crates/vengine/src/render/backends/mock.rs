//! Recording device for tests
//!
//! [`RecordingDevice`] implements [`GpuDevice`] without touching a GPU. It hands
//! out fabricated handles, appends every call to a log, and simulates just
//! enough device behavior for the frame and resource logic to be checked:
//!
//! - fences move `Signaled -> Unsignaled` on reset, `Unsignaled -> Pending` on
//!   submit and `Pending -> Signaled` when waited on or when the device idles;
//! - mapped buffers are backed by byte vectors, and buffer copies recorded
//!   into a command buffer run when that command buffer is submitted;
//! - acquire and present results can be scripted, and surface capabilities
//!   can be swapped at any time to simulate a resize;
//! - every create and destroy is counted per object kind.
//!
//! Protocol mistakes (resetting a pending fence, resetting a command buffer
//! still in flight, submitting with a fence that is not unsignaled, submitting
//! a command buffer that is not ended) are collected as violations instead of
//! failing, so tests can assert on them.

use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crate::render::backends::gpu::{
    AcquireOutcome, BufferAllocation, BufferRequest, GpuDevice, ImageAllocation, ImageBarrier,
    ImageRequest, MemoryLocation, PipelineHandles, PipelineRequest, PresentOutcome, QueueRole,
    RenderTarget, Submission, SwapchainRequest,
};
use crate::render::backends::vulkan::{
    QueueFamilyAssignment, SwapchainSupport, VulkanError, VulkanResult,
};

/// Kinds of objects whose lifetimes are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Binary semaphore
    Semaphore,
    /// Fence
    Fence,
    /// Command pool
    CommandPool,
    /// Primary command buffer
    CommandBuffer,
    /// Swapchain
    Swapchain,
    /// Image view (swapchain views and image default views)
    ImageView,
    /// Buffer
    Buffer,
    /// Allocated image
    Image,
    /// Graphics pipeline plus layout
    Pipeline,
    /// Descriptor set layout
    DescriptorSetLayout,
    /// Descriptor pool
    DescriptorPool,
}

/// Simulated fence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Signaled, safe to reset
    Signaled,
    /// Reset, not yet submitted
    Unsignaled,
    /// Submitted, GPU work outstanding
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// One recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `wait_idle`
    WaitIdle,
    /// `queue_wait_idle`
    QueueWaitIdle(QueueRole),
    /// `submit`
    Submit {
        /// Target queue
        role: QueueRole,
        /// Submitted command buffer
        command_buffer: vk::CommandBuffer,
        /// Fence signaled on completion
        fence: Option<vk::Fence>,
    },
    /// `wait_for_fence`
    WaitForFence(vk::Fence),
    /// `reset_fence`
    ResetFence(vk::Fence),
    /// `reset_command_buffer`
    ResetCommandBuffer(vk::CommandBuffer),
    /// `begin_command_buffer`
    BeginCommandBuffer(vk::CommandBuffer),
    /// `end_command_buffer`
    EndCommandBuffer(vk::CommandBuffer),
    /// `cmd_image_barrier`
    ImageBarrier(ImageBarrier),
    /// `cmd_begin_rendering`
    BeginRendering(RenderTarget),
    /// `cmd_end_rendering`
    EndRendering,
    /// `cmd_set_viewport_scissor`
    SetViewportScissor(vk::Extent2D),
    /// `cmd_bind_pipeline`
    BindPipeline(vk::Pipeline),
    /// `cmd_bind_descriptor_set`
    BindDescriptorSet(vk::DescriptorSet),
    /// `cmd_bind_vertex_buffer`
    BindVertexBuffer(vk::Buffer),
    /// `cmd_bind_index_buffer`
    BindIndexBuffer(vk::Buffer, vk::IndexType),
    /// `cmd_draw_indexed`
    DrawIndexed(u32),
    /// `cmd_copy_buffer`
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Bytes copied
        size: vk::DeviceSize,
    },
    /// `create_swapchain`
    CreateSwapchain {
        /// Created handle
        swapchain: vk::SwapchainKHR,
        /// Requested extent
        extent: vk::Extent2D,
        /// Requested format
        format: vk::Format,
        /// Requested present mode
        present_mode: vk::PresentModeKHR,
        /// Requested minimum image count
        image_count: u32,
        /// Families for concurrent sharing
        queue_families: Vec<u32>,
    },
    /// `destroy_swapchain`
    DestroySwapchain(vk::SwapchainKHR),
    /// `acquire_next_image`
    Acquire(AcquireOutcome),
    /// `present`
    Present {
        /// Presented image
        image_index: u32,
        /// Result handed back
        outcome: PresentOutcome,
    },
    /// `create_buffer`
    CreateBuffer {
        /// Created handle
        buffer: vk::Buffer,
        /// Size in bytes
        size: vk::DeviceSize,
        /// Usage flags
        usage: vk::BufferUsageFlags,
        /// Memory placement
        location: MemoryLocation,
        /// Families for concurrent sharing
        queue_families: Vec<u32>,
    },
    /// `destroy_buffer`
    DestroyBuffer(vk::Buffer),
    /// `write_buffer`
    WriteBuffer {
        /// Target buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Bytes written
        len: usize,
    },
    /// `flush_buffer`
    FlushBuffer {
        /// Target buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Bytes flushed
        len: vk::DeviceSize,
    },
    /// `invalidate_buffer`
    InvalidateBuffer {
        /// Target buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Bytes invalidated
        len: vk::DeviceSize,
    },
    /// `create_image`
    CreateImage(ImageAllocation),
    /// `destroy_image`
    DestroyImage(vk::Image),
    /// `create_graphics_pipeline`
    CreatePipeline {
        /// Created pipeline
        pipeline: vk::Pipeline,
        /// Color attachment format
        color_format: vk::Format,
    },
    /// `destroy_graphics_pipeline`
    DestroyPipeline(vk::Pipeline),
    /// `release_allocator`
    ReleaseAllocator,
    /// `shutdown`
    Shutdown,
}

/// Mapped buffers keep separate host and device views so that a missing
/// flush or invalidate shows up as stale bytes.
struct MockBuffer {
    device: Vec<u8>,
    host: Vec<u8>,
    location: MemoryLocation,
}

struct MockState {
    next_handle: u64,
    calls: Vec<Call>,
    created: HashMap<ObjectKind, usize>,
    destroyed: HashMap<ObjectKind, usize>,
    violations: Vec<String>,
    fences: HashMap<vk::Fence, FenceState>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    command_buffer_fences: HashMap<vk::CommandBuffer, vk::Fence>,
    pool_buffers: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    recorded_copies: HashMap<vk::CommandBuffer, Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)>>,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image_index: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    presents: usize,
    leaked_buffers: usize,
    surface_support: SwapchainSupport,
    queue_families: QueueFamilyAssignment,
    allocator_released: bool,
    shut_down: bool,
}

impl MockState {
    fn handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(self.next_handle)
    }

    fn create<T: Handle>(&mut self, kind: ObjectKind) -> T {
        *self.created.entry(kind).or_default() += 1;
        self.handle()
    }

    fn destroy(&mut self, kind: ObjectKind) {
        *self.destroyed.entry(kind).or_default() += 1;
    }

    fn violation(&mut self, message: String) {
        log::error!("Device protocol violation: {}", message);
        self.violations.push(message);
    }

    fn signal_pending_fences(&mut self) {
        for state in self.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }

    fn mapped_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        len: u64,
    ) -> VulkanResult<&mut MockBuffer> {
        let entry = self.buffers.get_mut(&buffer).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("Unknown buffer {buffer:?}"),
        })?;
        if !entry.location.is_mapped() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Buffer {buffer:?} is not host visible"),
            });
        }
        if offset + len > entry.host.len() as u64 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Range {offset}+{len} exceeds buffer size {}", entry.host.len()),
            });
        }
        Ok(entry)
    }

    fn run_copies(&mut self, command_buffer: vk::CommandBuffer) {
        let copies = self.recorded_copies.remove(&command_buffer).unwrap_or_default();
        for (src, dst, size) in copies {
            let size = size as usize;
            let source = self.buffers.get(&src);
            let Some(bytes) = source.map(|b| b.device[..size.min(b.device.len())].to_vec()) else {
                self.violation(format!("Copy from unknown buffer {src:?}"));
                continue;
            };
            match self.buffers.get_mut(&dst) {
                Some(target) if target.device.len() >= bytes.len() => {
                    target.device[..bytes.len()].copy_from_slice(&bytes)
                }
                _ => self.violation(format!("Copy into unknown or undersized buffer {dst:?}")),
            }
        }
    }
}

/// Default surface: sentinel current extent, 1x1 to 4096x4096, two to eight
/// images, B8G8R8A8_SRGB, FIFO and MAILBOX
pub fn default_surface_support() -> SwapchainSupport {
    SwapchainSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

/// Graphics and present on family 0, a dedicated transfer family 1
pub const fn default_queue_families() -> QueueFamilyAssignment {
    QueueFamilyAssignment {
        graphics: Some(0),
        present: Some(0),
        transfer: Some(1),
        compute: Some(0),
    }
}

/// [`GpuDevice`] that records calls instead of issuing GPU work
pub struct RecordingDevice {
    state: RefCell<MockState>,
}

impl RecordingDevice {
    /// Device with the default surface and queue families
    pub fn new() -> Self {
        Self::with_setup(default_surface_support(), default_queue_families())
    }

    /// Device with a custom surface and queue families
    pub fn with_setup(
        surface_support: SwapchainSupport,
        queue_families: QueueFamilyAssignment,
    ) -> Self {
        Self {
            state: RefCell::new(MockState {
                next_handle: 0,
                calls: Vec::new(),
                created: HashMap::new(),
                destroyed: HashMap::new(),
                violations: Vec::new(),
                fences: HashMap::new(),
                command_buffers: HashMap::new(),
                command_buffer_fences: HashMap::new(),
                pool_buffers: HashMap::new(),
                recorded_copies: HashMap::new(),
                buffers: HashMap::new(),
                swapchain_images: HashMap::new(),
                next_image_index: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                presents: 0,
                leaked_buffers: 0,
                surface_support,
                queue_families,
                allocator_released: false,
                shut_down: false,
            }),
        }
    }

    /// Replace what the surface reports from now on
    pub fn set_surface_support(&self, support: SwapchainSupport) {
        self.state.borrow_mut().surface_support = support;
    }

    /// Report `width` x `height` as the surface's current extent
    pub fn set_current_extent(&self, width: u32, height: u32) {
        let mut state = self.state.borrow_mut();
        state.surface_support.capabilities.current_extent = vk::Extent2D { width, height };
    }

    /// Return `outcome` from the next unscripted acquire
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().acquire_script.push_back(outcome);
    }

    /// Return `outcome` from the next unscripted present
    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().present_script.push_back(outcome);
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Number of recorded calls matching `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Forget the call log
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Objects of `kind` created so far
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state.borrow().created.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` destroyed so far
    pub fn destroyed(&self, kind: ObjectKind) -> usize {
        self.state.borrow().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` currently alive
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.created(kind).saturating_sub(self.destroyed(kind))
    }

    /// Protocol violations observed so far
    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Images successfully handed to the presentation engine
    pub fn presents(&self) -> usize {
        self.state.borrow().presents
    }

    /// Current contents of a buffer
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.borrow().buffers.get(&buffer).map(|b| b.device.clone())
    }

    /// State of a fence
    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.borrow().fences.get(&fence).copied()
    }

    /// Buffers that were still alive when the allocator was released
    pub fn leaked_buffers(&self) -> usize {
        self.state.borrow().leaked_buffers
    }

    /// Whether `release_allocator` ran
    pub fn allocator_released(&self) -> bool {
        self.state.borrow().allocator_released
    }

    /// Whether `shutdown` ran
    pub fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for RecordingDevice {
    fn queue_families(&self) -> QueueFamilyAssignment {
        self.state.borrow().queue_families
    }

    fn surface_support(&self) -> VulkanResult<SwapchainSupport> {
        Ok(self.state.borrow().surface_support.clone())
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::WaitIdle);
        state.signal_pending_fences();
        Ok(())
    }

    fn queue_wait_idle(&self, role: QueueRole) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::QueueWaitIdle(role));
        state.signal_pending_fences();
        Ok(())
    }

    fn submit(&self, role: QueueRole, submission: &Submission) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        let command_buffer = submission.command_buffer;
        state.calls.push(Call::Submit {
            role,
            command_buffer,
            fence: submission.fence,
        });

        if state.command_buffers.get(&command_buffer) != Some(&CommandBufferState::Executable) {
            state.violation(format!(
                "Submitted command buffer {command_buffer:?} is not executable"
            ));
        }

        if let Some(fence) = submission.fence {
            match state.fences.get(&fence).copied() {
                Some(FenceState::Unsignaled) => {}
                other => state.violation(format!("Submit with fence {fence:?} in state {other:?}")),
            }
            state.fences.insert(fence, FenceState::Pending);
            state.command_buffer_fences.insert(command_buffer, fence);
        }

        state.run_copies(command_buffer);
        Ok(())
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        Ok(self.state.borrow_mut().create(ObjectKind::Semaphore))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.state.borrow_mut().destroy(ObjectKind::Semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let fence = state.create(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        if state.fences.remove(&fence) == Some(FenceState::Pending) {
            state.violation(format!("Destroyed pending fence {fence:?}"));
        }
        state.destroy(ObjectKind::Fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::WaitForFence(fence));
        match state.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                state.fences.insert(fence, FenceState::Signaled);
                Ok(())
            }
            Some(FenceState::Unsignaled) => Err(VulkanError::Api(vk::Result::TIMEOUT)),
            None => Err(VulkanError::InvalidOperation {
                reason: format!("Unknown fence {fence:?}"),
            }),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::ResetFence(fence));
        if state.fences.get(&fence) == Some(&FenceState::Pending) {
            state.violation(format!("Reset pending fence {fence:?}"));
        }
        state.fences.insert(fence, FenceState::Unsignaled);
        Ok(())
    }

    fn create_command_pool(&self, _family: u32, _transient: bool) -> VulkanResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        let pool = state.create(ObjectKind::CommandPool);
        state.pool_buffers.insert(pool, Vec::new());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        let remaining = state.pool_buffers.remove(&pool).unwrap_or_default();
        for command_buffer in remaining {
            state.command_buffers.remove(&command_buffer);
            state.destroy(ObjectKind::CommandBuffer);
        }
        state.destroy(ObjectKind::CommandPool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        let command_buffers: Vec<vk::CommandBuffer> =
            (0..count).map(|_| state.create(ObjectKind::CommandBuffer)).collect();
        for &command_buffer in &command_buffers {
            state.command_buffers.insert(command_buffer, CommandBufferState::Initial);
        }
        state.pool_buffers.entry(pool).or_default().extend(&command_buffers);
        Ok(command_buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        if let Some(owned) = state.pool_buffers.get_mut(&pool) {
            owned.retain(|cb| !command_buffers.contains(cb));
        }
        for command_buffer in command_buffers {
            state.command_buffers.remove(command_buffer);
            state.destroy(ObjectKind::CommandBuffer);
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::ResetCommandBuffer(command_buffer));
        let in_flight = state
            .command_buffer_fences
            .get(&command_buffer)
            .and_then(|fence| state.fences.get(fence))
            == Some(&FenceState::Pending);
        if in_flight {
            state.violation(format!(
                "Reset command buffer {command_buffer:?} while still in flight"
            ));
        }
        state.command_buffers.insert(command_buffer, CommandBufferState::Initial);
        state.recorded_copies.remove(&command_buffer);
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _one_time_submit: bool,
    ) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::BeginCommandBuffer(command_buffer));
        if state.command_buffers.get(&command_buffer) == Some(&CommandBufferState::Recording) {
            state.violation(format!(
                "Begin on command buffer {command_buffer:?} already recording"
            ));
        }
        state.command_buffers.insert(command_buffer, CommandBufferState::Recording);
        state.recorded_copies.remove(&command_buffer);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::EndCommandBuffer(command_buffer));
        if state.command_buffers.get(&command_buffer) != Some(&CommandBufferState::Recording) {
            state.violation(format!(
                "End on command buffer {command_buffer:?} that is not recording"
            ));
        }
        state.command_buffers.insert(command_buffer, CommandBufferState::Executable);
        Ok(())
    }

    fn cmd_image_barrier(&self, _command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.record(Call::ImageBarrier(*barrier));
    }

    fn cmd_begin_rendering(&self, _command_buffer: vk::CommandBuffer, target: &RenderTarget) {
        self.record(Call::BeginRendering(*target));
    }

    fn cmd_end_rendering(&self, _command_buffer: vk::CommandBuffer) {
        self.record(Call::EndRendering);
    }

    fn cmd_set_viewport_scissor(&self, _command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(Call::SetViewportScissor(extent));
    }

    fn cmd_bind_pipeline(&self, _command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Call::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.record(Call::BindDescriptorSet(set));
    }

    fn cmd_bind_vertex_buffer(&self, _command_buffer: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(Call::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    ) {
        self.record(Call::BindIndexBuffer(buffer, index_type));
    }

    fn cmd_draw_indexed(&self, _command_buffer: vk::CommandBuffer, index_count: u32) {
        self.record(Call::DrawIndexed(index_count));
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::CopyBuffer { src, dst, size });
        state.recorded_copies.entry(command_buffer).or_default().push((src, dst, size));
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<vk::SwapchainKHR> {
        let mut state = self.state.borrow_mut();
        let swapchain = state.create(ObjectKind::Swapchain);
        let images: Vec<vk::Image> = (0..request.image_count).map(|_| state.handle()).collect();
        state.swapchain_images.insert(swapchain, images);
        state.next_image_index = 0;
        state.calls.push(Call::CreateSwapchain {
            swapchain,
            extent: request.extent,
            format: request.surface_format.format,
            present_mode: request.present_mode,
            image_count: request.image_count,
            queue_families: request.queue_families.to_vec(),
        });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VulkanResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchain_images
            .get(&swapchain)
            .cloned()
            .ok_or(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroySwapchain(swapchain));
        state.swapchain_images.remove(&swapchain);
        state.destroy(ObjectKind::Swapchain);
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<vk::ImageView> {
        Ok(self.state.borrow_mut().create(ObjectKind::ImageView))
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.state.borrow_mut().destroy(ObjectKind::ImageView);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _semaphore: vk::Semaphore,
    ) -> VulkanResult<AcquireOutcome> {
        let mut state = self.state.borrow_mut();
        let image_count = state
            .swapchain_images
            .get(&swapchain)
            .map(|images| images.len() as u32)
            .ok_or(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR))?;

        let scripted = state.acquire_script.pop_front();
        let outcome = scripted.unwrap_or(AcquireOutcome::Acquired {
            image_index: state.next_image_index % image_count.max(1),
            suboptimal: false,
        });
        if let AcquireOutcome::Acquired { image_index, .. } = outcome {
            state.next_image_index = image_index + 1;
        }
        state.calls.push(Call::Acquire(outcome));
        Ok(outcome)
    }

    fn present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VulkanResult<PresentOutcome> {
        let mut state = self.state.borrow_mut();
        let outcome = state.present_script.pop_front().unwrap_or(PresentOutcome::Presented);
        if outcome != PresentOutcome::OutOfDate {
            state.presents += 1;
        }
        state.calls.push(Call::Present { image_index, outcome });
        Ok(outcome)
    }

    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation> {
        let mut state = self.state.borrow_mut();
        if state.allocator_released {
            return Err(VulkanError::InvalidOperation {
                reason: "Allocator already released".to_string(),
            });
        }
        let buffer = state.create(ObjectKind::Buffer);
        state.buffers.insert(
            buffer,
            MockBuffer {
                device: vec![0; request.size as usize],
                host: vec![0; request.size as usize],
                location: request.location,
            },
        );
        state.calls.push(Call::CreateBuffer {
            buffer,
            size: request.size,
            usage: request.usage,
            location: request.location,
            queue_families: request.queue_families.to_vec(),
        });
        Ok(BufferAllocation {
            buffer,
            size: request.size,
            location: request.location,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroyBuffer(buffer));
        if state.buffers.remove(&buffer).is_none() {
            state.violation(format!("Destroyed unknown buffer {buffer:?}"));
            return;
        }
        state.destroy(ObjectKind::Buffer);
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        let target = state.mapped_buffer(buffer, offset, data.len() as u64)?;
        let start = offset as usize;
        target.host[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, len: vk::DeviceSize) -> VulkanResult<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let source = state.mapped_buffer(buffer, 0, len)?;
        Ok(source.host[..len as usize].to_vec())
    }

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::FlushBuffer { buffer, offset, len });
        let entry = state.mapped_buffer(buffer, offset, len)?;
        let range = offset as usize..(offset + len) as usize;
        entry.device[range.clone()].copy_from_slice(&entry.host[range]);
        Ok(())
    }

    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::InvalidateBuffer { buffer, offset, len });
        let entry = state.mapped_buffer(buffer, offset, len)?;
        let range = offset as usize..(offset + len) as usize;
        entry.host[range.clone()].copy_from_slice(&entry.device[range]);
        Ok(())
    }

    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation> {
        let mut state = self.state.borrow_mut();
        let allocation = ImageAllocation {
            image: state.create(ObjectKind::Image),
            view: state.create(ObjectKind::ImageView),
            format: request.format,
            extent: request.extent,
            aspect: request.aspect,
        };
        state.calls.push(Call::CreateImage(allocation));
        Ok(allocation)
    }

    fn destroy_image(&self, image: &ImageAllocation) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroyImage(image.image));
        state.destroy(ObjectKind::ImageView);
        state.destroy(ObjectKind::Image);
    }

    fn create_graphics_pipeline(&self, request: &PipelineRequest) -> VulkanResult<PipelineHandles> {
        let mut state = self.state.borrow_mut();
        let handles = PipelineHandles {
            pipeline: state.create(ObjectKind::Pipeline),
            layout: state.handle(),
        };
        state.calls.push(Call::CreatePipeline {
            pipeline: handles.pipeline,
            color_format: request.color_format,
        });
        Ok(handles)
    }

    fn destroy_graphics_pipeline(&self, handles: PipelineHandles) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroyPipeline(handles.pipeline));
        state.destroy(ObjectKind::Pipeline);
    }

    fn create_uniform_set_layout(
        &self,
        _binding: u32,
        _stages: vk::ShaderStageFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        Ok(self.state.borrow_mut().create(ObjectKind::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().destroy(ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(&self, _max_sets: u32) -> VulkanResult<vk::DescriptorPool> {
        Ok(self.state.borrow_mut().create(ObjectKind::DescriptorPool))
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state.borrow_mut().destroy(ObjectKind::DescriptorPool);
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.borrow_mut();
        Ok((0..count).map(|_| state.handle()).collect())
    }

    fn write_uniform_descriptor(
        &self,
        _set: vk::DescriptorSet,
        _binding: u32,
        _buffer: vk::Buffer,
        _range: vk::DeviceSize,
    ) {
    }

    fn release_allocator(&mut self) {
        let state = self.state.get_mut();
        state.calls.push(Call::ReleaseAllocator);
        if state.allocator_released {
            return;
        }
        let leaked: Vec<vk::Buffer> = state.buffers.keys().copied().collect();
        for buffer in leaked {
            log::warn!("Buffer {:?} still alive at shutdown, releasing", buffer);
            state.buffers.remove(&buffer);
            state.leaked_buffers += 1;
            state.destroy(ObjectKind::Buffer);
        }
        state.allocator_released = true;
    }

    fn shutdown(&mut self) {
        self.release_allocator();
        let state = self.state.get_mut();
        state.calls.push(Call::Shutdown);
        state.shut_down = true;
    }
}
