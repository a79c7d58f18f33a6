//! Vulkan context management
//!
//! [`VulkanContext`] is the one object that owns native Vulkan state: instance,
//! surface, selected physical device, logical device, queues and the memory
//! allocator. It implements [`GpuDevice`], so everything above it talks to
//! Vulkan through that trait. Teardown runs in the reverse order of creation:
//! allocator, device, surface, debug messenger, instance.

use ash::extensions::khr::Surface;
use ash::vk;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Cursor;
use thiserror::Error;
use vk_mem::Alloc;

use crate::core::config::RendererConfig;
use crate::render::api::WindowSurface;
use crate::render::backends::gpu::{
    AcquireOutcome, BufferAllocation, BufferRequest, GpuDevice, ImageAllocation, ImageBarrier,
    ImageRequest, MemoryLocation, PipelineHandles, PipelineRequest, PresentOutcome, QueueRole,
    RenderTarget, Submission, SwapchainRequest,
};
use crate::render::backends::vulkan::{
    required_device_extensions, LogicalDevice, PhysicalDeviceInventory, PhysicalDeviceRecord,
    QueueFamilyAssignment, SwapchainSupport, VulkanInstance,
};

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The Vulkan library could not be loaded
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// A requested instance layer is not installed
    #[error("Missing instance layer: {0}")]
    MissingLayer(String),

    /// A requested instance extension is not available
    #[error("Missing instance extension: {0}")]
    MissingInstanceExtension(String),

    /// The instance reported zero physical devices
    #[error("No physical devices found")]
    NoPhysicalDevices,

    /// Every device failed the hard requirements
    #[error("No suitable GPU found (best score {best_score})")]
    NoSuitableDevice {
        /// Score of the best candidate
        best_score: u32,
    },

    /// The selected device lacks features the renderer depends on
    #[error("Missing required device features: {0}")]
    MissingDeviceFeatures(String),

    /// Graphics, present or transfer family is missing
    #[error("Queue family assignment is incomplete")]
    IncompleteQueueFamilies,

    /// A shader binary could not be loaded
    #[error("Shader '{path}': {reason}")]
    Shader {
        /// Path of the shader file
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

fn allocation_error(result: vk::Result, requested: u64) -> VulkanError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            VulkanError::OutOfMemory { requested }
        }
        other => VulkanError::Api(other),
    }
}

/// Family list for concurrent sharing; empty when one family owns the resource
fn concurrent_families(families: &[u32]) -> &[u32] {
    if families.len() > 1 {
        families
    } else {
        &[]
    }
}

struct BufferMemory {
    allocation: vk_mem::Allocation,
    mapped: *mut u8,
    size: vk::DeviceSize,
}

/// Owner of every native Vulkan object below the swapchain
pub struct VulkanContext {
    allocator: Option<vk_mem::Allocator>,
    buffers: RefCell<HashMap<vk::Buffer, BufferMemory>>,
    images: RefCell<HashMap<vk::Image, vk_mem::Allocation>>,
    logical_device: LogicalDevice,
    physical_device: PhysicalDeviceRecord,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    instance: Option<VulkanInstance>,
}

impl VulkanContext {
    /// Create instance, surface, device and allocator for `window`
    pub fn new(config: &RendererConfig, window: &dyn WindowSurface) -> VulkanResult<Self> {
        let window_extensions = window.required_instance_extensions()?;
        let instance =
            VulkanInstance::new(&config.name, config.enable_validation, &window_extensions)?;

        let surface = window.create_surface(&instance.entry, &instance.instance)?;
        let surface_loader = Surface::new(&instance.entry, &instance.instance);

        match Self::open_device(&instance, &surface_loader, surface, config) {
            Ok((physical_device, logical_device, allocator)) => Ok(Self {
                allocator: Some(allocator),
                buffers: RefCell::new(HashMap::new()),
                images: RefCell::new(HashMap::new()),
                logical_device,
                physical_device,
                surface,
                surface_loader,
                instance: Some(instance),
            }),
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    fn open_device(
        instance: &VulkanInstance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        config: &RendererConfig,
    ) -> VulkanResult<(PhysicalDeviceRecord, LogicalDevice, vk_mem::Allocator)> {
        let inventory =
            PhysicalDeviceInventory::enumerate(&instance.instance, surface_loader, surface)?;
        let extensions = required_device_extensions(&config.device_extensions);

        let selected = inventory.select_best(&extensions)?;
        if selected.score == 0 {
            return Err(VulkanError::NoSuitableDevice { best_score: 0 });
        }
        let record = inventory
            .record(selected.index)
            .cloned()
            .ok_or(VulkanError::NoPhysicalDevices)?;
        log::info!("Selected GPU: {} (score {})", record.name, selected.score);

        let logical_device = LogicalDevice::new(&instance.instance, &record, &extensions)?;

        let allocator_info = vk_mem::AllocatorCreateInfo::new(
            &instance.instance,
            &logical_device.device,
            record.handle,
        );
        let allocator = match vk_mem::Allocator::new(allocator_info) {
            Ok(allocator) => allocator,
            Err(e) => {
                logical_device.destroy();
                return Err(VulkanError::Api(e));
            }
        };

        Ok((record, logical_device, allocator))
    }

    /// Selected physical device
    pub const fn physical_device(&self) -> &PhysicalDeviceRecord {
        &self.physical_device
    }

    /// Whether the validation debug messenger is active
    pub fn has_debug_messenger(&self) -> bool {
        self.instance.as_ref().map_or(false, VulkanInstance::has_debug_messenger)
    }

    fn logical(&self) -> &LogicalDevice {
        &self.logical_device
    }

    fn device(&self) -> &ash::Device {
        &self.logical_device.device
    }

    fn allocator(&self) -> VulkanResult<&vk_mem::Allocator> {
        self.allocator.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Allocator already released".to_string(),
        })
    }

    fn shader_module(&self, spirv: &[u8]) -> VulkanResult<vk::ShaderModule> {
        let code = ash::util::read_spv(&mut Cursor::new(spirv)).map_err(|e| {
            VulkanError::InvalidOperation {
                reason: format!("Invalid SPIR-V: {e}"),
            }
        })?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        unsafe { self.device().create_shader_module(&create_info, None).map_err(VulkanError::Api) }
    }

    fn allocation_info(location: MemoryLocation) -> vk_mem::AllocationCreateInfo {
        match location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            MemoryLocation::GpuToCpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        }
    }

    fn mapped_range(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<*mut u8> {
        let buffers = self.buffers.borrow();
        let memory = buffers.get(&buffer).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("Unknown buffer {buffer:?}"),
        })?;

        if memory.mapped.is_null() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Buffer {buffer:?} is not host visible"),
            });
        }
        if offset.checked_add(len).map_or(true, |end| end > memory.size) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Range {offset}+{len} exceeds buffer size {}", memory.size),
            });
        }

        Ok(unsafe { memory.mapped.add(offset as usize) })
    }
}

impl GpuDevice for VulkanContext {
    fn queue_families(&self) -> QueueFamilyAssignment {
        self.physical_device.queues
    }

    fn surface_support(&self) -> VulkanResult<SwapchainSupport> {
        SwapchainSupport::query(&self.surface_loader, self.physical_device.handle, self.surface)
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle().map_err(VulkanError::Api) }
    }

    fn queue_wait_idle(&self, role: QueueRole) -> VulkanResult<()> {
        let queue = self.logical().queue(role)?;
        unsafe { self.device().queue_wait_idle(queue).map_err(VulkanError::Api) }
    }

    fn submit(&self, role: QueueRole, submission: &Submission) -> VulkanResult<()> {
        let queue = self.logical().queue(role)?;
        let command_buffers = [submission.command_buffer];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = submission.wait.into_iter().unzip();
        let signal_semaphores: Vec<_> = submission.signal.into_iter().collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device()
                .queue_submit(
                    queue,
                    &[submit_info.build()],
                    submission.fence.unwrap_or_else(vk::Fence::null),
                )
                .map_err(VulkanError::Api)
        }
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device().create_semaphore(&create_info, None).map_err(VulkanError::Api) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device().destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device().create_fence(&create_info, None).map_err(VulkanError::Api) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device().destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VulkanResult<()> {
        unsafe {
            self.device()
                .wait_for_fences(&[fence], true, timeout)
                .map_err(VulkanError::Api)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        unsafe { self.device().reset_fences(&[fence]).map_err(VulkanError::Api) }
    }

    fn create_command_pool(&self, family: u32, transient: bool) -> VulkanResult<vk::CommandPool> {
        let flags = if transient {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        };
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(flags);
        unsafe { self.device().create_command_pool(&create_info, None).map_err(VulkanError::Api) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device().destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe {
            self.device()
                .allocate_command_buffers(&allocate_info)
                .map_err(VulkanError::Api)
        }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        unsafe { self.device().free_command_buffers(pool, command_buffers) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device()
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> VulkanResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device()
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe { self.device().end_command_buffer(command_buffer).map_err(VulkanError::Api) }
    }

    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(barrier.src_stage)
            .src_access_mask(barrier.src_access)
            .dst_stage_mask(barrier.dst_stage)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: barrier.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        let barriers = [image_barrier];
        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(command_buffer, &dependency_info) }
    }

    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, target: &RenderTarget) {
        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: target.clear_color,
                },
            })
            .build()];

        let depth_attachment = target.depth_view.map(|view| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
                .build()
        });

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe { self.device().cmd_begin_rendering(command_buffer, &rendering_info) }
    }

    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device().cmd_end_rendering(command_buffer) }
    }

    fn cmd_set_viewport_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device().cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device().cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device()
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn cmd_bind_vertex_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe { self.device().cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[0]) }
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device().cmd_bind_index_buffer(command_buffer, buffer, 0, index_type) }
    }

    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32) {
        unsafe { self.device().cmd_draw_indexed(command_buffer, index_count, 1, 0, 0, 0) }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device().cmd_copy_buffer(command_buffer, src, dst, &[region]) }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VulkanResult<vk::SwapchainKHR> {
        let sharing_mode = if request.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(request.image_count)
            .image_format(request.surface_format.format)
            .image_color_space(request.surface_format.color_space)
            .image_extent(request.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(concurrent_families(request.queue_families))
            .pre_transform(request.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(request.present_mode)
            .clipped(true);

        unsafe {
            self.logical()
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VulkanResult<Vec<vk::Image>> {
        unsafe {
            self.logical()
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.logical().swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device().create_image_view(&create_info, None).map_err(VulkanError::Api) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device().destroy_image_view(view, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VulkanResult<AcquireOutcome> {
        let result = unsafe {
            self.logical()
                .swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VulkanResult<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.logical()
                .swapchain_loader
                .queue_present(self.logical().queues.present, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation> {
        let sharing_mode = if request.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(concurrent_families(request.queue_families));

        let allocator = self.allocator()?;
        let allocation_info = Self::allocation_info(request.location);
        let (buffer, allocation) = unsafe {
            allocator
                .create_buffer(&buffer_info, &allocation_info)
                .map_err(|e| allocation_error(e, request.size))?
        };

        let mapped = if request.location.is_mapped() {
            allocator.get_allocation_info(&allocation).mapped_data.cast::<u8>()
        } else {
            std::ptr::null_mut()
        };

        self.buffers.borrow_mut().insert(
            buffer,
            BufferMemory {
                allocation,
                mapped,
                size: request.size,
            },
        );

        log::trace!("Created buffer {:?}: {} bytes, {:?}", buffer, request.size, request.location);

        Ok(BufferAllocation {
            buffer,
            size: request.size,
            location: request.location,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut memory) = self.buffers.borrow_mut().remove(&buffer) else {
            log::warn!("Destroying unknown buffer {:?}", buffer);
            return;
        };
        if let Some(allocator) = self.allocator.as_ref() {
            unsafe { allocator.destroy_buffer(buffer, &mut memory.allocation) };
        }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VulkanResult<()> {
        let dst = self.mapped_range(buffer, offset, data.len() as vk::DeviceSize)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, len: vk::DeviceSize) -> VulkanResult<Vec<u8>> {
        let src = self.mapped_range(buffer, 0, len)?;
        let mut bytes = vec![0u8; len as usize];
        unsafe { std::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), bytes.len()) };
        Ok(bytes)
    }

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()> {
        self.mapped_range(buffer, offset, len)?;
        let buffers = self.buffers.borrow();
        let Some(memory) = buffers.get(&buffer) else {
            return Ok(());
        };
        self.allocator()?
            .flush_allocation(&memory.allocation, offset as usize, len as usize)
            .map_err(VulkanError::Api)
    }

    fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VulkanResult<()> {
        self.mapped_range(buffer, offset, len)?;
        let buffers = self.buffers.borrow();
        let Some(memory) = buffers.get(&buffer) else {
            return Ok(());
        };
        self.allocator()?
            .invalidate_allocation(&memory.allocation, offset as usize, len as usize)
            .map_err(VulkanError::Api)
    }

    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(request.format)
            .extent(vk::Extent3D {
                width: request.extent.width,
                height: request.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let allocator = self.allocator()?;
        let allocation_info = Self::allocation_info(MemoryLocation::GpuOnly);
        let requested = u64::from(request.extent.width) * u64::from(request.extent.height) * 4;
        let (image, mut allocation) = unsafe {
            allocator
                .create_image(&image_info, &allocation_info)
                .map_err(|e| allocation_error(e, requested))?
        };

        let view = match self.create_image_view(image, request.format, request.aspect) {
            Ok(view) => view,
            Err(e) => {
                unsafe { allocator.destroy_image(image, &mut allocation) };
                return Err(e);
            }
        };

        self.images.borrow_mut().insert(image, allocation);

        Ok(ImageAllocation {
            image,
            view,
            format: request.format,
            extent: request.extent,
            aspect: request.aspect,
        })
    }

    fn destroy_image(&self, image: &ImageAllocation) {
        self.destroy_image_view(image.view);
        let Some(mut allocation) = self.images.borrow_mut().remove(&image.image) else {
            log::warn!("Destroying unknown image {:?}", image.image);
            return;
        };
        if let Some(allocator) = self.allocator.as_ref() {
            unsafe { allocator.destroy_image(image.image, &mut allocation) };
        }
    }

    fn create_graphics_pipeline(&self, request: &PipelineRequest) -> VulkanResult<PipelineHandles> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(request.set_layouts);
        let layout = unsafe {
            self.device()
                .create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let vertex_module = self.shader_module(request.vertex_spirv)?;
        let fragment_module = match self.shader_module(request.fragment_spirv) {
            Ok(module) => module,
            Err(e) => {
                unsafe {
                    self.device().destroy_shader_module(vertex_module, None);
                    self.device().destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };

        let entry_point = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(entry_point)
                .build(),
        ];

        let bindings = [request.vertex_layout.binding_description()];
        let attributes = request.vertex_layout.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let color_formats = [request.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(request.depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info)
            .build();

        let result = unsafe {
            self.device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        unsafe {
            self.device().destroy_shader_module(vertex_module, None);
            self.device().destroy_shader_module(fragment_module, None);
        }

        match result {
            Ok(pipelines) => Ok(PipelineHandles {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                Err(VulkanError::Api(e))
            }
        }
    }

    fn destroy_graphics_pipeline(&self, handles: PipelineHandles) {
        unsafe {
            self.device().destroy_pipeline(handles.pipeline, None);
            self.device().destroy_pipeline_layout(handles.layout, None);
        }
    }

    fn create_uniform_set_layout(
        &self,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(stages)
            .build()];
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe {
            self.device()
                .create_descriptor_set_layout(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device().destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> VulkanResult<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: max_sets,
        }];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);
        unsafe {
            self.device()
                .create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device().destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe {
            self.device()
                .allocate_descriptor_sets(&allocate_info)
                .map_err(VulkanError::Api)
        }
    }

    fn write_uniform_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { self.device().update_descriptor_sets(&[write], &[]) }
    }

    fn release_allocator(&mut self) {
        let Some(allocator) = self.allocator.take() else {
            return;
        };

        let leaked_buffers: Vec<_> = self.buffers.get_mut().drain().collect();
        for (buffer, mut memory) in leaked_buffers {
            log::warn!(
                "Buffer {:?} ({} bytes) still alive at shutdown, releasing",
                buffer,
                memory.size
            );
            unsafe { allocator.destroy_buffer(buffer, &mut memory.allocation) };
        }

        let leaked_images: Vec<_> = self.images.get_mut().drain().collect();
        for (image, mut allocation) in leaked_images {
            log::warn!("Image {:?} still alive at shutdown, releasing", image);
            unsafe { allocator.destroy_image(image, &mut allocation) };
        }

        drop(allocator);
        log::debug!("Memory allocator released");
    }

    fn shutdown(&mut self) {
        if self.instance.is_none() {
            return;
        }

        self.release_allocator();

        self.logical_device.destroy();
        log::debug!("Logical device destroyed");

        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        self.surface = vk::SurfaceKHR::null();

        if let Some(instance) = self.instance.take() {
            drop(instance);
            log::info!("Vulkan instance destroyed");
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_errors_map_to_out_of_memory() {
        assert!(matches!(
            allocation_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, 64),
            VulkanError::OutOfMemory { requested: 64 }
        ));
        assert!(matches!(
            allocation_error(vk::Result::ERROR_INITIALIZATION_FAILED, 64),
            VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn test_error_messages_name_the_failed_step() {
        let error = VulkanError::Shader {
            path: "shaders/vert.spv".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(error.to_string(), "Shader 'shaders/vert.spv': not found");
        assert_eq!(
            VulkanError::NoSuitableDevice { best_score: 0 }.to_string(),
            "No suitable GPU found (best score 0)"
        );
    }
}
