//! Resource factory
//!
//! Creates vertex, index and uniform buffers on behalf of the application.
//!
//! - **Static** buffers are device-local. Their contents go through a
//!   host-visible staging buffer and a one-shot copy on the transfer queue;
//!   the call blocks until the copy has completed and the staging buffer is
//!   gone.
//! - **Dynamic** and **Stream** buffers are host-visible and persistently
//!   mapped; [`ResourceFactory::upload_data`] writes straight into them.
//!
//! The factory does not track what it hands out. Deleting a buffer that a
//! submitted frame still reads is the caller's mistake.

use ash::vk;

use crate::render::api::{BufferUsage, IndexBufferDesc, IndexWidth, VertexBufferDesc};
use crate::render::backends::gpu::{BufferRequest, GpuDevice, MemoryLocation, QueueRole};
use crate::render::backends::vulkan::rendering::commands::SingleTimeCommand;
use crate::render::backends::vulkan::{
    GpuBuffer, ImageState, ImageStateTracker, IndexBuffer, UniformBuffer, UploadCommands,
    VertexBuffer, VulkanError, VulkanResult,
};

/// Borrowed view over the device and the upload command pools
pub struct ResourceFactory<'a, D: GpuDevice> {
    device: &'a D,
    uploads: &'a UploadCommands,
}

impl<'a, D: GpuDevice> ResourceFactory<'a, D> {
    /// Factory allocating from `device` and uploading through `uploads`
    pub const fn new(device: &'a D, uploads: &'a UploadCommands) -> Self {
        Self { device, uploads }
    }

    /// Create a vertex buffer described by `desc`
    pub fn create_vertex_buffer(&self, desc: &VertexBufferDesc) -> VulkanResult<VertexBuffer> {
        let buffer = self.create_buffer(
            desc.data,
            desc.size_in_bytes,
            desc.element_count,
            desc.usage,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        log::debug!(
            "Created {:?} vertex buffer: {} vertices, {} bytes",
            desc.usage,
            desc.element_count,
            desc.size_in_bytes
        );
        Ok(VertexBuffer::new(buffer))
    }

    /// Create an index buffer described by `desc`; only 16 and 32-bit indices
    /// are accepted
    pub fn create_index_buffer(&self, desc: &IndexBufferDesc) -> VulkanResult<IndexBuffer> {
        if matches!(desc.index_width, IndexWidth::U8 | IndexWidth::U64) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Unsupported index width {:?}", desc.index_width),
            });
        }
        let expected = u64::from(desc.element_count) * desc.index_width.size_in_bytes();
        if expected > desc.size_in_bytes {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "{} indices of {:?} need {} bytes, buffer has {}",
                    desc.element_count, desc.index_width, expected, desc.size_in_bytes
                ),
            });
        }

        let buffer = self.create_buffer(
            desc.data,
            desc.size_in_bytes,
            desc.element_count,
            desc.usage,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        log::debug!(
            "Created {:?} index buffer: {} x {:?}",
            desc.usage,
            desc.element_count,
            desc.index_width
        );
        Ok(IndexBuffer::new(buffer, desc.index_width))
    }

    /// Create a mapped uniform buffer of `size` bytes
    pub fn create_uniform_buffer(&self, size: vk::DeviceSize) -> VulkanResult<UniformBuffer> {
        let buffer = self.create_buffer(
            &[],
            size,
            1,
            BufferUsage::Dynamic,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        Ok(UniformBuffer::new(buffer))
    }

    fn create_buffer(
        &self,
        data: &[u8],
        size: vk::DeviceSize,
        element_count: u32,
        usage: BufferUsage,
        usage_flags: vk::BufferUsageFlags,
    ) -> VulkanResult<GpuBuffer> {
        if size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "Buffer size must be non-zero".to_string(),
            });
        }
        if data.len() as u64 > size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("{} bytes of data exceed buffer size {}", data.len(), size),
            });
        }

        if usage.is_host_mapped() {
            self.create_mapped(data, size, element_count, usage, usage_flags)
        } else {
            self.create_static(data, size, element_count, usage_flags)
        }
    }

    fn create_mapped(
        &self,
        data: &[u8],
        size: vk::DeviceSize,
        element_count: u32,
        usage: BufferUsage,
        usage_flags: vk::BufferUsageFlags,
    ) -> VulkanResult<GpuBuffer> {
        let allocation = self.device.create_buffer(&BufferRequest {
            size,
            usage: usage_flags | vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            queue_families: &[],
        })?;

        if !data.is_empty() {
            if let Err(e) = self.write_mapped(allocation.buffer, data) {
                self.device.destroy_buffer(allocation.buffer);
                return Err(e);
            }
        }

        Ok(GpuBuffer::new(allocation, element_count, usage))
    }

    fn create_static(
        &self,
        data: &[u8],
        size: vk::DeviceSize,
        element_count: u32,
        usage_flags: vk::BufferUsageFlags,
    ) -> VulkanResult<GpuBuffer> {
        if data.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "Static buffers need their contents at creation".to_string(),
            });
        }

        let families = self
            .device
            .queue_families()
            .sharing_between(QueueRole::Graphics, QueueRole::Transfer);
        let allocation = self.device.create_buffer(&BufferRequest {
            size,
            usage: usage_flags
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::GpuOnly,
            queue_families: &families,
        })?;

        if let Err(e) = self.stage_into(allocation.buffer, data) {
            self.device.destroy_buffer(allocation.buffer);
            return Err(e);
        }

        Ok(GpuBuffer::new(allocation, element_count, BufferUsage::Static))
    }

    /// Copy `data` into the device-local `destination` through a staging buffer
    fn stage_into(&self, destination: vk::Buffer, data: &[u8]) -> VulkanResult<()> {
        let len = data.len() as vk::DeviceSize;
        let staging = self.device.create_buffer(&BufferRequest {
            size: len,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            queue_families: &[],
        })?;

        let result = self.write_mapped(staging.buffer, data).and_then(|()| {
            self.uploads.run(self.device, QueueRole::Transfer, |command_buffer| {
                self.device.cmd_copy_buffer(command_buffer, staging.buffer, destination, len);
            })
        });

        self.device.destroy_buffer(staging.buffer);
        result
    }

    /// Overwrite the start of a mapped buffer with `data`
    pub fn upload_data(&self, buffer: &impl AsRef<GpuBuffer>, data: &[u8]) -> VulkanResult<()> {
        let buffer = buffer.as_ref();
        if !buffer.usage().is_host_mapped() {
            return Err(VulkanError::InvalidOperation {
                reason: "Static buffers are immutable after creation".to_string(),
            });
        }
        if data.len() as u64 > buffer.size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "{} bytes of data exceed buffer size {}",
                    data.len(),
                    buffer.size()
                ),
            });
        }
        self.write_mapped(buffer.handle(), data)
    }

    /// Read the whole buffer back to the host
    ///
    /// Mapped buffers are read directly. Device-local buffers are copied into a
    /// host-visible buffer with a single-time transfer command first.
    pub fn read_back(&self, buffer: &impl AsRef<GpuBuffer>) -> VulkanResult<Vec<u8>> {
        let buffer = buffer.as_ref();
        if buffer.location().is_mapped() {
            return self.read_mapped(buffer.handle(), buffer.size());
        }

        let readback = self.device.create_buffer(&BufferRequest {
            size: buffer.size(),
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuToCpu,
            queue_families: &[],
        })?;

        let result = self
            .uploads
            .run(self.device, QueueRole::Transfer, |command_buffer| {
                self.device.cmd_copy_buffer(
                    command_buffer,
                    buffer.handle(),
                    readback.buffer,
                    buffer.size(),
                );
            })
            .and_then(|()| self.read_mapped(readback.buffer, buffer.size()));

        self.device.destroy_buffer(readback.buffer);
        result
    }

    /// Write through the mapping and flush so the next submission sees it
    fn write_mapped(&self, buffer: vk::Buffer, data: &[u8]) -> VulkanResult<()> {
        self.device.write_buffer(buffer, 0, data)?;
        self.device.flush_buffer(buffer, 0, data.len() as vk::DeviceSize)
    }

    fn read_mapped(&self, buffer: vk::Buffer, len: vk::DeviceSize) -> VulkanResult<Vec<u8>> {
        self.device.invalidate_buffer(buffer, 0, len)?;
        self.device.read_buffer(buffer, len)
    }

    /// Destroy a vertex buffer
    pub fn delete_vertex_buffer(&self, buffer: VertexBuffer) {
        self.delete(buffer.into_inner());
    }

    /// Destroy an index buffer
    pub fn delete_index_buffer(&self, buffer: IndexBuffer) {
        self.delete(buffer.into_inner());
    }

    /// Destroy a uniform buffer
    pub fn delete_uniform_buffer(&self, buffer: UniformBuffer) {
        self.delete(buffer.into_inner());
    }

    fn delete(&self, buffer: GpuBuffer) {
        log::trace!("Destroying buffer {:?} ({} bytes)", buffer.handle(), buffer.size());
        self.device.destroy_buffer(buffer.handle());
    }

    /// Start a one-shot command buffer on `role`'s queue
    pub fn begin_single_time_command(&self, role: QueueRole) -> VulkanResult<SingleTimeCommand> {
        self.uploads.begin_single_time(self.device, role)
    }

    /// Submit a one-shot command buffer and block until its queue is idle
    pub fn end_single_time_command(&self, command: SingleTimeCommand) -> VulkanResult<()> {
        self.uploads.end_single_time(self.device, command)
    }

    /// Move `image` to `target` with a single-time command on the graphics queue
    pub fn transition_image_layout(
        &self,
        tracker: &mut ImageStateTracker,
        image: vk::Image,
        target: ImageState,
    ) -> VulkanResult<()> {
        let Some(barrier) = tracker.transition(image, target) else {
            return Ok(());
        };
        self.uploads.run(self.device, QueueRole::Graphics, |command_buffer| {
            self.device.cmd_image_barrier(command_buffer, &barrier);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::mock::{default_surface_support, Call, ObjectKind, RecordingDevice};
    use crate::render::backends::vulkan::QueueFamilyAssignment;
    use ash::vk::Handle;

    fn setup() -> (RecordingDevice, UploadCommands) {
        let device = RecordingDevice::new();
        let uploads = UploadCommands::new(&device).unwrap();
        (device, uploads)
    }

    #[test]
    fn test_static_vertex_buffer_round_trip() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let vertices: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];

        let buffer = factory
            .create_vertex_buffer(&VertexBufferDesc::from_slice(&vertices, BufferUsage::Static))
            .unwrap();

        let bytes = factory.read_back(&buffer).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<[f32; 3], u8>(&vertices));
        assert_eq!(AsRef::<GpuBuffer>::as_ref(&buffer).location(), MemoryLocation::GpuOnly);

        // destination stays, staging and readback buffers are gone
        assert_eq!(device.live(ObjectKind::Buffer), 1);
        assert_eq!(
            device.count_calls(|call| matches!(call, Call::QueueWaitIdle(QueueRole::Transfer))),
            2
        );

        factory.delete_vertex_buffer(buffer);
        assert_eq!(device.live(ObjectKind::Buffer), 0);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_staging_is_flushed_before_transfer_submit() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        factory
            .create_index_buffer(&IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static))
            .unwrap();

        let calls = device.calls();
        let staging = calls
            .iter()
            .find_map(|call| match call {
                Call::CreateBuffer {
                    buffer,
                    location: MemoryLocation::CpuToGpu,
                    ..
                } => Some(*buffer),
                _ => None,
            })
            .unwrap();
        let flush = calls
            .iter()
            .position(|call| {
                matches!(call, Call::FlushBuffer { buffer, len: 6, .. } if *buffer == staging)
            })
            .unwrap();
        let submit = calls
            .iter()
            .position(|call| matches!(call, Call::Submit { role: QueueRole::Transfer, .. }))
            .unwrap();
        assert!(flush < submit);
    }

    #[test]
    fn test_dynamic_buffers_flush_every_upload() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let buffer = factory
            .create_vertex_buffer(&VertexBufferDesc::empty(8, 1, BufferUsage::Dynamic))
            .unwrap();
        factory.upload_data(&buffer, &[1, 2, 3, 4]).unwrap();
        factory.upload_data(&buffer, &[5, 6]).unwrap();

        let handle = AsRef::<GpuBuffer>::as_ref(&buffer).handle();
        assert_eq!(device.buffer_contents(handle), Some(vec![5, 6, 3, 4, 0, 0, 0, 0]));
        assert_eq!(device.count_calls(|call| matches!(call, Call::FlushBuffer { .. })), 2);
    }

    #[test]
    fn test_static_buffer_shares_graphics_and_transfer_families() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        factory
            .create_index_buffer(&IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static))
            .unwrap();

        let families: Vec<Vec<u32>> = device
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateBuffer {
                    location: MemoryLocation::GpuOnly,
                    queue_families,
                    ..
                } => Some(queue_families),
                _ => None,
            })
            .collect();
        assert_eq!(families, vec![vec![0, 1]]);
    }

    #[test]
    fn test_single_family_device_uses_exclusive_sharing() {
        let device = RecordingDevice::with_setup(
            default_surface_support(),
            QueueFamilyAssignment {
                graphics: Some(0),
                present: Some(0),
                transfer: Some(0),
                compute: None,
            },
        );
        let uploads = UploadCommands::new(&device).unwrap();
        let factory = ResourceFactory::new(&device, &uploads);
        factory
            .create_index_buffer(&IndexBufferDesc::from_u32(&[0, 1, 2], BufferUsage::Static))
            .unwrap();

        let concurrent = device.count_calls(|call| {
            matches!(call, Call::CreateBuffer { queue_families, .. } if !queue_families.is_empty())
        });
        assert_eq!(concurrent, 0);
    }

    #[test]
    fn test_dynamic_upload_overwrites() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let buffer = factory
            .create_vertex_buffer(&VertexBufferDesc::empty(4, 1, BufferUsage::Dynamic))
            .unwrap();

        factory.upload_data(&buffer, &[1, 2, 3, 4]).unwrap();
        factory.upload_data(&buffer, &[5, 6, 7, 8]).unwrap();
        assert_eq!(factory.read_back(&buffer).unwrap(), vec![5, 6, 7, 8]);
        assert_eq!(device.count_calls(|call| matches!(call, Call::CopyBuffer { .. })), 0);

        assert!(factory.upload_data(&buffer, &[0; 5]).is_err());
    }

    #[test]
    fn test_static_buffers_reject_uploads() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let buffer = factory
            .create_vertex_buffer(&VertexBufferDesc::from_slice(
                &[1.0f32, 2.0],
                BufferUsage::Static,
            ))
            .unwrap();
        assert!(matches!(
            factory.upload_data(&buffer, &[0; 4]),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_unsupported_index_widths_rejected() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        for width in [IndexWidth::U8, IndexWidth::U64] {
            let desc = IndexBufferDesc {
                data: &[0; 8],
                size_in_bytes: 8,
                element_count: 1,
                usage: BufferUsage::Static,
                index_width: width,
            };
            assert!(matches!(
                factory.create_index_buffer(&desc),
                Err(VulkanError::InvalidOperation { .. })
            ));
        }
        assert_eq!(device.live(ObjectKind::Buffer), 0);
    }

    #[test]
    fn test_empty_static_buffer_rejected() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        assert!(factory
            .create_vertex_buffer(&VertexBufferDesc::empty(16, 1, BufferUsage::Static))
            .is_err());
    }

    #[test]
    fn test_uniform_buffer_is_mapped() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let buffer = factory.create_uniform_buffer(64).unwrap();
        factory.upload_data(&buffer, &[9; 64]).unwrap();
        assert_eq!(factory.read_back(&buffer).unwrap(), vec![9; 64]);
        factory.delete_uniform_buffer(buffer);
    }

    #[test]
    fn test_transition_image_layout_records_one_barrier() {
        let (device, uploads) = setup();
        let factory = ResourceFactory::new(&device, &uploads);
        let mut tracker = ImageStateTracker::new();
        let image = vk::Image::from_raw(4242);

        factory
            .transition_image_layout(&mut tracker, image, ImageState::COLOR_ATTACHMENT)
            .unwrap();
        assert_eq!(tracker.state(image), Some(ImageState::COLOR_ATTACHMENT));
        assert_eq!(device.count_calls(|call| matches!(call, Call::ImageBarrier(_))), 1);
        assert_eq!(
            device.count_calls(|call| matches!(call, Call::QueueWaitIdle(QueueRole::Graphics))),
            1
        );
    }
}
