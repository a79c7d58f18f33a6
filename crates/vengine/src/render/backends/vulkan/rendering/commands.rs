//! Command buffer management
//!
//! [`UploadCommands`] provides one-shot command buffers for uploads and layout
//! transitions. [`CommandSubmissionPipeline`] owns the per-frame command
//! buffers and records the begin/draw/end sequence of a frame.

use ash::vk;

use crate::render::backends::gpu::{GpuDevice, QueueRole, RenderTarget, Submission};
use crate::render::backends::vulkan::{
    GpuBuffer, GraphicsPipeline, ImageState, ImageStateTracker, IndexBuffer, VertexBuffer,
    VulkanError, VulkanResult,
};

/// A command buffer recording outside the frame loop
#[derive(Debug)]
#[must_use = "a single-time command must be ended with UploadCommands::end_single_time"]
pub struct SingleTimeCommand {
    command_buffer: vk::CommandBuffer,
    role: QueueRole,
}

impl SingleTimeCommand {
    /// Command buffer to record into
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Queue the command will be submitted to
    pub const fn role(&self) -> QueueRole {
        self.role
    }
}

/// Transient command pools on the graphics and transfer families
#[derive(Debug)]
pub struct UploadCommands {
    graphics_pool: vk::CommandPool,
    transfer_pool: vk::CommandPool,
}

impl UploadCommands {
    /// Create one transient pool per role
    pub fn new<D: GpuDevice>(device: &D) -> VulkanResult<Self> {
        let families = device.queue_families();
        let (Some(graphics), Some(transfer)) = (families.graphics, families.transfer) else {
            return Err(VulkanError::IncompleteQueueFamilies);
        };

        let graphics_pool = device.create_command_pool(graphics, true)?;
        let transfer_pool = match device.create_command_pool(transfer, true) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_command_pool(graphics_pool);
                return Err(e);
            }
        };

        Ok(Self {
            graphics_pool,
            transfer_pool,
        })
    }

    fn pool(&self, role: QueueRole) -> VulkanResult<vk::CommandPool> {
        match role {
            QueueRole::Graphics => Ok(self.graphics_pool),
            QueueRole::Transfer => Ok(self.transfer_pool),
            QueueRole::Present | QueueRole::Compute => Err(VulkanError::InvalidOperation {
                reason: format!("No single-time command pool for {role:?}"),
            }),
        }
    }

    /// Allocate a command buffer for `role` and begin it with one-time submit
    pub fn begin_single_time<D: GpuDevice>(
        &self,
        device: &D,
        role: QueueRole,
    ) -> VulkanResult<SingleTimeCommand> {
        let pool = self.pool(role)?;
        let command_buffer = device
            .allocate_command_buffers(pool, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Command buffer allocation returned nothing".to_string(),
            })?;

        if let Err(e) = device.begin_command_buffer(command_buffer, true) {
            device.free_command_buffers(pool, &[command_buffer]);
            return Err(e);
        }

        Ok(SingleTimeCommand { command_buffer, role })
    }

    /// End, submit and wait for the queue to drain, then free the command buffer
    pub fn end_single_time<D: GpuDevice>(
        &self,
        device: &D,
        command: SingleTimeCommand,
    ) -> VulkanResult<()> {
        let pool = self.pool(command.role)?;
        let result = Self::execute(device, &command);
        device.free_command_buffers(pool, &[command.command_buffer]);
        result
    }

    fn execute<D: GpuDevice>(device: &D, command: &SingleTimeCommand) -> VulkanResult<()> {
        device.end_command_buffer(command.command_buffer)?;
        device.submit(
            command.role,
            &Submission {
                command_buffer: command.command_buffer,
                wait: None,
                signal: None,
                fence: None,
            },
        )?;
        device.queue_wait_idle(command.role)
    }

    /// Record, submit and wait for `record` in one call
    pub fn run<D: GpuDevice>(
        &self,
        device: &D,
        role: QueueRole,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> VulkanResult<()> {
        let command = self.begin_single_time(device, role)?;
        record(command.command_buffer());
        self.end_single_time(device, command)
    }

    /// Destroy both pools
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        for pool in [&mut self.graphics_pool, &mut self.transfer_pool] {
            if *pool != vk::CommandPool::null() {
                device.destroy_command_pool(*pool);
                *pool = vk::CommandPool::null();
            }
        }
    }
}

/// Color and optional depth attachment of one frame
#[derive(Debug, Clone, Copy)]
pub struct FrameAttachments {
    /// Swapchain image rendered into
    pub color_image: vk::Image,
    /// View of `color_image`
    pub color_view: vk::ImageView,
    /// Depth image and view
    pub depth: Option<(vk::Image, vk::ImageView)>,
    /// Render area
    pub extent: vk::Extent2D,
}

/// Per-frame command buffers and the recording of a frame
#[derive(Debug)]
pub struct CommandSubmissionPipeline {
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    recording: Option<(vk::CommandBuffer, vk::Image)>,
}

impl CommandSubmissionPipeline {
    /// Create a resettable graphics pool with `frames` primary command buffers
    pub fn new<D: GpuDevice>(device: &D, frames: u32) -> VulkanResult<Self> {
        let graphics = device
            .queue_families()
            .graphics
            .ok_or(VulkanError::IncompleteQueueFamilies)?;

        let pool = device.create_command_pool(graphics, false)?;
        let command_buffers = match device.allocate_command_buffers(pool, frames) {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };

        Ok(Self {
            pool,
            command_buffers,
            recording: None,
        })
    }

    /// One command buffer per frame slot
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// Whether a begin is outstanding
    pub const fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Transition the attachments to writable layouts, begin rendering and set
    /// the dynamic viewport and scissor
    pub fn begin<D: GpuDevice>(
        &mut self,
        device: &D,
        command_buffer: vk::CommandBuffer,
        tracker: &mut ImageStateTracker,
        attachments: &FrameAttachments,
        clear_color: [f32; 4],
    ) {
        tracker.acquired(attachments.color_image);
        let barrier = tracker.transition(attachments.color_image, ImageState::COLOR_ATTACHMENT);
        if let Some(barrier) = barrier {
            device.cmd_image_barrier(command_buffer, &barrier);
        }
        if let Some((depth_image, _)) = attachments.depth {
            if let Some(barrier) = tracker.transition(depth_image, ImageState::DEPTH_ATTACHMENT) {
                device.cmd_image_barrier(command_buffer, &barrier);
            }
        }

        device.cmd_begin_rendering(
            command_buffer,
            &RenderTarget {
                extent: attachments.extent,
                color_view: attachments.color_view,
                clear_color,
                depth_view: attachments.depth.map(|(_, view)| view),
            },
        );
        device.cmd_set_viewport_scissor(command_buffer, attachments.extent);

        self.recording = Some((command_buffer, attachments.color_image));
    }

    /// Bind pipeline, uniform set and buffers, then draw every index
    pub fn submit_geometry<D: GpuDevice>(
        &self,
        device: &D,
        pipeline: &GraphicsPipeline,
        descriptor_set: Option<vk::DescriptorSet>,
        vertex_buffer: &VertexBuffer,
        index_buffer: &IndexBuffer,
    ) -> VulkanResult<()> {
        let Some((command_buffer, _)) = self.recording else {
            return Err(VulkanError::InvalidOperation {
                reason: "submit_geometry outside begin/end".to_string(),
            });
        };

        let handles = pipeline.handles();
        device.cmd_bind_pipeline(command_buffer, handles.pipeline);
        if let Some(set) = descriptor_set {
            device.cmd_bind_descriptor_set(command_buffer, handles.layout, set);
        }
        device.cmd_bind_vertex_buffer(
            command_buffer,
            AsRef::<GpuBuffer>::as_ref(vertex_buffer).handle(),
        );
        device.cmd_bind_index_buffer(
            command_buffer,
            AsRef::<GpuBuffer>::as_ref(index_buffer).handle(),
            index_buffer.index_type(),
        );
        device.cmd_draw_indexed(command_buffer, index_buffer.index_count());
        Ok(())
    }

    /// End rendering, transition the color image for presentation and end
    /// the command buffer
    pub fn end<D: GpuDevice>(
        &mut self,
        device: &D,
        tracker: &mut ImageStateTracker,
    ) -> VulkanResult<()> {
        let Some((command_buffer, color_image)) = self.recording.take() else {
            return Err(VulkanError::InvalidOperation {
                reason: "end without begin".to_string(),
            });
        };

        device.cmd_end_rendering(command_buffer);
        if let Some(barrier) = tracker.transition(color_image, ImageState::PRESENTED) {
            device.cmd_image_barrier(command_buffer, &barrier);
        }
        device.end_command_buffer(command_buffer)
    }

    /// Drop an outstanding recording; the command buffer is reset on its next use
    pub fn discard(&mut self) {
        self.recording = None;
    }

    /// Destroy the pool and its command buffers
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        if self.pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.pool);
            self.pool = vk::CommandPool::null();
            self.command_buffers.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::mock::{Call, ObjectKind, RecordingDevice};
    use ash::vk::Handle;

    #[test]
    fn test_single_time_command_waits_and_frees() {
        let device = RecordingDevice::new();
        let mut uploads = UploadCommands::new(&device).unwrap();

        uploads.run(&device, QueueRole::Transfer, |_| {}).unwrap();

        let calls = device.calls();
        let submit = calls
            .iter()
            .position(|call| {
                matches!(call, Call::Submit { role: QueueRole::Transfer, fence: None, .. })
            })
            .unwrap();
        let wait = calls
            .iter()
            .position(|call| matches!(call, Call::QueueWaitIdle(QueueRole::Transfer)))
            .unwrap();
        assert!(submit < wait);
        assert_eq!(device.live(ObjectKind::CommandBuffer), 0);
        assert!(device.violations().is_empty());

        uploads.destroy(&device);
        assert_eq!(device.live(ObjectKind::CommandPool), 0);
    }

    #[test]
    fn test_single_time_rejects_present_role() {
        let device = RecordingDevice::new();
        let uploads = UploadCommands::new(&device).unwrap();
        assert!(uploads.begin_single_time(&device, QueueRole::Present).is_err());
    }

    #[test]
    fn test_begin_end_barrier_sequence() {
        let device = RecordingDevice::new();
        let mut pipeline = CommandSubmissionPipeline::new(&device, 2).unwrap();
        let mut tracker = ImageStateTracker::new();
        let cb = pipeline.command_buffers()[0];
        device.begin_command_buffer(cb, true).unwrap();

        let attachments = FrameAttachments {
            color_image: vk::Image::from_raw(900),
            color_view: vk::ImageView::from_raw(901),
            depth: None,
            extent: vk::Extent2D { width: 800, height: 600 },
        };
        pipeline.begin(&device, cb, &mut tracker, &attachments, [0.0, 0.0, 0.0, 1.0]);
        assert!(pipeline.is_recording());
        pipeline.end(&device, &mut tracker).unwrap();
        assert!(!pipeline.is_recording());

        let barriers: Vec<_> = device
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ImageBarrier(barrier) => Some(barrier),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers[1].old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers[1].new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            device.count_calls(|call| {
                matches!(call, Call::SetViewportScissor(e) if e.width == 800 && e.height == 600)
            }),
            1
        );
    }

    #[test]
    fn test_end_without_begin_is_rejected() {
        let device = RecordingDevice::new();
        let mut pipeline = CommandSubmissionPipeline::new(&device, 1).unwrap();
        let mut tracker = ImageStateTracker::new();
        assert!(pipeline.end(&device, &mut tracker).is_err());
    }
}
