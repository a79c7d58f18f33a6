//! Frame pacing
//!
//! Up to N frames are in flight at once, each owning a [`FrameSlot`]: an
//! image-available semaphore, a render-finished semaphore, an in-flight fence
//! (created signaled) and a command buffer. A cursor walks the slots modulo N.
//!
//! Per logical frame the slot moves through
//!
//! ```text
//! Idle -> Acquiring -> Recording -> Submitted -> Presenting -> Idle (cursor advances)
//!            |
//!            +-- swapchain stale -> Idle (fence untouched, cursor stays)
//! ```
//!
//! The fence is only reset once an image is actually acquired, so a slot's
//! command buffer is never reset while its previous submission may still run.

use ash::vk;

use crate::render::backends::gpu::{
    AcquireOutcome, GpuDevice, PresentOutcome, QueueRole, Submission,
};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Where a slot is in the frame protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not used by the current frame
    Idle,
    /// Fence waited, waiting on image acquisition
    Acquiring,
    /// Image acquired, command buffer recording
    Recording,
    /// Command buffer submitted
    Submitted,
    /// Queued for presentation
    Presenting,
}

/// Synchronization objects and command buffer of one in-flight frame
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Signaled when the acquired image is ready
    pub image_available: vk::Semaphore,
    /// Signaled when rendering into the image completes
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's submission completes
    pub in_flight: vk::Fence,
    /// Primary command buffer recorded each frame
    pub command_buffer: vk::CommandBuffer,
    /// Protocol state
    pub state: SlotState,
}

/// Owner of the frame slots and the frame cursor
#[derive(Debug)]
pub struct FrameSyncController {
    slots: Vec<FrameSlot>,
    frame_index: usize,
    frames_presented: u64,
}

impl FrameSyncController {
    /// Create one slot per command buffer
    pub fn new<D: GpuDevice>(
        device: &D,
        command_buffers: &[vk::CommandBuffer],
    ) -> VulkanResult<Self> {
        if command_buffers.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "At least one frame in flight is required".to_string(),
            });
        }

        let mut controller = Self {
            slots: Vec::with_capacity(command_buffers.len()),
            frame_index: 0,
            frames_presented: 0,
        };

        for &command_buffer in command_buffers {
            match Self::create_slot(device, command_buffer) {
                Ok(slot) => controller.slots.push(slot),
                Err(e) => {
                    controller.destroy(device);
                    return Err(e);
                }
            }
        }

        log::debug!("Created {} frame slots", controller.slots.len());
        Ok(controller)
    }

    fn create_slot<D: GpuDevice>(
        device: &D,
        command_buffer: vk::CommandBuffer,
    ) -> VulkanResult<FrameSlot> {
        let image_available = device.create_semaphore()?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        let in_flight = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_semaphore(render_finished);
                return Err(e);
            }
        };

        Ok(FrameSlot {
            image_available,
            render_finished,
            in_flight,
            command_buffer,
            state: SlotState::Idle,
        })
    }

    /// Number of slots
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Cursor position, always below `frames_in_flight`
    pub const fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Frames that went through a present call
    pub const fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Slot under the cursor
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.frame_index]
    }

    /// Block until the current slot's previous submission has completed
    pub fn wait_current<D: GpuDevice>(&mut self, device: &D) -> VulkanResult<()> {
        let slot = &mut self.slots[self.frame_index];
        device.wait_for_fence(slot.in_flight, u64::MAX)?;
        slot.state = SlotState::Acquiring;
        Ok(())
    }

    /// Acquire the next swapchain image with the current slot's semaphore
    pub fn acquire<D: GpuDevice>(
        &mut self,
        device: &D,
        swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<AcquireOutcome> {
        let slot = &mut self.slots[self.frame_index];
        let outcome = device.acquire_next_image(swapchain, slot.image_available)?;
        if outcome == AcquireOutcome::OutOfDate {
            slot.state = SlotState::Idle;
        }
        Ok(outcome)
    }

    /// Reset the fence and command buffer, then begin recording
    pub fn begin_recording<D: GpuDevice>(&mut self, device: &D) -> VulkanResult<vk::CommandBuffer> {
        let slot = &mut self.slots[self.frame_index];
        device.reset_fence(slot.in_flight)?;
        device.reset_command_buffer(slot.command_buffer)?;
        device.begin_command_buffer(slot.command_buffer, true)?;
        slot.state = SlotState::Recording;
        Ok(slot.command_buffer)
    }

    /// Submit the recorded command buffer to the graphics queue
    pub fn submit<D: GpuDevice>(&mut self, device: &D) -> VulkanResult<()> {
        let slot = &mut self.slots[self.frame_index];
        device.submit(
            QueueRole::Graphics,
            &Submission {
                command_buffer: slot.command_buffer,
                wait: Some((slot.image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)),
                signal: Some(slot.render_finished),
                fence: Some(slot.in_flight),
            },
        )?;
        slot.state = SlotState::Submitted;
        Ok(())
    }

    /// Present `image_index` once rendering finished, then advance the cursor.
    ///
    /// The cursor advances whatever the outcome, errors included.
    pub fn present<D: GpuDevice>(
        &mut self,
        device: &D,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VulkanResult<PresentOutcome> {
        let slot = &mut self.slots[self.frame_index];
        slot.state = SlotState::Presenting;
        let result = device.present(swapchain, image_index, slot.render_finished);
        slot.state = SlotState::Idle;

        self.frames_presented += 1;
        self.frame_index = (self.frame_index + 1) % self.slots.len();
        result
    }

    /// Abandon the current frame without touching fence or cursor
    pub fn abort(&mut self) {
        self.slots[self.frame_index].state = SlotState::Idle;
    }

    /// Destroy every slot's semaphores and fence; the device must be idle
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        for slot in self.slots.drain(..) {
            device.destroy_semaphore(slot.image_available);
            device.destroy_semaphore(slot.render_finished);
            device.destroy_fence(slot.in_flight);
        }
    }
}
