//! Centralized image layout tracking
//!
//! Every image the frame protocol touches has its current layout, last stage
//! and last access recorded here. Transitions are derived from that record, so
//! callers only say where an image must end up.

use ash::vk;
use std::collections::HashMap;

use crate::render::backends::gpu::ImageBarrier;

/// Layout plus the synchronization scope of the last use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    /// Current layout
    pub layout: vk::ImageLayout,
    /// Stages of the last use
    pub stage: vk::PipelineStageFlags2,
    /// Accesses of the last use
    pub access: vk::AccessFlags2,
}

impl ImageState {
    /// Contents undefined, never used
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };

    /// Written as a color attachment
    pub const COLOR_ATTACHMENT: Self = Self {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
    };

    /// Read and written as a depth attachment
    pub const DEPTH_ATTACHMENT: Self = Self {
        layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
    };

    /// Handed to the presentation engine
    pub const PRESENTED: Self = Self {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };

    /// Whether the last use wrote to the image
    pub fn writes(self) -> bool {
        self.access.intersects(
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags2::TRANSFER_WRITE
                | vk::AccessFlags2::SHADER_WRITE
                | vk::AccessFlags2::MEMORY_WRITE,
        )
    }
}

/// Per-image state table
#[derive(Debug, Default)]
pub struct ImageStateTracker {
    images: HashMap<vk::Image, (vk::ImageAspectFlags, ImageState)>,
}

impl ImageStateTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `image` in `state`
    pub fn register(&mut self, image: vk::Image, aspect: vk::ImageAspectFlags, state: ImageState) {
        self.images.insert(image, (aspect, state));
    }

    /// Stop tracking `image`
    pub fn forget(&mut self, image: vk::Image) {
        self.images.remove(&image);
    }

    /// Current state of `image`
    pub fn state(&self, image: vk::Image) -> Option<ImageState> {
        self.images.get(&image).map(|&(_, state)| state)
    }

    /// Number of tracked images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Record that a swapchain image was just acquired.
    ///
    /// The acquire semaphore is waited at color attachment output, so the
    /// first barrier on the image must start its scope there. The layout is
    /// whatever the image was left in.
    pub fn acquired(&mut self, image: vk::Image) {
        let entry = self
            .images
            .entry(image)
            .or_insert((vk::ImageAspectFlags::COLOR, ImageState::UNDEFINED));
        entry.1.stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        entry.1.access = vk::AccessFlags2::NONE;
    }

    /// Move `image` to `target`, returning the barrier to record.
    ///
    /// Untracked images are assumed `UNDEFINED`. No barrier is needed when the
    /// layout already matches and neither side writes.
    pub fn transition(&mut self, image: vk::Image, target: ImageState) -> Option<ImageBarrier> {
        let (aspect, current) = self
            .images
            .get(&image)
            .copied()
            .unwrap_or((vk::ImageAspectFlags::COLOR, ImageState::UNDEFINED));

        self.images.insert(image, (aspect, target));

        if current.layout == target.layout && !current.writes() && !target.writes() {
            return None;
        }

        Some(ImageBarrier {
            image,
            aspect,
            old_layout: current.layout,
            new_layout: target.layout,
            src_stage: current.stage,
            src_access: current.access,
            dst_stage: target.stage,
            dst_access: target.access,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(raw: u64) -> vk::Image {
        use ash::vk::Handle;
        vk::Image::from_raw(raw)
    }

    #[test]
    fn test_first_use_starts_from_undefined() {
        let mut tracker = ImageStateTracker::new();
        let barrier = tracker.transition(image(1), ImageState::COLOR_ATTACHMENT).unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.aspect, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_frame_round_trip_derives_both_barriers() {
        let mut tracker = ImageStateTracker::new();
        let img = image(7);
        tracker.register(img, vk::ImageAspectFlags::COLOR, ImageState::UNDEFINED);

        tracker.acquired(img);
        let to_color = tracker.transition(img, ImageState::COLOR_ATTACHMENT).unwrap();
        assert_eq!(to_color.src_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(to_color.src_access, vk::AccessFlags2::NONE);

        let to_present = tracker.transition(img, ImageState::PRESENTED).unwrap();
        assert_eq!(to_present.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(to_present.src_access, ImageState::COLOR_ATTACHMENT.access);

        tracker.acquired(img);
        let again = tracker.transition(img, ImageState::COLOR_ATTACHMENT).unwrap();
        assert_eq!(again.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_same_layout_write_still_gets_a_barrier() {
        let mut tracker = ImageStateTracker::new();
        let depth = image(3);
        tracker.register(depth, vk::ImageAspectFlags::DEPTH, ImageState::DEPTH_ATTACHMENT);
        let barrier = tracker.transition(depth, ImageState::DEPTH_ATTACHMENT).unwrap();
        assert_eq!(barrier.old_layout, barrier.new_layout);
        assert_eq!(barrier.aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_read_only_same_layout_is_skipped() {
        let mut tracker = ImageStateTracker::new();
        let img = image(4);
        tracker.register(img, vk::ImageAspectFlags::COLOR, ImageState::PRESENTED);
        assert!(tracker.transition(img, ImageState::PRESENTED).is_none());
    }

    #[test]
    fn test_forget_resets_to_undefined() {
        let mut tracker = ImageStateTracker::new();
        let img = image(5);
        tracker.register(img, vk::ImageAspectFlags::COLOR, ImageState::PRESENTED);
        tracker.forget(img);
        assert!(tracker.is_empty());
        let barrier = tracker.transition(img, ImageState::COLOR_ATTACHMENT).unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
    }
}
