//! Per-frame uniform buffers
//!
//! One mapped uniform buffer and one descriptor set per frame slot, all bound
//! at set 0, binding 0 and visible to the vertex stage. A slot's buffer is only
//! rewritten after that slot's fence has been waited, so the GPU never reads a
//! half-written block.

use ash::vk;

use crate::render::backends::gpu::GpuDevice;
use crate::render::backends::vulkan::{
    GpuBuffer, ResourceFactory, UniformBuffer, VulkanError, VulkanResult,
};

/// Binding of the uniform block inside set 0
pub const UNIFORM_BINDING: u32 = 0;

/// Uniform buffers, descriptor pool, set layout and sets for every frame slot
#[derive(Debug)]
pub struct UniformRing {
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    buffers: Vec<UniformBuffer>,
    size: vk::DeviceSize,
}

impl UniformRing {
    /// Create `frames` uniform blocks of `size` bytes
    pub fn create<D: GpuDevice>(
        device: &D,
        factory: &ResourceFactory<'_, D>,
        frames: usize,
        size: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let set_layout =
            device.create_uniform_set_layout(UNIFORM_BINDING, vk::ShaderStageFlags::VERTEX)?;
        let mut ring = Self {
            set_layout,
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            buffers: Vec::with_capacity(frames),
            size,
        };

        if let Err(e) = ring.populate(device, factory, frames) {
            ring.destroy(device, factory);
            return Err(e);
        }

        log::debug!("Created {} uniform blocks of {} bytes", frames, size);
        Ok(ring)
    }

    fn populate<D: GpuDevice>(
        &mut self,
        device: &D,
        factory: &ResourceFactory<'_, D>,
        frames: usize,
    ) -> VulkanResult<()> {
        let count = u32::try_from(frames).map_err(|_| VulkanError::InvalidOperation {
            reason: format!("Too many frames in flight: {frames}"),
        })?;
        self.pool = device.create_descriptor_pool(count)?;
        self.sets = device.allocate_descriptor_sets(self.pool, self.set_layout, count)?;

        for &set in &self.sets {
            let buffer = factory.create_uniform_buffer(self.size)?;
            let handle = AsRef::<GpuBuffer>::as_ref(&buffer).handle();
            device.write_uniform_descriptor(set, UNIFORM_BINDING, handle, self.size);
            self.buffers.push(buffer);
        }
        Ok(())
    }

    /// Layout to include in the pipeline layout
    pub const fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Size of one block
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Descriptor set of `frame`
    pub fn descriptor_set(&self, frame: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(frame).copied()
    }

    /// Uniform buffer of `frame`
    pub fn buffer(&self, frame: usize) -> Option<&UniformBuffer> {
        self.buffers.get(frame)
    }

    /// Write `data` into `frame`'s block
    pub fn update<D: GpuDevice>(
        &self,
        factory: &ResourceFactory<'_, D>,
        frame: usize,
        data: &[u8],
    ) -> VulkanResult<()> {
        let buffer = self.buffers.get(frame).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("No uniform block for frame {frame}"),
        })?;
        factory.upload_data(buffer, data)
    }

    /// Release buffers, pool and layout
    pub fn destroy<D: GpuDevice>(&mut self, device: &D, factory: &ResourceFactory<'_, D>) {
        for buffer in self.buffers.drain(..) {
            factory.delete_uniform_buffer(buffer);
        }
        self.sets.clear();
        if self.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            device.destroy_descriptor_set_layout(self.set_layout);
            self.set_layout = vk::DescriptorSetLayout::null();
        }
    }
}
