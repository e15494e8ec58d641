//! Per-frame transform records
//!
//! Draw code requests one [`GlobalTransform`] per object per frame. Records live in a
//! host-visible storage buffer bound through a descriptor set; when the buffer has to
//! grow, the set is rewritten before the next frame's first render target. The context
//! keeps one [`GlobalTransforms`] per frame slot, so a frame still executing on the GPU
//! never sees the next frame's writes.

use std::rc::Rc;

use ash::vk;
use nalgebra::Matrix4;

use crate::backend::vulkan::device::{GpuDevice, MemoryLocation};
use crate::backend::vulkan::resources::buffer::{BufferKind, GrowableBuffer};
use crate::backend::vulkan::resources::descriptor_pool::{DescriptorPool, DescriptorSet};
use crate::backend::vulkan::resources::garbage::GarbageCollector;
use crate::backend::vulkan::{VulkanError, VulkanResult};

/// One transform record as laid out in the storage buffer (std430)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalTransform {
    /// Object to world, column-major
    pub model: [[f32; 4]; 4],
    /// World to clip, column-major
    pub view: [[f32; 4]; 4],
}

unsafe impl bytemuck::Pod for GlobalTransform {}
unsafe impl bytemuck::Zeroable for GlobalTransform {}

impl GlobalTransform {
    /// Build a record from matrices
    pub fn new(model: &Matrix4<f32>, view: &Matrix4<f32>) -> Self {
        Self { model: (*model).into(), view: (*view).into() }
    }

    /// Set the model matrix
    pub fn set_model(&mut self, model: &Matrix4<f32>) {
        self.model = (*model).into();
    }

    /// Set the view matrix
    pub fn set_view(&mut self, view: &Matrix4<f32>) {
        self.view = (*view).into();
    }

    /// Model matrix
    pub fn model_matrix(&self) -> Matrix4<f32> {
        Matrix4::from(self.model)
    }

    /// View matrix
    pub fn view_matrix(&self) -> Matrix4<f32> {
        Matrix4::from(self.view)
    }
}

impl Default for GlobalTransform {
    fn default() -> Self {
        Self::new(&Matrix4::identity(), &Matrix4::identity())
    }
}

/// Growable storage buffer of transform records plus its descriptor set
pub(crate) struct GlobalTransforms {
    device: Rc<dyn GpuDevice>,
    buffer: GrowableBuffer<GlobalTransform>,
    descriptor_set: Option<DescriptorSet>,
    count: usize,
    dirty_descriptor: bool,
}

impl GlobalTransforms {
    pub fn new(
        device: Rc<dyn GpuDevice>,
        gc: Rc<GarbageCollector>,
        initial: usize,
    ) -> VulkanResult<Self> {
        let mut buffer = GrowableBuffer::with_device(
            device.clone(),
            gc,
            BufferKind::Storage,
            MemoryLocation::Local,
        );
        buffer.resize(initial.max(1))?;
        Ok(Self { device, buffer, descriptor_set: None, count: 0, dirty_descriptor: true })
    }

    /// Reserve the next record, growing the buffer when the live count exceeds it
    pub fn request(&mut self) -> VulkanResult<u32> {
        let index = self.count;
        if index >= self.buffer.len() {
            let before = self.buffer.handle();
            self.buffer.resize(index + 1)?;
            if self.buffer.handle() != before {
                log::debug!("Global transform buffer grew to {} records", self.buffer.capacity());
                self.dirty_descriptor = true;
            }
        }
        self.count += 1;
        self.buffer.set(index, GlobalTransform::default())?;
        u32::try_from(index).map_err(|_| VulkanError::invalid("too many global transforms"))
    }

    pub fn get(&self, index: usize) -> Option<&GlobalTransform> {
        if index < self.count {
            self.buffer.get(index)
        } else {
            None
        }
    }

    /// Writable record; `index` must come from [`GlobalTransforms::request`]
    pub fn record_mut(&mut self, index: usize) -> &mut GlobalTransform {
        &mut self.buffer.as_mut_slice()[index]
    }

    pub fn reset_count(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_descriptor_dirty(&self) -> bool {
        self.dirty_descriptor || self.descriptor_set.is_none()
    }

    /// Allocate and write a new descriptor set if the buffer changed
    pub fn refresh_descriptor(
        &mut self,
        pool: &DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<()> {
        if !self.is_descriptor_dirty() {
            return Ok(());
        }
        let set = pool
            .allocate_descriptor_set(layout, 0)
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;
        set.writer()
            .write_buffer(
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                self.buffer.handle(),
                0,
                vk::WHOLE_SIZE,
            )
            .update(self.device.as_ref());
        // the old set is returned through the garbage collector
        self.descriptor_set = Some(set);
        self.dirty_descriptor = false;
        Ok(())
    }

    pub fn flush(&mut self) -> VulkanResult<()> {
        self.buffer.flush_local()
    }

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.descriptor_set.as_ref().map(DescriptorSet::handle)
    }

    #[cfg(test)]
    pub fn buffer_handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }
}
