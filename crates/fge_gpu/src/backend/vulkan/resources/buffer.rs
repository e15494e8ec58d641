//! Growable vertex, index, uniform and storage buffers
//!
//! A [`GrowableBuffer`] keeps a host shadow of its elements and uploads it lazily when
//! bound. Overflow reallocates at twice the requested size and hands the old storage to
//! the garbage collector, since a frame in flight may still read it.
//!
//! `Device` buffers are never mapped. Each flush writes the shadow into a fresh
//! host-visible staging buffer, records the copy on the frame's shared command buffer
//! and retires the staging buffer right away: the collector keeps it alive until the
//! frame slot that recorded the copy comes around again.

use std::mem;
use std::rc::Rc;

use ash::vk;
use bytemuck::Pod;

use crate::backend::vulkan::device::{BufferAllocation, BufferRequest, GpuDevice, MemoryLocation};
use crate::backend::vulkan::rendering::command_buffer::{QueueFlags, RenderScope, SubmitType};
use crate::backend::vulkan::resources::garbage::{Garbage, GarbageCollector, GarbageKind};
use crate::backend::vulkan::{Context, VulkanError, VulkanResult};

/// What a growable buffer is bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex attributes
    Vertex,
    /// Indices
    Index,
    /// Uniform block
    Uniform,
    /// Shader storage
    Storage,
}

impl BufferKind {
    /// Native usage for a buffer of this kind at `location`
    pub fn usage(self, location: MemoryLocation) -> vk::BufferUsageFlags {
        let usage = match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        match location {
            MemoryLocation::Local => usage,
            MemoryLocation::Device => usage | vk::BufferUsageFlags::TRANSFER_DST,
        }
    }
}

/// Buffer of `T` that doubles its capacity on overflow
pub struct GrowableBuffer<T: Pod> {
    device: Rc<dyn GpuDevice>,
    gc: Rc<GarbageCollector>,
    kind: BufferKind,
    location: MemoryLocation,
    data: Vec<T>,
    capacity: usize,
    buffer: Option<BufferAllocation>,
    dirty: bool,
}

impl<T: Pod> GrowableBuffer<T> {
    /// Create an empty buffer; storage is allocated on first growth
    pub fn new(ctx: &Context, kind: BufferKind, location: MemoryLocation) -> Self {
        Self::with_device(ctx.device().clone(), ctx.garbage_collector().clone(), kind, location)
    }

    /// Create a buffer holding `len` zeroed elements
    pub fn with_len(
        ctx: &Context,
        kind: BufferKind,
        location: MemoryLocation,
        len: usize,
    ) -> VulkanResult<Self> {
        let mut buffer = Self::new(ctx, kind, location);
        buffer.resize(len)?;
        Ok(buffer)
    }

    pub(crate) fn with_device(
        device: Rc<dyn GpuDevice>,
        gc: Rc<GarbageCollector>,
        kind: BufferKind,
        location: MemoryLocation,
    ) -> Self {
        Self {
            device,
            gc,
            kind,
            location,
            data: Vec::new(),
            capacity: 0,
            buffer: None,
            dirty: false,
        }
    }

    /// Set the logical length, growing the storage if it does not fit
    ///
    /// The first allocation is exactly `max(1, len)` elements, later ones twice that.
    pub fn resize(&mut self, len: usize) -> VulkanResult<()> {
        if len > self.capacity {
            let wanted = len.max(1);
            let capacity = if self.buffer.is_some() { wanted * 2 } else { wanted };
            self.reallocate(capacity)?;
        }
        self.data.resize(len, T::zeroed());
        self.dirty = true;
        Ok(())
    }

    /// Reallocate to exactly the logical length
    pub fn shrink_to_fit(&mut self) -> VulkanResult<()> {
        if self.data.len() == self.capacity {
            return Ok(());
        }
        if self.data.is_empty() {
            self.retire();
            self.capacity = 0;
            return Ok(());
        }
        self.reallocate(self.data.len())?;
        self.dirty = true;
        Ok(())
    }

    fn reallocate(&mut self, capacity: usize) -> VulkanResult<()> {
        let size = (capacity * mem::size_of::<T>()).max(1) as vk::DeviceSize;
        let buffer = self.device.create_buffer(&BufferRequest {
            size,
            usage: self.kind.usage(self.location),
            location: self.location,
        })?;

        log::debug!(
            "Growing {:?} buffer from {} to {} elements",
            self.kind,
            self.capacity,
            capacity
        );
        self.retire();
        self.buffer = Some(buffer);
        self.capacity = capacity;
        self.data.truncate(capacity);
        self.write_host()
    }

    fn retire(&mut self) {
        if let Some(allocation) = self.buffer.take() {
            self.gc.push(Garbage::new(self.device.clone(), GarbageKind::Buffer(allocation)));
        }
    }

    fn write_host(&self) -> VulkanResult<()> {
        match self.buffer {
            Some(allocation) if self.location == MemoryLocation::Local && !self.data.is_empty() => {
                self.device.write_memory(allocation.memory, 0, bytemuck::cast_slice(&self.data))
            }
            _ => Ok(()),
        }
    }

    fn stage(&self, ctx: &Context, target: vk::Buffer) -> VulkanResult<()> {
        // begin first so the staging buffer is retired into the slot recording the copy
        let cmd = ctx.begin_commands(
            SubmitType::IndirectExecution,
            RenderScope::Outside,
            QueueFlags::GRAPHICS,
        )?;
        let size = self.byte_len();
        let staging = self.device.create_buffer(&BufferRequest {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::Local,
        })?;
        let result = self
            .device
            .write_memory(staging.memory, 0, bytemuck::cast_slice(&self.data))
            .and_then(|()| {
                cmd.copy_buffer(
                    staging.buffer,
                    target,
                    &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size }],
                )
            });
        self.gc.push(Garbage::new(self.device.clone(), GarbageKind::Buffer(staging)));
        result
    }

    /// Upload the host shadow if it changed since the last upload
    ///
    /// `Device` buffers record a staging copy on the frame's shared command buffer.
    pub fn flush(&mut self, ctx: &Context) -> VulkanResult<()> {
        if !self.dirty {
            return Ok(());
        }
        match (self.location, self.buffer) {
            (MemoryLocation::Device, Some(buffer)) if !self.data.is_empty() => {
                self.stage(ctx, buffer.buffer)?
            }
            _ => self.write_host()?,
        }
        self.dirty = false;
        Ok(())
    }

    /// Flush and return the handle to bind
    pub fn bind(&mut self, ctx: &Context) -> VulkanResult<vk::Buffer> {
        self.flush(ctx)?;
        Ok(self.handle())
    }

    /// Upload a `Local` buffer without a context
    pub(crate) fn flush_local(&mut self) -> VulkanResult<()> {
        if self.location != MemoryLocation::Local {
            return Err(VulkanError::invalid("device buffers upload through a command buffer"));
        }
        if self.dirty {
            self.write_host()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Append one element
    pub fn push(&mut self, value: T) -> VulkanResult<usize> {
        let index = self.data.len();
        self.resize(index + 1)?;
        self.data[index] = value;
        Ok(index)
    }

    /// Overwrite one element
    pub fn set(&mut self, index: usize, value: T) -> VulkanResult<()> {
        let len = self.data.len();
        let slot = self.data.get_mut(index).ok_or_else(|| {
            VulkanError::invalid(format!("index {index} out of range for buffer of {len}"))
        })?;
        *slot = value;
        self.dirty = true;
        Ok(())
    }

    /// Element at `index`
    pub fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    /// Mutable element at `index`; marks the buffer dirty
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        let value = self.data.get_mut(index)?;
        self.dirty = true;
        Some(value)
    }

    /// Host shadow of the contents
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable host shadow; marks the buffer dirty
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.dirty = true;
        &mut self.data
    }

    /// Drop every element, keeping the storage
    pub fn clear(&mut self) {
        self.data.clear();
        self.dirty = true;
    }

    /// Elements in use
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no elements are in use
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated elements
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes in use
    pub fn byte_len(&self) -> vk::DeviceSize {
        (self.data.len() * mem::size_of::<T>()) as vk::DeviceSize
    }

    /// Whether the host shadow has changes not yet uploaded
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Native handle of the bound buffer (null before the first allocation)
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.map_or(vk::Buffer::null(), |allocation| allocation.buffer)
    }

    /// Buffer kind
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Memory placement
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    #[cfg(test)]
    pub(crate) fn allocation(&self) -> Option<BufferAllocation> {
        self.buffer
    }
}

impl<T: Pod> Drop for GrowableBuffer<T> {
    fn drop(&mut self) {
        self.retire();
    }
}
