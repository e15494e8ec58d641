//! Frame-indexed deferred destruction
//!
//! Resources referenced by a command buffer that is still executing cannot be destroyed
//! when their owner goes away. Owners move their native handles into a [`Garbage`] entry
//! and push it into the [`GarbageCollector`]; the entry is destroyed the next time the
//! frame slot it was queued in becomes current, i.e. after the fence guarding that slot
//! has been waited on.
//!
//! # Frame slots
//!
//! The collector mirrors the context's frames in flight. With two slots the timeline
//! looks like this:
//!
//! ```text
//! slot 0: record -> submit ........................ wait fence 0 -> free slot 0
//! slot 1:              record -> submit ............................ wait fence 1
//! ```
//!
//! Garbage pushed while slot 0 is current can only be referenced by work submitted for
//! slot 0 (or earlier), so it is safe to destroy once slot 0's fence has been waited on
//! and the slot is recycled through [`GarbageCollector::set_current_frame`]. Pushing
//! before the slot has been recycled would queue the entry behind the wrong fence, which
//! is why the context makes the frame ready before handing out command buffers.
//!
//! # Teardown
//!
//! Disabling the collector drains every slot and makes later pushes destroy
//! immediately. The context does this after waiting for the device to go idle, so
//! wrappers that outlive it (a texture held by the application, a command buffer
//! still in an `Rc`) release their handles on drop instead of leaking into a dead queue.
//! Entries that need a parent object alive hold a strong reference to it: a pending
//! command buffer free keeps its [`CommandPool`] until the free has run.
//!
//! Entries may push more garbage while being destroyed (a descriptor pool dropping its
//! last set, for instance), so every drain releases its borrow before dropping anything.

use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::device::{BufferAllocation, GpuDevice, ImageAllocation};
use crate::backend::vulkan::rendering::command_buffer::CommandPool;
use crate::backend::vulkan::MAX_FRAMES_IN_FLIGHT;

/// Native handles awaiting destruction
#[derive(Debug, Default)]
pub enum GarbageKind {
    /// Nothing left to destroy
    #[default]
    Empty,
    /// Descriptor set and the backing pool it came from
    DescriptorSet {
        /// Set to free
        set: vk::DescriptorSet,
        /// Backing native pool
        pool: vk::DescriptorPool,
    },
    /// Buffer and its memory
    Buffer(BufferAllocation),
    /// Graphics pipeline
    GraphicsPipeline(vk::Pipeline),
    /// Pipeline layout
    PipelineLayout(vk::PipelineLayout),
    /// Command pool
    CommandPool(vk::CommandPool),
    /// Command buffer and the pool it was allocated from
    CommandBuffer {
        /// Buffer to free
        buffer: vk::CommandBuffer,
        /// Owning pool, kept alive until the buffer is freed
        pool: Rc<CommandPool>,
    },
    /// Framebuffer
    Framebuffer(vk::Framebuffer),
    /// Render pass
    RenderPass(vk::RenderPass),
    /// Sampler
    Sampler(vk::Sampler),
    /// Image, view and memory
    Image(ImageAllocation),
}

impl GarbageKind {
    fn destroy(self, device: &dyn GpuDevice) {
        match self {
            Self::Empty => {}
            Self::DescriptorSet { set, pool } => {
                if set != vk::DescriptorSet::null() && pool != vk::DescriptorPool::null() {
                    device.free_descriptor_set(pool, set);
                }
            }
            Self::Buffer(allocation) => {
                if allocation.buffer != vk::Buffer::null() {
                    device.destroy_buffer(allocation);
                }
            }
            Self::GraphicsPipeline(pipeline) => {
                if pipeline != vk::Pipeline::null() {
                    device.destroy_pipeline(pipeline);
                }
            }
            Self::PipelineLayout(layout) => {
                if layout != vk::PipelineLayout::null() {
                    device.destroy_pipeline_layout(layout);
                }
            }
            Self::CommandPool(pool) => {
                if pool != vk::CommandPool::null() {
                    device.destroy_command_pool(pool);
                }
            }
            Self::CommandBuffer { buffer, pool } => {
                let pool = pool.handle();
                if buffer != vk::CommandBuffer::null() && pool != vk::CommandPool::null() {
                    device.free_command_buffer(pool, buffer);
                }
            }
            Self::Framebuffer(framebuffer) => {
                if framebuffer != vk::Framebuffer::null() {
                    device.destroy_framebuffer(framebuffer);
                }
            }
            Self::RenderPass(render_pass) => {
                if render_pass != vk::RenderPass::null() {
                    device.destroy_render_pass(render_pass);
                }
            }
            Self::Sampler(sampler) => {
                if sampler != vk::Sampler::null() {
                    device.destroy_sampler(sampler);
                }
            }
            Self::Image(allocation) => {
                if allocation.image != vk::Image::null() {
                    device.destroy_image(allocation);
                }
            }
        }
    }
}

/// A move-only destruction ticket
///
/// Dropping it performs exactly one native destroy for its payload.
pub struct Garbage {
    kind: GarbageKind,
    device: Rc<dyn GpuDevice>,
}

impl Garbage {
    /// Wrap handles for later destruction through `device`
    pub fn new(device: Rc<dyn GpuDevice>, kind: GarbageKind) -> Self {
        Self { kind, device }
    }

    /// The pending payload
    pub fn kind(&self) -> &GarbageKind {
        &self.kind
    }

    /// Take the payload back without destroying it
    pub fn into_inner(mut self) -> GarbageKind {
        mem::take(&mut self.kind)
    }
}

impl std::fmt::Debug for Garbage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Garbage").field(&self.kind).finish()
    }
}

impl Drop for Garbage {
    fn drop(&mut self) {
        mem::take(&mut self.kind).destroy(self.device.as_ref());
    }
}

/// Deferred destruction queue with one slot per frame in flight
///
/// Single render thread only; interior mutability lets every resource wrapper hold an
/// `Rc<GarbageCollector>` and push from its `Drop`.
#[derive(Debug)]
pub struct GarbageCollector {
    frames: RefCell<[Vec<Garbage>; MAX_FRAMES_IN_FLIGHT]>,
    current_frame: Cell<usize>,
    enabled: Cell<bool>,
}

impl GarbageCollector {
    /// Create an enabled collector positioned at slot 0
    pub fn new() -> Self {
        Self {
            frames: RefCell::new(std::array::from_fn(|_| Vec::new())),
            current_frame: Cell::new(0),
            enabled: Cell::new(true),
        }
    }

    /// Queue an entry in the current slot, or destroy it now when disabled
    pub fn push(&self, garbage: Garbage) {
        if !self.enabled.get() {
            drop(garbage);
            return;
        }
        let slot = self.current_frame.get();
        self.frames.borrow_mut()[slot].push(garbage);
    }

    /// Make `frame` current (clamped into range) and free its slot
    pub fn set_current_frame(&self, frame: usize) {
        self.current_frame.set(frame.min(MAX_FRAMES_IN_FLIGHT - 1));
        self.free();
    }

    /// Destroy every entry queued in the current slot
    pub fn free(&self) {
        let slot = self.current_frame.get();
        // Entries may push more garbage while dropping; release the borrow first.
        let pending = mem::take(&mut self.frames.borrow_mut()[slot]);
        if !pending.is_empty() {
            log::trace!("Freeing {} garbage entries from frame slot {}", pending.len(), slot);
        }
        drop(pending);
    }

    /// Destroy every entry in every slot; only valid once the device is idle
    pub fn free_all(&self) {
        loop {
            let pending: Vec<Garbage> = {
                let mut frames = self.frames.borrow_mut();
                frames.iter_mut().flat_map(mem::take).collect()
            };
            if pending.is_empty() {
                break;
            }
            log::debug!("Freeing {} garbage entries from all frame slots", pending.len());
            drop(pending);
        }
    }

    /// Enable or disable deferral; disabling drains every slot
    pub fn enable(&self, enabled: bool) {
        self.enabled.set(enabled);
        if !enabled {
            self.free_all();
        }
    }

    /// Whether pushes are deferred
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Current frame slot
    pub fn current_frame(&self) -> usize {
        self.current_frame.get()
    }

    /// Entries queued across all slots
    pub fn len(&self) -> usize {
        self.frames.borrow().iter().map(Vec::len).sum()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vulkan::test_device::{Destroyed, RecordingDevice};

    fn setup() -> (Rc<RecordingDevice>, Rc<dyn GpuDevice>, GarbageCollector) {
        let recorder = Rc::new(RecordingDevice::new());
        let device: Rc<dyn GpuDevice> = recorder.clone();
        (recorder, device, GarbageCollector::new())
    }

    #[test]
    fn test_entry_survives_until_slot_comes_around() {
        let (recorder, device, gc) = setup();
        let pipeline: vk::Pipeline = recorder.handle();

        gc.push(Garbage::new(device, GarbageKind::GraphicsPipeline(pipeline)));
        assert_eq!(gc.len(), 1);

        gc.set_current_frame(1);
        assert!(recorder.destroyed().is_empty());

        gc.set_current_frame(0);
        assert_eq!(recorder.destroyed(), vec![Destroyed::Pipeline(pipeline)]);
        assert!(gc.is_empty());

        gc.set_current_frame(1);
        gc.set_current_frame(0);
        assert_eq!(recorder.destroy_count(Destroyed::Pipeline(pipeline)), 1);
    }

    #[test]
    fn test_disabled_collector_destroys_immediately() {
        let (recorder, device, gc) = setup();
        let sampler: vk::Sampler = recorder.handle();
        let render_pass: vk::RenderPass = recorder.handle();

        gc.push(Garbage::new(device.clone(), GarbageKind::RenderPass(render_pass)));
        gc.enable(false);
        assert_eq!(recorder.destroyed(), vec![Destroyed::RenderPass(render_pass)]);
        assert!(!gc.is_enabled());

        gc.push(Garbage::new(device, GarbageKind::Sampler(sampler)));
        assert!(gc.is_empty());
        assert_eq!(recorder.destroy_count(Destroyed::Sampler(sampler)), 1);
    }

    #[test]
    fn test_set_current_frame_clamps() {
        let (_recorder, _device, gc) = setup();
        gc.set_current_frame(17);
        assert_eq!(gc.current_frame(), MAX_FRAMES_IN_FLIGHT - 1);
    }

    #[test]
    fn test_null_handles_are_skipped() {
        let (recorder, device, gc) = setup();
        gc.push(Garbage::new(device.clone(), GarbageKind::Framebuffer(vk::Framebuffer::null())));
        gc.push(Garbage::new(device, GarbageKind::Empty));
        gc.free_all();
        assert!(recorder.destroyed().is_empty());
    }

    #[test]
    fn test_free_all_destroys_every_slot_in_order() {
        let (recorder, device, gc) = setup();
        let layout: vk::PipelineLayout = recorder.handle();
        let pool: vk::CommandPool = recorder.handle();

        gc.push(Garbage::new(device.clone(), GarbageKind::PipelineLayout(layout)));
        gc.set_current_frame(1);
        gc.push(Garbage::new(device, GarbageKind::CommandPool(pool)));
        assert_eq!(gc.len(), 2);

        gc.free_all();
        assert_eq!(
            recorder.destroyed(),
            vec![Destroyed::PipelineLayout(layout), Destroyed::CommandPool(pool)]
        );
    }

    #[test]
    fn test_pending_command_buffer_keeps_pool_alive() {
        let (recorder, device, gc) = setup();
        let pool = Rc::new(CommandPool::new(device.clone(), 0).unwrap());
        let (pool_handle, buffer) = (pool.handle(), recorder.handle());

        gc.push(Garbage::new(device, GarbageKind::CommandBuffer { buffer, pool }));
        assert!(recorder.destroyed().is_empty());

        gc.free_all();
        assert_eq!(
            recorder.destroyed(),
            vec![Destroyed::CommandBuffer(buffer), Destroyed::CommandPool(pool_handle)]
        );
    }

    #[test]
    fn test_into_inner_cancels_destruction() {
        let (recorder, device, _gc) = setup();
        let framebuffer: vk::Framebuffer = recorder.handle();
        let garbage = Garbage::new(device, GarbageKind::Framebuffer(framebuffer));
        assert!(matches!(garbage.into_inner(), GarbageKind::Framebuffer(f) if f == framebuffer));
        assert!(recorder.destroyed().is_empty());
    }
}
