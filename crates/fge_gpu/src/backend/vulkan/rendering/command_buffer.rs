//! Command buffer management
//!
//! [`CommandBuffer`] wraps one native command buffer recording session and checks the
//! recording contract: commands only while recording, outside-only commands never
//! inside a render pass. The render scope and the set of queues the buffer can be
//! submitted to are narrowed as commands are recorded, so the context can route it.

use std::cell::Cell;
use std::rc::Rc;

use ash::vk;
use bitflags::bitflags;

use crate::backend::vulkan::device::{DeviceCommand, GpuDevice, ImageTransition};
use crate::backend::vulkan::resources::garbage::{Garbage, GarbageCollector, GarbageKind};
use crate::backend::vulkan::{VulkanError, VulkanResult};

bitflags! {
    /// Queues a command buffer may be submitted to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// Graphics queue
        const GRAPHICS = 1;
        /// Compute queue
        const COMPUTE = 1 << 1;
        /// Transfer queue
        const TRANSFER = 1 << 2;
    }
}

/// How a command buffer is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitType {
    /// Submitted on its own; the CPU waits for the queue to drain
    DirectWaitExecution,
    /// Batched with the frame and executed before its graphics work
    IndirectExecution,
}

/// Where relative to a render pass commands are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderScope {
    /// Only inside a render pass
    Inside,
    /// Only outside a render pass
    Outside,
    /// Not yet narrowed
    Both,
}

/// Recording lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    /// Allocated or reset, not begun
    Unrecorded,
    /// Between `begin` and `end`
    Recording,
    /// Ready for submission
    Ended,
}

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Rc<dyn GpuDevice>,
    command_pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new resettable command pool
    pub fn new(device: Rc<dyn GpuDevice>, queue_family: u32) -> VulkanResult<Self> {
        let command_pool = device.create_command_pool(queue_family)?;
        log::debug!("Created command pool {:?} for queue family {}", command_pool, queue_family);
        Ok(Self { device, command_pool, queue_family })
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family the pool allocates for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("command_pool", &self.command_pool)
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // every buffer allocated from the pool holds an Rc to it, so none is left
        self.device.destroy_command_pool(self.command_pool);
    }
}

/// One primary command buffer and its recording state
pub struct CommandBuffer {
    device: Rc<dyn GpuDevice>,
    gc: Rc<GarbageCollector>,
    buffer: vk::CommandBuffer,
    pool: Rc<CommandPool>,
    submit_type: SubmitType,
    initial_scope: RenderScope,
    initial_queues: QueueFlags,
    state: Cell<RecordingState>,
    scope: Cell<RenderScope>,
    queues: Cell<QueueFlags>,
    pass_open: Cell<bool>,
}

impl CommandBuffer {
    /// Allocate a command buffer from `pool`; the buffer keeps the pool alive
    pub fn allocate(
        device: Rc<dyn GpuDevice>,
        gc: Rc<GarbageCollector>,
        pool: Rc<CommandPool>,
        submit_type: SubmitType,
        scope: RenderScope,
        queues: QueueFlags,
    ) -> VulkanResult<Self> {
        let buffer = device.allocate_command_buffer(pool.handle())?;
        Ok(Self::wrap(device, gc, buffer, pool, submit_type, scope, queues))
    }

    pub(crate) fn wrap(
        device: Rc<dyn GpuDevice>,
        gc: Rc<GarbageCollector>,
        buffer: vk::CommandBuffer,
        pool: Rc<CommandPool>,
        submit_type: SubmitType,
        scope: RenderScope,
        queues: QueueFlags,
    ) -> Self {
        Self {
            device,
            gc,
            buffer,
            pool,
            submit_type,
            initial_scope: scope,
            initial_queues: queues,
            state: Cell::new(RecordingState::Unrecorded),
            scope: Cell::new(scope),
            queues: Cell::new(queues),
            pass_open: Cell::new(false),
        }
    }

    /// Begin command recording
    pub fn begin(&self) -> VulkanResult<()> {
        if self.buffer == vk::CommandBuffer::null() {
            return Err(VulkanError::invalid("Command buffer was never allocated"));
        }
        match self.state.get() {
            RecordingState::Recording => {
                return Err(VulkanError::invalid("Command buffer already recording"));
            }
            RecordingState::Ended => {
                return Err(VulkanError::invalid("Command buffer already ended; reset it first"));
            }
            RecordingState::Unrecorded => {}
        }

        self.device.begin_command_buffer(self.buffer, true)?;
        self.state.set(RecordingState::Recording);
        Ok(())
    }

    /// End command recording; ending twice is a no-op
    pub fn end(&self) -> VulkanResult<()> {
        match self.state.get() {
            RecordingState::Ended => return Ok(()),
            RecordingState::Unrecorded => {
                return Err(VulkanError::invalid("Command buffer not recording"));
            }
            RecordingState::Recording => {}
        }
        if self.pass_open.get() {
            return Err(VulkanError::invalid("Command buffer ended inside a render pass"));
        }

        self.device.end_command_buffer(self.buffer)?;
        self.state.set(RecordingState::Ended);
        Ok(())
    }

    /// Return to `Unrecorded` without freeing the native buffer
    pub fn reset(&self) -> VulkanResult<()> {
        self.device.reset_command_buffer(self.buffer)?;
        self.state.set(RecordingState::Unrecorded);
        self.scope.set(self.initial_scope);
        self.queues.set(self.initial_queues);
        self.pass_open.set(false);
        Ok(())
    }

    /// Copy regions between buffers
    pub fn copy_buffer(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> VulkanResult<()> {
        self.require_outside("buffer copy")?;
        self.device.record(
            self.buffer,
            &DeviceCommand::CopyBuffer { src, dst, regions: regions.to_vec() },
        );
        Ok(())
    }

    /// Copy tightly packed texels from a buffer into a whole 2D image
    pub fn copy_buffer_to_image(
        &self,
        buffer: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        self.require_outside("buffer to image copy")?;
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
        };
        self.device.record(
            self.buffer,
            &DeviceCommand::CopyBufferToImage { buffer, image, regions: vec![region] },
        );
        Ok(())
    }

    /// Transition an image between layouts
    pub fn transition_image(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        self.require_outside("image layout transition")?;
        self.device.record(
            self.buffer,
            &DeviceCommand::Transition(ImageTransition::between(image, old_layout, new_layout)),
        );
        Ok(())
    }

    /// Scaled copy between images; graphics queue only
    pub fn blit_image(
        &self,
        src: vk::Image,
        dst: vk::Image,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) -> VulkanResult<()> {
        self.require_outside("image blit")?;
        self.queues.set(self.queues.get() & QueueFlags::GRAPHICS);
        self.device.record(
            self.buffer,
            &DeviceCommand::BlitImage { src, dst, regions: regions.to_vec(), filter },
        );
        Ok(())
    }

    /// Begin render pass
    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> VulkanResult<()> {
        self.require_recording("render pass")?;
        if self.scope.get() == RenderScope::Inside {
            return Err(VulkanError::invalid("Render pass begun inside a render pass"));
        }
        self.scope.set(RenderScope::Inside);
        self.queues.set(self.queues.get() & QueueFlags::GRAPHICS);
        self.pass_open.set(true);
        self.device.record(
            self.buffer,
            &DeviceCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                area,
                clear_values: clear_values.to_vec(),
            },
        );
        Ok(())
    }

    /// End the render pass begun on this buffer
    pub fn end_render_pass(&self) -> VulkanResult<()> {
        self.require_recording("render pass end")?;
        if !self.pass_open.get() {
            return Err(VulkanError::invalid("No render pass to end"));
        }
        self.pass_open.set(false);
        self.scope.set(RenderScope::Outside);
        self.device.record(self.buffer, &DeviceCommand::EndRenderPass);
        Ok(())
    }

    fn require_recording(&self, what: &str) -> VulkanResult<()> {
        if self.state.get() == RecordingState::Recording {
            Ok(())
        } else {
            Err(VulkanError::invalid(format!("{what} recorded while not recording")))
        }
    }

    fn require_outside(&self, what: &str) -> VulkanResult<()> {
        self.require_recording(what)?;
        if self.scope.get() == RenderScope::Inside {
            return Err(VulkanError::invalid(format!("{what} is not allowed inside a render pass")));
        }
        self.scope.set(RenderScope::Outside);
        Ok(())
    }

    /// Native command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Pool the buffer was allocated from
    pub fn pool(&self) -> vk::CommandPool {
        self.pool.handle()
    }

    /// Execution model
    pub fn submit_type(&self) -> SubmitType {
        self.submit_type
    }

    /// Current (narrowed) render scope
    pub fn scope(&self) -> RenderScope {
        self.scope.get()
    }

    /// Queues the recorded commands can run on
    pub fn queues(&self) -> QueueFlags {
        self.queues.get()
    }

    /// Whether the buffer can be submitted to any of `queues`
    pub fn supports(&self, queues: QueueFlags) -> bool {
        self.queues.get().intersects(queues)
    }

    /// Recording lifecycle state
    pub fn state(&self) -> RecordingState {
        self.state.get()
    }

    /// Whether `begin` was called and `end` was not
    pub fn is_recording(&self) -> bool {
        self.state.get() == RecordingState::Recording
    }

    /// Whether recording has finished
    pub fn is_ended(&self) -> bool {
        self.state.get() == RecordingState::Ended
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("buffer", &self.buffer)
            .field("submit_type", &self.submit_type)
            .field("state", &self.state.get())
            .field("scope", &self.scope.get())
            .field("queues", &self.queues.get())
            .finish()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.gc.push(Garbage::new(
            self.device.clone(),
            GarbageKind::CommandBuffer { buffer: self.buffer, pool: self.pool.clone() },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vulkan::test_device::{Destroyed, RecordingDevice};

    fn setup(scope: RenderScope) -> (Rc<RecordingDevice>, Rc<GarbageCollector>, CommandBuffer) {
        let recorder = Rc::new(RecordingDevice::new());
        let gc = Rc::new(GarbageCollector::new());
        let pool = Rc::new(CommandPool::new(recorder.clone(), 0).unwrap());
        let cmd = CommandBuffer::allocate(
            recorder.clone(),
            gc.clone(),
            pool,
            SubmitType::IndirectExecution,
            scope,
            QueueFlags::all(),
        )
        .unwrap();
        (recorder, gc, cmd)
    }

    #[test]
    fn test_double_end_is_noop() {
        let (_recorder, _gc, cmd) = setup(RenderScope::Both);
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.end().unwrap();
        assert!(cmd.is_ended());
    }

    #[test]
    fn test_recording_after_end_fails() {
        let (recorder, _gc, cmd) = setup(RenderScope::Both);
        let (src, dst): (vk::Buffer, vk::Buffer) = (recorder.handle(), recorder.handle());
        cmd.begin().unwrap();
        cmd.end().unwrap();

        let copy = cmd.copy_buffer(src, dst, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 4 }]);
        assert!(matches!(copy, Err(VulkanError::InvalidOperation { .. })));
        assert!(cmd.begin().is_err());
    }

    #[test]
    fn test_reset_behaves_like_fresh_buffer() {
        let (recorder, _gc, cmd) = setup(RenderScope::Both);
        let image: vk::Image = recorder.handle();
        let render_pass: vk::RenderPass = recorder.handle();
        let framebuffer: vk::Framebuffer = recorder.handle();

        cmd.begin().unwrap();
        cmd.begin_render_pass(render_pass, framebuffer, vk::Rect2D::default(), &[]).unwrap();
        cmd.end_render_pass().unwrap();
        cmd.end().unwrap();
        assert_eq!(cmd.queues(), QueueFlags::GRAPHICS);
        assert_eq!(cmd.scope(), RenderScope::Outside);

        cmd.reset().unwrap();
        assert_eq!(cmd.state(), RecordingState::Unrecorded);
        assert_eq!(cmd.scope(), RenderScope::Both);
        assert_eq!(cmd.queues(), QueueFlags::all());

        cmd.begin().unwrap();
        cmd.transition_image(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        cmd.end().unwrap();
        assert_eq!(recorder.begin_count(cmd.handle()), 2);
        assert_eq!(recorder.recorded(cmd.handle()).len(), 1);
    }

    #[test]
    fn test_begin_twice_fails() {
        let (_recorder, _gc, cmd) = setup(RenderScope::Both);
        cmd.begin().unwrap();
        assert!(cmd.begin().is_err());
        assert!(cmd.is_recording());
    }

    #[test]
    fn test_end_without_begin_fails() {
        let (_recorder, _gc, cmd) = setup(RenderScope::Both);
        assert!(cmd.end().is_err());
    }

    #[test]
    fn test_unallocated_buffer_cannot_begin() {
        let recorder = Rc::new(RecordingDevice::new());
        let gc = Rc::new(GarbageCollector::new());
        let pool = Rc::new(CommandPool::new(recorder.clone(), 0).unwrap());
        let pool_handle = pool.handle();
        let cmd = CommandBuffer::wrap(
            recorder.clone(),
            gc,
            vk::CommandBuffer::null(),
            pool.clone(),
            SubmitType::DirectWaitExecution,
            RenderScope::Outside,
            QueueFlags::GRAPHICS,
        );
        assert!(cmd.begin().is_err());
        drop(cmd);
        drop(pool);
        assert_eq!(recorder.destroyed(), vec![Destroyed::CommandPool(pool_handle)]);
    }

    #[test]
    fn test_outside_commands_rejected_inside_pass() {
        let (recorder, _gc, cmd) = setup(RenderScope::Both);
        let (src, dst): (vk::Image, vk::Image) = (recorder.handle(), recorder.handle());
        let render_pass: vk::RenderPass = recorder.handle();
        let framebuffer: vk::Framebuffer = recorder.handle();

        cmd.begin().unwrap();
        cmd.begin_render_pass(render_pass, framebuffer, vk::Rect2D::default(), &[]).unwrap();
        assert_eq!(cmd.scope(), RenderScope::Inside);
        assert!(cmd.blit_image(src, dst, &[], vk::Filter::LINEAR).is_err());
        assert!(cmd
            .begin_render_pass(render_pass, framebuffer, vk::Rect2D::default(), &[])
            .is_err());
        assert!(cmd.end().is_err());

        cmd.end_render_pass().unwrap();
        cmd.blit_image(src, dst, &[], vk::Filter::LINEAR).unwrap();
        cmd.end().unwrap();
    }

    #[test]
    fn test_inside_scope_buffer_rejects_copies() {
        let (recorder, _gc, cmd) = setup(RenderScope::Inside);
        let (src, dst): (vk::Buffer, vk::Buffer) = (recorder.handle(), recorder.handle());
        cmd.begin().unwrap();
        assert!(cmd.copy_buffer(src, dst, &[]).is_err());
    }

    #[test]
    fn test_queue_narrowing() {
        let (recorder, _gc, cmd) = setup(RenderScope::Both);
        let (buffer, image): (vk::Buffer, vk::Image) = (recorder.handle(), recorder.handle());

        cmd.begin().unwrap();
        cmd.copy_buffer_to_image(buffer, image, vk::Extent2D { width: 4, height: 4 }).unwrap();
        assert_eq!(cmd.queues(), QueueFlags::all());
        assert_eq!(cmd.scope(), RenderScope::Outside);

        cmd.blit_image(image, image, &[], vk::Filter::NEAREST).unwrap();
        assert_eq!(cmd.queues(), QueueFlags::GRAPHICS);
        assert!(cmd.supports(QueueFlags::GRAPHICS));
        assert!(!cmd.supports(QueueFlags::COMPUTE | QueueFlags::TRANSFER));
    }

    #[test]
    fn test_drop_defers_free() {
        let (recorder, gc, cmd) = setup(RenderScope::Outside);
        let handle = cmd.handle();
        drop(cmd);
        assert_eq!(gc.len(), 1);
        assert_eq!(recorder.destroy_count(Destroyed::CommandBuffer(handle)), 0);
        gc.free_all();
        assert_eq!(recorder.destroy_count(Destroyed::CommandBuffer(handle)), 1);
    }
}
