//! GPU context
//!
//! The [`Context`] owns the device, the graphics command pool, the descriptor pools and
//! layout caches, the global transform storage and the per-frame submission state. It
//! implements the two execution models every resource wrapper uses:
//!
//! - `DirectWaitExecution`: recorded, submitted and waited on before returning.
//! - `IndirectExecution`: queued in the current frame slot and submitted as one batch by
//!   [`Context::submit`], which signals the slot semaphore the renderer's graphics
//!   submission waits on.
//!
//! # Frame loop
//!
//! `prepare_frame` → record → `submit` → `submit_graphics`. `submit` advances the frame
//! slot; the new slot is recycled (its fences waited on, its garbage freed, its reusable
//! command buffer reset) by the next `prepare_frame`, or lazily by the next indirect
//! `begin_commands`, transform request or `submit`.
//!
//! ```text
//!            prepare_frame        begin_commands (indirect)       submit       submit_graphics
//! slot 0:  wait fences 0 -> gc 0 -> record copies/uploads -> batch, signal sem 0 -> wait sem 0
//! slot 1:                                                    prepare_frame -> ...
//! ```
//!
//! # Frame slot state
//!
//! Each of the [`MAX_FRAMES_IN_FLIGHT`] slots owns:
//!
//! - a [`FrameSync`]: the semaphore the indirect batch signals, the fence guarding that
//!   batch and the in-flight fence the renderer's graphics submission signals;
//! - a reusable outside-scope graphics command buffer that coalesces every small upload
//!   of the frame, plus the other indirect buffers queued for it;
//! - a set of global transform records with their own storage buffer and descriptor
//!   set, so the CPU can fill slot N+1 while the GPU still reads slot N;
//! - a garbage collector slot, freed only after both fences have been waited on.
//!
//! Work is only ever recorded into a slot after it has been recycled, which is what
//! makes anything pushed to the collector at that point safe to destroy when the slot
//! comes around again.
//!
//! # Semaphore bookkeeping
//!
//! A slot semaphore signaled by `submit` must be waited on before it is signaled again.
//! `submit_graphics` waits on it; if the renderer skipped that, the next `submit` of the
//! slot first sends an empty submission that consumes it.
//!
//! # Teardown
//!
//! Dropping the context waits for the device, drops the frame state, then disables the
//! collector so every pending entry is destroyed before the pools and layouts that back
//! them. Command buffers keep the command pool alive through an `Rc`, so buffers the
//! application still holds are freed before the pool goes away.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::device::{
    BufferAllocation, BufferRequest, GpuDevice, ImageAllocation, ImageRequest, MemoryLocation,
    Queues, SubmitBatch,
};
use crate::backend::vulkan::initialization::AshDevice;
use crate::backend::vulkan::rendering::command_buffer::{
    CommandBuffer, CommandPool, QueueFlags, RenderScope, SubmitType,
};
use crate::backend::vulkan::resources::descriptor_pool::{DescriptorPool, DescriptorSet};
use crate::backend::vulkan::resources::garbage::GarbageCollector;
use crate::backend::vulkan::resources::global_transform::{GlobalTransform, GlobalTransforms};
use crate::backend::vulkan::resources::layout_cache::{
    DescriptorSetLayoutBuilder, LayoutCache, PipelineLayouts, ShaderLayoutInfo,
};
use crate::backend::vulkan::state::sync::FrameSync;
use crate::backend::vulkan::{VulkanError, VulkanResult, MAX_FRAMES_IN_FLIGHT};
use crate::config::ContextConfig;

/// Identifies a render target for main-target tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetId(pub u64);

/// What the renderer needs from [`Context::submit`] to submit its graphics work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    /// Frame slot the batch belongs to
    pub slot: usize,
    /// Signaled by the indirect batch; `None` when the slot had no indirect work
    pub wait_semaphore: Option<vk::Semaphore>,
    /// Fence the graphics submission of this frame must signal
    pub in_flight_fence: vk::Fence,
    /// Command buffers in the indirect batch
    pub command_buffer_count: usize,
}

/// Indirect command buffers of one frame slot
struct FrameCommands {
    indirect: Vec<Rc<CommandBuffer>>,
    reusable: Rc<CommandBuffer>,
}

/// Owner of the device and the per-frame submission state
pub struct Context {
    device: Rc<dyn GpuDevice>,
    config: ContextConfig,
    gc: Rc<GarbageCollector>,
    multi_use_pool: DescriptorPool,
    texture_pool: DescriptorPool,
    transform_pool: DescriptorPool,
    layouts: RefCell<LayoutCache>,
    texture_layout: vk::DescriptorSetLayout,
    transform_layout: vk::DescriptorSetLayout,
    // one set of records per frame slot; emptied on drop
    transforms: RefCell<Vec<GlobalTransforms>>,
    frames: RefCell<Vec<FrameCommands>>,
    sync: Vec<FrameSync>,
    // the slot semaphore was signaled and no submission has waited on it yet
    semaphore_pending: [Cell<bool>; MAX_FRAMES_IN_FLIGHT],
    current_frame: Cell<usize>,
    frame_ready: Cell<bool>,
    main_render_target: Cell<Option<RenderTargetId>>,
    targets_started: Cell<bool>,
    command_pool: Rc<CommandPool>,
}

impl Context {
    /// Create a context on the first suitable GPU
    pub fn new(config: ContextConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|err| VulkanError::InitializationFailed(err.to_string()))?;
        let device = Rc::new(AshDevice::new(&config)?);
        Self::with_device(device, config)
    }

    /// Create a context on an existing device
    pub fn with_device(device: Rc<dyn GpuDevice>, config: ContextConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|err| VulkanError::InitializationFailed(err.to_string()))?;
        let queues = device.queues();
        let gc = Rc::new(GarbageCollector::new());
        let command_pool = Rc::new(CommandPool::new(device.clone(), queues.graphics.family)?);

        let sync = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;

        let multi_use_pool =
            DescriptorPool::from_config(device.clone(), gc.clone(), &config.multi_use_pool, false)?;
        let texture_pool =
            DescriptorPool::from_config(device.clone(), gc.clone(), &config.texture_pool, false)?;
        let transform_pool =
            DescriptorPool::from_config(device.clone(), gc.clone(), &config.transform_pool, false)?;

        let transforms = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| {
                GlobalTransforms::new(device.clone(), gc.clone(), config.initial_global_transforms)
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| {
                let reusable = CommandBuffer::allocate(
                    device.clone(),
                    gc.clone(),
                    command_pool.clone(),
                    SubmitType::IndirectExecution,
                    RenderScope::Outside,
                    QueueFlags::GRAPHICS,
                )?;
                Ok(FrameCommands { indirect: Vec::new(), reusable: Rc::new(reusable) })
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let texture_layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_samplers(0, 1, vk::ShaderStageFlags::FRAGMENT)
            .build(device.as_ref())?;
        let transform_layout = match DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(device.as_ref())
        {
            Ok(layout) => layout,
            Err(err) => {
                device.destroy_descriptor_set_layout(texture_layout);
                return Err(err);
            }
        };

        log::info!(
            "GPU context ready ({} frames in flight, {} initial transforms per frame)",
            MAX_FRAMES_IN_FLIGHT,
            transforms.first().map_or(0, GlobalTransforms::capacity)
        );

        Ok(Self {
            layouts: RefCell::new(LayoutCache::new(device.clone())),
            device,
            config,
            gc,
            multi_use_pool,
            texture_pool,
            transform_pool,
            texture_layout,
            transform_layout,
            transforms: RefCell::new(transforms),
            frames: RefCell::new(frames),
            sync,
            semaphore_pending: std::array::from_fn(|_| Cell::new(false)),
            current_frame: Cell::new(0),
            frame_ready: Cell::new(true),
            main_render_target: Cell::new(None),
            targets_started: Cell::new(false),
            command_pool,
        })
    }

    /// Shared device handle
    pub fn device(&self) -> &Rc<dyn GpuDevice> {
        &self.device
    }

    /// Shared garbage collector
    pub fn garbage_collector(&self) -> &Rc<GarbageCollector> {
        &self.gc
    }

    /// Queues of the device
    pub fn queues(&self) -> Queues {
        self.device.queues()
    }

    /// Configuration the context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Current frame slot
    pub fn current_frame(&self) -> usize {
        self.current_frame.get()
    }

    /// Graphics command pool
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// General purpose descriptor pool
    pub fn multi_use_pool(&self) -> &DescriptorPool {
        &self.multi_use_pool
    }

    /// Texture descriptor pool
    pub fn texture_pool(&self) -> &DescriptorPool {
        &self.texture_pool
    }

    /// Global transform descriptor pool
    pub fn transform_pool(&self) -> &DescriptorPool {
        &self.transform_pool
    }

    /// Hand out a command buffer that is already recording
    ///
    /// Indirect requests for an outside-scope, graphics-only buffer all return the
    /// current slot's reusable buffer; other indirect requests get a fresh buffer queued
    /// for the next [`Context::submit`].
    pub fn begin_commands(
        &self,
        submit_type: SubmitType,
        scope: RenderScope,
        queues: QueueFlags,
    ) -> VulkanResult<Rc<CommandBuffer>> {
        if queues.is_empty() {
            return Err(VulkanError::invalid("command buffer needs at least one queue"));
        }

        match submit_type {
            SubmitType::DirectWaitExecution => {
                let cmd = self.allocate_commands(submit_type, scope, queues)?;
                cmd.begin()?;
                Ok(Rc::new(cmd))
            }
            SubmitType::IndirectExecution => {
                self.ensure_frame_ready()?;
                let mut frames = self.frames.borrow_mut();
                let frame = &mut frames[self.current_frame.get()];

                if scope == RenderScope::Outside && queues == QueueFlags::GRAPHICS {
                    let reusable = &frame.reusable;
                    if !reusable.is_recording() {
                        if reusable.is_ended() {
                            reusable.reset()?;
                        }
                        reusable.begin()?;
                    }
                    return Ok(Rc::clone(reusable));
                }

                let cmd = Rc::new(self.allocate_commands(submit_type, scope, queues)?);
                cmd.begin()?;
                frame.indirect.push(Rc::clone(&cmd));
                Ok(cmd)
            }
        }
    }

    fn allocate_commands(
        &self,
        submit_type: SubmitType,
        scope: RenderScope,
        queues: QueueFlags,
    ) -> VulkanResult<CommandBuffer> {
        CommandBuffer::allocate(
            self.device.clone(),
            self.gc.clone(),
            self.command_pool.clone(),
            submit_type,
            scope,
            queues,
        )
    }

    /// Execute a command buffer from [`Context::begin_commands`]
    ///
    /// Direct buffers are ended, submitted and waited on; indirect buffers already sit
    /// in the frame batch, so this only reports success. Returns `false` when a direct
    /// buffer was never begun.
    pub fn submit_commands(&self, cmd: &CommandBuffer) -> VulkanResult<bool> {
        if cmd.submit_type() == SubmitType::IndirectExecution {
            return Ok(true);
        }
        if !cmd.is_recording() && !cmd.is_ended() {
            log::warn!("Direct command buffer {:?} submitted without being begun", cmd.handle());
            return Ok(false);
        }

        cmd.end()?;
        let queue = self.queue_for(cmd.queues())?;
        let command_buffers = [cmd.handle()];
        self.device.queue_submit(
            queue,
            &SubmitBatch { command_buffers: &command_buffers, ..SubmitBatch::default() },
        )?;
        self.device.queue_wait_idle(queue)?;
        Ok(true)
    }

    /// First queue matching the mask: graphics, else compute, else transfer
    fn queue_for(&self, mask: QueueFlags) -> VulkanResult<vk::Queue> {
        let queues = self.device.queues();
        if mask.contains(QueueFlags::GRAPHICS) {
            return Ok(queues.graphics.queue);
        }
        if mask.contains(QueueFlags::COMPUTE) {
            if let Some(compute) = queues.compute {
                return Ok(compute.queue);
            }
        }
        if mask.contains(QueueFlags::TRANSFER) {
            if let Some(transfer) = queues.transfer {
                return Ok(transfer.queue);
            }
        }
        Err(VulkanError::invalid(format!("no queue available for {mask:?}")))
    }

    /// Wait up to `timeout_ns` for the current frame slot to be free
    ///
    /// On success the slot is recycled and its index returned. On timeout nothing
    /// changes and `None` is returned, so the caller can skip the frame and retry.
    pub fn prepare_frame(&self, timeout_ns: u64) -> VulkanResult<Option<usize>> {
        let slot = self.current_frame.get();
        if self.frame_ready.get() {
            return Ok(Some(slot));
        }
        if !self.device.wait_for_fences(&self.sync[slot].fences(), timeout_ns)? {
            log::debug!("Frame slot {} still in flight after {} ns", slot, timeout_ns);
            return Ok(None);
        }
        self.recycle_current();
        Ok(Some(slot))
    }

    /// [`Context::prepare_frame`] with the configured frame timeout
    pub fn prepare_next_frame(&self) -> VulkanResult<Option<usize>> {
        self.prepare_frame(self.config.frame_timeout_ns)
    }

    fn ensure_frame_ready(&self) -> VulkanResult<()> {
        if self.frame_ready.get() {
            return Ok(());
        }
        let slot = self.current_frame.get();
        if !self.device.wait_for_fences(&self.sync[slot].fences(), u64::MAX)? {
            return Err(VulkanError::Api(vk::Result::TIMEOUT));
        }
        self.recycle_current();
        Ok(())
    }

    fn recycle_current(&self) {
        self.gc.set_current_frame(self.current_frame.get());
        self.frame_ready.set(true);
    }

    /// Submit the slot's indirect work as one batch and advance to the next slot
    pub fn submit(&self) -> VulkanResult<FrameSubmission> {
        self.ensure_frame_ready()?;
        let slot = self.current_frame.get();
        let sync = &self.sync[slot];

        if self.semaphore_pending[slot].replace(false) {
            // Unwaited semaphore from this slot's previous frame; consume it before reuse.
            log::warn!("Frame slot {} semaphore was never waited on; consuming it", slot);
            let wait = [sync.indirect_finished.handle()];
            let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
            self.device.queue_submit(
                self.device.queues().graphics.queue,
                &SubmitBatch { wait_semaphores: &wait, wait_stages: &stages, ..SubmitBatch::default() },
            )?;
        }

        let batch = {
            let mut frames = self.frames.borrow_mut();
            let frame = &mut frames[slot];
            let mut batch = Vec::with_capacity(frame.indirect.len() + 1);
            if frame.reusable.is_recording() {
                frame.reusable.end()?;
                batch.push(frame.reusable.handle());
            }
            for cmd in frame.indirect.drain(..) {
                if !cmd.supports(QueueFlags::GRAPHICS) {
                    log::warn!(
                        "Indirect command buffer {:?} cannot run on the graphics queue; discarded",
                        cmd.handle()
                    );
                    continue;
                }
                cmd.end()?;
                batch.push(cmd.handle());
            }
            batch
        };

        let wait_semaphore = if batch.is_empty() {
            None
        } else {
            let signal = [sync.indirect_finished.handle()];
            sync.indirect_fence.reset()?;
            self.device.queue_submit(
                self.device.queues().graphics.queue,
                &SubmitBatch {
                    command_buffers: &batch,
                    signal_semaphores: &signal,
                    fence: sync.indirect_fence.handle(),
                    ..SubmitBatch::default()
                },
            )?;
            self.semaphore_pending[slot].set(true);
            Some(signal[0])
        };
        log::trace!("Frame slot {} submitted {} indirect command buffers", slot, batch.len());

        self.current_frame.set((slot + 1) % MAX_FRAMES_IN_FLIGHT);
        self.frame_ready.set(false);
        self.targets_started.set(false);

        Ok(FrameSubmission {
            slot,
            wait_semaphore,
            in_flight_fence: sync.in_flight.handle(),
            command_buffer_count: batch.len(),
        })
    }

    /// Submit the renderer's graphics work for a frame
    ///
    /// Waits on the frame's indirect semaphore (plus `wait`) and signals the frame's
    /// in-flight fence (plus `signal`).
    pub fn submit_graphics(
        &self,
        cmd: &CommandBuffer,
        submission: &FrameSubmission,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> VulkanResult<()> {
        if submission.slot >= MAX_FRAMES_IN_FLIGHT {
            return Err(VulkanError::invalid("frame submission slot out of range"));
        }
        cmd.end()?;

        let mut wait_semaphores = Vec::with_capacity(wait.len() + 1);
        let mut wait_stages = Vec::with_capacity(wait.len() + 1);
        if let Some(semaphore) = submission.wait_semaphore {
            wait_semaphores.push(semaphore);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }
        for (semaphore, stage) in wait {
            wait_semaphores.push(*semaphore);
            wait_stages.push(*stage);
        }

        let fence = &self.sync[submission.slot].in_flight;
        fence.reset()?;
        let command_buffers = [cmd.handle()];
        self.device.queue_submit(
            self.device.queues().graphics.queue,
            &SubmitBatch {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: signal,
                fence: fence.handle(),
            },
        )?;
        if submission.wait_semaphore.is_some() {
            self.semaphore_pending[submission.slot].set(false);
        }
        Ok(())
    }

    /// Allocate a buffer; `None` (with a warning) when memory is exhausted
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Option<BufferAllocation> {
        match self.device.create_buffer(&BufferRequest { size, usage, location }) {
            Ok(allocation) => Some(allocation),
            Err(err) => {
                log::warn!("Buffer allocation of {} bytes failed: {}", size, err);
                None
            }
        }
    }

    /// Allocate a device-local 2D image with a default view
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Option<ImageAllocation> {
        let aspect = match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        };
        match self.device.create_image(&ImageRequest { extent, format, usage, aspect }) {
            Ok(allocation) => Some(allocation),
            Err(err) => {
                log::warn!(
                    "Image allocation of {}x{} {:?} failed: {}",
                    extent.width,
                    extent.height,
                    format,
                    err
                );
                None
            }
        }
    }

    /// Records of the current slot, once the GPU is done reading them
    fn transforms_mut(&self) -> VulkanResult<RefMut<'_, GlobalTransforms>> {
        self.ensure_frame_ready()?;
        let slot = self.current_frame.get();
        let transforms = self
            .transforms
            .try_borrow_mut()
            .map_err(|_| VulkanError::invalid("global transform records are still borrowed"))?;
        RefMut::filter_map(transforms, |transforms| transforms.get_mut(slot))
            .map_err(|_| VulkanError::invalid("global transforms already released"))
    }

    /// Reserve the next global transform record of this frame
    pub fn request_global_transform(&self) -> VulkanResult<(u32, RefMut<'_, GlobalTransform>)> {
        let mut transforms = self.transforms_mut()?;
        let index = transforms.request()?;
        let record = RefMut::map(transforms, |transforms| transforms.record_mut(index as usize));
        Ok((index, record))
    }

    /// A record reserved earlier in this frame
    ///
    /// `None` while a record handed out by [`Context::request_global_transform`] is
    /// still borrowed.
    pub fn get_global_transform(&self, index: u32) -> Option<Ref<'_, GlobalTransform>> {
        let slot = self.current_frame.get();
        let transforms = self.transforms.try_borrow().ok()?;
        Ref::filter_map(transforms, |transforms| {
            transforms.get(slot).and_then(|transforms| transforms.get(index as usize))
        })
        .ok()
    }

    /// Records reserved this frame
    pub fn global_transform_count(&self) -> usize {
        let slot = self.current_frame.get();
        self.transforms
            .try_borrow()
            .map_or(0, |transforms| transforms.get(slot).map_or(0, GlobalTransforms::count))
    }

    /// Upload pending records and return the set to bind at draw time
    pub fn global_transform_set(&self) -> VulkanResult<Option<vk::DescriptorSet>> {
        let mut transforms = self.transforms_mut()?;
        transforms.flush()?;
        transforms.refresh_descriptor(&self.transform_pool, self.transform_layout)?;
        Ok(transforms.descriptor_set())
    }

    /// Make `target` the active main render target
    ///
    /// Returns `false` when another target is still active. The first start of a frame
    /// resets the global transform count and refreshes its descriptor set if needed.
    pub fn start_main_render_target(&self, target: RenderTargetId) -> VulkanResult<bool> {
        if let Some(active) = self.main_render_target.get() {
            log::debug!("Render target {:?} started while {:?} is active", target, active);
            return Ok(false);
        }
        if !self.targets_started.get() {
            let mut transforms = self.transforms_mut()?;
            transforms.reset_count();
            transforms.refresh_descriptor(&self.transform_pool, self.transform_layout)?;
            self.targets_started.set(true);
        }
        self.main_render_target.set(Some(target));
        Ok(true)
    }

    /// Finish the active main render target, uploading the frame's transform records
    pub fn end_main_render_target(&self) -> VulkanResult<bool> {
        if self.main_render_target.get().is_none() {
            return Ok(false);
        }
        self.transforms_mut()?.flush()?;
        self.main_render_target.set(None);
        Ok(true)
    }

    /// Whether `target` is the active main render target
    pub fn is_main_render_target(&self, target: RenderTargetId) -> bool {
        self.main_render_target.get() == Some(target)
    }

    /// The active main render target
    pub fn main_render_target(&self) -> Option<RenderTargetId> {
        self.main_render_target.get()
    }

    /// Set layouts and pipeline layout for a shader combination, cached
    pub fn request_layouts(&self, shaders: &[ShaderLayoutInfo]) -> VulkanResult<PipelineLayouts> {
        self.layouts.borrow_mut().request_layouts(shaders)
    }

    /// Variable-count texture array layout for a shader combination, cached
    pub fn request_texture_layout(
        &self,
        shaders: &[ShaderLayoutInfo],
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        self.layouts
            .borrow_mut()
            .request_texture_layout(shaders, self.config.max_texture_array_size)
    }

    /// Single combined-image-sampler layout used by texture sets
    pub fn texture_layout(&self) -> vk::DescriptorSetLayout {
        self.texture_layout
    }

    /// Storage buffer layout used by the global transform set
    pub fn transform_layout(&self) -> vk::DescriptorSetLayout {
        self.transform_layout
    }

    /// Allocate a set from the multi-use pool
    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        variable_count: u32,
    ) -> Option<DescriptorSet> {
        self.multi_use_pool.allocate_descriptor_set(layout, variable_count)
    }

    /// Allocate a single-texture set from the texture pool
    pub fn allocate_texture_descriptor_set(&self) -> Option<DescriptorSet> {
        self.texture_pool.allocate_descriptor_set(self.texture_layout, 0)
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {}", err);
        }

        self.frames.get_mut().clear();
        self.transforms.get_mut().clear();
        self.gc.enable(false);

        self.multi_use_pool.destroy();
        self.texture_pool.destroy();
        self.transform_pool.destroy();
        self.layouts.get_mut().destroy();
        self.device.destroy_descriptor_set_layout(self.texture_layout);
        self.device.destroy_descriptor_set_layout(self.transform_layout);
        // sync objects and the command pool are released with the fields; the pool lives
        // on while command buffers handed out earlier are still alive
    }
}
