//! In-memory device used by the unit tests
//!
//! Hands out unique handles, keeps buffer memory in host vectors, enforces descriptor
//! pool capacity and records every destroy, command and submission in order.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use ash::vk::{self, Handle};
use slotmap::{Key, SlotMap};

use super::device::{
    BufferAllocation, BufferRequest, DescriptorWrite, DeviceCommand, GpuDevice, ImageAllocation,
    ImageRequest, LayoutBinding, MemoryKey, MemoryLocation, QueueInfo, Queues, SubmitBatch,
};
use super::{VulkanError, VulkanResult};

/// A native destroy observed by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destroyed {
    Buffer(vk::Buffer),
    Image(vk::Image),
    Sampler(vk::Sampler),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSet(vk::DescriptorSet),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    CommandPool(vk::CommandPool),
    CommandBuffer(vk::CommandBuffer),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

/// A queue submission observed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Submission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

struct PoolState {
    capacity: u32,
    live: HashSet<vk::DescriptorSet>,
    fragmented: bool,
}

pub(crate) struct RecordingDevice {
    next_handle: Cell<u64>,
    queues: Queues,
    memory: RefCell<SlotMap<MemoryKey, (MemoryLocation, Vec<u8>)>>,
    buffer_memory: RefCell<HashMap<vk::Buffer, MemoryKey>>,
    pools: RefCell<HashMap<vk::DescriptorPool, PoolState>>,
    fail_next_set: Cell<Option<vk::Result>>,
    fail_allocations: Cell<bool>,
    fences: RefCell<HashMap<vk::Fence, bool>>,
    stalled: Cell<bool>,
    destroyed: RefCell<Vec<Destroyed>>,
    recorded: RefCell<Vec<(vk::CommandBuffer, DeviceCommand)>>,
    submissions: RefCell<Vec<Submission>>,
    queue_waits: RefCell<Vec<vk::Queue>>,
    begun: RefCell<Vec<vk::CommandBuffer>>,
    resets: RefCell<Vec<vk::CommandBuffer>>,
    writes: RefCell<Vec<DescriptorWrite>>,
    set_layouts_created: Cell<usize>,
    pipeline_layouts_created: Cell<usize>,
}

impl RecordingDevice {
    /// Device with dedicated graphics, compute and transfer queues
    pub fn new() -> Self {
        let queues = Queues {
            graphics: QueueInfo { queue: vk::Queue::from_raw(0x1_0000_0001), family: 0 },
            compute: Some(QueueInfo { queue: vk::Queue::from_raw(0x1_0000_0002), family: 1 }),
            transfer: Some(QueueInfo { queue: vk::Queue::from_raw(0x1_0000_0003), family: 2 }),
            present: None,
        };
        Self::with_queues(queues)
    }

    /// Device exposing only a graphics queue
    pub fn graphics_only() -> Self {
        let mut queues = Self::new().queues;
        queues.compute = None;
        queues.transfer = None;
        Self::with_queues(queues)
    }

    fn with_queues(queues: Queues) -> Self {
        Self {
            next_handle: Cell::new(1),
            queues,
            memory: RefCell::new(SlotMap::with_key()),
            buffer_memory: RefCell::new(HashMap::new()),
            pools: RefCell::new(HashMap::new()),
            fail_next_set: Cell::new(None),
            fail_allocations: Cell::new(false),
            fences: RefCell::new(HashMap::new()),
            stalled: Cell::new(false),
            destroyed: RefCell::new(Vec::new()),
            recorded: RefCell::new(Vec::new()),
            submissions: RefCell::new(Vec::new()),
            queue_waits: RefCell::new(Vec::new()),
            begun: RefCell::new(Vec::new()),
            resets: RefCell::new(Vec::new()),
            writes: RefCell::new(Vec::new()),
            set_layouts_created: Cell::new(0),
            pipeline_layouts_created: Cell::new(0),
        }
    }

    /// A fresh, never-before-seen handle of any type
    pub fn handle<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }

    /// Make every later allocation from `pool` report `FRAGMENTED_POOL`
    pub fn fragment_pool(&self, pool: vk::DescriptorPool) {
        if let Some(state) = self.pools.borrow_mut().get_mut(&pool) {
            state.fragmented = true;
        }
    }

    /// Fail the next descriptor set allocation with `result`
    pub fn fail_next_set(&self, result: vk::Result) {
        self.fail_next_set.set(Some(result));
    }

    /// Make buffer and image allocation fail
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    /// While stalled, submissions never signal their fence
    pub fn stall(&self, stalled: bool) {
        self.stalled.set(stalled);
    }

    /// Mark every fence as signaled, as if the GPU caught up
    pub fn complete_all(&self) {
        for signaled in self.fences.borrow_mut().values_mut() {
            *signaled = true;
        }
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.borrow().get(&fence).copied().unwrap_or(false)
    }

    pub fn destroyed(&self) -> Vec<Destroyed> {
        self.destroyed.borrow().clone()
    }

    pub fn destroy_count(&self, what: Destroyed) -> usize {
        self.destroyed.borrow().iter().filter(|d| **d == what).count()
    }

    pub fn destroy_count_where(&self, pred: impl Fn(&Destroyed) -> bool) -> usize {
        self.destroyed.borrow().iter().filter(|d| pred(d)).count()
    }

    pub fn recorded(&self, buffer: vk::CommandBuffer) -> Vec<DeviceCommand> {
        self.recorded
            .borrow()
            .iter()
            .filter(|(cb, _)| *cb == buffer)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.borrow().clone()
    }

    pub fn queue_waits(&self) -> Vec<vk::Queue> {
        self.queue_waits.borrow().clone()
    }

    pub fn begin_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.begun.borrow().iter().filter(|b| **b == buffer).count()
    }

    pub fn reset_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.resets.borrow().iter().filter(|b| **b == buffer).count()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.writes.borrow().clone()
    }

    pub fn live_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.pools.borrow().get(&pool).map_or(0, |state| state.live.len())
    }

    pub fn set_layouts_created(&self) -> usize {
        self.set_layouts_created.get()
    }

    pub fn pipeline_layouts_created(&self) -> usize {
        self.pipeline_layouts_created.get()
    }

    pub fn memory_contents(&self, memory: MemoryKey) -> Vec<u8> {
        self.memory.borrow().get(memory).map(|(_, bytes)| bytes.clone()).unwrap_or_default()
    }

    /// Contents of the memory behind a buffer handle; empty once the buffer is destroyed
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let memory = self.buffer_memory.borrow().get(&buffer).copied();
        memory.map(|memory| self.memory_contents(memory)).unwrap_or_default()
    }

    fn log(&self, what: Destroyed) {
        self.destroyed.borrow_mut().push(what);
    }

    fn allocate_memory(&self, location: MemoryLocation, size: usize) -> MemoryKey {
        self.memory.borrow_mut().insert((location, vec![0; size]))
    }

    fn release_memory(&self, memory: MemoryKey) {
        self.memory.borrow_mut().remove(memory);
    }

    fn with_host_memory<R>(
        &self,
        memory: MemoryKey,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> VulkanResult<R> {
        let mut slots = self.memory.borrow_mut();
        let (location, bytes) = slots
            .get_mut(memory)
            .ok_or(VulkanError::ResourceNotFound { id: memory.data().as_ffi() })?;
        if !location.is_host_visible() {
            return Err(VulkanError::invalid("memory is not host visible"));
        }
        let end = offset + len;
        if end > bytes.len() {
            return Err(VulkanError::invalid(format!(
                "access {offset}..{end} past allocation of {} bytes",
                bytes.len()
            )));
        }
        Ok(f(&mut bytes[offset..end]))
    }
}

impl GpuDevice for RecordingDevice {
    fn queues(&self) -> Queues {
        self.queues
    }

    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation> {
        if self.fail_allocations.get() {
            return Err(VulkanError::OutOfMemory { requested: request.size as usize });
        }
        let allocation = BufferAllocation {
            buffer: self.handle(),
            memory: self.allocate_memory(request.location, request.size as usize),
            size: request.size,
            location: request.location,
        };
        self.buffer_memory.borrow_mut().insert(allocation.buffer, allocation.memory);
        Ok(allocation)
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) {
        self.release_memory(allocation.memory);
        self.log(Destroyed::Buffer(allocation.buffer));
    }

    fn write_memory(&self, memory: MemoryKey, offset: usize, data: &[u8]) -> VulkanResult<()> {
        self.with_host_memory(memory, offset, data.len(), |dst| dst.copy_from_slice(data))
    }

    fn read_memory(&self, memory: MemoryKey, offset: usize, out: &mut [u8]) -> VulkanResult<()> {
        self.with_host_memory(memory, offset, out.len(), |src| out.copy_from_slice(src))
    }

    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation> {
        if self.fail_allocations.get() {
            let texels = request.extent.width as usize * request.extent.height as usize;
            return Err(VulkanError::OutOfMemory { requested: texels * 4 });
        }
        Ok(ImageAllocation {
            image: self.handle(),
            view: self.handle(),
            memory: self.allocate_memory(MemoryLocation::Device, 0),
            extent: request.extent,
            format: request.format,
        })
    }

    fn destroy_image(&self, allocation: ImageAllocation) {
        self.release_memory(allocation.memory);
        self.log(Destroyed::Image(allocation.image));
    }

    fn create_sampler(
        &self,
        _filter: vk::Filter,
        _address_mode: vk::SamplerAddressMode,
    ) -> VulkanResult<vk::Sampler> {
        Ok(self.handle())
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.log(Destroyed::Sampler(sampler));
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        _individually_free: bool,
    ) -> VulkanResult<vk::DescriptorPool> {
        let pool = self.handle();
        self.pools.borrow_mut().insert(
            pool,
            PoolState { capacity: max_sets, live: HashSet::new(), fragmented: false },
        );
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        if let Some(state) = self.pools.borrow_mut().get_mut(&pool) {
            state.live.clear();
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.pools.borrow_mut().remove(&pool);
        self.log(Destroyed::DescriptorPool(pool));
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        _variable_count: u32,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        if let Some(result) = self.fail_next_set.take() {
            return Err(result);
        }
        let set = self.handle();
        let mut pools = self.pools.borrow_mut();
        let state = pools.get_mut(&pool).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if state.fragmented {
            return Err(vk::Result::ERROR_FRAGMENTED_POOL);
        }
        if state.live.len() as u32 >= state.capacity {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        state.live.insert(set);
        Ok(set)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Some(state) = self.pools.borrow_mut().get_mut(&pool) {
            state.live.remove(&set);
        }
        self.log(Destroyed::DescriptorSet(set));
    }

    fn write_descriptors(&self, writes: &[DescriptorWrite]) {
        self.writes.borrow_mut().extend_from_slice(writes);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[LayoutBinding],
        _variable_count: bool,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        self.set_layouts_created.set(self.set_layouts_created.get() + 1);
        Ok(self.handle())
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.log(Destroyed::DescriptorSetLayout(layout));
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        self.pipeline_layouts_created.set(self.pipeline_layouts_created.get() + 1);
        Ok(self.handle())
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.log(Destroyed::PipelineLayout(layout));
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.log(Destroyed::Pipeline(pipeline));
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.log(Destroyed::Framebuffer(framebuffer));
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.log(Destroyed::RenderPass(render_pass));
    }

    fn create_command_pool(&self, _queue_family: u32) -> VulkanResult<vk::CommandPool> {
        Ok(self.handle())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.log(Destroyed::CommandPool(pool));
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer> {
        Ok(self.handle())
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.log(Destroyed::CommandBuffer(buffer));
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, _one_time: bool) -> VulkanResult<()> {
        self.begun.borrow_mut().push(buffer);
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> VulkanResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()> {
        self.resets.borrow_mut().push(buffer);
        self.recorded.borrow_mut().retain(|(cb, _)| *cb != buffer);
        Ok(())
    }

    fn record(&self, buffer: vk::CommandBuffer, command: &DeviceCommand) {
        self.recorded.borrow_mut().push((buffer, command.clone()));
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        Ok(self.handle())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.log(Destroyed::Semaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let fence = self.handle();
        self.fences.borrow_mut().insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.borrow_mut().remove(&fence);
        self.log(Destroyed::Fence(fence));
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> VulkanResult<bool> {
        let states = self.fences.borrow();
        Ok(fences.iter().all(|fence| states.get(fence).copied().unwrap_or(false)))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        let mut states = self.fences.borrow_mut();
        for fence in fences {
            states.insert(*fence, false);
        }
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> VulkanResult<()> {
        if batch.fence != vk::Fence::null() && !self.stalled.get() {
            self.fences.borrow_mut().insert(batch.fence, true);
        }
        self.submissions.borrow_mut().push(Submission {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence: batch.fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VulkanResult<()> {
        self.queue_waits.borrow_mut().push(queue);
        Ok(())
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        if !self.stalled.get() {
            self.complete_all();
        }
        Ok(())
    }
}
