//! Device seam
//!
//! Every native call the lifecycle core makes goes through [`GpuDevice`]. The production
//! implementation is [`crate::backend::vulkan::AshDevice`]; the garbage collector,
//! descriptor pools, command buffers and the context only ever see this trait, so the
//! deferred-destruction and submission ordering can be observed without a GPU.
//!
//! All methods take `&self`: the device is shared through `Rc<dyn GpuDevice>` by every
//! resource wrapper and by the garbage entries that outlive them.

use ash::vk;
use slotmap::new_key_type;

use super::VulkanResult;

new_key_type! {
    /// Key of a device memory allocation owned by the device implementation
    pub struct MemoryKey;
}

/// Where a buffer or image lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Host-visible memory, written in place by the CPU
    Local,
    /// Device-local memory, written through a staging buffer
    Device,
}

impl MemoryLocation {
    /// Whether the CPU can map this memory
    pub fn is_host_visible(self) -> bool {
        matches!(self, Self::Local)
    }
}

/// A queue handle plus the family it was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Native queue
    pub queue: vk::Queue,
    /// Queue family index
    pub family: u32,
}

/// The queues a device exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queues {
    /// Graphics queue (always present)
    pub graphics: QueueInfo,
    /// Dedicated compute queue
    pub compute: Option<QueueInfo>,
    /// Dedicated transfer queue
    pub transfer: Option<QueueInfo>,
    /// Presentation queue
    pub present: Option<QueueInfo>,
}

/// Buffer allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Native usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
}

/// A buffer together with the memory backing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAllocation {
    /// Native buffer
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: MemoryKey,
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Memory placement
    pub location: MemoryLocation,
}

/// 2D image allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRequest {
    /// Dimensions in texels
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// Native usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect used for the default view
    pub aspect: vk::ImageAspectFlags,
}

/// An image, its default view and backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocation {
    /// Native image
    pub image: vk::Image,
    /// Default 2D view over the whole image
    pub view: vk::ImageView,
    /// Backing memory
    pub memory: MemoryKey,
    /// Dimensions in texels
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
}

/// One binding of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array size (upper bound for variable-count bindings)
    pub count: u32,
    /// Shader stages that access the binding
    pub stages: vk::ShaderStageFlags,
}

/// The resource a descriptor points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Uniform or storage buffer range
    Buffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Byte range
        range: vk::DeviceSize,
    },
    /// Sampled image
    Image {
        /// Image view
        view: vk::ImageView,
        /// Sampler
        sampler: vk::Sampler,
        /// Layout the image is in when sampled
        layout: vk::ImageLayout,
    },
}

/// A single descriptor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Target set
    pub set: vk::DescriptorSet,
    /// Target binding
    pub binding: u32,
    /// First array element written
    pub array_element: u32,
    /// Descriptor type of the binding
    pub descriptor_type: vk::DescriptorType,
    /// Resource written
    pub resource: DescriptorResource,
}

/// Image layout transition recorded as a pipeline barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    /// Image to transition
    pub image: vk::Image,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Stages waited on
    pub src_stage: vk::PipelineStageFlags,
    /// Stages blocked
    pub dst_stage: vk::PipelineStageFlags,
    /// Aspect of the image affected
    pub aspect: vk::ImageAspectFlags,
}

impl ImageTransition {
    /// Derive access masks and stages for the layout pairs the core uses
    pub fn between(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => (
                vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
        };

        Self {
            image,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

/// A command recorded into a native command buffer
#[derive(Clone)]
pub enum DeviceCommand {
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Copied regions
        regions: Vec<vk::BufferCopy>,
    },
    /// Buffer to image copy; the image must be in `TRANSFER_DST_OPTIMAL`
    CopyBufferToImage {
        /// Source buffer
        buffer: vk::Buffer,
        /// Destination image
        image: vk::Image,
        /// Copied regions
        regions: Vec<vk::BufferImageCopy>,
    },
    /// Layout transition barrier
    Transition(ImageTransition),
    /// Scaled image copy
    BlitImage {
        /// Source image (in `TRANSFER_SRC_OPTIMAL`)
        src: vk::Image,
        /// Destination image (in `TRANSFER_DST_OPTIMAL`)
        dst: vk::Image,
        /// Blitted regions
        regions: Vec<vk::ImageBlit>,
        /// Filter applied when scaling
        filter: vk::Filter,
    },
    /// Start of a render pass instance
    BeginRenderPass {
        /// Render pass
        render_pass: vk::RenderPass,
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area
        area: vk::Rect2D,
        /// Clear values, one per attachment
        clear_values: Vec<vk::ClearValue>,
    },
    /// End of the current render pass instance
    EndRenderPass,
}

/// Everything a single queue submission needs
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    /// Command buffers executed in order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores waited on before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage at which each wait semaphore blocks
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signaled on completion (may be null)
    pub fence: vk::Fence,
}

/// Native device operations used by the lifecycle core
pub trait GpuDevice {
    /// Queues the device was created with
    fn queues(&self) -> Queues;

    /// Allocate a buffer and its memory
    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation>;
    /// Destroy a buffer and release its memory
    fn destroy_buffer(&self, allocation: BufferAllocation);
    /// Copy bytes into host-visible memory
    fn write_memory(&self, memory: MemoryKey, offset: usize, data: &[u8]) -> VulkanResult<()>;
    /// Copy bytes out of host-visible memory
    fn read_memory(&self, memory: MemoryKey, offset: usize, out: &mut [u8]) -> VulkanResult<()>;

    /// Allocate a device-local 2D image with a default view
    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation>;
    /// Destroy an image, its view and its memory
    fn destroy_image(&self, allocation: ImageAllocation);
    /// Create a sampler
    fn create_sampler(
        &self,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
    ) -> VulkanResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Create one native descriptor pool
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        individually_free: bool,
    ) -> VulkanResult<vk::DescriptorPool>;
    /// Return every set of a pool at once
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()>;
    /// Destroy a native descriptor pool
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocate one set; the raw result code lets callers tell exhaustion apart
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: u32,
    ) -> Result<vk::DescriptorSet, vk::Result>;
    /// Return one set to a pool created with `individually_free`
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet);
    /// Apply descriptor updates
    fn write_descriptors(&self, writes: &[DescriptorWrite]);
    /// Create a set layout; `variable_count` makes the last binding variable-sized
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
        variable_count: bool,
    ) -> VulkanResult<vk::DescriptorSetLayout>;
    /// Destroy a set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a pipeline layout
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    /// Create a resettable command pool for a queue family
    fn create_command_pool(&self, queue_family: u32) -> VulkanResult<vk::CommandPool>;
    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer>;
    /// Free one command buffer
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    /// Begin recording
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, one_time: bool) -> VulkanResult<()>;
    /// End recording
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()>;
    /// Reset to the initial state, keeping the allocation
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()>;
    /// Record a command
    fn record(&self, buffer: vk::CommandBuffer, command: &DeviceCommand);

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait until all fences are signaled; `Ok(false)` on timeout
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VulkanResult<bool>;
    /// Return fences to the unsignaled state
    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()>;

    /// Submit one batch to a queue
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> VulkanResult<()>;
    /// Block until a queue is idle
    fn queue_wait_idle(&self, queue: vk::Queue) -> VulkanResult<()>;
    /// Block until the whole device is idle
    fn wait_idle(&self) -> VulkanResult<()>;
}
