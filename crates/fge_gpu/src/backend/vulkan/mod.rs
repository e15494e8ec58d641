//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules, tied
//! together by the [`Context`]. Every native call goes through the [`GpuDevice`] seam.

/// Error types
pub mod error;

/// Device abstraction used by every resource wrapper
pub mod device;

/// Vulkan initialization types (instance, physical device, production device)
pub mod initialization;

/// Vulkan resource management (buffers, textures, descriptors, garbage collection)
pub mod resources;

/// Command recording
pub mod rendering;

/// Frame synchronization state
pub mod state;

/// Frame-level command submission and resource ownership
pub mod context;

#[cfg(test)]
pub(crate) mod test_device;

/// Number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

pub use error::{VulkanError, VulkanResult};
pub use device::{
    BufferAllocation, DescriptorWrite, GpuDevice, ImageAllocation, LayoutBinding, MemoryKey,
    MemoryLocation, QueueInfo, Queues,
};
pub use context::{Context, FrameSubmission, RenderTargetId};

// Re-export initialization types
pub use initialization::{AshDevice, PhysicalDeviceInfo, VulkanInstance};

// Re-export resource types
pub use resources::buffer::{BufferKind, GrowableBuffer};
pub use resources::descriptor_pool::{DescriptorPool, DescriptorSet, DescriptorSetWriter};
pub use resources::garbage::{Garbage, GarbageCollector, GarbageKind};
pub use resources::global_transform::GlobalTransform;
pub use resources::image::TextureImage;
pub use resources::layout_cache::{
    DescriptorSetLayoutBuilder, PipelineLayouts, ShaderBinding, ShaderKey, ShaderLayoutInfo,
};

// Re-export rendering types
pub use rendering::command_buffer::{
    CommandBuffer, CommandPool, QueueFlags, RecordingState, RenderScope, SubmitType,
};

// Re-export state types
pub use state::sync::{Fence, FrameSync, Semaphore};
