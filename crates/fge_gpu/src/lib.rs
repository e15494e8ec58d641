//! # FGE GPU Core
//!
//! GPU resource lifecycle and command submission core for a Vulkan renderer.
//!
//! ## Features
//!
//! - **Deferred Destruction**: frame-indexed garbage collection of native handles
//! - **Growable Descriptor Pools**: transparent growth on exhaustion or fragmentation
//! - **Command Submission**: direct (blocking) and indirect (per-frame batched) execution
//! - **Growable Buffers**: vertex/index/uniform/storage buffers that double on overflow
//!
//! ## Frame Loop
//!
//! ```rust,no_run
//! use fge_gpu::prelude::*;
//!
//! fn frame(ctx: &Context, main_commands: &CommandBuffer) -> VulkanResult<()> {
//!     let Some(_slot) = ctx.prepare_frame(1_000_000_000)? else {
//!         return Ok(()); // GPU still busy, try again next tick
//!     };
//!     // ... record uploads and draws ...
//!     let submission = ctx.submit()?;
//!     ctx.submit_graphics(main_commands, &submission, &[], &[])?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod foundation;
pub mod config;
pub mod backend;

/// Common imports for renderer code built on this crate
pub mod prelude {
    pub use crate::{
        backend::vulkan::{
            BufferKind, CommandBuffer, Context, DescriptorPool, DescriptorSet, Garbage,
            GarbageCollector, GlobalTransform, GpuDevice, GrowableBuffer, MemoryLocation,
            QueueFlags, RenderScope, SubmitType, TextureImage, VulkanError, VulkanResult,
            MAX_FRAMES_IN_FLIGHT,
        },
        config::{Config, ConfigError, ContextConfig},
    };
}
