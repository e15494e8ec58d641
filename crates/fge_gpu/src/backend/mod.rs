//! Rendering backends
//!
//! Only Vulkan is implemented; the device seam in [`vulkan::GpuDevice`] keeps the
//! lifecycle and submission logic independent of the native API calls.

/// Vulkan backend implementation
pub mod vulkan;
