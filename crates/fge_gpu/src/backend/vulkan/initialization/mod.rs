//! Vulkan initialization: instance, physical device selection and the production device

pub mod instance;
pub mod ash_device;

pub use ash_device::AshDevice;
pub use instance::{PhysicalDeviceInfo, VulkanInstance};
