//! Vulkan instance and physical device selection
//!
//! The core never presents, so the instance is created without surface extensions.
//! Presentation, when a renderer needs it, is layered on top by the caller.

use std::ffi::{CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};

use crate::backend::vulkan::{VulkanError, VulkanResult};

const ENGINE_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"FGE\0") };
const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, optionally with validation layers
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = CString::new(app_name).map_err(|_| {
            VulkanError::InitializationFailed("Application name contains a NUL byte".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Vec::new();
        let mut layers = Vec::new();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let debug = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    log::warn!("Validation requested but the debug messenger failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { entry, instance, debug })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = &self.debug {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and queue family layout
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Index of the graphics queue family (also compute capable)
    pub graphics_family: u32,
    /// Compute family distinct from the graphics family, if any
    pub compute_family: Option<u32>,
    /// Transfer-only family, if any
    pub transfer_family: Option<u32>,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device, preferring discrete GPUs
    pub fn select_suitable_device(instance: &Instance) -> VulkanResult<Self> {
        let devices = unsafe {
            instance.enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| Self::evaluate_device(instance, device).ok())
            .collect();
        candidates.sort_by_key(|info| {
            info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
        });

        let selected = candidates.into_iter().next().ok_or_else(|| {
            VulkanError::InitializationFailed("No suitable GPU found".to_string())
        })?;
        log::info!("Selected GPU: {}", selected.name());
        Ok(selected)
    }

    /// Device name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_2 {
            return Err(VulkanError::InitializationFailed(
                "Vulkan 1.2 is required".to_string(),
            ));
        }
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(device)
        };
        let (graphics_family, compute_family, transfer_family) =
            select_queue_families(&queue_families)?;

        Ok(Self { device, properties, graphics_family, compute_family, transfer_family })
    }
}

/// Pick graphics, dedicated compute and dedicated transfer families
///
/// Graphics must also support compute. Compute prefers a family without graphics;
/// transfer prefers a family with neither graphics nor compute.
pub(crate) fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
) -> VulkanResult<(u32, Option<u32>, Option<u32>)> {
    let find = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .position(|family| family.queue_count > 0 && pred(family.queue_flags))
            .and_then(|index| u32::try_from(index).ok())
    };

    let graphics = find(&|flags| flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
        .ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;
    let compute = find(&|flags| {
        flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let transfer = find(&|flags| {
        flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    });

    Ok((graphics, compute, transfer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties { queue_flags: flags, queue_count: 1, ..Default::default() }
    }

    #[test]
    fn test_dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_families(&families).unwrap(), (0, Some(1), Some(2)));
    }

    #[test]
    fn test_single_family_device() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        assert_eq!(select_queue_families(&families).unwrap(), (0, None, None));
    }

    #[test]
    fn test_missing_graphics_family() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            select_queue_families(&families),
            Err(VulkanError::InitializationFailed(_))
        ));
    }
}
