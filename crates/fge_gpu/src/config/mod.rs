//! Configuration system
//!
//! Runtime tuning for the GPU core. The number of frames in flight is a
//! compile-time constant ([`crate::backend::vulkan::MAX_FRAMES_IN_FLIGHT`]) because it
//! sizes every per-frame array; everything else lives here and can be loaded from
//! TOML or RON files.

use ash::vk;
pub use serde::{Serialize, Deserialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(ConfigError::Io)?;

        // Try different formats
        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of its legal range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// Descriptor types a pool size template can reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// `VK_DESCRIPTOR_TYPE_SAMPLER`
    Sampler,
    /// `VK_DESCRIPTOR_TYPE_COMBINED_IMAGE_SAMPLER`
    CombinedImageSampler,
    /// `VK_DESCRIPTOR_TYPE_SAMPLED_IMAGE`
    SampledImage,
    /// `VK_DESCRIPTOR_TYPE_STORAGE_IMAGE`
    StorageImage,
    /// `VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER`
    UniformBuffer,
    /// `VK_DESCRIPTOR_TYPE_STORAGE_BUFFER`
    StorageBuffer,
    /// `VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER_DYNAMIC`
    UniformBufferDynamic,
    /// `VK_DESCRIPTOR_TYPE_STORAGE_BUFFER_DYNAMIC`
    StorageBufferDynamic,
}

impl DescriptorKind {
    /// Native descriptor type
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        }
    }
}

/// One entry of a descriptor pool size template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSize {
    /// Descriptor type reserved
    pub kind: DescriptorKind,
    /// Descriptors of this type reserved per set
    pub per_set: u32,
}

impl PoolSize {
    /// Create a pool size entry
    pub const fn new(kind: DescriptorKind, per_set: u32) -> Self {
        Self { kind, per_set }
    }
}

/// Size template and growth policy for one logical descriptor pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPoolConfig {
    /// Sets each backing pool can hold
    pub max_sets: u32,
    /// Descriptors reserved per set, by type
    pub sizes: Vec<PoolSize>,
    /// Whether sets are returned to the pool individually
    pub individually_free: bool,
}

impl DescriptorPoolConfig {
    /// Native pool sizes for one backing pool (`per_set * max_sets` each)
    pub fn vk_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.sizes
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: size.kind.to_vk(),
                descriptor_count: size.per_set.saturating_mul(self.max_sets),
            })
            .collect()
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.max_sets == 0 {
            return Err(ConfigError::Invalid { field, reason: "max_sets must be at least 1".to_string() });
        }
        if self.sizes.is_empty() {
            return Err(ConfigError::Invalid { field, reason: "size template is empty".to_string() });
        }
        Ok(())
    }
}

/// # GPU Context Configuration
///
/// Application metadata plus the sizing of every pool the [`crate::backend::vulkan::Context`]
/// owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// General purpose descriptor sets (uniform/storage buffers, samplers)
    pub multi_use_pool: DescriptorPoolConfig,
    /// Texture-only descriptor sets
    pub texture_pool: DescriptorPoolConfig,
    /// Global transform descriptor sets
    pub transform_pool: DescriptorPoolConfig,
    /// Transform records reserved before the first frame
    pub initial_global_transforms: usize,
    /// Upper bound of the variable-count texture array in texture layouts
    pub max_texture_array_size: u32,
    /// How long `Context::prepare_next_frame` waits for a frame slot, in nanoseconds
    pub frame_timeout_ns: u64,
}

impl ContextConfig {
    /// Create a new configuration with default pool sizes
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Set validation layer usage explicitly
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the multi-use pool configuration
    pub fn with_multi_use_pool(mut self, pool: DescriptorPoolConfig) -> Self {
        self.multi_use_pool = pool;
        self
    }

    /// Set the texture pool configuration
    pub fn with_texture_pool(mut self, pool: DescriptorPoolConfig) -> Self {
        self.texture_pool = pool;
        self
    }

    /// Set the transform pool configuration
    pub fn with_transform_pool(mut self, pool: DescriptorPoolConfig) -> Self {
        self.transform_pool = pool;
        self
    }

    /// Set the number of transform records reserved up front
    pub fn with_initial_global_transforms(mut self, count: usize) -> Self {
        self.initial_global_transforms = count;
        self
    }

    /// Set the frame slot wait used by `Context::prepare_next_frame`
    pub fn with_frame_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.frame_timeout_ns = timeout_ns;
        self
    }

    /// Whether validation layers should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Check pool templates and limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.multi_use_pool.validate("multi_use_pool")?;
        self.texture_pool.validate("texture_pool")?;
        self.transform_pool.validate("transform_pool")?;
        if self.max_texture_array_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_texture_array_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "FGE Application".to_string(),
            enable_validation: None,
            multi_use_pool: DescriptorPoolConfig {
                max_sets: 64,
                sizes: vec![
                    PoolSize::new(DescriptorKind::UniformBuffer, 4),
                    PoolSize::new(DescriptorKind::StorageBuffer, 4),
                    PoolSize::new(DescriptorKind::CombinedImageSampler, 4),
                ],
                individually_free: true,
            },
            texture_pool: DescriptorPoolConfig {
                max_sets: 128,
                sizes: vec![PoolSize::new(DescriptorKind::CombinedImageSampler, 1)],
                individually_free: true,
            },
            transform_pool: DescriptorPoolConfig {
                max_sets: 4,
                sizes: vec![PoolSize::new(DescriptorKind::StorageBuffer, 1)],
                individually_free: true,
            },
            initial_global_transforms: 64,
            max_texture_array_size: 256,
            frame_timeout_ns: 1_000_000_000,
        }
    }
}

impl Config for ContextConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let parsed: ContextConfig = toml::from_str(
            r#"
            application_name = "demo"
            initial_global_transforms = 8

            [texture_pool]
            max_sets = 16
            individually_free = false
            sizes = [{ kind = "CombinedImageSampler", per_set = 2 }]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.application_name, "demo");
        assert_eq!(parsed.initial_global_transforms, 8);
        assert_eq!(parsed.texture_pool.max_sets, 16);
        assert!(!parsed.texture_pool.individually_free);
        assert_eq!(parsed.transform_pool, ContextConfig::default().transform_pool);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_vk_sizes_scale_with_max_sets() {
        let config = ContextConfig::default();
        let sizes = config.texture_pool.vk_sizes();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[0].descriptor_count, 128);
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let config = ContextConfig::new("bad").with_transform_pool(DescriptorPoolConfig {
            max_sets: 0,
            sizes: Vec::new(),
            individually_free: true,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "transform_pool", .. })
        ));
    }

    #[test]
    fn test_unsupported_extension() {
        let result = ContextConfig::default().save_to_file("settings.ini");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
