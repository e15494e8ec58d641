//! Descriptor set and pipeline layout caches
//!
//! Layouts are derived from the binding metadata of the shader stages a pipeline uses
//! and cached by the `(vertex, geometry, fragment)` module triple, so pipelines sharing
//! shaders share layouts.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::device::{GpuDevice, LayoutBinding};
use crate::backend::vulkan::{VulkanError, VulkanResult};

/// Cache key: the shader modules of a pipeline (null when a stage is unused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderKey {
    /// Vertex stage
    pub vertex: vk::ShaderModule,
    /// Geometry stage
    pub geometry: vk::ShaderModule,
    /// Fragment stage
    pub fragment: vk::ShaderModule,
}

impl ShaderKey {
    /// Key for a set of stages
    pub fn from_stages(shaders: &[ShaderLayoutInfo]) -> Self {
        let mut key = Self::default();
        for shader in shaders {
            if shader.stage.contains(vk::ShaderStageFlags::VERTEX) {
                key.vertex = shader.module;
            } else if shader.stage.contains(vk::ShaderStageFlags::GEOMETRY) {
                key.geometry = shader.module;
            } else if shader.stage.contains(vk::ShaderStageFlags::FRAGMENT) {
                key.fragment = shader.module;
            }
        }
        key
    }
}

/// A resource binding a shader declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    /// Descriptor set index
    pub set: u32,
    /// Binding within the set
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array size
    pub count: u32,
}

/// Reflection output for one shader stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLayoutInfo {
    /// Compiled module
    pub module: vk::ShaderModule,
    /// Stage the module runs in
    pub stage: vk::ShaderStageFlags,
    /// Declared bindings
    pub bindings: Vec<ShaderBinding>,
    /// Push constant block size in bytes (0 for none)
    pub push_constant_size: u32,
}

/// Set layouts and the pipeline layout built from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayouts {
    /// Pipeline layout
    pub pipeline_layout: vk::PipelineLayout,
    /// One layout per set index, gaps filled with empty layouts
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

/// Descriptor set layout builder for creating reusable layouts
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
    variable_count: bool,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self { bindings: Vec::new(), variable_count: false }
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a combined image sampler array binding
    pub fn add_combined_image_samplers(
        self,
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.add(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count, stages)
    }

    /// Make the last binding a variable-count array
    pub fn variable_count(mut self) -> Self {
        self.variable_count = true;
        self
    }

    fn add(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(LayoutBinding { binding, descriptor_type, count, stages });
        self
    }

    /// Build the descriptor set layout
    pub fn build(&self, device: &dyn GpuDevice) -> VulkanResult<vk::DescriptorSetLayout> {
        device.create_descriptor_set_layout(&self.bindings, self.variable_count)
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Layout caches owned by the context
pub(crate) struct LayoutCache {
    device: Rc<dyn GpuDevice>,
    layouts: HashMap<ShaderKey, PipelineLayouts>,
    texture_layouts: HashMap<ShaderKey, vk::DescriptorSetLayout>,
}

impl LayoutCache {
    pub fn new(device: Rc<dyn GpuDevice>) -> Self {
        Self { device, layouts: HashMap::new(), texture_layouts: HashMap::new() }
    }

    /// Set layouts and pipeline layout for a shader combination
    pub fn request_layouts(&mut self, shaders: &[ShaderLayoutInfo]) -> VulkanResult<PipelineLayouts> {
        let key = ShaderKey::from_stages(shaders);
        if let Some(layouts) = self.layouts.get(&key) {
            return Ok(layouts.clone());
        }

        let sets = merge_bindings(shaders)?;
        let set_count = sets.keys().next_back().map_or(0, |last| last + 1);
        let mut set_layouts = Vec::with_capacity(set_count as usize);
        for index in 0..set_count {
            let bindings: Vec<LayoutBinding> =
                sets.get(&index).map(|set| set.values().copied().collect()).unwrap_or_default();
            match self.device.create_descriptor_set_layout(&bindings, false) {
                Ok(layout) => set_layouts.push(layout),
                Err(err) => {
                    self.destroy_set_layouts(&set_layouts);
                    return Err(err);
                }
            }
        }

        let push_constants = push_constant_ranges(shaders);
        let pipeline_layout = match self.device.create_pipeline_layout(&set_layouts, &push_constants) {
            Ok(layout) => layout,
            Err(err) => {
                self.destroy_set_layouts(&set_layouts);
                return Err(err);
            }
        };

        log::debug!(
            "Created pipeline layout {:?} with {} set layouts for {:?}",
            pipeline_layout,
            set_layouts.len(),
            key
        );
        let layouts = PipelineLayouts { pipeline_layout, set_layouts };
        self.layouts.insert(key, layouts.clone());
        Ok(layouts)
    }

    /// Variable-count texture array layout for a shader combination
    pub fn request_texture_layout(
        &mut self,
        shaders: &[ShaderLayoutInfo],
        max_textures: u32,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let key = ShaderKey::from_stages(shaders);
        if let Some(layout) = self.texture_layouts.get(&key) {
            return Ok(*layout);
        }

        let stages = shaders
            .iter()
            .filter(|shader| {
                shader
                    .bindings
                    .iter()
                    .any(|b| b.descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            })
            .fold(vk::ShaderStageFlags::empty(), |acc, shader| acc | shader.stage);
        let stages = if stages.is_empty() { vk::ShaderStageFlags::FRAGMENT } else { stages };

        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_samplers(0, max_textures, stages)
            .variable_count()
            .build(self.device.as_ref())?;
        self.texture_layouts.insert(key, layout);
        Ok(layout)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.layouts.len() + self.texture_layouts.len()
    }

    fn destroy_set_layouts(&self, layouts: &[vk::DescriptorSetLayout]) {
        for layout in layouts {
            self.device.destroy_descriptor_set_layout(*layout);
        }
    }

    /// Destroy every cached layout; only valid once the device is idle
    pub fn destroy(&mut self) {
        for (_, layouts) in self.layouts.drain() {
            self.device.destroy_pipeline_layout(layouts.pipeline_layout);
            for layout in layouts.set_layouts {
                self.device.destroy_descriptor_set_layout(layout);
            }
        }
        for (_, layout) in self.texture_layouts.drain() {
            self.device.destroy_descriptor_set_layout(layout);
        }
    }
}

fn merge_bindings(
    shaders: &[ShaderLayoutInfo],
) -> VulkanResult<BTreeMap<u32, BTreeMap<u32, LayoutBinding>>> {
    let mut sets: BTreeMap<u32, BTreeMap<u32, LayoutBinding>> = BTreeMap::new();
    for shader in shaders {
        for binding in &shader.bindings {
            let slot = sets.entry(binding.set).or_default();
            match slot.get_mut(&binding.binding) {
                Some(existing) if existing.descriptor_type != binding.descriptor_type => {
                    return Err(VulkanError::invalid(format!(
                        "set {} binding {} declared as both {:?} and {:?}",
                        binding.set, binding.binding, existing.descriptor_type, binding.descriptor_type
                    )));
                }
                Some(existing) => {
                    existing.stages |= shader.stage;
                    existing.count = existing.count.max(binding.count);
                }
                None => {
                    slot.insert(
                        binding.binding,
                        LayoutBinding {
                            binding: binding.binding,
                            descriptor_type: binding.descriptor_type,
                            count: binding.count,
                            stages: shader.stage,
                        },
                    );
                }
            }
        }
    }
    Ok(sets)
}

fn push_constant_ranges(shaders: &[ShaderLayoutInfo]) -> Vec<vk::PushConstantRange> {
    let (stages, size) = shaders
        .iter()
        .filter(|shader| shader.push_constant_size > 0)
        .fold((vk::ShaderStageFlags::empty(), 0), |(stages, size), shader| {
            (stages | shader.stage, size.max(shader.push_constant_size))
        });
    if size == 0 {
        Vec::new()
    } else {
        vec![vk::PushConstantRange { stage_flags: stages, offset: 0, size }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vulkan::test_device::{Destroyed, RecordingDevice};

    fn stage(
        recorder: &RecordingDevice,
        stage: vk::ShaderStageFlags,
        bindings: Vec<ShaderBinding>,
    ) -> ShaderLayoutInfo {
        ShaderLayoutInfo { module: recorder.handle(), stage, bindings, push_constant_size: 0 }
    }

    fn binding(set: u32, binding: u32, descriptor_type: vk::DescriptorType) -> ShaderBinding {
        ShaderBinding { set, binding, descriptor_type, count: 1 }
    }

    #[test]
    fn test_layouts_are_cached_by_module_triple() {
        let recorder = Rc::new(RecordingDevice::new());
        let mut cache = LayoutCache::new(recorder.clone());
        let shaders = vec![
            stage(&recorder, vk::ShaderStageFlags::VERTEX, vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER)]),
            stage(
                &recorder,
                vk::ShaderStageFlags::FRAGMENT,
                vec![
                    binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER),
                    binding(2, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
                ],
            ),
        ];

        let first = cache.request_layouts(&shaders).unwrap();
        assert_eq!(first.set_layouts.len(), 3);
        assert_eq!(recorder.set_layouts_created(), 3);

        let second = cache.request_layouts(&shaders).unwrap();
        assert_eq!(first, second);
        assert_eq!(recorder.set_layouts_created(), 3);
        assert_eq!(recorder.pipeline_layouts_created(), 1);
    }

    #[test]
    fn test_conflicting_binding_types_rejected() {
        let recorder = Rc::new(RecordingDevice::new());
        let mut cache = LayoutCache::new(recorder.clone());
        let shaders = vec![
            stage(&recorder, vk::ShaderStageFlags::VERTEX, vec![binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER)]),
            stage(&recorder, vk::ShaderStageFlags::FRAGMENT, vec![binding(0, 1, vk::DescriptorType::STORAGE_BUFFER)]),
        ];
        assert!(matches!(
            cache.request_layouts(&shaders),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert_eq!(recorder.set_layouts_created(), 0);
    }

    #[test]
    fn test_merged_stages_and_push_constants() {
        let recorder = RecordingDevice::new();
        let mut vertex = stage(&recorder, vk::ShaderStageFlags::VERTEX, vec![binding(0, 0, vk::DescriptorType::STORAGE_BUFFER)]);
        vertex.push_constant_size = 64;
        let mut fragment = stage(&recorder, vk::ShaderStageFlags::FRAGMENT, vec![binding(0, 0, vk::DescriptorType::STORAGE_BUFFER)]);
        fragment.push_constant_size = 16;

        let sets = merge_bindings(&[vertex.clone(), fragment.clone()]).unwrap();
        let merged = sets[&0][&0];
        assert_eq!(merged.stages, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);

        let ranges = push_constant_ranges(&[vertex, fragment]);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].size, 64);
    }

    #[test]
    fn test_texture_layout_cache_and_destroy() {
        let recorder = Rc::new(RecordingDevice::new());
        let mut cache = LayoutCache::new(recorder.clone());
        let shaders = vec![stage(
            &recorder,
            vk::ShaderStageFlags::FRAGMENT,
            vec![binding(1, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)],
        )];

        let layout = cache.request_texture_layout(&shaders, 128).unwrap();
        assert_eq!(cache.request_texture_layout(&shaders, 128).unwrap(), layout);
        assert_eq!(cache.len(), 1);

        cache.destroy();
        assert_eq!(recorder.destroy_count(Destroyed::DescriptorSetLayout(layout)), 1);
        assert_eq!(cache.len(), 0);
    }
}
