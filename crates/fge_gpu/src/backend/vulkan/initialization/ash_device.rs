//! Production device backed by ash and the Vulkan Memory Allocator
//!
//! Owns the instance, the logical device, the queues and the allocator. Buffer and
//! image memory is tracked in a slot map so the rest of the core can refer to it by
//! [`MemoryKey`] without holding allocator types.

use std::cell::RefCell;
use std::collections::HashSet;
use std::mem::ManuallyDrop;
use std::slice;

use ash::vk;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::backend::vulkan::device::{
    BufferAllocation, BufferRequest, DescriptorResource, DescriptorWrite, DeviceCommand, GpuDevice,
    ImageAllocation, ImageRequest, LayoutBinding, MemoryKey, QueueInfo, Queues, SubmitBatch,
};
use crate::backend::vulkan::initialization::instance::{PhysicalDeviceInfo, VulkanInstance};
use crate::backend::vulkan::{VulkanError, VulkanResult};
use crate::config::ContextConfig;

struct MemoryRecord {
    allocation: vk_mem::Allocation,
    size: usize,
    host_visible: bool,
}

/// [`GpuDevice`] implementation on top of a real Vulkan device
pub struct AshDevice {
    allocator: ManuallyDrop<vk_mem::Allocator>,
    memory: RefCell<SlotMap<MemoryKey, MemoryRecord>>,
    device: ash::Device,
    queues: Queues,
    physical_device: PhysicalDeviceInfo,
    // dropped last
    instance: VulkanInstance,
}

impl AshDevice {
    /// Create the instance, pick a GPU and open a logical device on it
    pub fn new(config: &ContextConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(&config.application_name, config.validation_enabled())?;
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance)?;

        let unique_families: HashSet<u32> = [
            Some(physical_device.graphics_family),
            physical_device.compute_family,
            physical_device.transfer_family,
        ]
        .into_iter()
        .flatten()
        .collect();

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut supported_indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        let mut supported = vk::PhysicalDeviceFeatures2::builder().push_next(&mut supported_indexing);
        unsafe {
            instance
                .instance
                .get_physical_device_features2(physical_device.device, &mut supported);
        }
        let base_features = supported.features;

        // Variable-count texture arrays need these; everything else stays off
        let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::builder()
            .runtime_descriptor_array(supported_indexing.runtime_descriptor_array == vk::TRUE)
            .descriptor_binding_variable_descriptor_count(
                supported_indexing.descriptor_binding_variable_descriptor_count == vk::TRUE,
            )
            .descriptor_binding_partially_bound(
                supported_indexing.descriptor_binding_partially_bound == vk::TRUE,
            )
            .shader_sampled_image_array_non_uniform_indexing(
                supported_indexing.shader_sampled_image_array_non_uniform_indexing == vk::TRUE,
            );
        let enabled = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(base_features.sampler_anisotropy == vk::TRUE)
            .build();
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .features(enabled)
            .push_next(&mut indexing);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let queue = |family: u32| QueueInfo {
            queue: unsafe { device.get_device_queue(family, 0) },
            family,
        };
        let queues = Queues {
            graphics: queue(physical_device.graphics_family),
            compute: physical_device.compute_family.map(queue),
            transfer: physical_device.transfer_family.map(queue),
            present: None,
        };

        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance.instance,
            &device,
            physical_device.device,
        ))
        .map_err(VulkanError::Api)?;

        log::info!(
            "Vulkan device ready on {} (compute queue: {}, transfer queue: {})",
            physical_device.name(),
            queues.compute.is_some(),
            queues.transfer.is_some()
        );

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            memory: RefCell::new(SlotMap::with_key()),
            device,
            queues,
            physical_device,
            instance,
        })
    }

    /// The raw logical device, for pipeline and render pass creation
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// The Vulkan instance
    pub fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    /// The selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    fn allocation_error(result: vk::Result, requested: usize) -> VulkanError {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                VulkanError::OutOfMemory { requested }
            }
            vk::Result::ERROR_FEATURE_NOT_PRESENT => VulkanError::NoSuitableMemoryType,
            other => VulkanError::Api(other),
        }
    }

    fn with_mapped(
        &self,
        memory: MemoryKey,
        offset: usize,
        len: usize,
        f: impl FnOnce(*mut u8),
    ) -> VulkanResult<()> {
        let mut records = self.memory.borrow_mut();
        let record = records
            .get_mut(memory)
            .ok_or(VulkanError::ResourceNotFound { id: slotmap::Key::data(&memory).as_ffi() })?;
        if !record.host_visible {
            return Err(VulkanError::invalid("memory is not host visible"));
        }
        if offset + len > record.size {
            return Err(VulkanError::invalid(format!(
                "access of {} bytes at {} exceeds allocation of {}",
                len, offset, record.size
            )));
        }
        unsafe {
            let mapped = self.allocator.map_memory(&mut record.allocation).map_err(VulkanError::Api)?;
            f(mapped.add(offset));
            let flushed = self.allocator.flush_allocation(&record.allocation, offset, len);
            self.allocator.unmap_memory(&mut record.allocation);
            flushed.map_err(VulkanError::Api)
        }
    }

    fn release(&self, memory: MemoryKey) -> Option<vk_mem::Allocation> {
        self.memory.borrow_mut().remove(memory).map(|record| record.allocation)
    }
}

impl GpuDevice for AshDevice {
    fn queues(&self) -> Queues {
        self.queues
    }

    fn create_buffer(&self, request: &BufferRequest) -> VulkanResult<BufferAllocation> {
        let requested = usize::try_from(request.size).unwrap_or(usize::MAX);
        let host_visible = request.location.is_host_visible();
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if host_visible {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::AutoPreferDevice
            },
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(&buffer_info, &create_info)
                .map_err(|err| Self::allocation_error(err, requested))?
        };
        let memory = self.memory.borrow_mut().insert(MemoryRecord {
            allocation,
            size: requested,
            host_visible,
        });

        Ok(BufferAllocation { buffer, memory, size: request.size, location: request.location })
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) {
        match self.release(allocation.memory) {
            Some(mut memory) => unsafe { self.allocator.destroy_buffer(allocation.buffer, &mut memory) },
            None => log::warn!("Buffer {:?} destroyed twice", allocation.buffer),
        }
    }

    fn write_memory(&self, memory: MemoryKey, offset: usize, data: &[u8]) -> VulkanResult<()> {
        self.with_mapped(memory, offset, data.len(), |dst| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        })
    }

    fn read_memory(&self, memory: MemoryKey, offset: usize, out: &mut [u8]) -> VulkanResult<()> {
        let len = out.len();
        self.with_mapped(memory, offset, len, |src| unsafe {
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        })
    }

    fn create_image(&self, request: &ImageRequest) -> VulkanResult<ImageAllocation> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: request.extent.width,
                height: request.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(request.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(request.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let texels = request.extent.width as usize * request.extent.height as usize;

        let (image, mut allocation) = unsafe {
            self.allocator
                .create_image(&image_info, &create_info)
                .map_err(|err| Self::allocation_error(err, texels * 4))?
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(request.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: request.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe { self.allocator.destroy_image(image, &mut allocation) };
                return Err(VulkanError::Api(err));
            }
        };

        let memory = self.memory.borrow_mut().insert(MemoryRecord {
            allocation,
            size: texels * 4,
            host_visible: false,
        });

        Ok(ImageAllocation { image, view, memory, extent: request.extent, format: request.format })
    }

    fn destroy_image(&self, allocation: ImageAllocation) {
        unsafe { self.device.destroy_image_view(allocation.view, None) };
        match self.release(allocation.memory) {
            Some(mut memory) => unsafe { self.allocator.destroy_image(allocation.image, &mut memory) },
            None => log::warn!("Image {:?} destroyed twice", allocation.image),
        }
    }

    fn create_sampler(
        &self,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
    ) -> VulkanResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        unsafe {
            self.device.create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        individually_free: bool,
    ) -> VulkanResult<vk::DescriptorPool> {
        let flags = if individually_free {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .pool_sizes(sizes)
            .max_sets(max_sets);

        unsafe {
            self.device.create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: u32,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let counts = [variable_count];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder().descriptor_counts(&counts);
        let mut alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        if variable_count > 0 {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(err) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            log::warn!("Failed to free descriptor set {:?}: {:?}", set, err);
        }
    }

    fn write_descriptors(&self, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Buffer { buffer, offset, range } => {
                    vk::DescriptorBufferInfo { buffer, offset, range }
                }
                DescriptorResource::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Image { view, sampler, layout } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let native: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(index, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match write.resource {
                    DescriptorResource::Buffer { .. } => {
                        builder.buffer_info(slice::from_ref(&buffer_infos[index])).build()
                    }
                    DescriptorResource::Image { .. } => {
                        builder.image_info(slice::from_ref(&image_infos[index])).build()
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&native, &[]) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
        variable_count: bool,
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let native: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect();

        let mut flags = vec![vk::DescriptorBindingFlags::empty(); native.len()];
        if variable_count {
            if let Some(last) = flags.last_mut() {
                *last = vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                    | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
            }
        }
        let mut binding_flags =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&native);
        if variable_count {
            create_info = create_info.push_next(&mut binding_flags);
        }

        unsafe {
            self.device.create_descriptor_set_layout(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);

        unsafe {
            self.device.create_pipeline_layout(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_command_pool(&self, queue_family: u32) -> VulkanResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.device.create_command_pool(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            self.device.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        buffers
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, one_time: bool) -> VulkanResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);

        unsafe {
            self.device.begin_command_buffer(buffer, &begin_info)
                .map_err(VulkanError::Api)
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device.end_command_buffer(buffer)
                .map_err(VulkanError::Api)
        }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    fn record(&self, buffer: vk::CommandBuffer, command: &DeviceCommand) {
        unsafe {
            match command {
                DeviceCommand::CopyBuffer { src, dst, regions } => {
                    self.device.cmd_copy_buffer(buffer, *src, *dst, regions);
                }
                DeviceCommand::CopyBufferToImage { buffer: src, image, regions } => {
                    self.device.cmd_copy_buffer_to_image(
                        buffer,
                        *src,
                        *image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        regions,
                    );
                }
                DeviceCommand::Transition(transition) => {
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .old_layout(transition.old_layout)
                        .new_layout(transition.new_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(transition.image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: transition.aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .src_access_mask(transition.src_access)
                        .dst_access_mask(transition.dst_access)
                        .build();
                    self.device.cmd_pipeline_barrier(
                        buffer,
                        transition.src_stage,
                        transition.dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
                DeviceCommand::BlitImage { src, dst, regions, filter } => {
                    self.device.cmd_blit_image(
                        buffer,
                        *src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        regions,
                        *filter,
                    );
                }
                DeviceCommand::BeginRenderPass { render_pass, framebuffer, area, clear_values } => {
                    let begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(*area)
                        .clear_values(clear_values);
                    self.device.cmd_begin_render_pass(
                        buffer,
                        &begin_info,
                        vk::SubpassContents::INLINE,
                    );
                }
                DeviceCommand::EndRenderPass => self.device.cmd_end_render_pass(buffer),
            }
        }
    }

    fn create_semaphore(&self) -> VulkanResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe {
            self.device.create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        unsafe {
            self.device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VulkanResult<bool> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(VulkanError::Api(err)),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VulkanResult<()> {
        unsafe {
            self.device.reset_fences(fences)
                .map_err(VulkanError::Api)
        }
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> VulkanResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores)
            .build();

        unsafe {
            self.device.queue_submit(queue, &[submit_info], batch.fence)
                .map_err(VulkanError::Api)
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VulkanResult<()> {
        unsafe {
            self.device.queue_wait_idle(queue)
                .map_err(VulkanError::Api)
        }
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device.device_wait_idle()
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let leaked = self.memory.get_mut().len();
            if leaked > 0 {
                log::warn!("{} allocations still alive at device teardown", leaked);
            }
            self.memory.get_mut().clear();
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
