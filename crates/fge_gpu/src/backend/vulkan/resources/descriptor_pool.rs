//! Self-growing descriptor pools
//!
//! A [`DescriptorPool`] is an ordered list of fixed-capacity native pools created from
//! one size template. Allocation walks the backing pools in creation order and appends a
//! new one when every pool is full or fragmented. Each [`DescriptorSet`] remembers the
//! exact backing pool it came from and returns itself there on drop.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::device::{DescriptorResource, DescriptorWrite, GpuDevice};
use crate::backend::vulkan::resources::garbage::{Garbage, GarbageCollector, GarbageKind};
use crate::backend::vulkan::{VulkanError, VulkanResult};
use crate::config::DescriptorPoolConfig;

struct BackingPool {
    handle: vk::DescriptorPool,
    count: u32,
}

#[derive(Default)]
struct PoolState {
    backing: Vec<BackingPool>,
    template: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    is_unique: bool,
    individually_free: bool,
    generation: u64,
    destroyed: bool,
}

struct PoolShared {
    device: Rc<dyn GpuDevice>,
    gc: Rc<GarbageCollector>,
    state: RefCell<PoolState>,
}

enum Attempt {
    Allocated(vk::DescriptorSet, vk::DescriptorPool),
    Exhausted,
    Failed(vk::Result),
}

impl PoolShared {
    fn add_backing_pool(&self, state: &mut PoolState) -> VulkanResult<vk::DescriptorPool> {
        let handle = self.device.create_descriptor_pool(
            &state.template,
            state.max_sets,
            state.individually_free,
        )?;
        state.backing.push(BackingPool { handle, count: 0 });
        log::debug!(
            "Created descriptor pool {:?} ({} backing pools, {} sets each)",
            handle,
            state.backing.len(),
            state.max_sets
        );
        Ok(handle)
    }

    fn try_pools(
        &self,
        state: &mut PoolState,
        first: usize,
        layout: vk::DescriptorSetLayout,
        variable_count: u32,
    ) -> Attempt {
        let max_sets = state.max_sets;
        for pool in state.backing.iter_mut().skip(first) {
            if pool.count >= max_sets {
                continue;
            }
            match self.device.allocate_descriptor_set(pool.handle, layout, variable_count) {
                Ok(set) => {
                    pool.count += 1;
                    return Attempt::Allocated(set, pool.handle);
                }
                Err(vk::Result::ERROR_FRAGMENTED_POOL | vk::Result::ERROR_OUT_OF_POOL_MEMORY) => {}
                Err(err) => return Attempt::Failed(err),
            }
        }
        Attempt::Exhausted
    }

    fn release(&self, set: vk::DescriptorSet, backing: vk::DescriptorPool, generation: u64) {
        let defer = {
            let mut state = self.state.borrow_mut();
            if state.destroyed || generation != state.generation {
                log::trace!("Ignoring return of stale descriptor set {:?}", set);
                return;
            }
            let individually_free = state.individually_free;
            match state.backing.iter_mut().find(|pool| pool.handle == backing) {
                Some(pool) => {
                    pool.count = pool.count.saturating_sub(1);
                    individually_free
                }
                None => {
                    log::warn!("Descriptor set {:?} returned to unknown pool {:?}", set, backing);
                    true
                }
            }
        };

        if defer {
            self.gc.push(Garbage::new(
                self.device.clone(),
                GarbageKind::DescriptorSet { set, pool: backing },
            ));
        }
    }
}

/// Growable collection of native descriptor pools sharing one size template
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct DescriptorPool {
    shared: Rc<PoolShared>,
}

impl DescriptorPool {
    /// Create an empty pool; call [`DescriptorPool::create`] before allocating
    pub fn new(device: Rc<dyn GpuDevice>, gc: Rc<GarbageCollector>) -> Self {
        Self {
            shared: Rc::new(PoolShared {
                device,
                gc,
                state: RefCell::new(PoolState::default()),
            }),
        }
    }

    /// Create a pool from a configuration template
    pub fn from_config(
        device: Rc<dyn GpuDevice>,
        gc: Rc<GarbageCollector>,
        config: &DescriptorPoolConfig,
        is_unique: bool,
    ) -> VulkanResult<Self> {
        let pool = Self::new(device, gc);
        pool.create(&config.vk_sizes(), config.max_sets, is_unique, config.individually_free)?;
        Ok(pool)
    }

    /// Discard previous backing pools, store the template and create the first pool
    ///
    /// Sets still alive from before become inert.
    pub fn create(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets_per_pool: u32,
        is_unique: bool,
        individually_free: bool,
    ) -> VulkanResult<()> {
        if max_sets_per_pool == 0 {
            return Err(VulkanError::invalid("descriptor pool needs room for at least one set"));
        }
        self.destroy_backing();

        let mut state = self.shared.state.borrow_mut();
        state.template = sizes.to_vec();
        state.max_sets = max_sets_per_pool;
        state.is_unique = is_unique;
        state.individually_free = individually_free;
        state.destroyed = false;
        state.generation += 1;
        self.shared.add_backing_pool(&mut state)?;
        Ok(())
    }

    /// Allocate one set, growing the pool if needed
    ///
    /// Returns `None` when the pool is unique and full, or when the device reports an
    /// error other than exhaustion or fragmentation.
    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        variable_count: u32,
    ) -> Option<DescriptorSet> {
        let mut state = self.shared.state.borrow_mut();
        if state.destroyed || state.backing.is_empty() {
            log::warn!("Descriptor set requested from a pool that was never created");
            return None;
        }

        let mut attempt = self.shared.try_pools(&mut state, 0, layout, variable_count);
        if matches!(attempt, Attempt::Exhausted) {
            if state.is_unique {
                log::warn!("Unique descriptor pool exhausted ({} sets)", state.max_sets);
                return None;
            }
            if let Err(err) = self.shared.add_backing_pool(&mut state) {
                log::warn!("Failed to grow descriptor pool: {}", err);
                return None;
            }
            let newest = state.backing.len() - 1;
            attempt = self.shared.try_pools(&mut state, newest, layout, variable_count);
        }

        match attempt {
            Attempt::Allocated(set, backing) => Some(DescriptorSet {
                set,
                backing,
                generation: state.generation,
                pool: self.shared.clone(),
            }),
            Attempt::Exhausted => {
                log::warn!("Descriptor set allocation failed on a fresh pool");
                None
            }
            Attempt::Failed(err) => {
                log::warn!("Descriptor set allocation failed: {:?}", err);
                None
            }
        }
    }

    /// Return a set explicitly
    ///
    /// Freeing into a pool the set was not allocated from is a contract violation; the
    /// set still goes back to the pool it came from.
    pub fn free_descriptor_set(&self, set: DescriptorSet) -> VulkanResult<()> {
        if !Rc::ptr_eq(&self.shared, &set.pool) {
            return Err(VulkanError::invalid(format!(
                "descriptor set {:?} freed into a pool it was not allocated from",
                set.set
            )));
        }
        drop(set);
        Ok(())
    }

    /// Reset every backing pool; sets allocated before become stale
    pub fn reset_pools(&self) -> VulkanResult<()> {
        let mut state = self.shared.state.borrow_mut();
        for pool in &mut state.backing {
            self.shared.device.reset_descriptor_pool(pool.handle)?;
            pool.count = 0;
        }
        state.generation += 1;
        Ok(())
    }

    /// Destroy every backing pool now; only valid once the device is idle
    pub fn destroy(&self) {
        self.destroy_backing();
        self.shared.state.borrow_mut().destroyed = true;
    }

    fn destroy_backing(&self) {
        let backing = std::mem::take(&mut self.shared.state.borrow_mut().backing);
        for pool in backing {
            self.shared.device.destroy_descriptor_pool(pool.handle);
        }
    }

    /// Number of backing pools
    pub fn pool_count(&self) -> usize {
        self.shared.state.borrow().backing.len()
    }

    /// Live sets across all backing pools
    pub fn allocated_count(&self) -> u32 {
        self.shared.state.borrow().backing.iter().map(|pool| pool.count).sum()
    }

    /// Capacity of each backing pool
    pub fn max_sets_per_pool(&self) -> u32 {
        self.shared.state.borrow().max_sets
    }
}

/// One allocated descriptor set; returns itself to its pool on drop
pub struct DescriptorSet {
    set: vk::DescriptorSet,
    backing: vk::DescriptorPool,
    generation: u64,
    pool: Rc<PoolShared>,
}

impl DescriptorSet {
    /// Native set handle
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Backing native pool the set was allocated from
    pub fn backing_pool(&self) -> vk::DescriptorPool {
        self.backing
    }

    /// Start a batch of updates to this set
    pub fn writer(&self) -> DescriptorSetWriter {
        DescriptorSetWriter::new(self.set)
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("set", &self.set)
            .field("backing", &self.backing)
            .finish()
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.pool.release(self.set, self.backing, self.generation);
    }
}

/// Descriptor set writer for updating descriptor sets
pub struct DescriptorSetWriter {
    set: vk::DescriptorSet,
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSetWriter {
    /// Create a writer targeting `set`
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self { set, writes: Vec::new() }
    }

    /// Write a uniform or storage buffer range
    pub fn write_buffer(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        self.writes.push(DescriptorWrite {
            set: self.set,
            binding,
            array_element: 0,
            descriptor_type,
            resource: DescriptorResource::Buffer { buffer, offset, range },
        });
        self
    }

    /// Write a combined image sampler at an array element
    pub fn write_image(
        mut self,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Self {
        self.writes.push(DescriptorWrite {
            set: self.set,
            binding,
            array_element,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            resource: DescriptorResource::Image {
                view,
                sampler,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        });
        self
    }

    /// Execute all write operations
    pub fn update(self, device: &dyn GpuDevice) {
        if !self.writes.is_empty() {
            device.write_descriptors(&self.writes);
        }
    }
}
