//! Sampled 2D textures
//!
//! RGBA8 textures uploaded through a host-visible staging buffer on a direct command
//! buffer. The image, its sampler and its descriptor set are released through the
//! garbage collector.

use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::context::Context;
use crate::backend::vulkan::device::{GpuDevice, ImageAllocation, MemoryLocation};
use crate::backend::vulkan::rendering::command_buffer::{QueueFlags, RenderScope, SubmitType};
use crate::backend::vulkan::resources::descriptor_pool::DescriptorSet;
use crate::backend::vulkan::resources::garbage::{Garbage, GarbageCollector, GarbageKind};
use crate::backend::vulkan::{VulkanError, VulkanResult};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Sampled RGBA8 texture with image, view and sampler
pub struct TextureImage {
    device: Rc<dyn GpuDevice>,
    gc: Rc<GarbageCollector>,
    allocation: ImageAllocation,
    sampler: vk::Sampler,
    descriptor_set: Option<DescriptorSet>,
}

impl TextureImage {
    /// Create a texture from tightly packed RGBA8 texels
    pub fn create(ctx: &Context, width: u32, height: u32, rgba: &[u8]) -> VulkanResult<Self> {
        let extent = vk::Extent2D { width, height };
        check_texels(extent, rgba)?;

        let allocation = ctx
            .create_image(
                extent,
                TEXTURE_FORMAT,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            )
            .ok_or(VulkanError::OutOfMemory { requested: rgba.len() })?;

        let mut texture = Self {
            device: ctx.device().clone(),
            gc: ctx.garbage_collector().clone(),
            allocation,
            sampler: vk::Sampler::null(),
            descriptor_set: None,
        };
        // from here on Drop releases the image if anything fails
        texture.upload(ctx, vk::ImageLayout::UNDEFINED, rgba)?;
        texture.sampler = ctx
            .device()
            .create_sampler(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT)?;

        log::debug!("Created {}x{} texture {:?}", width, height, texture.allocation.image);
        Ok(texture)
    }

    /// Create a 1x1 texture of a single color, used as a material placeholder
    pub fn solid_color(ctx: &Context, rgba: [u8; 4]) -> VulkanResult<Self> {
        Self::create(ctx, 1, 1, &rgba)
    }

    /// Replace the texels; the size must stay the same
    pub fn update(&mut self, ctx: &Context, rgba: &[u8]) -> VulkanResult<()> {
        check_texels(self.allocation.extent, rgba)?;
        self.upload(ctx, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, rgba)
    }

    fn upload(&self, ctx: &Context, from: vk::ImageLayout, rgba: &[u8]) -> VulkanResult<()> {
        let staging = ctx
            .create_buffer(
                rgba.len() as vk::DeviceSize,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::Local,
            )
            .ok_or(VulkanError::OutOfMemory { requested: rgba.len() })?;

        let result = (|| {
            self.device.write_memory(staging.memory, 0, rgba)?;
            let cmd = ctx.begin_commands(
                SubmitType::DirectWaitExecution,
                RenderScope::Outside,
                QueueFlags::GRAPHICS,
            )?;
            let image = self.allocation.image;
            cmd.transition_image(image, from, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            cmd.copy_buffer_to_image(staging.buffer, image, self.allocation.extent)?;
            cmd.transition_image(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
            if ctx.submit_commands(&cmd)? {
                Ok(())
            } else {
                Err(VulkanError::invalid("texture upload was not submitted"))
            }
        })();

        self.gc.push(Garbage::new(self.device.clone(), GarbageKind::Buffer(staging)));
        result
    }

    /// Descriptor set sampling this texture, allocated on first use
    pub fn descriptor_set(&mut self, ctx: &Context) -> VulkanResult<vk::DescriptorSet> {
        if let Some(set) = &self.descriptor_set {
            return Ok(set.handle());
        }
        let set = ctx
            .allocate_texture_descriptor_set()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;
        set.writer()
            .write_image(0, 0, self.allocation.view, self.sampler)
            .update(self.device.as_ref());
        let handle = set.handle();
        self.descriptor_set = Some(set);
        Ok(handle)
    }

    /// Native image
    pub fn image(&self) -> vk::Image {
        self.allocation.image
    }

    /// Default view
    pub fn view(&self) -> vk::ImageView {
        self.allocation.view
    }

    /// Sampler
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Size in texels
    pub fn extent(&self) -> vk::Extent2D {
        self.allocation.extent
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.allocation.format
    }
}

fn check_texels(extent: vk::Extent2D, rgba: &[u8]) -> VulkanResult<()> {
    if extent.width == 0 || extent.height == 0 {
        return Err(VulkanError::invalid("texture must be at least 1x1"));
    }
    let expected = extent.width as usize * extent.height as usize * 4;
    if rgba.len() != expected {
        return Err(VulkanError::invalid(format!(
            "expected {expected} bytes of RGBA8 for {}x{}, got {}",
            extent.width,
            extent.height,
            rgba.len()
        )));
    }
    Ok(())
}

impl Drop for TextureImage {
    fn drop(&mut self) {
        self.descriptor_set.take();
        if self.sampler != vk::Sampler::null() {
            self.gc.push(Garbage::new(self.device.clone(), GarbageKind::Sampler(self.sampler)));
        }
        self.gc.push(Garbage::new(self.device.clone(), GarbageKind::Image(self.allocation)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vulkan::device::{DescriptorResource, DeviceCommand};
    use crate::backend::vulkan::test_device::{Destroyed, RecordingDevice};
    use crate::config::ContextConfig;

    fn setup() -> (Rc<RecordingDevice>, Context) {
        let recorder = Rc::new(RecordingDevice::new());
        let ctx = Context::with_device(recorder.clone(), ContextConfig::default()).unwrap();
        (recorder, ctx)
    }

    fn layouts(commands: &[DeviceCommand]) -> Vec<(vk::ImageLayout, vk::ImageLayout)> {
        commands
            .iter()
            .filter_map(|command| match command {
                DeviceCommand::Transition(t) => Some((t.old_layout, t.new_layout)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_create_uploads_and_waits() {
        let (recorder, ctx) = setup();
        let texels = vec![255u8; 2 * 2 * 4];
        let texture = TextureImage::create(&ctx, 2, 2, &texels).unwrap();
        assert_eq!(texture.extent(), vk::Extent2D { width: 2, height: 2 });

        let submission = recorder.submissions().pop().unwrap();
        assert_eq!(submission.queue, recorder.queues().graphics.queue);
        assert_eq!(recorder.queue_waits().last(), Some(&submission.queue));

        let commands = recorder.recorded(submission.command_buffers[0]);
        assert_eq!(
            layouts(&commands),
            vec![
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ]
        );
        assert!(commands.iter().any(|command| matches!(
            command,
            DeviceCommand::CopyBufferToImage { image, .. } if *image == texture.image()
        )));
    }

    #[test]
    fn test_staging_buffer_is_deferred() {
        let (recorder, ctx) = setup();
        let _texture = TextureImage::solid_color(&ctx, [128, 128, 255, 255]).unwrap();
        let staging = recorder.submissions().pop().map(|s| recorder.recorded(s.command_buffers[0]));
        let staging = staging
            .unwrap()
            .iter()
            .find_map(|command| match command {
                DeviceCommand::CopyBufferToImage { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .unwrap();
        assert_eq!(recorder.destroy_count(Destroyed::Buffer(staging)), 0);

        ctx.submit().unwrap();
        ctx.prepare_frame(0).unwrap();
        ctx.submit().unwrap();
        ctx.prepare_frame(0).unwrap();
        assert_eq!(recorder.destroy_count(Destroyed::Buffer(staging)), 1);
    }

    #[test]
    fn test_texel_count_must_match() {
        let (recorder, ctx) = setup();
        assert!(matches!(
            TextureImage::create(&ctx, 2, 2, &[0; 12]),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(TextureImage::create(&ctx, 0, 4, &[]).is_err());
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_update_transitions_from_shader_read() {
        let (recorder, ctx) = setup();
        let mut texture = TextureImage::solid_color(&ctx, [0, 0, 0, 255]).unwrap();
        texture.update(&ctx, &[255, 255, 255, 255]).unwrap();

        let submission = recorder.submissions().pop().unwrap();
        let commands = recorder.recorded(submission.command_buffers[0]);
        assert_eq!(
            layouts(&commands)[0],
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        );
        assert!(texture.update(&ctx, &[0; 8]).is_err());
    }

    #[test]
    fn test_descriptor_set_is_allocated_once() {
        let (recorder, ctx) = setup();
        let mut texture = TextureImage::solid_color(&ctx, [255, 0, 0, 255]).unwrap();
        let first = texture.descriptor_set(&ctx).unwrap();
        let second = texture.descriptor_set(&ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.texture_pool().allocated_count(), 1);

        let write = recorder.descriptor_writes().pop().unwrap();
        assert_eq!(write.set, first);
        assert_eq!(
            write.resource,
            DescriptorResource::Image {
                view: texture.view(),
                sampler: texture.sampler(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }
        );
    }

    #[test]
    fn test_drop_defers_image_and_sampler() {
        let (recorder, ctx) = setup();
        let texture = TextureImage::solid_color(&ctx, [255, 255, 255, 255]).unwrap();
        let (image, sampler) = (texture.image(), texture.sampler());
        drop(texture);
        assert_eq!(recorder.destroy_count(Destroyed::Image(image)), 0);

        ctx.submit().unwrap();
        ctx.prepare_frame(0).unwrap();
        ctx.submit().unwrap();
        ctx.prepare_frame(0).unwrap();
        assert_eq!(recorder.destroy_count(Destroyed::Image(image)), 1);
        assert_eq!(recorder.destroy_count(Destroyed::Sampler(sampler)), 1);
    }

    #[test]
    fn test_allocation_failure() {
        let (recorder, ctx) = setup();
        recorder.fail_allocations(true);
        assert!(matches!(
            TextureImage::solid_color(&ctx, [0; 4]),
            Err(VulkanError::OutOfMemory { .. })
        ));
    }
}
