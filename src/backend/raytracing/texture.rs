// Sampled textures for the ray-traced scene
//
// Only the 1x1 white placeholder exists today; it keeps the texture array in
// the descriptor layout non-empty.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::buffer::StagedUpload;
use crate::backend::device::Device;
use crate::backend::error::{RenderError, RenderResult, VkResultExt};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Texture {
    /// Record the upload of a 1x1 white texture into `upload`, ending in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn dummy(upload: &mut StagedUpload<'_>) -> RenderResult<Self> {
        let device = Arc::clone(upload.device());
        let extent = vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .format(TEXTURE_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image =
            unsafe { device.device.create_image(&image_info, None) }.fatal("create_image")?;

        // Everything created from here on is released by Drop.
        let mut texture = Self {
            image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: None,
            device: Arc::clone(&device),
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name: "dummy texture",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::fatal("allocate_image_memory", e))?;
        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        texture.allocation = Some(allocation);
        bound.fatal("bind_image_memory")?;

        let white = [255u8; 4];
        let staging = upload.staging("dummy texture (staging)", &white)?;
        let cmd = upload.command_buffer();

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build();

        let to_shader = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build();

        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(extent)
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .subresource_range(range);
        texture.view = unsafe { device.device.create_image_view(&view_info, None) }
            .fatal("create_image_view")?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .min_filter(vk::Filter::LINEAR)
            .mag_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(f32::MAX);
        texture.sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .fatal("create_sampler")?;

        Ok(texture)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free texture allocation: {e}");
            }
        }
    }
}
