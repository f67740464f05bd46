// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// the per-image Frame resources that live and die with it.

use ash::{extensions::khr, vk};
use std::sync::Arc;

use super::command::CommandPool;
use super::device::{Device, QueueFamilyIndices};
use super::error::{RenderError, RenderResult, VkResultExt};
use super::pipeline;

/// Surface properties, queried fresh on every (re)build.
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> RenderResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .fatal("get_physical_device_surface_capabilities")?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .fatal("get_physical_device_surface_formats")?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .fatal("get_physical_device_surface_present_modes")?,
            })
        }
    }
}

/// Prefer 8-bit BGRA in the sRGB non-linear color space, else the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX when available, FIFO otherwise (FIFO is always supported).
/// A configured preference wins when the surface supports it.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(mode) = preferred.filter(|m| modes.contains(m)) {
        return mode;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let max = if caps.max_image_count == 0 {
        u32::MAX
    } else {
        caps.max_image_count
    };
    (caps.min_image_count + 1).min(max)
}

/// `(surface minimum, requested)` image counts for one build.
pub fn image_counts(caps: &vk::SurfaceCapabilitiesKHR) -> (u32, u32) {
    (caps.min_image_count, choose_image_count(caps))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Exclusive,
    Concurrent([u32; 2]),
}

pub fn choose_sharing(graphics_family: u32, present_family: u32) -> Sharing {
    if graphics_family == present_family {
        Sharing::Exclusive
    } else {
        Sharing::Concurrent([graphics_family, present_family])
    }
}

/// Per swapchain image resources.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Owned by the swapchain, never destroyed here.
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub frames: Vec<Frame>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    min_image_count: u32,
    command_pool: vk::CommandPool,
    device: Arc<Device>,
}

impl Swapchain {
    /// Build the image chain and one view per image. Framebuffers and command
    /// buffers are attached afterwards, once the render pass exists.
    pub fn build(
        device: Arc<Device>,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        window: vk::Extent2D,
        preferred_mode: Option<vk::PresentModeKHR>,
    ) -> RenderResult<Self> {
        let support =
            SwapchainSupport::query(surface_loader, device.instance.physical_device, surface)?;

        log::info!(
            "System supports {} up to {} images",
            support.capabilities.min_image_count,
            support.capabilities.max_image_count
        );

        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| RenderError::fatal("create_swapchain", "surface reports no formats"))?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_mode);
        let extent = choose_extent(&support.capabilities, window);
        let (min_image_count, image_count) = image_counts(&support.capabilities);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            format.format,
            present_mode
        );

        let sharing = choose_sharing(device.graphics_family, device.present_family);
        let family_indices = match sharing {
            Sharing::Exclusive => Vec::new(),
            Sharing::Concurrent(indices) => indices.to_vec(),
        };
        let sharing_mode = match sharing {
            Sharing::Exclusive => vk::SharingMode::EXCLUSIVE,
            Sharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
        };

        let swapchain_loader = khr::Swapchain::new(&device.instance.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .fatal("create_swapchain")?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .fatal("get_swapchain_images")?;

        // Partially built chains are cleaned up by Drop.
        let mut chain = Self {
            swapchain,
            swapchain_loader,
            frames: Vec::with_capacity(images.len()),
            format,
            extent,
            present_mode,
            min_image_count,
            command_pool: vk::CommandPool::null(),
            device,
        };

        for image in images {
            let view = create_image_view(&chain.device.device, image, format.format)?;
            chain.frames.push(Frame {
                image,
                view,
                framebuffer: vk::Framebuffer::null(),
                command_buffer: vk::CommandBuffer::null(),
            });
        }

        log::info!("Created swapchain with {} images", chain.frames.len());
        Ok(chain)
    }

    pub fn image_count(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Minimum the surface reported when this chain was built.
    pub fn min_image_count(&self) -> u32 {
        self.min_image_count
    }

    pub fn attach_framebuffers(&mut self, render_pass: vk::RenderPass) -> RenderResult<()> {
        for frame in &mut self.frames {
            frame.framebuffer =
                pipeline::create_framebuffer(&self.device, frame.view, render_pass, self.extent)?;
        }
        Ok(())
    }

    pub fn attach_command_buffers(&mut self, pool: &CommandPool) -> RenderResult<()> {
        let buffers = pool.allocate(self.frames.len() as u32)?;
        for (frame, buffer) in self.frames.iter_mut().zip(buffers) {
            frame.command_buffer = buffer;
        }
        self.command_pool = pool.raw();
        Ok(())
    }

    /// Acquire the next image, signaling `semaphore` once it is ready.
    /// Returns `(index, suboptimal)`.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> RenderResult<(u32, bool)> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainStale),
            Err(e) => Err(RenderError::fatal("acquire_next_image", format!("{e:?}"))),
        }
    }

    /// Present `image_index` once every semaphore in `wait_semaphores` is signaled.
    /// Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainStale),
            Err(e) => Err(RenderError::fatal("queue_present", format!("{e:?}"))),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            // Reverse order of creation: command buffer, framebuffer, view.
            let buffers: Vec<vk::CommandBuffer> = self
                .frames
                .iter()
                .map(|f| f.command_buffer)
                .filter(|&b| b != vk::CommandBuffer::null())
                .collect();
            if !buffers.is_empty() {
                device.free_command_buffers(self.command_pool, &buffers);
            }
            for frame in &self.frames {
                if frame.framebuffer != vk::Framebuffer::null() {
                    device.destroy_framebuffer(frame.framebuffer, None);
                }
                device.destroy_image_view(frame.view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> RenderResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.fatal("create_image_view")
}

/// Sharing mode for a resolved set of queue families.
pub fn sharing_for(indices: &QueueFamilyIndices) -> Option<Sharing> {
    Some(choose_sharing(indices.graphics?, indices.present?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    const BGRA_SRGB: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    const RGBA_UNORM: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[test]
    fn image_count_stays_within_bounds() {
        for min in 1..6 {
            for max in [0, min, min + 1, min + 4] {
                let count = choose_image_count(&caps(min, max));
                if max == 0 {
                    assert_eq!(count, min + 1);
                } else {
                    assert!(min <= count && count <= max, "min={min} max={max} count={count}");
                }
            }
        }
    }

    #[test]
    fn preferred_format_wins_regardless_of_order() {
        assert_eq!(choose_surface_format(&[RGBA_UNORM, BGRA_SRGB]), Some(BGRA_SRGB));
        assert_eq!(choose_surface_format(&[BGRA_SRGB, RGBA_UNORM]), Some(BGRA_SRGB));
    }

    #[test]
    fn format_falls_back_to_first() {
        let linear_bgra = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert_eq!(choose_surface_format(&[RGBA_UNORM, linear_bgra]), Some(RGBA_UNORM));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn mailbox_preferred_fifo_fallback() {
        use vk::PresentModeKHR as M;
        assert_eq!(choose_present_mode(&[M::FIFO, M::MAILBOX], None), M::MAILBOX);
        assert_eq!(choose_present_mode(&[M::MAILBOX, M::FIFO], None), M::MAILBOX);
        assert_eq!(choose_present_mode(&[M::IMMEDIATE, M::FIFO], None), M::FIFO);
        assert_eq!(choose_present_mode(&[M::FIFO], None), M::FIFO);
    }

    #[test]
    fn configured_mode_only_when_supported() {
        use vk::PresentModeKHR as M;
        assert_eq!(
            choose_present_mode(&[M::FIFO, M::IMMEDIATE, M::MAILBOX], Some(M::IMMEDIATE)),
            M::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&[M::FIFO, M::MAILBOX], Some(M::IMMEDIATE)), M::MAILBOX);
    }

    #[test]
    fn extent_uses_fixed_current_extent() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let window = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert_eq!(choose_extent(&c, window), c.current_extent);
    }

    #[test]
    fn surface_minimum_kept_apart_from_requested_count() {
        assert_eq!(image_counts(&caps(2, 0)), (2, 3));
        assert_eq!(image_counts(&caps(3, 3)), (3, 3));
        let (min, requested) = image_counts(&caps(1, 8));
        assert!(min < requested);
    }

    #[test]
    fn extent_clamps_window_size() {
        let window = vk::Extent2D {
            width: 10_000,
            height: 0,
        };
        let extent = choose_extent(&caps(2, 3), window);
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn cold_start_scenario() {
        let c = caps(1, 0);
        assert_eq!(choose_image_count(&c), 2);
        assert_eq!(choose_surface_format(&[BGRA_SRGB]), Some(BGRA_SRGB));
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], None),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(choose_sharing(0, 0), Sharing::Exclusive);
    }

    #[test]
    fn asymmetric_queues_share_concurrently() {
        let indices = QueueFamilyIndices {
            graphics: Some(0),
            present: Some(2),
        };
        assert_eq!(sharing_for(&indices), Some(Sharing::Concurrent([0, 2])));
        assert_eq!(
            sharing_for(&QueueFamilyIndices {
                graphics: Some(0),
                present: None
            }),
            None
        );
    }
}
