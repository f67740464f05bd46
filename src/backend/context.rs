// Vulkan rendering context
//
// Owns every GPU object the renderer creates and drives them through the
// frame loop. Construction order:
//   instance -> surface -> device -> command pool -> swapchain -> render pass
//   -> pipeline -> frames -> sync -> scene
// Drop waits for the device, then releases sync and the swapchain before the
// pool their command buffers came from.

use ash::{extensions::khr, vk};
use glam::Mat4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;

use super::command::{self, CommandPool, PassTarget, RenderExtension};
use super::device::Device;
use super::error::{RenderError, RenderResult, VkResultExt};
use super::frame_loop::{FrameBackend, FrameLoop, TickOutcome};
use super::instance::GpuInstance;
use super::pipeline::{self, RasterPipeline};
use super::raytracing::SceneBuilder;
use super::shader;
use super::swapchain::Swapchain;
use super::sync::FrameSync;
use super::GraphicsContext;

/// Scene to load when ray tracing is enabled.
#[derive(Debug, Clone)]
pub struct SceneSettings {
    pub model: PathBuf,
    pub transform: Mat4,
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub app_name: String,
    pub validation: bool,
    pub ray_tracing: bool,
    pub present_mode: Option<vk::PresentModeKHR>,
    pub clear_color: [f32; 4],
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub scene: Option<SceneSettings>,
}

/// Handles an immediate-mode UI overlay needs to set up its own renderer.
///
/// A snapshot: the render pass is recreated when a rebuild changes the surface
/// format, so overlays should re-read `VulkanContext::render_pass` after a
/// `TickOutcome::Rebuilt`.
#[derive(Debug, Clone, Copy)]
pub struct OverlayInit {
    pub instance: vk::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: vk::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub min_image_count: u32,
    pub image_count: u32,
    pub render_pass: vk::RenderPass,
}

pub struct VulkanContext {
    settings: ContextSettings,
    window_extent: vk::Extent2D,
    initialized: bool,

    frame_loop: FrameLoop,
    extensions: Vec<Box<dyn RenderExtension>>,

    // Built by init()
    sync: Option<FrameSync>,
    swapchain: Option<Swapchain>,
    command_pool: Option<CommandPool>,
    pipeline: Option<RasterPipeline>,
    render_pass: vk::RenderPass,
    surface_format: vk::Format,
    descriptor_pools: Vec<vk::DescriptorPool>,
    scene: Option<SceneBuilder>,

    // Built by new()
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    device: Arc<Device>,
    instance: Arc<GpuInstance>,
}

impl VulkanContext {
    /// Create the instance, the window surface and the logical device.
    pub fn new(
        settings: ContextSettings,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let instance = Arc::new(GpuInstance::new(
            &settings.app_name,
            settings.validation,
            settings.ray_tracing,
            display,
        )?);

        let surface = unsafe {
            ash_window::create_surface(&instance.entry, &instance.instance, display, window, None)
        }
        .fatal("create_surface")?;
        let surface_loader = khr::Surface::new(&instance.entry, &instance.instance);

        let device = match Device::new(Arc::clone(&instance), &surface_loader, surface) {
            Ok(device) => device,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };

        Ok(Self {
            settings,
            window_extent: vk::Extent2D { width, height },
            initialized: false,
            frame_loop: FrameLoop::new(),
            extensions: Vec::new(),
            sync: None,
            swapchain: None,
            command_pool: None,
            pipeline: None,
            render_pass: vk::RenderPass::null(),
            surface_format: vk::Format::UNDEFINED,
            descriptor_pools: Vec::new(),
            scene: None,
            surface_loader,
            surface,
            device,
            instance,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn frame_loop(&self) -> &FrameLoop {
        &self.frame_loop
    }

    /// The render pass frames are currently recorded into.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn scene(&self) -> Option<&SceneBuilder> {
        self.scene.as_ref()
    }

    /// Append draw commands into every frame's render pass, in registration order.
    pub fn add_render_extension(&mut self, extension: Box<dyn RenderExtension>) {
        self.extensions.push(extension);
    }

    /// Command pool for setup-time uploads (`begin_single_use` / `submit_and_end`).
    pub fn command_pool(&self) -> RenderResult<&CommandPool> {
        self.command_pool
            .as_ref()
            .ok_or_else(|| RenderError::fatal("command_pool", "context not initialized"))
    }

    pub fn overlay_init(&self) -> RenderResult<OverlayInit> {
        let swapchain = self.swapchain()?;
        Ok(OverlayInit {
            instance: self.instance.instance.handle(),
            physical_device: self.instance.physical_device,
            device: self.device.device.handle(),
            queue_family: self.device.graphics_family,
            queue: self.device.graphics_queue,
            min_image_count: swapchain.min_image_count(),
            image_count: swapchain.image_count(),
            render_pass: self.render_pass,
        })
    }

    /// Descriptor pool for one combined image sampler (the overlay font atlas).
    /// Destroyed with the context.
    pub fn create_descriptor_pool(&mut self) -> RenderResult<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { self.device.device.create_descriptor_pool(&pool_info, None) }
            .fatal("create_descriptor_pool")?;
        self.descriptor_pools.push(pool);
        Ok(pool)
    }

    fn swapchain(&self) -> RenderResult<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| RenderError::fatal("swapchain", "no swapchain built"))
    }

    fn sync(&self) -> RenderResult<&FrameSync> {
        self.sync
            .as_ref()
            .ok_or_else(|| RenderError::fatal("sync", "context not initialized"))
    }

    /// Recreate the render pass and raster pipeline for `format`.
    fn create_raster_state(&mut self, format: vk::Format) -> RenderResult<()> {
        self.destroy_raster_state();

        self.render_pass = pipeline::create_render_pass(&self.device, format)?;
        self.surface_format = format;

        let vert = shader::load_shader(&self.device, &self.settings.vertex_shader)?;
        let frag = match shader::load_shader(&self.device, &self.settings.fragment_shader) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { self.device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let pipeline =
            pipeline::create_graphics_pipeline(&self.device, self.render_pass, vert, frag);

        // Modules are only needed while the pipeline is created.
        unsafe {
            self.device.device.destroy_shader_module(vert, None);
            self.device.device.destroy_shader_module(frag, None);
        }

        self.pipeline = Some(pipeline?);
        log::info!("Created raster pipeline for {:?}", format);
        Ok(())
    }

    fn destroy_raster_state(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.device.device);
        }
        if self.render_pass != vk::RenderPass::null() {
            unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = vk::RenderPass::null();
        }
    }

    fn build_scene(&mut self, scene: &SceneSettings) -> RenderResult<()> {
        let pool = self
            .command_pool
            .as_ref()
            .ok_or_else(|| RenderError::fatal("build_scene", "context not initialized"))?;

        let mut builder = SceneBuilder::new(Arc::clone(&self.device))?;
        builder.load_model(pool, &scene.model, scene.transform)?;
        builder.build_blas(pool)?;
        builder.build_tlas(pool)?;
        builder.upload_descriptors(pool)?;

        self.scene = Some(builder);
        Ok(())
    }
}

impl GraphicsContext for VulkanContext {
    fn init(&mut self) -> RenderResult<()> {
        if self.initialized {
            return Ok(());
        }

        self.command_pool = Some(CommandPool::new(Arc::clone(&self.device))?);
        self.build_frames()?;
        self.sync = Some(FrameSync::new(&self.device.device)?);

        if self.settings.ray_tracing {
            if let Some(scene) = self.settings.scene.clone() {
                self.build_scene(&scene)?;
            }
        }

        self.initialized = true;
        log::info!("Vulkan context initialized");
        Ok(())
    }

    fn render_frame(&mut self) -> RenderResult<TickOutcome> {
        if !self.initialized {
            return Err(RenderError::fatal("render_frame", "context not initialized"));
        }
        let mut frame_loop = std::mem::take(&mut self.frame_loop);
        let outcome = frame_loop.tick(self);
        self.frame_loop = frame_loop;
        outcome
    }

    fn request_rebuild(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.frame_loop.request_rebuild();
    }

    fn wait_idle(&self) -> RenderResult<()> {
        self.device.wait_idle()
    }
}

impl FrameBackend for VulkanContext {
    fn is_minimized(&self) -> bool {
        self.window_extent.width == 0 || self.window_extent.height == 0
    }

    fn wait_in_flight(&mut self) -> RenderResult<()> {
        self.sync()?.wait(&self.device.device)
    }

    fn acquire_next_image(&mut self) -> RenderResult<(u32, bool)> {
        let semaphore = self.sync()?.image_available;
        self.swapchain()?.acquire_next_image(u64::MAX, semaphore)
    }

    fn reset_in_flight(&mut self) -> RenderResult<()> {
        self.sync()?.reset(&self.device.device)
    }

    fn record(&mut self, image: u32) -> RenderResult<()> {
        let swapchain = self.swapchain()?;
        let frame = *swapchain
            .frames
            .get(image as usize)
            .ok_or_else(|| RenderError::fatal("record", format!("no frame for image {image}")))?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| RenderError::fatal("record", "no pipeline"))?;

        let target = PassTarget {
            render_pass: self.render_pass,
            framebuffer: frame.framebuffer,
            pipeline: pipeline.pipeline,
            extent: swapchain.extent,
            clear_color: self.settings.clear_color,
        };

        let device = &self.device.device;
        unsafe {
            device.reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .fatal("reset_command_buffer")?;
        command::record_frame(device, frame.command_buffer, &target, &mut self.extensions)
    }

    fn submit(&mut self, image: u32) -> RenderResult<()> {
        let sync = self.sync()?;
        let frame = self
            .swapchain()?
            .frames
            .get(image as usize)
            .ok_or_else(|| RenderError::fatal("submit", format!("no frame for image {image}")))?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                sync.in_flight_fence,
            )
        }
        .map_err(|e| RenderError::Submission {
            reason: format!("{e:?}"),
        })
    }

    fn present(&mut self, image: u32) -> RenderResult<bool> {
        let render_finished = self.sync()?.render_finished;
        self.swapchain()?
            .present(self.device.present_queue, image, &[render_finished])
    }

    fn discard_submission(&mut self) -> RenderResult<()> {
        self.device.wait_idle()?;
        let device = Arc::clone(&self.device);
        match self.sync.as_mut() {
            Some(sync) => sync.recreate(&device.device),
            None => Ok(()),
        }
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.device.wait_idle()
    }

    fn destroy_frames(&mut self) {
        self.swapchain = None;
    }

    fn build_frames(&mut self) -> RenderResult<()> {
        let mut swapchain = Swapchain::build(
            Arc::clone(&self.device),
            &self.surface_loader,
            self.surface,
            self.window_extent,
            self.settings.present_mode,
        )?;

        if swapchain.format.format != self.surface_format {
            self.create_raster_state(swapchain.format.format)?;
        }

        let pool = self
            .command_pool
            .as_ref()
            .ok_or_else(|| RenderError::fatal("build_frames", "context not initialized"))?;
        swapchain.attach_framebuffers(self.render_pass)?;
        swapchain.attach_command_buffers(pool)?;

        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn frame_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |s| s.frames.len())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan context...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("{e}");
        }

        if let Some(sync) = self.sync.take() {
            sync.destroy(&self.device.device);
        }
        self.swapchain = None;
        self.command_pool = None;
        self.destroy_raster_state();
        for pool in self.descriptor_pools.drain(..) {
            unsafe { self.device.device.destroy_descriptor_pool(pool, None) };
        }
        self.scene = None;
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        // Device, then instance, follow in field order.
    }
}
