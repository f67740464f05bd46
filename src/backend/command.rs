// Command recording
//
// Per-frame draw pass recording, the render-extension hook overlays use to
// append into the open pass, and the one-shot path for setup-time transfers.

use ash::vk;
use std::sync::Arc;

use super::device::Device;
use super::error::{RenderError, RenderResult, VkResultExt};

/// Borrowed recording state handed to render extensions for one `record` call.
pub struct RecordingContext<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub extent: vk::Extent2D,
}

/// Appends draw commands into the frame's render pass, after the scene draw.
pub trait RenderExtension {
    fn record(&mut self, ctx: &RecordingContext<'_>);
}

/// Everything the draw pass needs besides the command buffer.
#[derive(Debug, Clone, Copy)]
pub struct PassTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Record the frame's draw pass. `cmd` must be in the initial (reset) state.
pub fn record_frame(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    target: &PassTarget,
    extensions: &mut [Box<dyn RenderExtension>],
) -> RenderResult<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    unsafe { device.begin_command_buffer(cmd, &begin_info) }.fatal("begin_command_buffer")?;

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: target.clear_color,
        },
    }];

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target.extent,
    };

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(target.render_pass)
        .framebuffer(target.framebuffer)
        .render_area(render_area)
        .clear_values(&clear_values);

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: target.extent.width as f32,
        height: target.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };

    unsafe {
        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[render_area]);
        device.cmd_draw(cmd, 3, 1, 0, 0);
    }

    let ctx = RecordingContext {
        device,
        command_buffer: cmd,
        extent: target.extent,
    };
    for extension in extensions.iter_mut() {
        extension.record(&ctx);
    }

    unsafe {
        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd)
    }
    .fatal("end_command_buffer")
}

/// A recording one-shot command buffer. Consumed by `CommandPool::submit_and_end`.
#[must_use]
pub struct SingleUseCommands {
    pub command_buffer: vk::CommandBuffer,
}

/// Graphics-family command pool whose buffers can be reset individually.
pub struct CommandPool {
    pool: vk::CommandPool,
    device: Arc<Device>,
}

impl CommandPool {
    pub fn new(device: Arc<Device>) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_family);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .fatal("create_command_pool")?;

        Ok(Self { pool, device })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn allocate(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .fatal("allocate_command_buffers")
    }

    /// Start a one-shot command buffer for setup-time transfers.
    pub fn begin_single_use(&self) -> RenderResult<SingleUseCommands> {
        let command_buffer = self
            .allocate(1)?
            .pop()
            .ok_or_else(|| RenderError::fatal("begin_single_use", "no buffer allocated"))?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe {
            self.device
                .device
                .begin_command_buffer(command_buffer, &begin_info)
        } {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.pool, &[command_buffer])
            };
            return Err(RenderError::fatal("begin_single_use", format!("{e:?}")));
        }

        Ok(SingleUseCommands { command_buffer })
    }

    /// End, submit, block until the graphics queue is idle, then free the buffer.
    pub fn submit_and_end(&self, commands: SingleUseCommands) -> RenderResult<()> {
        let device = &self.device.device;
        let cmd = commands.command_buffer;

        let result = unsafe {
            device.end_command_buffer(cmd).and_then(|_| {
                let buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
                device.queue_submit(self.device.graphics_queue, &[submit_info], vk::Fence::null())?;
                device.queue_wait_idle(self.device.graphics_queue)
            })
        };

        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result.fatal("submit_single_use")
    }

    /// Free a one-shot buffer that will never be submitted, in any state
    /// short of pending.
    pub fn discard(&self, commands: SingleUseCommands) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.pool, &[commands.command_buffer])
        };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
