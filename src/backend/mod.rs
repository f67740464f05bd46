// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod frame_loop;
pub mod instance;
pub mod pipeline;
pub mod raytracing;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use command::{RecordingContext, RenderExtension};
pub use context::{ContextSettings, OverlayInit, VulkanContext};
pub use device::Device;
pub use error::{RenderError, RenderResult};
pub use frame_loop::{FrameLoop, TickOutcome};
pub use swapchain::Swapchain;

/// What the application needs from a rendering backend.
pub trait GraphicsContext {
    /// Build everything that depends on the window surface. Calling it again
    /// is a no-op.
    fn init(&mut self) -> RenderResult<()>;

    /// Run one acquire/record/submit/present iteration.
    fn render_frame(&mut self) -> RenderResult<TickOutcome>;

    /// The window changed size; rebuild before the next frame.
    fn request_rebuild(&mut self, width: u32, height: u32);

    /// Block until the GPU has finished all submitted work.
    fn wait_idle(&self) -> RenderResult<()>;
}
