// =============================================================================
// PHOTON - Vulkan rendering core with an optional ray-traced scene
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input)                               │
// │    └── EventQueue (resize / close, drained once per frame)      │
// │          └── VulkanContext (GraphicsContext)                    │
// │                └── FrameLoop (acquire, record, submit, present) │
// │                      └── Swapchain + FrameSync                  │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Drain queued window events (resize requests a rebuild)
// 2. Wait for the in-flight fence
// 3. Acquire a swapchain image
// 4. Record the render pass and any registered extensions
// 5. Submit and present, rebuilding the swapchain when it goes stale
//
// =============================================================================

use anyhow::{anyhow, Result};
use photon::backend::{GraphicsContext, TickOutcome, VulkanContext};
use photon::config::{Config, CONFIG_FILE};
use photon::events::{EventQueue, RenderEvent};
use photon::logging;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // The log file location comes from the config, so load it first and
    // report any problem once the logger is up.
    let (config, config_error) = Config::load_or_default(CONFIG_FILE);
    logging::init(&config.debug)?;

    match config_error {
        Some(e) => log::warn!("Failed to load {CONFIG_FILE}: {e:#}. Using defaults."),
        None => log::debug!("Config: {:?}", config),
    }
    log::info!("Starting Photon");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.resizable { "resizable" } else { "fixed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);
    log::info!(
        "Ray tracing: {}",
        if config.graphics.ray_tracing { "enabled" } else { "disabled" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(reason) => Err(anyhow!(reason)),
        None => Ok(()),
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// The context is declared before the window so it is dropped first; the
/// surface must go before the window it was created from.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    context: Option<VulkanContext>,
    events: EventQueue,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,

    /// Set when the loop stopped because of an unrecoverable error.
    failure: Option<String>,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            context: None,
            events: EventQueue::new(),
            window: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
            failure: None,
        }
    }

    // =========================================================================
    // VULKAN INITIALIZATION
    // =========================================================================

    fn init_context(&self, window: &Window) -> Result<VulkanContext> {
        let size = window.inner_size();
        let mut context = VulkanContext::new(
            self.config.context_settings(),
            window.raw_display_handle(),
            window.raw_window_handle(),
            size.width,
            size.height,
        )?;
        context.init()?;
        Ok(context)
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Apply queued window events, then render one frame.
    fn tick(&mut self, event_loop: &ActiveEventLoop) {
        let Some(context) = self.context.as_mut() else {
            return;
        };

        for event in self.events.drain() {
            match event {
                RenderEvent::Resized { width, height } => {
                    log::debug!("Window resized to {}x{}", width, height);
                    context.request_rebuild(width, height);
                }
                RenderEvent::CloseRequested => {
                    log::info!("Close requested, shutting down...");
                    if let Err(e) = context.wait_idle() {
                        log::error!("{e}");
                    }
                    event_loop.exit();
                    return;
                }
            }
        }

        match context.render_frame() {
            Ok(TickOutcome::Presented) => self.update_fps(),
            Ok(TickOutcome::Rebuilt) => log::debug!("Swapchain rebuilt"),
            Ok(TickOutcome::Skipped) => {}
            Err(e) if e.is_fatal() => {
                log::error!("{e}");
                self.failure = Some(e.to_string());
                event_loop.exit();
            }
            Err(e) => log::warn!("Frame dropped: {e}"),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {e}");
                self.failure = Some(e.to_string());
                event_loop.exit();
                return;
            }
        };

        match self.init_context(&window) {
            Ok(context) => self.context = Some(context),
            Err(e) => {
                log::error!("{e:#}");
                self.failure = Some(format!("{e:#}"));
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                self.events.push(RenderEvent::CloseRequested);
                if self.context.is_none() {
                    event_loop.exit();
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                self.events.push(RenderEvent::Resized {
                    width: size.width,
                    height: size.height,
                });
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => self.tick(event_loop),

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.events.push(RenderEvent::CloseRequested);
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; every redraw is one frame loop tick.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // VulkanContext waits for the device and tears down in reverse order.
        self.context = None;
        log::info!("Cleanup complete");
    }
}
