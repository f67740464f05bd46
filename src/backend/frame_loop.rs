// Frame loop - acquire -> record -> submit -> present
//
// The loop owns the protocol, the backend owns the Vulkan objects. Keeping the
// two apart lets the ordering rules be exercised without a GPU.

use super::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
    Rebuilding,
}

/// What one call to `FrameLoop::tick` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    /// The swapchain was rebuilt; the frame, if any, may not have been shown.
    Rebuilt,
    /// Nothing to draw into (window minimized).
    Skipped,
}

/// Per-frame operations the loop sequences.
///
/// `acquire_next_image` and `present` report a stale swapchain as
/// `RenderError::SwapchainStale`; `submit` reports a dropped submission as
/// `RenderError::Submission`.
pub trait FrameBackend {
    /// Window has no drawable area.
    fn is_minimized(&self) -> bool;

    /// Block until the previous submission using the in-flight fence is done.
    fn wait_in_flight(&mut self) -> RenderResult<()>;

    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(&mut self) -> RenderResult<(u32, bool)>;

    fn reset_in_flight(&mut self) -> RenderResult<()>;

    /// Reset and record the command buffer of `image`.
    fn record(&mut self, image: u32) -> RenderResult<()>;

    fn submit(&mut self, image: u32) -> RenderResult<()>;

    /// Returns whether the swapchain is suboptimal.
    fn present(&mut self, image: u32) -> RenderResult<bool>;

    /// Throw away sync state left behind by a failed submission.
    fn discard_submission(&mut self) -> RenderResult<()>;

    fn wait_idle(&mut self) -> RenderResult<()>;

    /// Tear down per-image resources and the swapchain itself.
    fn destroy_frames(&mut self);

    /// Build the swapchain and per-image resources for the current window size.
    fn build_frames(&mut self) -> RenderResult<()>;

    fn frame_count(&self) -> usize;
}

#[derive(Debug)]
pub struct FrameLoop {
    state: FrameState,
    rebuild_requested: bool,
    frames_presented: u64,
    rebuilds: u64,
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLoop {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            rebuild_requested: false,
            frames_presented: 0,
            rebuilds: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Rebuild before the next acquire (e.g. after a window resize).
    pub fn request_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_requested
    }

    /// Run one iteration. Only fatal errors are returned.
    pub fn tick<B: FrameBackend>(&mut self, backend: &mut B) -> RenderResult<TickOutcome> {
        if backend.is_minimized() {
            return Ok(TickOutcome::Skipped);
        }
        if self.rebuild_requested {
            return self.rebuild(backend);
        }

        self.state = FrameState::Acquiring;
        backend.wait_in_flight()?;
        let image = match backend.acquire_next_image() {
            Ok((image, _suboptimal)) => image,
            Err(RenderError::SwapchainStale) => return self.rebuild(backend),
            Err(e) => return Err(e),
        };
        // Only reset once an image will actually be rendered, otherwise the
        // next wait would block forever.
        backend.reset_in_flight()?;

        self.state = FrameState::Recording;
        backend.record(image)?;

        match backend.submit(image) {
            Ok(()) => self.state = FrameState::Submitted,
            Err(e) if !e.is_fatal() => {
                log::error!("Dropping frame: {e}");
                backend.discard_submission()?;
                return self.rebuild(backend);
            }
            Err(e) => return Err(e),
        }

        self.state = FrameState::Presenting;
        match backend.present(image) {
            Ok(false) => {
                self.state = FrameState::Idle;
                self.frames_presented += 1;
                Ok(TickOutcome::Presented)
            }
            Ok(true) | Err(RenderError::SwapchainStale) => {
                self.frames_presented += 1;
                self.rebuild(backend)
            }
            Err(e) => Err(e),
        }
    }

    fn rebuild<B: FrameBackend>(&mut self, backend: &mut B) -> RenderResult<TickOutcome> {
        if backend.is_minimized() {
            log::debug!("Window minimized, deferring swapchain rebuild");
            self.rebuild_requested = true;
            self.state = FrameState::Idle;
            return Ok(TickOutcome::Skipped);
        }

        self.state = FrameState::Rebuilding;
        self.rebuild_requested = false;

        backend.wait_idle()?;
        backend.destroy_frames();
        backend.build_frames()?;

        self.rebuilds += 1;
        self.state = FrameState::Idle;
        log::debug!("Swapchain rebuilt with {} images", backend.frame_count());
        Ok(TickOutcome::Rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::Once;

    thread_local! {
        static CAPTURED: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
    }

    /// Records this thread's log lines so a test can assert on them.
    struct CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            CAPTURED.with(|c| c.borrow_mut().push((record.level(), record.args().to_string())));
        }

        fn flush(&self) {}
    }

    static LOGGER: CaptureLogger = CaptureLogger;

    fn capture_logs() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            log::set_logger(&LOGGER).ok();
            log::set_max_level(log::LevelFilter::Trace);
        });
        CAPTURED.with(|c| c.borrow_mut().clear());
    }

    fn captured() -> Vec<(log::Level, String)> {
        CAPTURED.with(|c| c.borrow().clone())
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        WaitInFlight,
        Acquire,
        ResetInFlight,
        Record(u32),
        Submit(u32),
        Present(u32),
        Discard,
        WaitIdle,
        DestroyFrames,
        BuildFrames,
    }

    #[derive(Debug, Default)]
    struct MockFrame {
        extent: (u32, u32),
        view: bool,
        framebuffer: bool,
        command_buffer: bool,
    }

    struct MockBackend {
        calls: Vec<Call>,
        acquire: VecDeque<RenderResult<(u32, bool)>>,
        submit: VecDeque<RenderResult<()>>,
        present: VecDeque<RenderResult<bool>>,
        image_counts: VecDeque<usize>,
        frames: Vec<MockFrame>,
        window: (u32, u32),
        next_image: u32,
        fence_signaled: bool,
        minimized: bool,
        live_views: usize,
        live_framebuffers: usize,
        live_command_buffers: usize,
    }

    impl MockBackend {
        fn new(image_count: usize) -> Self {
            let mut backend = Self {
                calls: Vec::new(),
                acquire: VecDeque::new(),
                submit: VecDeque::new(),
                present: VecDeque::new(),
                image_counts: VecDeque::from([image_count]),
                frames: Vec::new(),
                window: (800, 600),
                next_image: 0,
                fence_signaled: true,
                minimized: false,
                live_views: 0,
                live_framebuffers: 0,
                live_command_buffers: 0,
            };
            backend.build_frames().unwrap();
            backend.calls.clear();
            backend
        }

        fn live_resources_match_frames(&self) -> bool {
            let n = self.frames.len();
            self.frames
                .iter()
                .all(|f| f.view && f.framebuffer && f.command_buffer)
                && self.live_views == n
                && self.live_framebuffers == n
                && self.live_command_buffers == n
        }
    }

    impl FrameBackend for MockBackend {
        fn is_minimized(&self) -> bool {
            self.minimized
        }

        fn wait_in_flight(&mut self) -> RenderResult<()> {
            assert!(self.fence_signaled, "waited on a fence nothing will signal");
            self.calls.push(Call::WaitInFlight);
            Ok(())
        }

        fn acquire_next_image(&mut self) -> RenderResult<(u32, bool)> {
            self.calls.push(Call::Acquire);
            self.acquire.pop_front().unwrap_or_else(|| {
                let image = self.next_image;
                self.next_image = (self.next_image + 1) % self.frames.len() as u32;
                Ok((image, false))
            })
        }

        fn reset_in_flight(&mut self) -> RenderResult<()> {
            self.calls.push(Call::ResetInFlight);
            self.fence_signaled = false;
            Ok(())
        }

        fn record(&mut self, image: u32) -> RenderResult<()> {
            assert!((image as usize) < self.frames.len());
            self.calls.push(Call::Record(image));
            Ok(())
        }

        fn submit(&mut self, image: u32) -> RenderResult<()> {
            self.calls.push(Call::Submit(image));
            let result = self.submit.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.fence_signaled = true;
            }
            result
        }

        fn present(&mut self, image: u32) -> RenderResult<bool> {
            self.calls.push(Call::Present(image));
            self.present.pop_front().unwrap_or(Ok(false))
        }

        fn discard_submission(&mut self) -> RenderResult<()> {
            self.calls.push(Call::Discard);
            self.fence_signaled = true;
            Ok(())
        }

        fn wait_idle(&mut self) -> RenderResult<()> {
            self.calls.push(Call::WaitIdle);
            Ok(())
        }

        fn destroy_frames(&mut self) {
            self.calls.push(Call::DestroyFrames);
            for frame in self.frames.drain(..) {
                self.live_command_buffers -= frame.command_buffer as usize;
                self.live_framebuffers -= frame.framebuffer as usize;
                self.live_views -= frame.view as usize;
            }
            self.next_image = 0;
        }

        fn build_frames(&mut self) -> RenderResult<()> {
            self.calls.push(Call::BuildFrames);
            let count = self.image_counts.pop_front().unwrap_or(self.frames.len().max(2));
            for _ in 0..count {
                self.frames.push(MockFrame {
                    extent: self.window,
                    view: true,
                    framebuffer: true,
                    command_buffer: true,
                });
            }
            self.live_views += count;
            self.live_framebuffers += count;
            self.live_command_buffers += count;
            Ok(())
        }

        fn frame_count(&self) -> usize {
            self.frames.len()
        }
    }

    const REBUILD: [Call; 3] = [Call::WaitIdle, Call::DestroyFrames, Call::BuildFrames];

    #[test]
    fn cold_start_presents_first_frame() {
        let mut backend = MockBackend::new(2);
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.tick(&mut backend).unwrap();

        assert_eq!(outcome, TickOutcome::Presented);
        assert_eq!(
            backend.calls,
            vec![
                Call::WaitInFlight,
                Call::Acquire,
                Call::ResetInFlight,
                Call::Record(0),
                Call::Submit(0),
                Call::Present(0),
            ]
        );
        assert_eq!(frame_loop.state(), FrameState::Idle);
        assert_eq!(frame_loop.frames_presented(), 1);
    }

    #[test]
    fn fence_waited_and_reset_once_before_each_record() {
        let mut backend = MockBackend::new(3);
        let mut frame_loop = FrameLoop::new();

        for _ in 0..7 {
            assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Presented);
        }

        let mut since_record = Vec::new();
        for call in &backend.calls {
            match call {
                Call::Record(_) => {
                    let waits: Vec<_> = since_record
                        .iter()
                        .filter(|c| matches!(c, Call::WaitInFlight | Call::ResetInFlight))
                        .collect();
                    assert_eq!(waits, vec![&Call::WaitInFlight, &Call::ResetInFlight]);
                    since_record.clear();
                }
                other => since_record.push(*other),
            }
        }
        let images: Vec<u32> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Present(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(images, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn stale_acquire_rebuilds_without_touching_the_fence() {
        let mut backend = MockBackend::new(2);
        backend.acquire.push_back(Err(RenderError::SwapchainStale));
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.tick(&mut backend).unwrap();

        assert_eq!(outcome, TickOutcome::Rebuilt);
        assert_eq!(backend.calls[..2], [Call::WaitInFlight, Call::Acquire]);
        assert_eq!(backend.calls[2..], REBUILD);
        assert!(backend.fence_signaled);

        // The next tick must not deadlock on the fence.
        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Presented);
    }

    #[test]
    fn resize_on_stale_present() {
        let mut backend = MockBackend::new(2);
        assert!(backend.frames.iter().all(|f| f.extent == (800, 600)));
        backend.present.push_back(Err(RenderError::SwapchainStale));
        backend.window = (1024, 768);
        let mut frame_loop = FrameLoop::new();

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Rebuilt);
        assert_eq!(backend.calls[5], Call::Present(0));
        assert_eq!(backend.calls[6..], REBUILD);
        assert_eq!(backend.frame_count(), 2);
        assert!(backend.frames.iter().all(|f| f.extent == (1024, 768)));

        backend.calls.clear();
        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Presented);
        assert_eq!(backend.calls.last(), Some(&Call::Present(0)));
        assert_eq!(frame_loop.rebuilds(), 1);
    }

    #[test]
    fn suboptimal_present_rebuilds() {
        let mut backend = MockBackend::new(2);
        backend.present.push_back(Ok(true));
        let mut frame_loop = FrameLoop::new();

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Rebuilt);
        assert_eq!(backend.calls[backend.calls.len() - 3..], REBUILD);
    }

    #[test]
    fn requested_rebuild_runs_before_next_acquire() {
        let mut backend = MockBackend::new(2);
        let mut frame_loop = FrameLoop::new();
        backend.window = (1920, 1080);
        frame_loop.request_rebuild();

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Rebuilt);
        assert_eq!(backend.calls, REBUILD);
        assert!(!frame_loop.rebuild_pending());
        assert!(backend.frames.iter().all(|f| f.extent == (1920, 1080)));
    }

    #[test]
    fn idle_wait_precedes_destroy_precedes_build() {
        let mut backend = MockBackend::new(2);
        backend.acquire.push_back(Err(RenderError::SwapchainStale));
        backend.present.push_back(Err(RenderError::SwapchainStale));
        let mut frame_loop = FrameLoop::new();

        for _ in 0..4 {
            frame_loop.tick(&mut backend).unwrap();
        }

        let position = |call: Call, from: usize| {
            backend.calls[from..]
                .iter()
                .position(|c| *c == call)
                .map(|p| p + from)
        };
        let mut from = 0;
        while let Some(destroy) = position(Call::DestroyFrames, from) {
            assert_eq!(backend.calls[destroy - 1], Call::WaitIdle);
            assert_eq!(backend.calls[destroy + 1], Call::BuildFrames);
            from = destroy + 1;
        }
        assert_eq!(frame_loop.rebuilds(), 2);
    }

    #[test]
    fn frame_resources_match_image_count_through_rebuilds() {
        let mut backend = MockBackend::new(3);
        backend.image_counts.extend([2, 4]);
        let mut frame_loop = FrameLoop::new();
        assert!(backend.live_resources_match_frames());

        frame_loop.request_rebuild();
        frame_loop.tick(&mut backend).unwrap();
        assert_eq!(backend.frame_count(), 2);
        assert!(backend.live_resources_match_frames());

        backend.acquire.push_back(Err(RenderError::SwapchainStale));
        frame_loop.tick(&mut backend).unwrap();
        assert_eq!(backend.frame_count(), 4);
        assert!(backend.live_resources_match_frames());
    }

    #[test]
    fn dropped_submission_recovers() {
        let mut backend = MockBackend::new(2);
        backend.submit.push_back(Err(RenderError::Submission {
            reason: "ERROR_DEVICE_LOST".into(),
        }));
        let mut frame_loop = FrameLoop::new();
        capture_logs();

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Rebuilt);
        assert!(captured().iter().any(|(level, line)| {
            *level == log::Level::Error && line.contains("ERROR_DEVICE_LOST")
        }));
        assert_eq!(backend.calls[4], Call::Submit(0));
        assert_eq!(backend.calls[5], Call::Discard);
        assert_eq!(backend.calls[6..], REBUILD);
        assert!(!backend.calls.contains(&Call::Present(0)));

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Presented);
    }

    #[test]
    fn fatal_errors_propagate() {
        let mut backend = MockBackend::new(2);
        backend
            .acquire
            .push_back(Err(RenderError::fatal("acquire_next_image", "ERROR_DEVICE_LOST")));
        let mut frame_loop = FrameLoop::new();

        let err = frame_loop.tick(&mut backend).unwrap_err();
        assert!(err.is_fatal());
        assert!(!backend.calls.contains(&Call::ResetInFlight));
    }

    #[test]
    fn minimized_window_defers_rebuild() {
        let mut backend = MockBackend::new(2);
        backend.minimized = true;
        let mut frame_loop = FrameLoop::new();
        frame_loop.request_rebuild();

        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Skipped);
        assert!(backend.calls.is_empty());
        assert!(frame_loop.rebuild_pending());

        backend.minimized = false;
        assert_eq!(frame_loop.tick(&mut backend).unwrap(), TickOutcome::Rebuilt);
        assert_eq!(backend.calls, REBUILD);
    }
}
