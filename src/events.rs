// Window events consumed by the render loop
//
// winit delivers events between frames; they are queued here and drained
// once per tick so the frame loop only sees the latest window state.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    Resized { width: u32, height: u32 },
    CloseRequested,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<RenderEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: RenderEvent) {
        self.events.push_back(event);
    }

    /// Remove and yield every queued event in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = RenderEvent> + '_ {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
