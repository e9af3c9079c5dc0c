// The zoom/pan stage runs first, then extra handlers in order. A pointer
// sequence that had anything consumed, or used more than one pointer, is
// never a tap.

use std::time::{Duration, Instant};

pub const MAX_ZOOM: f32 = 4.0;
pub const TAP_DIM_DURATION: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureKind {
    Down,
    /// Pointer moved by a delta in container units.
    Pan { dx: f32, dy: f32 },
    /// Pinch or wheel; `factor` > 1 zooms in.
    Zoom { factor: f32 },
    DoubleTap,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureEvent {
    pub kind: GestureKind,
    pub pointer_count: u8,
    pub x: f32,
    pub y: f32,
}

impl GestureEvent {
    #[must_use]
    pub const fn single(kind: GestureKind, x: f32, y: f32) -> Self {
        Self {
            kind,
            pointer_count: 1,
            x,
            y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureOutcome {
    /// A handler used the event, or the sequence is already a gesture.
    Consumed,
    /// The sequence ended without being claimed; treat it as a tap at the
    /// event position.
    Tap,
    Ignored,
}

pub trait GestureHandler {
    /// Returns `true` when the event was consumed.
    fn on_gesture(&mut self, event: &GestureEvent) -> bool;
    fn reset(&mut self);
}

/// Zoom and pan of the content inside the container.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomPan {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    width: f32,
    height: f32,
}

impl ZoomPan {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            width,
            height,
        }
    }

    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    #[must_use]
    pub const fn offset(&self) -> (f32, f32) {
        (self.offset_x, self.offset_y)
    }

    pub fn set_bounds(&mut self, width: f32, height: f32) {
        self.width = width;
        self.height = height;
        self.clamp_offsets();
    }

    fn clamp_offsets(&mut self) {
        let max_x = (self.scale - 1.0) * self.width / 2.0;
        let max_y = (self.scale - 1.0) * self.height / 2.0;
        self.offset_x = self.offset_x.clamp(-max_x, max_x);
        self.offset_y = self.offset_y.clamp(-max_y, max_y);
    }
}

impl GestureHandler for ZoomPan {
    fn on_gesture(&mut self, event: &GestureEvent) -> bool {
        match event.kind {
            GestureKind::Zoom { factor } if factor.is_finite() && factor > 0.0 => {
                self.scale = (self.scale * factor).clamp(1.0, MAX_ZOOM);
                self.clamp_offsets();
                true
            }
            GestureKind::Pan { dx, dy } if self.scale > 1.0 => {
                self.offset_x += dx;
                self.offset_y += dy;
                self.clamp_offsets();
                true
            }
            GestureKind::DoubleTap if self.scale > 1.0 => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.scale = 1.0;
        self.offset_x = 0.0;
        self.offset_y = 0.0;
    }
}

pub struct GesturePipeline {
    zoom: ZoomPan,
    handlers: Vec<Box<dyn GestureHandler>>,
    in_progress: bool,
}

impl GesturePipeline {
    #[must_use]
    pub fn new(zoom: ZoomPan) -> Self {
        Self {
            zoom,
            handlers: Vec::new(),
            in_progress: false,
        }
    }

    pub fn push(&mut self, handler: Box<dyn GestureHandler>) {
        self.handlers.push(handler);
    }

    #[must_use]
    pub const fn zoom(&self) -> &ZoomPan {
        &self.zoom
    }

    pub fn zoom_mut(&mut self) -> &mut ZoomPan {
        &mut self.zoom
    }

    pub fn on_gesture(&mut self, event: &GestureEvent) -> GestureOutcome {
        let consumed = self.zoom.on_gesture(event)
            || self
                .handlers
                .iter_mut()
                .any(|handler| handler.on_gesture(event))
            || event.pointer_count > 1;
        if consumed {
            self.in_progress = true;
        }

        let sequence_over = event.kind == GestureKind::Up && event.pointer_count <= 1;
        if sequence_over {
            let was_gesture = std::mem::take(&mut self.in_progress);
            return if was_gesture {
                GestureOutcome::Consumed
            } else {
                GestureOutcome::Tap
            };
        }

        if consumed {
            GestureOutcome::Consumed
        } else {
            GestureOutcome::Ignored
        }
    }

    /// Called after a relayout: every handler drops its transform.
    pub fn reset(&mut self) {
        self.zoom.reset();
        for handler in &mut self.handlers {
            handler.reset();
        }
        self.in_progress = false;
    }
}

/// Brief highlight of the viewport that was just tapped.
#[derive(Debug, Clone, Default)]
pub struct TapDimmer {
    dimmed: Option<(usize, Instant)>,
}

impl TapDimmer {
    pub fn dim(&mut self, target: usize, now: Instant) {
        self.dimmed = Some((target, now + TAP_DIM_DURATION));
    }

    #[must_use]
    pub fn is_dimmed(&self, target: usize, now: Instant) -> bool {
        matches!(self.dimmed, Some((dimmed, until)) if dimmed == target && now < until)
    }
}
