//! Gesture recognizer — turns normalized touch samples into pointer actions.
//!
//! Samples arrive serialized from the server's receive task. The long-press
//! timer and the momentum ticker run on their own tasks and take the same
//! state mutex; generation tokens invalidate timers that outlive the gesture
//! that started them. Injector calls are never made while holding the lock:
//! the state transition captures a list of [`PointerAction`]s, the lock is
//! released, then the actions are applied to the sink.
//!
//! ```text
//! Idle ──down──► Pending ──move > 15 px──► Scrolling ──up (fast)──► momentum
//!                  │  │                        └──up──► Idle
//!                  │  └──up (fast, close)──► tap / double-tap
//!                  └──500 ms──► LongPressReady ──move──► Dragging
//!                                   └──up──► right-click
//! two-finger down ──spread > 20 px──► Pinching
//!                 └─midpoint > 15 px─► TwoFingerScroll
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sidecast_core::backend::PointerSink;
use sidecast_core::{DisplayBounds, TouchPhase, TouchSample};
use tracing::trace;

// ── Tuning constants ──────────────────────────────────────────────────────────
// These must match across platforms for a consistent feel.

/// Movement within this still counts as a tap.
pub const TAP_MAX_DISTANCE: f32 = 15.0;
/// Upper bound for a tap.
pub const TAP_MAX_TIME: Duration = Duration::from_millis(250);
/// Max gap between the taps of a double-tap (strict).
pub const DOUBLE_TAP_MAX_TIME: Duration = Duration::from_millis(400);
/// Max distance between the taps of a double-tap (strict).
pub const DOUBLE_TAP_MAX_DISTANCE: f32 = 20.0;
/// Hold threshold before a press becomes a long-press.
pub const LONG_PRESS_TIME: Duration = Duration::from_millis(500);
/// Scroll delta multiplier.
pub const SCROLL_SENSITIVITY: f32 = 1.2;
/// Pinch activation threshold.
pub const PINCH_MIN_DISTANCE: f32 = 20.0;
/// Momentum velocity multiplier per tick.
pub const MOMENTUM_DECAY: f32 = 0.92;
/// Momentum stops when both velocity components fall below this.
pub const MOMENTUM_MIN_VELOCITY: f32 = 0.5;
/// Momentum tick interval (~60 Hz).
pub const MOMENTUM_INTERVAL: Duration = Duration::from_millis(16);

/// Recency window for the scroll velocity sampled at finger-up.
const FLICK_MAX_AGE: Duration = Duration::from_millis(50);
/// Minimum last-delta magnitude for a flick to start momentum.
const FLICK_MIN_DELTA: f32 = 2.0;
/// Velocity = last scroll delta × this on flick.
const FLICK_VELOCITY_SCALE: f32 = 6.0;
/// Inter-sample gaps outside (0, 100 ms) do not update the flick velocity.
const SCROLL_GAP_MAX: Duration = Duration::from_millis(100);
/// Cancel-flag polling granularity of the long-press timer.
const LONG_PRESS_POLL: Duration = Duration::from_millis(10);

// ── Actions ───────────────────────────────────────────────────────────────────

/// One pointer command for the injector, with absolute screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerAction {
    Move { x: i32, y: i32 },
    LeftDown,
    LeftUp,
    RightDown,
    RightUp,
    Scroll { x: i32, y: i32, dx: f32, dy: f32 },
    DoubleClick { x: i32, y: i32 },
    /// Positive delta = zoom in.
    Zoom { x: i32, y: i32, delta: i32 },
}

// ── States ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureState {
    Idle,
    Pending,
    Scrolling,
    LongPressReady,
    Dragging,
    TwoFingerScroll,
    Pinching,
}

// ── Pure state core ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct TapRecord {
    at:  Instant,
    pos: (f32, f32),
}

#[derive(Debug, Clone, Copy)]
struct TwoFingerTracking {
    initial_dist: f32,
    initial_mid:  (f32, f32),
    last_dist:    f32,
    last_mid:     (f32, f32),
}

#[derive(Debug, Clone, Copy)]
struct Momentum {
    vx:     f32,
    vy:     f32,
    anchor: (i32, i32),
}

/// Effects of one state transition, applied after the lock is released.
#[derive(Debug, Default)]
struct Effects {
    actions: Vec<PointerAction>,
    /// Arm the long-press timer with this token.
    start_long_press: Option<u64>,
    /// Start a momentum ticker with this sequence number.
    start_momentum: Option<u64>,
}

struct GestureCore {
    bounds: DisplayBounds,
    state:  GestureState,

    start: (f32, f32),
    last:  (f32, f32),
    press_at:     Option<Instant>,
    last_move_at: Option<Instant>,

    last_scroll_delta: (f32, f32),
    last_scroll_at:    Option<Instant>,

    last_tap: Option<TapRecord>,

    two: Option<TwoFingerTracking>,

    momentum:     Option<Momentum>,
    momentum_seq: u64,

    long_press_token: u64,
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

fn midpoint(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}

impl GestureCore {
    fn new(bounds: DisplayBounds) -> Self {
        Self {
            bounds,
            state: GestureState::Idle,
            start: (0.0, 0.0),
            last: (0.0, 0.0),
            press_at: None,
            last_move_at: None,
            last_scroll_delta: (0.0, 0.0),
            last_scroll_at: None,
            last_tap: None,
            two: None,
            momentum: None,
            momentum_seq: 0,
            long_press_token: 0,
        }
    }

    fn to_screen(&self, nx: f32, ny: f32) -> (f32, f32) {
        self.bounds.project(nx, ny)
    }

    fn cancel_long_press(&mut self) -> u64 {
        self.long_press_token += 1;
        self.long_press_token
    }

    fn stop_momentum(&mut self) {
        self.momentum = None;
        self.momentum_seq += 1;
    }

    // ── Sample handling ───────────────────────────────────────────────────

    fn on_sample(&mut self, sample: &TouchSample, now: Instant) -> Effects {
        let mut fx = Effects::default();
        if let Some((x2, y2)) = sample.second {
            self.on_two_finger(sample, (x2, y2), now, &mut fx);
        } else {
            self.on_one_finger(sample, now, &mut fx);
        }
        fx
    }

    fn on_one_finger(&mut self, sample: &TouchSample, now: Instant, fx: &mut Effects) {
        let p = self.to_screen(sample.x, sample.y);

        match sample.phase {
            TouchPhase::Down => {
                // A fresh contact preempts any running momentum.
                self.stop_momentum();
                self.two = None;
                self.state = GestureState::Pending;
                self.start = p;
                self.last = p;
                self.press_at = Some(now);
                self.last_move_at = None;
                self.last_scroll_at = None;
                fx.actions.push(PointerAction::Move { x: p.0 as i32, y: p.1 as i32 });
                fx.start_long_press = Some(self.cancel_long_press());
            }

            TouchPhase::Move => match self.state {
                GestureState::Pending => {
                    if distance(p, self.start) > TAP_MAX_DISTANCE {
                        self.cancel_long_press();
                        self.state = GestureState::Scrolling;
                        self.emit_scroll(p, now, fx);
                    }
                    self.last = p;
                    self.last_move_at = Some(now);
                }
                GestureState::Scrolling => {
                    self.emit_scroll(p, now, fx);
                    self.last = p;
                    self.last_move_at = Some(now);
                }
                GestureState::LongPressReady => {
                    if distance(p, self.start) > TAP_MAX_DISTANCE {
                        // Drag begins at the press point: the cursor already
                        // sits there from the initial down.
                        self.state = GestureState::Dragging;
                        fx.actions.push(PointerAction::LeftDown);
                        fx.actions.push(PointerAction::Move { x: p.0 as i32, y: p.1 as i32 });
                    }
                    self.last = p;
                    self.last_move_at = Some(now);
                }
                GestureState::Dragging => {
                    fx.actions.push(PointerAction::Move { x: p.0 as i32, y: p.1 as i32 });
                    self.last = p;
                    self.last_move_at = Some(now);
                }
                _ => {}
            },

            TouchPhase::Up => match self.state {
                GestureState::Pending => {
                    self.cancel_long_press();
                    self.state = GestureState::Idle;
                    let held = self.press_at.map(|t| now.duration_since(t));
                    if held.is_some_and(|h| h <= TAP_MAX_TIME)
                        && distance(p, self.start) <= TAP_MAX_DISTANCE
                    {
                        self.finish_tap(p, now, fx);
                    }
                }
                GestureState::Scrolling => {
                    self.state = GestureState::Idle;
                    self.maybe_start_momentum(p, now, fx);
                }
                GestureState::LongPressReady => {
                    self.state = GestureState::Idle;
                    fx.actions.push(PointerAction::RightDown);
                    fx.actions.push(PointerAction::RightUp);
                }
                GestureState::Dragging => {
                    self.state = GestureState::Idle;
                    fx.actions.push(PointerAction::LeftUp);
                }
                _ => {
                    self.state = GestureState::Idle;
                }
            },
        }
    }

    fn emit_scroll(&mut self, p: (f32, f32), now: Instant, fx: &mut Effects) {
        let dx = (p.0 - self.last.0) * SCROLL_SENSITIVITY;
        let dy = (p.1 - self.last.1) * SCROLL_SENSITIVITY;
        fx.actions.push(PointerAction::Scroll { x: p.0 as i32, y: p.1 as i32, dx, dy });

        // The flick velocity only tracks samples that arrive at a plausible
        // cadence; zero or > 100 ms gaps would corrupt it.
        let prev = self.last_move_at.or(self.press_at);
        if let Some(prev) = prev {
            let gap = now.duration_since(prev);
            if gap > Duration::ZERO && gap < SCROLL_GAP_MAX {
                self.last_scroll_delta = (dx, dy);
                self.last_scroll_at = Some(now);
            }
        }
    }

    fn finish_tap(&mut self, p: (f32, f32), now: Instant, fx: &mut Effects) {
        let is_double = self.last_tap.is_some_and(|tap| {
            now.duration_since(tap.at) < DOUBLE_TAP_MAX_TIME
                && distance(p, tap.pos) < DOUBLE_TAP_MAX_DISTANCE
        });
        if is_double {
            fx.actions.push(PointerAction::DoubleClick { x: p.0 as i32, y: p.1 as i32 });
            self.last_tap = None;
        } else {
            fx.actions.push(PointerAction::LeftDown);
            fx.actions.push(PointerAction::LeftUp);
            self.last_tap = Some(TapRecord { at: now, pos: p });
        }
    }

    fn maybe_start_momentum(&mut self, p: (f32, f32), now: Instant, fx: &mut Effects) {
        let recent = self
            .last_scroll_at
            .is_some_and(|at| now.duration_since(at) < FLICK_MAX_AGE);
        let (ldx, ldy) = self.last_scroll_delta;
        if recent && (ldx * ldx + ldy * ldy).sqrt() > FLICK_MIN_DELTA {
            self.momentum_seq += 1;
            self.momentum = Some(Momentum {
                vx: ldx * FLICK_VELOCITY_SCALE,
                vy: ldy * FLICK_VELOCITY_SCALE,
                anchor: (p.0 as i32, p.1 as i32),
            });
            fx.start_momentum = Some(self.momentum_seq);
        }
    }

    // ── Two-finger handling ───────────────────────────────────────────────

    fn on_two_finger(
        &mut self,
        sample: &TouchSample,
        second: (f32, f32),
        _now: Instant,
        fx: &mut Effects,
    ) {
        let a = self.to_screen(sample.x, sample.y);
        let b = self.to_screen(second.0, second.1);
        let dist = distance(a, b);
        let mid = midpoint(a, b);

        match sample.phase {
            TouchPhase::Down => {
                // Two-finger contact resets any one-finger gesture in flight.
                self.cancel_long_press();
                self.stop_momentum();
                self.state = GestureState::Idle;
                self.two = Some(TwoFingerTracking {
                    initial_dist: dist,
                    initial_mid:  mid,
                    last_dist:    dist,
                    last_mid:     mid,
                });
            }

            TouchPhase::Move => {
                let Some(mut two) = self.two else { return };
                match self.state {
                    GestureState::TwoFingerScroll => {
                        let dx = (mid.0 - two.last_mid.0) * SCROLL_SENSITIVITY;
                        let dy = (mid.1 - two.last_mid.1) * SCROLL_SENSITIVITY;
                        fx.actions.push(PointerAction::Scroll {
                            x: mid.0 as i32,
                            y: mid.1 as i32,
                            dx,
                            dy,
                        });
                    }
                    GestureState::Pinching => {
                        let delta = ((dist - two.last_dist) * 0.5).round() as i32;
                        if delta != 0 {
                            fx.actions.push(PointerAction::Zoom {
                                x: mid.0 as i32,
                                y: mid.1 as i32,
                                delta,
                            });
                        }
                    }
                    _ => {
                        // Undecided: spread wins over midpoint travel.
                        if (dist - two.initial_dist).abs() > PINCH_MIN_DISTANCE {
                            self.state = GestureState::Pinching;
                        } else if distance(mid, two.initial_mid) > TAP_MAX_DISTANCE {
                            self.state = GestureState::TwoFingerScroll;
                            let dx = (mid.0 - two.last_mid.0) * SCROLL_SENSITIVITY;
                            let dy = (mid.1 - two.last_mid.1) * SCROLL_SENSITIVITY;
                            fx.actions.push(PointerAction::Scroll {
                                x: mid.0 as i32,
                                y: mid.1 as i32,
                                dx,
                                dy,
                            });
                        }
                    }
                }
                two.last_dist = dist;
                two.last_mid = mid;
                self.two = Some(two);
            }

            TouchPhase::Up => {
                self.two = None;
                self.state = GestureState::Idle;
                self.press_at = None;
                self.last_move_at = None;
                self.last_scroll_at = None;
            }
        }
    }

    // ── Timer entry points ────────────────────────────────────────────────

    /// Long-press timer fired. Only promotes when the token is still current
    /// and the contact never left the tap radius (leaving Pending bumps the
    /// token).
    fn on_long_press(&mut self, token: u64) -> bool {
        if token != self.long_press_token || self.state != GestureState::Pending {
            return false;
        }
        self.state = GestureState::LongPressReady;
        true
    }

    /// One momentum tick: returns the scroll to emit, or `None` when the
    /// ticker should stop (decayed out, preempted, or superseded).
    fn on_momentum_tick(&mut self, seq: u64) -> Option<PointerAction> {
        if seq != self.momentum_seq {
            return None;
        }
        let momentum = self.momentum.as_mut()?;
        if momentum.vx.abs() < MOMENTUM_MIN_VELOCITY && momentum.vy.abs() < MOMENTUM_MIN_VELOCITY {
            self.momentum = None;
            return None;
        }
        let action = PointerAction::Scroll {
            x:  momentum.anchor.0,
            y:  momentum.anchor.1,
            dx: momentum.vx,
            dy: momentum.vy,
        };
        momentum.vx *= MOMENTUM_DECAY;
        momentum.vy *= MOMENTUM_DECAY;
        Some(action)
    }

    fn state(&self) -> GestureState {
        self.state
    }
}

// ── Recognizer shell ──────────────────────────────────────────────────────────

/// Thread-safe gesture recognizer driving a [`PointerSink`].
pub struct GestureRecognizer {
    core: Arc<Mutex<GestureCore>>,
    sink: Arc<dyn PointerSink>,
}

impl GestureRecognizer {
    pub fn new(bounds: DisplayBounds, sink: Arc<dyn PointerSink>) -> Self {
        sink.set_display_bounds(bounds);
        Self { core: Arc::new(Mutex::new(GestureCore::new(bounds))), sink }
    }

    /// Reconfigure the streamed display rectangle (client connect, layout
    /// change).
    pub fn set_display_bounds(&self, bounds: DisplayBounds) {
        self.core.lock().unwrap().bounds = bounds;
        self.sink.set_display_bounds(bounds);
    }

    pub fn state(&self) -> GestureState {
        self.core.lock().unwrap().state()
    }

    /// Feed one touch sample. Must be called from inside a tokio runtime
    /// (timers are spawned as tasks); samples must arrive in wire order.
    pub fn handle_sample(&self, sample: TouchSample) {
        let now = Instant::now();
        let fx = self.core.lock().unwrap().on_sample(&sample, now);
        trace!("gesture {:?} -> {} action(s)", sample.phase, fx.actions.len());

        for action in &fx.actions {
            apply(&*self.sink, action);
        }
        if let Some(token) = fx.start_long_press {
            self.spawn_long_press(token);
        }
        if let Some(seq) = fx.start_momentum {
            self.spawn_momentum(seq);
        }
    }

    fn spawn_long_press(&self, token: u64) {
        let core = Arc::clone(&self.core);
        let armed = Instant::now();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LONG_PRESS_POLL).await;
                let mut core = core.lock().unwrap();
                if token != core.long_press_token {
                    return; // cancelled
                }
                if armed.elapsed() >= LONG_PRESS_TIME {
                    core.on_long_press(token);
                    return;
                }
            }
        });
    }

    fn spawn_momentum(&self, seq: u64) {
        let core = Arc::clone(&self.core);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MOMENTUM_INTERVAL).await;
                let action = core.lock().unwrap().on_momentum_tick(seq);
                match action {
                    Some(action) => apply(&*sink, &action),
                    None => return,
                }
            }
        });
    }
}

fn apply(sink: &dyn PointerSink, action: &PointerAction) {
    match *action {
        PointerAction::Move { x, y } => sink.pointer_move(x, y),
        PointerAction::LeftDown => sink.left_down(),
        PointerAction::LeftUp => sink.left_up(),
        PointerAction::RightDown => sink.right_down(),
        PointerAction::RightUp => sink.right_up(),
        PointerAction::Scroll { x, y, dx, dy } => sink.scroll(x, y, dx, dy),
        PointerAction::DoubleClick { x, y } => sink.double_click(x, y),
        PointerAction::Zoom { x, y, delta } => sink.zoom(x, y, delta),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
