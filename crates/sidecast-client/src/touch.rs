//! Touch sampler — turns presenter-window pointer events into normalized
//! [`TouchSample`]s for the wire.
//!
//! Coordinates are normalized against the presented surface size and clamped
//! to [0, 1]. Move samples are coalesced to the display refresh period so a
//! high-rate input device cannot flood the touch channel.

use std::time::{Duration, Instant};

use sidecast_core::{TouchPhase, TouchSample};
use tracing::trace;

/// A pointer event from the presenter window, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerInput {
    Down { x: f64, y: f64 },
    Move { x: f64, y: f64 },
    Up { x: f64, y: f64 },
}

pub struct TouchSampler {
    width:  f64,
    height: f64,
    /// Minimum spacing between forwarded move samples.
    min_move_interval: Duration,
    pressed:   bool,
    last_move: Option<Instant>,
}

impl TouchSampler {
    pub fn new(width: u32, height: u32, refresh_rate: u32) -> Self {
        Self {
            width:  width.max(1) as f64,
            height: height.max(1) as f64,
            min_move_interval: Duration::from_micros(1_000_000 / refresh_rate.max(1) as u64),
            pressed: false,
            last_move: None,
        }
    }

    /// Update the presented surface size (window resize, rotation).
    pub fn set_surface_size(&mut self, width: u32, height: u32) {
        self.width = width.max(1) as f64;
        self.height = height.max(1) as f64;
    }

    pub fn on_input(&mut self, input: PointerInput) -> Option<TouchSample> {
        self.on_input_at(input, Instant::now())
    }

    pub fn on_input_at(&mut self, input: PointerInput, now: Instant) -> Option<TouchSample> {
        match input {
            PointerInput::Down { x, y } => {
                self.pressed = true;
                self.last_move = None;
                Some(self.sample(x, y, TouchPhase::Down))
            }
            PointerInput::Move { x, y } => {
                // Hover without contact is not a touch.
                if !self.pressed {
                    return None;
                }
                if let Some(last) = self.last_move {
                    if now.duration_since(last) < self.min_move_interval {
                        trace!("move coalesced");
                        return None;
                    }
                }
                self.last_move = Some(now);
                Some(self.sample(x, y, TouchPhase::Move))
            }
            PointerInput::Up { x, y } => {
                if !self.pressed {
                    return None;
                }
                self.pressed = false;
                Some(self.sample(x, y, TouchPhase::Up))
            }
        }
    }

    fn sample(&self, x: f64, y: f64, phase: TouchPhase) -> TouchSample {
        let nx = (x / self.width).clamp(0.0, 1.0) as f32;
        let ny = (y / self.height).clamp(0.0, 1.0) as f32;
        TouchSample::single(nx, ny, phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_clamps() {
        let mut sampler = TouchSampler::new(1920, 1080, 60);
        let sample = sampler.on_input(PointerInput::Down { x: 960.0, y: 540.0 }).unwrap();
        assert!((sample.x - 0.5).abs() < 1e-6);
        assert!((sample.y - 0.5).abs() < 1e-6);
        assert_eq!(sample.phase, TouchPhase::Down);

        let sample = sampler.on_input(PointerInput::Up { x: -20.0, y: 5000.0 }).unwrap();
        assert_eq!(sample.x, 0.0);
        assert_eq!(sample.y, 1.0);
    }

    #[test]
    fn hover_moves_are_ignored() {
        let mut sampler = TouchSampler::new(1920, 1080, 60);
        assert!(sampler.on_input(PointerInput::Move { x: 10.0, y: 10.0 }).is_none());
        assert!(sampler.on_input(PointerInput::Up { x: 10.0, y: 10.0 }).is_none());
    }

    #[test]
    fn moves_are_coalesced_to_the_refresh_period() {
        let mut sampler = TouchSampler::new(1000, 1000, 60);
        let t0 = Instant::now();
        assert!(sampler
            .on_input_at(PointerInput::Down { x: 0.0, y: 0.0 }, t0)
            .is_some());

        // First move always passes.
        assert!(sampler
            .on_input_at(PointerInput::Move { x: 10.0, y: 0.0 }, t0 + Duration::from_millis(1))
            .is_some());
        // 4 ms later: inside the ~16.6 ms refresh period, coalesced.
        assert!(sampler
            .on_input_at(PointerInput::Move { x: 20.0, y: 0.0 }, t0 + Duration::from_millis(5))
            .is_none());
        // 17 ms after the forwarded move: passes.
        assert!(sampler
            .on_input_at(PointerInput::Move { x: 30.0, y: 0.0 }, t0 + Duration::from_millis(18))
            .is_some());
        // Up always passes regardless of spacing.
        assert!(sampler
            .on_input_at(PointerInput::Up { x: 30.0, y: 0.0 }, t0 + Duration::from_millis(19))
            .is_some());
    }
}
