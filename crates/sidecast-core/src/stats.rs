//! Rolling throughput and frame-interval statistics.

use std::time::Instant;

// ── ThroughputWindow ──────────────────────────────────────────────────────────

/// Throughput over a rolling ~1 second window.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputReport {
    /// Frames per second over the window.
    pub fps: f32,
    /// Megabits per second over the window.
    pub mbps: f64,
}

/// Byte/frame counters with a window start time. Each call to
/// [`ThroughputWindow::record`] accumulates; once the elapsed window reaches
/// one second a report is emitted and the counters reset.
#[derive(Debug)]
pub struct ThroughputWindow {
    bytes:   u64,
    frames:  u64,
    started: Instant,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self { bytes: 0, frames: 0, started: now }
    }

    pub fn record(&mut self, bytes: usize) -> Option<ThroughputReport> {
        self.record_at(Instant::now(), bytes)
    }

    pub fn record_at(&mut self, now: Instant, bytes: usize) -> Option<ThroughputReport> {
        self.bytes += bytes as u64;
        self.frames += 1;

        let elapsed = now.duration_since(self.started).as_secs_f64();
        if elapsed < 1.0 {
            return None;
        }
        let report = ThroughputReport {
            fps:  (self.frames as f64 / elapsed) as f32,
            mbps: self.bytes as f64 * 8.0 / elapsed / 1e6,
        };
        self.reset_at(now);
        Some(report)
    }

    /// Restart the window, e.g. when a new client connects.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.bytes = 0;
        self.frames = 0;
        self.started = now;
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ── FrameIntervalStats ────────────────────────────────────────────────────────

/// Number of output frames per telemetry report.
pub const INTERVAL_WINDOW_FRAMES: usize = 60;

/// Mean / standard deviation of inter-frame deltas, reported every
/// [`INTERVAL_WINDOW_FRAMES`] output frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameIntervalReport {
    pub fps: f32,
    /// Standard deviation of inter-frame deltas, milliseconds.
    pub stddev_ms: f32,
}

#[derive(Debug, Default)]
pub struct FrameIntervalStats {
    last:      Option<Instant>,
    deltas_ms: Vec<f64>,
}

impl FrameIntervalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self) -> Option<FrameIntervalReport> {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> Option<FrameIntervalReport> {
        if let Some(last) = self.last.replace(now) {
            self.deltas_ms.push(now.duration_since(last).as_secs_f64() * 1e3);
        }
        if self.deltas_ms.len() < INTERVAL_WINDOW_FRAMES {
            return None;
        }

        let n = self.deltas_ms.len() as f64;
        let mean = self.deltas_ms.iter().sum::<f64>() / n;
        let variance = self
            .deltas_ms
            .iter()
            .map(|d| (d - mean) * (d - mean))
            .sum::<f64>()
            / n;
        self.deltas_ms.clear();

        Some(FrameIntervalReport {
            fps:       if mean > 0.0 { (1e3 / mean) as f32 } else { 0.0 },
            stddev_ms: variance.sqrt() as f32,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throughput_reports_after_one_second() {
        let start = Instant::now();
        let mut window = ThroughputWindow::starting_at(start);

        for i in 1..=59 {
            let at = start + Duration::from_millis(i * 16);
            assert!(window.record_at(at, 10_000).is_none());
        }
        // 60th frame lands past the 1 s mark.
        let report = window
            .record_at(start + Duration::from_millis(1_000), 10_000)
            .expect("window elapsed");
        assert!((report.fps - 60.0).abs() < 1.0, "fps={}", report.fps);
        // 600 kB in 1 s = 4.8 Mbit/s
        assert!((report.mbps - 4.8).abs() < 0.1, "mbps={}", report.mbps);
    }

    #[test]
    fn throughput_resets_after_report() {
        let start = Instant::now();
        let mut window = ThroughputWindow::starting_at(start);
        window
            .record_at(start + Duration::from_secs(1), 1_000_000)
            .expect("first report");
        // Counters restarted: the next frame alone should not report.
        assert!(window
            .record_at(start + Duration::from_millis(1_500), 1_000)
            .is_none());
    }

    #[test]
    fn interval_stats_report_every_60_frames() {
        let start = Instant::now();
        let mut stats = FrameIntervalStats::new();

        // 61 evenly spaced frames = 60 deltas of exactly 16 ms.
        let mut report = None;
        for i in 0..=60u64 {
            report = stats.record_at(start + Duration::from_millis(i * 16));
            if i < 60 {
                assert!(report.is_none(), "frame {i}");
            }
        }
        let report = report.expect("60 deltas accumulated");
        assert!((report.fps - 62.5).abs() < 0.1, "fps={}", report.fps);
        assert!(report.stddev_ms < 1e-6, "stddev={}", report.stddev_ms);
    }

    #[test]
    fn interval_stats_capture_jitter() {
        let start = Instant::now();
        let mut stats = FrameIntervalStats::new();
        let mut t = start;
        let mut report = None;
        for i in 0..=60u64 {
            report = stats.record_at(t);
            // Alternate 10 ms / 22 ms deltas: mean 16 ms, stddev 6 ms.
            t += Duration::from_millis(if i % 2 == 0 { 10 } else { 22 });
        }
        let report = report.expect("window full");
        assert!((report.stddev_ms - 6.0).abs() < 0.2, "stddev={}", report.stddev_ms);
    }
}
