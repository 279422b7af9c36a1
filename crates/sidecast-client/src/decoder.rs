//! Decode stage — feeds a [`VideoDecoder`] backend with freshness and
//! pacing discipline.
//!
//! Ingestion order per frame:
//!
//! 1. **Stale drop** — anything older than 50 ms at ingest is discarded
//!    (counted); late frames would only push presentation further behind.
//! 2. **Submit** — the backend dequeues an input buffer with a short
//!    (~5 ms) timeout; `Busy` means decoder backpressure and the frame is
//!    dropped (counted).
//! 3. **Vsync release** — the presentation timestamp is rounded up to the
//!    next display refresh boundary so frames land jitter-free.
//!
//! The backend reports released output frames on a channel; every 60 of them
//! the stage emits `(fps, σ ms)` of the inter-frame deltas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sidecast_core::backend::{SubmitOutcome, VideoDecoder};
use sidecast_core::stats::FrameIntervalStats;
use sidecast_core::{clock, thread, DecoderConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames older than this at ingest are dropped.
pub const STALE_FRAME_MAX_AGE_NS: u64 = 50_000_000;

/// Round `now` up to the next vsync boundary of a display refreshing every
/// `interval_ns`.
pub fn next_vsync_ns(now_ns: u64, interval_ns: u64) -> u64 {
    (now_ns / interval_ns + 1) * interval_ns
}

pub type FrameStatsCallback = Arc<dyn Fn(f32, f32) + Send + Sync>;

enum Input {
    Frame { data: Bytes, rx_ns: u64 },
    Resize { width: u32, height: u32 },
}

// ── DecodeStage ───────────────────────────────────────────────────────────────

/// Handle to the running decode task.
pub struct DecodeStage {
    in_tx: Option<mpsc::Sender<Input>>,
    task:  Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl DecodeStage {
    /// Spawn the decode loop. `released_rx` is the backend's channel of
    /// released-output timestamps, used for telemetry.
    pub fn spawn(
        decoder: Box<dyn VideoDecoder>,
        released_rx: mpsc::Receiver<u64>,
        config: DecoderConfig,
        on_frame_stats: Option<FrameStatsCallback>,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(4);
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_stage(
            decoder,
            in_rx,
            released_rx,
            config,
            on_frame_stats,
            Arc::clone(&dropped),
        ));
        Self { in_tx: Some(in_tx), task: Some(task), dropped }
    }

    /// Queue one received frame (tagged with its receive timestamp). Drops
    /// on a full queue — the decoder is behind and late frames are useless.
    pub fn ingest(&self, data: Bytes, rx_ns: u64) {
        let Some(tx) = &self.in_tx else { return };
        if tx.try_send(Input::Frame { data, rx_ns }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reconfigure for new display dimensions. The codec session is only
    /// rebuilt when a dimension actually changed.
    pub fn update_resolution(&self, width: u32, height: u32) {
        if let Some(tx) = &self.in_tx {
            let _ = tx.try_send(Input::Resize { width, height });
        }
    }

    /// Frames dropped for any reason (stale, busy backend, full queue).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the input and wait for the task to drain.
    pub async fn stop(&mut self) {
        self.in_tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

// ── Stage task ────────────────────────────────────────────────────────────────

async fn run_stage(
    mut decoder: Box<dyn VideoDecoder>,
    mut in_rx: mpsc::Receiver<Input>,
    mut released_rx: mpsc::Receiver<u64>,
    config: DecoderConfig,
    on_frame_stats: Option<FrameStatsCallback>,
    dropped: Arc<AtomicU64>,
) {
    // Decode runs at display priority, best effort.
    thread::raise_current_thread_priority();

    let interval_ns = 1_000_000_000 / config.refresh_rate.max(1) as u64;
    let mut dims = (config.width, config.height);
    let mut intervals = FrameIntervalStats::new();
    let mut released_open = true;

    info!(
        "decode stage running ({}, {}×{}, {} Hz)",
        decoder.name(),
        dims.0,
        dims.1,
        config.refresh_rate
    );

    loop {
        tokio::select! {
            maybe_input = in_rx.recv() => {
                let Some(input) = maybe_input else { break };
                match input {
                    Input::Frame { data, rx_ns } => {
                        let now = clock::now_ns();
                        if now.saturating_sub(rx_ns) > STALE_FRAME_MAX_AGE_NS {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("stale frame dropped ({} ms old)", (now - rx_ns) / 1_000_000);
                            continue;
                        }
                        let present_at = next_vsync_ns(now, interval_ns);
                        match decoder.decode(&data, rx_ns, present_at) {
                            Ok(SubmitOutcome::Accepted) => {}
                            Ok(SubmitOutcome::Busy) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                debug!("decoder busy, frame dropped");
                            }
                            Err(e) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("decode failed: {}", e);
                            }
                        }
                    }
                    Input::Resize { width, height } => {
                        if (width, height) != dims {
                            info!("decoder reconfigure {}×{} -> {}×{}", dims.0, dims.1, width, height);
                            match decoder.update_resolution(width, height) {
                                Ok(()) => dims = (width, height),
                                Err(e) => warn!("decoder reconfigure failed: {}", e),
                            }
                        }
                    }
                }
            }

            maybe_released = released_rx.recv(), if released_open => {
                match maybe_released {
                    Some(_) => {
                        if let Some(report) = intervals.record() {
                            if let Some(cb) = &on_frame_stats {
                                cb(report.fps, report.stddev_ms);
                            }
                        }
                    }
                    None => released_open = false,
                }
            }
        }
    }

    info!(
        "decode stage stopped ({} dropped)",
        dropped.load(Ordering::Relaxed)
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sidecast_core::DecodeError;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn vsync_rounds_up_to_the_next_boundary() {
        let interval = 16_666_666u64; // 60 Hz
        assert_eq!(next_vsync_ns(0, interval), interval);
        assert_eq!(next_vsync_ns(1, interval), interval);
        assert_eq!(next_vsync_ns(interval - 1, interval), interval);
        // Exactly on a boundary still schedules the *next* one.
        assert_eq!(next_vsync_ns(interval, interval), 2 * interval);
        assert_eq!(next_vsync_ns(interval + 1, interval), 2 * interval);
    }

    #[derive(Default)]
    struct MockState {
        submits: Vec<(u64, u64)>,
        resizes: Vec<(u32, u32)>,
    }

    struct MockDecoder {
        state: Arc<Mutex<MockState>>,
        busy:  bool,
    }

    impl VideoDecoder for MockDecoder {
        fn decode(
            &mut self,
            _data: &Bytes,
            pts_ns: u64,
            present_at_ns: u64,
        ) -> Result<SubmitOutcome, DecodeError> {
            if self.busy {
                return Ok(SubmitOutcome::Busy);
            }
            self.state.lock().unwrap().submits.push((pts_ns, present_at_ns));
            Ok(SubmitOutcome::Accepted)
        }

        fn update_resolution(&mut self, width: u32, height: u32) -> Result<(), DecodeError> {
            self.state.lock().unwrap().resizes.push((width, height));
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn stage_with(
        busy: bool,
    ) -> (DecodeStage, Arc<Mutex<MockState>>, mpsc::Sender<u64>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (released_tx, released_rx) = mpsc::channel(256);
        let stage = DecodeStage::spawn(
            Box::new(MockDecoder { state: Arc::clone(&state), busy }),
            released_rx,
            DecoderConfig::low_latency(1920, 1200, 60),
            None,
        );
        (stage, state, released_tx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_frames_are_submitted_with_vsync_pts() {
        let (mut stage, state, _released) = stage_with(false);

        let rx_ns = clock::now_ns();
        stage.ingest(Bytes::from_static(b"au"), rx_ns);
        tokio::time::sleep(Duration::from_millis(50)).await;
        stage.stop().await;

        let state = state.lock().unwrap();
        assert_eq!(state.submits.len(), 1);
        let (pts, present_at) = state.submits[0];
        assert_eq!(pts, rx_ns, "original timestamp preserved as PTS");
        assert_eq!(present_at % 16_666_666, 0, "release lands on a vsync boundary");
        assert!(present_at > rx_ns);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_frames_never_reach_the_backend() {
        let (mut stage, state, _released) = stage_with(false);

        let stale_rx = clock::now_ns().saturating_sub(STALE_FRAME_MAX_AGE_NS + 10_000_000);
        stage.ingest(Bytes::from_static(b"old"), stale_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(state.lock().unwrap().submits.len(), 0);
        assert_eq!(stage.dropped(), 1);
        stage.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_backend_drops_and_counts() {
        let (mut stage, state, _released) = stage_with(true);

        stage.ingest(Bytes::from_static(b"au"), clock::now_ns());
        stage.ingest(Bytes::from_static(b"au"), clock::now_ns());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(state.lock().unwrap().submits.len(), 0);
        assert_eq!(stage.dropped(), 2);
        stage.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resize_rebuilds_only_on_change() {
        let (mut stage, state, _released) = stage_with(false);

        stage.update_resolution(1920, 1200); // same as configured — no-op
        stage.update_resolution(1200, 1920); // rotation swapped dims
        stage.update_resolution(1200, 1920); // repeat — no-op
        tokio::time::sleep(Duration::from_millis(50)).await;
        stage.stop().await;

        assert_eq!(state.lock().unwrap().resizes, vec![(1200, 1920)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn telemetry_fires_every_60_released_frames() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (released_tx, released_rx) = mpsc::channel(256);
        let reports = Arc::new(AtomicU64::new(0));
        let reports_cb = Arc::clone(&reports);
        let mut stage = DecodeStage::spawn(
            Box::new(MockDecoder { state, busy: false }),
            released_rx,
            DecoderConfig::low_latency(1920, 1200, 60),
            Some(Arc::new(move |_fps, _stddev| {
                reports_cb.fetch_add(1, Ordering::Relaxed);
            })),
        );

        for i in 0..=60u64 {
            released_tx.send(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reports.load(Ordering::Relaxed), 1);
        stage.stop().await;
    }
}
