//! Capture pump — drives a [`CaptureSource`] and feeds the encoder stage.
//!
//! ```text
//! CaptureSource ──next_frame──► CapturePump ──bounded mpsc──► encoder stage
//!                                   │ ▲
//!                      idle re-send │ │ pending_encodes (backpressure)
//!                                   ▼ │
//!                              last frame
//! ```
//!
//! Two jobs beyond forwarding:
//!
//! - **Backpressure.** While `pending_encodes ≥ 2` frames are dropped at the
//!   source instead of queueing behind a stalled encoder.
//! - **Idle re-send.** When the source produces nothing for two frame
//!   intervals, the most recent frame is re-delivered with a fresh timestamp.
//!   The client drops frames older than 50 ms, so an idle screen would
//!   otherwise stall the whole chain.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sidecast_core::backend::CaptureSource;
use sidecast_core::{clock, thread, RawFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Frames the encoder may have in flight before capture starts dropping.
pub const MAX_PENDING_ENCODES: u32 = 2;

// ── CapturePump ───────────────────────────────────────────────────────────────

/// Handle to a running capture pump task.
pub struct CapturePump {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl CapturePump {
    /// Start pumping `source` at `fps` into `out`.
    ///
    /// `pending_encodes` is shared with the encoder stage: the pump
    /// increments it when handing a frame over and refuses to exceed
    /// [`MAX_PENDING_ENCODES`]; the encoder stage decrements it per frame.
    pub fn spawn(
        source: Box<dyn CaptureSource>,
        fps: u32,
        pending_encodes: Arc<AtomicU32>,
        out: mpsc::Sender<RawFrame>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_pump(
            source,
            fps,
            pending_encodes,
            out,
            Arc::clone(&stop),
            Arc::clone(&dropped),
        ));
        Self { stop, task: Some(task), dropped }
    }

    /// Frames dropped at the source (backpressure), total.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Level-triggered stop; resolves once the pump task has exited.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            // The pump wakes at least every idle interval, so this is bounded.
            if tokio::time::timeout(Duration::from_millis(200), task).await.is_err() {
                debug!("capture pump did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

// ── Pump task ─────────────────────────────────────────────────────────────────

async fn run_pump(
    mut source: Box<dyn CaptureSource>,
    fps: u32,
    pending_encodes: Arc<AtomicU32>,
    out: mpsc::Sender<RawFrame>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    // Best-effort: the worker thread running this task gets display priority.
    thread::raise_current_thread_priority();

    let frame_interval = Duration::from_nanos(1_000_000_000 / fps.max(1) as u64);
    let idle_after = 2 * frame_interval;
    let self_paced = source.is_self_paced();

    let mut last_frame: Option<RawFrame> = None;
    let mut last_capture = Instant::now();

    info!(
        "capture pump running at {} fps ({}self-paced source)",
        fps,
        if self_paced { "" } else { "not " }
    );

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        // Pull-driven sources are paced here: sleep out the remainder of the
        // frame interval before asking for the next frame.
        if !self_paced {
            let elapsed = last_capture.elapsed();
            if elapsed < frame_interval {
                tokio::time::sleep(frame_interval - elapsed).await;
            }
        }

        match tokio::time::timeout(idle_after, source.next_frame()).await {
            Ok(Some(frame)) => {
                last_capture = Instant::now();
                last_frame = Some(frame.clone());
                forward(&pending_encodes, &out, &dropped, frame).await;
            }
            Ok(None) => {
                info!("capture source ended");
                break;
            }
            Err(_idle) => {
                // Nothing new for 2 × frame interval: keep downstream warm by
                // re-delivering the latest content with a fresh timestamp.
                if let Some(frame) = &last_frame {
                    trace!("idle re-send");
                    forward(
                        &pending_encodes,
                        &out,
                        &dropped,
                        frame.restamped(clock::now_ns()),
                    )
                    .await;
                }
            }
        }
    }

    source.stop();
    info!("capture pump stopped ({} frames dropped)", dropped.load(Ordering::Relaxed));
}

/// Hand one frame to the encoder stage, honoring backpressure.
async fn forward(
    pending_encodes: &AtomicU32,
    out: &mpsc::Sender<RawFrame>,
    dropped: &AtomicU64,
    frame: RawFrame,
) {
    if pending_encodes.load(Ordering::Acquire) >= MAX_PENDING_ENCODES {
        dropped.fetch_add(1, Ordering::Relaxed);
        trace!("frame dropped at source (encoder backpressured)");
        return;
    }
    pending_encodes.fetch_add(1, Ordering::AcqRel);
    if out.try_send(frame).is_err() {
        // Channel full or closed — undo the claim and drop.
        pending_encodes.fetch_sub(1, Ordering::AcqRel);
        dropped.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
