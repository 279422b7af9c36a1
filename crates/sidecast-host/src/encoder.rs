//! Encoder stage — single driver task feeding a [`VideoEncoder`] backend.
//!
//! Raw frames arrive from the capture pump on a bounded channel; encoded
//! output leaves through the channel the backend factory handed out. The
//! shared pending-encode counter is decremented here, once per ingested
//! frame, which is what lets the capture pump see encoder backpressure.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use sidecast_core::backend::{EncoderUpdate, VideoEncoder};
use sidecast_core::RawFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── EncoderStage ──────────────────────────────────────────────────────────────

/// Handle to the running encoder task.
pub struct EncoderStage {
    control_tx: mpsc::UnboundedSender<EncoderUpdate>,
    task: Option<JoinHandle<()>>,
    encoded: Arc<AtomicU64>,
    failed:  Arc<AtomicU64>,
}

impl EncoderStage {
    /// Spawn the encode loop. The stage drains `frames` until the channel
    /// closes (capture pump stopped), then flushes the backend.
    pub fn spawn(
        encoder: Box<dyn VideoEncoder>,
        frames: mpsc::Receiver<RawFrame>,
        pending_encodes: Arc<AtomicU32>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let encoded = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_stage(
            encoder,
            frames,
            control_rx,
            pending_encodes,
            Arc::clone(&encoded),
            Arc::clone(&failed),
        ));
        Self { control_tx, task: Some(task), encoded, failed }
    }

    /// Apply a live settings update (bitrate / quality / gaming boost).
    pub fn update_settings(&self, update: EncoderUpdate) {
        let _ = self.control_tx.send(update);
    }

    /// Frames successfully submitted to the backend.
    pub fn frames_encoded(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    /// Frames the backend rejected (dropped, counted).
    pub fn frames_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait for the stage to finish draining. The input channel must already
    /// be closed (stop the capture pump first).
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

// ── Stage task ────────────────────────────────────────────────────────────────

async fn run_stage(
    mut encoder: Box<dyn VideoEncoder>,
    mut frames: mpsc::Receiver<RawFrame>,
    mut control_rx: mpsc::UnboundedReceiver<EncoderUpdate>,
    pending_encodes: Arc<AtomicU32>,
    encoded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    info!("encoder stage running ({})", encoder.name());
    let mut control_open = true;

    loop {
        tokio::select! {
            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else {
                    break;
                };
                match encoder.encode(&frame) {
                    Ok(()) => {
                        encoded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        warn!("encode failed, frame dropped: {}", e);
                    }
                }
                // The capture pump claimed a slot for this frame; release it
                // now that the backend has taken (or refused) the input.
                pending_encodes.fetch_sub(1, Ordering::AcqRel);
            }

            maybe_update = control_rx.recv(), if control_open => {
                match maybe_update {
                    Some(update) => match encoder.update_settings(&update) {
                        Ok(()) => debug!("encoder settings updated: {:?}", update),
                        Err(e) => warn!("encoder settings update failed: {}", e),
                    },
                    None => control_open = false,
                }
            }
        }
    }

    if let Err(e) = encoder.flush() {
        warn!("encoder flush failed: {}", e);
    }
    info!(
        "encoder stage stopped ({} encoded, {} failed)",
        encoded.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed)
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────────
