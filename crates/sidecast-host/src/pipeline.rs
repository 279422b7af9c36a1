//! `HostPipeline` — wires capture → encode → server and touch → gesture →
//! inject, owns every stage's lifetime.
//!
//! ```text
//! CaptureSource → CapturePump → EncoderStage → StreamServer ══socket══► client
//!                     ▲ pending_encodes ▲            │
//!                     └──────────────────┘       TOUCH_EVENT
//!                                                    ▼
//!                                  PointerSink ◄ GestureRecognizer
//! ```
//!
//! Start order: ADB helper (best effort) → encoder from capture dimensions →
//! server → injector wiring → capture pump → listen → reverse forward. Any
//! failure rolls back the stages already running and surfaces a
//! [`PipelineError`]. Stop reverses the order and joins every task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sidecast_core::backend::{CaptureSource, EncoderUpdate, PointerSink, VideoEncoder};
use sidecast_core::{
    DisplayBounds, DisplayConfig, EncodeError, EncodedFrame, EncoderConfig, PipelineError,
    Rotation, StreamSettings,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adb::AdbForwarder;
use crate::capture::CapturePump;
use crate::encoder::EncoderStage;
use crate::gesture::GestureRecognizer;
use crate::server::{ServerCallbacks, StreamServer};

// ── Status ────────────────────────────────────────────────────────────────────

/// Lifecycle state of the host pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Starting,
    Streaming,
    Stopped,
    Failed(String),
}

/// Live status update pushed to the UI / CLI via an mpsc channel.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state:            PipelineState,
    pub fps:              f32,
    pub mbps:             f64,
    pub client_connected: bool,
}

// ── HostPipeline ──────────────────────────────────────────────────────────────

/// Running host pipeline. Dropping it does not stop the stages — call
/// [`HostPipeline::stop`].
pub struct HostPipeline {
    settings: StreamSettings,
    server:   Arc<StreamServer>,
    pump:     CapturePump,
    encoder:  EncoderStage,
    forward:  Option<JoinHandle<()>>,
    gesture:  Arc<GestureRecognizer>,
    adb:      AdbForwarder,
    reverse_active: bool,
}

impl HostPipeline {
    /// Start streaming.
    ///
    /// `capture` is an initialized source for the streamed display (virtual
    /// or primary — the platform factory decided). `make_encoder` builds the
    /// encoder session sized from the capture dimensions and hands back its
    /// output channel. `sink` receives the gesture machine's pointer
    /// commands.
    pub async fn start(
        settings: StreamSettings,
        capture: Box<dyn CaptureSource>,
        make_encoder: impl FnOnce(
            &EncoderConfig,
        )
            -> Result<(Box<dyn VideoEncoder>, mpsc::Receiver<EncodedFrame>), EncodeError>,
        sink: Arc<dyn PointerSink>,
        status_tx: mpsc::Sender<PipelineStatus>,
    ) -> Result<Self, PipelineError> {
        let _ = status_tx.try_send(PipelineStatus {
            state: PipelineState::Starting,
            fps: 0.0,
            mbps: 0.0,
            client_connected: false,
        });

        // 1. Port-forward helper, best effort.
        let adb = AdbForwarder::locate();

        // 2. Encoder sized from what the capture source actually delivers.
        let (width, height) = (capture.width(), capture.height());
        if width == 0 || height == 0 {
            return Err(PipelineError::Config {
                reason: format!("capture reports {width}×{height}"),
            });
        }
        let mut encoder_config = EncoderConfig::low_latency(
            width,
            height,
            settings.fps,
            settings.bitrate_mbps,
            settings.quality.factor(),
        );
        encoder_config.gaming_boost = settings.gaming_boost;
        let (encoder, encoded_rx) = make_encoder(&encoder_config)?;
        info!("encoder ready ({}×{} @ {} fps)", width, height, settings.fps);

        // 3. Gesture machine over the injector. The streamed display's
        //    bounds default to its own extent; the caller can move them.
        let bounds = DisplayBounds::new(0, 0, width, height);
        let gesture = Arc::new(GestureRecognizer::new(bounds, sink));

        // 4. Server with callbacks wired to gesture + status.
        let touch_gesture = Arc::clone(&gesture);
        let conn_gesture = Arc::clone(&gesture);
        let conn_status = status_tx.clone();
        let stats_status = status_tx.clone();
        let callbacks = ServerCallbacks {
            on_touch: Some(Arc::new(move |sample| touch_gesture.handle_sample(sample))),
            on_connection: Some(Arc::new(move |connected| {
                if connected {
                    conn_gesture.set_display_bounds(bounds);
                }
                let _ = conn_status.try_send(PipelineStatus {
                    state: PipelineState::Streaming,
                    fps: 0.0,
                    mbps: 0.0,
                    client_connected: connected,
                });
            })),
            on_stats: Some(Arc::new(move |fps, mbps| {
                let _ = stats_status.try_send(PipelineStatus {
                    state: PipelineState::Streaming,
                    fps,
                    mbps,
                    client_connected: true,
                });
            })),
        };
        let display = DisplayConfig::new(width, height, Rotation::Deg0);
        let server = Arc::new(StreamServer::new(display, callbacks));

        // 5. Stages: encode behind capture, frames forwarded to the socket.
        let pending = Arc::new(AtomicU32::new(0));
        let (raw_tx, raw_rx) = mpsc::channel(2);
        let encoder_stage = EncoderStage::spawn(encoder, raw_rx, Arc::clone(&pending));
        let mut pump = CapturePump::spawn(capture, settings.fps, pending, raw_tx);

        let forward_server = Arc::clone(&server);
        let forward = tokio::spawn(forward_frames(encoded_rx, forward_server));

        // 6. Listen. A bind failure rolls the stages back.
        if let Err(e) = server.start(settings.port).await {
            warn!("server start failed, rolling back: {}", e);
            pump.stop().await;
            forward.abort();
            return Err(PipelineError::Server(e));
        }

        // 7. USB reverse forward, non-fatal.
        let mut reverse_active = false;
        if adb.is_available() && adb.is_device_connected().await {
            reverse_active = adb.setup_reverse(settings.port).await;
            info!(
                "adb reverse tcp:{} {}",
                settings.port,
                if reverse_active { "active" } else { "failed (continuing)" }
            );
        }

        let _ = status_tx.try_send(PipelineStatus {
            state: PipelineState::Streaming,
            fps: 0.0,
            mbps: 0.0,
            client_connected: false,
        });
        info!("host pipeline streaming on port {}", settings.port);

        Ok(Self {
            settings,
            server,
            pump,
            encoder: encoder_stage,
            forward: Some(forward),
            gesture,
            adb,
            reverse_active,
        })
    }

    /// Apply live encoder settings (bitrate / quality / gaming boost).
    pub fn update_settings(&self, update: EncoderUpdate) {
        self.encoder.update_settings(update);
    }

    /// Announce a rotation change to the client.
    pub async fn update_rotation(&self, rotation: Rotation) {
        self.server.update_rotation(rotation).await;
    }

    /// Move the streamed display inside the host desktop (denormalization
    /// origin for touch input).
    pub fn set_display_bounds(&self, bounds: DisplayBounds) {
        self.gesture.set_display_bounds(bounds);
    }

    pub fn is_client_connected(&self) -> bool {
        self.server.is_client_connected()
    }

    /// Stop every stage in reverse start order and join the tasks.
    pub async fn stop(mut self) {
        self.pump.stop().await;
        // The raw-frame channel closed with the pump; the encoder drains and
        // flushes, which in turn closes the encoded-frame channel.
        self.encoder.join().await;
        if let Some(forward) = self.forward.take() {
            let _ = forward.await;
        }
        self.server.stop().await;
        if self.reverse_active {
            self.adb.remove_reverse(self.settings.port).await;
        }
        info!("host pipeline stopped");
    }
}

/// Forward encoded frames from the backend channel onto the socket.
async fn forward_frames(mut encoded_rx: mpsc::Receiver<EncodedFrame>, server: Arc<StreamServer>) {
    while let Some(frame) = encoded_rx.recv().await {
        server.send_frame(frame.data).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use sidecast_core::{wire, PixelFormat, RawFrame};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Source that produces a small frame at its own 60 fps cadence.
    struct TickingSource {
        interval: tokio::time::Interval,
    }

    #[async_trait]
    impl CaptureSource for TickingSource {
        async fn next_frame(&mut self) -> Option<RawFrame> {
            self.interval.tick().await;
            Some(RawFrame {
                data: Bytes::from_static(&[7u8; 64]),
                width: 32,
                height: 32,
                stride: 128,
                format: PixelFormat::Bgra,
                timestamp_ns: sidecast_core::clock::now_ns(),
            })
        }
        fn width(&self) -> u32 {
            32
        }
        fn height(&self) -> u32 {
            32
        }
    }

    /// Encoder that wraps each raw frame into a recognizable payload.
    struct PassthroughEncoder {
        out: mpsc::Sender<EncodedFrame>,
    }

    impl VideoEncoder for PassthroughEncoder {
        fn encode(&mut self, frame: &RawFrame) -> Result<(), EncodeError> {
            let _ = self.out.try_send(EncodedFrame {
                data: Bytes::from_static(b"unit-bitstream"),
                timestamp_ns: frame.timestamp_ns,
                is_keyframe: true,
            });
            Ok(())
        }
        fn update_settings(&mut self, _update: &EncoderUpdate) -> Result<(), EncodeError> {
            Ok(())
        }
        fn flush(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    struct NullSink;
    impl PointerSink for NullSink {
        fn set_display_bounds(&self, _bounds: DisplayBounds) {}
        fn pointer_move(&self, _x: i32, _y: i32) {}
        fn left_down(&self) {}
        fn left_up(&self) {}
        fn right_down(&self) {}
        fn right_up(&self) {}
        fn scroll(&self, _x: i32, _y: i32, _dx: f32, _dy: f32) {}
        fn double_click(&self, _x: i32, _y: i32) {}
        fn zoom(&self, _x: i32, _y: i32, _delta: i32) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_to_end_config_then_frames() {
        let mut settings = StreamSettings::default();
        settings.port = 0;
        settings.fps = 60;

        let capture = Box::new(TickingSource {
            interval: tokio::time::interval(Duration::from_millis(16)),
        });
        let (status_tx, _status_rx) = mpsc::channel(16);
        let pipeline = HostPipeline::start(
            settings,
            capture,
            |_config| {
                let (tx, rx) = mpsc::channel(16);
                Ok((Box::new(PassthroughEncoder { out: tx }) as Box<dyn VideoEncoder>, rx))
            },
            Arc::new(NullSink),
            status_tx,
        )
        .await
        .expect("pipeline starts");

        let port = pipeline.server.local_port().expect("bound");
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();

        // First message is the display config with the capture dimensions.
        let first = loop {
            if let Some(msg) = wire::decode(&mut buf).expect("valid stream") {
                break msg;
            }
            assert!(client.read_buf(&mut buf).await.expect("read") > 0);
        };
        match first {
            wire::Message::DisplayConfig(config) => {
                assert_eq!((config.width, config.height), (32, 32));
            }
            other => panic!("expected config first, got {other:?}"),
        }

        // Then a steady stream of video frames.
        let mut frames = 0;
        while frames < 5 {
            match wire::decode(&mut buf).expect("valid stream") {
                Some(wire::Message::VideoFrame(data)) => {
                    assert_eq!(&data[..], b"unit-bitstream");
                    frames += 1;
                }
                Some(other) => panic!("unexpected message {other:?}"),
                None => {
                    assert!(client.read_buf(&mut buf).await.expect("read") > 0);
                }
            }
        }

        drop(client);
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encoder_failure_surfaces_config_error() {
        let capture = Box::new(TickingSource {
            interval: tokio::time::interval(Duration::from_millis(16)),
        });
        let (status_tx, _status_rx) = mpsc::channel(16);
        let result = HostPipeline::start(
            StreamSettings::default(),
            capture,
            |_config| Err(EncodeError::Unavailable("no hevc encoder".into())),
            Arc::new(NullSink),
            status_tx,
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Encode(_))));
    }
}
