//! TCP streaming client — the device end of the wire.
//!
//! A reader task decodes VIDEO_FRAME / DISPLAY_CONFIG / PONG and tags every
//! frame with its receive timestamp. Touch events and pings leave through a
//! dedicated single-thread sender running on its own raised-priority OS
//! thread, so input latency is isolated from decode and render work. Any
//! socket failure (either direction) or protocol violation ends the session;
//! there is no resynchronization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sidecast_core::stats::ThroughputWindow;
use sidecast_core::wire::{self, Message};
use sidecast_core::{clock, thread, DisplayConfig, StreamError, TouchSample};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence of the automatic latency probe.
const PING_INTERVAL: Duration = Duration::from_secs(1);

// ── Callbacks ─────────────────────────────────────────────────────────────────

pub type FrameCallback = Arc<dyn Fn(Bytes, u64) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type DisplayConfigCallback = Arc<dyn Fn(DisplayConfig) + Send + Sync>;
pub type StatsCallback = Arc<dyn Fn(f32, f64) + Send + Sync>;
pub type LatencyCallback = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClientCallbacks {
    /// `(frame bytes, receive timestamp ns)` — forward to the decode stage.
    pub on_frame:          Option<FrameCallback>,
    pub on_connection:     Option<ConnectionCallback>,
    pub on_display_config: Option<DisplayConfigCallback>,
    /// `(frames per second, megabits per second)` received.
    pub on_stats:          Option<StatsCallback>,
    /// PING → PONG round-trip time.
    pub on_latency:        Option<LatencyCallback>,
}

// ── Internal state ────────────────────────────────────────────────────────────

enum Outbound {
    Touch(TouchSample),
    Ping([u8; 8]),
}

struct ClientShared {
    outbound:  std::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
    connected: AtomicBool,
    callbacks: ClientCallbacks,
}

impl ClientShared {
    /// Idempotent teardown: drops the sender (which ends the touch thread
    /// and closes the write half) and fires the callback once.
    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("session ended: {}", reason);
            self.outbound.lock().unwrap().take();
            if let Some(cb) = &self.callbacks.on_connection {
                cb(false);
            }
        }
    }
}

// ── StreamClient ──────────────────────────────────────────────────────────────

/// Connected client session. Create with [`StreamClient::connect`].
pub struct StreamClient {
    shared: Arc<ClientShared>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Connect to `host:port` (TCP_NODELAY) and start the receive loop, the
    /// touch sender thread, and the 1 Hz latency probe.
    pub async fn connect(
        host: &str,
        port: u16,
        callbacks: ClientCallbacks,
    ) -> Result<Self, StreamError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        info!("connected to {}", peer);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
        let shared = Arc::new(ClientShared {
            outbound: std::sync::Mutex::new(Some(outbound_tx.clone())),
            connected: AtomicBool::new(true),
            callbacks,
        });

        spawn_sender_thread(outbound_rx, writer, Arc::clone(&shared));

        // Latency probe. Ends once the outbound channel is gone.
        let ping_tx = outbound_tx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let timestamp = clock::now_ns().to_le_bytes();
                if ping_tx.send(Outbound::Ping(timestamp)).await.is_err() {
                    return;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            receive_loop(reader_shared, reader).await;
        });

        if let Some(cb) = &shared.callbacks.on_connection {
            cb(true);
        }

        Ok(Self { shared, reader_task: std::sync::Mutex::new(Some(reader_task)) })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queue a touch sample on the input path. Dropped (with a debug log)
    /// when the sender queue is full — input must never block the reader.
    pub fn send_touch(&self, sample: TouchSample) {
        let guard = self.shared.outbound.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(Outbound::Touch(sample)).is_err() {
                debug!("touch queue full, sample dropped");
            }
        }
    }

    /// Queue an explicit latency probe (the automatic one runs at 1 Hz).
    pub fn send_ping(&self) {
        let guard = self.shared.outbound.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(Outbound::Ping(clock::now_ns().to_le_bytes()));
        }
    }

    /// Tear the session down.
    pub async fn disconnect(&self) {
        self.shared.mark_disconnected("disconnect requested");
        let task = self.reader_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

// ── Touch sender thread ───────────────────────────────────────────────────────

/// Dedicated single-thread executor for the input path. The thread asks for
/// display-class priority (best effort) and does nothing but serialize and
/// write outbound messages.
fn spawn_sender_thread(
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut writer: OwnedWriteHalf,
    shared: Arc<ClientShared>,
) {
    let result = std::thread::Builder::new()
        .name("sidecast-touch".into())
        .spawn(move || {
            thread::raise_current_thread_priority();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("touch sender runtime");
            runtime.block_on(async move {
                while let Some(outbound) = outbound_rx.recv().await {
                    let bytes = match outbound {
                        Outbound::Touch(sample) => Message::Touch(sample).encode(),
                        Outbound::Ping(timestamp) => Message::Ping(timestamp).encode(),
                    };
                    if let Err(e) = writer.write_all(&bytes).await {
                        shared.mark_disconnected(&format!("send failed: {e}"));
                        return;
                    }
                }
                // Channel closed on teardown: push out a FIN.
                let _ = writer.shutdown().await;
            });
        });
    if let Err(e) = result {
        warn!("touch sender thread failed to start: {}", e);
    }
}

// ── Receive path ──────────────────────────────────────────────────────────────

async fn receive_loop(shared: Arc<ClientShared>, mut reader: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(256 * 1024);
    let mut stats = ThroughputWindow::new();

    loop {
        match wire::decode(&mut buf) {
            Ok(Some(message)) => match message {
                Message::VideoFrame(data) => {
                    let rx_ns = clock::now_ns();
                    if let Some(report) = stats.record(5 + data.len()) {
                        if let Some(cb) = &shared.callbacks.on_stats {
                            cb(report.fps, report.mbps);
                        }
                    }
                    if let Some(cb) = &shared.callbacks.on_frame {
                        cb(data, rx_ns);
                    }
                }
                Message::DisplayConfig(config) => {
                    info!("display config: {}", config);
                    if let Some(cb) = &shared.callbacks.on_display_config {
                        cb(config);
                    }
                }
                Message::Pong(timestamp) => {
                    let sent_ns = u64::from_le_bytes(timestamp);
                    let rtt = clock::now_ns().saturating_sub(sent_ns);
                    if let Some(cb) = &shared.callbacks.on_latency {
                        cb(Duration::from_nanos(rtt));
                    }
                }
                other => {
                    shared.mark_disconnected(&format!(
                        "unexpected client-bound message {other:?}"
                    ));
                    return;
                }
            },
            Ok(None) => match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    shared.mark_disconnected("server closed");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.mark_disconnected(&format!("read error: {e}"));
                    return;
                }
            },
            Err(e) => {
                // Includes frames above 5 MiB: fatal on the client side.
                shared.mark_disconnected(&format!("protocol violation: {e}"));
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sidecast_core::wire::MAX_FRAME_BYTES;
    use sidecast_core::{DisplayConfig, Rotation, TouchPhase};
    use sidecast_host::server::{ServerCallbacks, StreamServer};
    use tokio::net::TcpListener;

    async fn host_server(
        touches: mpsc::UnboundedSender<TouchSample>,
    ) -> (StreamServer, u16) {
        let server = StreamServer::new(
            DisplayConfig::new(1920, 1200, Rotation::Deg0),
            ServerCallbacks {
                on_touch: Some(Arc::new(move |s| {
                    let _ = touches.send(s);
                })),
                ..Default::default()
            },
        );
        server.start(0).await.expect("server start");
        let port = server.local_port().unwrap();
        (server, port)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_session_frames_touch_and_latency() {
        let (touch_tx, mut touches) = mpsc::unbounded_channel();
        let (server, port) = host_server(touch_tx).await;

        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        let (config_tx, mut configs) = mpsc::unbounded_channel();
        let (latency_tx, mut latencies) = mpsc::unbounded_channel();
        let client = StreamClient::connect(
            "127.0.0.1",
            port,
            ClientCallbacks {
                on_frame: Some(Arc::new(move |data, rx_ns| {
                    let _ = frame_tx.send((data, rx_ns));
                })),
                on_display_config: Some(Arc::new(move |c| {
                    let _ = config_tx.send(c);
                })),
                on_latency: Some(Arc::new(move |rtt| {
                    let _ = latency_tx.send(rtt);
                })),
                ..Default::default()
            },
        )
        .await
        .expect("connect");

        // DISPLAY_CONFIG arrives before anything else.
        let config = tokio::time::timeout(Duration::from_secs(2), configs.recv())
            .await
            .expect("config timely")
            .expect("config");
        assert_eq!(config, DisplayConfig::new(1920, 1200, Rotation::Deg0));

        // Host → client frame, tagged with a receive timestamp.
        let before = clock::now_ns();
        server.send_frame(Bytes::from_static(b"bitstream")).await;
        let (data, rx_ns) = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("frame timely")
            .expect("frame");
        assert_eq!(&data[..], b"bitstream");
        assert!(rx_ns >= before);

        // Client → host touch on the dedicated sender.
        let sample = TouchSample::dual(0.1, 0.2, 0.8, 0.9, TouchPhase::Move);
        client.send_touch(sample);
        let received = tokio::time::timeout(Duration::from_secs(2), touches.recv())
            .await
            .expect("touch timely")
            .expect("touch");
        assert_eq!(received, sample);

        // Explicit ping → pong → latency callback.
        client.send_ping();
        let rtt = tokio::time::timeout(Duration::from_secs(2), latencies.recv())
            .await
            .expect("latency timely")
            .expect("latency");
        assert!(rtt < Duration::from_secs(1), "loopback rtt {rtt:?}");

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_close_fires_disconnect_once() {
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let (server, port) = host_server(touch_tx).await;

        let (conn_tx, mut connections) = mpsc::unbounded_channel();
        let client = StreamClient::connect(
            "127.0.0.1",
            port,
            ClientCallbacks {
                on_connection: Some(Arc::new(move |connected| {
                    let _ = conn_tx.send(connected);
                })),
                ..Default::default()
            },
        )
        .await
        .expect("connect");

        assert_eq!(connections.recv().await, Some(true));
        server.stop().await;

        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), connections.recv())
                .await
                .expect("disconnect timely"),
            Some(false)
        );
        assert!(!client.is_connected());
        assert!(
            tokio::time::timeout(Duration::from_millis(300), connections.recv())
                .await
                .is_err(),
            "no duplicate disconnect"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_frame_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().unwrap().port();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut header = vec![wire::TAG_VIDEO_FRAME];
            header.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
            stream.write_all(&header).await.expect("write");
            // Keep the socket open; the client must bail on the length alone.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (conn_tx, mut connections) = mpsc::unbounded_channel();
        let _client = StreamClient::connect(
            "127.0.0.1",
            port,
            ClientCallbacks {
                on_connection: Some(Arc::new(move |connected| {
                    let _ = conn_tx.send(connected);
                })),
                ..Default::default()
            },
        )
        .await
        .expect("connect");

        assert_eq!(connections.recv().await, Some(true));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), connections.recv())
                .await
                .expect("fatal timely"),
            Some(false)
        );
        server_task.abort();
    }
}
