//! TCP streaming server — the host end of the wire.
//!
//! ```text
//! encoder ──send_frame──► ┌──────────────┐ ──VIDEO_FRAME/DISPLAY_CONFIG/PONG──► client
//!                         │ StreamServer │
//! gesture ◄──on_touch──── └──────────────┘ ◄──TOUCH_EVENT/PING───────────────── client
//! ```
//!
//! At most one client is active. A new incoming connection preempts the
//! previous one: the old socket is shut down and its receive task joined
//! before the newcomer is served. DISPLAY_CONFIG is written while the send
//! lock is still held from installing the client, so it always precedes the
//! first VIDEO_FRAME of a session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sidecast_core::stats::ThroughputWindow;
use sidecast_core::wire::{self, Message, MAX_FRAME_BYTES};
use sidecast_core::{DisplayConfig, Rotation, StreamError, TouchSample};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Callbacks ─────────────────────────────────────────────────────────────────

pub type TouchCallback = Arc<dyn Fn(TouchSample) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type StatsCallback = Arc<dyn Fn(f32, f64) + Send + Sync>;

/// Server event callbacks. Touch samples arrive on the receive task in wire
/// order, so a gesture machine may be driven synchronously from `on_touch`.
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    pub on_touch:      Option<TouchCallback>,
    pub on_connection: Option<ConnectionCallback>,
    /// `(frames per second, megabits per second)` over ~1 s send windows.
    pub on_stats:      Option<StatsCallback>,
}

// ── Internal state ────────────────────────────────────────────────────────────

struct ActiveClient {
    writer:     OwnedWriteHalf,
    peer:       SocketAddr,
    /// Matches the receive task serving this socket; disconnect paths verify
    /// it so the connection callback fires exactly once per session.
    generation: u64,
    stats:      ThroughputWindow,
}

struct Shared {
    /// Send lock. Linearizes VIDEO_FRAME, DISPLAY_CONFIG, and PONG writes so
    /// message bytes never interleave on the wire.
    client:      Mutex<Option<ActiveClient>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    generation:  AtomicU64,
    connected:   AtomicBool,
    display:     std::sync::Mutex<DisplayConfig>,
    callbacks:   ServerCallbacks,
}

impl Shared {
    fn fire_connection(&self, connected: bool) {
        if let Some(cb) = &self.callbacks.on_connection {
            cb(connected);
        }
    }

    /// Tear down the active client if `generation` still matches. Returns
    /// whether this call performed the disconnect (and fired the callback).
    async fn disconnect(&self, generation: u64, reason: &str) -> bool {
        let mut guard = self.client.lock().await;
        match guard.as_ref() {
            Some(client) if client.generation == generation => {}
            _ => return false,
        }
        let mut client = guard.take().expect("checked above");
        drop(guard);

        info!("client {} disconnected: {}", client.peer, reason);
        let _ = client.writer.shutdown().await;
        self.connected.store(false, Ordering::Release);
        self.fire_connection(false);
        true
    }
}

// ── StreamServer ──────────────────────────────────────────────────────────────

/// Host-side streaming server. See module docs for the connection model.
pub struct StreamServer {
    shared:      Arc<Shared>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr:  std::sync::Mutex<Option<SocketAddr>>,
}

impl StreamServer {
    pub fn new(display: DisplayConfig, callbacks: ServerCallbacks) -> Self {
        Self {
            shared: Arc::new(Shared {
                client: Mutex::new(None),
                reader_task: std::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                display: std::sync::Mutex::new(display),
                callbacks,
            }),
            accept_task: std::sync::Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
        }
    }

    /// Bind TCP v4 on `port` (SO_REUSEADDR, backlog 1) and start accepting.
    pub async fn start(&self, port: u16) -> Result<(), StreamError> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(format!("0.0.0.0:{port}").parse().expect("valid addr"))?;
        let listener = socket.listen(1)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);
        *self.local_addr.lock().unwrap() = Some(local_addr);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => install_client(&shared, stream, peer).await,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Stop listening and drop the active client.
    pub async fn stop(&self) {
        let accept = self.accept_task.lock().unwrap().take();
        if let Some(task) = accept {
            task.abort();
            let _ = task.await;
        }
        let generation = self.shared.generation.load(Ordering::Acquire);
        self.shared.disconnect(generation, "server stopped").await;
        let reader = self.shared.reader_task.lock().unwrap().take();
        if let Some(task) = reader {
            task.abort();
            let _ = task.await;
        }
        *self.local_addr.lock().unwrap() = None;
        info!("server stopped");
    }

    /// Port actually bound (useful when started with port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.lock().unwrap().map(|a| a.port())
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Send one encoded frame to the active client.
    ///
    /// Frames above 5 MiB are dropped with a log; frames while no client is
    /// connected are silently dropped. A send failure tears the connection
    /// down (the receive task then exits naturally).
    pub async fn send_frame(&self, data: Bytes) {
        if data.len() > MAX_FRAME_BYTES {
            warn!("dropping {} byte frame above the 5 MiB limit", data.len());
            return;
        }

        let mut guard = self.shared.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return;
        };

        let mut header = [0u8; 5];
        header[0] = wire::TAG_VIDEO_FRAME;
        header[1..5].copy_from_slice(&(data.len() as u32).to_be_bytes());

        let write = async {
            client.writer.write_all(&header).await?;
            client.writer.write_all(&data).await?;
            Ok::<_, std::io::Error>(())
        };
        if let Err(e) = write.await {
            let generation = client.generation;
            drop(guard);
            debug!("frame send failed: {}", e);
            self.shared.disconnect(generation, "send failure").await;
            return;
        }

        let report = client.stats.record(header.len() + data.len());
        drop(guard);
        if let (Some(report), Some(cb)) = (report, &self.shared.callbacks.on_stats) {
            cb(report.fps, report.mbps);
        }
    }

    /// Update the advertised display geometry and push a DISPLAY_CONFIG to
    /// the active client.
    pub async fn set_display_size(&self, width: u32, height: u32, rotation: Rotation) {
        let config = DisplayConfig::new(width, height, rotation);
        *self.shared.display.lock().unwrap() = config;
        self.send_display_config(config).await;
    }

    /// Re-announce rotation. Idempotent on the value, but every call puts one
    /// DISPLAY_CONFIG on the wire.
    pub async fn update_rotation(&self, rotation: Rotation) {
        let config = {
            let mut display = self.shared.display.lock().unwrap();
            display.rotation = rotation;
            *display
        };
        self.send_display_config(config).await;
    }

    async fn send_display_config(&self, config: DisplayConfig) {
        let mut guard = self.shared.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return;
        };
        let bytes = Message::DisplayConfig(config).encode();
        if let Err(e) = client.writer.write_all(&bytes).await {
            let generation = client.generation;
            drop(guard);
            debug!("display config send failed: {}", e);
            self.shared.disconnect(generation, "send failure").await;
        }
    }
}

// ── Accept path ───────────────────────────────────────────────────────────────

async fn install_client(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("TCP_NODELAY failed for {}: {}", peer, e);
    }
    let (reader, mut writer) = stream.into_split();
    let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let config = *shared.display.lock().unwrap();

    // Swap the connection under the send lock. Writing DISPLAY_CONFIG before
    // releasing it guarantees config precedes any frame of this session.
    let previous = {
        let mut guard = shared.client.lock().await;
        let previous = guard.take();

        let config_bytes = Message::DisplayConfig(config).encode();
        if let Err(e) = writer.write_all(&config_bytes).await {
            warn!("initial display config to {} failed: {}", peer, e);
            *guard = previous;
            return;
        }
        *guard = Some(ActiveClient {
            writer,
            peer,
            generation,
            stats: ThroughputWindow::new(),
        });
        previous
    };

    // Join the preempted client's receive task before announcing the switch.
    let old_reader = shared.reader_task.lock().unwrap().take();
    if let Some(task) = old_reader {
        task.abort();
        let _ = task.await;
    }
    if let Some(mut old) = previous {
        info!("client {} preempted by {}", old.peer, peer);
        let _ = old.writer.shutdown().await;
        shared.fire_connection(false);
    }

    info!("client {} connected ({})", peer, config);
    shared.connected.store(true, Ordering::Release);
    shared.fire_connection(true);

    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        receive_loop(task_shared, reader, generation).await;
    });
    *shared.reader_task.lock().unwrap() = Some(handle);
}

// ── Receive path ──────────────────────────────────────────────────────────────

async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, generation: u64) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match wire::decode(&mut buf) {
            Ok(Some(message)) => {
                if !handle_message(&shared, generation, message).await {
                    return;
                }
            }
            Ok(None) => match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    shared.disconnect(generation, "peer closed").await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.disconnect(generation, &format!("read error: {e}")).await;
                    return;
                }
            },
            Err(e) => {
                shared
                    .disconnect(generation, &format!("protocol violation: {e}"))
                    .await;
                return;
            }
        }
    }
}

/// Dispatch one inbound message. Returns false when the loop should exit.
async fn handle_message(shared: &Arc<Shared>, generation: u64, message: Message) -> bool {
    match message {
        Message::Touch(sample) => {
            if let Some(cb) = &shared.callbacks.on_touch {
                cb(sample);
            }
            true
        }
        Message::Ping(timestamp) => {
            // Echo under the send lock so the PONG cannot interleave with a
            // frame in flight.
            let mut guard = shared.client.lock().await;
            match guard.as_mut() {
                Some(client) if client.generation == generation => {
                    let bytes = Message::Pong(timestamp).encode();
                    if let Err(e) = client.writer.write_all(&bytes).await {
                        drop(guard);
                        shared
                            .disconnect(generation, &format!("pong send failed: {e}"))
                            .await;
                        return false;
                    }
                    true
                }
                // Preempted while the ping was in flight.
                _ => false,
            }
        }
        other => {
            shared
                .disconnect(generation, &format!("unexpected host-bound message {other:?}"))
                .await;
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sidecast_core::TouchPhase;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> Message {
        loop {
            if let Some(message) = wire::decode(buf).expect("valid wire data") {
                return message;
            }
            let n = stream.read_buf(buf).await.expect("read");
            assert!(n > 0, "unexpected EOF");
        }
    }

    fn test_server(
        events: mpsc::UnboundedSender<(&'static str, bool)>,
        touches: mpsc::UnboundedSender<TouchSample>,
    ) -> StreamServer {
        let callbacks = ServerCallbacks {
            on_touch: Some(Arc::new(move |s| {
                let _ = touches.send(s);
            })),
            on_connection: Some(Arc::new(move |c| {
                let _ = events.send(("conn", c));
            })),
            on_stats: None,
        };
        StreamServer::new(DisplayConfig::new(1920, 1200, Rotation::Deg0), callbacks)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sends_display_config_on_connect() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        let message = read_message(&mut client, &mut buf).await;
        assert_eq!(
            message,
            Message::DisplayConfig(DisplayConfig::new(1920, 1200, Rotation::Deg0))
        );
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn touch_and_ping_roundtrip() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (touch_tx, mut touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        read_message(&mut client, &mut buf).await; // display config

        let sample = TouchSample::single(0.5, 0.25, TouchPhase::Down);
        client
            .write_all(&Message::Touch(sample).encode())
            .await
            .expect("send touch");
        let received = tokio::time::timeout(Duration::from_secs(2), touches.recv())
            .await
            .expect("touch timely")
            .expect("touch delivered");
        assert_eq!(received, sample);

        let timestamp = *b"\x01\x02\x03\x04\x05\x06\x07\x08";
        client
            .write_all(&Message::Ping(timestamp).encode())
            .await
            .expect("send ping");
        let pong = read_message(&mut client, &mut buf).await;
        assert_eq!(pong, Message::Pong(timestamp));

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_fires_exactly_once() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        read_message(&mut client, &mut buf).await;
        assert_eq!(events.recv().await, Some(("conn", true)));

        drop(client);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("disconnect timely"),
            Some(("conn", false))
        );
        assert!(!server.is_client_connected());

        // No duplicate disconnect events.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err()
        );
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_client_preempts_previous() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.expect("first");
        let mut buf_a = BytesMut::new();
        read_message(&mut first, &mut buf_a).await;
        assert_eq!(events.recv().await, Some(("conn", true)));

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.expect("second");
        let mut buf_b = BytesMut::new();
        // Old drops before the newcomer is announced.
        assert_eq!(events.recv().await, Some(("conn", false)));
        assert_eq!(events.recv().await, Some(("conn", true)));

        // The second client sees DISPLAY_CONFIG before any frame.
        let frame = Bytes::from_static(b"keyframe");
        server.send_frame(frame.clone()).await;
        assert!(matches!(
            read_message(&mut second, &mut buf_b).await,
            Message::DisplayConfig(_)
        ));
        assert_eq!(
            read_message(&mut second, &mut buf_b).await,
            Message::VideoFrame(frame)
        );

        // The first client's socket is dead.
        let mut probe = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut probe))
            .await
            .expect("timely")
            .unwrap_or(0);
        assert_eq!(n, 0, "preempted socket should be closed");
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_frame_dropped_connection_survives() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        read_message(&mut client, &mut buf).await;

        server
            .send_frame(Bytes::from(vec![0u8; MAX_FRAME_BYTES + 1]))
            .await;
        assert!(server.is_client_connected());

        let small = Bytes::from_static(b"after");
        server.send_frame(small.clone()).await;
        assert_eq!(
            read_message(&mut client, &mut buf).await,
            Message::VideoFrame(small)
        );
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_pointer_count_closes_client() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        read_message(&mut client, &mut buf).await;
        assert_eq!(events.recv().await, Some(("conn", true)));

        client
            .write_all(&[wire::TAG_TOUCH_EVENT, 3])
            .await
            .expect("send bad touch");
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("close timely"),
            Some(("conn", false))
        );
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rotation_update_resends_config() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (touch_tx, _touches) = mpsc::unbounded_channel();
        let server = test_server(events_tx, touch_tx);
        server.start(0).await.expect("start");
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut buf = BytesMut::new();
        read_message(&mut client, &mut buf).await;

        // Same value — still one config on the wire per call.
        server.update_rotation(Rotation::Deg0).await;
        assert_eq!(
            read_message(&mut client, &mut buf).await,
            Message::DisplayConfig(DisplayConfig::new(1920, 1200, Rotation::Deg0))
        );

        server.update_rotation(Rotation::Deg90).await;
        assert_eq!(
            read_message(&mut client, &mut buf).await,
            Message::DisplayConfig(DisplayConfig::new(1920, 1200, Rotation::Deg90))
        );
        server.stop().await;
    }
}
