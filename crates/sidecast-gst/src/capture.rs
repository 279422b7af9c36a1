//! PipeWire portal screen capture.
//!
//! ```text
//! ashpd portal ──► PipeWire node_id + remote fd
//!                        │
//!                        ▼
//!          pipewiresrc(fd=X, path=Y)
//!                        │
//!                  videoconvert
//!                        │
//!             video/x-raw,format=BGRA
//!                        │
//!                     appsink ──► bounded channel ──► next_frame()
//! ```
//!
//! On Wayland the XDG portal shows a permission dialog; requires
//! `xdg-desktop-portal` plus a desktop backend. The source is self-paced:
//! the pipeline delivers at the negotiated frame rate and the appsink drops
//! when the consumer lags.

use async_trait::async_trait;
use sidecast_core::backend::CaptureSource;
use sidecast_core::{CaptureError, RawFrame};

/// Screen capture session. Open with [`PortalCapture::open`].
pub struct PortalCapture {
    width:  u32,
    height: u32,
    #[cfg(target_os = "linux")]
    inner: linux::PipewireCapture,
}

impl PortalCapture {
    /// Negotiate a portal screen-cast session and start capturing at
    /// `fps`. The returned dimensions are what the pipeline actually
    /// delivers; size the encoder from them.
    pub async fn open(width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
        #[cfg(target_os = "linux")]
        {
            let inner = linux::PipewireCapture::open(width, height, fps).await?;
            Ok(Self { width, height, inner })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (width, height, fps);
            tracing::warn!("portal capture is Linux-only");
            Err(CaptureError::Unavailable("portal capture is Linux-only".into()))
        }
    }
}

#[async_trait]
impl CaptureSource for PortalCapture {
    async fn next_frame(&mut self) -> Option<RawFrame> {
        #[cfg(target_os = "linux")]
        return self.inner.next_frame().await;
        #[cfg(not(target_os = "linux"))]
        None
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stop(&mut self) {
        #[cfg(target_os = "linux")]
        self.inner.stop();
    }
}

// ── Linux implementation (PipeWire portal + GStreamer) ────────────────────────

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::IntoRawFd;

    use ashpd::desktop::screencast::{CaptureType, Persist, ScreenCast, SourceType};
    use ashpd::WindowIdentifier;
    use bytes::Bytes;
    use gstreamer::prelude::*;
    use gstreamer_app::{AppSink, AppSinkCallbacks};
    use sidecast_core::{CaptureError, PixelFormat, RawFrame};
    use tokio::sync::mpsc;
    use tracing::{debug, info};

    pub(super) struct PipewireCapture {
        frame_rx: mpsc::Receiver<RawFrame>,
        pipeline: gstreamer::Pipeline,
    }

    impl PipewireCapture {
        pub(super) async fn open(
            width: u32,
            height: u32,
            fps: u32,
        ) -> Result<Self, CaptureError> {
            let (node_id, fd) = negotiate_portal().await?;
            info!("PipeWire portal ok: node_id={} fd={}", node_id, fd);

            let (pipeline, frame_rx) = build_pipeline(width, height, fps, fd, node_id)?;
            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|_| CaptureError::Backend("starting capture pipeline".into()))?;

            Ok(Self { frame_rx, pipeline })
        }

        pub(super) async fn next_frame(&mut self) -> Option<RawFrame> {
            self.frame_rx.recv().await
        }

        pub(super) fn stop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }

    /// Ask the XDG desktop portal for a PipeWire screen-cast stream.
    async fn negotiate_portal() -> Result<(u32, i32), CaptureError> {
        let backend = |e: ashpd::Error| CaptureError::Unavailable(format!("portal: {e}"));

        let proxy = ScreenCast::new().await.map_err(backend)?;
        let session = proxy.create_session().await.map_err(backend)?;

        proxy
            .select_sources(
                &session,
                CaptureType::SCREEN,
                SourceType::MONITOR,
                false, // single stream
                None,  // default cursor mode
                Persist::DoNot,
            )
            .await
            .map_err(backend)?;

        let response = proxy
            .start(&session, &WindowIdentifier::default())
            .await
            .map_err(backend)?
            .response()
            .map_err(|e| CaptureError::Unavailable(format!("portal denied: {e}")))?;

        let stream = response
            .streams()
            .first()
            .cloned()
            .ok_or_else(|| CaptureError::Unavailable("portal returned no streams".into()))?;
        let node_id = stream.pipe_wire_node_id();

        let fd = proxy
            .open_pipe_wire_remote(&session)
            .await
            .map_err(backend)?;
        Ok((node_id, fd.into_raw_fd()))
    }

    fn build_pipeline(
        width: u32,
        height: u32,
        fps: u32,
        fd: i32,
        node_id: u32,
    ) -> Result<(gstreamer::Pipeline, mpsc::Receiver<RawFrame>), CaptureError> {
        let desc = format!(
            "pipewiresrc fd={fd} path={node_id} do-timestamp=true \
             ! videoconvert \
             ! video/x-raw,format=BGRA,width={width},height={height},framerate={fps}/1 \
             ! appsink name=sink max-buffers=2 drop=true sync=false emit-signals=false"
        );
        debug!("capture pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| CaptureError::Backend(format!("parsing pipeline: {e}")))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::Backend("expected a Pipeline".into()))?;

        let appsink: AppSink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| CaptureError::Backend("no appsink".into()))?;

        let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(8);

        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
                    let timestamp_ns = buffer
                        .pts()
                        .map(|t| t.nseconds())
                        .unwrap_or_else(sidecast_core::clock::now_ns);
                    let map = buffer
                        .map_readable()
                        .map_err(|_| gstreamer::FlowError::Error)?;

                    // The source owns `map` only for this callback: copy out.
                    let frame = RawFrame {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        width,
                        height,
                        stride: width * 4,
                        format: PixelFormat::Bgra,
                        timestamp_ns,
                    };

                    // Dropping here (consumer lagging) matches drop=true on
                    // the sink: capture never blocks on delivery.
                    let _ = frame_tx.try_send(frame);
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        Ok((pipeline, frame_rx))
    }

    impl Drop for PipewireCapture {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }
}
