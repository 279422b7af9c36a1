//! HEVC decode + display pipeline.
//!
//! # Decoder priority
//! 1. `vaapih265dec`  — VA-API hardware
//! 2. `nvh265dec`     — NVIDIA NVDEC
//! 3. `avdec_h265`    — software libavcodec (last resort)
//!
//! # Pipeline
//! ```text
//! appsrc (HEVC Annex-B) → h265parse → [decoder] → [postproc] → identity → autovideosink
//! ```
//!
//! The `identity` tap reports every buffer handed to the sink on the
//! released-frames channel, which drives the decode stage's fps/jitter
//! telemetry. The sink window's navigation bus messages double as the touch
//! input source — poll them with [`WindowEventPoller`]. The poller shares
//! its bus handle with the decoder, so it keeps delivering events across the
//! session rebuilds that every resolution change triggers.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use sidecast_core::backend::{DecoderConfig, SubmitOutcome, VideoDecoder};
use sidecast_core::DecodeError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Decoder candidates in priority order.
static DECODER_PRIORITY: &[(&str, &str)] = &[
    ("vaapih265dec", "VA-API HEVC"),
    ("nvh265dec", "NVIDIA NVDEC HEVC"),
    ("avdec_h265", "software libavcodec (last resort)"),
];

/// Returns the highest-priority available HEVC decoder element.
pub fn probe_best_decoder() -> Option<&'static str> {
    for (element, label) in DECODER_PRIORITY {
        if gstreamer::ElementFactory::find(element).is_some() {
            info!("selected decoder: {} ({})", element, label);
            return Some(element);
        }
        debug!("decoder '{}' not found, trying next", element);
    }
    None
}

/// Queued input bytes above which a submit is reported as `Busy`.
const INPUT_HIGH_WATER: u64 = 2 * 1024 * 1024;
/// How long a submit waits for the input queue to drain before giving up.
const INPUT_WAIT: std::time::Duration = std::time::Duration::from_millis(5);

// ── Window events ─────────────────────────────────────────────────────────────

/// Pointer event from the presentation window, in window pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowPointerEvent {
    Motion { x: f64, y: f64 },
    Press { x: f64, y: f64 },
    Release { x: f64, y: f64 },
}

/// Drains navigation messages from the display pipeline's bus.
///
/// The bus handle is shared with [`HevcDisplayDecoder`]: when a resolution
/// change rebuilds the pipeline, the decoder swaps the new bus in here, so a
/// poller created once keeps working for the whole session.
pub struct WindowEventPoller {
    bus: Arc<Mutex<gstreamer::Bus>>,
}

impl WindowEventPoller {
    /// All pointer events since the last call.
    pub fn poll(&self) -> Vec<WindowPointerEvent> {
        let bus = self.bus.lock().unwrap().clone();
        let mut events = Vec::new();
        while let Some(message) = bus.pop() {
            if let gstreamer::MessageView::Element(element) = message.view() {
                if let Some(structure) = element.structure() {
                    if let Some(event) = parse_navigation(structure) {
                        events.push(event);
                    }
                }
            }
        }
        events
    }
}

fn parse_navigation(s: &gstreamer::StructureRef) -> Option<WindowPointerEvent> {
    let kind = s.get::<&str>("event").ok()?;
    let x = s.get::<f64>("pointer_x").ok()?;
    let y = s.get::<f64>("pointer_y").ok()?;
    match kind {
        "mouse-move" => Some(WindowPointerEvent::Motion { x, y }),
        "mouse-button-press" => Some(WindowPointerEvent::Press { x, y }),
        "mouse-button-release" => Some(WindowPointerEvent::Release { x, y }),
        _ => None,
    }
}

// ── HevcDisplayDecoder ────────────────────────────────────────────────────────

/// Decodes HEVC and renders directly into an `autovideosink` window.
pub struct HevcDisplayDecoder {
    appsrc:   AppSrc,
    pipeline: gstreamer::Pipeline,
    element:  &'static str,
    config:   DecoderConfig,
    released_tx: mpsc::Sender<u64>,
    /// Shared with the [`WindowEventPoller`]; replaced on session rebuild.
    bus: Arc<Mutex<gstreamer::Bus>>,
}

impl HevcDisplayDecoder {
    /// Build and start the decode + display pipeline. Returns the decoder,
    /// the released-frame timestamp channel (telemetry), and the window
    /// event poller for touch sampling.
    pub fn new(
        config: &DecoderConfig,
    ) -> Result<(Self, mpsc::Receiver<u64>, WindowEventPoller), DecodeError> {
        let element = probe_best_decoder()
            .ok_or_else(|| DecodeError::Unavailable("no HEVC decoder element".into()))?;
        let (released_tx, released_rx) = mpsc::channel::<u64>(256);

        let (appsrc, pipeline) = build_pipeline(element, *config, released_tx.clone())?;
        let bus = pipeline
            .bus()
            .ok_or_else(|| DecodeError::Backend("pipeline has no bus".into()))?;
        let bus = Arc::new(Mutex::new(bus));
        let poller = WindowEventPoller { bus: Arc::clone(&bus) };

        let decoder = Self {
            appsrc,
            pipeline,
            element,
            config: *config,
            released_tx,
            bus,
        };
        Ok((decoder, released_rx, poller))
    }
}

fn build_pipeline(
    element: &'static str,
    config: DecoderConfig,
    released_tx: mpsc::Sender<u64>,
) -> Result<(AppSrc, gstreamer::Pipeline), DecodeError> {
    // VA-API surfaces carry alignment padding that plain videoconvert
    // cannot map; vaapipostproc operates on the surfaces natively.
    let postproc = if element.starts_with("vaapi") {
        "vaapipostproc"
    } else {
        "videoconvert"
    };

    let desc = format!(
        "appsrc name=src format=time is-live=true max-bytes={INPUT_HIGH_WATER} block=false \
         ! h265parse \
         ! {element} \
         ! {postproc} \
         ! identity name=tap signal-handoffs=true \
         ! autovideosink name=videosink sync=false"
    );
    debug!("decoder pipeline: {}", desc);

    let pipeline = gstreamer::parse::launch(&desc)
        .map_err(|e| DecodeError::Backend(format!("parsing pipeline: {e}")))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| DecodeError::Backend("expected a Pipeline".into()))?;

    let appsrc = pipeline
        .by_name("src")
        .and_then(|e| e.downcast::<AppSrc>().ok())
        .ok_or_else(|| DecodeError::Backend("no appsrc".into()))?;

    // The host sends Annex-B with parameter sets on every keyframe.
    let caps = gstreamer::Caps::builder("video/x-h265")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build();
    appsrc.set_caps(Some(&caps));

    let tap = pipeline
        .by_name("tap")
        .ok_or_else(|| DecodeError::Backend("no identity tap".into()))?;
    tap.connect("handoff", false, move |args| {
        if let Some(Ok(buffer)) = args.get(1).map(|v| v.get::<gstreamer::Buffer>()) {
            let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
            let _ = released_tx.try_send(pts);
        }
        None
    });

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|_| DecodeError::Backend("starting pipeline".into()))?;

    info!(
        "HevcDisplayDecoder({}) ready {}×{} @ {} Hz",
        element, config.width, config.height, config.refresh_rate
    );
    Ok((appsrc, pipeline))
}

impl VideoDecoder for HevcDisplayDecoder {
    fn decode(
        &mut self,
        data: &Bytes,
        pts_ns: u64,
        present_at_ns: u64,
    ) -> Result<SubmitOutcome, DecodeError> {
        // Input backpressure: give the queue one short chance to drain, then
        // report Busy so the stage drops instead of stalling the session.
        if self.appsrc.current_level_bytes() > INPUT_HIGH_WATER {
            std::thread::sleep(INPUT_WAIT);
            if self.appsrc.current_level_bytes() > INPUT_HIGH_WATER {
                return Ok(SubmitOutcome::Busy);
            }
        }

        let mut buf = gstreamer::Buffer::with_size(data.len())
            .map_err(|_| DecodeError::Backend("buffer alloc".into()))?;
        {
            let buf_mut = buf.get_mut().expect("fresh buffer is writable");
            // Present on the computed vsync boundary; DTS keeps decode order
            // at the original timestamp (no B-frames, PTS == DTS order).
            buf_mut.set_pts(gstreamer::ClockTime::from_nseconds(present_at_ns));
            buf_mut.set_dts(gstreamer::ClockTime::from_nseconds(pts_ns));
            let mut map = buf_mut
                .map_writable()
                .map_err(|_| DecodeError::Backend("buffer map".into()))?;
            map.copy_from_slice(data);
        }

        self.appsrc
            .push_buffer(buf)
            .map_err(|e| DecodeError::Backend(format!("appsrc push: {e:?}")))?;
        Ok(SubmitOutcome::Accepted)
    }

    fn update_resolution(&mut self, width: u32, height: u32) -> Result<(), DecodeError> {
        info!(
            "rebuilding decoder session {}×{} -> {}×{}",
            self.config.width, self.config.height, width, height
        );
        let _ = self.pipeline.set_state(gstreamer::State::Null);

        let mut config = self.config;
        config.width = width;
        config.height = height;
        let (appsrc, pipeline) = build_pipeline(self.element, config, self.released_tx.clone())
            .map_err(|e| DecodeError::Reconfigure(e.to_string()))?;
        let bus = pipeline
            .bus()
            .ok_or_else(|| DecodeError::Reconfigure("rebuilt pipeline has no bus".into()))?;

        // Swap the new bus into the shared handle so the poller handed out at
        // construction follows the new window.
        *self.bus.lock().unwrap() = bus;
        self.appsrc = appsrc;
        self.pipeline = pipeline;
        self.config = config;
        Ok(())
    }

    fn name(&self) -> &str {
        self.element
    }
}

impl Drop for HevcDisplayDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("decoder teardown: {:?}", e);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn nav_message(event: &str, x: f64, y: f64) -> gstreamer::Message {
        let structure = gstreamer::Structure::builder("GstNavigationMessage")
            .field("event", event)
            .field("pointer_x", x)
            .field("pointer_y", y)
            .build();
        gstreamer::message::Element::builder(structure).build()
    }

    #[test]
    fn navigation_structures_map_to_pointer_events() {
        gstreamer::init().expect("gst init");

        let cases = [
            ("mouse-move", WindowPointerEvent::Motion { x: 12.5, y: 34.0 }),
            ("mouse-button-press", WindowPointerEvent::Press { x: 12.5, y: 34.0 }),
            ("mouse-button-release", WindowPointerEvent::Release { x: 12.5, y: 34.0 }),
        ];
        for (kind, expected) in cases {
            let structure = gstreamer::Structure::builder("GstNavigationMessage")
                .field("event", kind)
                .field("pointer_x", 12.5f64)
                .field("pointer_y", 34.0f64)
                .build();
            assert_eq!(parse_navigation(&structure), Some(expected), "{kind}");
        }

        // Scroll and keyboard navigation are not pointer events here.
        let structure = gstreamer::Structure::builder("GstNavigationMessage")
            .field("event", "key-press")
            .field("pointer_x", 0.0f64)
            .field("pointer_y", 0.0f64)
            .build();
        assert_eq!(parse_navigation(&structure), None);

        // Structures without coordinates are ignored rather than erroring.
        let structure = gstreamer::Structure::builder("GstNavigationMessage")
            .field("event", "mouse-move")
            .build();
        assert_eq!(parse_navigation(&structure), None);
    }

    #[test]
    fn poller_follows_a_bus_swap() {
        gstreamer::init().expect("gst init");

        let first = gstreamer::Bus::new();
        let second = gstreamer::Bus::new();
        let poller = WindowEventPoller {
            bus: Arc::new(Mutex::new(first.clone())),
        };

        first.post(nav_message("mouse-move", 10.0, 20.0)).expect("post");
        assert_eq!(
            poller.poll(),
            vec![WindowPointerEvent::Motion { x: 10.0, y: 20.0 }]
        );

        // A session rebuild replaces the bus in place; events from the new
        // window keep flowing through the same poller.
        *poller.bus.lock().unwrap() = second.clone();
        second
            .post(nav_message("mouse-button-press", 1.0, 2.0))
            .expect("post");
        first.post(nav_message("mouse-move", 99.0, 99.0)).expect("post");
        assert_eq!(
            poller.poll(),
            vec![WindowPointerEvent::Press { x: 1.0, y: 2.0 }]
        );
    }
}
