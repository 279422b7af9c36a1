//! Capability interfaces for the platform-specific collaborators: capture
//! source, video encoder, video decoder, and pointer injection.
//!
//! The streaming pipelines depend only on these traits; a factory per
//! platform picks the first viable backend (see `sidecast-gst`).

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{DecodeError, EncodeError};
use crate::types::{DisplayBounds, RawFrame};

// ── Capture ───────────────────────────────────────────────────────────────────

/// A raw frame source for one display.
///
/// Delivery must not block: by the time `next_frame` resolves the pixels are
/// owned by the returned [`RawFrame`]. A source that ends (session closed,
/// portal revoked) returns `None`.
#[async_trait]
pub trait CaptureSource: Send {
    async fn next_frame(&mut self) -> Option<RawFrame>;

    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Whether the source delivers frames at its own cadence. Sources that
    /// only produce on demand are driven by the capture pump's pacing loop.
    fn is_self_paced(&self) -> bool {
        true
    }

    fn stop(&mut self) {}
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Encoder session configuration. Every field is honored by conforming
/// backends; `bitrate_mbps`, `quality`, and `gaming_boost` are additionally
/// live-reconfigurable through [`EncoderUpdate`].
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width:  u32,
    pub height: u32,
    pub fps:    u32,
    pub bitrate_mbps: u32,
    /// Quality factor in 0..1 (see `Quality::factor`).
    pub quality: f32,
    /// 1 = all-intra (every frame a keyframe); larger values = periodic IDR.
    pub gop_size: u32,
    /// Disable lookahead.
    pub low_latency: bool,
    /// 0 = no reordering, PTS == DTS.
    pub max_b_frames: u32,
    /// Scheduling hint, frames per second.
    pub operating_rate: u32,
    /// Prepend VPS/SPS/PPS to every IDR in the Annex-B output.
    pub parameter_sets_with_every_keyframe: bool,
    /// Encoder-defined overrides for minimum latency (typically 1 Gbps,
    /// 120 fps, low quality).
    pub gaming_boost: bool,
}

impl EncoderConfig {
    /// The low-latency profile every sidecast session uses.
    pub fn low_latency(width: u32, height: u32, fps: u32, bitrate_mbps: u32, quality: f32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate_mbps,
            quality,
            gop_size: 1,
            low_latency: true,
            max_b_frames: 0,
            operating_rate: fps,
            parameter_sets_with_every_keyframe: true,
            gaming_boost: false,
        }
    }
}

/// Live settings update. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderUpdate {
    pub bitrate_mbps: Option<u32>,
    pub quality:      Option<f32>,
    pub gaming_boost: Option<bool>,
}

/// An HEVC encoder session.
///
/// Output is delivered as [`crate::EncodedFrame`]s on the channel returned by
/// the backend factory, one message per output packet (a backend may emit
/// several packets for one input).
pub trait VideoEncoder: Send {
    /// Submit one raw frame. The input timestamp must be carried through to
    /// the matching output packet(s).
    fn encode(&mut self, frame: &RawFrame) -> Result<(), EncodeError>;

    /// Apply a live update without tearing the session down when the backend
    /// permits; otherwise the backend recreates the session transparently.
    fn update_settings(&mut self, update: &EncoderUpdate) -> Result<(), EncodeError>;

    /// Block until all pending output has been delivered.
    fn flush(&mut self) -> Result<(), EncodeError>;

    fn name(&self) -> &str;
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Decoder session configuration.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub width:  u32,
    pub height: u32,
    /// Display refresh rate, used as the operating-rate hint and for vsync
    /// alignment of released frames.
    pub refresh_rate: u32,
    pub low_latency:  bool,
    pub max_b_frames: u32,
}

impl DecoderConfig {
    pub fn low_latency(width: u32, height: u32, refresh_rate: u32) -> Self {
        Self { width, height, refresh_rate, low_latency: true, max_b_frames: 0 }
    }
}

/// Outcome of submitting a compressed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// No input buffer became available within the short dequeue timeout;
    /// the caller drops the frame (decoder backpressure).
    Busy,
}

/// An HEVC decoder session rendering to an opaque presentation surface.
pub trait VideoDecoder: Send {
    /// Submit one Annex-B access unit. `pts_ns` preserves the original frame
    /// timestamp; `present_at_ns` is the vsync-aligned release time computed
    /// by the decode stage.
    fn decode(
        &mut self,
        data: &Bytes,
        pts_ns: u64,
        present_at_ns: u64,
    ) -> Result<SubmitOutcome, DecodeError>;

    /// Tear down and rebuild the session for new dimensions. Backends may
    /// assume the decode stage only calls this when a dimension changed.
    fn update_resolution(&mut self, width: u32, height: u32) -> Result<(), DecodeError>;

    fn name(&self) -> &str;
}

// ── Pointer injection ─────────────────────────────────────────────────────────

/// Sink for pointer commands with absolute screen-pixel coordinates.
///
/// The implementation maps screen pixels into whatever absolute coordinate
/// space the platform wants (e.g. a 0..65535 virtual desktop) and decides how
/// zoom is realized (wheel + modifier, or a native gesture). Calls must not
/// fail the stream: errors are logged and swallowed.
pub trait PointerSink: Send + Sync {
    /// Called when a client connects, before any pointer command.
    fn set_display_bounds(&self, bounds: DisplayBounds);

    fn pointer_move(&self, x: i32, y: i32);
    fn left_down(&self);
    fn left_up(&self);
    fn right_down(&self);
    fn right_up(&self);
    /// Scroll at `(x, y)` by fractional pixel deltas (momentum ticks carry
    /// sub-pixel velocities; the backend decides how to quantize).
    fn scroll(&self, x: i32, y: i32, dx: f32, dy: f32);
    fn double_click(&self, x: i32, y: i32);
    /// Positive delta = zoom in.
    fn zoom(&self, x: i32, y: i32, delta: i32);
}
