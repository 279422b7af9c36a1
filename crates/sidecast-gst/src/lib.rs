//! GStreamer backends for sidecast: PipeWire portal capture, HEVC encode,
//! and HEVC decode + display. Each implements the matching trait from
//! `sidecast_core::backend`; the probe tables pick hardware elements first
//! and fall back to software.

pub mod capture;
pub mod decode;
pub mod encode;

pub use capture::PortalCapture;
pub use decode::{HevcDisplayDecoder, WindowEventPoller, WindowPointerEvent};
pub use encode::HevcEncoder;

/// Initialise GStreamer. Call once before building any backend.
pub fn init() -> anyhow::Result<()> {
    gstreamer::init()?;
    Ok(())
}
