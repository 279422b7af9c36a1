//! HEVC encode pipeline.
//!
//! # Encoder priority (highest to lowest)
//!
//! | Encoder        | Backend    | Notes |
//! |----------------|------------|-------|
//! | `vaapih265enc` | VA-API HW  | Intel / AMD iGPU |
//! | `nvh265enc`    | NVENC HW   | NVIDIA GPU |
//! | `x265enc`      | Software   | CPU fallback |
//!
//! # Pipeline
//!
//! ```text
//! appsrc (BGRA)
//!   → videoconvert
//!   → <best-encoder>
//!   → video/x-h265,stream-format=byte-stream,alignment=au
//!   → h265parse config-interval=-1      (VPS/SPS/PPS on every keyframe)
//!   → appsink (HEVC Annex-B access units)
//! ```
//!
//! Bitrate updates apply live through the element property; quality and
//! gaming-boost changes recreate the session transparently (same output
//! channel, new pipeline).

use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use sidecast_core::backend::{EncoderConfig, EncoderUpdate, VideoEncoder};
use sidecast_core::{EncodeError, EncodedFrame, RawFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ── Encoder selection ─────────────────────────────────────────────────────────

/// Return the element name of the best available HEVC encoder plus its
/// property string for the given configuration.
fn select_encoder(config: &EncoderConfig) -> (&'static str, String) {
    let kbps = effective_bitrate_kbps(config);
    let gop = config.gop_size.max(1);
    let candidates: [(&str, String); 3] = [
        (
            "vaapih265enc",
            format!("rate-control=cbr bitrate={kbps} keyframe-period={gop}"),
        ),
        (
            "nvh265enc",
            format!("preset=low-latency-hq rc-mode=cbr bitrate={kbps} gop-size={gop}"),
        ),
        (
            "x265enc",
            format!(
                "tune=zerolatency speed-preset={} key-int-max={gop} bitrate={kbps}",
                speed_preset(config.quality)
            ),
        ),
    ];
    for (name, props) in candidates {
        if gstreamer::ElementFactory::find(name).is_some() {
            info!("HEVC encoder selected: {}", name);
            return (name, props);
        }
    }
    warn!("no preferred HEVC encoder found; falling back to x265enc");
    ("x265enc", format!("tune=zerolatency bitrate={kbps}"))
}

/// Map the 0..1 quality factor onto x265 speed presets (lower quality =
/// faster preset = lower latency).
fn speed_preset(quality: f32) -> &'static str {
    if quality <= 0.25 {
        "ultrafast"
    } else if quality <= 0.5 {
        "superfast"
    } else if quality <= 0.75 {
        "veryfast"
    } else {
        "faster"
    }
}

/// Gaming boost overrides the configured rate with the encoder-defined
/// minimum-latency profile (very high bitrate ceiling, 120 fps pacing).
fn effective_bitrate_kbps(config: &EncoderConfig) -> u32 {
    if config.gaming_boost {
        1_000_000 // 1 Gbit/s ceiling
    } else {
        config.bitrate_mbps.saturating_mul(1_000)
    }
}

fn effective_fps(config: &EncoderConfig) -> u32 {
    if config.gaming_boost {
        120
    } else {
        config.operating_rate.max(config.fps)
    }
}

// ── HevcEncoder ───────────────────────────────────────────────────────────────

/// Encodes raw BGRA frames to HEVC Annex-B via GStreamer.
pub struct HevcEncoder {
    appsrc:   AppSrc,
    encoder:  gstreamer::Element,
    pipeline: gstreamer::Pipeline,
    element:  &'static str,
    config:   EncoderConfig,
    out_tx:   mpsc::Sender<EncodedFrame>,
}

impl HevcEncoder {
    /// Create and start an encode pipeline. Returns the encoder and the
    /// channel its output packets arrive on (one message per access unit;
    /// the backend may emit several per input frame).
    pub fn new(
        config: &EncoderConfig,
    ) -> Result<(Self, mpsc::Receiver<EncodedFrame>), EncodeError> {
        let (out_tx, out_rx) = mpsc::channel::<EncodedFrame>(16);
        let encoder = Self::build(config.clone(), out_tx)?;
        Ok((encoder, out_rx))
    }

    fn build(
        config: EncoderConfig,
        out_tx: mpsc::Sender<EncodedFrame>,
    ) -> Result<Self, EncodeError> {
        let (element, props) = select_encoder(&config);
        let (width, height) = (config.width, config.height);
        let fps = effective_fps(&config);

        let desc = format!(
            "appsrc name=src is-live=true format=time \
                 caps=\"video/x-raw,format=BGRA,width={width},height={height},\
                        framerate={fps}/1\" \
             ! videoconvert \
             ! {element} name=enc {props} \
             ! video/x-h265,stream-format=byte-stream,alignment=au \
             ! h265parse config-interval=-1 \
             ! appsink name=sink max-buffers=4 drop=false sync=false emit-signals=false"
        );
        debug!("encoder pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| EncodeError::Backend(format!("parsing pipeline: {e}")))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| EncodeError::Backend("expected a Pipeline".into()))?;

        let appsrc: AppSrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<AppSrc>().ok())
            .ok_or_else(|| EncodeError::Backend("no appsrc".into()))?;
        let enc = pipeline
            .by_name("enc")
            .ok_or_else(|| EncodeError::Backend("no encoder element".into()))?;
        let appsink: AppSink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| EncodeError::Backend("no appsink".into()))?;

        let sink_tx = out_tx.clone();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;

                    let pts_ns = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
                    let is_keyframe = !buffer
                        .flags()
                        .contains(gstreamer::BufferFlags::DELTA_UNIT);

                    let map = buffer
                        .map_readable()
                        .map_err(|_| gstreamer::FlowError::Error)?;
                    let frame = EncodedFrame {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        timestamp_ns: pts_ns,
                        is_keyframe,
                    };

                    if sink_tx.blocking_send(frame).is_err() {
                        return Err(gstreamer::FlowError::Flushing);
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|_| EncodeError::Backend("starting pipeline".into()))?;

        info!(
            "HevcEncoder({}) ready {}×{} @ {} fps, {} kbit/s",
            element,
            width,
            height,
            fps,
            effective_bitrate_kbps(&config)
        );
        Ok(Self { appsrc, encoder: enc, pipeline, element, config, out_tx })
    }

    /// Tear down and rebuild the session with the current configuration.
    fn rebuild(&mut self) -> Result<(), EncodeError> {
        info!("recreating encoder session ({})", self.element);
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        let replacement = Self::build(self.config.clone(), self.out_tx.clone())?;
        *self = replacement;
        Ok(())
    }

    fn set_bitrate_live(&self, kbps: u32) -> bool {
        // All three candidate encoders expose `bitrate` in kbit/s.
        let supported = self
            .encoder
            .find_property("bitrate")
            .is_some_and(|p| p.value_type() == u32::static_type());
        if supported {
            self.encoder.set_property("bitrate", kbps);
        }
        supported
    }
}

impl VideoEncoder for HevcEncoder {
    fn encode(&mut self, frame: &RawFrame) -> Result<(), EncodeError> {
        let mut buf = gstreamer::Buffer::with_size(frame.data.len())
            .map_err(|_| EncodeError::Backend("buffer alloc".into()))?;
        {
            let buf_mut = buf.get_mut().expect("fresh buffer is writable");
            buf_mut.set_pts(gstreamer::ClockTime::from_nseconds(frame.timestamp_ns));
            let mut map = buf_mut
                .map_writable()
                .map_err(|_| EncodeError::Backend("buffer map".into()))?;
            map.copy_from_slice(&frame.data);
        }

        self.appsrc
            .push_buffer(buf)
            .map_err(|e| EncodeError::Backend(format!("appsrc push: {e:?}")))?;
        Ok(())
    }

    fn update_settings(&mut self, update: &EncoderUpdate) -> Result<(), EncodeError> {
        if let Some(bitrate) = update.bitrate_mbps {
            self.config.bitrate_mbps = bitrate;
        }
        if let Some(quality) = update.quality {
            self.config.quality = quality;
        }
        if let Some(gaming) = update.gaming_boost {
            self.config.gaming_boost = gaming;
        }

        // Quality and boost changes affect element construction; bitrate
        // alone can be applied without touching the session.
        let needs_rebuild = update.quality.is_some() || update.gaming_boost.is_some();
        if needs_rebuild {
            return self.rebuild();
        }
        let kbps = effective_bitrate_kbps(&self.config);
        if self.set_bitrate_live(kbps) {
            debug!("bitrate updated live to {} kbit/s", kbps);
            Ok(())
        } else {
            self.rebuild()
        }
    }

    fn flush(&mut self) -> Result<(), EncodeError> {
        let _ = self.appsrc.end_of_stream();
        if let Some(bus) = self.pipeline.bus() {
            // Wait for the EOS to reach the sink so every queued access unit
            // has been delivered.
            let _ = bus.timed_filtered_pop(
                gstreamer::ClockTime::from_seconds(2),
                &[gstreamer::MessageType::Eos, gstreamer::MessageType::Error],
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        self.element
    }
}

impl Drop for HevcEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quality: f32, gaming: bool) -> EncoderConfig {
        let mut config = EncoderConfig::low_latency(1920, 1080, 60, 20, quality);
        config.gaming_boost = gaming;
        config
    }

    #[test]
    fn gaming_boost_overrides_rate_and_fps() {
        let boosted = config(0.75, true);
        assert_eq!(effective_bitrate_kbps(&boosted), 1_000_000);
        assert_eq!(effective_fps(&boosted), 120);

        let normal = config(0.75, false);
        assert_eq!(effective_bitrate_kbps(&normal), 20_000);
        assert_eq!(effective_fps(&normal), 60);
    }

    #[test]
    fn quality_maps_to_monotonic_presets() {
        assert_eq!(speed_preset(0.25), "ultrafast");
        assert_eq!(speed_preset(0.5), "superfast");
        assert_eq!(speed_preset(0.75), "veryfast");
        assert_eq!(speed_preset(1.0), "faster");
    }
}
