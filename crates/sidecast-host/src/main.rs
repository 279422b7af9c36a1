//! `sidecast-host` binary — stream a display to a sidecast client.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sidecast_core::backend::VideoEncoder;
use sidecast_core::{Quality, StreamSettings};
use sidecast_gst::{HevcEncoder, PortalCapture};
use sidecast_host::pipeline::{HostPipeline, PipelineStatus};
use sidecast_host::inject::UinputSink;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sidecast-host", about = "Stream a display to a sidecast client")]
struct Args {
    /// TCP port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Capture width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Capture height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Target frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Encoder bitrate in Mbit/s.
    #[arg(long)]
    bitrate: Option<u32>,

    /// Encoder quality preset.
    #[arg(long, value_enum)]
    quality: Option<CliQuality>,

    /// Minimum-latency encoder overrides (high bitrate, 120 fps, low quality).
    #[arg(long)]
    gaming: bool,

    /// Settings file (defaults to the per-user config dir).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliQuality {
    Ultralow,
    Low,
    Medium,
    High,
}

impl From<CliQuality> for Quality {
    fn from(value: CliQuality) -> Self {
        match value {
            CliQuality::Ultralow => Quality::UltraLow,
            CliQuality::Low => Quality::Low,
            CliQuality::Medium => Quality::Medium,
            CliQuality::High => Quality::High,
        }
    }
}

fn load_settings(args: &Args) -> StreamSettings {
    let path = args.config.clone().or_else(StreamSettings::default_path);
    let mut settings = path
        .as_deref()
        .filter(|p| p.is_file())
        .and_then(|p| match StreamSettings::load(p) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("settings file {} unreadable: {e:#}", p.display());
                None
            }
        })
        .unwrap_or_default();

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(width) = args.width {
        settings.width = width;
    }
    if let Some(height) = args.height {
        settings.height = height;
    }
    if let Some(fps) = args.fps {
        settings.fps = fps;
    }
    if let Some(bitrate) = args.bitrate {
        settings.bitrate_mbps = bitrate;
    }
    if let Some(quality) = args.quality {
        settings.quality = quality.into();
    }
    if args.gaming {
        settings.gaming_boost = true;
    }
    settings
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args);

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "sidecast-host".to_owned());
    info!(
        "sidecast host on {} — {}×{} @ {} fps, port {}",
        host, settings.width, settings.height, settings.fps, settings.port
    );

    sidecast_gst::init().context("GStreamer init")?;

    let capture = PortalCapture::open(settings.width, settings.height, settings.fps)
        .await
        .context("opening screen capture")?;

    let sink = Arc::new(UinputSink::new(settings.width, settings.height));

    let (status_tx, mut status_rx) = mpsc::channel::<PipelineStatus>(16);
    let pipeline = HostPipeline::start(
        settings,
        Box::new(capture),
        |config| {
            HevcEncoder::new(config)
                .map(|(enc, rx)| (Box::new(enc) as Box<dyn VideoEncoder>, rx))
        },
        sink,
        status_tx,
    )
    .await
    .context("starting host pipeline")?;

    info!("streaming — press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                break;
            }
            maybe_status = status_rx.recv() => {
                if let Some(status) = maybe_status {
                    if status.fps > 0.0 {
                        info!(
                            "{:.1} fps, {:.2} Mbit/s, client {}",
                            status.fps,
                            status.mbps,
                            if status.client_connected { "connected" } else { "waiting" }
                        );
                    }
                }
            }
        }
    }

    pipeline.stop().await;
    Ok(())
}
