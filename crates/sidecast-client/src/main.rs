//! `sidecast-client` binary — present a sidecast stream and forward touch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sidecast_client::client::{ClientCallbacks, StreamClient};
use sidecast_client::decoder::DecodeStage;
use sidecast_client::touch::{PointerInput, TouchSampler};
use sidecast_core::DecoderConfig;
use sidecast_gst::{HevcDisplayDecoder, WindowPointerEvent};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sidecast-client", about = "Present a sidecast stream")]
struct Args {
    /// Host to connect to.
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Host port.
    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Display refresh rate used for vsync alignment.
    #[arg(long, default_value_t = 60)]
    refresh_rate: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    sidecast_gst::init().context("GStreamer init")?;

    // The decoder starts at a nominal size; the first DISPLAY_CONFIG
    // reconfigures it before any frame is decoded.
    let decoder_config = DecoderConfig::low_latency(1920, 1200, args.refresh_rate);
    let (decoder, released_rx, window_events) =
        HevcDisplayDecoder::new(&decoder_config).context("creating decoder")?;
    let stage = Arc::new(DecodeStage::spawn(
        Box::new(decoder),
        released_rx,
        decoder_config,
        Some(Arc::new(|fps, stddev_ms| {
            info!("presentation: {:.1} fps, jitter σ {:.2} ms", fps, stddev_ms);
        })),
    ));

    let sampler = Arc::new(Mutex::new(TouchSampler::new(1920, 1200, args.refresh_rate)));

    let frame_stage = Arc::clone(&stage);
    let config_stage = Arc::clone(&stage);
    let config_sampler = Arc::clone(&sampler);
    let client = Arc::new(
        StreamClient::connect(
            &args.host,
            args.port,
            ClientCallbacks {
                on_frame: Some(Arc::new(move |data, rx_ns| {
                    frame_stage.ingest(data, rx_ns);
                })),
                on_display_config: Some(Arc::new(move |config| {
                    config_stage.update_resolution(config.width, config.height);
                    config_sampler
                        .lock()
                        .unwrap()
                        .set_surface_size(config.width, config.height);
                })),
                on_connection: Some(Arc::new(|connected| {
                    info!("host {}", if connected { "connected" } else { "gone" });
                })),
                on_stats: Some(Arc::new(|fps, mbps| {
                    info!("receiving {:.1} fps, {:.2} Mbit/s", fps, mbps);
                })),
                on_latency: Some(Arc::new(|rtt| {
                    info!("link round-trip {:.1} ms", rtt.as_secs_f64() * 1e3);
                })),
            },
        )
        .await
        .context("connecting to host")?,
    );

    // Forward window pointer events as touch samples.
    let touch_client = Arc::clone(&client);
    let touch_sampler = Arc::clone(&sampler);
    let touch_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(4));
        loop {
            ticker.tick().await;
            for event in window_events.poll() {
                let input = match event {
                    WindowPointerEvent::Press { x, y } => PointerInput::Down { x, y },
                    WindowPointerEvent::Motion { x, y } => PointerInput::Move { x, y },
                    WindowPointerEvent::Release { x, y } => PointerInput::Up { x, y },
                };
                if let Some(sample) = touch_sampler.lock().unwrap().on_input(input) {
                    touch_client.send_touch(sample);
                }
            }
            if !touch_client.is_connected() {
                return;
            }
        }
    });

    info!("presenting — press Ctrl-C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("stopping"),
        _ = touch_task => info!("session ended"),
    }

    client.disconnect().await;
    Ok(())
}
