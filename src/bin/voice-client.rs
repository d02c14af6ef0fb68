//! Voice Client
//!
//! Streams the microphone to a conversational agent and plays its replies.
//!
//! Usage: `voice-client [ws-url]`

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_voice::{
    audio::list_devices, config::AppConfig, SessionController, SessionEvent, SessionState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice client");

    let mut config = match AppConfig::default_path() {
        Some(path) => AppConfig::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    }
    .with_env_overrides();
    if let Some(url) = std::env::args().nth(1) {
        config.transport.url = url;
    }
    config.validate().context("invalid configuration")?;

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let controller = SessionController::from_config(config);
    let mut events = controller.subscribe();

    tracing::info!("Connecting to {}", controller.config().transport.url);
    if let Err(e) = controller.connect().await {
        controller.disconnect().await;
        return Err(e).context("connect failed");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::TranscriptAppended { fragment }) => println!("agent: {}", fragment),
                Ok(SessionEvent::TurnComplete) => println!("--"),
                Ok(SessionEvent::Interrupted) => println!("[interrupted]"),
                Ok(SessionEvent::StateChanged { state: SessionState::Error, error }) => {
                    tracing::error!("Session failed: {}", error.unwrap_or_default());
                    break;
                }
                Ok(SessionEvent::StateChanged { state: SessionState::Disconnected, .. }) => break,
                Ok(SessionEvent::StateChanged { .. }) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller.disconnect().await;

    let stats = controller.stats();
    tracing::info!(
        "Session ended: {} frames sent, {} dropped, {} chunks played, {} interruptions",
        stats.frames_sent,
        stats.frames_dropped,
        stats.buffers_completed,
        stats.interruptions
    );
    if !controller.transcript().is_empty() {
        println!("\n=== Transcript ===\n{}", controller.transcript());
    }

    Ok(())
}
