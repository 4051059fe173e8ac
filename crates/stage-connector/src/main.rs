//! Stage connector daemon
//!
//! Connects this device to a stage collaboration server and keeps the
//! session alive. Incoming signaling messages are printed to stdout as JSON
//! lines; lifecycle changes and diagnostics are logged.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stage_connector::{Connector, Diagnostic, Event, EventCategory, LifecycleEvent};
use stage_core::config::{self, ConnectorConfig, TlsBackend};
use stage_protocol::Message;

#[derive(Parser)]
#[command(name = "stage-connector")]
#[command(about = "stage-connector - keeps this device connected to a stage collaboration server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server endpoint (host:port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Bearer token for the hello message
    #[arg(long, env = "STAGE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Device identifier announced to the server (defaults to the hostname)
    #[arg(long)]
    device_id: Option<String>,

    /// Connect without TLS (loopback development servers only)
    #[arg(long)]
    plaintext: bool,

    /// Do not offer compressed frames
    #[arg(long)]
    no_compression: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for received messages
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;
    tracing::info!("Stage connector starting, server {}", config.endpoint);

    let connector = Connector::new(config).context("Failed to create connector")?;

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<String>();
    let _lifecycle = connector
        .on(EventCategory::Lifecycle, move |event| {
            log_lifecycle(event);
            if let Event::Lifecycle(LifecycleEvent::Failed { reason }) = event {
                failed_tx.send(reason.clone())?;
            }
            Ok(())
        })
        .scoped();
    let _diagnostics = connector
        .on(EventCategory::Diagnostic, |event| {
            if let Event::Diagnostic(diagnostic) = event {
                log_diagnostic(diagnostic);
            }
            Ok(())
        })
        .scoped();
    let _control = connector
        .on(EventCategory::Control, |event| {
            if let Event::Message(Message::Control { kind, payload }) = event {
                println!("{}", json!({ "type": kind, "payload": payload }));
            }
            Ok(())
        })
        .scoped();
    let _deltas = connector
        .on(EventCategory::StateDelta, |event| {
            if let Event::Message(Message::StateDelta(delta)) = event {
                tracing::debug!(
                    sequence = delta.sequence,
                    baseline = delta.baseline,
                    "State delta for {} ({} bytes)",
                    delta.entity,
                    delta.data.len()
                );
            }
            Ok(())
        })
        .scoped();

    connector.connect()?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing session");
            Ok(())
        }
        reason = failed_rx.recv() => {
            Err(anyhow::anyhow!(
                "Session failed: {}",
                reason.unwrap_or_else(|| "event bus closed".to_string())
            ))
        }
    };

    connector.close().await;
    result
}

/// Build the configuration: file first, then command-line overrides
fn load_config(args: &Args) -> Result<ConnectorConfig> {
    let explicit = args.config.is_some();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else if explicit {
        anyhow::bail!("Config file not found: {:?}", config_path);
    } else {
        tracing::warn!("No config at {:?}, using defaults", config_path);
        ConnectorConfig::default()
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    if args.plaintext {
        config.tls.backend = TlsBackend::Plaintext;
    }
    if args.no_compression {
        config.compression = false;
    }
    if args.device_id.is_some() || config.device.is_none() {
        config.device = Some(device_info(args.device_id.clone()));
    }

    config.validate()?;
    Ok(config)
}

/// Device description announced in the hello message
fn device_info(device_id: Option<String>) -> serde_json::Value {
    let uuid = device_id.unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
    json!({
        "uuid": uuid,
        "type": "native",
        "canAudio": true,
        "canVideo": false,
        "sendAudio": false,
        "receiveAudio": true,
    })
}


fn log_lifecycle(event: &Event) {
    let Event::Lifecycle(event) = event else {
        return;
    };
    match event {
        LifecycleEvent::StateChanged { from, to } => {
            tracing::debug!("State {} -> {}", from, to);
        }
        LifecycleEvent::Connected {
            endpoint,
            capabilities,
            reconnected,
        } => {
            tracing::info!(
                protocol = capabilities.protocol_version,
                compression = capabilities.compression,
                "{} to {}",
                if *reconnected { "Reconnected" } else { "Connected" },
                endpoint
            );
        }
        LifecycleEvent::Disconnected { reason } => {
            tracing::warn!("Disconnected: {}", reason);
        }
        LifecycleEvent::ReconnectFailed { attempt, error } => {
            tracing::warn!("Attempt {} failed: {}", attempt, error);
        }
        LifecycleEvent::Failed { reason } => {
            tracing::error!("Session failed: {}", reason);
        }
    }
}

fn log_diagnostic(diagnostic: &Diagnostic) {
    match diagnostic {
        Diagnostic::SequenceGap { expected, received } => {
            tracing::warn!("State delta gap: expected {}, received {}", expected, received);
        }
        other => tracing::debug!("Diagnostic: {:?}", other),
    }
}
