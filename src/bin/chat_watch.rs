//! Chat room watcher
//!
//! Connects to the configured chat server, logs in when credentials are
//! available, subscribes to the message stream of every configured room
//! and logs whatever arrives until Ctrl+C.
//!
//! Usage: `chat_watch [config.yaml]` (defaults to `CHAT_CONFIG_PATH` or
//! `config/chat.yaml`).

use anyhow::{Context, Result};
use chatlink::bin_common::{init_tracing, load_config_from_env, parse_args, ConfigType};
use chatlink::config::ChatConfig;
use chatlink::ddp::{ClientEvent, EventHandler, PushEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let config_type = match args.first() {
        Some(path) => ConfigType::Custom(path.clone()),
        None => ConfigType::Chat,
    };
    let config_path = load_config_from_env(config_type);

    let config = if config_path.exists() {
        ChatConfig::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        ChatConfig::from_env().context("Failed to build config from environment")?
    };

    init_tracing(&config.log_level);
    config.log();

    let client = config.client_builder().build()?;
    client.connect().await.context("Initial connect failed")?;
    info!(session = ?client.session_id(), "Connected");

    if let Some(credentials) = config.credentials() {
        let login = client.login(credentials).await.context("Login failed")?;
        info!(user_id = %login.user_id, "Logged in");
    } else {
        warn!("No credentials configured, staying anonymous");
    }

    let (message_tx, message_rx) = crossbeam_channel::unbounded::<PushEvent>();
    let sink: Arc<dyn EventHandler> = Arc::new(message_tx);

    let mut handles = Vec::new();
    for room in &config.rooms {
        match client
            .subscribe("stream-room-messages", vec![json!(room), json!(false)], Some(Arc::clone(&sink)))
            .await
        {
            Ok(handle) => {
                info!(room = %room, id = %handle.id(), "Watching room");
                handles.push(handle);
            }
            Err(e) => error!(room = %room, "Subscribe failed: {}", e),
        }
    }
    drop(sink);

    info!("Press Ctrl+C to stop");
    let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                while let Some(event) = client.try_recv_event() {
                    log_client_event(&event);
                }
                while let Ok(push) = message_rx.try_recv() {
                    info!(
                        subscription = %push.subscription_id,
                        event = ?push.event_name,
                        "{}",
                        serde_json::Value::Array(push.args)
                    );
                }
            }
        }
    }

    for handle in handles {
        let name = handle.name().to_string();
        if let Err(e) = handle.unsubscribe().await {
            warn!(name = %name, "Unsubscribe failed: {}", e);
        }
    }
    client.disconnect().await?;

    let metrics = client.metrics();
    info!(
        sent = metrics.frames_sent,
        received = metrics.frames_received,
        reopens = metrics.reopen_count,
        "Stopped"
    );
    Ok(())
}

fn log_client_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected { session } => info!(session = %session, "Connected"),
        ClientEvent::Authenticated { user_id } => info!(user_id = %user_id, "Authenticated"),
        ClientEvent::Disconnected { reason } => warn!(reason = %reason, "Disconnected"),
        ClientEvent::Reopening { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reopening")
        }
        ClientEvent::ResumeFailed(reason) => warn!("Session resume failed: {}", reason),
        ClientEvent::Error(reason) => error!("Client error: {}", reason),
    }
}
