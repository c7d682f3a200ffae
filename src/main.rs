//! wshub server, a WebSocket relay
//!
//! Every message a client sends is forwarded to all other connected clients.
//! Join and leave notices are broadcast as JSON.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

use wshub_core::HubResult;
use wshub_core::config::AppConfig;
use wshub_realtime::{ServerConfig, TungsteniteTransport, WsServer};

/// Server-generated notices, tagged by `type`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Notice {
    Welcome { id: String, peers: usize },
    Joined { id: String },
    Left { id: String, code: u16 },
}

#[tokio::main]
async fn main() {
    let env = std::env::var("WSHUB_ENV").unwrap_or_else(|_| "development".to_string());

    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    tracing::info!(env = %env, "Configuration loaded");

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

async fn run(config: AppConfig) -> HubResult<()> {
    tracing::info!("Starting wshub v{}", env!("CARGO_PKG_VERSION"));

    let transport = TungsteniteTransport::bind(config.server.bind_addr()).await?;
    let addr = transport.local_addr()?;

    // Handlers need the server they belong to, which exists only after create.
    let handle = Arc::new(OnceLock::new());
    let server = WsServer::create(Arc::new(transport), relay_config(&config, handle.clone()));
    let _ = handle.set(server.clone());

    tracing::info!(%addr, "wshub relay listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let grace = config.server.shutdown_grace();
    if tokio::time::timeout(grace, server.shutdown()).await.is_err() {
        tracing::warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed");
    }

    Ok(())
}

fn relay_config(config: &AppConfig, server: Arc<OnceLock<WsServer>>) -> ServerConfig {
    let on_connect = server.clone();
    let on_message = server.clone();
    let on_close = server;

    ServerConfig::new()
        .with_timeout(config.heartbeat.interval())
        .on_connection(move |conn| {
            let Some(server) = on_connect.get() else {
                return;
            };
            let id = conn.id.to_string();
            let welcome = Notice::Welcome {
                id: id.clone(),
                peers: server.connection_count().saturating_sub(1),
            };
            report(server.send_json(conn, &welcome));
            report(server.broadcast_json(&Notice::Joined { id }, Some(conn)));
        })
        .on_message(move |payload, conn| {
            if let Some(server) = on_message.get() {
                let recipients = server.broadcast(payload, Some(conn));
                tracing::debug!(conn_id = %conn.id, recipients, "Relayed message");
            }
        })
        .on_error(|error, conn| {
            tracing::warn!(conn_id = %conn.id, error = %error, "Connection error");
        })
        .on_close(move |code, _reason, conn| {
            if let Some(server) = on_close.get() {
                let left = Notice::Left {
                    id: conn.id.to_string(),
                    code,
                };
                report(server.broadcast_json(&left, None));
            }
        })
}

fn report<T>(result: HubResult<T>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to encode notice");
    }
}
