use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ahand_hub::{DeviceEvent, HubConfig, HubEvent, Registry, ws};
use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ahand-hub", about = "Accepts ahand device connections")]
struct Args {
    /// Path to config file (TOML)
    #[arg(long, short, env = "AHAND_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long, env = "AHAND_HUB_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ahand_hub=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = HubConfig::load(args.config.as_deref()).with_context(|| {
        format!(
            "failed to load config from {}",
            args.config.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
        )
    })?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let registry = Arc::new(Registry::new(&config));
    tokio::spawn(log_events(registry.subscribe()));

    let app = ws::router(Arc::clone(&registry), &config.ws_path);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    info!(listen = %config.listen, path = %config.ws_path, outbox_capacity = config.outbox_capacity, "ahand-hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<HubEvent>) {
    loop {
        match rx.recv().await {
            Ok(HubEvent { device_id, event }) => match event {
                DeviceEvent::Connected {
                    hello,
                    resumed,
                    replayed,
                } => {
                    info!(device_id = %device_id, hostname = %hello.hostname, resumed, replayed, "event: connected")
                }
                DeviceEvent::Disconnected => info!(device_id = %device_id, "event: disconnected"),
                DeviceEvent::ApprovalRequested(req) => {
                    info!(device_id = %device_id, job_id = %req.job_id, tool = %req.tool, caller_uid = %req.caller_uid, "event: approval requested")
                }
                DeviceEvent::ApprovalResolved(resp) => {
                    info!(device_id = %device_id, job_id = %resp.job_id, approved = resp.approved, "event: approval resolved")
                }
                DeviceEvent::CancelRequested { job_id } => {
                    info!(device_id = %device_id, job_id = %job_id, "event: cancel requested")
                }
                DeviceEvent::PolicyState(state) => {
                    info!(device_id = %device_id, allowed_tools = ?state.allowed_tools, denied_tools = ?state.denied_tools, "event: policy state")
                }
                DeviceEvent::SessionState(state) => {
                    info!(device_id = %device_id, caller_uid = %state.caller_uid, mode = state.mode, "event: session state")
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
