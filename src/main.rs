use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vless_relay::{ServerContext, load_config, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tunnel_path = %config.tunnel.path,
        handshake_timeout_secs = config.tunnel.handshake_timeout_secs,
        proxy_allowlist = config.listen.allowed_proxy_ips.is_some(),
        "Configuration loaded"
    );

    let context = Arc::new(ServerContext::new(config)?);
    let addr = context.config.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen_addr = %addr, error = %e, "Failed to bind listener");
            return Err(e).with_context(|| format!("Failed to bind to address {addr}"));
        }
    };

    info!(listen_addr = %addr, "Tunnel relay listening");

    serve(listener, context, shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
