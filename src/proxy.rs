use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::{Instant, timeout_at},
};
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};
use tracing::{Span, debug, info, warn};

use crate::gate::{GateError, TunnelGate, negotiate};
use crate::http::{
    Route, read_request_head, route, switching_protocols, write_camouflage, write_not_found,
};
use crate::protocol::RESPONSE_OK;
use crate::relay::{connect_target, relay};
use crate::security::{is_proxy_ip_allowed, parse_original_client_ip};
use crate::server::ServerContext;

/// Serves one accepted connection from first byte to teardown.
///
/// Handshake failures of any kind end here with the socket dropped and
/// nothing written back.
#[tracing::instrument(
    skip(stream, context),
    fields(client_addr = %peer, client_ip = tracing::field::Empty)
)]
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    context: &ServerContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !is_proxy_ip_allowed(peer.ip(), context.allowed_proxies.as_deref()) {
        warn!("Dropping connection from address outside allowed_proxy_ips");
        return Ok(());
    }

    let deadline = Instant::now() + context.config.tunnel.handshake_timeout();
    let (head, rest) = timeout_at(deadline, read_request_head(&mut stream))
        .await
        .map_err(|_| anyhow!("Timed out waiting for request head"))??;

    if let Some(ip) = head.forwarded_for.as_deref().and_then(parse_original_client_ip) {
        Span::current().record("client_ip", ip.as_str());
    }

    match route(&head, &context.config.tunnel.path) {
        Route::Camouflage => {
            debug!(method = %head.method, path = %head.path, "Serving camouflage page");
            write_camouflage(&mut stream).await
        }
        Route::NotFound => {
            debug!(path = %head.path, "Plain request for tunnel path");
            write_not_found(&mut stream).await
        }
        Route::Drop => {
            debug!(path = %head.path, "Dropping upgrade request");
            Ok(())
        }
        Route::Tunnel => {
            let Some(key) = head.websocket_key.as_deref() else {
                return Ok(());
            };
            run_tunnel(stream, key, &rest, deadline, context).await
        }
    }
}

async fn run_tunnel<S>(
    mut stream: S,
    websocket_key: &str,
    initial: &[u8],
    deadline: Instant,
    context: &ServerContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tunnel = &context.config.tunnel;
    let mut gate = TunnelGate::new(&context.authenticator, tunnel.max_handshake_bytes);

    let negotiated = timeout_at(deadline, negotiate(&mut stream, &mut gate, initial))
        .await
        .unwrap_or(Err(GateError::Timeout));
    let (header, payload) = match negotiated {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(reason = %e, "Handshake rejected");
            return Ok(());
        }
    };

    info!(
        destination = %header.destination(),
        early_bytes = payload.len(),
        "Handshake accepted"
    );

    stream
        .write_all(&RESPONSE_OK)
        .await
        .context("Failed to write handshake response")?;
    stream
        .write_all(switching_protocols(websocket_key).as_bytes())
        .await
        .context("Failed to complete WebSocket upgrade")?;
    stream.flush().await.context("Failed to flush upgrade response")?;

    let mut websocket = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

    let target = match connect_target(&header.address, header.port, tunnel.connect_timeout()).await
    {
        Ok(target) => target,
        Err(e) => {
            if let Err(close_err) = websocket.close(None).await {
                debug!(error = %close_err, "Failed to close client WebSocket");
            }
            return Err(e);
        }
    };

    let teardown = relay(websocket, target, payload).await;
    info!(destination = %header.destination(), ?teardown, "Proxy connection closed");
    Ok(())
}
