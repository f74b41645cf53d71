use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as TungsteniteError, Message, error::ProtocolError},
};
use tracing::{debug, error, info};

use crate::protocol::Address;

pub const BUFFER_SIZE: usize = 8192;

/// How long a half-closed target may keep sending before it is dropped.
const HALF_CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    ClientClosed,
    ClientFailed,
    TargetClosed,
    TargetFailed,
}

/// Dials the destination named in a handshake. No retries.
pub async fn connect_target(
    address: &Address,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let target_addr = format!("{address}:{port}");
    debug!(target_addr = %target_addr, "Attempting to connect to target server");

    let connect = async {
        match address {
            Address::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
            Address::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
        }
    };
    let stream = timeout(connect_timeout, connect)
        .await
        .with_context(|| format!("Timed out connecting to target {target_addr}"))?
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;
    stream
        .set_nodelay(true)
        .context("Failed to set TCP_NODELAY on target connection")?;

    info!(target_addr = %target_addr, "Connected to target server");
    Ok(stream)
}

/// Pumps bytes between the client WebSocket and the target until one side
/// ends, then tears both down.
///
/// `first_payload` is written to the target before anything else.
pub async fn relay<C, T>(
    websocket: WebSocketStream<C>,
    target: T,
    first_payload: Vec<u8>,
) -> Teardown
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (mut target_reader, mut target_writer) = tokio::io::split(target);

    let early = async {
        if first_payload.is_empty() {
            return Ok(());
        }
        debug!(bytes = first_payload.len(), "Forwarding early payload to target");
        target_writer.write_all(&first_payload).await
    };

    let early_result = early.await;
    let teardown = match early_result {
        Ok(()) => pump(
            &mut ws_sender,
            &mut ws_receiver,
            &mut target_reader,
            &mut target_writer,
        )
        .await,
        Err(e) => {
            error!(error = %e, "Failed to write early payload to target");
            Teardown::TargetFailed
        }
    };

    match teardown {
        Teardown::ClientClosed | Teardown::ClientFailed => {
            // answer the close handshake and release the client before lingering
            if let Err(e) = ws_sender.close().await {
                debug!(error = %e, "Failed to close client WebSocket");
            }
            drop(ws_sender);
            drop(ws_receiver);

            if let Err(e) = target_writer.shutdown().await {
                debug!(error = %e, "Failed to half-close target");
            }
            // the client is gone, so whatever the target still sends is discarded
            let _ = timeout(
                HALF_CLOSE_LINGER,
                tokio::io::copy(&mut target_reader, &mut tokio::io::sink()),
            )
            .await;
        }
        Teardown::TargetClosed | Teardown::TargetFailed => {
            if let Err(e) = ws_sender.close().await {
                debug!(error = %e, "Failed to close client WebSocket");
            }
        }
    }

    teardown
}

async fn pump<S, R, TR, TW>(
    ws_sender: &mut S,
    ws_receiver: &mut R,
    target_reader: &mut TR,
    target_writer: &mut TW,
) -> Teardown
where
    S: futures_util::Sink<Message, Error = TungsteniteError> + Unpin,
    R: futures_util::Stream<Item = Result<Message, TungsteniteError>> + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    let client_to_target = async {
        while let Some(msg) = ws_receiver.next().await {
            let written = match msg {
                Ok(Message::Binary(data)) => {
                    debug!(bytes = data.len(), "Forwarding data from WebSocket to target");
                    target_writer.write_all(&data).await
                }
                Ok(Message::Text(text)) => {
                    debug!(bytes = text.len(), "Forwarding text data from WebSocket to target");
                    target_writer.write_all(text.as_bytes()).await
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    return Teardown::ClientClosed;
                }
                Ok(_) => continue,
                Err(e) => {
                    return match e {
                        TungsteniteError::ConnectionClosed
                        | TungsteniteError::Protocol(
                            ProtocolError::ResetWithoutClosingHandshake,
                        ) => {
                            debug!("Client disconnected: {e}");
                            Teardown::ClientClosed
                        }
                        _ => {
                            error!("WebSocket error: {e}");
                            Teardown::ClientFailed
                        }
                    };
                }
            };
            if let Err(e) = written {
                error!(error = %e, "Failed to write to target");
                return Teardown::TargetFailed;
            }
        }
        Teardown::ClientClosed
    };

    let target_to_client = async {
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            match target_reader.read(&mut buffer).await {
                Ok(0) => {
                    info!("Target connection closed");
                    return Teardown::TargetClosed;
                }
                Ok(n) => {
                    debug!(bytes = n, "Forwarding data from target to WebSocket");
                    if let Err(e) = ws_sender
                        .send(Message::Binary(buffer[..n].to_vec().into()))
                        .await
                    {
                        debug!(error = %e, bytes = n, "Failed to send WebSocket message");
                        return Teardown::ClientFailed;
                    }
                }
                Err(e) => {
                    error!("Failed to read from target: {e}");
                    return Teardown::TargetFailed;
                }
            }
        }
    };

    tokio::select! {
        end = client_to_target => end,
        end = target_to_client => end,
    }
}
