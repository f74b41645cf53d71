//! Minimal HTTP/1.1 front: reads a request head off the raw socket, decides
//! what to do with it and writes the few fixed responses the relay ever sends.

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

const MAX_HEADERS: usize = 64;
pub const MAX_REQUEST_HEAD: usize = 8192;

pub const CAMOUFLAGE_PAGE: &str =
    "<!DOCTYPE html><html><head><title>Welcome</title></head><body><h1>It works!</h1></body></html>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// `Connection: upgrade` with any `Upgrade` protocol.
    pub is_upgrade: bool,
    pub is_websocket: bool,
    pub websocket_key: Option<String>,
    pub forwarded_for: Option<String>,
}

impl RequestHead {
    /// Request path without its query string.
    #[must_use]
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Plain request for anything but the tunnel path.
    Camouflage,
    /// Plain request for the tunnel path.
    NotFound,
    /// Upgrade request that gets no answer at all.
    Drop,
    Tunnel,
}

#[must_use]
pub fn route(head: &RequestHead, tunnel_path: &str) -> Route {
    let on_tunnel_path = head.route_path() == tunnel_path;
    match (head.is_upgrade, on_tunnel_path) {
        (false, false) => Route::Camouflage,
        (false, true) => Route::NotFound,
        (true, true) if head.is_websocket && head.websocket_key.is_some() => Route::Tunnel,
        (true, _) => Route::Drop,
    }
}

/// Parses a complete request head, returning it with the number of bytes it used.
pub fn parse_request_head(buffer: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_len = match req.parse(buffer) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => bail!("Invalid HTTP request: {e}"),
    };

    let mut upgrade_protocol = None;
    let mut connection_upgrade = false;
    let mut websocket_key = None;
    let mut forwarded_for = None;

    for header in req.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade_protocol = Some(value.trim().to_ascii_lowercase());
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_upgrade = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            websocket_key = Some(value.trim().to_string());
        } else if header.name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(value.into_owned());
        }
    }

    let upgrade_protocol = upgrade_protocol.unwrap_or_default();
    let head = RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or_default().to_string(),
        is_upgrade: connection_upgrade && !upgrade_protocol.is_empty(),
        is_websocket: upgrade_protocol == "websocket",
        websocket_key,
        forwarded_for,
    };
    Ok(Some((head, header_len)))
}

/// Reads until a full request head is available.
///
/// Returns the head together with any bytes that arrived after it; those
/// belong to whatever the connection carries next.
pub async fn read_request_head<S>(stream: &mut S) -> Result<(RequestHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read HTTP request")?;
        if n == 0 {
            bail!("Connection closed before request head was complete");
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some((head, header_len)) = parse_request_head(&buffer)? {
            debug!(
                method = %head.method,
                path = %head.path,
                upgrade = head.is_upgrade,
                "Parsed request head"
            );
            let rest = buffer.split_off(header_len);
            return Ok((head, rest));
        }

        if buffer.len() >= MAX_REQUEST_HEAD {
            return Err(anyhow!("Request head exceeds {MAX_REQUEST_HEAD} bytes"));
        }
    }
}

async fn write_response<S>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .context("Failed to write HTTP response")?;
    stream.shutdown().await.context("Failed to close HTTP response")
}

pub async fn write_camouflage<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, "200 OK", "text/html; charset=utf-8", CAMOUFLAGE_PAGE).await
}

pub async fn write_not_found<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, "404 Not Found", "text/plain", "Not Found").await
}

/// `101` response completing the WebSocket upgrade for `key`.
#[must_use]
pub fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    )
}
