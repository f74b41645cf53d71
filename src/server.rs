use anyhow::Result;
use ipnet::IpNet;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinSet, time::timeout};
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::proxy::handle_connection;
use crate::security::parse_allowlist;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session may read. Built once at startup, never mutated.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub authenticator: Authenticator,
    pub allowed_proxies: Option<Vec<IpNet>>,
}

impl ServerContext {
    pub fn new(config: Config) -> Result<Self> {
        let authenticator = Authenticator::from_uuid(&config.tunnel.uuid)?;
        let allowed_proxies = config
            .listen
            .allowed_proxy_ips
            .as_deref()
            .map(parse_allowlist)
            .transpose()?;

        Ok(Self {
            config,
            authenticator,
            allowed_proxies,
        })
    }
}

/// Accepts connections until `shutdown` resolves, then closes the listener and
/// waits for open sessions, aborting whatever outlives the shutdown timeout.
pub async fn serve<F>(listener: TcpListener, context: Arc<ServerContext>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut sessions = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let context = Arc::clone(&context);
                    sessions.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, &context).await {
                            error!(
                                client_addr = %addr,
                                error = %format_args!("{e:#}"),
                                "Connection failed"
                            );
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);

    let grace = context.config.listen.shutdown_timeout();
    let drained = timeout(grace, async { while sessions.join_next().await.is_some() {} })
        .await
        .is_ok();
    if !drained {
        warn!(
            remaining = sessions.len(),
            "Aborting sessions still open after shutdown timeout"
        );
        sessions.shutdown().await;
    }

    info!("All sessions closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{TOKEN, domain_header, ipv4_header};
    use anyhow::Context;
    use futures_util::{SinkExt, StreamExt};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
        task::JoinHandle,
        time::sleep,
    };
    use tokio_tungstenite::{
        WebSocketStream,
        tungstenite::{Message, protocol::Role},
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(3);
    const DATA_PROCESSING_DELAY: Duration = Duration::from_millis(200);

    struct Relay {
        port: u16,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<()>>,
    }

    /// Starts the relay on a free port with the default secret
    async fn start_relay_with(configure: impl FnOnce(&mut Config)) -> Result<Relay> {
        let mut config = Config::default();
        config.listen.ip = "127.0.0.1".to_string();
        config.listen.shutdown_timeout_secs = 1;
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind relay")?;
        let port = listener
            .local_addr()
            .context("Failed to get relay local address")?
            .port();

        let context = Arc::new(ServerContext::new(config)?);
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, context, async move {
            let _ = signal.await;
        }));

        Ok(Relay {
            port,
            shutdown,
            task,
        })
    }

    async fn start_relay() -> Result<Relay> {
        start_relay_with(|_| {}).await
    }

    /// Starts TCP echo server on free port, returns port number
    async fn start_echo_server() -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind echo server")?;
        let port = listener
            .local_addr()
            .context("Failed to get echo server local address")?
            .port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        Ok(port)
    }

    /// Creates TCP server that reports everything it read once the peer ends the stream
    async fn create_capturing_tcp_server() -> (u16, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = tcp_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = tcp_listener.accept().await {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = tx.send(received);
            }
        });

        (tcp_port, rx)
    }

    /// Creates TCP server that sends data to first connection, then closes it
    async fn create_sending_tcp_server(data: Vec<u8>) -> u16 {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = tcp_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = tcp_listener.accept().await {
                sleep(DATA_PROCESSING_DELAY).await;
                let _ = stream.write_all(&data).await;
            }
        });

        tcp_port
    }

    fn upgrade_request(path: &str) -> String {
        format!(
            "GET {path} HTTP/1.1\r\nHost: relay.test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    /// Reads a response head byte by byte so no WebSocket frame gets swallowed
    async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let byte = timeout(TEST_TIMEOUT, stream.read_u8())
                .await
                .context("Timeout waiting for response head")?
                .context("Connection closed during response head")?;
            head.push(byte);
        }
        Ok(String::from_utf8(head)?)
    }

    /// Sends the upgrade request with `handshake` appended, checks the
    /// acknowledgment and the 101, and returns the client WebSocket
    async fn open_tunnel(port: u16, handshake: &[u8]) -> Result<WebSocketStream<TcpStream>> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .context("Failed to connect to relay")?;

        let mut request = upgrade_request("/vl").into_bytes();
        request.extend_from_slice(handshake);
        stream.write_all(&request).await?;

        let mut ack = [0u8; 2];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut ack))
            .await
            .context("Timeout waiting for handshake response")??;
        anyhow::ensure!(ack == [0, 0], "unexpected handshake response {ack:?}");

        let head = read_response_head(&mut stream).await?;
        anyhow::ensure!(
            head.starts_with("HTTP/1.1 101"),
            "unexpected upgrade response {head}"
        );
        anyhow::ensure!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        Ok(WebSocketStream::from_raw_socket(stream, Role::Client, None).await)
    }

    async fn receive_binary_message(ws: &mut WebSocketStream<TcpStream>) -> Result<Vec<u8>> {
        let response = timeout(TEST_TIMEOUT, ws.next())
            .await
            .context("Timeout waiting for message")?
            .context("No message received")?
            .context("WebSocket error")?;

        match response {
            Message::Binary(data) => Ok(data.to_vec()),
            other => anyhow::bail!("Expected binary message, got: {other:?}"),
        }
    }

    async fn assert_closed_by_peer(ws: &mut WebSocketStream<TcpStream>) {
        match timeout(TEST_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Close(_))) | None | Some(Err(_))) => {}
            Ok(Some(Ok(other))) => panic!("expected close, got {other:?}"),
            Err(_) => panic!("WebSocket was never closed"),
        }
    }

    /// Asserts the relay hung up without writing a single byte
    async fn assert_dropped_silently(stream: &mut TcpStream) {
        let mut received = Vec::new();
        let result = timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
            .await
            .expect("connection was left open");
        // a reset counts as a close too
        if result.is_ok() {
            assert!(received.is_empty(), "unexpected reply {received:?}");
        }
    }

    async fn send_raw(port: u16, bytes: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream
    }

    fn localhost_header(port: u16) -> Vec<u8> {
        ipv4_header(TOKEN, [127, 0, 0, 1], port)
    }

    mod tunnel_functionality {
        use super::*;

        #[tokio::test]
        async fn relays_through_ipv4_destination() {
            let echo_port = start_echo_server().await.unwrap();
            let relay = start_relay().await.unwrap();
            let mut ws = open_tunnel(relay.port, &localhost_header(echo_port))
                .await
                .unwrap();

            ws.send(Message::Binary(b"Hello tunnel!".to_vec().into()))
                .await
                .unwrap();
            assert_eq!(receive_binary_message(&mut ws).await.unwrap(), b"Hello tunnel!");
        }

        #[tokio::test]
        async fn relays_through_domain_destination() {
            let echo_port = start_echo_server().await.unwrap();
            let relay = start_relay().await.unwrap();
            let mut ws = open_tunnel(relay.port, &domain_header(TOKEN, "localhost", echo_port))
                .await
                .unwrap();

            ws.send(Message::Binary(b"via name".to_vec().into()))
                .await
                .unwrap();
            assert_eq!(receive_binary_message(&mut ws).await.unwrap(), b"via name");
        }

        #[tokio::test]
        async fn forwards_early_payload_then_messages_in_order() {
            let (tcp_port, received) = create_capturing_tcp_server().await;
            let relay = start_relay().await.unwrap();

            let mut handshake = localhost_header(tcp_port);
            handshake.extend_from_slice(b"A");
            let mut ws = open_tunnel(relay.port, &handshake).await.unwrap();

            for chunk in [b"B", b"C"] {
                ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
            }
            ws.close(None).await.unwrap();

            let received = timeout(TEST_TIMEOUT, received).await.unwrap().unwrap();
            assert_eq!(received, b"ABC");
        }

        #[tokio::test]
        async fn forwards_target_data_then_closes_client() {
            let tcp_port = create_sending_tcp_server(b"Data from target".to_vec()).await;
            let relay = start_relay().await.unwrap();
            let mut ws = open_tunnel(relay.port, &localhost_header(tcp_port))
                .await
                .unwrap();

            assert_eq!(
                receive_binary_message(&mut ws).await.unwrap(),
                b"Data from target"
            );
            assert_closed_by_peer(&mut ws).await;
        }

        #[tokio::test]
        async fn handles_concurrent_tunnels() {
            let echo_port = start_echo_server().await.unwrap();
            let relay = start_relay().await.unwrap();
            let relay_port = relay.port;

            let tasks: Vec<_> = (0..3)
                .map(|i| {
                    tokio::spawn(async move {
                        let mut ws = open_tunnel(relay_port, &localhost_header(echo_port))
                            .await
                            .unwrap();
                        let data = format!("Message from client {i}").into_bytes();
                        ws.send(Message::Binary(data.clone().into())).await.unwrap();
                        assert_eq!(receive_binary_message(&mut ws).await.unwrap(), data);
                    })
                })
                .collect();

            for task in tasks {
                task.await.unwrap();
            }
        }
    }

    mod rejection {
        use super::*;

        async fn assert_handshake_rejected(handshake: &[u8]) {
            let relay = start_relay().await.unwrap();
            let mut request = upgrade_request("/vl").into_bytes();
            request.extend_from_slice(handshake);

            let mut stream = send_raw(relay.port, &request).await;
            assert_dropped_silently(&mut stream).await;
        }

        #[tokio::test]
        async fn drops_wrong_token() {
            let mut token = TOKEN;
            token[0] ^= 0x80;
            assert_handshake_rejected(&ipv4_header(token, [127, 0, 0, 1], 80)).await;
        }

        #[tokio::test]
        async fn drops_wrong_version() {
            let mut handshake = localhost_header(80);
            handshake[0] = 1;
            assert_handshake_rejected(&handshake).await;
        }

        #[tokio::test]
        async fn drops_unsupported_address_type() {
            let mut handshake = localhost_header(80);
            handshake[20] = 0x02;
            assert_handshake_rejected(&handshake).await;
        }

        #[tokio::test]
        async fn drops_udp_command() {
            let mut handshake = localhost_header(53);
            handshake[17] = crate::protocol::COMMAND_UDP;
            assert_handshake_rejected(&handshake).await;
        }

        #[tokio::test]
        async fn drops_truncated_domain_when_client_stops_sending() {
            let relay = start_relay().await.unwrap();
            let handshake = domain_header(TOKEN, "example.com", 443);
            let mut request = upgrade_request("/vl").into_bytes();
            request.extend_from_slice(&handshake[..handshake.len() - 4]);

            let mut stream = send_raw(relay.port, &request).await;
            stream.shutdown().await.unwrap();
            assert_dropped_silently(&mut stream).await;
        }

        #[tokio::test]
        async fn drops_stalled_handshake_after_timeout() {
            let relay = start_relay_with(|config| config.tunnel.handshake_timeout_secs = 1)
                .await
                .unwrap();
            let mut request = upgrade_request("/vl").into_bytes();
            request.extend_from_slice(&localhost_header(80)[..10]);

            let mut stream = send_raw(relay.port, &request).await;
            assert_dropped_silently(&mut stream).await;
        }

        #[tokio::test]
        async fn closes_tunnel_when_target_unreachable() {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let dead_port = unused.local_addr().unwrap().port();
            drop(unused);

            let relay = start_relay().await.unwrap();
            let mut ws = open_tunnel(relay.port, &localhost_header(dead_port))
                .await
                .unwrap();
            assert_closed_by_peer(&mut ws).await;
        }

        #[tokio::test]
        async fn drops_peers_outside_allowlist() {
            let relay = start_relay_with(|config| {
                config.listen.allowed_proxy_ips = Some(vec!["10.0.0.0/8".to_string()]);
            })
            .await
            .unwrap();

            let mut stream = send_raw(relay.port, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
            assert_dropped_silently(&mut stream).await;
        }
    }

    mod camouflage {
        use super::*;

        async fn fetch(port: u16, request: &str) -> String {
            let mut stream = send_raw(port, request.as_bytes()).await;
            let mut response = String::new();
            timeout(TEST_TIMEOUT, stream.read_to_string(&mut response))
                .await
                .unwrap()
                .unwrap();
            response
        }

        #[tokio::test]
        async fn serves_page_for_other_paths() {
            let relay = start_relay().await.unwrap();
            let response = fetch(relay.port, "GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n").await;

            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("Content-Type: text/html"));
            assert!(response.ends_with(crate::http::CAMOUFLAGE_PAGE));
        }

        #[tokio::test]
        async fn plain_request_for_tunnel_path_is_not_found() {
            let relay = start_relay().await.unwrap();
            let response = fetch(relay.port, "GET /vl HTTP/1.1\r\nHost: a\r\n\r\n").await;

            assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
            assert!(response.ends_with("Not Found"));
        }

        #[tokio::test]
        async fn upgrade_on_other_path_gets_no_response() {
            let relay = start_relay().await.unwrap();
            let mut stream = send_raw(relay.port, upgrade_request("/chat").as_bytes()).await;
            assert_dropped_silently(&mut stream).await;
        }

        #[tokio::test]
        async fn honors_configured_tunnel_path() {
            let echo_port = start_echo_server().await.unwrap();
            let relay = start_relay_with(|config| config.tunnel.path = "/secret".to_string())
                .await
                .unwrap();

            let response = fetch(relay.port, "GET /vl HTTP/1.1\r\nHost: a\r\n\r\n").await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

            let mut request = upgrade_request("/secret").into_bytes();
            request.extend_from_slice(&localhost_header(echo_port));
            let mut stream = send_raw(relay.port, &request).await;
            let mut ack = [0u8; 2];
            timeout(TEST_TIMEOUT, stream.read_exact(&mut ack))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ack, [0, 0]);
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn stops_accepting_after_shutdown() {
            let relay = start_relay().await.unwrap();
            relay.shutdown.send(()).unwrap();

            let result = timeout(TEST_TIMEOUT, relay.task).await.unwrap().unwrap();
            assert!(result.is_ok());
            assert!(TcpStream::connect(("127.0.0.1", relay.port)).await.is_err());
        }

        #[tokio::test]
        async fn aborts_sessions_outliving_shutdown_timeout() {
            let echo_port = start_echo_server().await.unwrap();
            let relay = start_relay().await.unwrap();
            let mut ws = open_tunnel(relay.port, &localhost_header(echo_port))
                .await
                .unwrap();

            relay.shutdown.send(()).unwrap();
            let result = timeout(TEST_TIMEOUT, relay.task).await.unwrap().unwrap();
            assert!(result.is_ok());
            assert_closed_by_peer(&mut ws).await;
        }

        #[test]
        fn rejects_invalid_secret_at_startup() {
            let mut config = Config::default();
            config.tunnel.uuid = "not-a-uuid".to_string();
            assert!(ServerContext::new(config).is_err());
        }

        #[test]
        fn rejects_invalid_allowlist_at_startup() {
            let mut config = Config::default();
            config.listen.allowed_proxy_ips = Some(vec!["nope".to_string()]);
            assert!(ServerContext::new(config).is_err());
        }
    }
}
