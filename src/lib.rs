//! VLESS-style tunneling relay
//!
//! Accepts WebSocket upgrade requests on a single path, reads an authenticated binary
//! handshake naming a destination, dials it over TCP and relays bytes both ways.
//! Every other request gets an ordinary-looking web page.

pub mod auth;
pub mod config;
pub mod gate;
pub mod http;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod security;
pub mod server;

// Re-export commonly used types and functions
pub use auth::Authenticator;
pub use config::{Config, ListenConfig, TunnelConfig, load_config};
pub use gate::{GateError, Step, TunnelGate};
pub use protocol::{Address, Command, Header, HeaderError, Parse, parse};
pub use proxy::handle_connection;
pub use relay::{BUFFER_SIZE, Teardown, connect_target, relay};
pub use security::{is_proxy_ip_allowed, parse_original_client_ip};
pub use server::{ServerContext, serve};
