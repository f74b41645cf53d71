use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

use crate::protocol::MAX_HEADER_LEN;

pub const DEFAULT_UUID: &str = "de04add9-5c68-8bab-950c-08cd5320df18";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PATH: &str = "/vl";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            allowed_proxy_ips: None,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub uuid: String,
    pub path: String,
    pub handshake_timeout_secs: u64,
    pub max_handshake_bytes: usize,
    pub connect_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            uuid: DEFAULT_UUID.to_string(),
            path: DEFAULT_PATH.to_string(),
            handshake_timeout_secs: 10,
            max_handshake_bytes: 4096,
            connect_timeout_secs: 10,
        }
    }
}

impl ListenConfig {
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl TunnelConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration as valid TOML")
    }

    /// Overrides file values with `UUID`, `PORT` and `VLESS_PATH`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uuid) = lookup("UUID") {
            self.tunnel.uuid = uuid;
        }
        if let Some(port) = lookup("PORT") {
            self.listen.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
        }
        if let Some(path) = lookup("VLESS_PATH") {
            self.tunnel.path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tunnel.path.starts_with('/') {
            bail!("Tunnel path must start with '/': {}", self.tunnel.path);
        }
        if self.tunnel.max_handshake_bytes < MAX_HEADER_LEN {
            bail!(
                "max_handshake_bytes must be at least {MAX_HEADER_LEN}, got {}",
                self.tunnel.max_handshake_bytes
            );
        }
        if self.tunnel.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be greater than zero");
        }
        if self.tunnel.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.ip, self.listen.port)
    }
}

/// Loads defaults, then `RELAY_CONFIG` (or `config.toml` when present), then
/// environment overrides.
pub fn load_config() -> Result<Config> {
    let explicit = env::var("RELAY_CONFIG").ok();
    let path = explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);

    let mut config = if explicit.is_some() || Path::new(path).exists() {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {path} file"))?;
        Config::from_toml(&content).with_context(|| format!("Invalid configuration in {path}"))?
    } else {
        Config::default()
    };

    config.apply_env(|key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
