//! Binary handshake carried at the start of every tunnel connection.
//!
//! Layout (all offsets in bytes):
//!
//! ```text
//! 0        version (always 0)
//! 1..=16   identity token
//! 17       command (1 = TCP, 2 = UDP)
//! 18..=19  destination port, big-endian
//! 20       address type (1 = IPv4, 3 = domain)
//! 21..     address: 4 bytes for IPv4, or a length byte followed by the name
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

pub const VERSION: u8 = 0;
pub const TOKEN_LEN: usize = 16;

pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;

pub const ADDRESS_TYPE_IPV4: u8 = 1;
pub const ADDRESS_TYPE_DOMAIN: u8 = 3;

const COMMAND_OFFSET: usize = 1 + TOKEN_LEN;
const PORT_OFFSET: usize = COMMAND_OFFSET + 1;
const ADDRESS_TYPE_OFFSET: usize = PORT_OFFSET + 2;
const ADDRESS_OFFSET: usize = ADDRESS_TYPE_OFFSET + 1;

/// Smallest buffer that can possibly hold a header: everything up to the
/// address type plus one address byte.
pub const MIN_HEADER_LEN: usize = ADDRESS_OFFSET + 1;

/// Largest possible header: a domain name of 255 bytes.
pub const MAX_HEADER_LEN: usize = ADDRESS_OFFSET + 1 + u8::MAX as usize;

/// Acknowledgment written back once a handshake is accepted.
pub const RESPONSE_OK: [u8; 2] = [VERSION, 0];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
    #[error("empty domain name")]
    EmptyDomain,
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
}

/// Outcome of a parse attempt over the bytes received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    Complete(Header),
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Domain(name) => f.write_str(name),
        }
    }
}

/// The 16 identity bytes presented by a client. `Debug` never shows them.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken([u8; TOKEN_LEN]);

impl IdentityToken {
    #[must_use]
    pub const fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub token: IdentityToken,
    pub command: Command,
    pub port: u16,
    pub address: Address,
    /// Offset of the first byte after the header.
    pub consumed_len: usize,
}

impl Header {
    /// `host:port` form, for logging.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Attempts to decode a header from the start of `buffer`.
///
/// Pure over its input: callers accumulating a stream may call it again each
/// time the buffer grows. Bytes past `consumed_len` are left for the caller.
pub fn parse(buffer: &[u8]) -> Result<Parse, HeaderError> {
    if buffer.len() < MIN_HEADER_LEN {
        return Ok(Parse::Incomplete);
    }

    let version = buffer[0];
    if version != VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }

    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&buffer[1..COMMAND_OFFSET]);

    let command = match buffer[COMMAND_OFFSET] {
        COMMAND_TCP => Command::Tcp,
        COMMAND_UDP => Command::Udp,
        other => return Err(HeaderError::UnsupportedCommand(other)),
    };

    let port = u16::from_be_bytes([buffer[PORT_OFFSET], buffer[PORT_OFFSET + 1]]);

    let (address, consumed_len) = match buffer[ADDRESS_TYPE_OFFSET] {
        ADDRESS_TYPE_IPV4 => {
            let end = ADDRESS_OFFSET + 4;
            let Some(octets) = buffer.get(ADDRESS_OFFSET..end) else {
                return Ok(Parse::Incomplete);
            };
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (Address::Ipv4(ip), end)
        }
        ADDRESS_TYPE_DOMAIN => {
            let len = buffer[ADDRESS_OFFSET] as usize;
            if len == 0 {
                return Err(HeaderError::EmptyDomain);
            }
            let start = ADDRESS_OFFSET + 1;
            let end = start + len;
            let Some(name) = buffer.get(start..end) else {
                return Ok(Parse::Incomplete);
            };
            let name = std::str::from_utf8(name).map_err(|_| HeaderError::InvalidDomain)?;
            (Address::Domain(name.to_owned()), end)
        }
        other => return Err(HeaderError::UnsupportedAddressType(other)),
    };

    Ok(Parse::Complete(Header {
        version,
        token: IdentityToken::new(token),
        command,
        port,
        address,
        consumed_len,
    }))
}
