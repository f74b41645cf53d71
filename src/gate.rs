//! Per-session handshake state machine.
//!
//! The gate owns the raw byte buffer until a header resolves. After that the
//! buffer is gone and only the bytes that trailed the header are handed on,
//! once, as the first payload of the stream.

use std::mem;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::auth::Authenticator;
use crate::protocol::{self, Command, Header, HeaderError, Parse};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("malformed handshake: {0}")]
    Malformed(#[from] HeaderError),
    #[error("identity token rejected")]
    Unauthorized,
    #[error("{0} relaying is not supported")]
    UnsupportedCommand(Command),
    #[error("handshake exceeded {limit} bytes")]
    Oversized { limit: usize },
    #[error("handshake timed out")]
    Timeout,
    #[error("connection closed during handshake")]
    ClosedEarly,
    #[error("handshake already completed")]
    AlreadyStreaming,
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
enum State {
    AwaitingHeader { buffer: Vec<u8> },
    Streaming,
}

#[derive(Debug)]
pub enum Step {
    /// Keep reading.
    Pending,
    /// Header accepted; `payload` is whatever followed it in the buffer.
    Accepted { header: Header, payload: Vec<u8> },
    /// Bytes received after the header resolved, passed through untouched.
    Payload(Vec<u8>),
    Rejected(GateError),
}

#[derive(Debug)]
pub struct TunnelGate<'a> {
    state: State,
    authenticator: &'a Authenticator,
    /// Backstop only. `protocol::parse` resolves or rejects within
    /// `MAX_HEADER_LEN` bytes, so any cap at or above that never fires.
    max_buffer: usize,
}

impl<'a> TunnelGate<'a> {
    #[must_use]
    pub const fn new(authenticator: &'a Authenticator, max_buffer: usize) -> Self {
        Self {
            state: State::AwaitingHeader { buffer: Vec::new() },
            authenticator,
            max_buffer,
        }
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self.state, State::Streaming)
    }

    pub fn on_bytes(&mut self, chunk: &[u8]) -> Step {
        let State::AwaitingHeader { buffer } = &mut self.state else {
            return Step::Payload(chunk.to_vec());
        };
        buffer.extend_from_slice(chunk);

        let header = match protocol::parse(buffer) {
            Ok(Parse::Complete(header)) => header,
            Ok(Parse::Incomplete) if buffer.len() >= self.max_buffer => {
                return Step::Rejected(GateError::Oversized {
                    limit: self.max_buffer,
                });
            }
            Ok(Parse::Incomplete) => return Step::Pending,
            Err(e) => return Step::Rejected(e.into()),
        };

        if !self.authenticator.authenticate(header.token.as_bytes()) {
            return Step::Rejected(GateError::Unauthorized);
        }
        if header.command != Command::Tcp {
            return Step::Rejected(GateError::UnsupportedCommand(header.command));
        }

        let payload = match mem::replace(&mut self.state, State::Streaming) {
            State::AwaitingHeader { mut buffer } => buffer.split_off(header.consumed_len),
            State::Streaming => Vec::new(),
        };
        Step::Accepted { header, payload }
    }
}

/// Feeds `initial` and then raw reads from `stream` into the gate until it
/// accepts or rejects.
///
/// Reads stop at the chunk that completes the header; nothing past that chunk
/// is consumed from the stream.
pub async fn negotiate<S>(
    stream: &mut S,
    gate: &mut TunnelGate<'_>,
    initial: &[u8],
) -> Result<(Header, Vec<u8>), GateError>
where
    S: AsyncRead + Unpin,
{
    let mut step = if initial.is_empty() {
        Step::Pending
    } else {
        gate.on_bytes(initial)
    };
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match step {
            Step::Accepted { header, payload } => return Ok((header, payload)),
            Step::Rejected(e) => return Err(e),
            Step::Payload(_) => return Err(GateError::AlreadyStreaming),
            Step::Pending => {}
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GateError::ClosedEarly);
        }
        step = gate.on_bytes(&chunk[..n]);
    }
}
