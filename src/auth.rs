use anyhow::{Context, Result};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::protocol::TOKEN_LEN;

/// Checks handshake identity tokens against the configured secret.
#[derive(Clone)]
pub struct Authenticator {
    secret: [u8; TOKEN_LEN],
}

impl Authenticator {
    /// Builds an authenticator from a UUID string, hyphenated or not.
    pub fn from_uuid(secret: &str) -> Result<Self> {
        let uuid = Uuid::try_parse(secret.trim()).context("Tunnel secret is not a valid UUID")?;
        Ok(Self {
            secret: *uuid.as_bytes(),
        })
    }

    /// Returns true only for a token of exactly 16 bytes matching the secret.
    #[must_use]
    pub fn authenticate(&self, token: &[u8]) -> bool {
        token.len() == TOKEN_LEN && bool::from(self.secret.as_slice().ct_eq(token))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}
