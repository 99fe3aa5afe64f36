//! Pairing gate — binds consumer instances to the broker.
//!
//! One short-lived six-digit code is outstanding at a time; confirming it
//! mints a long-lived opaque token. Tokens are held as a set, so several
//! consumers can stay paired independently.

use std::collections::HashSet;
use std::time::Duration;

use chorus_core::{Error, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::info;

struct IssuedCode {
    code: String,
    issued_at: tokio::time::Instant,
}

pub struct PairingGate {
    ttl: Duration,
    code: Mutex<Option<IssuedCode>>,
    tokens: Mutex<HashSet<String>>,
}

impl PairingGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            code: Mutex::new(None),
            tokens: Mutex::new(HashSet::new()),
        }
    }

    /// Issue a fresh pairing code, replacing any outstanding one.
    pub fn issue_code(&self) -> String {
        let code = generate_code();
        info!("Pairing code issued");
        *self.code.lock() = Some(IssuedCode {
            code: code.clone(),
            issued_at: tokio::time::Instant::now(),
        });
        code
    }

    /// Exchange a code for a token. The code is single-use; a stale code
    /// reports expiry, a wrong or absent one is unauthorized.
    pub fn confirm(&self, code: &str) -> Result<String> {
        let mut slot = self.code.lock();
        let issued = slot.as_ref().ok_or(Error::Unauthorized)?;

        if issued.issued_at.elapsed() > self.ttl {
            *slot = None;
            return Err(Error::TokenExpired);
        }
        if issued.code != code {
            return Err(Error::Unauthorized);
        }
        *slot = None;

        let token = mint_token(code);
        self.tokens.lock().insert(token.clone());
        info!("Consumer paired ({} active tokens)", self.tokens.lock().len());
        Ok(token)
    }

    /// Check a presented token. Absence or mismatch is unauthorized.
    pub fn validate(&self, token: Option<&str>) -> Result<()> {
        match token {
            Some(token) if self.tokens.lock().contains(token) => Ok(()),
            _ => Err(Error::Unauthorized),
        }
    }

    /// Explicit unpairing. Returns whether the token was known.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.lock().remove(token)
    }

    pub fn is_paired(&self) -> bool {
        !self.tokens.lock().is_empty()
    }
}

fn generate_code() -> String {
    let bytes = *uuid::Uuid::new_v4().as_bytes();
    let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    format!("{:06}", n % 1_000_000)
}

/// Opaque token: hash of fresh randomness plus the confirmed code.
fn mint_token(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}
