//! Shared fixtures for the engine test suites.
#![allow(dead_code)]

use secrecy::SecretString;
use towervault::error::{Result, VaultError};
use towervault::token::{TokenDevice, TokenInfo};
use towervault::SecurityPolicy;

pub fn pw(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

pub fn default_policy() -> SecurityPolicy {
    SecurityPolicy::default()
}

/// Deterministic software token: HMAC-SHA256 over the challenge with a
/// fixed secret, like a real HMAC challenge-response device.
pub struct MockToken {
    pub secret: Vec<u8>,
    pub present: bool,
    pub serial: String,
    pub touches: u32,
}

impl MockToken {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            present: true,
            serial: "MOCK-0001".to_string(),
            touches: 0,
        }
    }
}

impl TokenDevice for MockToken {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_present(&self) -> bool {
        self.present
    }

    fn info(&self) -> Result<TokenInfo> {
        if !self.present {
            return Err(VaultError::TokenNotPresent);
        }
        Ok(TokenInfo {
            serial: self.serial.clone(),
            model: Some("MockToken".to_string()),
        })
    }

    fn challenge_response(
        &mut self,
        challenge: &[u8],
        require_touch: bool,
        _timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        if !self.present {
            return Err(VaultError::TokenNotPresent);
        }
        if require_touch {
            self.touches += 1;
        }
        let digest = towervault::crypto::hmac_sha256(&self.secret, challenge)?;
        Ok(digest.to_vec())
    }
}
