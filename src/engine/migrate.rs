//! Legacy V1 container support.
//!
//! V1 is the single-user format: one password-derived key encrypts the
//! payload directly, with optional FEC and an optional vault-level token
//! combine. The engine reads V1 and converts it to V2; it never writes
//! V1. Conversion is irreversible — V1 readers cannot interpret V2 files,
//! which is why a `.v1.backup` snapshot is taken first.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::fec::ReedSolomonCodec;
use crate::format::envelope::V1Envelope;
use crate::keys;
use crate::secure::SecureBuffer;
use crate::token::{TokenDevice, CHALLENGE_TIMEOUT_MS};

/// Sibling path of the pre-conversion snapshot.
pub fn v1_backup_path(vault_path: &Path) -> PathBuf {
    let mut p = vault_path.as_os_str().to_os_string();
    p.push(".v1.backup");
    PathBuf::from(p)
}

/// Derive the V1 payload key: PBKDF2-HMAC-SHA256 over the password,
/// XORed with the normalized token response when a token was enrolled.
pub fn derive_v1_key(
    envelope: &V1Envelope,
    password: &SecretString,
    device: Option<&mut (dyn TokenDevice + 'static)>,
) -> Result<SecureBuffer> {
    let mut key = SecureBuffer::zeroed(keys::DEK_LEN);
    crypto::pbkdf2_sha256(
        password.expose_secret().as_bytes(),
        &envelope.salt,
        envelope.kdf_iterations,
        key.as_mut_slice(),
    );

    if let Some(token) = &envelope.token {
        let device = device.ok_or(VaultError::TokenNotPresent)?;
        if !device.is_present() {
            return Err(VaultError::TokenNotPresent);
        }
        let response =
            device.challenge_response(&token.challenge, false, CHALLENGE_TIMEOUT_MS)?;
        keys::combine_with_token_response(&mut key, &response)?;
    }
    Ok(key)
}

/// Decrypt a parsed V1 envelope down to its plaintext payload.
///
/// Every failure past the FEC stage surfaces as `AuthenticationFailed`:
/// a wrong password and a tampered ciphertext are indistinguishable
/// through AES-GCM, and V1 files carry nothing else to check.
pub fn open_v1_payload(
    envelope: &V1Envelope,
    password: &SecretString,
    device: Option<&mut (dyn TokenDevice + 'static)>,
) -> Result<(SecureBuffer, Zeroizing<Vec<u8>>)> {
    let ciphertext = match envelope.fec_percent {
        Some(_) => ReedSolomonCodec::decode(&envelope.ciphertext)?,
        None => envelope.ciphertext.clone(),
    };

    let key = derive_v1_key(envelope, password, device)?;
    let plaintext = crypto::aes_gcm_decrypt(key.as_key32()?, &envelope.iv, &ciphertext)
        .map_err(|e| {
            tracing::debug!(cause = %e, "v1 payload decrypt failed");
            VaultError::AuthenticationFailed
        })?;
    Ok((key, plaintext))
}
