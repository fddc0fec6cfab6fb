//! The two-level key hierarchy.
//!
//! One DEK per vault encrypts the record payload. Each user derives a KEK
//! from their password (PBKDF2-HMAC-SHA256 or Argon2id), optionally folds
//! a hardware-token response into it, and stores the DEK wrapped under
//! that final KEK in their key slot. Unwrapping is the canonical password
//! check: wrong password, wrong token response, and slot tamper are all
//! the same `UnwrapFailed` here, and callers collapse them into a single
//! "authentication failed" before anything reaches a user.

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::format::policy::Argon2Params;
use crate::format::slot::{PasswordHistoryEntry, HISTORY_HASH_LEN, HISTORY_SALT_LEN};
use crate::format::UsernameHashAlgorithm;
use crate::secure::SecureBuffer;

pub const DEK_LEN: usize = 32;
pub const KEK_LEN: usize = 32;
pub const PASSWORD_SALT_LEN: usize = 32;

/// Challenges presented to a hardware token at enrollment and
/// authentication. Stored left-aligned in the slot's 32-byte field.
pub const TOKEN_CHALLENGE_LEN: usize = 20;

/// Token responses are normalized to this length before the KEK combine.
pub const TOKEN_RESPONSE_LEN: usize = 32;

/// Work factor for password-history hashing (PBKDF2-HMAC-SHA512).
pub const HISTORY_KDF_ITERATIONS: u32 = 600_000;

/// Work factor for PBKDF2-based username hashing. Deliberately lighter
/// than the KEK derivation: every open hashes the username once per
/// candidate slot.
pub const USERNAME_PBKDF2_ITERATIONS: u32 = 10_000;

/// Parameters for deriving a user's KEK from their password.
#[derive(Debug, Clone, Copy)]
pub enum KekParams {
    Pbkdf2 { iterations: u32 },
    Argon2id(Argon2Params),
}

/// Generate a fresh vault DEK from the OS DRBG.
pub fn generate_dek() -> SecureBuffer {
    SecureBuffer::random(DEK_LEN)
}

/// Generate an `N`-byte salt.
pub fn generate_salt<const N: usize>() -> [u8; N] {
    crypto::random_bytes::<N>()
}

/// Derive a 32-byte KEK from a password and per-user salt.
pub fn derive_kek(
    password: &SecretString,
    salt: &[u8; PASSWORD_SALT_LEN],
    params: &KekParams,
) -> Result<SecureBuffer> {
    let mut kek = SecureBuffer::zeroed(KEK_LEN);
    match params {
        KekParams::Pbkdf2 { iterations } => {
            crypto::pbkdf2_sha256(
                password.expose_secret().as_bytes(),
                salt,
                *iterations,
                kek.as_mut_slice(),
            );
        }
        KekParams::Argon2id(argon2) => {
            crypto::argon2id(
                password.expose_secret().as_bytes(),
                salt,
                argon2.memory_kib,
                argon2.time_cost,
                argon2.parallelism as u32,
                kek.as_mut_slice(),
            )?;
        }
    }
    Ok(kek)
}

/// Normalize a raw token response to 32 bytes: short responses are
/// zero-padded, long ones are compressed through SHA-256.
pub fn normalize_token_response(response: &[u8]) -> Result<Zeroizing<[u8; TOKEN_RESPONSE_LEN]>> {
    if response.is_empty() {
        return Err(VaultError::TokenChallengeResponseFailed);
    }
    let mut out = Zeroizing::new([0u8; TOKEN_RESPONSE_LEN]);
    if response.len() <= TOKEN_RESPONSE_LEN {
        out[..response.len()].copy_from_slice(response);
    } else {
        *out = crypto::sha256(response);
    }
    Ok(out)
}

/// Fold a token response into a password-derived KEK, yielding the final
/// KEK used for wrap/unwrap.
pub fn combine_with_token_response(kek: &mut SecureBuffer, response: &[u8]) -> Result<()> {
    let normalized = normalize_token_response(response)?;
    for (k, r) in kek.as_mut_slice().iter_mut().zip(normalized.iter()) {
        *k ^= r;
    }
    Ok(())
}

/// AES-256-KW wrap of the vault DEK under a user's final KEK.
pub fn wrap_dek(kek: &SecureBuffer, dek: &SecureBuffer) -> Result<[u8; crypto::WRAPPED_KEY_LEN]> {
    crypto::aes_kw_wrap(kek.as_key32()?, dek.as_key32()?)
}

/// AES-256-KW unwrap. `UnwrapFailed` means wrong KEK or tampered blob;
/// the two are indistinguishable on purpose.
pub fn unwrap_dek(kek: &SecureBuffer, wrapped: &[u8; crypto::WRAPPED_KEY_LEN]) -> Result<SecureBuffer> {
    let dek = crypto::aes_kw_unwrap(kek.as_key32()?, wrapped)?;
    Ok(SecureBuffer::from_vec(dek.to_vec()))
}

/// Produce a history entry for a password being retired or set.
pub fn history_entry(password: &SecretString, changed_at: i64) -> PasswordHistoryEntry {
    let salt = generate_salt::<HISTORY_SALT_LEN>();
    let mut hash = [0u8; HISTORY_HASH_LEN];
    crypto::pbkdf2_sha512(
        password.expose_secret().as_bytes(),
        &salt,
        HISTORY_KDF_ITERATIONS,
        &mut hash,
    );
    PasswordHistoryEntry {
        changed_at,
        salt,
        hash,
    }
}

/// Constant-time check of a candidate password against one history entry.
pub fn history_matches(entry: &PasswordHistoryEntry, password: &SecretString) -> bool {
    let mut candidate = Zeroizing::new([0u8; HISTORY_HASH_LEN]);
    crypto::pbkdf2_sha512(
        password.expose_secret().as_bytes(),
        &entry.salt,
        HISTORY_KDF_ITERATIONS,
        candidate.as_mut(),
    );
    crypto::ct_eq(candidate.as_ref(), &entry.hash)
}

/// Hash a username for slot storage. Returns the used length and the
/// zero-padded 64-byte field.
pub fn hash_username(
    username: &str,
    algo: UsernameHashAlgorithm,
    salt: &[u8; crate::format::slot::USERNAME_SALT_LEN],
    argon2: &Argon2Params,
) -> Result<(u8, [u8; crate::format::slot::USERNAME_HASH_FIELD_LEN])> {
    let mut field = [0u8; crate::format::slot::USERNAME_HASH_FIELD_LEN];
    let len = match algo {
        UsernameHashAlgorithm::Plain => {
            let bytes = username.as_bytes();
            if bytes.is_empty() || bytes.len() > field.len() {
                return Err(VaultError::InvalidUsername);
            }
            field[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        }
        UsernameHashAlgorithm::Sha3_256 => {
            let digest = crypto::sha3_256(username.as_bytes());
            field[..digest.len()].copy_from_slice(&digest);
            digest.len()
        }
        UsernameHashAlgorithm::Sha3_384 => {
            let digest = crypto::sha3_384(username.as_bytes());
            field[..digest.len()].copy_from_slice(&digest);
            digest.len()
        }
        UsernameHashAlgorithm::Sha3_512 => {
            let digest = crypto::sha3_512(username.as_bytes());
            field[..digest.len()].copy_from_slice(&digest);
            digest.len()
        }
        UsernameHashAlgorithm::Pbkdf2Sha256 => {
            crypto::pbkdf2_sha256(
                username.as_bytes(),
                salt,
                USERNAME_PBKDF2_ITERATIONS,
                &mut field[..32],
            );
            32
        }
        UsernameHashAlgorithm::Argon2id => {
            crypto::argon2id(
                username.as_bytes(),
                salt,
                argon2.memory_kib,
                argon2.time_cost,
                argon2.parallelism as u32,
                &mut field[..32],
            )?;
            32
        }
    };
    Ok((len as u8, field))
}
