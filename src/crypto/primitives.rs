//! Cryptographic building blocks for the vault engine.
//!
//! Small, composable primitives which higher-level code wires together
//! according to the container format. Everything here is FIPS-approvable:
//! AES-256-GCM for data, AES-256-KW for key wrapping, PBKDF2/Argon2id for
//! password stretching, SHA-2/SHA-3/HMAC for hashing.
//!
//! Security foot-guns to avoid:
//!
//! - Never reuse a `(key, IV)` pair with AES-GCM. Every save draws a fresh IV.
//! - Do not log or print keys, derived material, or decrypted payloads.
//! - Compare secrets with [`ct_eq`], never `==`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_kw::KekAes256;
use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_384, Sha3_512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// AES-GCM IV size in bytes.
pub const GCM_IV_LEN: usize = 12;
/// AES-GCM authentication tag size in bytes.
pub const GCM_TAG_LEN: usize = 16;
/// AES-256-KW output for a 32-byte key: input + 8-byte integrity block.
pub const WRAPPED_KEY_LEN: usize = 40;

/// Generate `N` cryptographically-secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Fill an arbitrary buffer from the OS DRBG.
pub fn fill_random(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// AES-256-GCM encrypt. Returns `ciphertext || 16-byte tag`.
pub fn aes_gcm_encrypt(key: &[u8; 32], iv: &[u8; GCM_IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::EncryptionFailed)?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| VaultError::EncryptionFailed)
}

/// AES-256-GCM verify-then-decrypt. `input` is `ciphertext || tag`.
///
/// Plaintext comes back in `Zeroizing` so transient copies of decrypted
/// vault payloads do not outlive their scope.
pub fn aes_gcm_decrypt(
    key: &[u8; 32],
    iv: &[u8; GCM_IV_LEN],
    input: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if input.len() < GCM_TAG_LEN {
        return Err(VaultError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(iv), input)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::DecryptionFailed)
}

/// AES-256-KW wrap of a 32-byte key. Deterministic: identical (KEK, key)
/// pairs produce identical output, which is why every slot must carry a
/// unique password salt.
pub fn aes_kw_wrap(kek: &[u8; 32], key: &[u8; 32]) -> Result<[u8; WRAPPED_KEY_LEN]> {
    let wrapper = KekAes256::from(*kek);
    let mut out = [0u8; WRAPPED_KEY_LEN];
    wrapper
        .wrap(key, &mut out)
        .map_err(|_| VaultError::WrapFailed)?;
    Ok(out)
}

/// AES-256-KW unwrap. Fails when the KEK is wrong or the wrapped blob was
/// tampered with; the two cases are indistinguishable by design.
pub fn aes_kw_unwrap(
    kek: &[u8; 32],
    wrapped: &[u8; WRAPPED_KEY_LEN],
) -> Result<Zeroizing<[u8; 32]>> {
    let wrapper = KekAes256::from(*kek);
    let mut out = Zeroizing::new([0u8; 32]);
    wrapper
        .unwrap(wrapped, out.as_mut())
        .map_err(|_| VaultError::UnwrapFailed)?;
    Ok(out)
}

/// PBKDF2-HMAC-SHA256 into a caller-provided buffer.
pub fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, out);
}

/// PBKDF2-HMAC-SHA512 into a caller-provided buffer.
pub fn pbkdf2_sha512(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, out);
}

/// Argon2id with explicit parameters into a caller-provided buffer.
pub fn argon2id(
    password: &[u8],
    salt: &[u8],
    memory_kib: u32,
    time_cost: u32,
    parallelism: u32,
    out: &mut [u8],
) -> Result<()> {
    let params = Argon2Params::new(memory_kib, time_cost, parallelism, Some(out.len()))
        .map_err(|_| VaultError::KeyDerivationFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    argon2
        .hash_password_into(password, salt, out)
        .map_err(|_| VaultError::KeyDerivationFailed)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

pub fn sha3_384(data: &[u8]) -> [u8; 48] {
    Sha3_384::digest(data).into()
}

pub fn sha3_512(data: &[u8]) -> [u8; 64] {
    Sha3_512::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| VaultError::KeyDerivationFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<[u8; 64]> {
    let mut mac =
        <Hmac<Sha512> as Mac>::new_from_slice(key).map_err(|_| VaultError::KeyDerivationFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time equality over byte slices. Slices of different lengths
/// compare unequal without inspecting contents.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
