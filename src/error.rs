//! Engine-wide error taxonomy.
//!
//! One closed enum for every failure the engine can surface. Callers match
//! on kinds, never on strings. Authentication-adjacent failures (wrong
//! password, wrong token response, tampered slot) are all collapsed into
//! [`VaultError::AuthenticationFailed`] before they leave the engine; the
//! true inner cause is only emitted at debug level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    // I/O
    #[error("vault file not found")]
    NotFound,

    #[error("failed to open vault file")]
    OpenFailed(#[source] std::io::Error),

    #[error("failed to read vault file")]
    ReadFailed(#[source] std::io::Error),

    #[error("failed to write vault file")]
    WriteFailed(#[source] std::io::Error),

    #[error("permission denied")]
    PermissionDenied,

    // Format
    #[error("vault file is corrupted: {0}")]
    Corrupted(&'static str),

    #[error("unsupported vault version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid field value: {0}")]
    InvalidData(&'static str),

    #[error("forward error correction failed to recover data")]
    FecDecodingFailed,

    // Crypto
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed")]
    KeyDerivationFailed,

    #[error("key wrap failed")]
    WrapFailed,

    #[error("key unwrap failed")]
    UnwrapFailed,

    #[error("crypto provider error: {0}")]
    CryptoProvider(&'static str),

    // Hardware token
    #[error("hardware token not present")]
    TokenNotPresent,

    #[error("failed to read hardware token info")]
    TokenDeviceInfoFailed,

    #[error("hardware token challenge-response failed")]
    TokenChallengeResponseFailed,

    #[error("hardware token refused the operation")]
    TokenUnauthorized,

    #[error("hardware token metadata missing from vault")]
    TokenMetadataMissing,

    // Vault state
    #[error("a vault is already open")]
    AlreadyOpen,

    #[error("no vault is open")]
    NotOpen,

    #[error("vault engine is busy")]
    Busy,

    // Multi-user
    #[error("invalid username")]
    InvalidUsername,

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("user not found")]
    UserNotFound,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("password does not meet the vault's minimum length")]
    WeakPassword,

    #[error("password was used recently")]
    PasswordReused,

    #[error("users cannot remove themselves")]
    SelfRemovalNotAllowed,

    #[error("cannot remove the last administrator")]
    LastAdministrator,

    #[error("all key slots are in use")]
    MaxUsersReached,
}

impl VaultError {
    /// Map a raw filesystem error from an open/stat call into the taxonomy.
    pub(crate) fn from_open(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => VaultError::NotFound,
            std::io::ErrorKind::PermissionDenied => VaultError::PermissionDenied,
            _ => VaultError::OpenFailed(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
