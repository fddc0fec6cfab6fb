//! Vault-wide security policy and its fixed-offset codec.
//!
//! The policy block is the first thing inside the authentication header.
//! It has grown across container revisions (121 -> 122 -> 131 -> 141
//! bytes) by appending fields; the decoder identifies the revision purely
//! by block length and defaults the missing tail, while the encoder only
//! ever emits the current 141-byte layout. All integers are big-endian.

use zeroize::Zeroize;

use crate::error::{Result, VaultError};

/// Revision sizes, oldest to current.
pub const POLICY_SIZE_BASE: usize = 121;
pub const POLICY_SIZE_USERNAME_HASH: usize = 122;
pub const POLICY_SIZE_ARGON2: usize = 131;
pub const POLICY_SIZE_CURRENT: usize = 141;

pub const MIN_PASSWORD_LENGTH_FLOOR: u8 = 8;
pub const MIN_PASSWORD_LENGTH_CEIL: u8 = 128;
pub const KDF_ITERATIONS_MIN: u32 = 100_000;
pub const KDF_ITERATIONS_MAX: u32 = 1_000_000;
pub const KDF_ITERATIONS_DEFAULT: u32 = 100_000;
pub const PASSWORD_HISTORY_DEPTH_MAX: u8 = 24;
pub const ARGON2_MEMORY_MIN_KIB: u32 = 8_192;
pub const ARGON2_MEMORY_MAX_KIB: u32 = 1_048_576;
pub const ARGON2_MEMORY_DEFAULT_KIB: u32 = 65_536;
pub const ARGON2_TIME_MIN: u32 = 1;
pub const ARGON2_TIME_MAX: u32 = 10;
pub const ARGON2_TIME_DEFAULT: u32 = 3;
pub const ARGON2_PARALLELISM_MIN: u8 = 1;
pub const ARGON2_PARALLELISM_MAX: u8 = 16;
pub const ARGON2_PARALLELISM_DEFAULT: u8 = 4;
pub const TOKEN_CHALLENGE_FIELD_LEN: usize = 64;

const RESERVED_LEN: usize = 30;

/// HMAC algorithm the enrolled hardware tokens compute. SHA-1 class
/// devices are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenAlgorithm {
    HmacSha256 = 1,
    HmacSha512 = 2,
}

impl TokenAlgorithm {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(TokenAlgorithm::HmacSha256),
            2 => Ok(TokenAlgorithm::HmacSha512),
            _ => Err(VaultError::InvalidData("token algorithm")),
        }
    }
}

/// How usernames are hashed before being stored in a key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsernameHashAlgorithm {
    Plain = 0,
    Sha3_256 = 1,
    Sha3_384 = 2,
    Sha3_512 = 3,
    Pbkdf2Sha256 = 4,
    Argon2id = 5,
}

impl UsernameHashAlgorithm {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(UsernameHashAlgorithm::Plain),
            1 => Ok(UsernameHashAlgorithm::Sha3_256),
            2 => Ok(UsernameHashAlgorithm::Sha3_384),
            3 => Ok(UsernameHashAlgorithm::Sha3_512),
            4 => Ok(UsernameHashAlgorithm::Pbkdf2Sha256),
            5 => Ok(UsernameHashAlgorithm::Argon2id),
            _ => Err(VaultError::InvalidData("username hash algorithm")),
        }
    }
}

/// Argon2id tuning parameters carried by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u8,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_DEFAULT_KIB,
            time_cost: ARGON2_TIME_DEFAULT,
            parallelism: ARGON2_PARALLELISM_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub require_token: bool,
    pub min_password_length: u8,
    pub kdf_iterations: u32,
    pub password_history_depth: u8,
    pub header_fec_percent: u8,
    pub payload_fec_enabled: bool,
    pub payload_fec_percent: u8,
    pub token_algorithm: TokenAlgorithm,
    pub token_challenge: [u8; TOKEN_CHALLENGE_FIELD_LEN],
    pub created_at: i64,
    pub modified_at: i64,
    pub username_hash_algorithm: UsernameHashAlgorithm,
    pub argon2: Argon2Params,
    pub username_migration_active: bool,
    pub username_migration_target: UsernameHashAlgorithm,
    pub username_migration_started_at: i64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            require_token: false,
            min_password_length: 12,
            kdf_iterations: KDF_ITERATIONS_DEFAULT,
            password_history_depth: 5,
            header_fec_percent: crate::fec::HEADER_MIN_PERCENT,
            payload_fec_enabled: false,
            payload_fec_percent: 10,
            token_algorithm: TokenAlgorithm::HmacSha256,
            token_challenge: [0u8; TOKEN_CHALLENGE_FIELD_LEN],
            created_at: 0,
            modified_at: 0,
            username_hash_algorithm: UsernameHashAlgorithm::Plain,
            argon2: Argon2Params::default(),
            username_migration_active: false,
            username_migration_target: UsernameHashAlgorithm::Plain,
            username_migration_started_at: 0,
        }
    }
}

impl Zeroize for SecurityPolicy {
    fn zeroize(&mut self) {
        self.token_challenge.zeroize();
    }
}

impl SecurityPolicy {
    /// Validate every bounded field. Used both after decode and before
    /// accepting a caller-supplied policy at vault creation.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PASSWORD_LENGTH_FLOOR..=MIN_PASSWORD_LENGTH_CEIL)
            .contains(&self.min_password_length)
        {
            return Err(VaultError::InvalidData("min password length"));
        }
        if !(KDF_ITERATIONS_MIN..=KDF_ITERATIONS_MAX).contains(&self.kdf_iterations) {
            return Err(VaultError::InvalidData("kdf iterations"));
        }
        if self.password_history_depth > PASSWORD_HISTORY_DEPTH_MAX {
            return Err(VaultError::InvalidData("password history depth"));
        }
        if !(crate::fec::MIN_REDUNDANCY_PERCENT..=crate::fec::MAX_REDUNDANCY_PERCENT)
            .contains(&self.header_fec_percent)
        {
            return Err(VaultError::InvalidData("header fec percent"));
        }
        if !(crate::fec::MIN_REDUNDANCY_PERCENT..=crate::fec::MAX_REDUNDANCY_PERCENT)
            .contains(&self.payload_fec_percent)
        {
            return Err(VaultError::InvalidData("payload fec percent"));
        }
        if !(ARGON2_MEMORY_MIN_KIB..=ARGON2_MEMORY_MAX_KIB).contains(&self.argon2.memory_kib) {
            return Err(VaultError::InvalidData("argon2 memory"));
        }
        if !(ARGON2_TIME_MIN..=ARGON2_TIME_MAX).contains(&self.argon2.time_cost) {
            return Err(VaultError::InvalidData("argon2 time cost"));
        }
        if !(ARGON2_PARALLELISM_MIN..=ARGON2_PARALLELISM_MAX).contains(&self.argon2.parallelism) {
            return Err(VaultError::InvalidData("argon2 parallelism"));
        }
        Ok(())
    }

    /// Encode to the current 141-byte revision.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(POLICY_SIZE_CURRENT);
        out.push(self.require_token as u8);
        out.push(self.min_password_length);
        out.extend_from_slice(&self.kdf_iterations.to_be_bytes());
        out.push(self.password_history_depth);
        out.push(self.header_fec_percent);
        out.push(self.payload_fec_enabled as u8);
        out.push(self.payload_fec_percent);
        out.push(self.token_algorithm as u8);
        out.extend_from_slice(&self.token_challenge);
        out.extend_from_slice(&self.created_at.to_be_bytes());
        out.extend_from_slice(&self.modified_at.to_be_bytes());
        out.extend_from_slice(&[0u8; RESERVED_LEN]);
        out.push(self.username_hash_algorithm as u8);
        out.extend_from_slice(&self.argon2.memory_kib.to_be_bytes());
        out.extend_from_slice(&self.argon2.time_cost.to_be_bytes());
        out.push(self.argon2.parallelism);
        out.push(self.username_migration_active as u8);
        out.push(self.username_migration_target as u8);
        out.extend_from_slice(&self.username_migration_started_at.to_be_bytes());
        debug_assert_eq!(out.len(), POLICY_SIZE_CURRENT);
        out
    }

    /// Decode any accepted revision, defaulting absent tail fields.
    pub fn deserialize(block: &[u8]) -> Result<Self> {
        if block.len() < POLICY_SIZE_BASE {
            return Err(VaultError::Corrupted("policy block too small"));
        }

        let require_token = block[0] != 0;
        let min_password_length = block[1];
        let kdf_iterations = u32::from_be_bytes(block[2..6].try_into().expect("4 bytes"));
        let password_history_depth = block[6];
        let header_fec_percent = block[7];
        let payload_fec_enabled = block[8] != 0;
        let payload_fec_percent = block[9];
        let token_algorithm = TokenAlgorithm::from_u8(block[10])?;
        let mut token_challenge = [0u8; TOKEN_CHALLENGE_FIELD_LEN];
        token_challenge.copy_from_slice(&block[11..75]);
        let created_at = i64::from_be_bytes(block[75..83].try_into().expect("8 bytes"));
        let modified_at = i64::from_be_bytes(block[83..91].try_into().expect("8 bytes"));
        // block[91..121] reserved

        let username_hash_algorithm = if block.len() >= POLICY_SIZE_USERNAME_HASH {
            UsernameHashAlgorithm::from_u8(block[121])?
        } else {
            UsernameHashAlgorithm::Plain
        };

        let argon2 = if block.len() >= POLICY_SIZE_ARGON2 {
            Argon2Params {
                memory_kib: u32::from_be_bytes(block[122..126].try_into().expect("4 bytes")),
                time_cost: u32::from_be_bytes(block[126..130].try_into().expect("4 bytes")),
                parallelism: block[130],
            }
        } else {
            Argon2Params::default()
        };

        let (migration_active, migration_target, migration_started_at) =
            if block.len() >= POLICY_SIZE_CURRENT {
                (
                    block[131] != 0,
                    UsernameHashAlgorithm::from_u8(block[132])?,
                    i64::from_be_bytes(block[133..141].try_into().expect("8 bytes")),
                )
            } else {
                (false, UsernameHashAlgorithm::Plain, 0)
            };

        let policy = Self {
            require_token,
            min_password_length,
            kdf_iterations,
            password_history_depth,
            header_fec_percent,
            payload_fec_enabled,
            payload_fec_percent,
            token_algorithm,
            token_challenge,
            created_at,
            modified_at,
            username_hash_algorithm,
            argon2,
            username_migration_active: migration_active,
            username_migration_target: migration_target,
            username_migration_started_at: migration_started_at,
        };
        policy.validate()?;
        Ok(policy)
    }
}
