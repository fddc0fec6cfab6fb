//! Outer file envelopes.
//!
//! The outer framing is little-endian (the header *inside* the FEC frame
//! is big-endian; the two layers were specified at different times and
//! the bytes on disk are the contract). Two envelope versions exist:
//!
//! V2 (current, multi-user):
//!
//! ```text
//! 0   4  magic "KPTW"
//! 4   4  version = 2            (u32 LE)
//! 8   4  kdf_iterations         (u32 LE, mirrors the policy)
//! 12  4  header_size            (u32 LE)
//! 16  1  header_flags           (bit 0: header FEC enabled)
//! 17  1  header_fec_percent
//! 18  .. FEC-encoded VaultHeader
//! ..  32 data_salt
//! ..  12 data_iv
//! ..  .. AES-256-GCM payload (ciphertext || tag), optionally FEC-framed
//! ```
//!
//! V1 (legacy, single-user): magic || version=1 || u32 iterations ||
//! 32-byte salt || 12-byte IV || u8 flags || [u8 fec_percent] ||
//! [64-byte token challenge, u8-prefixed serial] || ciphertext. V1 is
//! read-only; the engine never emits it.

use crate::crypto::GCM_IV_LEN;
use crate::error::{Result, VaultError};

pub const MAGIC: [u8; 4] = *b"KPTW";
pub const VERSION_V1: u32 = 1;
pub const VERSION_V2: u32 = 2;

pub const DATA_SALT_LEN: usize = 32;

pub const HEADER_FLAG_FEC: u8 = 0b0000_0001;

pub const V1_FLAG_FEC: u8 = 0b0000_0001;
pub const V1_FLAG_TOKEN: u8 = 0b0000_0010;
pub const V1_TOKEN_CHALLENGE_LEN: usize = 64;

const V2_FIXED_LEN: usize = 18;
const V1_FIXED_LEN: usize = 4 + 4 + 4 + DATA_SALT_LEN + GCM_IV_LEN + 1;

/// Sniff the envelope version without parsing the rest of the file.
pub fn detect_version(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 8 {
        return Err(VaultError::Corrupted("file too small"));
    }
    if bytes[0..4] != MAGIC {
        return Err(VaultError::Corrupted("bad magic"));
    }
    Ok(u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Envelope {
    pub kdf_iterations: u32,
    pub header_flags: u8,
    pub header_fec_percent: u8,
    /// FEC-encoded (or raw, if the flag is clear) header block.
    pub header_block: Vec<u8>,
    pub data_salt: [u8; DATA_SALT_LEN],
    pub data_iv: [u8; GCM_IV_LEN],
    /// Ciphertext, or an FEC frame around it when payload FEC is on.
    pub payload: Vec<u8>,
}

impl V2Envelope {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            V2_FIXED_LEN + self.header_block.len() + DATA_SALT_LEN + GCM_IV_LEN + self.payload.len(),
        );
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION_V2.to_le_bytes());
        out.extend_from_slice(&self.kdf_iterations.to_le_bytes());
        out.extend_from_slice(&(self.header_block.len() as u32).to_le_bytes());
        out.push(self.header_flags);
        out.push(self.header_fec_percent);
        out.extend_from_slice(&self.header_block);
        out.extend_from_slice(&self.data_salt);
        out.extend_from_slice(&self.data_iv);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let version = detect_version(bytes)?;
        if version != VERSION_V2 {
            return Err(VaultError::UnsupportedVersion(version));
        }
        if bytes.len() < V2_FIXED_LEN {
            return Err(VaultError::Corrupted("v2 envelope too small"));
        }
        let kdf_iterations = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        let header_size = u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes")) as usize;
        let header_flags = bytes[16];
        let header_fec_percent = bytes[17];

        let rest = &bytes[V2_FIXED_LEN..];
        if rest.len() < header_size + DATA_SALT_LEN + GCM_IV_LEN {
            return Err(VaultError::Corrupted("v2 envelope truncated"));
        }
        let header_block = rest[..header_size].to_vec();
        let mut pos = header_size;

        let mut data_salt = [0u8; DATA_SALT_LEN];
        data_salt.copy_from_slice(&rest[pos..pos + DATA_SALT_LEN]);
        pos += DATA_SALT_LEN;

        let mut data_iv = [0u8; GCM_IV_LEN];
        data_iv.copy_from_slice(&rest[pos..pos + GCM_IV_LEN]);
        pos += GCM_IV_LEN;

        Ok(Self {
            kdf_iterations,
            header_flags,
            header_fec_percent,
            header_block,
            data_salt,
            data_iv,
            payload: rest[pos..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1TokenMetadata {
    pub challenge: [u8; V1_TOKEN_CHALLENGE_LEN],
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Envelope {
    pub kdf_iterations: u32,
    pub salt: [u8; DATA_SALT_LEN],
    pub iv: [u8; GCM_IV_LEN],
    pub fec_percent: Option<u8>,
    pub token: Option<V1TokenMetadata>,
    /// Ciphertext, or an FEC frame around it when the FEC flag is set.
    pub ciphertext: Vec<u8>,
}

impl V1Envelope {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let version = detect_version(bytes)?;
        if version != VERSION_V1 {
            return Err(VaultError::UnsupportedVersion(version));
        }
        if bytes.len() < V1_FIXED_LEN {
            return Err(VaultError::Corrupted("v1 envelope too small"));
        }
        let kdf_iterations = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));

        let mut pos = 12;
        let mut salt = [0u8; DATA_SALT_LEN];
        salt.copy_from_slice(&bytes[pos..pos + DATA_SALT_LEN]);
        pos += DATA_SALT_LEN;
        let mut iv = [0u8; GCM_IV_LEN];
        iv.copy_from_slice(&bytes[pos..pos + GCM_IV_LEN]);
        pos += GCM_IV_LEN;

        let flags = bytes[pos];
        pos += 1;
        if flags & !(V1_FLAG_FEC | V1_FLAG_TOKEN) != 0 {
            return Err(VaultError::InvalidData("v1 flags"));
        }

        let fec_percent = if flags & V1_FLAG_FEC != 0 {
            let p = *bytes
                .get(pos)
                .ok_or(VaultError::Corrupted("v1 fec metadata truncated"))?;
            pos += 1;
            Some(p)
        } else {
            None
        };

        let token = if flags & V1_FLAG_TOKEN != 0 {
            if bytes.len() - pos < V1_TOKEN_CHALLENGE_LEN + 1 {
                return Err(VaultError::Corrupted("v1 token metadata truncated"));
            }
            let mut challenge = [0u8; V1_TOKEN_CHALLENGE_LEN];
            challenge.copy_from_slice(&bytes[pos..pos + V1_TOKEN_CHALLENGE_LEN]);
            pos += V1_TOKEN_CHALLENGE_LEN;
            let serial_len = bytes[pos] as usize;
            pos += 1;
            if bytes.len() - pos < serial_len {
                return Err(VaultError::Corrupted("v1 token serial truncated"));
            }
            let serial = String::from_utf8(bytes[pos..pos + serial_len].to_vec())
                .map_err(|_| VaultError::InvalidData("v1 token serial"))?;
            pos += serial_len;
            Some(V1TokenMetadata { challenge, serial })
        } else {
            None
        };

        Ok(Self {
            kdf_iterations,
            salt,
            iv,
            fec_percent,
            token,
            ciphertext: bytes[pos..].to_vec(),
        })
    }

    /// Encode a V1 container. Only test fixtures and the migration suite
    /// build V1 files; the engine itself never writes this version.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V1_FIXED_LEN + self.ciphertext.len() + 80);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION_V1.to_le_bytes());
        out.extend_from_slice(&self.kdf_iterations.to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);

        let mut flags = 0u8;
        if self.fec_percent.is_some() {
            flags |= V1_FLAG_FEC;
        }
        if self.token.is_some() {
            flags |= V1_FLAG_TOKEN;
        }
        out.push(flags);
        if let Some(p) = self.fec_percent {
            out.push(p);
        }
        if let Some(token) = &self.token {
            out.extend_from_slice(&token.challenge);
            out.push(token.serial.len() as u8);
            out.extend_from_slice(token.serial.as_bytes());
        }
        out.extend_from_slice(&self.ciphertext);
        out
    }
}
