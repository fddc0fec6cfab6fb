//! Per-user key slots and their wire codec.
//!
//! A slot is one user's authentication record: hashed username, KDF salt,
//! a wrapped copy of the vault DEK, role, and optional hardware-token
//! enrollment. Slots are variable-length and were extended several times;
//! the decoder accepts older encodings by letting optional field groups
//! drop off strictly from the tail, defaulting whatever is absent. The
//! encoder always emits every group.

use zeroize::Zeroize;

use crate::error::{Result, VaultError};

pub const MAX_SLOTS: usize = 32;
pub const USERNAME_HASH_FIELD_LEN: usize = 64;
pub const USERNAME_SALT_LEN: usize = 16;
pub const PASSWORD_SALT_LEN: usize = 32;
pub const WRAPPED_DEK_LEN: usize = 40;
pub const SLOT_TOKEN_CHALLENGE_LEN: usize = 32;

pub const HISTORY_ENTRY_LEN: usize = 88;
pub const HISTORY_SALT_LEN: usize = 32;
pub const HISTORY_HASH_LEN: usize = 48;

/// KEK derivation algorithm identifiers. The values double as the
/// discriminator for the legacy-slot heuristic below, so they must never
/// be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum KekDerivation {
    Pbkdf2Sha256 = 0x04,
    Argon2id = 0x05,
}

impl KekDerivation {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x04 => Ok(KekDerivation::Pbkdf2Sha256),
            0x05 => Ok(KekDerivation::Argon2id),
            _ => Err(VaultError::InvalidData("kek derivation algorithm")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Standard = 0,
    Administrator = 1,
}

impl Role {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Role::Standard),
            1 => Ok(Role::Administrator),
            _ => Err(VaultError::InvalidData("role")),
        }
    }
}

/// Username-hash migration state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStatus {
    Unmigrated = 0x00,
    Migrated = 0x01,
    /// Re-hash on the user's next successful authentication.
    Pending = 0xFF,
}

impl MigrationStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(MigrationStatus::Unmigrated),
            0x01 => Ok(MigrationStatus::Migrated),
            0xFF => Ok(MigrationStatus::Pending),
            _ => Err(VaultError::InvalidData("migration status")),
        }
    }
}

/// One retired-password record: timestamp, per-entry salt, and a
/// PBKDF2-HMAC-SHA512 hash of the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHistoryEntry {
    pub changed_at: i64,
    pub salt: [u8; HISTORY_SALT_LEN],
    pub hash: [u8; HISTORY_HASH_LEN],
}

impl Zeroize for PasswordHistoryEntry {
    fn zeroize(&mut self) {
        self.salt.zeroize();
        self.hash.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub active: bool,
    pub kek_derivation: KekDerivation,
    pub username_hash_len: u8,
    pub username_hash: [u8; USERNAME_HASH_FIELD_LEN],
    pub username_salt: [u8; USERNAME_SALT_LEN],
    pub password_salt: [u8; PASSWORD_SALT_LEN],
    pub wrapped_dek: [u8; WRAPPED_DEK_LEN],
    pub role: Role,
    pub must_change_password: bool,
    pub password_changed_at: i64,
    pub last_login_at: i64,
    pub token_enrolled: bool,
    pub token_challenge: [u8; SLOT_TOKEN_CHALLENGE_LEN],
    pub token_serial: String,
    pub token_enrolled_at: i64,
    pub encrypted_token_pin: Vec<u8>,
    pub credential_id: Vec<u8>,
    pub password_history: Vec<PasswordHistoryEntry>,
    pub migration_status: MigrationStatus,
    pub migrated_at: i64,
}

impl Default for KeySlot {
    fn default() -> Self {
        Self {
            active: false,
            kek_derivation: KekDerivation::Pbkdf2Sha256,
            username_hash_len: 0,
            username_hash: [0u8; USERNAME_HASH_FIELD_LEN],
            username_salt: [0u8; USERNAME_SALT_LEN],
            password_salt: [0u8; PASSWORD_SALT_LEN],
            wrapped_dek: [0u8; WRAPPED_DEK_LEN],
            role: Role::Standard,
            must_change_password: false,
            password_changed_at: 0,
            last_login_at: 0,
            token_enrolled: false,
            token_challenge: [0u8; SLOT_TOKEN_CHALLENGE_LEN],
            token_serial: String::new(),
            token_enrolled_at: 0,
            encrypted_token_pin: Vec::new(),
            credential_id: Vec::new(),
            password_history: Vec::new(),
            migration_status: MigrationStatus::Unmigrated,
            migrated_at: 0,
        }
    }
}

impl Zeroize for KeySlot {
    fn zeroize(&mut self) {
        self.username_hash.zeroize();
        self.username_salt.zeroize();
        self.password_salt.zeroize();
        self.wrapped_dek.zeroize();
        self.token_challenge.zeroize();
        self.encrypted_token_pin.zeroize();
        self.credential_id.zeroize();
        for entry in &mut self.password_history {
            entry.zeroize();
        }
    }
}

impl KeySlot {
    /// The used prefix of the fixed username-hash field.
    pub fn username_hash_bytes(&self) -> &[u8] {
        &self.username_hash[..self.username_hash_len as usize]
    }

    /// Clear every token-enrollment field.
    pub fn clear_token(&mut self) {
        self.token_enrolled = false;
        self.token_challenge.zeroize();
        self.token_serial.clear();
        self.token_enrolled_at = 0;
        self.encrypted_token_pin.zeroize();
        self.encrypted_token_pin.clear();
        self.credential_id.clear();
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.password_history.len() * HISTORY_ENTRY_LEN);
        out.push(self.active as u8);
        out.push(self.kek_derivation as u8);
        out.push(self.username_hash_len);
        out.extend_from_slice(&self.username_hash);
        out.extend_from_slice(&self.username_salt);
        out.extend_from_slice(&self.password_salt);
        out.extend_from_slice(&self.wrapped_dek);
        out.push(self.role as u8);
        out.push(self.must_change_password as u8);
        out.extend_from_slice(&self.password_changed_at.to_be_bytes());
        out.extend_from_slice(&self.last_login_at.to_be_bytes());

        out.push(self.token_enrolled as u8);
        out.extend_from_slice(&self.token_challenge);
        let serial = self.token_serial.as_bytes();
        debug_assert!(serial.len() <= u8::MAX as usize);
        out.push(serial.len() as u8);
        out.extend_from_slice(serial);
        out.extend_from_slice(&self.token_enrolled_at.to_be_bytes());

        out.extend_from_slice(&(self.encrypted_token_pin.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.encrypted_token_pin);
        out.extend_from_slice(&(self.credential_id.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.credential_id);

        debug_assert!(self.password_history.len() <= u8::MAX as usize);
        out.push(self.password_history.len() as u8);
        for entry in &self.password_history {
            out.extend_from_slice(&entry.changed_at.to_be_bytes());
            out.extend_from_slice(&entry.salt);
            out.extend_from_slice(&entry.hash);
        }

        out.push(self.migration_status as u8);
        out.extend_from_slice(&self.migrated_at.to_be_bytes());
        out
    }

    pub fn deserialize(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let mut slot = KeySlot::default();

        slot.active = cur.read_u8()? != 0;

        // Legacy encodings predate the KEK-derivation byte. 0x04/0x05 can
        // only be that byte here: the alternative reading would be a 4- or
        // 5-byte username hash, which no producer ever wrote. A slot
        // revision byte should replace this check at the next format bump.
        let next = cur.peek_u8()?;
        if next == KekDerivation::Pbkdf2Sha256 as u8 || next == KekDerivation::Argon2id as u8 {
            slot.kek_derivation = KekDerivation::from_u8(cur.read_u8()?)?;
        }

        slot.username_hash_len = cur.read_u8()?;
        if slot.username_hash_len as usize > USERNAME_HASH_FIELD_LEN {
            return Err(VaultError::InvalidData("username hash size"));
        }
        cur.read_into(&mut slot.username_hash)?;
        cur.read_into(&mut slot.username_salt)?;
        cur.read_into(&mut slot.password_salt)?;
        cur.read_into(&mut slot.wrapped_dek)?;
        slot.role = Role::from_u8(cur.read_u8()?)?;
        slot.must_change_password = cur.read_u8()? != 0;
        slot.password_changed_at = cur.read_i64()?;
        slot.last_login_at = cur.read_i64()?;

        // Optional groups drop off from the tail of older encodings.
        if cur.is_empty() {
            return Ok(slot);
        }
        slot.token_enrolled = cur.read_u8()? != 0;
        cur.read_into(&mut slot.token_challenge)?;
        let serial_len = cur.read_u8()? as usize;
        let serial = cur.take(serial_len)?;
        slot.token_serial = String::from_utf8(serial.to_vec())
            .map_err(|_| VaultError::InvalidData("token serial"))?;
        slot.token_enrolled_at = cur.read_i64()?;

        if cur.is_empty() {
            return Ok(slot);
        }
        let pin_len = cur.read_u16()? as usize;
        slot.encrypted_token_pin = cur.take(pin_len)?.to_vec();

        if cur.is_empty() {
            return Ok(slot);
        }
        let cred_len = cur.read_u16()? as usize;
        slot.credential_id = cur.take(cred_len)?.to_vec();

        if cur.is_empty() {
            return Ok(slot);
        }
        let history_count = cur.read_u8()? as usize;
        slot.password_history.reserve(history_count);
        for _ in 0..history_count {
            let changed_at = cur.read_i64()?;
            let mut salt = [0u8; HISTORY_SALT_LEN];
            cur.read_into(&mut salt)?;
            let mut hash = [0u8; HISTORY_HASH_LEN];
            cur.read_into(&mut hash)?;
            slot.password_history.push(PasswordHistoryEntry {
                changed_at,
                salt,
                hash,
            });
        }

        if cur.is_empty() {
            return Ok(slot);
        }
        slot.migration_status = MigrationStatus::from_u8(cur.read_u8()?)?;
        slot.migrated_at = cur.read_i64()?;

        if !cur.is_empty() {
            return Err(VaultError::Corrupted("trailing bytes in key slot"));
        }
        Ok(slot)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(VaultError::Corrupted("key slot field overruns its block"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn peek_u8(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(VaultError::Corrupted("key slot field overruns its block"))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn sample() -> KeySlot {
        let mut slot = KeySlot {
            active: true,
            kek_derivation: KekDerivation::Argon2id,
            username_hash_len: 32,
            role: Role::Administrator,
            must_change_password: true,
            password_changed_at: 1_700_000_000,
            last_login_at: 1_700_000_050,
            token_enrolled: true,
            token_serial: "YK-5C-0012345".to_string(),
            token_enrolled_at: 1_700_000_060,
            encrypted_token_pin: vec![0xDE, 0xAD, 0xBE, 0xEF],
            credential_id: vec![0x01, 0x02, 0x03],
            migration_status: MigrationStatus::Pending,
            migrated_at: 0,
            ..KeySlot::default()
        };
        crypto::fill_random(&mut slot.username_hash[..32]);
        crypto::fill_random(&mut slot.username_salt);
        crypto::fill_random(&mut slot.password_salt);
        crypto::fill_random(&mut slot.wrapped_dek);
        crypto::fill_random(&mut slot.token_challenge);
        slot.password_history.push(PasswordHistoryEntry {
            changed_at: 1_699_999_000,
            salt: crypto::random_bytes(),
            hash: crypto::random_bytes(),
        });
        slot
    }

    #[test]
    fn roundtrip_full_encoding() {
        let slot = sample();
        let bytes = slot.serialize();
        assert_eq!(KeySlot::deserialize(&bytes).unwrap(), slot);
    }

    #[test]
    fn legacy_encoding_without_tail_groups() {
        let slot = sample();
        let bytes = slot.serialize();

        // Cut at the end of the fixed fields: everything after
        // last_login_at is optional.
        let fixed_len = 3 + USERNAME_HASH_FIELD_LEN
            + USERNAME_SALT_LEN
            + PASSWORD_SALT_LEN
            + WRAPPED_DEK_LEN
            + 2
            + 16;
        let parsed = KeySlot::deserialize(&bytes[..fixed_len]).unwrap();
        assert!(!parsed.token_enrolled);
        assert!(parsed.password_history.is_empty());
        assert_eq!(parsed.migration_status, MigrationStatus::Unmigrated);
        assert_eq!(parsed.wrapped_dek, slot.wrapped_dek);
    }

    #[test]
    fn legacy_encoding_without_kek_byte_defaults_to_pbkdf2() {
        let slot = sample();
        let mut bytes = slot.serialize();
        // Strip the algorithm byte; username_hash_len (32) is not
        // 0x04/0x05, so the decoder treats the encoding as legacy.
        bytes.remove(1);
        let fixed_len = 2 + USERNAME_HASH_FIELD_LEN
            + USERNAME_SALT_LEN
            + PASSWORD_SALT_LEN
            + WRAPPED_DEK_LEN
            + 2
            + 16;
        let parsed = KeySlot::deserialize(&bytes[..fixed_len]).unwrap();
        assert_eq!(parsed.kek_derivation, KekDerivation::Pbkdf2Sha256);
        assert_eq!(parsed.username_hash_len, 32);
    }

    #[test]
    fn serial_length_overrun_is_corrupted() {
        let slot = sample();
        let mut bytes = slot.serialize();
        // The serial length byte sits right after the token challenge.
        let serial_len_at = 3 + USERNAME_HASH_FIELD_LEN
            + USERNAME_SALT_LEN
            + PASSWORD_SALT_LEN
            + WRAPPED_DEK_LEN
            + 2
            + 16
            + 1
            + SLOT_TOKEN_CHALLENGE_LEN;
        bytes[serial_len_at] = 0xFF;
        assert!(matches!(
            KeySlot::deserialize(&bytes),
            Err(VaultError::Corrupted(_))
        ));
    }

    #[test]
    fn invalid_role_rejected() {
        let slot = sample();
        let mut bytes = slot.serialize();
        let role_at = 3 + USERNAME_HASH_FIELD_LEN
            + USERNAME_SALT_LEN
            + PASSWORD_SALT_LEN
            + WRAPPED_DEK_LEN;
        bytes[role_at] = 2;
        assert!(matches!(
            KeySlot::deserialize(&bytes),
            Err(VaultError::InvalidData("role"))
        ));
    }

    #[test]
    fn oversized_username_hash_rejected() {
        let slot = sample();
        let mut bytes = slot.serialize();
        bytes[2] = USERNAME_HASH_FIELD_LEN as u8 + 1;
        assert!(matches!(
            KeySlot::deserialize(&bytes),
            Err(VaultError::InvalidData("username hash size"))
        ));
    }
}
