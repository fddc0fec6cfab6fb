//! The authentication header: policy block plus key slots.
//!
//! Layout (big-endian): `u16 policy_size || policy || u8 slot_count ||
//! (u16 slot_size || slot)*`. The length prefixes are what let the policy
//! and slot codecs do size-based revision detection.

use zeroize::Zeroize;

use crate::error::{Result, VaultError};
use crate::format::policy::SecurityPolicy;
use crate::format::slot::{KeySlot, MAX_SLOTS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultHeader {
    pub policy: SecurityPolicy,
    pub slots: Vec<KeySlot>,
}

impl Zeroize for VaultHeader {
    fn zeroize(&mut self) {
        self.policy.zeroize();
        for slot in &mut self.slots {
            slot.zeroize();
        }
    }
}

impl VaultHeader {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            slots: Vec::new(),
        }
    }

    /// Count of active administrator slots.
    pub fn active_admins(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.active && s.role == crate::format::slot::Role::Administrator)
            .count()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.slots.len() > MAX_SLOTS {
            return Err(VaultError::MaxUsersReached);
        }
        let policy_block = self.policy.serialize();

        let mut out = Vec::with_capacity(policy_block.len() + 3 + self.slots.len() * 280);
        out.extend_from_slice(&(policy_block.len() as u16).to_be_bytes());
        out.extend_from_slice(&policy_block);
        out.push(self.slots.len() as u8);
        for slot in &self.slots {
            let body = slot.serialize();
            if body.len() > u16::MAX as usize {
                return Err(VaultError::InvalidData("key slot size"));
            }
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(VaultError::Corrupted("header too small"));
        }
        let policy_size = u16::from_be_bytes(bytes[0..2].try_into().expect("2 bytes")) as usize;
        if bytes.len() < 2 + policy_size + 1 {
            return Err(VaultError::Corrupted("header policy block overrun"));
        }
        let policy = SecurityPolicy::deserialize(&bytes[2..2 + policy_size])?;

        let mut pos = 2 + policy_size;
        let slot_count = bytes[pos] as usize;
        pos += 1;
        if slot_count > MAX_SLOTS {
            return Err(VaultError::InvalidData("slot count"));
        }

        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            if bytes.len() - pos < 2 {
                return Err(VaultError::Corrupted("slot size prefix overrun"));
            }
            let slot_size =
                u16::from_be_bytes(bytes[pos..pos + 2].try_into().expect("2 bytes")) as usize;
            pos += 2;
            if bytes.len() - pos < slot_size {
                return Err(VaultError::Corrupted("key slot overruns header"));
            }
            slots.push(KeySlot::deserialize(&bytes[pos..pos + slot_size])?);
            pos += slot_size;
        }
        if pos != bytes.len() {
            return Err(VaultError::Corrupted("trailing bytes after slots"));
        }

        Ok(Self { policy, slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::format::slot::Role;

    fn slot_with(role: Role, active: bool) -> KeySlot {
        let mut slot = KeySlot {
            active,
            role,
            username_hash_len: 16,
            ..KeySlot::default()
        };
        crypto::fill_random(&mut slot.username_hash[..16]);
        crypto::fill_random(&mut slot.password_salt);
        crypto::fill_random(&mut slot.wrapped_dek);
        slot
    }

    #[test]
    fn roundtrip_with_slots() {
        let mut header = VaultHeader::new(SecurityPolicy::default());
        header.slots.push(slot_with(Role::Administrator, true));
        header.slots.push(slot_with(Role::Standard, true));
        header.slots.push(slot_with(Role::Standard, false));

        let bytes = header.serialize().unwrap();
        assert_eq!(VaultHeader::deserialize(&bytes).unwrap(), header);
    }

    #[test]
    fn roundtrip_at_slot_capacity() {
        let mut header = VaultHeader::new(SecurityPolicy::default());
        for i in 0..MAX_SLOTS {
            header
                .slots
                .push(slot_with(Role::Standard, i % 3 != 0));
        }
        let bytes = header.serialize().unwrap();
        assert_eq!(VaultHeader::deserialize(&bytes).unwrap(), header);

        header.slots.push(slot_with(Role::Standard, true));
        assert!(header.serialize().is_err());
    }

    #[test]
    fn roundtrip_empty_slot_table() {
        let header = VaultHeader::new(SecurityPolicy::default());
        let bytes = header.serialize().unwrap();
        assert_eq!(VaultHeader::deserialize(&bytes).unwrap(), header);
    }

    #[test]
    fn slot_count_over_cap_rejected() {
        let header = VaultHeader::new(SecurityPolicy::default());
        let mut bytes = header.serialize().unwrap();
        let count_at = 2 + crate::format::policy::POLICY_SIZE_CURRENT;
        bytes[count_at] = MAX_SLOTS as u8 + 1;
        assert!(matches!(
            VaultHeader::deserialize(&bytes),
            Err(VaultError::InvalidData("slot count"))
        ));
    }

    #[test]
    fn active_admin_count() {
        let mut header = VaultHeader::new(SecurityPolicy::default());
        header.slots.push(slot_with(Role::Administrator, true));
        header.slots.push(slot_with(Role::Administrator, false));
        header.slots.push(slot_with(Role::Standard, true));
        assert_eq!(header.active_admins(), 1);
    }
}
