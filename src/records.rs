//! The plaintext record store.
//!
//! Record contents are an opaque JSON value to the engine; the only
//! structure the engine reads is the per-record access-control flags,
//! which the session layer enforces.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VaultError};

pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    #[serde(default)]
    pub admin_only_viewable: bool,
    #[serde(default)]
    pub admin_only_deletable: bool,
    /// Opaque application payload.
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            admin_only_viewable: false,
            admin_only_deletable: false,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStore {
    pub schema_version: u32,
    pub records: Vec<Record>,
}

impl RecordStore {
    pub fn empty() -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            records: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let store: RecordStore =
            serde_json::from_slice(bytes).map_err(|_| VaultError::InvalidData("record store"))?;
        if store.schema_version != RECORD_SCHEMA_VERSION {
            return Err(VaultError::InvalidData("record schema version"));
        }
        Ok(store)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| VaultError::InvalidData("record store"))
    }
}
