//! Engine configuration: backup placement and FEC preferences.
//!
//! These are host-application settings, not vault policy; nothing here is
//! persisted inside the container.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::fec;
use crate::format::slot::KekDerivation;

pub const BACKUP_RETENTION_MIN: usize = 1;
pub const BACKUP_RETENTION_MAX: usize = 50;
pub const BACKUP_RETENTION_DEFAULT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where timestamped backups land. `None` means the vault's own
    /// directory.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// How many backups to keep before pruning the oldest.
    #[serde(default = "default_retention")]
    pub backup_retention: usize,
    /// KDF used for the KEKs of newly created slots. Existing slots keep
    /// whatever they were created with.
    #[serde(default = "default_kek_derivation")]
    pub kek_derivation: KekDerivation,
}

fn default_retention() -> usize {
    BACKUP_RETENTION_DEFAULT
}

fn default_kek_derivation() -> KekDerivation {
    KekDerivation::Pbkdf2Sha256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            backup_retention: BACKUP_RETENTION_DEFAULT,
            kek_derivation: KekDerivation::Pbkdf2Sha256,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(BACKUP_RETENTION_MIN..=BACKUP_RETENTION_MAX).contains(&self.backup_retention) {
            return Err(VaultError::InvalidData("backup retention"));
        }
        Ok(())
    }

    /// The header always gets at least the floor redundancy, whatever the
    /// policy asks for.
    pub fn effective_header_fec_percent(policy_percent: u8) -> u8 {
        policy_percent.max(fec::HEADER_MIN_PERCENT)
    }
}
