//! Vault file IO primitives.
//!
//! Goals:
//! - Restrictive permissions (0600) on the vault file.
//! - Crash-safe writes via the write-temp, fsync, atomic-rename,
//!   fsync-directory pattern: a failure before the rename leaves the
//!   original file untouched; the directory fsync lands before success
//!   is reported.
//!
//! This module is format-agnostic: it moves raw bytes. The engine owns
//! parsing and encryption.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::{Result, VaultError};

pub fn read_vault_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(VaultError::from_open)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(VaultError::ReadFailed)?;
    Ok(buf)
}

pub fn write_vault_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(VaultError::Corrupted("vault path has no parent directory"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(VaultError::WriteFailed)?;
    tmp.as_file_mut()
        .write_all(bytes)
        .map_err(VaultError::WriteFailed)?;
    tmp.as_file_mut()
        .sync_all()
        .map_err(VaultError::WriteFailed)?;

    #[cfg(unix)]
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(VaultError::WriteFailed)?;

    tmp.persist(path)
        .map_err(|e| VaultError::WriteFailed(e.error))?;
    set_permissions_0600(path)?;

    fsync_dir(dir)?;
    Ok(())
}

fn set_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(VaultError::WriteFailed)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let file = File::open(dir).map_err(VaultError::WriteFailed)?;
        file.sync_all().map_err(VaultError::WriteFailed)?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
