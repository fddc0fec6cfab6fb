//! Timestamped backup rotation.
//!
//! Explicit saves snapshot the previous vault file to
//! `<name>.backup.YYYYMMDD_HHMMSS_mmm` in the configured backup
//! directory (the vault's directory by default), then prune the oldest
//! until at most the retention count remain. The stamp format sorts
//! lexicographically, so pruning and restore both work on file names.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::EngineConfig;
use crate::engine::io;
use crate::error::{Result, VaultError};

fn backup_dir(vault_path: &Path, config: &EngineConfig) -> Result<PathBuf> {
    if let Some(dir) = &config.backup_dir {
        return Ok(dir.clone());
    }
    vault_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or(VaultError::Corrupted("vault path has no parent directory"))
}

fn backup_prefix(vault_path: &Path) -> Result<String> {
    let name = vault_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(VaultError::Corrupted("vault path has no file name"))?;
    Ok(format!("{name}.backup."))
}

/// Snapshot the current vault file. Returns the backup path, or `None`
/// when there is no existing file to snapshot.
pub fn create_backup(vault_path: &Path, config: &EngineConfig) -> Result<Option<PathBuf>> {
    if !vault_path.exists() {
        return Ok(None);
    }
    let dir = backup_dir(vault_path, config)?;
    fs::create_dir_all(&dir).map_err(VaultError::WriteFailed)?;

    let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    let target = dir.join(format!("{}{stamp}", backup_prefix(vault_path)?));

    let bytes = io::read_vault_bytes(vault_path)?;
    io::write_vault_bytes_atomic(&target, &bytes)?;
    Ok(Some(target))
}

/// All backups for this vault, sorted oldest first.
pub fn list_backups(vault_path: &Path, config: &EngineConfig) -> Result<Vec<PathBuf>> {
    let dir = backup_dir(vault_path, config)?;
    let prefix = backup_prefix(vault_path)?;

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::ReadFailed(e)),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    backups.sort();
    Ok(backups)
}

/// Delete the oldest backups until at most the retention count remain.
pub fn prune_backups(vault_path: &Path, config: &EngineConfig) -> Result<()> {
    let backups = list_backups(vault_path, config)?;
    if backups.len() <= config.backup_retention {
        return Ok(());
    }
    for path in &backups[..backups.len() - config.backup_retention] {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to prune backup");
        }
    }
    Ok(())
}

/// Copy the newest backup over the vault file. Used after unrecoverable
/// header corruption.
pub fn restore_most_recent(vault_path: &Path, config: &EngineConfig) -> Result<PathBuf> {
    let backups = list_backups(vault_path, config)?;
    let newest = backups.last().ok_or(VaultError::NotFound)?;
    let bytes = io::read_vault_bytes(newest)?;
    io::write_vault_bytes_atomic(vault_path, &bytes)?;
    Ok(newest.clone())
}
