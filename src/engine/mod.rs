//! The vault engine: container IO, authentication, and every multi-user
//! operation behind one mutex-guarded facade.
//!
//! An engine instance owns at most one open vault. Methods lock the
//! engine state for their full duration, KDF work included, so every
//! mutation observed by a later call reflects a completed operation and
//! saves serialize with everything else. Long-running flows (creation,
//! password change under a token) are also available as background tasks
//! with progress events and cooperative cancellation.

pub mod backup;
pub mod io;
pub mod migrate;
pub mod task;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::config::EngineConfig;
use crate::crypto;
use crate::error::{Result, VaultError};
use crate::fec::ReedSolomonCodec;
use crate::format::envelope::{self, V1Envelope, V2Envelope, HEADER_FLAG_FEC};
use crate::format::policy::SecurityPolicy;
use crate::format::slot::{
    KekDerivation, KeySlot, MigrationStatus, Role, MAX_SLOTS,
};
use crate::format::{UsernameHashAlgorithm, VaultHeader};
use crate::keys::{self, KekParams, TOKEN_CHALLENGE_LEN};
use crate::records::{Record, RecordStore};
use crate::secure::SecureBuffer;
use crate::session::Session;
use crate::token::{TokenDevice, CHALLENGE_TIMEOUT_MS};
use task::{CancelledMarker, TaskContext, TaskHandle};

/// What a file on disk claims to be, before any authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Missing,
    V1,
    V2,
}

/// Non-secret view of one key slot for user management UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub slot: usize,
    pub active: bool,
    pub role: Role,
    pub must_change_password: bool,
    pub token_enrolled: bool,
    pub token_serial: Option<String>,
    pub last_login_at: i64,
}

/// Mutable subset of the security policy. Fields the key schedule
/// depends on (KDF iterations, the token algorithm and vault challenge)
/// are fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    pub min_password_length: Option<u8>,
    pub password_history_depth: Option<u8>,
    pub require_token: Option<bool>,
    pub header_fec_percent: Option<u8>,
    pub payload_fec_enabled: Option<bool>,
    pub payload_fec_percent: Option<u8>,
    pub username_hash_algorithm: Option<UsernameHashAlgorithm>,
}

struct OpenVault {
    path: PathBuf,
    header: VaultHeader,
    dek: SecureBuffer,
    records: RecordStore,
    session: Session,
    slot_index: usize,
    legacy_v1: bool,
}

impl Drop for OpenVault {
    fn drop(&mut self) {
        // The DEK zeroizes itself; the header still holds salts, wrapped
        // keys and token challenges.
        self.header.zeroize();
    }
}

struct EngineInner {
    config: EngineConfig,
    open: Option<OpenVault>,
}

/// Abort reason for internals shared between the synchronous API and
/// background tasks.
enum OpAbort {
    Err(VaultError),
    Cancelled,
}

impl From<VaultError> for OpAbort {
    fn from(e: VaultError) -> Self {
        OpAbort::Err(e)
    }
}

type OpResult<T> = std::result::Result<T, OpAbort>;

/// Progress/cancellation hooks; a no-op in the synchronous API.
#[derive(Clone, Copy)]
struct Hooks<'a>(Option<&'a TaskContext>);

impl Hooks<'_> {
    fn step(&self, step: u32, label: &str) {
        if let Some(ctx) = self.0 {
            ctx.report(step, label);
        }
    }

    fn checkpoint(&self) -> OpResult<()> {
        match self.0 {
            Some(ctx) => ctx.checkpoint().map_err(|_| OpAbort::Cancelled),
            None => Ok(()),
        }
    }
}

fn unabort<T>(r: OpResult<T>) -> Result<T> {
    match r {
        Ok(v) => Ok(v),
        Err(OpAbort::Err(e)) => Err(e),
        // Without a task context nothing can cancel.
        Err(OpAbort::Cancelled) => Err(VaultError::Busy),
    }
}

#[derive(Clone)]
pub struct VaultEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl VaultEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(EngineInner { config, open: None })),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                config: EngineConfig::default(),
                open: None,
            })),
        }
    }

    /// Sniff a file without authenticating.
    pub fn status(path: &Path) -> Result<VaultStatus> {
        let bytes = match io::read_vault_bytes(path) {
            Ok(bytes) => bytes,
            Err(VaultError::NotFound) => return Ok(VaultStatus::Missing),
            Err(e) => return Err(e),
        };
        match envelope::detect_version(&bytes)? {
            envelope::VERSION_V1 => Ok(VaultStatus::V1),
            envelope::VERSION_V2 => Ok(VaultStatus::V2),
            other => Err(VaultError::UnsupportedVersion(other)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open.is_some()
    }

    pub fn session(&self) -> Result<Session> {
        let inner = self.inner.lock();
        inner
            .open
            .as_ref()
            .map(|v| v.session.clone())
            .ok_or(VaultError::NotOpen)
    }

    // ------------------------------------------------------------------
    // Create / open / save / close
    // ------------------------------------------------------------------

    /// Create a new V2 vault with a single administrator slot. The vault
    /// is written to disk but not opened.
    pub fn create_v2(
        &self,
        path: &Path,
        admin_username: &str,
        admin_password: &SecretString,
        policy: &SecurityPolicy,
        device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<()> {
        let config = self.inner.lock().config.clone();
        let empty = RecordStore::empty().to_bytes()?;
        unabort(create_v2_inner(
            &config,
            path,
            admin_username,
            admin_password,
            policy,
            device,
            &empty,
            false,
            Hooks(None),
        ))
    }

    /// Background variant of [`create_v2`](Self::create_v2) with progress
    /// events and cooperative cancellation.
    pub fn create_v2_task(
        &self,
        path: PathBuf,
        admin_username: String,
        admin_password: SecretString,
        policy: SecurityPolicy,
        mut device: Option<Box<dyn TokenDevice + 'static>>,
    ) -> TaskHandle<()> {
        let engine = self.clone();
        task::spawn(4, move |ctx| {
            let config = engine.inner.lock().config.clone();
            let empty = match RecordStore::empty().to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => return Ok(Err(e)),
            };
            match create_v2_inner(
                &config,
                &path,
                &admin_username,
                &admin_password,
                &policy,
                device.as_deref_mut(),
                &empty,
                false,
                Hooks(Some(ctx)),
            ) {
                Ok(()) => Ok(Ok(())),
                Err(OpAbort::Err(e)) => Ok(Err(e)),
                Err(OpAbort::Cancelled) => Err(CancelledMarker),
            }
        })
    }

    /// Open a V2 vault as `username` and build a session.
    pub fn open_v2(
        &self,
        path: &Path,
        username: &str,
        password: &SecretString,
        mut device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<Session> {
        let mut inner = self.inner.lock();
        if inner.open.is_some() {
            return Err(VaultError::AlreadyOpen);
        }

        let bytes = io::read_vault_bytes(path)?;
        let env = V2Envelope::parse(&bytes)?;
        let header_bytes = if env.header_flags & HEADER_FLAG_FEC != 0 {
            ReedSolomonCodec::decode(&env.header_block)?
        } else {
            env.header_block.clone()
        };
        let mut header = VaultHeader::deserialize(&header_bytes)?;

        let slot_index = find_slot_index(&header, username)
            .map_err(|e| {
                tracing::debug!(cause = %e, "username lookup failed");
                VaultError::AuthenticationFailed
            })?
            .ok_or(VaultError::AuthenticationFailed)?;

        let slot = &header.slots[slot_index];
        let mut kek = derive_slot_kek(&header.policy, slot, password)?;
        if slot.token_enrolled {
            let response = slot_token_response(slot, device.as_deref_mut(), false)?;
            keys::combine_with_token_response(&mut kek, &response)?;
        }
        let dek = keys::unwrap_dek(&kek, &slot.wrapped_dek).map_err(|e| {
            tracing::debug!(cause = %e, "slot unwrap failed");
            VaultError::AuthenticationFailed
        })?;

        let ciphertext = if header.policy.payload_fec_enabled {
            ReedSolomonCodec::decode(&env.payload)?
        } else {
            env.payload.clone()
        };
        let plaintext = crypto::aes_gcm_decrypt(dek.as_key32()?, &env.data_iv, &ciphertext)?;
        let records = RecordStore::from_bytes(&plaintext)?;

        let now = now_unix();
        header.slots[slot_index].last_login_at = now;
        migrate_slot_if_pending(&mut header, slot_index, username, now)?;

        let slot = &header.slots[slot_index];
        let session = Session {
            username: username.to_string(),
            role: slot.role,
            must_change_password: slot.must_change_password,
            requires_token_enrollment: header.policy.require_token && !slot.token_enrolled,
        };

        let vault = OpenVault {
            path: path.to_path_buf(),
            header,
            dek,
            records,
            session: session.clone(),
            slot_index,
            legacy_v1: false,
        };

        // Persist the last-login stamp and any opportunistic migration.
        // Failure to do so must not fail the open.
        if let Err(e) = write_open_vault(&vault) {
            tracing::warn!(error = %e, "post-open save failed; login metadata not persisted");
        }

        inner.open = Some(vault);
        Ok(session)
    }

    /// Open a legacy single-user V1 vault read-only. Saving requires
    /// conversion to V2 first.
    pub fn open_v1(
        &self,
        path: &Path,
        password: &SecretString,
        device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<Session> {
        let mut inner = self.inner.lock();
        if inner.open.is_some() {
            return Err(VaultError::AlreadyOpen);
        }

        let bytes = io::read_vault_bytes(path)?;
        let env = V1Envelope::parse(&bytes)?;
        let (key, plaintext) = migrate::open_v1_payload(&env, password, device)?;
        let records = RecordStore::from_bytes(&plaintext)?;

        let mut policy = SecurityPolicy::default();
        policy.kdf_iterations = env
            .kdf_iterations
            .clamp(crate::format::policy::KDF_ITERATIONS_MIN, crate::format::policy::KDF_ITERATIONS_MAX);

        let session = Session {
            username: String::new(),
            role: Role::Administrator,
            must_change_password: false,
            requires_token_enrollment: false,
        };
        inner.open = Some(OpenVault {
            path: path.to_path_buf(),
            header: VaultHeader::new(policy),
            dek: key,
            records,
            session: session.clone(),
            slot_index: 0,
            legacy_v1: true,
        });
        Ok(session)
    }

    /// Explicit save: snapshot the previous file to a timestamped backup,
    /// then write atomically. Backup failure is logged, not fatal.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock();
        let vault = inner.open.as_ref().ok_or(VaultError::NotOpen)?;
        if vault.legacy_v1 {
            return Err(VaultError::UnsupportedVersion(envelope::VERSION_V1));
        }

        match backup::create_backup(&vault.path, &inner.config) {
            Ok(_) => {
                if let Err(e) = backup::prune_backups(&vault.path, &inner.config) {
                    tracing::warn!(error = %e, "backup pruning failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "backup creation failed"),
        }

        write_open_vault(vault)
    }

    /// Close the vault, zeroizing every live secret. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.open = None;
    }

    // ------------------------------------------------------------------
    // User management
    // ------------------------------------------------------------------

    /// Add a user (administrators only). The new user gets a fresh slot
    /// with the vault DEK wrapped under their KEK, and must change their
    /// password at first login. Tokens are enrolled by the user
    /// themselves, not on their behalf.
    pub fn add_user(&self, username: &str, password: &SecretString, role: Role) -> Result<()> {
        let mut inner = self.inner.lock();
        let kek_derivation = inner.config.kek_derivation;
        let vault = writable_vault(&mut inner)?;
        if !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }
        validate_username(username)?;
        check_password_length(&vault.header.policy, password)?;

        if find_slot_index(&vault.header, username)?.is_some() {
            return Err(VaultError::UserAlreadyExists);
        }
        let placement = free_slot_placement(&vault.header)?;

        let now = now_unix();
        let (mut slot, kek) = build_slot(
            &vault.header.policy,
            kek_derivation,
            username,
            password,
            role,
            true,
            now,
        )?;
        slot.wrapped_dek = keys::wrap_dek(&kek, &vault.dek)?;

        match placement {
            SlotPlacement::Append => vault.header.slots.push(slot),
            SlotPlacement::Reuse(i) => {
                vault.header.slots[i].zeroize();
                vault.header.slots[i] = slot;
            }
        }
        Ok(())
    }

    /// Deactivate a user's slot (administrators only). The slot is
    /// preserved, not compacted. Refuses self-removal and removal of the
    /// last active administrator.
    pub fn remove_user(&self, username: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        if !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }
        let idx = find_slot_index(&vault.header, username)?.ok_or(VaultError::UserNotFound)?;
        if idx == vault.slot_index {
            return Err(VaultError::SelfRemovalNotAllowed);
        }
        if vault.header.slots[idx].role == Role::Administrator && vault.header.active_admins() <= 1
        {
            return Err(VaultError::LastAdministrator);
        }
        vault.header.slots[idx].active = false;
        Ok(())
    }

    /// Change a password: self-service, or an administrator for any user
    /// who still knows their current password. A token-enrolled slot
    /// needs two device round trips (verify old, combine into new).
    pub fn change_password(
        &self,
        username: &str,
        old_password: &SecretString,
        new_password: &SecretString,
        device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        unabort(change_password_inner(
            &mut inner,
            username,
            old_password,
            new_password,
            device,
            Hooks(None),
        ))
    }

    /// Background variant of [`change_password`](Self::change_password).
    pub fn change_password_task(
        &self,
        username: String,
        old_password: SecretString,
        new_password: SecretString,
        mut device: Option<Box<dyn TokenDevice + 'static>>,
    ) -> TaskHandle<()> {
        let engine = self.clone();
        task::spawn(3, move |ctx| {
            let mut inner = engine.inner.lock();
            match change_password_inner(
                &mut inner,
                &username,
                &old_password,
                &new_password,
                device.as_deref_mut(),
                Hooks(Some(ctx)),
            ) {
                Ok(()) => Ok(Ok(())),
                Err(OpAbort::Err(e)) => Ok(Err(e)),
                Err(OpAbort::Cancelled) => Err(CancelledMarker),
            }
        })
    }

    /// Administrative password reset: bypasses the old password, forces a
    /// change at next login, clears password history, and unenrolls any
    /// token (the administrator does not hold the user's device).
    pub fn admin_reset_password(&self, username: &str, new_password: &SecretString) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        if !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }
        check_password_length(&vault.header.policy, new_password)?;
        let idx = find_slot_index(&vault.header, username)?.ok_or(VaultError::UserNotFound)?;

        let policy = vault.header.policy.clone();
        let now = now_unix();
        let salt = keys::generate_salt();
        let slot = &mut vault.header.slots[idx];
        let kek = keys::derive_kek(new_password, &salt, &kek_params(&policy, slot.kek_derivation))?;
        let wrapped = keys::wrap_dek(&kek, &vault.dek)?;

        slot.password_salt = salt;
        slot.wrapped_dek = wrapped;
        slot.must_change_password = true;
        slot.password_changed_at = now;
        for entry in &mut slot.password_history {
            entry.zeroize();
        }
        slot.password_history.clear();
        slot.clear_token();

        if idx == vault.slot_index {
            vault.session.must_change_password = true;
            vault.session.requires_token_enrollment = policy.require_token;
        }
        Ok(())
    }

    /// Enroll a hardware token for a user. Verifies the password first,
    /// then performs a challenge-response with user presence and folds
    /// the response into the slot's KEK.
    pub fn enroll_token(
        &self,
        username: &str,
        password: &SecretString,
        mut device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        let idx = find_slot_index(&vault.header, username)?.ok_or(VaultError::UserNotFound)?;
        let is_self = idx == vault.slot_index;
        if !is_self && !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }

        let dev = device.as_deref_mut().ok_or(VaultError::TokenNotPresent)?;
        if !dev.is_present() {
            return Err(VaultError::TokenNotPresent);
        }

        let policy = vault.header.policy.clone();
        let slot = &vault.header.slots[idx];
        let mut verify_kek = derive_slot_kek(&policy, slot, password)?;
        if slot.token_enrolled {
            let response = slot_token_response(slot, Some(&mut *dev), false)?;
            keys::combine_with_token_response(&mut verify_kek, &response)?;
        }
        let dek = keys::unwrap_dek(&verify_kek, &slot.wrapped_dek).map_err(|e| {
            tracing::debug!(cause = %e, "token enrollment password check failed");
            VaultError::AuthenticationFailed
        })?;

        let mut challenge = [0u8; crate::format::slot::SLOT_TOKEN_CHALLENGE_LEN];
        challenge[..TOKEN_CHALLENGE_LEN]
            .copy_from_slice(&crypto::random_bytes::<TOKEN_CHALLENGE_LEN>());
        let info = dev.info()?;
        // Enrollment requires user presence.
        let response =
            dev.challenge_response(&challenge[..TOKEN_CHALLENGE_LEN], true, CHALLENGE_TIMEOUT_MS)?;

        let mut final_kek = derive_slot_kek(&policy, &vault.header.slots[idx], password)?;
        keys::combine_with_token_response(&mut final_kek, &response)?;
        let wrapped = keys::wrap_dek(&final_kek, &dek)?;

        let now = now_unix();
        let slot = &mut vault.header.slots[idx];
        slot.wrapped_dek = wrapped;
        slot.token_enrolled = true;
        slot.token_challenge = challenge;
        slot.token_serial = info.serial;
        slot.token_enrolled_at = now;

        if is_self {
            vault.session.requires_token_enrollment = false;
        }
        Ok(())
    }

    /// Remove a user's token enrollment. Verifies password and current
    /// token, then re-wraps the DEK under a fresh password-only KEK.
    pub fn unenroll_token(
        &self,
        username: &str,
        password: &SecretString,
        mut device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        let idx = find_slot_index(&vault.header, username)?.ok_or(VaultError::UserNotFound)?;
        let is_self = idx == vault.slot_index;
        if !is_self && !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }

        let policy = vault.header.policy.clone();
        let slot = &vault.header.slots[idx];
        if !slot.token_enrolled {
            return Err(VaultError::TokenMetadataMissing);
        }

        let mut verify_kek = derive_slot_kek(&policy, slot, password)?;
        let response = slot_token_response(slot, device.as_deref_mut(), false)?;
        keys::combine_with_token_response(&mut verify_kek, &response)?;
        let dek = keys::unwrap_dek(&verify_kek, &slot.wrapped_dek).map_err(|e| {
            tracing::debug!(cause = %e, "token unenrollment check failed");
            VaultError::AuthenticationFailed
        })?;

        let salt = keys::generate_salt();
        let kek = keys::derive_kek(password, &salt, &kek_params(&policy, slot.kek_derivation))?;
        let wrapped = keys::wrap_dek(&kek, &dek)?;

        let slot = &mut vault.header.slots[idx];
        slot.password_salt = salt;
        slot.wrapped_dek = wrapped;
        slot.clear_token();

        if is_self && policy.require_token {
            vault.session.requires_token_enrollment = true;
        }
        Ok(())
    }

    /// Apply a policy update (administrators only). Switching the
    /// username hash algorithm starts an opportunistic migration: every
    /// active slot is marked pending and re-hashed at its owner's next
    /// successful login; the caller's own slot migrates immediately.
    pub fn update_policy(&self, update: &PolicyUpdate) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        if !vault.session.is_admin() {
            return Err(VaultError::PermissionDenied);
        }

        let mut policy = vault.header.policy.clone();
        if let Some(v) = update.min_password_length {
            policy.min_password_length = v;
        }
        if let Some(v) = update.password_history_depth {
            policy.password_history_depth = v;
        }
        if let Some(v) = update.require_token {
            policy.require_token = v;
        }
        if let Some(v) = update.header_fec_percent {
            policy.header_fec_percent = v;
        }
        if let Some(v) = update.payload_fec_enabled {
            policy.payload_fec_enabled = v;
        }
        if let Some(v) = update.payload_fec_percent {
            policy.payload_fec_percent = v;
        }

        let now = now_unix();
        let migration_target = match update.username_hash_algorithm {
            Some(target) if target != policy.username_hash_algorithm => {
                if policy.username_migration_active {
                    return Err(VaultError::Busy);
                }
                policy.username_migration_active = true;
                policy.username_migration_target = target;
                policy.username_migration_started_at = now;
                Some(target)
            }
            _ => None,
        };

        policy.modified_at = now;
        policy.validate()?;
        vault.header.policy = policy;

        if migration_target.is_some() {
            for slot in &mut vault.header.slots {
                if slot.active {
                    slot.migration_status = MigrationStatus::Pending;
                }
            }
            // The caller just authenticated, so their plaintext username
            // is in hand; migrate their slot on the spot.
            let username = vault.session.username.clone();
            let idx = vault.slot_index;
            migrate_slot_if_pending(&mut vault.header, idx, &username, now)?;
        }
        Ok(())
    }

    /// Active and inactive slots, without secret material.
    pub fn list_users(&self) -> Result<Vec<UserSummary>> {
        let inner = self.inner.lock();
        let vault = inner.open.as_ref().ok_or(VaultError::NotOpen)?;
        Ok(vault
            .header
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| UserSummary {
                slot: i,
                active: s.active,
                role: s.role,
                must_change_password: s.must_change_password,
                token_enrolled: s.token_enrolled,
                token_serial: if s.token_serial.is_empty() {
                    None
                } else {
                    Some(s.token_serial.clone())
                },
                last_login_at: s.last_login_at,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Token PIN storage
    // ------------------------------------------------------------------

    /// Store the session user's token PIN, AES-256-GCM encrypted under
    /// their password-derived KEK inside the slot.
    pub fn store_token_pin(
        &self,
        password: &SecretString,
        device: Option<&mut (dyn TokenDevice + 'static)>,
        pin: &SecretString,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        let idx = vault.slot_index;
        let policy = vault.header.policy.clone();
        let slot = &vault.header.slots[idx];
        if !slot.token_enrolled {
            return Err(VaultError::TokenMetadataMissing);
        }

        let pw_kek = verify_slot_password(&policy, slot, password, device)?;
        let iv = crypto::random_bytes::<{ crypto::GCM_IV_LEN }>();
        let ct = crypto::aes_gcm_encrypt(pw_kek.as_key32()?, &iv, pin.expose_secret().as_bytes())?;

        let slot = &mut vault.header.slots[idx];
        slot.encrypted_token_pin.zeroize();
        slot.encrypted_token_pin = iv.iter().copied().chain(ct).collect();
        Ok(())
    }

    /// Decrypt and return the session user's stored token PIN.
    pub fn token_pin(
        &self,
        password: &SecretString,
        device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<SecretString> {
        let inner = self.inner.lock();
        let vault = inner.open.as_ref().ok_or(VaultError::NotOpen)?;
        if vault.legacy_v1 {
            return Err(VaultError::UnsupportedVersion(envelope::VERSION_V1));
        }
        let slot = &vault.header.slots[vault.slot_index];
        if slot.encrypted_token_pin.len() <= crypto::GCM_IV_LEN {
            return Err(VaultError::TokenMetadataMissing);
        }

        let pw_kek = verify_slot_password(&vault.header.policy, slot, password, device)?;
        let (iv, ct) = slot.encrypted_token_pin.split_at(crypto::GCM_IV_LEN);
        let iv: [u8; crypto::GCM_IV_LEN] = iv.try_into().expect("12 bytes");
        let plaintext = crypto::aes_gcm_decrypt(pw_kek.as_key32()?, &iv, ct)?;
        let pin = String::from_utf8(plaintext.to_vec())
            .map_err(|_| VaultError::InvalidData("token pin"))?;
        Ok(SecretString::from(pin))
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// All records the session user may view.
    pub fn records(&self) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        let vault = inner.open.as_ref().ok_or(VaultError::NotOpen)?;
        vault.session.check_records_accessible()?;
        Ok(vault
            .records
            .records
            .iter()
            .filter(|r| vault.session.can_view(r))
            .cloned()
            .collect())
    }

    /// One record by id. Standard users cannot view admin-only records.
    pub fn record(&self, id: Uuid) -> Result<Record> {
        let inner = self.inner.lock();
        let vault = inner.open.as_ref().ok_or(VaultError::NotOpen)?;
        vault.session.check_records_accessible()?;
        let record = vault
            .records
            .records
            .iter()
            .find(|r| r.id == id)
            .ok_or(VaultError::NotFound)?;
        if !vault.session.can_view(record) {
            return Err(VaultError::PermissionDenied);
        }
        Ok(record.clone())
    }

    pub fn add_record(&self, record: Record) -> Result<Uuid> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        vault.session.check_records_accessible()?;
        let id = record.id;
        if vault.records.records.iter().any(|r| r.id == id) {
            return Err(VaultError::InvalidData("duplicate record id"));
        }
        vault.records.records.push(record);
        Ok(id)
    }

    pub fn update_record(&self, record: Record) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        vault.session.check_records_accessible()?;
        let can_view = vault.session.can_view(&record);
        let existing = vault
            .records
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(VaultError::NotFound)?;
        if !can_view || !vault.session.can_view(existing) {
            return Err(VaultError::PermissionDenied);
        }
        *existing = record;
        Ok(())
    }

    /// Delete a record. Standard users cannot delete admin-only-deletable
    /// records.
    pub fn delete_record(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let vault = writable_vault(&mut inner)?;
        vault.session.check_records_accessible()?;
        let idx = vault
            .records
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(VaultError::NotFound)?;
        if !vault.session.can_delete(&vault.records.records[idx]) {
            return Err(VaultError::PermissionDenied);
        }
        vault.records.records.remove(idx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversion and recovery
    // ------------------------------------------------------------------

    /// Convert a V1 vault in place to V2, re-wrapping its payload under a
    /// new administrator slot. A `.v1.backup` snapshot is taken first and
    /// the original is restored on any failure. Irreversible on success.
    pub fn convert_v1_to_v2(
        &self,
        path: &Path,
        v1_password: &SecretString,
        admin_username: &str,
        admin_password: &SecretString,
        policy: &SecurityPolicy,
        device: Option<&mut (dyn TokenDevice + 'static)>,
    ) -> Result<()> {
        let inner = self.inner.lock();
        if inner.open.is_some() {
            return Err(VaultError::AlreadyOpen);
        }
        let config = inner.config.clone();
        drop(inner);

        let bytes = io::read_vault_bytes(path)?;
        let version = envelope::detect_version(&bytes)?;
        if version != envelope::VERSION_V1 {
            return Err(VaultError::UnsupportedVersion(version));
        }
        let env = V1Envelope::parse(&bytes)?;
        let (_key, plaintext) = migrate::open_v1_payload(&env, v1_password, device)?;

        let snapshot = migrate::v1_backup_path(path);
        io::write_vault_bytes_atomic(&snapshot, &bytes)?;

        let result = unabort(create_v2_inner(
            &config,
            path,
            admin_username,
            admin_password,
            policy,
            None,
            &plaintext,
            true,
            Hooks(None),
        ));
        if let Err(e) = result {
            // Roll the container back; the snapshot stays for forensics.
            if let Err(restore_err) = io::write_vault_bytes_atomic(path, &bytes) {
                tracing::warn!(error = %restore_err, "failed to restore v1 vault after conversion error");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Replace the vault file with the most recent timestamped backup.
    /// Only valid while no vault is open.
    pub fn restore_from_most_recent_backup(&self, path: &Path) -> Result<PathBuf> {
        let inner = self.inner.lock();
        if inner.open.is_some() {
            return Err(VaultError::AlreadyOpen);
        }
        backup::restore_most_recent(path, &inner.config)
    }
}

// ----------------------------------------------------------------------
// Internals
// ----------------------------------------------------------------------

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 255 {
        return Err(VaultError::InvalidUsername);
    }
    Ok(())
}

fn check_password_length(policy: &SecurityPolicy, password: &SecretString) -> Result<()> {
    if password.expose_secret().len() < policy.min_password_length as usize {
        return Err(VaultError::WeakPassword);
    }
    Ok(())
}

fn writable_vault<'a>(inner: &'a mut EngineInner) -> Result<&'a mut OpenVault> {
    let vault = inner.open.as_mut().ok_or(VaultError::NotOpen)?;
    if vault.legacy_v1 {
        return Err(VaultError::UnsupportedVersion(envelope::VERSION_V1));
    }
    Ok(vault)
}

fn kek_params(policy: &SecurityPolicy, derivation: KekDerivation) -> KekParams {
    match derivation {
        KekDerivation::Pbkdf2Sha256 => KekParams::Pbkdf2 {
            iterations: policy.kdf_iterations,
        },
        KekDerivation::Argon2id => KekParams::Argon2id(policy.argon2),
    }
}

fn derive_slot_kek(
    policy: &SecurityPolicy,
    slot: &KeySlot,
    password: &SecretString,
) -> Result<SecureBuffer> {
    keys::derive_kek(password, &slot.password_salt, &kek_params(policy, slot.kek_derivation))
}

/// Ask the device for the slot's challenge response.
fn slot_token_response(
    slot: &KeySlot,
    device: Option<&mut (dyn TokenDevice + 'static)>,
    require_touch: bool,
) -> Result<Vec<u8>> {
    let device = device.ok_or(VaultError::TokenNotPresent)?;
    if !device.is_present() {
        return Err(VaultError::TokenNotPresent);
    }
    device.challenge_response(
        &slot.token_challenge[..TOKEN_CHALLENGE_LEN],
        require_touch,
        CHALLENGE_TIMEOUT_MS,
    )
}

/// Verify a slot password (folding in the token where enrolled) and
/// return the password-only KEK.
fn verify_slot_password(
    policy: &SecurityPolicy,
    slot: &KeySlot,
    password: &SecretString,
    mut device: Option<&mut (dyn TokenDevice + 'static)>,
) -> Result<SecureBuffer> {
    let pw_kek = derive_slot_kek(policy, slot, password)?;
    let mut final_kek = SecureBuffer::from_vec(pw_kek.as_slice().to_vec());
    if slot.token_enrolled {
        let response = slot_token_response(slot, device.as_deref_mut(), false)?;
        keys::combine_with_token_response(&mut final_kek, &response)?;
    }
    keys::unwrap_dek(&final_kek, &slot.wrapped_dek).map_err(|e| {
        tracing::debug!(cause = %e, "slot password check failed");
        VaultError::AuthenticationFailed
    })?;
    Ok(pw_kek)
}

/// Which algorithm a slot's stored username hash was produced with.
fn effective_username_algo(policy: &SecurityPolicy, slot: &KeySlot) -> UsernameHashAlgorithm {
    if policy.username_migration_active && slot.migration_status == MigrationStatus::Migrated {
        policy.username_migration_target
    } else {
        policy.username_hash_algorithm
    }
}

fn find_slot_index(header: &VaultHeader, username: &str) -> Result<Option<usize>> {
    for (i, slot) in header.slots.iter().enumerate() {
        if !slot.active {
            continue;
        }
        let algo = effective_username_algo(&header.policy, slot);
        let (len, field) =
            keys::hash_username(username, algo, &slot.username_salt, &header.policy.argon2)?;
        if len == slot.username_hash_len
            && crypto::ct_eq(&field[..len as usize], slot.username_hash_bytes())
        {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Post-authentication opportunistic username re-hash. Only ever runs
/// after the user proved their password; it needs the plaintext username.
fn migrate_slot_if_pending(
    header: &mut VaultHeader,
    idx: usize,
    username: &str,
    now: i64,
) -> Result<()> {
    if !header.policy.username_migration_active
        || header.slots[idx].migration_status != MigrationStatus::Pending
    {
        return Ok(());
    }
    let target = header.policy.username_migration_target;
    let argon2 = header.policy.argon2;

    let salt = keys::generate_salt();
    let (len, field) = keys::hash_username(username, target, &salt, &argon2)?;
    let slot = &mut header.slots[idx];
    slot.username_salt = salt;
    slot.username_hash = field;
    slot.username_hash_len = len;
    slot.migration_status = MigrationStatus::Migrated;
    slot.migrated_at = now;

    let all_done = !header
        .slots
        .iter()
        .any(|s| s.active && s.migration_status == MigrationStatus::Pending);
    if all_done {
        header.policy.username_hash_algorithm = target;
        header.policy.username_migration_active = false;
    }
    Ok(())
}

enum SlotPlacement {
    Append,
    Reuse(usize),
}

/// Where a new slot goes: a fresh entry while the table has room,
/// otherwise recycle the oldest deactivated slot.
fn free_slot_placement(header: &VaultHeader) -> Result<SlotPlacement> {
    if header.slots.len() < MAX_SLOTS {
        return Ok(SlotPlacement::Append);
    }
    header
        .slots
        .iter()
        .position(|s| !s.active)
        .map(SlotPlacement::Reuse)
        .ok_or(VaultError::MaxUsersReached)
}

/// Assemble a slot for a new user. The wrapped DEK is filled in by the
/// caller, which owns the vault DEK.
fn build_slot(
    policy: &SecurityPolicy,
    kek_derivation: KekDerivation,
    username: &str,
    password: &SecretString,
    role: Role,
    must_change: bool,
    now: i64,
) -> Result<(KeySlot, SecureBuffer)> {
    let username_salt = keys::generate_salt();
    let algo = if policy.username_migration_active {
        policy.username_migration_target
    } else {
        policy.username_hash_algorithm
    };
    let (hash_len, hash) = keys::hash_username(username, algo, &username_salt, &policy.argon2)?;

    let password_salt = keys::generate_salt();
    let kek = keys::derive_kek(password, &password_salt, &kek_params(policy, kek_derivation))?;

    let slot = KeySlot {
        active: true,
        kek_derivation,
        username_hash_len: hash_len,
        username_hash: hash,
        username_salt,
        password_salt,
        role,
        must_change_password: must_change,
        password_changed_at: now,
        migration_status: if policy.username_migration_active {
            MigrationStatus::Migrated
        } else {
            MigrationStatus::Unmigrated
        },
        migrated_at: if policy.username_migration_active { now } else { 0 },
        ..KeySlot::default()
    };
    Ok((slot, kek))
}

/// Serialize, FEC-encode, encrypt, and atomically write an open vault.
fn write_open_vault(vault: &OpenVault) -> Result<()> {
    let payload = vault.records.to_bytes()?;
    write_container(&vault.path, &vault.header, &vault.dek, &payload)
}

fn write_container(
    path: &Path,
    header: &VaultHeader,
    dek: &SecureBuffer,
    payload_plain: &[u8],
) -> Result<()> {
    let policy = &header.policy;
    let header_bytes = header.serialize()?;

    let effective = EngineConfig::effective_header_fec_percent(policy.header_fec_percent);
    let header_block = ReedSolomonCodec::new(effective)?.encode(&header_bytes);

    let data_iv = crypto::random_bytes::<{ crypto::GCM_IV_LEN }>();
    let ciphertext = crypto::aes_gcm_encrypt(dek.as_key32()?, &data_iv, payload_plain)?;
    let payload = if policy.payload_fec_enabled {
        ReedSolomonCodec::new(policy.payload_fec_percent)?.encode(&ciphertext)
    } else {
        ciphertext
    };

    let env = V2Envelope {
        kdf_iterations: policy.kdf_iterations,
        header_flags: HEADER_FLAG_FEC,
        header_fec_percent: effective,
        header_block,
        data_salt: crypto::random_bytes(),
        data_iv,
        payload,
    };
    io::write_vault_bytes_atomic(path, &env.serialize())
}

#[allow(clippy::too_many_arguments)]
fn create_v2_inner(
    config: &EngineConfig,
    path: &Path,
    admin_username: &str,
    admin_password: &SecretString,
    policy: &SecurityPolicy,
    mut device: Option<&mut (dyn TokenDevice + 'static)>,
    payload_plain: &[u8],
    allow_overwrite: bool,
    hooks: Hooks<'_>,
) -> OpResult<()> {
    policy.validate()?;
    validate_username(admin_username)?;
    check_password_length(policy, admin_password)?;
    if !allow_overwrite && path.exists() {
        return Err(OpAbort::Err(VaultError::OpenFailed(std::io::Error::from(
            std::io::ErrorKind::AlreadyExists,
        ))));
    }

    let now = now_unix();
    let mut policy = policy.clone();
    policy.created_at = now;
    policy.modified_at = now;
    // Creation never starts mid-migration.
    policy.username_migration_active = false;
    policy.username_migration_started_at = 0;
    if policy.require_token && policy.token_challenge.iter().all(|b| *b == 0) {
        crypto::fill_random(&mut policy.token_challenge);
    }

    hooks.step(1, "deriving administrator key");
    let (mut slot, kek) = build_slot(
        &policy,
        config.kek_derivation,
        admin_username,
        admin_password,
        Role::Administrator,
        false,
        now,
    )?;
    hooks.checkpoint()?;

    let dek = keys::generate_dek();
    let final_kek = match device.as_deref_mut() {
        Some(dev) if dev.is_present() => {
            hooks.step(2, "enrolling administrator token");
            let mut challenge = [0u8; crate::format::slot::SLOT_TOKEN_CHALLENGE_LEN];
            challenge[..TOKEN_CHALLENGE_LEN]
                .copy_from_slice(&crypto::random_bytes::<TOKEN_CHALLENGE_LEN>());
            let info = dev.info()?;
            let response = dev.challenge_response(
                &challenge[..TOKEN_CHALLENGE_LEN],
                true,
                CHALLENGE_TIMEOUT_MS,
            )?;
            let mut combined = SecureBuffer::from_vec(kek.as_slice().to_vec());
            keys::combine_with_token_response(&mut combined, &response)?;

            slot.token_enrolled = true;
            slot.token_challenge = challenge;
            slot.token_serial = info.serial;
            slot.token_enrolled_at = now;
            combined
        }
        _ => kek,
    };
    hooks.checkpoint()?;

    hooks.step(3, "encrypting vault");
    slot.wrapped_dek = keys::wrap_dek(&final_kek, &dek)?;

    let mut header = VaultHeader::new(policy);
    header.slots.push(slot);

    hooks.step(4, "writing container");
    write_container(path, &header, &dek, payload_plain)?;
    header.zeroize();
    Ok(())
}

fn change_password_inner(
    inner: &mut EngineInner,
    username: &str,
    old_password: &SecretString,
    new_password: &SecretString,
    mut device: Option<&mut (dyn TokenDevice + 'static)>,
    hooks: Hooks<'_>,
) -> OpResult<()> {
    let vault = writable_vault(inner)?;
    let idx =
        find_slot_index(&vault.header, username)?.ok_or(VaultError::UserNotFound)?;
    let is_self = idx == vault.slot_index;
    if !is_self && !vault.session.is_admin() {
        return Err(OpAbort::Err(VaultError::PermissionDenied));
    }

    let policy = vault.header.policy.clone();
    check_password_length(&policy, new_password)?;

    hooks.step(1, "verifying current credentials");
    let slot = &vault.header.slots[idx];
    let old_pw_kek = derive_slot_kek(&policy, slot, old_password)?;
    let mut old_final = SecureBuffer::from_vec(old_pw_kek.as_slice().to_vec());
    if slot.token_enrolled {
        // First device round trip: verify under the current combine.
        let response = slot_token_response(slot, device.as_deref_mut(), true)?;
        keys::combine_with_token_response(&mut old_final, &response)?;
    }
    let dek = keys::unwrap_dek(&old_final, &slot.wrapped_dek).map_err(|e| {
        tracing::debug!(cause = %e, "password change verification failed");
        VaultError::AuthenticationFailed
    })?;

    let depth = policy.password_history_depth as usize;
    if depth > 0 {
        if crypto::ct_eq(
            old_password.expose_secret().as_bytes(),
            new_password.expose_secret().as_bytes(),
        ) {
            return Err(OpAbort::Err(VaultError::PasswordReused));
        }
        for entry in &vault.header.slots[idx].password_history {
            if keys::history_matches(entry, new_password) {
                return Err(OpAbort::Err(VaultError::PasswordReused));
            }
        }
    }
    hooks.checkpoint()?;

    hooks.step(2, "deriving replacement key");
    let salt = keys::generate_salt();
    let slot = &vault.header.slots[idx];
    let new_pw_kek = keys::derive_kek(
        new_password,
        &salt,
        &kek_params(&policy, slot.kek_derivation),
    )?;
    let mut new_final = SecureBuffer::from_vec(new_pw_kek.as_slice().to_vec());
    if slot.token_enrolled {
        // Second device round trip: same challenge, folded into the new
        // KEK. The device demands a separate touch for each response.
        let response = slot_token_response(slot, device.as_deref_mut(), true)?;
        keys::combine_with_token_response(&mut new_final, &response)?;
    }
    hooks.checkpoint()?;

    hooks.step(3, "rewrapping vault key");
    let wrapped = keys::wrap_dek(&new_final, &dek)?;

    // Stored PINs ride on the password-only KEK and must follow the salt.
    let reencrypted_pin: Option<Vec<u8>> = {
        let slot = &vault.header.slots[idx];
        if slot.encrypted_token_pin.len() > crypto::GCM_IV_LEN {
            let (iv, ct) = slot.encrypted_token_pin.split_at(crypto::GCM_IV_LEN);
            let iv: [u8; crypto::GCM_IV_LEN] = iv.try_into().expect("12 bytes");
            let pin_plain = crypto::aes_gcm_decrypt(old_pw_kek.as_key32()?, &iv, ct)?;
            let new_iv = crypto::random_bytes::<{ crypto::GCM_IV_LEN }>();
            let new_ct = crypto::aes_gcm_encrypt(new_pw_kek.as_key32()?, &new_iv, &pin_plain)?;
            Some(new_iv.iter().copied().chain(new_ct).collect())
        } else {
            None
        }
    };

    let now = now_unix();
    let slot = &mut vault.header.slots[idx];
    slot.password_salt = salt;
    slot.wrapped_dek = wrapped;
    slot.must_change_password = false;
    slot.password_changed_at = now;
    if let Some(pin) = reencrypted_pin {
        slot.encrypted_token_pin.zeroize();
        slot.encrypted_token_pin = pin;
    }

    if depth > 0 {
        slot.password_history
            .push(keys::history_entry(old_password, now));
        while slot.password_history.len() > depth {
            let mut evicted = slot.password_history.remove(0);
            evicted.zeroize();
        }
    }

    if is_self {
        vault.session.must_change_password = false;
    }
    Ok(())
}
