//! Multi-user slot management: add/remove, roles, access control, and
//! the password lifecycle.

mod common;

use common::{default_policy, pw};
use towervault::error::VaultError;
use towervault::{PolicyUpdate, Record, Role, VaultEngine};

fn fresh_vault(dir: &tempfile::TempDir) -> (VaultEngine, std::path::PathBuf) {
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    engine
        .create_v2(
            &path,
            "root",
            &pw("correct horse battery staple"),
            &default_policy(),
            None,
        )
        .unwrap();
    (engine, path)
}

#[test]
fn admin_created_user_must_change_password() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine.save().unwrap();
    engine.close();

    let session = engine
        .open_v2(&path, "alice", &pw("temp-pass-1234"), None)
        .unwrap();
    assert_eq!(session.role, Role::Standard);
    assert!(session.must_change_password);

    // Records stay gated until the forced change happens.
    assert!(matches!(
        engine.records(),
        Err(VaultError::PermissionDenied)
    ));
    engine.close();
}

#[test]
fn duplicate_usernames_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);

    engine
        .open_v2(&path, "root", &pw("correct horse battery staple"), None)
        .unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    assert!(matches!(
        engine.add_user("alice", &pw("other-pass-5678"), Role::Standard),
        Err(VaultError::UserAlreadyExists)
    ));
    assert!(matches!(
        engine.add_user("root", &pw("other-pass-5678"), Role::Standard),
        Err(VaultError::UserAlreadyExists)
    ));
    engine.close();
}

#[test]
fn standard_users_cannot_manage_users() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine
        .change_password("alice", &pw("temp-pass-1234"), &pw("alice-pass-9999"), None)
        .unwrap();
    engine.save().unwrap();
    engine.close();

    engine
        .open_v2(&path, "alice", &pw("alice-pass-9999"), None)
        .unwrap();
    assert!(matches!(
        engine.add_user("mallory", &pw("mallory-pass-1"), Role::Standard),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        engine.remove_user("root"),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        engine.admin_reset_password("root", &pw("hijacked-pass-1")),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        engine.update_policy(&PolicyUpdate::default()),
        Err(VaultError::PermissionDenied)
    ));
    engine.close();
}

#[test]
fn last_administrator_is_protected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("bob", &pw("bob-pass-12345"), Role::Administrator)
        .unwrap();
    engine
        .add_user("carol", &pw("carol-pass-123"), Role::Standard)
        .unwrap();

    // Self-removal refused outright.
    assert!(matches!(
        engine.remove_user("root"),
        Err(VaultError::SelfRemovalNotAllowed)
    ));

    // With two active admins, removing one is fine.
    engine.remove_user("bob").unwrap();

    // bob's slot is preserved, just inactive.
    let users = engine.list_users().unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(users.iter().filter(|u| u.active).count(), 2);

    // root is now the only active admin and cannot be removed even by
    // another admin path; carol is standard so the admin count is 1.
    assert!(matches!(
        engine.remove_user("carol"),
        Ok(())
    ));
    engine.close();
}

#[test]
fn removing_last_admin_via_other_admin_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("bob", &pw("bob-pass-12345"), Role::Administrator)
        .unwrap();
    engine
        .change_password("bob", &pw("bob-pass-12345"), &pw("bob-pass-67890"), None)
        .unwrap();
    engine.save().unwrap();
    engine.close();

    // bob deactivates root; then bob is the last admin.
    engine
        .open_v2(&path, "bob", &pw("bob-pass-67890"), None)
        .unwrap();
    engine.remove_user("root").unwrap();
    assert!(matches!(
        engine.remove_user("bob"),
        Err(VaultError::SelfRemovalNotAllowed)
    ));
    engine.save().unwrap();
    engine.close();

    // The deactivated root can no longer authenticate.
    assert!(matches!(
        engine.open_v2(&path, "root", &root_pw, None),
        Err(VaultError::AuthenticationFailed)
    ));
}

#[test]
fn removed_user_slot_is_reused_only_when_full() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);

    engine
        .open_v2(&path, "root", &pw("correct horse battery staple"), None)
        .unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine.remove_user("alice").unwrap();

    // Plenty of room: a new user appends rather than recycling alice.
    engine
        .add_user("dave", &pw("dave-pass-1234"), Role::Standard)
        .unwrap();
    let users = engine.list_users().unwrap();
    assert_eq!(users.len(), 3);
    assert!(!users[1].active);
    assert!(users[2].active);
    engine.close();
}

#[test]
fn two_users_same_password_have_different_wrapped_deks() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);

    engine
        .open_v2(&path, "root", &pw("correct horse battery staple"), None)
        .unwrap();
    engine
        .add_user("alice", &pw("shared-password-1"), Role::Standard)
        .unwrap();
    engine
        .add_user("bob", &pw("shared-password-1"), Role::Standard)
        .unwrap();
    engine.save().unwrap();
    engine.close();

    // AES-KW is deterministic, so only unique salts keep identical
    // passwords from producing identical wrapped blocks on disk.
    let bytes = std::fs::read(&path).unwrap();
    let env = towervault::format::V2Envelope::parse(&bytes).unwrap();
    let header_bytes = towervault::ReedSolomonCodec::decode(&env.header_block).unwrap();
    let header = towervault::format::VaultHeader::deserialize(&header_bytes).unwrap();
    assert_eq!(header.slots.len(), 3);
    assert_ne!(header.slots[1].wrapped_dek, header.slots[2].wrapped_dek);
    assert_ne!(header.slots[1].password_salt, header.slots[2].password_salt);

    // Sanity: both users still open the vault.
    engine
        .open_v2(&path, "alice", &pw("shared-password-1"), None)
        .unwrap();
    engine.close();
    engine
        .open_v2(&path, "bob", &pw("shared-password-1"), None)
        .unwrap();
    engine.close();
}

#[test]
fn password_history_blocks_recent_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();

    engine
        .change_password("alice", &pw("temp-pass-1234"), &pw("new-pass-5678"), None)
        .unwrap();
    // Changing back to the retired password is refused.
    assert!(matches!(
        engine.change_password("alice", &pw("new-pass-5678"), &pw("temp-pass-1234"), None),
        Err(VaultError::PasswordReused)
    ));
    // Re-setting the current password is refused too.
    assert!(matches!(
        engine.change_password("alice", &pw("new-pass-5678"), &pw("new-pass-5678"), None),
        Err(VaultError::PasswordReused)
    ));
    engine.close();
}

#[test]
fn history_depth_bounds_the_reuse_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let mut policy = default_policy();
    policy.password_history_depth = 2;
    engine
        .create_v2(&path, "root", &pw("pass-gen-0-xx"), &policy, None)
        .unwrap();

    engine.open_v2(&path, "root", &pw("pass-gen-0-xx"), None).unwrap();
    engine
        .change_password("root", &pw("pass-gen-0-xx"), &pw("pass-gen-1-xx"), None)
        .unwrap();
    engine
        .change_password("root", &pw("pass-gen-1-xx"), &pw("pass-gen-2-xx"), None)
        .unwrap();
    engine
        .change_password("root", &pw("pass-gen-2-xx"), &pw("pass-gen-3-xx"), None)
        .unwrap();

    // The two most recently retired passwords are blocked...
    assert!(matches!(
        engine.change_password("root", &pw("pass-gen-3-xx"), &pw("pass-gen-2-xx"), None),
        Err(VaultError::PasswordReused)
    ));
    assert!(matches!(
        engine.change_password("root", &pw("pass-gen-3-xx"), &pw("pass-gen-1-xx"), None),
        Err(VaultError::PasswordReused)
    ));
    // ...but the one beyond the depth-2 window was evicted and is fine.
    engine
        .change_password("root", &pw("pass-gen-3-xx"), &pw("pass-gen-0-xx"), None)
        .unwrap();
    engine.close();
}

#[test]
fn depth_zero_disables_reuse_checking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let mut policy = default_policy();
    policy.password_history_depth = 0;
    engine
        .create_v2(&path, "root", &pw("pass-gen-0-xx"), &policy, None)
        .unwrap();

    engine.open_v2(&path, "root", &pw("pass-gen-0-xx"), None).unwrap();
    engine
        .change_password("root", &pw("pass-gen-0-xx"), &pw("pass-gen-1-xx"), None)
        .unwrap();
    engine
        .change_password("root", &pw("pass-gen-1-xx"), &pw("pass-gen-0-xx"), None)
        .unwrap();
    engine.close();
}

#[test]
fn admin_reset_forces_change_and_clears_history() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine
        .change_password("alice", &pw("temp-pass-1234"), &pw("alice-pass-0001"), None)
        .unwrap();

    engine
        .admin_reset_password("alice", &pw("reset-pass-7777"))
        .unwrap();
    engine.save().unwrap();
    engine.close();

    // Old passwords are dead; the reset one works but forces a change.
    assert!(matches!(
        engine.open_v2(&path, "alice", &pw("alice-pass-0001"), None),
        Err(VaultError::AuthenticationFailed)
    ));
    let session = engine
        .open_v2(&path, "alice", &pw("reset-pass-7777"), None)
        .unwrap();
    assert!(session.must_change_password);

    // History was cleared, so the pre-reset password is reusable.
    engine
        .change_password("alice", &pw("reset-pass-7777"), &pw("alice-pass-0001"), None)
        .unwrap();
    engine.close();
}

#[test]
fn change_password_requires_correct_old_password() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);

    engine
        .open_v2(&path, "root", &pw("correct horse battery staple"), None)
        .unwrap();
    assert!(matches!(
        engine.change_password("root", &pw("wrong-old-pass"), &pw("whatever-123"), None),
        Err(VaultError::AuthenticationFailed)
    ));
    engine.close();
}

#[test]
fn weak_new_passwords_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);

    engine
        .open_v2(&path, "root", &pw("correct horse battery staple"), None)
        .unwrap();
    assert!(matches!(
        engine.add_user("alice", &pw("tiny"), Role::Standard),
        Err(VaultError::WeakPassword)
    ));
    assert!(matches!(
        engine.change_password(
            "root",
            &pw("correct horse battery staple"),
            &pw("tiny"),
            None
        ),
        Err(VaultError::WeakPassword)
    ));
    engine.close();
}

#[test]
fn access_control_on_admin_only_records() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, path) = fresh_vault(&dir);
    let root_pw = pw("correct horse battery staple");

    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine
        .change_password("alice", &pw("temp-pass-1234"), &pw("alice-pass-0001"), None)
        .unwrap();

    let mut secret_record = Record::new(serde_json::json!({"site": "admin-only"}));
    secret_record.admin_only_viewable = true;
    let secret_id = engine.add_record(secret_record).unwrap();

    let mut sticky_record = Record::new(serde_json::json!({"site": "undeletable"}));
    sticky_record.admin_only_deletable = true;
    let sticky_id = engine.add_record(sticky_record).unwrap();

    let plain_id = engine
        .add_record(Record::new(serde_json::json!({"site": "public"})))
        .unwrap();
    engine.save().unwrap();
    engine.close();

    engine
        .open_v2(&path, "alice", &pw("alice-pass-0001"), None)
        .unwrap();
    // Listing filters out what alice may not view.
    let visible = engine.records().unwrap();
    assert_eq!(visible.len(), 2);
    assert!(visible.iter().all(|r| r.id != secret_id));

    assert!(matches!(
        engine.record(secret_id),
        Err(VaultError::PermissionDenied)
    ));
    assert!(matches!(
        engine.delete_record(sticky_id),
        Err(VaultError::PermissionDenied)
    ));
    engine.delete_record(plain_id).unwrap();
    engine.close();

    // The administrator passes both gates.
    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    assert!(engine.record(secret_id).is_ok());
    engine.delete_record(sticky_id).unwrap();
    engine.close();
}
