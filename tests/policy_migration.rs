//! Policy updates and the opportunistic username-hash migration.

mod common;

use common::{default_policy, pw};
use towervault::error::VaultError;
use towervault::format::{V2Envelope, VaultHeader};
use towervault::{
    MigrationStatus, PolicyUpdate, ReedSolomonCodec, Role, UsernameHashAlgorithm, VaultEngine,
};

fn read_header(path: &std::path::Path) -> VaultHeader {
    let bytes = std::fs::read(path).unwrap();
    let env = V2Envelope::parse(&bytes).unwrap();
    let header_bytes = ReedSolomonCodec::decode(&env.header_block).unwrap();
    VaultHeader::deserialize(&header_bytes).unwrap()
}

#[test]
fn update_policy_applies_bounded_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let password = pw("correct horse battery staple");

    engine
        .create_v2(&path, "root", &password, &default_policy(), None)
        .unwrap();
    engine.open_v2(&path, "root", &password, None).unwrap();

    engine
        .update_policy(&PolicyUpdate {
            min_password_length: Some(16),
            password_history_depth: Some(10),
            header_fec_percent: Some(30),
            ..PolicyUpdate::default()
        })
        .unwrap();
    engine.save().unwrap();

    let header = read_header(&path);
    assert_eq!(header.policy.min_password_length, 16);
    assert_eq!(header.policy.password_history_depth, 10);
    assert_eq!(header.policy.header_fec_percent, 30);

    // Out-of-range values are refused atomically.
    assert!(matches!(
        engine.update_policy(&PolicyUpdate {
            password_history_depth: Some(25),
            ..PolicyUpdate::default()
        }),
        Err(VaultError::InvalidData(_))
    ));
    engine.close();
}

#[test]
fn raised_minimum_applies_to_new_passwords() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let password = pw("correct horse battery staple");

    engine
        .create_v2(&path, "root", &password, &default_policy(), None)
        .unwrap();
    engine.open_v2(&path, "root", &password, None).unwrap();
    engine
        .update_policy(&PolicyUpdate {
            min_password_length: Some(20),
            ..PolicyUpdate::default()
        })
        .unwrap();

    assert!(matches!(
        engine.add_user("alice", &pw("short-pass-123"), Role::Standard),
        Err(VaultError::WeakPassword)
    ));
    engine
        .add_user("alice", &pw("a sufficiently long password"), Role::Standard)
        .unwrap();
    engine.close();
}

#[test]
fn username_hash_migration_is_opportunistic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let root_pw = pw("correct horse battery staple");

    engine
        .create_v2(&path, "root", &root_pw, &default_policy(), None)
        .unwrap();
    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine
        .change_password("alice", &pw("temp-pass-1234"), &pw("alice-pass-0001"), None)
        .unwrap();

    // Switch hashing to SHA3-256. The caller's own slot migrates on the
    // spot; alice's waits for her next login.
    engine
        .update_policy(&PolicyUpdate {
            username_hash_algorithm: Some(UsernameHashAlgorithm::Sha3_256),
            ..PolicyUpdate::default()
        })
        .unwrap();
    engine.save().unwrap();
    engine.close();

    let header = read_header(&path);
    assert!(header.policy.username_migration_active);
    assert_eq!(
        header.policy.username_migration_target,
        UsernameHashAlgorithm::Sha3_256
    );
    // Still the old algorithm until everyone migrated.
    assert_eq!(
        header.policy.username_hash_algorithm,
        UsernameHashAlgorithm::Plain
    );
    assert_eq!(header.slots[0].migration_status, MigrationStatus::Migrated);
    assert_eq!(header.slots[1].migration_status, MigrationStatus::Pending);
    // root's hash is no longer the plain username.
    assert_ne!(header.slots[0].username_hash_bytes(), b"root");

    // alice authenticates against her old-format hash; the open migrates
    // her slot and completes the vault-wide switch.
    engine
        .open_v2(&path, "alice", &pw("alice-pass-0001"), None)
        .unwrap();
    engine.close();

    let header = read_header(&path);
    assert!(!header.policy.username_migration_active);
    assert_eq!(
        header.policy.username_hash_algorithm,
        UsernameHashAlgorithm::Sha3_256
    );
    assert_eq!(header.slots[1].migration_status, MigrationStatus::Migrated);

    // Both users keep authenticating after the switch.
    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine.close();
    engine
        .open_v2(&path, "alice", &pw("alice-pass-0001"), None)
        .unwrap();
    engine.close();
}

#[test]
fn second_migration_while_active_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let root_pw = pw("correct horse battery staple");

    engine
        .create_v2(&path, "root", &root_pw, &default_policy(), None)
        .unwrap();
    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();

    engine
        .update_policy(&PolicyUpdate {
            username_hash_algorithm: Some(UsernameHashAlgorithm::Sha3_256),
            ..PolicyUpdate::default()
        })
        .unwrap();
    // alice has not migrated yet, so a retarget is refused.
    assert!(matches!(
        engine.update_policy(&PolicyUpdate {
            username_hash_algorithm: Some(UsernameHashAlgorithm::Sha3_512),
            ..PolicyUpdate::default()
        }),
        Err(VaultError::Busy)
    ));
    engine.close();
}

#[test]
fn users_added_mid_migration_use_the_target_algorithm() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.twr");
    let engine = VaultEngine::with_defaults();
    let root_pw = pw("correct horse battery staple");

    engine
        .create_v2(&path, "root", &root_pw, &default_policy(), None)
        .unwrap();
    engine.open_v2(&path, "root", &root_pw, None).unwrap();
    engine
        .add_user("alice", &pw("temp-pass-1234"), Role::Standard)
        .unwrap();
    engine
        .update_policy(&PolicyUpdate {
            username_hash_algorithm: Some(UsernameHashAlgorithm::Sha3_256),
            ..PolicyUpdate::default()
        })
        .unwrap();

    // bob lands directly on the target algorithm, born migrated.
    engine
        .add_user("bob", &pw("bob-pass-12345"), Role::Standard)
        .unwrap();
    engine.save().unwrap();

    let header = read_header(&path);
    assert_eq!(header.slots[2].migration_status, MigrationStatus::Migrated);
    assert_eq!(header.slots[2].username_hash_len, 32);
    engine.close();

    engine
        .open_v2(&path, "bob", &pw("bob-pass-12345"), None)
        .unwrap();
    engine.close();
}
