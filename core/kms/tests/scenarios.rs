//! End-to-end scenarios for the token KMS.
//!
//! An administrator session and user devices share one update directory; each
//! party has its own soft token and encrypted store.

use std::fs;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use tokenkms_codec::{AlwaysValid, FileMedium, NewFile, OpenMode, SectorCodec, SectorLayout};
use tokenkms_common::{Error, UserId};
use tokenkms_crypto::{Algorithm, CryptoToken, LoginRole, SoftToken};
use tokenkms_kms::update::{numbered, write_update_file};
use tokenkms_kms::{
    CapturedStatement, GroupPolicy, KeyStatus, KmsConfig, RecordBody, Selection, Session,
    UpdateFileKind, DEFAULT_TRANSFER_KEY_ID,
};

const DB_KEY: u32 = 0xF000_0001;
const TRANSFER_MATERIAL: [u8; 32] = [0x5A; 32];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn soft_token(serial: &str, role: LoginRole) -> Arc<SoftToken> {
    let token = SoftToken::new(serial, "1111", "2222");
    let pin = match role {
        LoginRole::User => "1111",
        LoginRole::Admin => "2222",
    };
    token.login(pin, role).expect("login");
    token.generate_key(DB_KEY, 32).expect("database key");
    token
        .insert_key(DEFAULT_TRANSFER_KEY_ID, &TRANSFER_MATERIAL)
        .expect("transfer key");
    Arc::new(token)
}

struct World {
    temp: TempDir,
    admin_token: Arc<SoftToken>,
    admin: Session,
}

impl World {
    fn new() -> Self {
        init_tracing();
        let temp = TempDir::new().expect("temp dir");
        fs::create_dir(temp.path().join("updates")).expect("update dir");
        fs::create_dir(temp.path().join("admin")).expect("admin dir");
        let admin_token = soft_token("SN-ADMIN", LoginRole::Admin);
        let config = KmsConfig::admin(temp.path().join("admin/kms.db"), DB_KEY, temp.path().join("updates"));
        let admin = Session::open(config, admin_token.clone()).expect("admin session");
        Self {
            temp,
            admin_token,
            admin,
        }
    }

    fn updates(&self) -> PathBuf {
        self.temp.path().join("updates")
    }

    /// Register a user on the administrator side and bring up its device.
    fn enroll(&self, name: &str) -> (UserId, Session) {
        let serial = format!("SN-{}", name.to_uppercase());
        let outcome = self
            .admin
            .admin()
            .unwrap()
            .add_user(name, &serial, "1111", "2222")
            .expect("add user");
        assert!(outcome.report.is_complete());
        let (user, provisioning) = outcome.value;

        let dir = self.temp.path().join(name);
        fs::create_dir(&dir).expect("device dir");
        let token = soft_token(&serial, LoginRole::User);
        let config = KmsConfig::user(dir.join("kms.db"), DB_KEY, self.updates());
        let device = Session::open(config, token).expect("device session");
        device.provision_device(&provisioning).expect("provision");

        let report = device.process_updates().expect("init replay");
        assert_eq!(report.files, vec![UpdateFileKind::Init]);
        (user.id, device)
    }
}

fn group_policy(cryptoperiod: i64) -> GroupPolicy {
    GroupPolicy {
        cryptoperiod,
        ..GroupPolicy::default()
    }
}

#[test]
fn test_sector_file_survives_reopen() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let token = soft_token("SN-CODEC", LoginRole::User);
    token.generate_key(42, 32).unwrap();
    let codec = SectorCodec::new(token.as_ref(), SectorLayout::STANDARD);
    let path = temp.path().join("data.bin");
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let medium = FileMedium::create(&path).unwrap();
    let mut file = codec
        .create(
            medium,
            AlwaysValid,
            NewFile {
                key_id: 42,
                algorithm: Algorithm::Aes256,
                name: "data.bin",
            },
        )
        .unwrap();
    assert_eq!(file.write(&data).unwrap(), data.len());
    file.close().unwrap();

    let mut file = codec.open_path(&path, AlwaysValid, OpenMode::Read, None).unwrap();
    assert_eq!(file.len(), 10_000);
    assert_eq!(file.name(), "data.bin");
    assert_eq!(file.read_all().unwrap(), data);

    file.seek(SeekFrom::Start(4_999)).unwrap();
    let mut middle = [0u8; 700];
    assert_eq!(file.read(&mut middle).unwrap(), 700);
    assert_eq!(&middle[..], &data[4_999..5_699]);
    file.close().unwrap();
}

#[test]
fn test_cryptoperiod_from_group_policy() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let group = admin.add_group("short", group_policy(3600)).unwrap().value;
    let key = admin.add_key(group.id, "hourly", 0).unwrap().value;

    let active = admin.activate_key(key.id).unwrap().value;
    assert_eq!(active.status, KeyStatus::Active);
    assert_eq!(active.expires_at, active.activated_at + 3600);
    assert!(matches!(admin.activate_key(key.id), Err(Error::State(_))));
}

#[test]
fn test_smallest_shared_group_wins() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, _) = world.enroll("alice");
    let (bob, _) = world.enroll("bob");
    let (carol, _) = world.enroll("carol");

    let large = admin.add_group("all", GroupPolicy::default()).unwrap().value;
    let small = admin.add_group("pair", GroupPolicy::default()).unwrap().value;
    for user in [alice, bob, carol] {
        admin.add_member(user, large.id).unwrap();
    }
    for user in [alice, bob] {
        admin.add_member(user, small.id).unwrap();
    }
    let wide = admin.add_key(large.id, "wide", 0).unwrap().value;
    let narrow = admin.add_key(small.id, "narrow", 0).unwrap().value;
    admin.activate_key(wide.id).unwrap();
    admin.activate_key(narrow.id).unwrap();

    let chosen = world.admin.find_key_v1(alice, bob).unwrap().unwrap();
    assert_eq!(chosen.id, narrow.id);
    let chosen = world.admin.find_key_v1(alice, carol).unwrap().unwrap();
    assert_eq!(chosen.id, wide.id);

    match world.admin.find_key_v3(alice, &[bob, carol]).unwrap() {
        Selection::Found(key) => assert_eq!(key.id, wide.id),
        other => panic!("unexpected selection {:?}", other),
    }
}

#[test]
fn test_device_follows_administrator() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, device) = world.enroll("alice");

    let group = admin.add_group("team", GroupPolicy::default()).unwrap().value;
    admin.add_member(alice, group.id).unwrap();
    let key = admin.add_key(group.id, "team key", 0).unwrap().value;
    admin.activate_key(key.id).unwrap();

    let report = device.process_updates().unwrap();
    assert_eq!(report.files, vec![UpdateFileKind::Recovery, UpdateFileKind::Normal]);
    assert_eq!(
        report.counter,
        world.admin.store().get_user(alice).unwrap().update_counter
    );
    assert!(device.token().has_key(key.id.value()).unwrap());
    assert_eq!(device.store().get_key(key.id).unwrap().status, KeyStatus::Active);

    let shared = world.temp.path().join("report.txt");
    world.admin.write_file(&shared, key.id, b"quarterly numbers").unwrap();
    assert_eq!(device.read_file(&shared).unwrap(), b"quarterly numbers");

    let found = device.find_key_v2(alice, group.id).unwrap().unwrap();
    assert_eq!(found.id, key.id);

    admin.change_status(key.id, KeyStatus::Compromised).unwrap();
    device.process_updates().unwrap();
    assert!(device.read_file(&shared).is_err());
    assert!(device.find_key_v2(alice, group.id).unwrap().is_none());
}

#[test]
fn test_gap_in_updates_needs_recovery() {
    let world = World::new();
    let (alice, device) = world.enroll("alice");
    let before = device.store().device_counter().unwrap();
    let row = world.admin.store().get_user(alice).unwrap();
    assert_eq!(before, row.update_counter);

    let rename = CapturedStatement::new(
        "UPDATE users SET name = ?1 WHERE id = ?2",
        tokenkms_kms::sql_params!["mallory", alice.value()],
    );
    let records = numbered(before + 1, vec![RecordBody::Statement(rename)]);
    write_update_file(
        world.admin_token.as_ref(),
        &world.updates(),
        &row,
        UpdateFileKind::Normal,
        &records,
    )
    .unwrap();

    let err = device.process_updates().unwrap_err();
    assert!(matches!(err, Error::OutOfSequence { stored, found } if stored == before && found == before + 2));
    assert!(err.needs_recovery());
    assert_eq!(device.store().device_counter().unwrap(), before);
    assert_eq!(device.store().get_user(alice).unwrap().name, "alice");
}

#[test]
fn test_deleted_group_leaves_zombie_and_recovery() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, _) = world.enroll("alice");
    let (bob, _) = world.enroll("bob");
    let group = admin.add_group("doomed", GroupPolicy::default()).unwrap().value;
    admin.add_member(alice, group.id).unwrap();
    admin.add_member(bob, group.id).unwrap();
    let key = admin.add_key(group.id, "k", 0).unwrap().value;
    admin.activate_key(key.id).unwrap();

    fs::remove_dir_all(world.updates()).unwrap();
    let outcome = admin.delete_group(group.id).unwrap();
    assert_eq!(outcome.report.failed, vec![alice, bob]);

    let zombie = world.admin.store().get_key(key.id).unwrap();
    assert!(zombie.is_zombie());
    assert_eq!(zombie.status, KeyStatus::Deactivated);
    assert!(zombie.deactivated_at > 0);

    let pending: Vec<UserId> = world
        .admin
        .store()
        .recovery_entries()
        .unwrap()
        .into_iter()
        .map(|e| e.user)
        .collect();
    assert_eq!(pending, vec![alice, bob]);
    assert!(matches!(
        admin.add_group("next", GroupPolicy::default()),
        Err(Error::Blocked(_))
    ));
}

#[test]
fn test_recovery_resynchronizes_device() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, device) = world.enroll("alice");
    let group = admin.add_group("team", GroupPolicy::default()).unwrap().value;

    fs::remove_dir_all(world.updates()).unwrap();
    let outcome = admin.add_member(alice, group.id).unwrap();
    assert_eq!(outcome.report.failed, vec![alice]);

    fs::create_dir(world.updates()).unwrap();
    let report = admin.process_recovery().unwrap();
    assert_eq!(report.delivered, vec![alice]);
    assert!(world.admin.store().recovery_entries().unwrap().is_empty());

    let replayed = device.process_updates().unwrap();
    assert_eq!(replayed.files, vec![UpdateFileKind::Recovery]);
    assert_eq!(device.store().group_members(group.id).unwrap(), vec![alice]);
    assert!(!update_exists(&world.updates(), "SN-ALICE"));
}

fn update_exists(dir: &Path, serial: &str) -> bool {
    UpdateFileKind::PRECEDENCE
        .iter()
        .any(|kind| tokenkms_kms::update::update_path(dir, serial, *kind).exists())
}

#[test]
fn test_refused_key_never_clobbers_file() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, device) = world.enroll("alice");
    let group = admin.add_group("team", GroupPolicy::default()).unwrap().value;
    admin.add_member(alice, group.id).unwrap();
    let key = admin.add_key(group.id, "team key", 0).unwrap().value;
    admin.activate_key(key.id).unwrap();

    let path = world.temp.path().join("plan.txt");
    world.admin.write_file(&path, key.id, b"precious data").unwrap();
    admin.change_status(key.id, KeyStatus::Suspended).unwrap();

    let err = world.admin.write_file(&path, key.id, b"new").unwrap_err();
    assert!(matches!(err, Error::State(_)));
    assert_eq!(world.admin.read_file(&path).unwrap(), b"precious data");

    device.process_updates().unwrap();
    assert!(matches!(device.write_file(&path, key.id, b"new"), Err(Error::State(_))));
    assert_eq!(device.read_file(&path).unwrap(), b"precious data");
}

#[test]
fn test_pending_recovery_blocks_only_other_users() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, device) = world.enroll("alice");
    let (bob, _) = world.enroll("bob");
    let group = admin.add_group("solo", GroupPolicy::default()).unwrap().value;
    admin.add_member(alice, group.id).unwrap();

    fs::remove_dir_all(world.updates()).unwrap();
    let outcome = admin.rename_group(group.id, "renamed").unwrap();
    assert_eq!(outcome.report.failed, vec![alice]);
    fs::create_dir(world.updates()).unwrap();

    let err = admin.rename_user(bob, "robert").unwrap_err();
    assert!(matches!(err, Error::Blocked(_)));

    let outcome = admin.rename_user(alice, "alicia").unwrap();
    assert_eq!(outcome.report.delivered, vec![alice]);
    assert!(world.admin.store().recovery_entries().unwrap().is_empty());

    let replayed = device.process_updates().unwrap();
    assert_eq!(replayed.files, vec![UpdateFileKind::Recovery]);
    assert_eq!(device.store().get_user(alice).unwrap().name, "alicia");
    assert_eq!(device.store().get_group(group.id).unwrap().name, "renamed");

    admin.rename_user(bob, "robert").unwrap();
}

#[test]
fn test_permanently_unreachable_user_is_removable() {
    let world = World::new();
    let admin = world.admin.admin().unwrap();
    let (alice, _) = world.enroll("alice");
    let group = admin.add_group("team", GroupPolicy::default()).unwrap().value;

    for kind in [UpdateFileKind::Normal, UpdateFileKind::Recovery] {
        let slot = tokenkms_kms::update::update_path(&world.updates(), "SN-ALICE", kind);
        fs::create_dir(&slot).unwrap();
        fs::create_dir(slot.with_extension(format!("{}.tmp", kind))).unwrap();
    }
    let outcome = admin.add_member(alice, group.id).unwrap();
    assert_eq!(outcome.report.failed, vec![alice]);
    assert_eq!(admin.process_recovery().unwrap().failed, vec![alice]);
    assert!(matches!(
        admin.add_group("next", GroupPolicy::default()),
        Err(Error::Blocked(_))
    ));

    admin.delete_user(alice).unwrap();
    assert!(world.admin.store().find_user(alice).unwrap().is_none());
    assert!(world.admin.store().recovery_entries().unwrap().is_empty());
    admin.add_group("next", GroupPolicy::default()).unwrap();
}
