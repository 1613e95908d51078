//! Integration tests for the administrative request protocol.

#[allow(dead_code)]
mod common;

use common::*;
use tessera::admin::AdminRequest;
use tessera::disk::{Dinode, DINODE_SIZE, SUPERBLOCK_SIZE};
use tessera::quota::{QuotaRecord, QUOTA_RECORD_SIZE};
use tessera::types::{dinode_flags, Capabilities, Credentials, FileType};
use tessera::TesseraError;

fn flag(op: &str, name: &str) -> AdminRequest {
    AdminRequest::new("set_file_flag").with_args(&[op, name])
}

#[tokio::test]
async fn test_immutable_needs_owner_and_capability() {
    let env = TestEnv::new().await;
    let alice = user(1000);
    let dir = env.dir_as(&alice, "home").await;
    let file = env
        .mount
        .create(&alice, &dir, "f", FileType::Regular, 0o644)
        .await
        .unwrap();

    let commits = env.mount.journal().stats().commits;
    let before = file.dinode();

    // Neither owner nor privileged.
    let err = env
        .mount
        .admin(&user(2000), &file, &flag("set", "immutable"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    // Owner without the capability.
    let err = env
        .mount
        .admin(&alice, &file, &flag("set", "appendonly"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    assert_eq!(env.mount.journal().stats().commits, commits);
    assert_eq!(file.dinode(), before);
    assert_eq!(env.mount.locks().stats().holders, 0);

    let privileged = alice.with_caps(Capabilities {
        linux_immutable: true,
        ..Capabilities::default()
    });
    env.mount
        .admin(&privileged, &file, &flag("set", "immutable"))
        .await
        .unwrap();
    assert!(file.dinode().has_flag(dinode_flags::IMMUTABLE));
    env.mount
        .admin(&privileged, &file, &flag("clear", "immutable"))
        .await
        .unwrap();
    assert!(!file.dinode().has_flag(dinode_flags::IMMUTABLE));
}

#[tokio::test]
async fn test_flag_applicability() {
    let env = TestEnv::new().await;
    let root = Credentials::root();
    let dir = env.dir_as(&root, "d").await;
    let file = env.file("f").await;

    assert!(matches!(
        env.mount.admin(&root, &dir, &flag("set", "directio")).await,
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(matches!(
        env.mount.admin(&root, &file, &flag("set", "inherit_jdata")).await,
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(matches!(
        env.mount.admin(&root, &file, &flag("flip", "jdata")).await,
        Err(TesseraError::InvalidArgument(_))
    ));

    env.mount.admin(&root, &file, &flag("set", "jdata")).await.unwrap();
    assert!(file.dinode().has_flag(dinode_flags::JDATA));

    env.mount
        .admin(&root, &dir, &flag("set", "inherit-jdata"))
        .await
        .unwrap();
    let child = env
        .mount
        .create(&root, &dir, "child", FileType::Regular, 0o644)
        .await
        .unwrap();
    assert!(child.dinode().has_flag(dinode_flags::JDATA));
}

#[tokio::test]
async fn test_reports() {
    let env = TestEnv::new().await;
    let root = env.root();
    let creds = Credentials::root();

    let resp = env
        .mount
        .admin(&creds, &root, &AdminRequest::new("get_args").with_max_out(4096))
        .await
        .unwrap();
    let text = resp.text().unwrap();
    assert!(text.starts_with("version 0\n"));
    assert!(text.contains("posix_acls 1\n"));
    assert_eq!(resp.bytes_written as usize, text.len());

    let resp = env
        .mount
        .admin(&creds, &root, &AdminRequest::new("get_stat").with_max_out(4096))
        .await
        .unwrap();
    assert!(resp.text().unwrap().contains("bsize 512\n"));

    // Too small for the report.
    assert!(matches!(
        env.mount
            .admin(&creds, &root, &AdminRequest::new("get_counters").with_max_out(16))
            .await,
        Err(TesseraError::OutOfSpace(_))
    ));
    assert!(matches!(
        env.mount
            .admin(&creds, &root, &AdminRequest::new("get_tune").with_args(&["x"]))
            .await,
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(matches!(
        env.mount.admin(&creds, &root, &AdminRequest::new("get_glocks")).await,
        Err(TesseraError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_tunables_and_quota() {
    let env = TestEnv::new().await;
    let root = env.root();
    let admin = Credentials::root();
    let alice = user(10);

    let set = |name: &str, value: &str| AdminRequest::new("set_tune").with_args(&[name, value]);
    assert!(matches!(
        env.mount.admin(&alice, &root, &set("demote_secs", "30")).await,
        Err(TesseraError::PermissionDenied(_))
    ));
    env.mount.admin(&admin, &root, &set("demote_secs", "30")).await.unwrap();
    assert_eq!(env.mount.tunables().demote_secs, 30);

    env.dir_as(&alice, "owned").await;
    assert!(!env.mount.quota().pending().is_empty());

    // Turning accounting off flushes pending changes.
    env.mount.admin(&admin, &root, &set("quota_account", "0")).await.unwrap();
    assert!(env.mount.quota().pending().is_empty());

    let read = AdminRequest::new("do_quota_read")
        .with_args(&["u:10"])
        .with_max_out(QUOTA_RECORD_SIZE as u32);
    let resp = env.mount.admin(&admin, &root, &read).await.unwrap();
    let record = QuotaRecord::decode(&resp.payload).unwrap();
    assert!(record.value >= 1);

    assert!(matches!(
        env.mount
            .admin(&admin, &root, &AdminRequest::new("do_quota_read").with_args(&["x:1"]).with_max_out(88))
            .await,
        Err(TesseraError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_binary_records() {
    let env = TestEnv::new().await;
    let root = env.root();
    let creds = Credentials::root();
    let file = env.file("f").await;

    let resp = env
        .mount
        .admin(
            &creds,
            &root,
            &AdminRequest::new("get_super").with_max_out(SUPERBLOCK_SIZE as u32),
        )
        .await
        .unwrap();
    assert_eq!(resp.payload.len(), SUPERBLOCK_SIZE);

    let resp = env
        .mount
        .admin(
            &user(5),
            &file,
            &AdminRequest::new("get_file_stat").with_max_out(DINODE_SIZE as u32),
        )
        .await
        .unwrap();
    assert_eq!(Dinode::decode(&resp.payload).unwrap(), file.dinode());

    assert!(matches!(
        env.mount
            .admin(&user(5), &file, &AdminRequest::new("get_file_meta").with_max_out(4096))
            .await,
        Err(TesseraError::PermissionDenied(_))
    ));
    let resp = env
        .mount
        .admin(&creds, &file, &AdminRequest::new("get_file_meta").with_max_out(4096))
        .await
        .unwrap();
    assert_eq!(resp.payload.len(), env.mount.block_size());
}

#[tokio::test]
async fn test_hidden_write_requires_journaled_data() {
    let env = TestEnv::new().await;
    let root = env.root();
    let admin = Credentials::root();

    let stat = AdminRequest::new("get_hfile_stat")
        .with_args(&["license"])
        .with_max_out(DINODE_SIZE as u32);
    let resp = env.mount.admin(&admin, &root, &stat).await.unwrap();
    let license = Dinode::decode(&resp.payload).unwrap();
    assert!(license.has_flag(dinode_flags::JDATA));
    assert_eq!(license.size, 0);

    let write = AdminRequest::new("do_hfile_write")
        .with_args(&["license"])
        .with_payload(b"licensed".to_vec());
    let resp = env.mount.admin(&admin, &root, &write).await.unwrap();
    assert_eq!(resp.bytes_written, 8);
    let read = AdminRequest::new("do_hfile_read")
        .with_args(&["license"])
        .with_max_out(64);
    assert_eq!(
        env.mount.admin(&admin, &root, &read).await.unwrap().payload,
        b"licensed"
    );
    env.mount
        .admin(&admin, &root, &AdminRequest::new("do_hfile_trunc").with_args(&["license"]))
        .await
        .unwrap();

    // Clear the journaled-data flag on the now empty object.
    let inode = env.mount.inodes().get(license.formal_id).unwrap();
    env.mount.admin(&admin, &inode, &flag("clear", "jdata")).await.unwrap();
    let before = inode.dinode();
    let commits = env.mount.journal().stats().commits;

    assert!(matches!(
        env.mount.admin(&admin, &root, &write).await,
        Err(TesseraError::InternalInconsistency(_))
    ));
    assert_eq!(inode.dinode(), before);
    assert_eq!(env.mount.journal().stats().commits, commits);
    assert_eq!(env.mount.locks().stats().holders, 0);

    assert!(matches!(
        env.mount.admin(&user(1), &root, &stat).await,
        Err(TesseraError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let mut config = small_config();
    config.mount.locktable = "alpha:fs0".to_string();
    let env = TestEnv::with_config(config.clone()).await;

    let path = env.path("tessera.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let loaded = tessera::config::TesseraConfig::from_file(&path).unwrap();
    assert_eq!(loaded.mount.locktable, "alpha:fs0");
    assert_eq!(loaded.layout.block_size, 512);

    let resp = env
        .mount
        .admin(
            &Credentials::root(),
            &env.root(),
            &AdminRequest::new("get_args").with_max_out(4096),
        )
        .await
        .unwrap();
    assert!(resp.text().unwrap().contains("locktable alpha:fs0\n"));
}
