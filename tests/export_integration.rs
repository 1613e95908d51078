//! Integration tests for file handle export and resolution.

#[allow(dead_code)]
mod common;

use common::*;
use tessera::export::{decode_fh, encode_fh, ExportCookie, FileHandle, TokenShape};
use tessera::hidden::HiddenFile;
use tessera::types::{Credentials, FileType};
use tessera::TesseraError;

#[test]
fn test_codec_round_trip_sweep() {
    let mut gen = TestDataGenerator::new(7);
    for _ in 0..500 {
        let this = gen.identity();
        let parent = gen.identity();

        for (len, connectable, shape) in [
            (3, true, TokenShape::Minimal),
            (6, false, TokenShape::Minimal),
            (5, true, TokenShape::WithParent),
            (6, true, TokenShape::WithParentGen),
        ] {
            let mut buf = vec![0u32; len];
            let used = encode_fh(this, Some(parent), &mut buf, connectable);
            let decoded = decode_fh(&buf[..used as usize], used).unwrap();
            assert_eq!(decoded.shape, shape);
            assert_eq!(decoded.this, ExportCookie::exact(this));

            match shape {
                TokenShape::Minimal => assert!(decoded.parent.is_none()),
                TokenShape::WithParent => {
                    assert_eq!(decoded.parent, Some(ExportCookie::any_generation(parent.formal_id)));
                }
                TokenShape::WithParentGen => {
                    assert_eq!(decoded.parent, Some(ExportCookie::exact(parent)));
                }
            }
        }
    }
}

#[test]
fn test_bad_lengths_rejected() {
    let mut gen = TestDataGenerator::new(11);
    for _ in 0..200 {
        let words = gen.bad_token();
        assert!(matches!(
            decode_fh(&words, words.len() as u8),
            Err(TesseraError::InvalidArgument(_))
        ));
    }

    // A type that disagrees with the length is rejected even for valid lengths.
    assert!(decode_fh(&[1, 2, 3, 4, 5], 6).is_err());

    let bytes = gen.random_bytes(16);
    assert!(matches!(
        FileHandle::from_bytes(&bytes),
        Err(TesseraError::InvalidArgument(_))
    ));
    assert!(FileHandle::from_bytes(&bytes[..13]).is_err());
}

#[test]
fn test_wire_form_is_big_endian() {
    let mut gen = TestDataGenerator::new(3);
    let this = gen.identity();
    let parent = gen.identity();
    let handle = FileHandle::new(this, Some(parent), true, 6).unwrap();

    let bytes = handle.encode();
    assert_eq!(bytes.len(), 24);
    assert_eq!(&bytes[..4], &this.formal_hi().to_be_bytes());
    assert_eq!(&bytes[8..12], &this.generation.to_be_bytes());

    let back = FileHandle::from_bytes(&bytes).unwrap();
    assert_eq!(back, handle);
    assert_eq!(back.decode().unwrap().parent, Some(ExportCookie::exact(parent)));
}

#[tokio::test]
async fn test_handle_resolves_after_cache_eviction() {
    let env = TestEnv::new().await;
    let root = env.root();
    let file = env.file("exported").await;

    let handle = FileHandle::new(file.identity(), Some(root.identity()), true, 6).unwrap();
    let wire = handle.encode();
    let identity = file.identity();
    drop(file);
    env.mount.inodes().remove(identity.formal_id);

    let parsed = FileHandle::from_bytes(&wire).unwrap();
    let found = env
        .mount
        .decode_and_resolve(parsed.words(), parsed.fh_type())
        .await
        .unwrap();
    assert_eq!(found.identity(), identity);
    assert_eq!(env.mount.counters().fh2dentry_misses.read(), 1);

    // A second resolve is served from the cache.
    env.mount
        .decode_and_resolve(parsed.words(), parsed.fh_type())
        .await
        .unwrap();
    assert_eq!(env.mount.counters().fh2dentry_misses.read(), 1);
    assert_eq!(env.mount.locks().stats().holders, 0);
}

#[tokio::test]
async fn test_removed_object_is_stale() {
    let env = TestEnv::new().await;
    let root = env.root();
    let file = env.file("doomed").await;
    let cookie = ExportCookie::exact(file.identity());
    drop(file);

    env.mount
        .remove(&Credentials::root(), &root, "doomed")
        .await
        .unwrap();

    for c in [cookie, ExportCookie::any_generation(cookie.formal_id)] {
        assert!(matches!(
            env.mount.get_object(c).await,
            Err(TesseraError::StaleHandle(_))
        ));
    }
    assert_eq!(env.mount.locks().stats().holders, 0);
}

#[tokio::test]
async fn test_reused_address_fails_generation_check() {
    let env = TestEnv::new().await;
    let root = env.root();
    let creds = Credentials::root();
    let first = env.file("a").await;
    let old = first.identity();
    drop(first);
    env.mount.remove(&creds, &root, "a").await.unwrap();

    let second = env
        .mount
        .create(&creds, &root, "b", FileType::Regular, 0o644)
        .await
        .unwrap();
    assert_eq!(second.formal_id(), old.formal_id);
    assert!(second.identity().generation > old.generation);

    let mut buf = [0u32; 6];
    let used = encode_fh(old, Some(root.identity()), &mut buf, true);
    assert!(matches!(
        env.mount.decode_and_resolve(&buf[..used as usize], used).await,
        Err(TesseraError::StaleHandle(_))
    ));

    // A handle without a parent still carries the object's generation.
    let used = encode_fh(old, None, &mut buf[..3], false);
    assert!(env.mount.decode_and_resolve(&buf[..3], used).await.is_err());

    let fresh = ExportCookie::exact(second.identity());
    assert!(env.mount.get_object(fresh).await.is_ok());
}

#[tokio::test]
async fn test_generation_survives_reuse_as_other_metadata() {
    let env = TestEnv::new().await;
    let root = env.root();
    let creds = Credentials::root();
    let first = env.file("a").await;
    let old = first.identity();
    drop(first);
    env.mount.remove(&creds, &root, "a").await.unwrap();

    // The freed dinode block becomes a journaled-data block, then is freed again.
    let data = vec![0x5a; 3 * env.mount.block_size()];
    env.mount
        .hfile_write(&creds, HiddenFile::License, 0, &data)
        .await
        .unwrap();
    env.mount
        .hfile_truncate(&creds, HiddenFile::License, 0)
        .await
        .unwrap();

    let mut reused = None;
    for i in 0..8 {
        let inode = env
            .mount
            .create(&creds, &root, &format!("b{}", i), FileType::Regular, 0o644)
            .await
            .unwrap();
        if inode.formal_id() == old.formal_id {
            reused = Some(inode);
            break;
        }
    }
    let reused = reused.expect("dinode block was not reused");
    assert!(reused.identity().generation > old.generation);
    assert!(matches!(
        env.mount.get_object(ExportCookie::exact(old)).await,
        Err(TesseraError::StaleHandle(_))
    ));
    assert_eq!(
        env.mount
            .get_object(ExportCookie::exact(reused.identity()))
            .await
            .unwrap()
            .identity(),
        reused.identity()
    );
}

#[tokio::test]
async fn test_hidden_objects_never_resolve() {
    let env = TestEnv::new().await;
    let sb = env.mount.superblock().clone();
    for h in HiddenFile::ALL {
        let identity = h.identity(&sb);
        let mut buf = [0u32; 3];
        let used = encode_fh(identity, None, &mut buf, false);
        assert!(matches!(
            env.mount.decode_and_resolve(&buf, used).await,
            Err(TesseraError::InvalidArgument(_))
        ));
    }
}

#[tokio::test]
async fn test_reverse_lookup() {
    let env = TestEnv::new().await;
    let creds = Credentials::root();
    let dir = env.dir_as(&creds, "exports").await;
    let child = env
        .mount
        .create(&creds, &dir, "leaf", FileType::Regular, 0o600)
        .await
        .unwrap();

    assert_eq!(env.mount.get_name(&dir, &child).await.unwrap(), "leaf");
    let parent = env.mount.get_parent(&dir).await.unwrap();
    assert_eq!(parent.identity(), env.root().identity());
    assert!(matches!(
        env.mount.get_parent(&child).await,
        Err(TesseraError::NotFound(_))
    ));
}
