//! Common test utilities for integration tests.

pub mod fixtures;

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tessera::config::TesseraConfig;
use tessera::inode::Inode;
use tessera::types::{Credentials, FileType};
use tessera::Mount;

pub use fixtures::*;

/// A small filesystem plus a scratch directory for config files.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub mount: Arc<Mount>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(small_config()).await
    }

    pub async fn with_config(config: TesseraConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mount = Mount::format(config).await.expect("Failed to format");
        Self { temp_dir, mount }
    }

    /// A path inside the scratch directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub fn root(&self) -> Arc<Inode> {
        self.mount.root().expect("root")
    }

    /// Create a regular file in the root directory as root.
    pub async fn file(&self, name: &str) -> Arc<Inode> {
        let root = self.root();
        self.mount
            .create(&Credentials::root(), &root, name, FileType::Regular, 0o644)
            .await
            .expect("create file")
    }

    /// Create a directory owned by `creds` in the root directory.
    pub async fn dir_as(&self, creds: &Credentials, name: &str) -> Arc<Inode> {
        let root = self.root();
        self.mount
            .create(creds, &root, name, FileType::Directory, 0o777)
            .await
            .expect("create dir")
    }
}

/// 512-byte blocks keep journal and EA capacity limits easy to reach.
pub fn small_config() -> TesseraConfig {
    let mut config = TesseraConfig::development();
    config.layout.block_size = 512;
    config.layout.region_count = 2;
    config.layout.region_blocks = 128;
    config.layout.journal_blocks = 256;
    config.layout.max_transaction_blocks = 32;
    config
}

/// A non-privileged caller.
pub fn user(uid: u32) -> Credentials {
    Credentials::user(uid, uid)
}
