//! Tessera - lock-gated metadata for a shared-disk cluster filesystem.
//!
//! Every read or change of a disk-resident object goes through a cluster
//! lock, and every change runs inside a sized journal transaction. On top of
//! that Tessera provides stable file handles for NFS-style export and an
//! administrative request protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Tessera                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Surfaces: File Handles (export) | Admin Requests (admin)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Objects: Inodes | Attributes (eattr) | ACLs | Hidden Files │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coherence: Cluster Locks | Transactions | Quota Holds      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage: Region Bitmaps | Journal | Block Device           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera::config::TesseraConfig;
//! use tessera::types::{Credentials, FileType};
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let mount = tessera::mount(TesseraConfig::development()).await?;
//!     let root = mount.root()?;
//!     let file = mount
//!         .create(&Credentials::root(), &root, "hello", FileType::Regular, 0o644)
//!         .await?;
//!
//!     let mut handle = [0u32; 6];
//!     let used = mount.encode_handle(&file, Some(&*root), &mut handle, true);
//!     let again = mount.decode_and_resolve(&handle[..used as usize], used).await?;
//!     assert_eq!(again.identity(), file.identity());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod counters;
pub mod disk;
pub mod journal;
pub mod lock;
pub mod region;

pub mod acl;
pub mod dir;
pub mod eattr;
pub mod hidden;
pub mod inode;
pub mod quota;

pub mod admin;
pub mod export;
pub mod mount;

pub mod observability;

// Re-exports
pub use error::{Result, TesseraError};
pub use mount::Mount;
pub use types::*;

use config::TesseraConfig;
use std::sync::Arc;
use tracing::info;

/// Initialise logging and metrics, then format and mount a filesystem.
pub async fn mount(config: TesseraConfig) -> Result<Arc<Mount>> {
    observability::init(&config.observability)?;
    if config.observability.metrics_enabled {
        observability::register_metrics();
    }
    info!(node = %config.node.name, "Starting Tessera mount");
    Mount::format(config).await
}
