//! Privileged-object I/O.
//!
//! Four objects are reachable only through this path, selected by name and
//! never through the directory layer: the journal index, the resource
//! index, the quota object and the license object. All four are
//! journaled-data files. Every public operation requires the `sys_admin`
//! capability.
//!
//! A write follows a fixed order: Exclusive lock (priority, sync), the
//! journaled-data check, then either a quota hold, an in-place reservation
//! and a transaction covering bitmap, pointer and data blocks plus one
//! quota-change slot, or, when no block needs allocating, a transaction for
//! the data blocks and the dinode alone. The guards unwind in reverse.

use crate::disk::{Decoder, Dinode, Encoder, Superblock};
use crate::error::{Result, TesseraError};
use crate::inode;
use crate::journal::Transaction;
use crate::lock::{LockFlags, LockHolder, LockMode, LockRequest, LockScope};
use crate::mount::Mount;
use crate::quota::QuotaId;
use crate::region::AllocKind;
use crate::types::{dinode_flags, BlockAddr, Credentials, ObjectIdentity};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, warn};

/// Bytes per journal index entry.
pub const JINDEX_ENTRY_SIZE: usize = 32;

/// The hidden objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HiddenFile {
    Jindex,
    Rindex,
    Quota,
    License,
}

impl HiddenFile {
    pub const ALL: [HiddenFile; 4] = [
        HiddenFile::Jindex,
        HiddenFile::Rindex,
        HiddenFile::Quota,
        HiddenFile::License,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HiddenFile::Jindex => "jindex",
            HiddenFile::Rindex => "rindex",
            HiddenFile::Quota => "quota",
            HiddenFile::License => "license",
        }
    }

    pub fn identity(&self, sb: &Superblock) -> ObjectIdentity {
        match self {
            HiddenFile::Jindex => sb.jindex,
            HiddenFile::Rindex => sb.rindex,
            HiddenFile::Quota => sb.quota,
            HiddenFile::License => sb.license,
        }
    }
}

impl fmt::Display for HiddenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HiddenFile {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        HiddenFile::ALL
            .into_iter()
            .find(|h| h.name() == s)
            .ok_or_else(|| TesseraError::InvalidArgument(format!("no hidden file {:?}", s)))
    }
}

/// One journal of the journal index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JindexEntry {
    pub addr: BlockAddr,
    pub blocks: u32,
}

impl JindexEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(JINDEX_ENTRY_SIZE);
        enc.put_u64(self.addr)
            .put_u32(self.blocks)
            .pad_to(JINDEX_ENTRY_SIZE);
        enc.finish()
    }

    pub fn decode_all(bytes: &[u8]) -> Result<Vec<JindexEntry>> {
        bytes
            .chunks_exact(JINDEX_ENTRY_SIZE)
            .map(|chunk| {
                let mut dec = Decoder::new(chunk);
                Ok(JindexEntry {
                    addr: dec.get_u64()?,
                    blocks: dec.get_u32()?,
                })
            })
            .collect()
    }
}

fn require_admin(creds: &Credentials, what: &str, which: HiddenFile) -> Result<()> {
    if !creds.caps.sys_admin {
        warn!(uid = creds.uid, hidden = %which, what, "privileged request refused");
        return Err(TesseraError::PermissionDenied(format!(
            "{} of {} requires sys_admin",
            what, which
        )));
    }
    Ok(())
}

impl Mount {
    /// Dinode of a hidden object.
    pub async fn hfile_stat(&self, creds: &Credentials, which: HiddenFile) -> Result<Dinode> {
        require_admin(creds, "stat", which)?;
        let inode = self.load_inode(which.identity(self.superblock()).formal_id)?;
        let _lock = self
            .locks
            .acquire(LockRequest::new(
                LockScope::Inode(inode.formal_id()),
                LockMode::Shared,
                self.holder(),
            ))
            .await?;
        Ok(inode.dinode())
    }

    /// Read up to `len` bytes of a hidden object at `offset`.
    pub async fn hfile_read(
        &self,
        creds: &Credentials,
        which: HiddenFile,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        require_admin(creds, "read", which)?;
        self.hidden_read(self.holder(), which, offset, len).await
    }

    /// Write `data` into a hidden object at `offset`.
    pub async fn hfile_write(
        &self,
        creds: &Credentials,
        which: HiddenFile,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        require_admin(creds, "write", which)?;
        self.hidden_write(self.holder(), which, offset, data).await
    }

    /// Truncate a hidden object to `size` bytes.
    pub async fn hfile_truncate(&self, creds: &Credentials, which: HiddenFile, size: u64) -> Result<()> {
        require_admin(creds, "truncate", which)?;
        self.hidden_truncate(self.holder(), which, size).await
    }

    pub(crate) async fn hidden_read(
        &self,
        holder: LockHolder,
        which: HiddenFile,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let inode = self.load_inode(which.identity(self.superblock()).formal_id)?;
        let _lock = self
            .locks
            .acquire(LockRequest::new(
                LockScope::Inode(inode.formal_id()),
                LockMode::Shared,
                holder,
            ))
            .await?;
        inode::read_data(self.device(), &inode.dinode(), offset, len)
    }

    pub(crate) async fn hidden_write(
        &self,
        holder: LockHolder,
        which: HiddenFile,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let bs = self.block_size();
        inode::write_end(bs, offset, data.len())?;

        let inode = self.load_inode(which.identity(self.superblock()).formal_id)?;
        let _lock = self
            .locks
            .acquire(
                LockRequest::new(LockScope::Inode(inode.formal_id()), LockMode::Exclusive, holder)
                    .with_flags(LockFlags::default().with_priority().with_sync()),
            )
            .await?;

        let mut dinode = inode.dinode();
        if !dinode.has_flag(dinode_flags::JDATA) {
            error!(hidden = %which, identity = %inode.identity(), "hidden object is not journaled data");
            return Err(TesseraError::InternalInconsistency(format!(
                "{} is not a journaled-data object",
                which
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let (data_blocks, ind_blocks) = inode::write_calc_reserv(bs, data.len());
        if inode::alloc_required(self.device(), &dinode, offset, data.len())? {
            let hold = self.quota.hold(&QuotaId::owner_ids(dinode.uid, dinode.gid));
            if self.quota_enforced() {
                hold.check((data_blocks + ind_blocks) as u64)?;
            }
            let mut res = self
                .regions
                .reserve(&self.locks, holder, data_blocks + ind_blocks, AllocKind::Meta)
                .await?;
            let mut txn = Transaction::begin(
                self.journal(),
                1 + res.bitmap_blocks() + ind_blocks + data_blocks,
                1,
            )?;
            let allocated =
                inode::write_data(self.device(), &mut txn, &mut dinode, offset, data, Some(&mut res))?;
            hold.change(&mut txn, allocated as i64)?;
            txn.end()?;
            debug!(hidden = %which, offset, len = data.len(), allocated, "hidden write");
        } else {
            let mut txn = Transaction::begin(self.journal(), 1 + data_blocks, 0)?;
            inode::write_data(self.device(), &mut txn, &mut dinode, offset, data, None)?;
            txn.end()?;
            debug!(hidden = %which, offset, len = data.len(), "hidden write in place");
        }

        inode.set_dinode(dinode);
        Ok(data.len())
    }

    pub(crate) async fn hidden_truncate(&self, holder: LockHolder, which: HiddenFile, size: u64) -> Result<()> {
        if size > inode::max_file_size(self.block_size()) {
            return Err(TesseraError::OutOfSpace(format!(
                "{} cannot grow to {} bytes",
                which, size
            )));
        }
        let inode = self.load_inode(which.identity(self.superblock()).formal_id)?;
        let _lock = self
            .locks
            .acquire(
                LockRequest::new(LockScope::Inode(inode.formal_id()), LockMode::Exclusive, holder)
                    .with_flags(LockFlags::default().with_sync()),
            )
            .await?;

        let mut dinode = inode.dinode();
        let freed = inode::truncate_plan(self.device(), &dinode, size)?;
        if freed.is_empty() {
            let mut txn = Transaction::begin(self.journal(), 2, 0)?;
            inode::truncate_data(self.device(), &mut txn, &mut dinode, size, &freed)?;
            txn.end()?;
        } else {
            let regions = self.regions.lock_for_free(&self.locks, holder, &freed).await?;
            let hold = self.quota.hold(&QuotaId::owner_ids(dinode.uid, dinode.gid));
            let mut txn = Transaction::begin(
                self.journal(),
                2 + regions.bitmap_blocks(),
                freed.len() as u32 + 1,
            )?;
            inode::truncate_data(self.device(), &mut txn, &mut dinode, size, &freed)?;
            for &addr in &freed {
                regions.free(addr, AllocKind::Meta, &mut txn)?;
                txn.revoke(addr)?;
            }
            hold.change(&mut txn, -(freed.len() as i64))?;
            txn.end()?;
        }

        debug!(hidden = %which, size, freed = freed.len(), "hidden truncate");
        inode.set_dinode(dinode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TesseraConfig;
    use crate::region::RindexEntry;
    use std::sync::Arc;

    async fn mount() -> Arc<Mount> {
        let mut config = TesseraConfig::development();
        config.layout.block_size = 512;
        config.layout.region_count = 2;
        config.layout.region_blocks = 128;
        config.layout.journal_blocks = 256;
        config.layout.max_transaction_blocks = 64;
        Mount::format(config).await.unwrap()
    }

    #[test]
    fn test_names() {
        assert_eq!("rindex".parse::<HiddenFile>().unwrap(), HiddenFile::Rindex);
        assert!(matches!(
            "root".parse::<HiddenFile>(),
            Err(TesseraError::InvalidArgument(_))
        ));
        assert_eq!(HiddenFile::License.to_string(), "license");
    }

    #[tokio::test]
    async fn test_requires_sys_admin() {
        let m = mount().await;
        let user = Credentials::user(10, 10);
        assert!(matches!(
            m.hfile_read(&user, HiddenFile::Rindex, 0, 10).await,
            Err(TesseraError::PermissionDenied(_))
        ));
        assert!(matches!(
            m.hfile_write(&user, HiddenFile::License, 0, b"x").await,
            Err(TesseraError::PermissionDenied(_))
        ));
        assert!(matches!(
            m.hfile_truncate(&user, HiddenFile::Quota, 0).await,
            Err(TesseraError::PermissionDenied(_))
        ));
        assert!(matches!(
            m.hfile_stat(&user, HiddenFile::Jindex).await,
            Err(TesseraError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_layout_contents() {
        let m = mount().await;
        let root = Credentials::root();
        let rindex = m.hfile_read(&root, HiddenFile::Rindex, 0, 4096).await.unwrap();
        let entries = RindexEntry::decode_all(&rindex).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].addr, crate::mount::FIRST_REGION);

        let jindex = m.hfile_read(&root, HiddenFile::Jindex, 0, 4096).await.unwrap();
        let journals = JindexEntry::decode_all(&jindex).unwrap();
        assert_eq!(journals.len(), 1);
        assert_eq!(journals[0].blocks, 256);
    }

    #[tokio::test]
    async fn test_write_grow_and_truncate() {
        let m = mount().await;
        let root = Credentials::root();
        let before = m.regions().stat();

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            m.hfile_write(&root, HiddenFile::License, 0, &payload).await.unwrap(),
            2000
        );
        let stat = m.hfile_stat(&root, HiddenFile::License).await.unwrap();
        assert_eq!(stat.size, 2000);
        assert_eq!(stat.height, 1);
        assert_eq!(
            m.hfile_read(&root, HiddenFile::License, 0, 4096).await.unwrap(),
            payload
        );
        let grown = m.regions().stat();
        assert!(grown.used_meta > before.used_meta);

        // In-place overwrite allocates nothing.
        m.hfile_write(&root, HiddenFile::License, 10, b"zz").await.unwrap();
        assert_eq!(m.regions().stat(), grown);

        m.hfile_truncate(&root, HiddenFile::License, 100).await.unwrap();
        let stat = m.hfile_stat(&root, HiddenFile::License).await.unwrap();
        assert_eq!(stat.size, 100);
        let data = m.hfile_read(&root, HiddenFile::License, 0, 4096).await.unwrap();
        assert_eq!(&data[10..12], b"zz");
        assert_eq!(data.len(), 100);
        assert!(m.regions().stat().free_meta > 0);
        assert_eq!(m.locks().stats().holders, 0);
    }

    #[tokio::test]
    async fn test_write_past_end_rejected_early() {
        let m = mount().await;
        let err = m
            .hfile_write(&Credentials::root(), HiddenFile::License, u64::MAX / 2, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::OutOfSpace(_)));
    }

    #[tokio::test]
    async fn test_offsets_at_u64_max() {
        let m = mount().await;
        let root = Credentials::root();
        let commits = m.journal().stats().commits;

        let err = m
            .hfile_write(&root, HiddenFile::License, u64::MAX, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::OutOfSpace(_)));
        let err = m
            .hfile_write(&root, HiddenFile::License, u64::MAX - 1, b"xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::OutOfSpace(_)));
        assert_eq!(m.journal().stats().commits, commits);

        m.hfile_write(&root, HiddenFile::License, 0, b"abc").await.unwrap();
        assert!(m
            .hfile_read(&root, HiddenFile::License, u64::MAX, 16)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            m.hfile_read(&root, HiddenFile::License, 1, usize::MAX).await.unwrap(),
            b"bc"
        );
        assert!(matches!(
            m.hfile_truncate(&root, HiddenFile::License, u64::MAX).await,
            Err(TesseraError::OutOfSpace(_))
        ));
        assert_eq!(m.locks().stats().holders, 0);
    }

    #[tokio::test]
    async fn test_non_journaled_object_is_inconsistency() {
        let m = mount().await;
        let license = m.load_inode(m.superblock().license.formal_id).unwrap();
        let mut dinode = license.dinode();
        dinode.flags &= !dinode_flags::JDATA;
        license.set_dinode(dinode);

        let before = m.journal().stats().commits;
        let err = m
            .hfile_write(&Credentials::root(), HiddenFile::License, 0, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::InternalInconsistency(_)));
        assert_eq!(m.journal().stats().commits, before);
        assert_eq!(license.dinode().size, 0);
    }
}
