//! A mounted Tessera filesystem.
//!
//! [`Mount`] owns every per-mount resource: the block device, this node's
//! journal, the lock manager, the region index, the inode cache, quota
//! state, tunables and counters. Nothing in the crate keeps process-wide
//! state.
//!
//! # Device layout
//!
//! ```text
//! 0 ........ 15 | 16 | 17 ..................... | ...................
//! reserved      | sb | region 0 | region 1 | .. | journal 0 | journal 1 ..
//! ```
//!
//! The first data blocks of region 0 hold the four hidden objects and the
//! root directory.

use crate::acl;
use crate::config::{MountArgs, TesseraConfig, Tunables};
use crate::counters::MountCounters;
use crate::dir::{DirEntry, DirectoryOps, MemDirectory};
use crate::disk::{
    meta_type, BlockDevice, Dinode, MemDevice, MetaHeader, Superblock, FS_FORMAT,
    MULTIHOST_FORMAT, SB_ADDR,
};
use crate::eattr::EaStore;
use crate::error::{Result, TesseraError};
use crate::hidden::{HiddenFile, JindexEntry};
use crate::inode::{self, Inode, InodeCache};
use crate::journal::{Journal, MemJournal, Transaction};
use crate::lock::{LockHolder, LockManager, LockMode, LockRequest, LockScope};
use crate::quota::{QuotaId, QuotaManager, QuotaRecord, QUOTA_RECORD_SIZE};
use crate::region::{AllocKind, RegionIndex};
use crate::types::{dinode_flags, BlockAddr, Credentials, FileType, FormalId, NodeId, ObjectIdentity};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Address of the first region.
pub const FIRST_REGION: BlockAddr = SB_ADDR + 1;

/// A mounted filesystem.
pub struct Mount {
    config: TesseraConfig,
    cookie: Uuid,
    jid: u32,
    superblock: Superblock,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) regions: RegionIndex,
    pub(crate) inodes: InodeCache,
    pub(crate) dirs: Arc<dyn DirectoryOps>,
    pub(crate) quota: QuotaManager,
    pub(crate) tune: RwLock<Tunables>,
    pub(crate) counters: Arc<MountCounters>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("cookie", &self.cookie)
            .field("node", &self.config.node.id)
            .field("jid", &self.jid)
            .finish()
    }
}

impl Mount {
    /// Format an in-memory device with `config` and mount it.
    pub async fn format(config: TesseraConfig) -> Result<Arc<Mount>> {
        config.validate()?;
        let layout = &config.layout;
        let bs = layout.block_size as usize;

        let regions = RegionIndex::layout(FIRST_REGION, layout.region_count, layout.region_blocks);
        let region0 = Arc::clone(&regions.regions()[0]);
        if region0.data_len < 5 {
            return Err(TesseraError::InvalidConfig {
                field: "layout.region_blocks".to_string(),
                reason: "The first region must hold the hidden objects and the root".to_string(),
            });
        }
        let journal_start = regions.end();
        let block_count = journal_start + layout.journal_count as u64 * layout.journal_blocks as u64;

        let counters = Arc::new(MountCounters::new());
        let device: Arc<dyn BlockDevice> =
            Arc::new(MemDevice::new(bs, block_count, Arc::clone(&counters)));

        // Hidden objects, then the root directory.
        let mut identities = Vec::with_capacity(5);
        for (i, which) in HiddenFile::ALL.iter().enumerate() {
            let addr = region0.data0 + i as u64;
            let mut dinode = Dinode::new(addr, 1, FileType::Regular, 0o600);
            dinode.flags = dinode_flags::JDATA;
            device.write_block(addr, &dinode.encode())?;
            region0.mark_formatted(addr, AllocKind::Dinode)?;
            debug!(hidden = which.name(), addr, "hidden object formatted");
            identities.push(dinode.identity());
        }
        let root_addr = region0.data0 + 4;
        let mut root = Dinode::new(root_addr, 1, FileType::Directory, 0o755);
        root.nlink = 2;
        device.write_block(root_addr, &root.encode())?;
        region0.mark_formatted(root_addr, AllocKind::Dinode)?;

        for region in regions.regions() {
            device.write_block(region.addr, &region.encode())?;
        }

        let superblock = Superblock {
            header: MetaHeader::new(meta_type::SB, 0),
            fs_format: FS_FORMAT,
            multihost_format: MULTIHOST_FORMAT,
            block_size: layout.block_size,
            block_size_shift: layout.block_size.trailing_zeros(),
            jindex: identities[0],
            rindex: identities[1],
            quota: identities[2],
            license: identities[3],
            root_dir: root.identity(),
            lockproto: config.mount.lockproto.clone(),
            locktable: config.mount.locktable.clone(),
        };
        device.write_block(SB_ADDR, &superblock.encode())?;

        let jid = ((config.node.id - 1) % layout.journal_count as u64) as u32;
        let journal = Arc::new(MemJournal::new(
            Arc::clone(&device),
            journal_start + jid as u64 * layout.journal_blocks as u64,
            layout.journal_blocks,
            layout.max_transaction_blocks,
        ));

        let dirs = Arc::new(MemDirectory::new());
        dirs.init_dir(root.identity(), root.identity())?;

        let mount = Arc::new(Mount {
            locks: LockManager::new(config.lock.clone()),
            tune: RwLock::new(config.tune.clone()),
            cookie: Uuid::new_v4(),
            jid,
            superblock,
            device,
            journal,
            regions,
            inodes: InodeCache::new(),
            dirs,
            quota: QuotaManager::new(),
            counters,
            config,
        });

        // Describe the layout in the hidden objects.
        let holder = mount.holder();
        let jindex: Vec<u8> = (0..mount.config.layout.journal_count)
            .flat_map(|j| {
                JindexEntry {
                    addr: journal_start + j as u64 * mount.config.layout.journal_blocks as u64,
                    blocks: mount.config.layout.journal_blocks,
                }
                .encode()
            })
            .collect();
        mount.hidden_write(holder, HiddenFile::Jindex, 0, &jindex).await?;
        let rindex = mount.regions.encode_rindex();
        mount.hidden_write(holder, HiddenFile::Rindex, 0, &rindex).await?;
        let mut quota = QuotaRecord::default().encode();
        quota.extend_from_slice(&QuotaRecord::default().encode());
        mount.hidden_write(holder, HiddenFile::Quota, 0, &quota).await?;

        info!(
            cookie = %mount.cookie,
            blocks = block_count,
            regions = mount.regions.regions().len(),
            jid,
            "filesystem formatted and mounted"
        );
        Ok(mount)
    }

    /// A lock holder for one request on this node.
    pub fn holder(&self) -> LockHolder {
        LockHolder::new(self.locks.new_owner(), self.node_id())
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node.id
    }

    pub fn cookie(&self) -> Uuid {
        self.cookie
    }

    /// This node's journal id.
    pub fn jid(&self) -> u32 {
        self.jid
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn args(&self) -> &MountArgs {
        &self.config.mount
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    pub fn journal(&self) -> &dyn Journal {
        self.journal.as_ref()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn regions(&self) -> &RegionIndex {
        &self.regions
    }

    pub fn inodes(&self) -> &InodeCache {
        &self.inodes
    }

    pub fn directories(&self) -> &Arc<dyn DirectoryOps> {
        &self.dirs
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn counters(&self) -> &Arc<MountCounters> {
        &self.counters
    }

    pub fn tunables(&self) -> Tunables {
        self.tune.read().clone()
    }

    pub(crate) fn quota_enforced(&self) -> bool {
        self.tune.read().quota_enforce != 0
    }

    /// The cached object for `formal_id`, loading it if needed.
    pub(crate) fn load_inode(&self, formal_id: FormalId) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.get(formal_id) {
            return Ok(inode);
        }
        Ok(self.inodes.insert(Inode::load(self.device(), formal_id)?))
    }

    pub fn root(&self) -> Result<Arc<Inode>> {
        self.load_inode(self.superblock.root_dir.formal_id)
    }

    /// Look `name` up in `dir` under a Shared lock.
    pub async fn lookup(&self, dir: &Inode, name: &str) -> Result<Arc<Inode>> {
        let _lock = self
            .locks
            .acquire(LockRequest::new(
                LockScope::Inode(dir.formal_id()),
                LockMode::Shared,
                self.holder(),
            ))
            .await?;
        let entry = self
            .dirs
            .lookup(dir.formal_id(), name)?
            .ok_or_else(|| TesseraError::NotFound(name.to_string()))?;
        self.load_inode(entry.identity.formal_id)
    }

    /// Create `name` in `dir`.
    ///
    /// The child's dinode, its initial ACL records and the region bitmap are
    /// written in one transaction under the directory's Exclusive lock.
    pub async fn create(
        &self,
        creds: &Credentials,
        dir: &Inode,
        name: &str,
        file_type: FileType,
        mode: u32,
    ) -> Result<Arc<Inode>> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(TesseraError::InvalidArgument(format!("bad name {:?}", name)));
        }
        let holder = self.holder();
        let _dir_lock = self
            .locks
            .acquire(LockRequest::new(
                LockScope::Inode(dir.formal_id()),
                LockMode::Exclusive,
                holder,
            ))
            .await?;

        let parent = dir.dinode();
        if parent.file_type() != FileType::Directory {
            return Err(TesseraError::InvalidArgument(format!(
                "{} is not a directory",
                dir.identity()
            )));
        }
        if self.dirs.lookup(dir.formal_id(), name)?.is_some() {
            return Err(TesseraError::InvalidArgument(format!("{:?} already exists", name)));
        }

        let prep = acl::new_prep(self, creds, dir, file_type, mode)?;
        let hold = self.quota.hold(&QuotaId::owner_ids(creds.uid, creds.gid));
        if self.quota_enforced() {
            hold.check(1 + prep.blocks as u64)?;
        }
        let mut res = self
            .regions
            .reserve(&self.locks, holder, 1 + prep.blocks, AllocKind::Meta)
            .await?;

        let mut txn = Transaction::begin(self.journal(), 1 + res.bitmap_blocks() + prep.blocks, 1)?;
        let addr = res.alloc(AllocKind::Dinode, &mut txn)?;
        let incarnation = MetaHeader::carried_incarnation(&self.device.read_block(addr)?)
            .wrapping_add(1)
            .max(1);

        let mut dinode = Dinode::new(addr, incarnation, file_type, prep.mode);
        dinode.uid = creds.uid;
        dinode.gid = creds.gid;
        if file_type == FileType::Directory {
            dinode.nlink = 2;
        }
        dinode.flags = inherited_flags(&parent, file_type, &self.tunables());
        dinode.eattr = acl::new_init(self, &mut txn, &prep, &mut res)?;
        dinode.blocks = res.allocated() as u64;

        let mut block = dinode.encode();
        block.resize(self.block_size(), 0);
        txn.mark_dirty(addr, block)?;
        hold.change(&mut txn, dinode.blocks as i64)?;
        txn.end()?;
        drop(res);
        drop(hold);

        let identity = dinode.identity();
        self.dirs.link(
            dir.formal_id(),
            DirEntry {
                name: name.to_string(),
                identity,
                file_type,
            },
        )?;
        if file_type == FileType::Directory {
            self.dirs.init_dir(identity, dir.identity())?;
        }
        self.counters.ops_inode.inc();
        debug!(%identity, name, ?file_type, "object created");
        Ok(self.inodes.insert(Inode::new(dinode)))
    }

    /// Remove `name` from `dir` and deallocate the object.
    ///
    /// The dinode block is marked unused and returned to its region as
    /// `Unused`, so a later allocation of the same address carries a higher
    /// generation.
    pub async fn remove(&self, creds: &Credentials, dir: &Inode, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(TesseraError::InvalidArgument(format!("cannot remove {:?}", name)));
        }
        let holder = self.holder();
        let _dir_lock = self
            .locks
            .acquire(LockRequest::new(
                LockScope::Inode(dir.formal_id()),
                LockMode::Exclusive,
                holder,
            ))
            .await?;
        let entry = self
            .dirs
            .lookup(dir.formal_id(), name)?
            .ok_or_else(|| TesseraError::NotFound(name.to_string()))?;
        let formal_id = entry.identity.formal_id;
        let _lock = self
            .locks
            .acquire(LockRequest::new(LockScope::Inode(formal_id), LockMode::Exclusive, holder))
            .await?;

        let inode = self.load_inode(formal_id)?;
        let mut dinode = inode.dinode();
        if !creds.owns_or_overrides(dinode.uid) {
            return Err(TesseraError::PermissionDenied(format!(
                "uid {} may not remove {}",
                creds.uid,
                inode.identity()
            )));
        }
        if dinode.file_type() == FileType::Directory && self.dirs.entries(formal_id)?.len() > 2 {
            return Err(TesseraError::InvalidArgument(format!("{:?} is not empty", name)));
        }

        let data = inode::data_blocks(self.device(), &dinode)?;
        let ea = EaStore::load(self.device(), dinode.eattr)?.chain().to_vec();
        let mut all = data.clone();
        all.extend_from_slice(&ea);
        all.push(dinode.addr);

        let regions = self.regions.lock_for_free(&self.locks, holder, &all).await?;
        let hold = self.quota.hold(&QuotaId::owner_ids(dinode.uid, dinode.gid));
        let revokes = (data.len() + ea.len()) as u32 + 1;
        let mut txn = Transaction::begin(self.journal(), 1 + regions.bitmap_blocks(), revokes)?;
        for &addr in data.iter().chain(ea.iter()) {
            regions.free(addr, AllocKind::Meta, &mut txn)?;
            txn.revoke(addr)?;
        }
        dinode.flags |= dinode_flags::UNUSED;
        dinode.nlink = 0;
        dinode.touch_ctime();
        inode::write_dinode(self.device(), &mut txn, &dinode)?;
        regions.free(dinode.addr, AllocKind::Dinode, &mut txn)?;
        hold.change(&mut txn, -(dinode.blocks as i64))?;
        txn.end()?;
        drop(hold);
        drop(regions);

        self.dirs.unlink(dir.formal_id(), name)?;
        if dinode.file_type() == FileType::Directory {
            self.dirs.drop_dir(formal_id);
        }
        self.inodes.remove(formal_id);
        self.counters.ops_inode.inc();
        debug!(identity = %inode.identity(), name, "object removed");
        Ok(())
    }

    /// Change an object's permission bits, keeping its access ACL in step.
    pub async fn setattr_mode(&self, creds: &Credentials, inode: &Inode, mode: u32) -> Result<()> {
        acl::chmod(self, creds, inode, mode).await
    }

    /// Write pending quota changes into the quota object.
    ///
    /// Returns how many records were written.
    pub async fn quota_sync(&self, only: Option<QuotaId>) -> Result<usize> {
        let mut synced = 0;
        for (id, delta) in self.quota.pending() {
            if only.is_some_and(|o| o != id) {
                continue;
            }
            let holder = self.holder();
            let _lock = self
                .locks
                .acquire(LockRequest::new(LockScope::Quota(id), LockMode::Exclusive, holder))
                .await?;
            let bytes = self
                .hidden_read(holder, HiddenFile::Quota, id.file_offset(), QUOTA_RECORD_SIZE)
                .await?;
            let mut record = QuotaRecord::decode(&bytes)?;
            record.value += delta;
            self.hidden_write(holder, HiddenFile::Quota, id.file_offset(), &record.encode())
                .await?;
            self.quota.synced(id, delta, record);
            synced += 1;
        }
        debug!(synced, "quota sync");
        Ok(synced)
    }

    /// Reload `id`'s record from the quota object.
    pub async fn quota_refresh(&self, id: QuotaId) -> Result<QuotaRecord> {
        let holder = self.holder();
        let _lock = self
            .locks
            .acquire(LockRequest::new(LockScope::Quota(id), LockMode::Shared, holder))
            .await?;
        let bytes = self
            .hidden_read(holder, HiddenFile::Quota, id.file_offset(), QUOTA_RECORD_SIZE)
            .await?;
        let record = QuotaRecord::decode(&bytes)?;
        self.quota.refresh(id, record);
        Ok(record)
    }

    /// The on-disk record of `id`, freshly read.
    pub async fn quota_read(&self, id: QuotaId) -> Result<QuotaRecord> {
        self.quota_refresh(id).await
    }

    /// Whether `formal_id` names one of the hidden objects.
    pub fn is_hidden(&self, formal_id: FormalId) -> bool {
        HiddenFile::ALL
            .iter()
            .any(|h| h.identity(&self.superblock).formal_id == formal_id)
    }

    pub(crate) fn root_identity(&self) -> ObjectIdentity {
        self.superblock.root_dir
    }
}

/// Flags a new object takes from its parent directory and the tunables.
fn inherited_flags(parent: &Dinode, file_type: FileType, tune: &Tunables) -> u32 {
    let mut flags = 0;
    match file_type {
        FileType::Directory => {
            flags |= parent.flags & (dinode_flags::INHERIT_JDATA | dinode_flags::INHERIT_DIRECTIO);
        }
        FileType::Regular => {
            if parent.has_flag(dinode_flags::INHERIT_JDATA) || tune.new_files_jdata != 0 {
                flags |= dinode_flags::JDATA;
            }
            if parent.has_flag(dinode_flags::INHERIT_DIRECTIO) || tune.new_files_directio != 0 {
                flags |= dinode_flags::DIRECTIO;
            }
        }
        _ => {}
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::BlockState;

    fn small_config() -> TesseraConfig {
        let mut config = TesseraConfig::development();
        config.layout.block_size = 512;
        config.layout.region_count = 2;
        config.layout.region_blocks = 64;
        config.layout.journal_blocks = 128;
        config.layout.max_transaction_blocks = 32;
        config
    }

    #[tokio::test]
    async fn test_format_layout() {
        let mount = Mount::format(small_config()).await.unwrap();
        let sb = Superblock::decode(&mount.device().read_block(SB_ADDR).unwrap()).unwrap();
        assert_eq!(&sb, mount.superblock());
        assert_eq!(sb.block_size, 512);
        assert_eq!(sb.block_size_shift, 9);

        let root = mount.root().unwrap();
        assert!(root.is_dir());
        assert!(mount.is_hidden(sb.quota.formal_id));
        assert!(!mount.is_hidden(sb.root_dir.formal_id));
        assert_eq!(
            mount.regions().block_state(sb.rindex.formal_id),
            Some(BlockState::UsedMeta)
        );
        assert_eq!(mount.jid(), 0);
        assert_eq!(mount.regions().stat().used_dinode, 5);
    }

    #[tokio::test]
    async fn test_create_and_remove_bumps_generation() {
        let mount = Mount::format(small_config()).await.unwrap();
        let root = mount.root().unwrap();
        let creds = Credentials::user(500, 500);

        let a = mount
            .create(&creds, &root, "a", FileType::Regular, 0o666)
            .await
            .unwrap();
        let first = a.identity();
        assert_eq!(a.dinode().uid, 500);
        // Default umask 022.
        assert_eq!(a.dinode().mode, 0o644);
        assert_eq!(mount.lookup(&root, "a").await.unwrap().identity(), first);

        mount.remove(&creds, &root, "a").await.unwrap();
        assert_eq!(
            mount.regions().block_state(first.formal_id),
            Some(BlockState::Unused)
        );
        assert!(matches!(
            mount.lookup(&root, "a").await,
            Err(TesseraError::NotFound(_))
        ));

        let b = mount
            .create(&creds, &root, "b", FileType::Regular, 0o600)
            .await
            .unwrap();
        assert_eq!(b.formal_id(), first.formal_id);
        assert!(b.identity().generation > first.generation);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let mount = Mount::format(small_config()).await.unwrap();
        let root = mount.root().unwrap();
        let creds = Credentials::root();
        let f = mount
            .create(&creds, &root, "f", FileType::Regular, 0o644)
            .await
            .unwrap();
        assert!(mount
            .create(&creds, &root, "f", FileType::Regular, 0o644)
            .await
            .is_err());
        assert!(mount
            .create(&creds, &f, "x", FileType::Regular, 0o644)
            .await
            .is_err());
        assert!(mount
            .create(&creds, &root, "..", FileType::Regular, 0o644)
            .await
            .is_err());
        // No lock stays held after the failures.
        assert_eq!(mount.locks().stats().holders, 0);
    }

    #[tokio::test]
    async fn test_remove_requires_ownership() {
        let mount = Mount::format(small_config()).await.unwrap();
        let root = mount.root().unwrap();
        mount
            .create(&Credentials::user(1, 1), &root, "mine", FileType::Regular, 0o644)
            .await
            .unwrap();
        let err = mount
            .remove(&Credentials::user(2, 2), &root, "mine")
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_quota_sync_writes_back() {
        let mount = Mount::format(small_config()).await.unwrap();
        let root = mount.root().unwrap();
        let creds = Credentials::user(3, 4);
        mount
            .create(&creds, &root, "q", FileType::Regular, 0o644)
            .await
            .unwrap();
        assert!(mount.quota_sync(Some(QuotaId::User(3))).await.unwrap() >= 1);
        let rec = mount.quota_read(QuotaId::User(3)).await.unwrap();
        assert_eq!(rec.value, 1);
        // The group change is still pending.
        assert!(mount
            .quota()
            .pending()
            .iter()
            .any(|(id, _)| *id == QuotaId::Group(4)));
    }

    #[test]
    fn test_inherited_flags() {
        let mut parent = Dinode::new(1, 1, FileType::Directory, 0o755);
        parent.flags = dinode_flags::INHERIT_JDATA;
        let tune = Tunables::default();
        assert_eq!(
            inherited_flags(&parent, FileType::Regular, &tune),
            dinode_flags::JDATA
        );
        assert_eq!(
            inherited_flags(&parent, FileType::Directory, &tune),
            dinode_flags::INHERIT_JDATA
        );
        assert_eq!(inherited_flags(&parent, FileType::Symlink, &tune), 0);
    }
}
