//! In-core objects and their data.
//!
//! An [`Inode`] is the live, cached form of an on-disk dinode. The cache is
//! keyed by formal id and only ever holds objects whose dinode block was
//! verified when they were loaded.
//!
//! File data uses two layouts. At height 0 ("stuffed") the bytes follow the
//! dinode in its own block. At height 1 the dinode block holds direct block
//! pointers after the dinode, and every data block is a journaled-data (JD)
//! block: a meta header followed by `block_size - META_HEADER_SIZE` payload
//! bytes.

use crate::disk::{meta_type, BlockDevice, Dinode, Encoder, MetaHeader, DINODE_SIZE, META_HEADER_SIZE};
use crate::error::{Result, TesseraError};
use crate::journal::Transaction;
use crate::region::{AllocKind, InplaceReservation};
use crate::types::{BlockAddr, FileType, FormalId, ObjectIdentity};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A live object.
#[derive(Debug)]
pub struct Inode {
    identity: ObjectIdentity,
    dinode: RwLock<Dinode>,
}

impl Inode {
    pub fn new(dinode: Dinode) -> Self {
        Self {
            identity: dinode.identity(),
            dinode: RwLock::new(dinode),
        }
    }

    /// Load and verify the dinode at `addr`.
    pub fn load(device: &dyn BlockDevice, addr: BlockAddr) -> Result<Self> {
        let block = device.read_block(addr)?;
        let dinode = Dinode::decode(&block)?;
        if !dinode.header.is(meta_type::DI) || dinode.addr != addr {
            return Err(TesseraError::InternalInconsistency(format!(
                "block {} does not hold a dinode",
                addr
            )));
        }
        Ok(Self::new(dinode))
    }

    pub fn identity(&self) -> ObjectIdentity {
        self.identity
    }

    pub fn formal_id(&self) -> FormalId {
        self.identity.formal_id
    }

    /// Snapshot of the dinode.
    pub fn dinode(&self) -> Dinode {
        self.dinode.read().clone()
    }

    pub fn file_type(&self) -> FileType {
        self.dinode.read().file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub(crate) fn set_dinode(&self, dinode: Dinode) {
        *self.dinode.write() = dinode;
    }
}

/// Live objects of one mount.
#[derive(Debug, Default)]
pub struct InodeCache {
    map: Mutex<HashMap<FormalId, Arc<Inode>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, formal_id: FormalId) -> Option<Arc<Inode>> {
        self.map.lock().get(&formal_id).cloned()
    }

    /// Insert `inode` unless another thread got there first; returns the
    /// cached object.
    pub fn insert(&self, inode: Inode) -> Arc<Inode> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry(inode.formal_id())
                .or_insert_with(|| Arc::new(inode)),
        )
    }

    pub fn remove(&self, formal_id: FormalId) -> Option<Arc<Inode>> {
        self.map.lock().remove(&formal_id)
    }

    /// Drop objects nobody outside the cache references, except `keep`.
    pub fn evict_unused(&self, keep: &[FormalId]) -> usize {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|id, inode| keep.contains(id) || Arc::strong_count(inode) > 1);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contents of `addr`, including changes made earlier in `txn`.
pub(crate) fn current_block(
    device: &dyn BlockDevice,
    txn: Option<&Transaction<'_>>,
    addr: BlockAddr,
) -> Result<Vec<u8>> {
    if let Some(data) = txn.and_then(|t| t.dirty_block(addr)) {
        let mut block = data.to_vec();
        block.resize(device.block_size(), 0);
        return Ok(block);
    }
    device.read_block(addr)
}

/// Write `dinode` into its block inside `txn`, keeping the rest of the block.
pub(crate) fn write_dinode(
    device: &dyn BlockDevice,
    txn: &mut Transaction<'_>,
    dinode: &Dinode,
) -> Result<()> {
    let mut block = current_block(device, Some(&*txn), dinode.addr)?;
    block[..DINODE_SIZE].copy_from_slice(&dinode.encode());
    txn.mark_dirty(dinode.addr, block)
}

/// Payload bytes per journaled data block.
pub fn jbsize(block_size: usize) -> usize {
    block_size - META_HEADER_SIZE
}

/// Bytes a stuffed object can hold.
pub fn stuffed_capacity(block_size: usize) -> usize {
    block_size - DINODE_SIZE
}

/// Direct pointers a dinode block can hold.
pub fn ptrs_per_block(block_size: usize) -> usize {
    (block_size - DINODE_SIZE) / 8
}

/// Largest object size the layout supports.
pub fn max_file_size(block_size: usize) -> u64 {
    (ptrs_per_block(block_size) * jbsize(block_size)) as u64
}

/// End offset of a `len`-byte write at `offset`, or `OutOfSpace` if it would
/// pass the largest object size.
pub fn write_end(block_size: usize, offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .filter(|&end| end <= max_file_size(block_size))
        .ok_or_else(|| {
            TesseraError::OutOfSpace(format!(
                "write of {} bytes at {} exceeds the maximum object size {}",
                len,
                offset,
                max_file_size(block_size)
            ))
        })
}

/// Upper bound of the data and pointer blocks a write of `len` bytes may
/// touch.
pub fn write_calc_reserv(block_size: usize, len: usize) -> (u32, u32) {
    let data = len.div_ceil(jbsize(block_size)) as u32 + 1;
    let ind = (data as usize).div_ceil(ptrs_per_block(block_size)) as u32;
    (data, ind)
}

fn pointers(block: &[u8], block_size: usize) -> Vec<BlockAddr> {
    (0..ptrs_per_block(block_size))
        .map(|i| {
            let at = DINODE_SIZE + i * 8;
            let mut b = [0u8; 8];
            b.copy_from_slice(&block[at..at + 8]);
            u64::from_be_bytes(b)
        })
        .collect()
}

fn set_pointer(block: &mut [u8], lbn: usize, addr: BlockAddr) {
    let at = DINODE_SIZE + lbn * 8;
    block[at..at + 8].copy_from_slice(&addr.to_be_bytes());
}

/// An empty journaled-data block for `addr`, carrying the incarnation of
/// the metadata that held the block before.
fn jd_block(
    device: &dyn BlockDevice,
    txn: &Transaction<'_>,
    addr: BlockAddr,
) -> Result<Vec<u8>> {
    let block_size = device.block_size();
    let previous = MetaHeader::carried_incarnation(&current_block(device, Some(txn), addr)?);
    let mut enc = Encoder::with_capacity(block_size);
    MetaHeader::new(meta_type::JD, previous).encode(&mut enc);
    enc.pad_to(block_size);
    Ok(enc.finish())
}

/// Data blocks currently allocated to an object.
pub fn data_blocks(device: &dyn BlockDevice, dinode: &Dinode) -> Result<Vec<BlockAddr>> {
    if dinode.height == 0 {
        return Ok(Vec::new());
    }
    let block = device.read_block(dinode.addr)?;
    Ok(pointers(&block, device.block_size())
        .into_iter()
        .filter(|&p| p != 0)
        .collect())
}

/// Read up to `len` bytes at `offset`. Holes read as zeroes.
pub fn read_data(
    device: &dyn BlockDevice,
    dinode: &Dinode,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    if offset >= dinode.size {
        return Ok(Vec::new());
    }
    let end = dinode.size.min(offset.saturating_add(len as u64));
    let n = (end - offset) as usize;
    let mut out = Vec::new();
    out.try_reserve_exact(n)?;

    let bs = device.block_size();
    let block = device.read_block(dinode.addr)?;
    if dinode.height == 0 {
        let start = DINODE_SIZE + offset as usize;
        out.extend_from_slice(&block[start..start + n]);
        return Ok(out);
    }

    let ptrs = pointers(&block, bs);
    let jb = jbsize(bs) as u64;
    let mut pos = offset;
    while pos < end {
        let lbn = (pos / jb) as usize;
        let within = (pos % jb) as usize;
        let chunk = ((jb as usize) - within).min((end - pos) as usize);
        match ptrs.get(lbn).copied().unwrap_or(0) {
            0 => out.resize(out.len() + chunk, 0),
            addr => {
                let data = device.read_block(addr)?;
                let start = META_HEADER_SIZE + within;
                out.extend_from_slice(&data[start..start + chunk]);
            }
        }
        pos += chunk as u64;
    }
    Ok(out)
}

/// Whether writing `len` bytes at `offset` needs new blocks.
pub fn alloc_required(
    device: &dyn BlockDevice,
    dinode: &Dinode,
    offset: u64,
    len: usize,
) -> Result<bool> {
    if len == 0 {
        return Ok(false);
    }
    let bs = device.block_size();
    let end = write_end(bs, offset, len)?;
    if dinode.height == 0 {
        return Ok(end > stuffed_capacity(bs) as u64);
    }
    let jb = jbsize(bs) as u64;
    let block = device.read_block(dinode.addr)?;
    let ptrs = pointers(&block, bs);
    let first = (offset / jb) as usize;
    let last = ((end - 1) / jb) as usize;
    Ok((first..=last).any(|lbn| ptrs.get(lbn).copied().unwrap_or(0) == 0))
}

/// Write `data` at `offset` inside `txn`, allocating from `alloc` where
/// needed. Updates `dinode` (size, height, blocks, times) and writes it.
///
/// Returns the number of blocks allocated.
pub fn write_data(
    device: &dyn BlockDevice,
    txn: &mut Transaction<'_>,
    dinode: &mut Dinode,
    offset: u64,
    data: &[u8],
    mut alloc: Option<&mut InplaceReservation>,
) -> Result<u32> {
    let bs = device.block_size();
    let end = write_end(bs, offset, data.len())?;

    let mut dblock = current_block(device, Some(&*txn), dinode.addr)?;
    let mut allocated = 0u32;

    let mut take_block = |txn: &mut Transaction<'_>, allocated: &mut u32| -> Result<BlockAddr> {
        let res = alloc.as_deref_mut().ok_or_else(|| {
            TesseraError::InternalInconsistency(
                "write needs blocks but holds no reservation".to_string(),
            )
        })?;
        *allocated += 1;
        res.alloc(AllocKind::Meta, txn)
    };

    if dinode.height == 0 && end <= stuffed_capacity(bs) as u64 {
        let start = DINODE_SIZE + offset as usize;
        dblock[start..start + data.len()].copy_from_slice(data);
    } else {
        if dinode.height == 0 {
            // Unstuff: move existing bytes into the first data block.
            let stuffed = dinode.size as usize;
            let old = dblock[DINODE_SIZE..DINODE_SIZE + stuffed].to_vec();
            dblock[DINODE_SIZE..].fill(0);
            if stuffed > 0 {
                let addr = take_block(&mut *txn, &mut allocated)?;
                let mut first = jd_block(device, &*txn, addr)?;
                first[META_HEADER_SIZE..META_HEADER_SIZE + stuffed].copy_from_slice(&old);
                txn.mark_dirty(addr, first)?;
                set_pointer(&mut dblock, 0, addr);
            }
            dinode.height = 1;
            debug!(addr = dinode.addr, stuffed, "object unstuffed");
        }

        let jb = jbsize(bs) as u64;
        let mut pos = offset;
        while pos < end {
            let lbn = (pos / jb) as usize;
            let within = (pos % jb) as usize;
            let chunk = ((jb as usize) - within).min((end - pos) as usize);
            let src = (pos - offset) as usize;

            let mut ptr = pointers(&dblock, bs)[lbn];
            let mut block = if ptr == 0 {
                ptr = take_block(&mut *txn, &mut allocated)?;
                set_pointer(&mut dblock, lbn, ptr);
                jd_block(device, &*txn, ptr)?
            } else {
                current_block(device, Some(&*txn), ptr)?
            };
            let start = META_HEADER_SIZE + within;
            block[start..start + chunk].copy_from_slice(&data[src..src + chunk]);
            txn.mark_dirty(ptr, block)?;
            pos += chunk as u64;
        }
    }

    dinode.size = dinode.size.max(end);
    dinode.blocks += allocated as u64;
    dinode.mtime = crate::disk::now_secs();
    dinode.ctime = dinode.mtime;
    dblock[..DINODE_SIZE].copy_from_slice(&dinode.encode());
    txn.mark_dirty(dinode.addr, dblock)?;
    Ok(allocated)
}

/// Blocks that truncating to `size` will release.
pub fn truncate_plan(device: &dyn BlockDevice, dinode: &Dinode, size: u64) -> Result<Vec<BlockAddr>> {
    if dinode.height == 0 || size >= dinode.size {
        return Ok(Vec::new());
    }
    let bs = device.block_size();
    let keep = size.div_ceil(jbsize(bs) as u64) as usize;
    let block = device.read_block(dinode.addr)?;
    Ok(pointers(&block, bs)
        .into_iter()
        .skip(keep)
        .filter(|&p| p != 0)
        .collect())
}

/// Set the object's size to `size` inside `txn`, dropping pointers to the
/// `freed` blocks and zeroing the tail of the last kept block.
///
/// The caller returns `freed` to their regions.
pub fn truncate_data(
    device: &dyn BlockDevice,
    txn: &mut Transaction<'_>,
    dinode: &mut Dinode,
    size: u64,
    freed: &[BlockAddr],
) -> Result<()> {
    let bs = device.block_size();
    let mut dblock = current_block(device, Some(&*txn), dinode.addr)?;

    if size < dinode.size {
        if dinode.height == 0 {
            dblock[DINODE_SIZE + size as usize..DINODE_SIZE + dinode.size as usize].fill(0);
        } else {
            let jb = jbsize(bs) as u64;
            for (lbn, ptr) in pointers(&dblock, bs).into_iter().enumerate() {
                if ptr != 0 && freed.contains(&ptr) {
                    set_pointer(&mut dblock, lbn, 0);
                }
            }
            let within = (size % jb) as usize;
            if within != 0 {
                let tail = pointers(&dblock, bs)[(size / jb) as usize];
                if tail != 0 {
                    let mut block = current_block(device, Some(&*txn), tail)?;
                    block[META_HEADER_SIZE + within..].fill(0);
                    txn.mark_dirty(tail, block)?;
                }
            }
        }
    }

    dinode.size = size;
    dinode.blocks = dinode.blocks.saturating_sub(freed.len() as u64);
    dinode.mtime = crate::disk::now_secs();
    dinode.ctime = dinode.mtime;
    dblock[..DINODE_SIZE].copy_from_slice(&dinode.encode());
    txn.mark_dirty(dinode.addr, dblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::counters::MountCounters;
    use crate::disk::MemDevice;
    use crate::journal::MemJournal;
    use crate::lock::{LockHolder, LockManager};
    use crate::region::RegionIndex;
    use crate::types::dinode_flags;

    const BS: usize = 512;

    struct Fixture {
        dev: Arc<MemDevice>,
        journal: MemJournal,
        index: RegionIndex,
        locks: Arc<LockManager>,
        dinode: Dinode,
    }

    fn fixture() -> Fixture {
        let dev = Arc::new(MemDevice::new(BS, 512, Arc::new(MountCounters::new())));
        let journal = MemJournal::new(dev.clone(), 400, 64, 32);
        let index = RegionIndex::layout(20, 1, 128);
        let mut dinode = Dinode::new(21, 1, FileType::Regular, 0o600);
        dinode.flags = dinode_flags::JDATA;
        dev.write_block(21, &dinode.encode()).unwrap();
        index.regions()[0]
            .mark_formatted(21, AllocKind::Dinode)
            .unwrap();
        Fixture {
            dev,
            journal,
            index,
            locks: LockManager::new(LockConfig::default()),
            dinode,
        }
    }

    #[test]
    fn test_geometry() {
        assert_eq!(jbsize(BS), 496);
        assert_eq!(stuffed_capacity(BS), 384);
        assert_eq!(ptrs_per_block(BS), 48);
        assert_eq!(write_calc_reserv(BS, 1000), (4, 1));
    }

    #[test]
    fn test_stuffed_write_needs_no_allocation() {
        let mut f = fixture();
        assert!(!alloc_required(f.dev.as_ref(), &f.dinode, 0, 100).unwrap());
        let mut txn = Transaction::begin(&f.journal, 1, 0).unwrap();
        let n = write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 10, b"hello", None).unwrap();
        txn.end().unwrap();
        assert_eq!(n, 0);
        assert_eq!(f.dinode.size, 15);

        let on_disk = Inode::load(f.dev.as_ref(), 21).unwrap().dinode();
        assert_eq!(on_disk.size, 15);
        let data = read_data(f.dev.as_ref(), &on_disk, 8, 100).unwrap();
        assert_eq!(data, b"\0\0hello");
    }

    #[tokio::test]
    async fn test_unstuff_and_truncate() {
        let mut f = fixture();
        let holder = LockHolder::new(f.locks.new_owner(), 1);

        let mut txn = Transaction::begin(&f.journal, 1, 0).unwrap();
        write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 0, b"abc", None).unwrap();
        txn.end().unwrap();

        let payload = vec![0x5a; 1000];
        assert!(alloc_required(f.dev.as_ref(), &f.dinode, 100, payload.len()).unwrap());
        let (data, ind) = write_calc_reserv(BS, payload.len());
        let mut res = f
            .index
            .reserve(&f.locks, holder, data + ind, AllocKind::Meta)
            .await
            .unwrap();
        let mut txn = Transaction::begin(&f.journal, 1 + 1 + ind + data, 0).unwrap();
        let n = write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 100, &payload, Some(&mut res)).unwrap();
        txn.end().unwrap();
        drop(res);

        assert_eq!(f.dinode.height, 1);
        assert_eq!(n, 3);
        assert_eq!(f.dinode.size, 1100);
        let back = read_data(f.dev.as_ref(), &f.dinode, 0, 2000).unwrap();
        assert_eq!(&back[..3], b"abc");
        assert_eq!(&back[100..], &payload[..]);

        let freed = truncate_plan(f.dev.as_ref(), &f.dinode, 200).unwrap();
        assert_eq!(freed.len(), 2);
        let mut txn = Transaction::begin(&f.journal, 2, 0).unwrap();
        truncate_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 200, &freed).unwrap();
        txn.end().unwrap();
        assert_eq!(f.dinode.size, 200);
        assert_eq!(data_blocks(f.dev.as_ref(), &f.dinode).unwrap().len(), 1);
        let back = read_data(f.dev.as_ref(), &f.dinode, 0, 2000).unwrap();
        assert_eq!(back.len(), 200);
        assert_eq!(back[150], 0x5a);
    }

    #[tokio::test]
    async fn test_data_block_keeps_incarnation() {
        let mut f = fixture();
        let holder = LockHolder::new(f.locks.new_owner(), 1);
        // Leftover dinode from an earlier object on the next free block.
        f.dev.write_block(22, &Dinode::new(22, 7, FileType::Regular, 0o644).encode()).unwrap();

        let mut res = f.index.reserve(&f.locks, holder, 2, AllocKind::Meta).await.unwrap();
        let mut txn = Transaction::begin(&f.journal, 4, 0).unwrap();
        write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 0, &[3; 600], Some(&mut res)).unwrap();
        txn.end().unwrap();

        let header = MetaHeader::peek(&f.dev.read_block(22).unwrap()).unwrap();
        assert!(header.is(meta_type::JD));
        assert_eq!(header.incarnation, 7);
        let header = MetaHeader::peek(&f.dev.read_block(23).unwrap()).unwrap();
        assert_eq!(header.incarnation, 0);
    }

    #[test]
    fn test_offset_overflow() {
        let mut f = fixture();
        assert!(matches!(
            write_end(BS, u64::MAX, 1),
            Err(TesseraError::OutOfSpace(_))
        ));
        assert_eq!(write_end(BS, 10, 5).unwrap(), 15);
        assert!(matches!(
            alloc_required(f.dev.as_ref(), &f.dinode, u64::MAX, 1),
            Err(TesseraError::OutOfSpace(_))
        ));

        let mut txn = Transaction::begin(&f.journal, 1, 0).unwrap();
        let err = write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, u64::MAX, b"x", None).unwrap_err();
        assert!(matches!(err, TesseraError::OutOfSpace(_)));
        assert_eq!(txn.dirty_count(), 0);
        txn.end().unwrap();

        let mut txn = Transaction::begin(&f.journal, 1, 0).unwrap();
        write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 0, b"abc", None).unwrap();
        txn.end().unwrap();
        assert_eq!(read_data(f.dev.as_ref(), &f.dinode, 2, usize::MAX).unwrap(), b"c");
        assert!(read_data(f.dev.as_ref(), &f.dinode, u64::MAX, 1).unwrap().is_empty());
    }

    #[test]
    fn test_write_without_reservation_is_inconsistency() {
        let mut f = fixture();
        let mut txn = Transaction::begin(&f.journal, 4, 0).unwrap();
        let err = write_data(f.dev.as_ref(), &mut txn, &mut f.dinode, 0, &[1; 600], None).unwrap_err();
        assert!(matches!(err, TesseraError::InternalInconsistency(_)));
    }

    #[test]
    fn test_cache() {
        let cache = InodeCache::new();
        let a = cache.insert(Inode::new(Dinode::new(5, 1, FileType::Regular, 0o644)));
        let b = cache.insert(Inode::new(Dinode::new(5, 2, FileType::Regular, 0o644)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        drop((a, b));
        assert_eq!(cache.evict_unused(&[]), 1);
        assert!(cache.is_empty());
    }
}
