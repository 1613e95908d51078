//! Allocation regions.
//!
//! The device is divided into regions. Each region starts with one header
//! block holding its counters and a two-bit-per-block state bitmap,
//! followed by its data blocks. The resource index (`rindex`) lists every
//! region.
//!
//! The bitmap is only mutated under the region's Exclusive lock, by the
//! holder of an [`InplaceReservation`] or [`RegionLocks`]. Resolvers read it
//! under a Shared region lock.

use crate::disk::{meta_type, BlockDevice, Decoder, Dinode, Encoder, MetaHeader, META_HEADER_SIZE};
use crate::error::{Result, TesseraError};
use crate::journal::Transaction;
use crate::lock::{LockFlags, LockGuard, LockHolder, LockManager, LockMode, LockRequest, LockScope};
use crate::types::{dinode_flags, BlockAddr};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes in front of the bitmap in a region header block.
pub const RG_HEADER_SIZE: usize = META_HEADER_SIZE + 16;

/// Bytes per entry in the resource index.
pub const RINDEX_ENTRY_SIZE: usize = 32;

/// Blocks a single-block bitmap can describe.
pub fn bitmap_capacity(block_size: usize) -> u64 {
    (block_size.saturating_sub(RG_HEADER_SIZE) * 4) as u64
}

/// Allocation state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    UsedData = 1,
    /// Freed metadata, reusable for metadata without a reclaim.
    Unused = 2,
    UsedMeta = 3,
}

impl BlockState {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => BlockState::Free,
            1 => BlockState::UsedData,
            2 => BlockState::Unused,
            _ => BlockState::UsedMeta,
        }
    }
}

/// What a freshly allocated block will hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Dinode,
    Meta,
    Data,
}

/// Space totals across regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounts {
    pub total: u64,
    pub free: u64,
    pub used_data: u64,
    pub used_meta: u64,
    pub used_dinode: u64,
    pub free_meta: u64,
}

impl RegionCounts {
    fn merge(&mut self, other: RegionCounts) {
        self.total += other.total;
        self.free += other.free;
        self.used_data += other.used_data;
        self.used_meta += other.used_meta;
        self.used_dinode += other.used_dinode;
        self.free_meta += other.free_meta;
    }
}

#[derive(Debug)]
struct RegionState {
    bitmap: Vec<u8>,
    free: u32,
    unused: u32,
    used_meta: u32,
    dinodes: u32,
}

/// One allocation region.
#[derive(Debug)]
pub struct RegionDescriptor {
    /// Address of the region header block.
    pub addr: BlockAddr,
    /// Number of header/bitmap blocks.
    pub bitmap_blocks: u32,
    /// First data block.
    pub data0: BlockAddr,
    /// Number of data blocks.
    pub data_len: u32,
    state: Mutex<RegionState>,
}

impl RegionDescriptor {
    pub fn new(addr: BlockAddr, data_len: u32) -> Self {
        let bytes = (data_len as usize).div_ceil(4);
        Self {
            addr,
            bitmap_blocks: 1,
            data0: addr + 1,
            data_len,
            state: Mutex::new(RegionState {
                bitmap: vec![0; bytes],
                free: data_len,
                unused: 0,
                used_meta: 0,
                dinodes: 0,
            }),
        }
    }

    pub fn contains(&self, addr: BlockAddr) -> bool {
        addr >= self.data0 && addr < self.data0 + self.data_len as u64
    }

    fn index(&self, addr: BlockAddr) -> Option<usize> {
        self.contains(addr).then(|| (addr - self.data0) as usize)
    }

    /// State of a data block in this region.
    pub fn block_state(&self, addr: BlockAddr) -> Option<BlockState> {
        let i = self.index(addr)?;
        let state = self.state.lock();
        Some(get_bits(&state.bitmap, i))
    }

    pub fn counts(&self) -> RegionCounts {
        let s = self.state.lock();
        RegionCounts {
            total: self.data_len as u64,
            free: s.free as u64,
            used_data: (self.data_len - s.free - s.unused - s.used_meta) as u64,
            used_meta: s.used_meta as u64,
            used_dinode: s.dinodes as u64,
            free_meta: s.unused as u64,
        }
    }

    /// Blocks available to an allocation of this kind.
    fn available(&self, kind: AllocKind) -> u32 {
        let s = self.state.lock();
        match kind {
            AllocKind::Data => s.free,
            AllocKind::Dinode | AllocKind::Meta => s.free + s.unused,
        }
    }

    /// Encode the region header block.
    pub fn encode(&self) -> Vec<u8> {
        let s = self.state.lock();
        Self::encode_state(&s)
    }

    fn encode_state(s: &RegionState) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(RG_HEADER_SIZE + s.bitmap.len());
        MetaHeader::new(meta_type::RG, 0).encode(&mut enc);
        enc.put_u32(s.free)
            .put_u32(s.dinodes)
            .put_u32(s.unused)
            .put_u32(s.used_meta)
            .put_bytes(&s.bitmap);
        enc.finish()
    }

    /// Resource index entry for this region.
    pub fn encode_rindex_entry(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(RINDEX_ENTRY_SIZE);
        enc.put_u64(self.addr)
            .put_u32(self.bitmap_blocks)
            .put_u32(self.data_len)
            .put_u64(self.data0)
            .put_u32((self.data_len as usize).div_ceil(4) as u32)
            .pad_to(RINDEX_ENTRY_SIZE);
        enc.finish()
    }

    fn set_state(&self, s: &mut RegionState, i: usize, new: BlockState, kind: AllocKind) {
        let old = get_bits(&s.bitmap, i);
        match old {
            BlockState::Free => s.free -= 1,
            BlockState::Unused => s.unused -= 1,
            BlockState::UsedMeta => s.used_meta -= 1,
            BlockState::UsedData => {}
        }
        match new {
            BlockState::Free => s.free += 1,
            BlockState::Unused => s.unused += 1,
            BlockState::UsedMeta => s.used_meta += 1,
            BlockState::UsedData => {}
        }
        match (old, new, kind) {
            (_, BlockState::UsedMeta, AllocKind::Dinode) => s.dinodes += 1,
            (BlockState::UsedMeta, _, AllocKind::Dinode) => s.dinodes -= 1,
            _ => {}
        }
        set_bits(&mut s.bitmap, i, new);
    }

    /// Allocate one block and dirty the header block in `txn`.
    fn alloc(&self, kind: AllocKind, txn: &mut Transaction<'_>) -> Result<BlockAddr> {
        let mut s = self.state.lock();
        let wanted: &[BlockState] = match kind {
            AllocKind::Data => &[BlockState::Free],
            AllocKind::Dinode | AllocKind::Meta => &[BlockState::Unused, BlockState::Free],
        };
        let found = wanted.iter().find_map(|want| {
            (0..self.data_len as usize).find(|&i| get_bits(&s.bitmap, i) == *want)
        });
        let Some(i) = found else {
            return Err(TesseraError::OutOfSpace(format!(
                "region {} has no {:?} block",
                self.addr, kind
            )));
        };
        let new = match kind {
            AllocKind::Data => BlockState::UsedData,
            AllocKind::Dinode | AllocKind::Meta => BlockState::UsedMeta,
        };
        self.set_state(&mut s, i, new, kind);
        txn.mark_dirty(self.addr, Self::encode_state(&s))?;
        Ok(self.data0 + i as u64)
    }

    /// Return a block to the region and dirty the header block in `txn`.
    ///
    /// Data blocks become `Free`; metadata blocks become `Unused`.
    fn free(&self, addr: BlockAddr, kind: AllocKind, txn: &mut Transaction<'_>) -> Result<()> {
        let i = self.index(addr).ok_or_else(|| {
            TesseraError::InternalInconsistency(format!(
                "block {} freed through region {}",
                addr, self.addr
            ))
        })?;
        let mut s = self.state.lock();
        let new = match kind {
            AllocKind::Data => BlockState::Free,
            AllocKind::Dinode | AllocKind::Meta => BlockState::Unused,
        };
        self.set_state(&mut s, i, new, kind);
        txn.mark_dirty(self.addr, Self::encode_state(&s))
    }

    /// Addresses of blocks currently in the `Unused` state.
    fn unused_blocks(&self) -> Vec<BlockAddr> {
        let s = self.state.lock();
        (0..self.data_len as usize)
            .filter(|&i| get_bits(&s.bitmap, i) == BlockState::Unused)
            .map(|i| self.data0 + i as u64)
            .collect()
    }

    /// Mark a block used during format, outside any transaction.
    pub(crate) fn mark_formatted(&self, addr: BlockAddr, kind: AllocKind) -> Result<()> {
        let i = self.index(addr).ok_or_else(|| {
            TesseraError::InternalInconsistency(format!("block {} outside region", addr))
        })?;
        let mut s = self.state.lock();
        let new = match kind {
            AllocKind::Data => BlockState::UsedData,
            AllocKind::Dinode | AllocKind::Meta => BlockState::UsedMeta,
        };
        self.set_state(&mut s, i, new, kind);
        Ok(())
    }
}

fn get_bits(bitmap: &[u8], i: usize) -> BlockState {
    BlockState::from_bits(bitmap[i / 4] >> ((i % 4) * 2))
}

fn set_bits(bitmap: &mut [u8], i: usize, state: BlockState) {
    let shift = (i % 4) * 2;
    bitmap[i / 4] = (bitmap[i / 4] & !(0x3 << shift)) | ((state as u8) << shift);
}

/// Decoded resource index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RindexEntry {
    pub addr: BlockAddr,
    pub bitmap_blocks: u32,
    pub data_len: u32,
    pub data0: BlockAddr,
    pub bitbytes: u32,
}

impl RindexEntry {
    /// Decode every entry in the contents of the resource index.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<RindexEntry>> {
        if bytes.len() % RINDEX_ENTRY_SIZE != 0 {
            return Err(TesseraError::InvalidArgument(format!(
                "rindex length {} is not a multiple of {}",
                bytes.len(),
                RINDEX_ENTRY_SIZE
            )));
        }
        bytes
            .chunks(RINDEX_ENTRY_SIZE)
            .map(|chunk| {
                let mut dec = Decoder::new(chunk);
                Ok(RindexEntry {
                    addr: dec.get_u64()?,
                    bitmap_blocks: dec.get_u32()?,
                    data_len: dec.get_u32()?,
                    data0: dec.get_u64()?,
                    bitbytes: dec.get_u32()?,
                })
            })
            .collect()
    }
}

/// The list of regions.
#[derive(Debug)]
pub struct RegionIndex {
    regions: Vec<Arc<RegionDescriptor>>,
}

impl RegionIndex {
    /// Lay out `count` regions of `blocks` blocks each, starting at `start`.
    pub fn layout(start: BlockAddr, count: u32, blocks: u32) -> Self {
        let regions = (0..count as u64)
            .map(|i| Arc::new(RegionDescriptor::new(start + i * blocks as u64, blocks - 1)))
            .collect();
        Self { regions }
    }

    pub fn regions(&self) -> &[Arc<RegionDescriptor>] {
        &self.regions
    }

    /// One past the last block covered by any region.
    pub fn end(&self) -> BlockAddr {
        self.regions
            .last()
            .map(|r| r.data0 + r.data_len as u64)
            .unwrap_or(0)
    }

    /// The region whose data area covers `addr`.
    pub fn region_for_address(&self, addr: BlockAddr) -> Option<Arc<RegionDescriptor>> {
        self.regions.iter().find(|r| r.contains(addr)).cloned()
    }

    /// Block state of `addr`, or `None` if no region covers it.
    pub fn block_state(&self, addr: BlockAddr) -> Option<BlockState> {
        self.region_for_address(addr)?.block_state(addr)
    }

    /// Contents of the resource index.
    pub fn encode_rindex(&self) -> Vec<u8> {
        self.regions
            .iter()
            .flat_map(|r| r.encode_rindex_entry())
            .collect()
    }

    pub fn stat(&self) -> RegionCounts {
        let mut totals = RegionCounts::default();
        for r in &self.regions {
            totals.merge(r.counts());
        }
        totals
    }

    /// Reserve `blocks` metadata or data blocks in one region.
    ///
    /// Holds the resource index Shared and the chosen region Exclusive until
    /// the reservation is dropped.
    pub async fn reserve(
        &self,
        locks: &Arc<LockManager>,
        holder: LockHolder,
        blocks: u32,
        kind: AllocKind,
    ) -> Result<InplaceReservation> {
        let rindex = locks
            .acquire(LockRequest::new(LockScope::ResourceIndex, LockMode::Shared, holder))
            .await?;

        // First pass only takes uncontended regions.
        for blocking in [false, true] {
            for region in &self.regions {
                if region.available(kind) < blocks {
                    continue;
                }
                let mut flags = LockFlags::default();
                if !blocking {
                    flags = flags.with_try();
                }
                let request = LockRequest::new(LockScope::Region(region.addr), LockMode::Exclusive, holder)
                    .with_flags(flags);
                let guard = match locks.acquire(request).await {
                    Ok(guard) => guard,
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => return Err(e),
                };
                if region.available(kind) < blocks {
                    continue;
                }
                debug!(region = region.addr, blocks, ?kind, "in-place reservation");
                return Ok(InplaceReservation {
                    region: Arc::clone(region),
                    requested: blocks,
                    allocated: 0,
                    _region_lock: guard,
                    _rindex_lock: rindex,
                });
            }
        }

        Err(TesseraError::OutOfSpace(format!(
            "no region has {} free blocks",
            blocks
        )))
    }

    /// Lock every region covering `addrs` for freeing.
    pub async fn lock_for_free(
        &self,
        locks: &Arc<LockManager>,
        holder: LockHolder,
        addrs: &[BlockAddr],
    ) -> Result<RegionLocks> {
        let rindex = locks
            .acquire(LockRequest::new(LockScope::ResourceIndex, LockMode::Shared, holder))
            .await?;

        let mut wanted = BTreeSet::new();
        for addr in addrs {
            let region = self.region_for_address(*addr).ok_or_else(|| {
                TesseraError::InternalInconsistency(format!("block {} outside every region", addr))
            })?;
            wanted.insert(region.addr);
        }

        let mut regions = Vec::with_capacity(wanted.len());
        let mut guards = Vec::with_capacity(wanted.len());
        // Ascending address order keeps multi-region lockers deadlock free.
        for addr in wanted {
            guards.push(
                locks
                    .acquire(LockRequest::new(LockScope::Region(addr), LockMode::Exclusive, holder))
                    .await?,
            );
            if let Some(r) = self.regions.iter().find(|r| r.addr == addr) {
                regions.push(Arc::clone(r));
            }
        }

        Ok(RegionLocks {
            regions,
            _guards: guards,
            _rindex_lock: rindex,
        })
    }

    /// Turn freed metadata blocks back into free blocks.
    ///
    /// Returns `(dinodes, metadata)` reclaimed.
    pub async fn reclaim(
        &self,
        locks: &Arc<LockManager>,
        holder: LockHolder,
        device: &dyn BlockDevice,
        journal: &dyn crate::journal::Journal,
    ) -> Result<(u64, u64)> {
        let _rindex = locks
            .acquire(LockRequest::new(LockScope::ResourceIndex, LockMode::Shared, holder))
            .await?;

        let (mut dinodes, mut metadata) = (0u64, 0u64);
        for region in &self.regions {
            let _guard = locks
                .acquire(LockRequest::new(LockScope::Region(region.addr), LockMode::Exclusive, holder))
                .await?;
            let unused = region.unused_blocks();
            if unused.is_empty() {
                continue;
            }

            for &addr in &unused {
                let block = device.read_block(addr)?;
                let was_dinode = Dinode::decode(&block)
                    .map(|d| d.header.is(meta_type::DI) && d.has_flag(dinode_flags::UNUSED))
                    .unwrap_or(false);
                if was_dinode {
                    dinodes += 1;
                } else {
                    metadata += 1;
                }
            }

            let mut txn = Transaction::begin(journal, 1, 0)?;
            {
                let mut s = region.state.lock();
                for &addr in &unused {
                    let i = (addr - region.data0) as usize;
                    region.set_state(&mut s, i, BlockState::Free, AllocKind::Meta);
                }
                txn.mark_dirty(region.addr, RegionDescriptor::encode_state(&s))?;
            }
            txn.end()?;
        }

        info!(dinodes, metadata, "reclaimed unused metadata");
        Ok((dinodes, metadata))
    }
}

/// An in-place allocation reservation in one region.
///
/// The region stays Exclusive-locked for the reservation's lifetime. Field
/// order releases the region lock before the resource index lock.
pub struct InplaceReservation {
    region: Arc<RegionDescriptor>,
    requested: u32,
    allocated: u32,
    _region_lock: LockGuard,
    _rindex_lock: LockGuard,
}

impl InplaceReservation {
    /// Header/bitmap blocks a transaction must cover for this reservation.
    pub fn bitmap_blocks(&self) -> u32 {
        self.region.bitmap_blocks
    }

    pub fn region_addr(&self) -> BlockAddr {
        self.region.addr
    }

    pub fn remaining(&self) -> u32 {
        self.requested - self.allocated
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Allocate one reserved block.
    pub fn alloc(&mut self, kind: AllocKind, txn: &mut Transaction<'_>) -> Result<BlockAddr> {
        if self.allocated >= self.requested {
            return Err(TesseraError::InternalInconsistency(format!(
                "allocation beyond the {} reserved blocks",
                self.requested
            )));
        }
        let addr = self.region.alloc(kind, txn)?;
        self.allocated += 1;
        Ok(addr)
    }

    /// State of a block inside the reserved region.
    pub fn block_state(&self, addr: BlockAddr) -> Option<BlockState> {
        self.region.block_state(addr)
    }

    /// Free a block in the reserved region.
    pub fn free(&mut self, addr: BlockAddr, kind: AllocKind, txn: &mut Transaction<'_>) -> Result<()> {
        self.region.free(addr, kind, txn)
    }
}

impl std::fmt::Debug for InplaceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InplaceReservation")
            .field("region", &self.region.addr)
            .field("requested", &self.requested)
            .field("allocated", &self.allocated)
            .finish()
    }
}

/// Exclusive locks on the regions covering a set of blocks about to be freed.
pub struct RegionLocks {
    regions: Vec<Arc<RegionDescriptor>>,
    _guards: Vec<LockGuard>,
    _rindex_lock: LockGuard,
}

impl RegionLocks {
    /// Header/bitmap blocks a transaction must cover.
    pub fn bitmap_blocks(&self) -> u32 {
        self.regions.iter().map(|r| r.bitmap_blocks).sum()
    }

    pub fn free(&self, addr: BlockAddr, kind: AllocKind, txn: &mut Transaction<'_>) -> Result<()> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .ok_or_else(|| {
                TesseraError::InternalInconsistency(format!("block {} not covered by held regions", addr))
            })?;
        region.free(addr, kind, txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::counters::MountCounters;
    use crate::disk::MemDevice;
    use crate::journal::MemJournal;

    fn setup() -> (RegionIndex, Arc<LockManager>, MemJournal) {
        let index = RegionIndex::layout(100, 2, 9);
        let locks = LockManager::new(LockConfig::default());
        let dev = Arc::new(MemDevice::new(512, 512, Arc::new(MountCounters::new())));
        let journal = MemJournal::new(dev, 300, 64, 16);
        (index, locks, journal)
    }

    #[test]
    fn test_bitmap_bits() {
        let mut bm = vec![0u8; 2];
        set_bits(&mut bm, 5, BlockState::UsedMeta);
        set_bits(&mut bm, 6, BlockState::Unused);
        assert_eq!(get_bits(&bm, 5), BlockState::UsedMeta);
        assert_eq!(get_bits(&bm, 6), BlockState::Unused);
        assert_eq!(get_bits(&bm, 4), BlockState::Free);
    }

    #[test]
    fn test_region_for_address() {
        let (index, _, _) = setup();
        assert_eq!(index.region_for_address(101).unwrap().addr, 100);
        assert_eq!(index.region_for_address(110).unwrap().addr, 109);
        // Header blocks are not data blocks.
        assert!(index.region_for_address(100).is_none());
        assert!(index.region_for_address(5000).is_none());
        assert_eq!(index.block_state(101), Some(BlockState::Free));
    }

    #[tokio::test]
    async fn test_reserve_alloc_free() {
        let (index, locks, journal) = setup();
        let holder = LockHolder::new(locks.new_owner(), 1);

        let mut res = index.reserve(&locks, holder, 2, AllocKind::Meta).await.unwrap();
        let mut txn = Transaction::begin(&journal, 1 + res.bitmap_blocks(), 0).unwrap();
        let a = res.alloc(AllocKind::Dinode, &mut txn).unwrap();
        let b = res.alloc(AllocKind::Meta, &mut txn).unwrap();
        assert!(matches!(
            res.alloc(AllocKind::Meta, &mut txn),
            Err(TesseraError::InternalInconsistency(_))
        ));
        txn.end().unwrap();

        assert_eq!(index.block_state(a), Some(BlockState::UsedMeta));
        assert_eq!(index.stat().used_dinode, 1);
        assert_eq!(index.stat().used_meta, 2);

        let mut txn = Transaction::begin(&journal, 1, 0).unwrap();
        res.free(a, AllocKind::Dinode, &mut txn).unwrap();
        txn.end().unwrap();
        assert_eq!(index.block_state(a), Some(BlockState::Unused));
        assert_eq!(index.stat().free_meta, 1);

        // A new metadata allocation reuses the unused block first.
        let mut txn = Transaction::begin(&journal, 1, 0).unwrap();
        drop(res);
        let mut res = index.reserve(&locks, holder, 1, AllocKind::Meta).await.unwrap();
        assert_eq!(res.alloc(AllocKind::Dinode, &mut txn).unwrap(), a);
        let _ = b;
    }

    #[tokio::test]
    async fn test_reservation_releases_locks() {
        let (index, locks, _) = setup();
        let holder = LockHolder::new(locks.new_owner(), 1);
        {
            let _res = index.reserve(&locks, holder, 1, AllocKind::Data).await.unwrap();
            assert_eq!(locks.stats().holders, 2);
        }
        assert_eq!(locks.stats().holders, 0);
    }

    #[tokio::test]
    async fn test_reserve_out_of_space() {
        let (index, locks, _) = setup();
        let holder = LockHolder::new(locks.new_owner(), 1);
        let err = index.reserve(&locks, holder, 100, AllocKind::Data).await.unwrap_err();
        assert!(matches!(err, TesseraError::OutOfSpace(_)));
        assert_eq!(locks.stats().holders, 0);
    }

    #[test]
    fn test_rindex_round_trip() {
        let (index, _, _) = setup();
        let entries = RindexEntry::decode_all(&index.encode_rindex()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].addr, 109);
        assert_eq!(entries[1].data0, 110);
        assert_eq!(entries[1].data_len, 8);
    }
}
