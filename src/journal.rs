//! Journal transactions.
//!
//! A [`Transaction`] is a scoped reservation of journal space sized to the
//! blocks a mutation is about to dirty. Sizing is checked in
//! [`Transaction::begin`], before anything is touched; once `begin` succeeds
//! the mutation is committed either by [`Transaction::end`] or, on an early
//! return, by `Drop`. There is no voluntary abort.

use crate::disk::{meta_type, BlockDevice, Encoder, MetaHeader, META_HEADER_SIZE};
use crate::error::{Result, TesseraError};
use crate::observability;
use crate::types::BlockAddr;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Journal space accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub sequence: u64,
    pub commits: u64,
    pub wraps: u64,
    pub free_blocks: u32,
    pub total_blocks: u32,
}

/// The journal engine consumed by transactions.
pub trait Journal: Send + Sync {
    /// Payload bytes per journaled block.
    fn journal_block_size(&self) -> usize;

    /// Largest block count one transaction may reserve.
    fn max_transaction_blocks(&self) -> u32;

    /// Reserve log space for a transaction.
    fn begin(&self, blocks: u32, revokes: u32) -> Result<()>;

    /// Log and write back the dirtied buffers, returning the reservation.
    fn commit(
        &self,
        reserved: u32,
        buffers: &[(BlockAddr, Vec<u8>)],
        revokes: &[BlockAddr],
    ) -> Result<()>;

    fn stats(&self) -> JournalStats;
}

/// A sized, scoped metadata mutation.
pub struct Transaction<'a> {
    journal: &'a dyn Journal,
    reserved_blocks: u32,
    reserved_revokes: u32,
    dirty: Vec<(BlockAddr, Vec<u8>)>,
    revoked: Vec<BlockAddr>,
    slots_used: u32,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Reserve journal space for `blocks` dirtied blocks and `revokes` extra
    /// slots (block revocations and quota-change tags).
    pub fn begin(journal: &'a dyn Journal, blocks: u32, revokes: u32) -> Result<Self> {
        if blocks == 0 {
            return Err(TesseraError::InvalidArgument(
                "transaction must reserve at least one block".to_string(),
            ));
        }
        if blocks > journal.max_transaction_blocks() {
            return Err(TesseraError::OutOfSpace(format!(
                "transaction of {} blocks exceeds capacity {}",
                blocks,
                journal.max_transaction_blocks()
            )));
        }
        journal.begin(blocks, revokes)?;
        debug!(blocks, revokes, "transaction begun");

        Ok(Self {
            journal,
            reserved_blocks: blocks,
            reserved_revokes: revokes,
            dirty: Vec::new(),
            revoked: Vec::new(),
            slots_used: 0,
            finished: false,
        })
    }

    /// Add a block's new contents to the transaction.
    pub fn mark_dirty(&mut self, addr: BlockAddr, data: Vec<u8>) -> Result<()> {
        if let Some(slot) = self.dirty.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 = data;
            return Ok(());
        }
        if self.dirty.len() as u32 >= self.reserved_blocks {
            error!(
                addr,
                reserved = self.reserved_blocks,
                "transaction dirtied more blocks than reserved"
            );
            return Err(TesseraError::InternalInconsistency(format!(
                "block {} exceeds the {} reserved blocks",
                addr, self.reserved_blocks
            )));
        }
        self.dirty.push((addr, data));
        Ok(())
    }

    /// Latest contents of a block already dirtied in this transaction.
    pub fn dirty_block(&self, addr: BlockAddr) -> Option<&[u8]> {
        self.dirty
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, d)| d.as_slice())
    }

    /// Revoke a freed metadata block from the log.
    pub fn revoke(&mut self, addr: BlockAddr) -> Result<()> {
        self.take_slot("revoke")?;
        self.revoked.push(addr);
        self.dirty.retain(|(a, _)| *a != addr);
        Ok(())
    }

    /// Consume one of the extra slots reserved at `begin`.
    pub fn take_slot(&mut self, what: &str) -> Result<()> {
        if self.slots_used >= self.reserved_revokes {
            error!(what, reserved = self.reserved_revokes, "transaction slot overrun");
            return Err(TesseraError::InternalInconsistency(format!(
                "{} exceeds the {} reserved slots",
                what, self.reserved_revokes
            )));
        }
        self.slots_used += 1;
        Ok(())
    }

    pub fn reserved_blocks(&self) -> u32 {
        self.reserved_blocks
    }

    pub fn reserved_revokes(&self) -> u32 {
        self.reserved_revokes
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Commit the transaction.
    pub fn end(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let reserved = self.reserved_blocks;
        self.journal.commit(reserved, &self.dirty, &self.revoked)?;
        observability::record_transaction(self.dirty.len() as u32);
        debug!(
            dirty = self.dirty.len(),
            revoked = self.revoked.len(),
            reserved,
            "transaction committed"
        );
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            error!(error = %e, "transaction commit failed on scope exit");
        }
    }
}

#[derive(Debug)]
struct JournalState {
    head: u32,
    sequence: u64,
    commits: u64,
    wraps: u64,
    free: u32,
}

/// Write-through journal over a region of the block device.
///
/// Every commit writes a log header followed by copies of the dirtied blocks
/// at the log head, then writes the blocks in place.
pub struct MemJournal {
    device: Arc<dyn BlockDevice>,
    start: BlockAddr,
    len: u32,
    max_transaction_blocks: u32,
    state: Mutex<JournalState>,
}

impl MemJournal {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        start: BlockAddr,
        len: u32,
        max_transaction_blocks: u32,
    ) -> Self {
        Self {
            device,
            start,
            len,
            max_transaction_blocks,
            state: Mutex::new(JournalState {
                head: 0,
                sequence: 0,
                commits: 0,
                wraps: 0,
                free: len,
            }),
        }
    }

    fn log_addr(&self, state: &mut JournalState) -> BlockAddr {
        let addr = self.start + state.head as u64;
        state.head += 1;
        if state.head >= self.len {
            state.head = 0;
            state.wraps += 1;
        }
        addr
    }
}

impl Journal for MemJournal {
    fn journal_block_size(&self) -> usize {
        self.device.block_size() - META_HEADER_SIZE
    }

    fn max_transaction_blocks(&self) -> u32 {
        self.max_transaction_blocks
    }

    fn begin(&self, blocks: u32, _revokes: u32) -> Result<()> {
        let needed = blocks + 1;
        let mut state = self.state.lock();
        if state.free < needed {
            return Err(TesseraError::OutOfSpace(format!(
                "journal has {} free blocks, transaction needs {}",
                state.free, needed
            )));
        }
        state.free -= needed;
        Ok(())
    }

    fn commit(
        &self,
        reserved: u32,
        buffers: &[(BlockAddr, Vec<u8>)],
        revokes: &[BlockAddr],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.sequence += 1;

        let mut header = Encoder::with_capacity(self.device.block_size());
        MetaHeader::new(meta_type::LH, 0).encode(&mut header);
        header
            .put_u64(state.sequence)
            .put_u32(buffers.len() as u32)
            .put_u32(revokes.len() as u32);
        let room = (self.device.block_size() - header.len()) / 8;
        for addr in buffers
            .iter()
            .map(|(a, _)| *a)
            .chain(revokes.iter().copied())
            .take(room)
        {
            header.put_u64(addr);
        }
        let lh_addr = self.log_addr(&mut state);
        let result = (|| -> Result<()> {
            self.device.write_block(lh_addr, &header.finish())?;
            for (_, data) in buffers {
                let addr = self.log_addr(&mut state);
                self.device.write_block(addr, data)?;
            }
            for (addr, data) in buffers {
                self.device.write_block(*addr, data)?;
            }
            Ok(())
        })();

        state.commits += 1;
        state.free = (state.free + reserved + 1).min(self.len);
        result
    }

    fn stats(&self) -> JournalStats {
        let state = self.state.lock();
        JournalStats {
            sequence: state.sequence,
            commits: state.commits,
            wraps: state.wraps,
            free_blocks: state.free,
            total_blocks: self.len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MountCounters;
    use crate::disk::MemDevice;

    fn journal(len: u32, max: u32) -> (Arc<MemDevice>, MemJournal) {
        let dev = Arc::new(MemDevice::new(512, 256, Arc::new(MountCounters::new())));
        let j = MemJournal::new(dev.clone(), 200, len, max);
        (dev, j)
    }

    #[test]
    fn test_begin_validates_size() {
        let (_, j) = journal(32, 8);
        assert!(matches!(
            Transaction::begin(&j, 0, 0),
            Err(TesseraError::InvalidArgument(_))
        ));
        assert!(matches!(
            Transaction::begin(&j, 9, 0),
            Err(TesseraError::OutOfSpace(_))
        ));
        // Nothing was reserved by the rejected calls.
        assert_eq!(j.stats().free_blocks, 32);
    }

    #[test]
    fn test_commit_writes_through() {
        let (dev, j) = journal(32, 8);
        let mut txn = Transaction::begin(&j, 2, 0).unwrap();
        txn.mark_dirty(10, vec![1; 512]).unwrap();
        txn.mark_dirty(11, vec![2; 512]).unwrap();
        // Re-dirtying the same block does not consume a slot.
        txn.mark_dirty(10, vec![3; 512]).unwrap();
        assert_eq!(txn.dirty_block(10).unwrap()[0], 3);
        txn.end().unwrap();

        assert_eq!(dev.read_block(10).unwrap()[0], 3);
        assert_eq!(dev.read_block(11).unwrap()[0], 2);
        let lh = MetaHeader::peek(&dev.read_block(200).unwrap()).unwrap();
        assert!(lh.is(meta_type::LH));

        let stats = j.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.free_blocks, 32);
    }

    #[test]
    fn test_overrun_is_inconsistency() {
        let (_, j) = journal(32, 8);
        let mut txn = Transaction::begin(&j, 1, 0).unwrap();
        txn.mark_dirty(1, vec![0; 4]).unwrap();
        assert!(matches!(
            txn.mark_dirty(2, vec![0; 4]),
            Err(TesseraError::InternalInconsistency(_))
        ));
        assert!(matches!(
            txn.take_slot("quota change"),
            Err(TesseraError::InternalInconsistency(_))
        ));
    }

    #[test]
    fn test_drop_commits() {
        let (dev, j) = journal(32, 8);
        {
            let mut txn = Transaction::begin(&j, 1, 1).unwrap();
            txn.mark_dirty(5, vec![9; 512]).unwrap();
            txn.take_slot("quota change").unwrap();
        }
        assert_eq!(dev.read_block(5).unwrap()[0], 9);
        assert_eq!(j.stats().commits, 1);
    }

    #[test]
    fn test_log_wraps() {
        let (_, j) = journal(4, 2);
        for i in 0..3 {
            let mut txn = Transaction::begin(&j, 1, 0).unwrap();
            txn.mark_dirty(i, vec![0; 8]).unwrap();
            txn.end().unwrap();
        }
        let stats = j.stats();
        assert_eq!(stats.sequence, 3);
        assert!(stats.wraps >= 1);
    }

    #[test]
    fn test_log_space_exhausted() {
        let (_, j) = journal(4, 4);
        let _held = Transaction::begin(&j, 2, 0).unwrap();
        assert!(matches!(
            Transaction::begin(&j, 2, 0),
            Err(TesseraError::OutOfSpace(_))
        ));
    }
}
