//! Extended-attribute store.
//!
//! Attributes of one object are kept as a chain of EA blocks starting at
//! `dinode.eattr`. Each block holds a meta header, the address of the next
//! block (0 at the end of the chain) and packed records:
//!
//! ```text
//! +-------------+---------+--------------------------------------+
//! | meta header | next    | record | record | ...                |
//! | 16 bytes    | 8 bytes |                                      |
//! +-------------+---------+--------------------------------------+
//!
//! record: rec_len u32 | type u8 | name_len u8 | pad u16 |
//!         data_len u32 | reserved u32 | name | data | pad to 8
//! ```
//!
//! Mutations are staged in memory ([`EaStore::set`], [`EaStore::remove`])
//! and written with [`EaStore::save`] inside an open transaction. Size is
//! checked by [`EaStore::check_size`] before anything is staged.

use crate::disk::{meta_type, BlockDevice, Decoder, Encoder, MetaHeader, META_HEADER_SIZE};
use crate::error::{Result, TesseraError};
use crate::journal::Transaction;
use crate::region::{AllocKind, InplaceReservation};
use crate::types::BlockAddr;
use tracing::debug;

/// Largest attribute value accepted.
pub const EA_MAX_DATA_LEN: usize = 65536;

/// Longest attribute name.
pub const EA_MAX_NAME_LEN: usize = 255;

const EA_BLOCK_HEADER: usize = META_HEADER_SIZE + 8;
const EA_RECORD_HEADER: usize = 16;

/// Attribute namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EaType {
    User = 1,
    System = 2,
    Security = 3,
}

impl EaType {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(EaType::User),
            2 => Ok(EaType::System),
            3 => Ok(EaType::Security),
            other => Err(TesseraError::InternalInconsistency(format!(
                "unknown attribute type {}",
                other
            ))),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            EaType::User => "user",
            EaType::System => "system",
            EaType::Security => "security",
        }
    }

    /// Split `"system.posix_acl_access"` into its type and short name.
    pub fn split(full: &str) -> Result<(EaType, &str)> {
        let (prefix, name) = full.split_once('.').ok_or_else(|| {
            TesseraError::InvalidArgument(format!("attribute name {:?} has no namespace", full))
        })?;
        let ty = match prefix {
            "user" => EaType::User,
            "system" => EaType::System,
            "security" => EaType::Security,
            _ => {
                return Err(TesseraError::Unsupported(format!(
                    "attribute namespace {:?}",
                    prefix
                )))
            }
        };
        if name.is_empty() {
            return Err(TesseraError::InvalidArgument("empty attribute name".to_string()));
        }
        Ok((ty, name))
    }
}

/// One stored attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EaRecord {
    pub ea_type: EaType,
    pub name: String,
    pub data: Vec<u8>,
}

impl EaRecord {
    fn encoded_len(&self) -> usize {
        record_len(self.name.len(), self.data.len())
    }
}

fn record_len(name_len: usize, data_len: usize) -> usize {
    (EA_RECORD_HEADER + name_len + data_len).div_ceil(8) * 8
}

/// Where an attribute was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EaLocation {
    /// Block holding the record, 0 if the store has not been written yet.
    pub block: BlockAddr,
    /// Position of the record in the store.
    pub index: usize,
}

/// The attribute set of one object.
#[derive(Debug, Clone)]
pub struct EaStore {
    block_size: usize,
    records: Vec<EaRecord>,
    chain: Vec<BlockAddr>,
}

impl EaStore {
    pub fn empty(block_size: usize) -> Self {
        Self {
            block_size,
            records: Vec::new(),
            chain: Vec::new(),
        }
    }

    /// Bytes of records one EA block can hold.
    pub fn block_capacity(block_size: usize) -> usize {
        block_size - EA_BLOCK_HEADER
    }

    /// Read the chain starting at `first`. A zero address is an empty store.
    pub fn load(device: &dyn BlockDevice, first: BlockAddr) -> Result<Self> {
        let mut store = Self::empty(device.block_size());
        let mut next = first;
        while next != 0 {
            if store.chain.contains(&next) {
                return Err(TesseraError::InternalInconsistency(format!(
                    "attribute chain loops at block {}",
                    next
                )));
            }
            let block = device.read_block(next)?;
            let mut dec = Decoder::new(&block);
            let header = MetaHeader::decode(&mut dec)?;
            if !header.is(meta_type::EA) {
                return Err(TesseraError::InternalInconsistency(format!(
                    "block {} in attribute chain is not an EA block",
                    next
                )));
            }
            store.chain.push(next);
            next = dec.get_u64()?;
            Self::parse_records(&block[EA_BLOCK_HEADER..], &mut store.records)?;
        }
        Ok(store)
    }

    fn parse_records(mut buf: &[u8], out: &mut Vec<EaRecord>) -> Result<()> {
        while buf.len() >= EA_RECORD_HEADER {
            let mut dec = Decoder::new(buf);
            let rec_len = dec.get_u32()? as usize;
            if rec_len == 0 {
                break;
            }
            let ty = dec.get_bytes(1)?[0];
            let name_len = dec.get_bytes(1)?[0] as usize;
            dec.skip(2)?;
            let data_len = dec.get_u32()? as usize;
            dec.skip(4)?;
            let name = String::from_utf8_lossy(dec.get_bytes(name_len)?).into_owned();
            let data = dec.get_bytes(data_len)?.to_vec();
            if rec_len < record_len(name_len, data_len) || rec_len > buf.len() {
                return Err(TesseraError::InternalInconsistency(format!(
                    "corrupt attribute record {:?}",
                    name
                )));
            }
            out.push(EaRecord {
                ea_type: EaType::from_code(ty)?,
                name,
                data,
            });
            buf = &buf[rec_len..];
        }
        Ok(())
    }

    pub fn records(&self) -> &[EaRecord] {
        &self.records
    }

    /// Blocks currently backing the store.
    pub fn chain(&self) -> &[BlockAddr] {
        &self.chain
    }

    pub fn first_block(&self) -> BlockAddr {
        self.chain.first().copied().unwrap_or(0)
    }

    /// Records grouped into blocks in storage order.
    fn pack(&self) -> Vec<Vec<usize>> {
        let capacity = Self::block_capacity(self.block_size);
        let mut blocks: Vec<Vec<usize>> = Vec::new();
        let mut used = capacity;
        for (i, rec) in self.records.iter().enumerate() {
            let len = rec.encoded_len();
            if used + len > capacity {
                blocks.push(Vec::new());
                used = 0;
            }
            if let Some(last) = blocks.last_mut() {
                last.push(i);
            }
            used += len;
        }
        blocks
    }

    pub fn find(&self, ea_type: EaType, name: &str) -> Option<EaLocation> {
        let index = self
            .records
            .iter()
            .position(|r| r.ea_type == ea_type && r.name == name)?;
        let block = self
            .pack()
            .iter()
            .position(|b| b.contains(&index))
            .and_then(|n| self.chain.get(n).copied())
            .unwrap_or(0);
        Some(EaLocation { block, index })
    }

    /// Copy out a record's value.
    pub fn get_copy(&self, location: EaLocation) -> Result<Vec<u8>> {
        let rec = self.records.get(location.index).ok_or_else(|| {
            TesseraError::NotFound(format!("attribute slot {}", location.index))
        })?;
        let mut out = Vec::new();
        out.try_reserve_exact(rec.data.len())?;
        out.extend_from_slice(&rec.data);
        Ok(out)
    }

    pub fn get(&self, ea_type: EaType, name: &str) -> Result<Option<Vec<u8>>> {
        match self.find(ea_type, name) {
            Some(loc) => self.get_copy(loc).map(Some),
            None => Ok(None),
        }
    }

    /// Reject a set of `data_len` bytes under `name` that could not be
    /// written within one transaction of `max_transaction_blocks`.
    ///
    /// Leaves the store untouched.
    pub fn check_size(
        &self,
        ea_type: EaType,
        name: &str,
        data_len: usize,
        max_transaction_blocks: u32,
    ) -> Result<()> {
        if name.is_empty() || name.len() > EA_MAX_NAME_LEN {
            return Err(TesseraError::InvalidArgument(format!(
                "attribute name length {}",
                name.len()
            )));
        }
        if data_len > EA_MAX_DATA_LEN {
            return Err(TesseraError::OutOfSpace(format!(
                "attribute value of {} bytes exceeds {}",
                data_len, EA_MAX_DATA_LEN
            )));
        }
        let rec_len = record_len(name.len(), data_len);
        let capacity = Self::block_capacity(self.block_size);
        if rec_len > capacity {
            return Err(TesseraError::OutOfSpace(format!(
                "attribute record of {} bytes exceeds the {} byte block",
                rec_len, capacity
            )));
        }
        let (blocks, new_blocks) = self.blocks_for_set(ea_type, name, data_len);
        let needed = Self::transaction_blocks(blocks, new_blocks);
        if needed > max_transaction_blocks {
            return Err(TesseraError::OutOfSpace(format!(
                "attribute set needs {} journal blocks, capacity is {}",
                needed, max_transaction_blocks
            )));
        }
        Ok(())
    }

    /// Chain length after setting `name`, and how many of those blocks are
    /// new.
    pub fn blocks_for_set(&self, ea_type: EaType, name: &str, data_len: usize) -> (u32, u32) {
        let mut staged = self.clone();
        staged.stage(ea_type, name, vec![0; data_len]);
        let blocks = staged.pack().len() as u32;
        let new_blocks = blocks.saturating_sub(self.chain.len() as u32);
        (blocks.max(self.chain.len() as u32), new_blocks)
    }

    /// Journal blocks for rewriting `chain_blocks` EA blocks plus the dinode,
    /// and the region header when `new_blocks` are allocated.
    pub fn transaction_blocks(chain_blocks: u32, new_blocks: u32) -> u32 {
        1 + chain_blocks + u32::from(new_blocks > 0)
    }

    fn stage(&mut self, ea_type: EaType, name: &str, data: Vec<u8>) {
        match self
            .records
            .iter_mut()
            .find(|r| r.ea_type == ea_type && r.name == name)
        {
            Some(rec) => rec.data = data,
            None => self.records.push(EaRecord {
                ea_type,
                name: name.to_string(),
                data,
            }),
        }
    }

    /// Create or replace an attribute. Call [`EaStore::check_size`] first.
    pub fn set(&mut self, ea_type: EaType, name: &str, data: &[u8]) -> Result<()> {
        let mut owned = Vec::new();
        owned.try_reserve_exact(data.len())?;
        owned.extend_from_slice(data);
        self.stage(ea_type, name, owned);
        Ok(())
    }

    /// Remove an attribute; returns whether it existed.
    pub fn remove(&mut self, ea_type: EaType, name: &str) -> bool {
        let before = self.records.len();
        self.records
            .retain(|r| !(r.ea_type == ea_type && r.name == name));
        self.records.len() != before
    }

    /// Blocks the next [`EaStore::save`] will have to allocate.
    pub fn new_blocks_needed(&self) -> u32 {
        (self.pack().len() as u32).saturating_sub(self.chain.len() as u32)
    }

    /// Write the store into `txn`, allocating any extra chain blocks from
    /// `alloc`. Returns the first block of the chain (0 if empty).
    ///
    /// Blocks are never released here; an emptied block stays in the chain
    /// until the object itself is deallocated.
    pub fn save(
        &mut self,
        device: &dyn BlockDevice,
        txn: &mut Transaction<'_>,
        mut alloc: Option<&mut InplaceReservation>,
    ) -> Result<BlockAddr> {
        let packed = self.pack();
        while self.chain.len() < packed.len() {
            let res = alloc.as_deref_mut().ok_or_else(|| {
                TesseraError::InternalInconsistency(
                    "attribute chain grew without an allocation reservation".to_string(),
                )
            })?;
            let addr = res.alloc(AllocKind::Meta, txn)?;
            debug!(addr, "attribute block allocated");
            self.chain.push(addr);
        }

        for (n, &addr) in self.chain.iter().enumerate() {
            let next = self.chain.get(n + 1).copied().unwrap_or(0);
            let previous = match txn.dirty_block(addr) {
                Some(block) => MetaHeader::carried_incarnation(block),
                None => MetaHeader::carried_incarnation(&device.read_block(addr)?),
            };
            let mut enc = Encoder::with_capacity(self.block_size);
            MetaHeader::new(meta_type::EA, previous).encode(&mut enc);
            enc.put_u64(next);
            for &i in packed.get(n).map(|v| v.as_slice()).unwrap_or(&[]) {
                let rec = &self.records[i];
                let start = enc.len();
                enc.put_u32(rec.encoded_len() as u32)
                    .put_bytes(&[rec.ea_type as u8, rec.name.len() as u8])
                    .put_u16(0)
                    .put_u32(rec.data.len() as u32)
                    .put_u32(0)
                    .put_bytes(rec.name.as_bytes())
                    .put_bytes(&rec.data)
                    .pad_to(start + rec.encoded_len());
            }
            txn.mark_dirty(addr, enc.finish())?;
        }
        Ok(self.first_block())
    }
}
