//! On-disk structures and the block device seam.
//!
//! All multi-byte fields are big-endian. Every metadata block starts with a
//! [`MetaHeader`] carrying the filesystem magic, the block's metadata type
//! and an incarnation counter. For dinode blocks the incarnation is the
//! object's generation.

use crate::counters::MountCounters;
use crate::error::{Result, TesseraError};
use crate::types::{BlockAddr, FileType, FormalId, ObjectIdentity};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const MAGIC: u32 = 0x0116_1970;

/// Address of the superblock.
pub const SB_ADDR: BlockAddr = 16;

pub const META_HEADER_SIZE: usize = 16;
pub const DINODE_SIZE: usize = 128;
pub const SUPERBLOCK_SIZE: usize = 240;

pub const FS_FORMAT: u32 = 1309;
pub const MULTIHOST_FORMAT: u32 = 1401;

/// Metadata block types.
pub mod meta_type {
    pub const SB: u32 = 1;
    pub const RG: u32 = 2;
    pub const RB: u32 = 3;
    pub const DI: u32 = 4;
    pub const IN: u32 = 5;
    pub const LF: u32 = 6;
    pub const JD: u32 = 7;
    pub const LH: u32 = 8;
    pub const LD: u32 = 9;
    pub const EA: u32 = 10;
    pub const ED: u32 = 11;
}

/// Big-endian field writer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Fixed-width, zero-padded string field.
    pub fn put_str(&mut self, s: &str, width: usize) -> &mut Self {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (width - n), 0);
        self
    }

    pub fn pad_to(&mut self, len: usize) -> &mut Self {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian field reader over a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(TesseraError::InvalidArgument(format!(
                "short buffer: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_str(&mut self, width: usize) -> Result<String> {
        let b = self.take(width)?;
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Header at the start of every metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    pub magic: u32,
    pub mh_type: u32,
    pub format: u32,
    pub incarnation: u32,
}

impl MetaHeader {
    pub fn new(mh_type: u32, incarnation: u32) -> Self {
        Self {
            magic: MAGIC,
            mh_type,
            format: FS_FORMAT,
            incarnation,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.magic)
            .put_u32(self.mh_type)
            .put_u32(self.format)
            .put_u32(self.incarnation);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            magic: dec.get_u32()?,
            mh_type: dec.get_u32()?,
            format: dec.get_u32()?,
            incarnation: dec.get_u32()?,
        })
    }

    /// Read just the header of a block.
    pub fn peek(block: &[u8]) -> Result<Self> {
        Self::decode(&mut Decoder::new(block))
    }

    pub fn is(&self, mh_type: u32) -> bool {
        self.magic == MAGIC && self.mh_type == mh_type
    }

    /// Incarnation left in `block` by whatever metadata last lived there,
    /// or 0 for a never-written block.
    ///
    /// Every metadata rewrite carries this forward, so a dinode placed on a
    /// reused block always gets a generation above any earlier one.
    pub fn carried_incarnation(block: &[u8]) -> u32 {
        Self::peek(block)
            .ok()
            .filter(|h| h.magic == MAGIC)
            .map(|h| h.incarnation)
            .unwrap_or(0)
    }
}

/// On-disk object metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dinode {
    pub header: MetaHeader,
    pub formal_id: FormalId,
    pub addr: BlockAddr,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    pub file_type: u16,
    pub height: u16,
    pub eattr: BlockAddr,
}

impl Dinode {
    pub fn new(addr: BlockAddr, incarnation: u32, file_type: FileType, mode: u32) -> Self {
        let now = now_secs();
        Self {
            header: MetaHeader::new(meta_type::DI, incarnation),
            formal_id: addr,
            addr,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            nlink: 1,
            size: 0,
            blocks: 1,
            atime: now,
            mtime: now,
            ctime: now,
            flags: 0,
            file_type: file_type.code(),
            height: 0,
            eattr: 0,
        }
    }

    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity::new(self.formal_id, self.header.incarnation)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_code(self.file_type).unwrap_or(FileType::None)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Full mode including the file-type bits.
    pub fn full_mode(&self) -> u32 {
        self.file_type().to_mode() | (self.mode & 0o7777)
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = now_secs();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(DINODE_SIZE);
        self.header.encode(&mut enc);
        enc.put_u64(self.formal_id)
            .put_u64(self.addr)
            .put_u32(self.mode)
            .put_u32(self.uid)
            .put_u32(self.gid)
            .put_u32(self.nlink)
            .put_u64(self.size)
            .put_u64(self.blocks)
            .put_i64(self.atime)
            .put_i64(self.mtime)
            .put_i64(self.ctime)
            .put_u32(self.flags)
            .put_u16(self.file_type)
            .put_u16(self.height)
            .put_u64(self.eattr)
            .pad_to(DINODE_SIZE);
        enc.finish()
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(block);
        let header = MetaHeader::decode(&mut dec)?;
        Ok(Self {
            header,
            formal_id: dec.get_u64()?,
            addr: dec.get_u64()?,
            mode: dec.get_u32()?,
            uid: dec.get_u32()?,
            gid: dec.get_u32()?,
            nlink: dec.get_u32()?,
            size: dec.get_u64()?,
            blocks: dec.get_u64()?,
            atime: dec.get_i64()?,
            mtime: dec.get_i64()?,
            ctime: dec.get_i64()?,
            flags: dec.get_u32()?,
            file_type: dec.get_u16()?,
            height: dec.get_u16()?,
            eattr: dec.get_u64()?,
        })
    }
}

/// Identity slot as stored in the superblock.
fn put_identity(enc: &mut Encoder, id: ObjectIdentity) {
    enc.put_u64(id.formal_id).put_u32(id.generation).put_u32(0);
}

fn get_identity(dec: &mut Decoder<'_>) -> Result<ObjectIdentity> {
    let formal_id = dec.get_u64()?;
    let generation = dec.get_u32()?;
    dec.skip(4)?;
    Ok(ObjectIdentity::new(formal_id, generation))
}

/// The superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub header: MetaHeader,
    pub fs_format: u32,
    pub multihost_format: u32,
    pub block_size: u32,
    pub block_size_shift: u32,
    pub jindex: ObjectIdentity,
    pub rindex: ObjectIdentity,
    pub root_dir: ObjectIdentity,
    pub quota: ObjectIdentity,
    pub license: ObjectIdentity,
    pub lockproto: String,
    pub locktable: String,
}

impl Superblock {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(SUPERBLOCK_SIZE);
        self.header.encode(&mut enc);
        enc.put_u32(self.fs_format)
            .put_u32(self.multihost_format)
            .put_u32(self.block_size)
            .put_u32(self.block_size_shift);
        for id in [self.jindex, self.rindex, self.root_dir, self.quota, self.license] {
            put_identity(&mut enc, id);
        }
        enc.put_str(&self.lockproto, 64)
            .put_str(&self.locktable, 64)
            .pad_to(SUPERBLOCK_SIZE);
        enc.finish()
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(block);
        let header = MetaHeader::decode(&mut dec)?;
        if !header.is(meta_type::SB) {
            return Err(TesseraError::InternalInconsistency(
                "superblock header mismatch".to_string(),
            ));
        }
        Ok(Self {
            header,
            fs_format: dec.get_u32()?,
            multihost_format: dec.get_u32()?,
            block_size: dec.get_u32()?,
            block_size_shift: dec.get_u32()?,
            jindex: get_identity(&mut dec)?,
            rindex: get_identity(&mut dec)?,
            root_dir: get_identity(&mut dec)?,
            quota: get_identity(&mut dec)?,
            license: get_identity(&mut dec)?,
            lockproto: dec.get_str(64)?,
            locktable: dec.get_str(64)?,
        })
    }
}

/// Block storage consumed by the metadata layer.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Read one whole block.
    fn read_block(&self, addr: BlockAddr) -> Result<Vec<u8>>;

    /// Write a block; short buffers are zero-padded.
    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;
}

/// In-memory block device. Unwritten blocks read as zeroes.
pub struct MemDevice {
    block_size: usize,
    block_count: u64,
    blocks: RwLock<HashMap<BlockAddr, Vec<u8>>>,
    counters: Arc<MountCounters>,
}

impl MemDevice {
    pub fn new(block_size: usize, block_count: u64, counters: Arc<MountCounters>) -> Self {
        Self {
            block_size,
            block_count,
            blocks: RwLock::new(HashMap::new()),
            counters,
        }
    }

    fn check(&self, addr: BlockAddr) -> Result<()> {
        if addr >= self.block_count {
            return Err(TesseraError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block {} beyond device end {}", addr, self.block_count),
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, addr: BlockAddr) -> Result<Vec<u8>> {
        self.check(addr)?;
        self.counters.bio_reads.inc();
        Ok(self
            .blocks
            .read()
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| vec![0; self.block_size]))
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        self.check(addr)?;
        if data.len() > self.block_size {
            return Err(TesseraError::InternalInconsistency(format!(
                "{} byte write to block {} exceeds block size {}",
                data.len(),
                addr,
                self.block_size
            )));
        }
        self.counters.bio_writes.inc();
        let mut block = data.to_vec();
        block.resize(self.block_size, 0);
        self.blocks.write().insert(addr, block);
        Ok(())
    }
}

pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}
