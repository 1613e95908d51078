//! Quota accounting for Tessera.
//!
//! Quota records live in the hidden quota object, one 88-byte record per
//! user and group id. This module keeps the in-core view: cached records,
//! changes not yet written back, and the per-request [`QuotaHold`]. Writing
//! back and re-reading records goes through the privileged I/O path (see
//! [`crate::mount::Mount::quota_sync`]).

use crate::disk::{Decoder, Encoder};
use crate::error::{Result, TesseraError};
use crate::journal::Transaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Size of one quota record in the quota object.
pub const QUOTA_RECORD_SIZE: usize = 88;

/// A user or group quota id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaId {
    User(u32),
    Group(u32),
}

impl QuotaId {
    /// Parse `u:ID` or `g:ID`.
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s.split_once(':').ok_or_else(|| {
            TesseraError::InvalidArgument(format!("bad quota id {:?}", s))
        })?;
        let id: u32 = id
            .parse()
            .map_err(|_| TesseraError::InvalidArgument(format!("bad quota id {:?}", s)))?;
        match kind {
            "u" => Ok(QuotaId::User(id)),
            "g" => Ok(QuotaId::Group(id)),
            _ => Err(TesseraError::InvalidArgument(format!(
                "bad quota type {:?}",
                kind
            ))),
        }
    }

    /// Byte offset of this id's record in the quota object.
    pub fn file_offset(&self) -> u64 {
        let slot = match *self {
            QuotaId::User(id) => 2 * id as u64,
            QuotaId::Group(id) => 2 * id as u64 + 1,
        };
        slot * QUOTA_RECORD_SIZE as u64
    }

    /// The ids charged for an object owned by `uid`/`gid`.
    pub fn owner_ids(uid: u32, gid: u32) -> [QuotaId; 2] {
        [QuotaId::User(uid), QuotaId::Group(gid)]
    }
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaId::User(id) => write!(f, "u:{}", id),
            QuotaId::Group(id) => write!(f, "g:{}", id),
        }
    }
}

impl FromStr for QuotaId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One record of the quota object. Limits and value count blocks; a zero
/// limit means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub limit: u64,
    pub warn: u64,
    pub value: i64,
}

impl QuotaRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(QUOTA_RECORD_SIZE);
        enc.put_u64(self.limit)
            .put_u64(self.warn)
            .put_i64(self.value)
            .pad_to(QUOTA_RECORD_SIZE);
        enc.finish()
    }

    /// Decode a record; a short or empty buffer (a hole) reads as zeroes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < QUOTA_RECORD_SIZE {
            let mut padded = bytes.to_vec();
            padded.resize(QUOTA_RECORD_SIZE, 0);
            return Self::decode(&padded);
        }
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            limit: dec.get_u64()?,
            warn: dec.get_u64()?,
            value: dec.get_i64()?,
        })
    }
}

#[derive(Debug, Default)]
struct QuotaEntry {
    record: Option<QuotaRecord>,
    pending: i64,
    holds: u32,
}

/// In-core quota state of one mount.
#[derive(Debug, Default)]
pub struct QuotaManager {
    entries: Mutex<HashMap<QuotaId, QuotaEntry>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the entries for `ids` for the duration of a request.
    pub fn hold(&self, ids: &[QuotaId]) -> QuotaHold<'_> {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.entry(*id).or_default().holds += 1;
        }
        QuotaHold {
            manager: self,
            ids: ids.to_vec(),
        }
    }

    /// Fail with `QuotaExceeded` if charging `blocks` to any of `ids` would
    /// pass its limit.
    pub fn check(&self, ids: &[QuotaId], blocks: u64) -> Result<()> {
        let entries = self.entries.lock();
        for id in ids {
            let Some(entry) = entries.get(id) else { continue };
            let Some(record) = entry.record else { continue };
            if record.limit == 0 {
                continue;
            }
            let after = record.value + entry.pending + blocks as i64;
            if after > record.limit as i64 {
                warn!(%id, after, limit = record.limit, "quota exceeded");
                return Err(TesseraError::QuotaExceeded(format!(
                    "{} would use {} of {} blocks",
                    id, after, record.limit
                )));
            }
        }
        Ok(())
    }

    /// Cached record with pending changes applied.
    pub fn cached(&self, id: QuotaId) -> Option<QuotaRecord> {
        let entries = self.entries.lock();
        let entry = entries.get(&id)?;
        entry.record.map(|mut r| {
            r.value += entry.pending;
            r
        })
    }

    /// Replace the cached record with one read from the quota object.
    pub fn refresh(&self, id: QuotaId, record: QuotaRecord) {
        self.entries.lock().entry(id).or_default().record = Some(record);
        debug!(%id, ?record, "quota refreshed");
    }

    /// Changes not yet written to the quota object.
    pub fn pending(&self) -> Vec<(QuotaId, i64)> {
        let mut pending: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.pending != 0)
            .map(|(id, e)| (*id, e.pending))
            .collect();
        pending.sort_by_key(|(id, _)| id.file_offset());
        pending
    }

    /// Record that `delta` was written back for `id`.
    pub fn synced(&self, id: QuotaId, delta: i64, record: QuotaRecord) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(id).or_default();
        entry.pending -= delta;
        entry.record = Some(record);
    }

    /// Drop entries that are neither held nor carrying changes.
    pub fn shrink(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.holds > 0 || e.pending != 0);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_pending(&self, ids: &[QuotaId], delta: i64) {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.entry(*id).or_default().pending += delta;
        }
    }

    fn unhold(&self, ids: &[QuotaId]) {
        let mut entries = self.entries.lock();
        for id in ids {
            if let Some(entry) = entries.get_mut(id) {
                entry.holds = entry.holds.saturating_sub(1);
            }
        }
    }
}

/// Quota entries pinned for one request. Released on drop.
#[derive(Debug)]
pub struct QuotaHold<'a> {
    manager: &'a QuotaManager,
    ids: Vec<QuotaId>,
}

impl QuotaHold<'_> {
    pub fn ids(&self) -> &[QuotaId] {
        &self.ids
    }

    pub fn check(&self, blocks: u64) -> Result<()> {
        self.manager.check(&self.ids, blocks)
    }

    /// Charge `delta` blocks to every held id inside `txn`.
    ///
    /// Uses one of the transaction's extra slots for the quota-change tag.
    pub fn change(&self, txn: &mut Transaction<'_>, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        txn.take_slot("quota change")?;
        self.manager.add_pending(&self.ids, delta);
        Ok(())
    }
}

impl Drop for QuotaHold<'_> {
    fn drop(&mut self) {
        self.manager.unhold(&self.ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MountCounters;
    use crate::disk::MemDevice;
    use crate::journal::MemJournal;
    use std::sync::Arc;

    #[test]
    fn test_parse() {
        assert_eq!(QuotaId::parse("u:100").unwrap(), QuotaId::User(100));
        assert_eq!("g:7".parse::<QuotaId>().unwrap(), QuotaId::Group(7));
        assert!(QuotaId::parse("x:1").is_err());
        assert!(QuotaId::parse("u:").is_err());
        assert!(QuotaId::parse("100").is_err());
        assert_eq!(QuotaId::Group(3).to_string(), "g:3");
    }

    #[test]
    fn test_file_offset() {
        assert_eq!(QuotaId::User(0).file_offset(), 0);
        assert_eq!(QuotaId::Group(0).file_offset(), 88);
        assert_eq!(QuotaId::User(2).file_offset(), 4 * 88);
    }

    #[test]
    fn test_record_encoding() {
        let rec = QuotaRecord {
            limit: 100,
            warn: 80,
            value: -3,
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), QUOTA_RECORD_SIZE);
        assert_eq!(QuotaRecord::decode(&bytes).unwrap(), rec);
        assert_eq!(QuotaRecord::decode(&[]).unwrap(), QuotaRecord::default());
    }

    #[test]
    fn test_check_limits() {
        let qm = QuotaManager::new();
        let ids = QuotaId::owner_ids(5, 5);
        // Unknown ids are unlimited.
        assert!(qm.check(&ids, 1000).is_ok());

        qm.refresh(
            QuotaId::User(5),
            QuotaRecord {
                limit: 10,
                warn: 0,
                value: 8,
            },
        );
        assert!(qm.check(&ids, 2).is_ok());
        assert!(matches!(
            qm.check(&ids, 3),
            Err(TesseraError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_hold_change_uses_slot() {
        let dev = Arc::new(MemDevice::new(512, 64, Arc::new(MountCounters::new())));
        let journal = MemJournal::new(dev, 0, 32, 8);
        let qm = QuotaManager::new();
        {
            let hold = qm.hold(&QuotaId::owner_ids(1, 2));
            let mut txn = Transaction::begin(&journal, 1, 1).unwrap();
            hold.change(&mut txn, 4).unwrap();
            assert!(matches!(
                hold.change(&mut txn, 1),
                Err(TesseraError::InternalInconsistency(_))
            ));
        }
        assert_eq!(qm.pending(), vec![(QuotaId::User(1), 4), (QuotaId::Group(2), 4)]);

        qm.synced(QuotaId::User(1), 4, QuotaRecord { value: 4, ..Default::default() });
        assert_eq!(qm.pending(), vec![(QuotaId::Group(2), 4)]);
        assert_eq!(qm.cached(QuotaId::User(1)).unwrap().value, 4);
        // Only the entry with pending changes survives a shrink.
        assert_eq!(qm.shrink(), 1);
        assert_eq!(qm.len(), 1);
    }
}
