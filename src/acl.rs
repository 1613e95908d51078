//! POSIX access control lists.
//!
//! ACLs are stored as `system.posix_acl_access` and
//! `system.posix_acl_default` attribute records in the portable xattr form
//! (little-endian, version 2). Default ACLs exist only on directories and
//! symbolic links carry no ACLs at all.
//!
//! All validation runs before a transaction is begun. The adapter never
//! leaves a partially written attribute store behind.

use crate::disk::Dinode;
use crate::eattr::{EaStore, EaType};
use crate::error::{Result, TesseraError};
use crate::inode::{self, Inode};
use crate::journal::Transaction;
use crate::lock::{LockMode, LockRequest, LockScope};
use crate::mount::Mount;
use crate::quota::QuotaId;
use crate::region::{AllocKind, InplaceReservation};
use crate::types::{BlockAddr, Credentials, FileType};
use tracing::debug;

pub const ACL_ACCESS: &str = "posix_acl_access";
pub const ACL_DEFAULT: &str = "posix_acl_default";

const XATTR_VERSION: u32 = 0x0002;
const XATTR_HEADER: usize = 4;
const XATTR_ENTRY: usize = 8;

pub const ACL_UNDEFINED_ID: u32 = u32::MAX;

/// Entry tags.
pub mod tag {
    pub const USER_OBJ: u16 = 0x01;
    pub const USER: u16 = 0x02;
    pub const GROUP_OBJ: u16 = 0x04;
    pub const GROUP: u16 = 0x08;
    pub const MASK: u16 = 0x10;
    pub const OTHER: u16 = 0x20;
}

/// Which of an object's two ACLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclKind {
    Access,
    Default,
}

impl AclKind {
    pub fn ea_name(&self) -> &'static str {
        match self {
            AclKind::Access => ACL_ACCESS,
            AclKind::Default => ACL_DEFAULT,
        }
    }

    /// The kind stored under a full attribute name, if it is an ACL.
    pub fn from_ea_name(full: &str) -> Option<Self> {
        match EaType::split(full).ok()? {
            (EaType::System, ACL_ACCESS) => Some(AclKind::Access),
            (EaType::System, ACL_DEFAULT) => Some(AclKind::Default),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub tag: u16,
    pub perm: u16,
    pub id: u32,
}

impl AclEntry {
    pub fn new(tag: u16, perm: u16, id: u32) -> Self {
        Self { tag, perm, id }
    }
}

/// An ACL in canonical (sorted) order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PosixAcl {
    pub entries: Vec<AclEntry>,
}

impl PosixAcl {
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self { entries }
    }

    /// The minimal ACL equivalent to `mode`.
    pub fn from_mode(mode: u32) -> Self {
        Self::new(vec![
            AclEntry::new(tag::USER_OBJ, ((mode >> 6) & 7) as u16, ACL_UNDEFINED_ID),
            AclEntry::new(tag::GROUP_OBJ, ((mode >> 3) & 7) as u16, ACL_UNDEFINED_ID),
            AclEntry::new(tag::OTHER, (mode & 7) as u16, ACL_UNDEFINED_ID),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_xattr(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < XATTR_HEADER || (bytes.len() - XATTR_HEADER) % XATTR_ENTRY != 0 {
            return Err(TesseraError::InvalidArgument(format!(
                "ACL blob of {} bytes is malformed",
                bytes.len()
            )));
        }
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != XATTR_VERSION {
            return Err(TesseraError::InvalidArgument(format!(
                "ACL version {} is not supported",
                version
            )));
        }

        let mut entries = Vec::new();
        entries.try_reserve_exact((bytes.len() - XATTR_HEADER) / XATTR_ENTRY)?;
        for chunk in bytes[XATTR_HEADER..].chunks_exact(XATTR_ENTRY) {
            let tag = u16::from_le_bytes([chunk[0], chunk[1]]);
            let perm = u16::from_le_bytes([chunk[2], chunk[3]]);
            let id = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            let id = match tag {
                tag::USER_OBJ | tag::GROUP_OBJ | tag::MASK | tag::OTHER => ACL_UNDEFINED_ID,
                tag::USER | tag::GROUP => id,
                other => {
                    return Err(TesseraError::InvalidArgument(format!(
                        "unknown ACL tag {:#x}",
                        other
                    )))
                }
            };
            entries.push(AclEntry { tag, perm, id });
        }
        Ok(Self { entries })
    }

    pub fn to_xattr(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(XATTR_HEADER + self.entries.len() * XATTR_ENTRY)?;
        out.extend_from_slice(&XATTR_VERSION.to_le_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.tag.to_le_bytes());
            out.extend_from_slice(&e.perm.to_le_bytes());
            out.extend_from_slice(&e.id.to_le_bytes());
        }
        Ok(out)
    }

    /// Check canonical order and completeness.
    pub fn valid(&self) -> Result<()> {
        #[derive(PartialEq)]
        enum State {
            UserObj,
            User,
            Group,
            Other,
            Done,
        }
        let invalid = |why: &str| Err(TesseraError::InvalidArgument(format!("invalid ACL: {}", why)));

        let mut state = State::UserObj;
        let mut needs_mask = false;
        let mut prev_id: Option<u32> = None;
        for e in &self.entries {
            if e.perm & !7 != 0 {
                return invalid("permission bits out of range");
            }
            match e.tag {
                tag::USER_OBJ if state == State::UserObj => state = State::User,
                tag::USER | tag::GROUP => {
                    let expected = if e.tag == tag::USER { State::User } else { State::Group };
                    if state != expected || e.id == ACL_UNDEFINED_ID {
                        return invalid("misplaced named entry");
                    }
                    if prev_id.is_some_and(|p| e.id <= p) {
                        return invalid("named entries not sorted and unique");
                    }
                    prev_id = Some(e.id);
                    needs_mask = true;
                }
                tag::GROUP_OBJ if state == State::User => {
                    state = State::Group;
                    prev_id = None;
                }
                tag::MASK if state == State::Group => state = State::Other,
                tag::OTHER if state == State::Other || (state == State::Group && !needs_mask) => {
                    state = State::Done
                }
                _ => return invalid("entries out of order"),
            }
        }
        if state != State::Done {
            return invalid("required entry missing");
        }
        Ok(())
    }

    /// The permission bits the ACL implies, and whether the ACL says more
    /// than those bits can.
    pub fn equiv_mode(&self) -> (u32, bool) {
        let mut mode = 0u32;
        let mut not_equiv = false;
        for e in &self.entries {
            let perm = (e.perm & 7) as u32;
            match e.tag {
                tag::USER_OBJ => mode |= perm << 6,
                tag::GROUP_OBJ => mode |= perm << 3,
                tag::OTHER => mode |= perm,
                tag::MASK => {
                    mode = (mode & !0o070) | (perm << 3);
                    not_equiv = true;
                }
                _ => not_equiv = true,
            }
        }
        (mode, not_equiv)
    }

    /// Apply a create `mode` to an ACL inherited from a default ACL.
    ///
    /// Returns the resulting mode and whether the ACL must be kept.
    pub fn create_masq(&mut self, mode: u32) -> (u32, bool) {
        let mut mode = mode & 0o7777;
        let mut not_equiv = false;
        let mut group_obj = None;
        let mut mask_obj = None;

        for (i, e) in self.entries.iter_mut().enumerate() {
            match e.tag {
                tag::USER_OBJ => {
                    e.perm &= ((mode >> 6) & 7) as u16;
                    mode &= ((e.perm as u32) << 6) | !0o700;
                }
                tag::USER | tag::GROUP => not_equiv = true,
                tag::GROUP_OBJ => group_obj = Some(i),
                tag::OTHER => {
                    e.perm &= (mode & 7) as u16;
                    mode &= (e.perm as u32) | !0o007;
                }
                tag::MASK => {
                    mask_obj = Some(i);
                    not_equiv = true;
                }
                _ => {}
            }
        }

        if let Some(i) = mask_obj.or(group_obj) {
            let e = &mut self.entries[i];
            e.perm &= ((mode >> 3) & 7) as u16;
            mode &= ((e.perm as u32) << 3) | !0o070;
        }
        (mode, not_equiv)
    }

    /// Rewrite the ACL for a chmod to `mode`.
    pub fn chmod_masq(&mut self, mode: u32) -> Result<()> {
        let mut group_obj = None;
        let mut mask_obj = None;
        for (i, e) in self.entries.iter_mut().enumerate() {
            match e.tag {
                tag::USER_OBJ => e.perm = ((mode >> 6) & 7) as u16,
                tag::GROUP_OBJ => group_obj = Some(i),
                tag::MASK => mask_obj = Some(i),
                tag::OTHER => e.perm = (mode & 7) as u16,
                _ => {}
            }
        }
        let i = mask_obj.or(group_obj).ok_or_else(|| {
            TesseraError::InternalInconsistency("stored ACL has no group entry".to_string())
        })?;
        self.entries[i].perm = ((mode >> 3) & 7) as u16;
        Ok(())
    }
}

fn load_store(mount: &Mount, dinode: &Dinode) -> Result<Option<EaStore>> {
    if dinode.eattr == 0 {
        return Ok(None);
    }
    EaStore::load(mount.device(), dinode.eattr).map(Some)
}

fn read_acl(store: &EaStore, kind: AclKind) -> Result<Option<PosixAcl>> {
    match store.get(EaType::System, kind.ea_name())? {
        Some(blob) => PosixAcl::from_xattr(&blob).map(Some),
        None => Ok(None),
    }
}

/// The stored ACL of `kind`, if any. The caller holds the object's lock.
pub fn acl_get(mount: &Mount, inode: &Inode, kind: AclKind) -> Result<Option<PosixAcl>> {
    match load_store(mount, &inode.dinode())? {
        Some(store) => read_acl(&store, kind),
        None => Ok(None),
    }
}

/// Read an ACL under the object's Shared lock.
pub async fn get_acl(mount: &Mount, inode: &Inode, kind: AclKind) -> Result<Option<PosixAcl>> {
    let _lock = mount
        .locks
        .acquire(LockRequest::new(
            LockScope::Inode(inode.formal_id()),
            LockMode::Shared,
            mount.holder(),
        ))
        .await?;
    acl_get(mount, inode, kind)
}

/// Whether `creds` may drop the ACL of `kind` from the object.
pub fn validate_remove(mount: &Mount, creds: &Credentials, dinode: &Dinode, kind: AclKind) -> Result<()> {
    if !mount.args().posix_acls {
        return Err(TesseraError::Unsupported("mounted without ACL support".to_string()));
    }
    if !creds.owns_or_overrides(dinode.uid) {
        return Err(TesseraError::PermissionDenied(format!(
            "uid {} does not own {}",
            creds.uid,
            dinode.identity()
        )));
    }
    match dinode.file_type() {
        FileType::Symlink => Err(TesseraError::Unsupported("symbolic links carry no ACLs".to_string())),
        FileType::Directory => Ok(()),
        _ if kind == AclKind::Default => Err(TesseraError::Unsupported(
            "default ACLs exist only on directories".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Outcome of validating a new ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclSetPlan {
    pub acl: PosixAcl,
    /// New permission bits, for access ACLs.
    pub mode: Option<u32>,
    /// The ACL is fully described by the mode and must not be stored.
    pub remove: bool,
}

/// Parse and check a new ACL for the object.
pub fn validate_set(
    mount: &Mount,
    creds: &Credentials,
    dinode: &Dinode,
    kind: AclKind,
    raw: &[u8],
) -> Result<AclSetPlan> {
    validate_remove(mount, creds, dinode, kind)?;
    let acl = PosixAcl::from_xattr(raw)?;
    if acl.is_empty() {
        return Ok(AclSetPlan {
            acl,
            mode: None,
            remove: true,
        });
    }
    acl.valid()?;

    let mut plan = AclSetPlan {
        acl,
        mode: None,
        remove: false,
    };
    if kind == AclKind::Access {
        let (mode, not_equiv) = plan.acl.equiv_mode();
        plan.mode = Some((dinode.mode & !0o777) | mode);
        plan.remove = !not_equiv;
    }
    Ok(plan)
}

/// Initial ACL state of a new object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclPrep {
    pub mode: u32,
    pub access: Option<Vec<u8>>,
    pub default: Option<Vec<u8>>,
    /// Extra journal blocks the creating transaction must reserve.
    pub blocks: u32,
}

/// Work out a new child's mode and ACL blobs from `dir`'s default ACL.
///
/// The caller holds `dir`'s lock.
pub fn new_prep(
    mount: &Mount,
    creds: &Credentials,
    dir: &Inode,
    file_type: FileType,
    mode: u32,
) -> Result<AclPrep> {
    let mut prep = AclPrep {
        mode: mode & 0o7777,
        ..AclPrep::default()
    };
    if !mount.args().posix_acls || file_type == FileType::Symlink {
        prep.mode &= !creds.umask;
        return Ok(prep);
    }
    let Some(default) = acl_get(mount, dir, AclKind::Default)? else {
        prep.mode &= !creds.umask;
        return Ok(prep);
    };

    if file_type == FileType::Directory {
        prep.default = Some(default.to_xattr()?);
    }
    let mut access = default;
    let (masked, not_equiv) = access.create_masq(prep.mode);
    prep.mode = masked;
    if not_equiv {
        prep.access = Some(access.to_xattr()?);
    }

    let empty = EaStore::empty(mount.block_size());
    let max_txn = mount.journal().max_transaction_blocks();
    let jbsize = inode::jbsize(mount.block_size());
    let mut largest = 0;
    for (kind, blob) in [(AclKind::Access, &prep.access), (AclKind::Default, &prep.default)] {
        if let Some(blob) = blob {
            empty.check_size(EaType::System, kind.ea_name(), blob.len(), max_txn)?;
            largest = largest.max(kind.ea_name().len() + blob.len());
        }
    }
    if largest > 0 {
        prep.blocks = largest.div_ceil(jbsize) as u32;
        if prep.access.is_some() && prep.default.is_some() {
            prep.blocks *= 2;
        }
        // One more for the attribute block header.
        prep.blocks += 1;
    }
    debug!(mode = %format!("{:o}", prep.mode), blocks = prep.blocks, "ACL prep");
    Ok(prep)
}

/// Write the prepared ACL records of a new object.
///
/// Runs inside the creating transaction and allocates from the reservation
/// the creator already holds. Returns the object's first EA block (0 when
/// there is nothing to store).
pub fn new_init(
    mount: &Mount,
    txn: &mut Transaction<'_>,
    prep: &AclPrep,
    alloc: &mut InplaceReservation,
) -> Result<BlockAddr> {
    if prep.access.is_none() && prep.default.is_none() {
        return Ok(0);
    }
    let mut store = EaStore::empty(mount.block_size());
    if let Some(blob) = &prep.access {
        store.set(EaType::System, ACL_ACCESS, blob)?;
    }
    if let Some(blob) = &prep.default {
        store.set(EaType::System, ACL_DEFAULT, blob)?;
    }
    store.save(mount.device(), txn, Some(alloc))
}

/// Change the object's mode, rewriting its access ACL to match.
pub async fn chmod(mount: &Mount, creds: &Credentials, inode: &Inode, mode: u32) -> Result<()> {
    let _lock = mount
        .locks
        .acquire(LockRequest::new(
            LockScope::Inode(inode.formal_id()),
            LockMode::Exclusive,
            mount.holder(),
        ))
        .await?;
    let mut dinode = inode.dinode();
    if !creds.owns_or_overrides(dinode.uid) {
        return Err(TesseraError::PermissionDenied(format!(
            "uid {} may not chmod {}",
            creds.uid,
            inode.identity()
        )));
    }

    let mut store = if mount.args().posix_acls {
        load_store(mount, &dinode)?
    } else {
        None
    };
    let access = match &store {
        Some(s) => read_acl(s, AclKind::Access)?,
        None => None,
    };

    dinode.mode = mode & 0o7777;
    dinode.touch_ctime();
    match (access, store.as_mut()) {
        (Some(mut acl), Some(store)) => {
            acl.chmod_masq(dinode.mode)?;
            let blob = acl.to_xattr()?;
            let max_txn = mount.journal().max_transaction_blocks();
            store.check_size(EaType::System, ACL_ACCESS, blob.len(), max_txn)?;
            let (blocks, _) = store.blocks_for_set(EaType::System, ACL_ACCESS, blob.len());
            let mut txn = Transaction::begin(mount.journal(), EaStore::transaction_blocks(blocks, 0), 0)?;
            store.set(EaType::System, ACL_ACCESS, &blob)?;
            store.save(mount.device(), &mut txn, None)?;
            inode::write_dinode(mount.device(), &mut txn, &dinode)?;
            txn.end()?;
        }
        _ => {
            let mut txn = Transaction::begin(mount.journal(), 1, 0)?;
            inode::write_dinode(mount.device(), &mut txn, &dinode)?;
            txn.end()?;
        }
    }

    debug!(identity = %inode.identity(), mode = %format!("{:o}", dinode.mode), "chmod");
    inode.set_dinode(dinode);
    Ok(())
}

/// Store a new ACL of `kind` on the object, or drop it when the mode alone
/// expresses it.
pub async fn set_acl(
    mount: &Mount,
    creds: &Credentials,
    inode: &Inode,
    kind: AclKind,
    raw: &[u8],
) -> Result<()> {
    let holder = mount.holder();
    let _lock = mount
        .locks
        .acquire(LockRequest::new(
            LockScope::Inode(inode.formal_id()),
            LockMode::Exclusive,
            holder,
        ))
        .await?;
    let mut dinode = inode.dinode();
    let plan = validate_set(mount, creds, &dinode, kind, raw)?;
    let mut store = load_store(mount, &dinode)?.unwrap_or_else(|| EaStore::empty(mount.block_size()));
    if let Some(mode) = plan.mode {
        dinode.mode = mode & 0o7777;
    }
    dinode.touch_ctime();

    if plan.remove {
        let removed = store.remove(EaType::System, kind.ea_name());
        let blocks = if removed { store.chain().len() as u32 } else { 0 };
        let mut txn = Transaction::begin(mount.journal(), EaStore::transaction_blocks(blocks, 0), 0)?;
        if removed {
            store.save(mount.device(), &mut txn, None)?;
        }
        inode::write_dinode(mount.device(), &mut txn, &dinode)?;
        txn.end()?;
        debug!(identity = %inode.identity(), ?kind, "ACL folded into mode");
    } else {
        let blob = plan.acl.to_xattr()?;
        store.check_size(
            EaType::System,
            kind.ea_name(),
            blob.len(),
            mount.journal().max_transaction_blocks(),
        )?;
        let (blocks, new_blocks) = store.blocks_for_set(EaType::System, kind.ea_name(), blob.len());

        let hold = mount.quota.hold(&QuotaId::owner_ids(dinode.uid, dinode.gid));
        let mut res = None;
        if new_blocks > 0 {
            if mount.quota_enforced() {
                hold.check(new_blocks as u64)?;
            }
            res = Some(
                mount
                    .regions
                    .reserve(&mount.locks, holder, new_blocks, AllocKind::Meta)
                    .await?,
            );
        }
        let mut txn = Transaction::begin(
            mount.journal(),
            EaStore::transaction_blocks(blocks, new_blocks),
            u32::from(new_blocks > 0),
        )?;
        store.set(EaType::System, kind.ea_name(), &blob)?;
        dinode.eattr = store.save(mount.device(), &mut txn, res.as_mut())?;
        dinode.blocks += new_blocks as u64;
        hold.change(&mut txn, new_blocks as i64)?;
        inode::write_dinode(mount.device(), &mut txn, &dinode)?;
        txn.end()?;
        debug!(identity = %inode.identity(), ?kind, entries = plan.acl.entries.len(), "ACL stored");
    }

    inode.set_dinode(dinode);
    Ok(())
}

/// Drop the object's ACL of `kind`.
pub async fn remove_acl(mount: &Mount, creds: &Credentials, inode: &Inode, kind: AclKind) -> Result<()> {
    let _lock = mount
        .locks
        .acquire(LockRequest::new(
            LockScope::Inode(inode.formal_id()),
            LockMode::Exclusive,
            mount.holder(),
        ))
        .await?;
    let mut dinode = inode.dinode();
    validate_remove(mount, creds, &dinode, kind)?;

    let mut store = load_store(mount, &dinode)?
        .filter(|s| s.find(EaType::System, kind.ea_name()).is_some())
        .ok_or_else(|| TesseraError::NotFound(format!("{}.{}", EaType::System.prefix(), kind.ea_name())))?;

    let mut txn = Transaction::begin(
        mount.journal(),
        EaStore::transaction_blocks(store.chain().len() as u32, 0),
        0,
    )?;
    store.remove(EaType::System, kind.ea_name());
    store.save(mount.device(), &mut txn, None)?;
    dinode.touch_ctime();
    inode::write_dinode(mount.device(), &mut txn, &dinode)?;
    txn.end()?;

    inode.set_dinode(dinode);
    Ok(())
}
