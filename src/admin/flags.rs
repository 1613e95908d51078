//! `set_file_flag`.

use crate::error::{Result, TesseraError};
use crate::inode::{self, Inode};
use crate::journal::Transaction;
use crate::lock::{LockMode, LockRequest, LockScope};
use crate::mount::Mount;
use crate::types::{Credentials, FileFlag, FileType};
use tracing::{debug, warn};

/// Parsed `set_file_flag` arguments: `["set" | "clear", flag]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagChange {
    pub set: bool,
    pub flag: FileFlag,
}

impl FlagChange {
    pub fn parse(args: &[String]) -> Result<Self> {
        let [op, flag] = args else {
            return Err(TesseraError::InvalidArgument(format!(
                "set_file_flag takes 2 arguments, got {}",
                args.len()
            )));
        };
        let set = match op.as_str() {
            "set" => true,
            "clear" => false,
            other => {
                return Err(TesseraError::InvalidArgument(format!(
                    "expected set or clear, got {:?}",
                    other
                )))
            }
        };
        Ok(Self {
            set,
            flag: flag.parse()?,
        })
    }
}

/// Set or clear one flag on `target`.
///
/// Ownership, the `linux_immutable` capability and the object type are all
/// checked under the Exclusive lock before the transaction opens.
pub async fn set_file_flag(mount: &Mount, creds: &Credentials, target: &Inode, args: &[String]) -> Result<()> {
    let change = FlagChange::parse(args)?;
    let _lock = mount
        .locks
        .acquire(LockRequest::new(
            LockScope::Inode(target.formal_id()),
            LockMode::Exclusive,
            mount.holder(),
        ))
        .await?;
    let mut dinode = target.dinode();

    if !creds.owns_or_overrides(dinode.uid) {
        warn!(uid = creds.uid, identity = %target.identity(), flag = change.flag.name(), "flag change refused");
        return Err(TesseraError::PermissionDenied(format!(
            "uid {} does not own {}",
            creds.uid,
            target.identity()
        )));
    }
    if change.flag.requires_immutable_capability() && !creds.caps.linux_immutable {
        warn!(uid = creds.uid, identity = %target.identity(), flag = change.flag.name(), "flag change refused");
        return Err(TesseraError::PermissionDenied(format!(
            "{} requires linux_immutable",
            change.flag.name()
        )));
    }
    let file_type = dinode.file_type();
    let applicable = match change.flag {
        FileFlag::JournaledData => file_type == FileType::Regular && dinode.size == 0,
        FileFlag::DirectIo => file_type == FileType::Regular,
        FileFlag::InheritJournaledData | FileFlag::InheritDirectIo => file_type == FileType::Directory,
        FileFlag::Immutable | FileFlag::AppendOnly => true,
    };
    if !applicable {
        return Err(TesseraError::InvalidArgument(format!(
            "{} does not apply to {}",
            change.flag.name(),
            target.identity()
        )));
    }

    let mut txn = Transaction::begin(mount.journal(), 1, 0)?;
    if change.set {
        dinode.flags |= change.flag.bit();
    } else {
        dinode.flags &= !change.flag.bit();
    }
    dinode.touch_ctime();
    inode::write_dinode(mount.device(), &mut txn, &dinode)?;
    txn.end()?;

    debug!(identity = %target.identity(), flag = change.flag.name(), set = change.set, "file flag changed");
    target.set_dinode(dinode);
    Ok(())
}
