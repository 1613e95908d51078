//! Core type definitions for Tessera.
//!
//! This module contains the fundamental data types shared by every layer:
//! object identities, file types, per-object flags and caller credentials.
//!
//! # Key Types
//!
//! - [`ObjectIdentity`]: stable `(formal_id, generation)` identity of an object
//! - [`FileType`]: object type as stored in the dinode
//! - [`FileFlag`]: administrative per-object flags settable via `set_file_flag`
//! - [`Credentials`]: the caller's uid/gid/umask and capabilities
//!
//! # Type Aliases
//!
//! - [`BlockAddr`] = `u64`: filesystem block address
//! - [`FormalId`] = `u64`: permanent object identifier
//! - [`NodeId`] = `u64`: cluster node identifier
//!
//! # Examples
//!
//! ```rust
//! use tessera::types::{FileFlag, ObjectIdentity};
//!
//! let id = ObjectIdentity::new(42, 3);
//! assert_eq!(id.formal_hi(), 0);
//! assert_eq!(id.formal_lo(), 42);
//!
//! let flag: FileFlag = "immutable".parse().unwrap();
//! assert!(flag.requires_immutable_capability());
//! ```

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Filesystem block address.
pub type BlockAddr = u64;

/// Permanent object identifier. Equal to the address of the object's dinode block.
pub type FormalId = u64;

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Stable identity of a metadata object.
///
/// `formal_id` never changes during the object's lifetime; `generation` is the
/// incarnation counter of the dinode block and strictly increases every time
/// the block is reused for a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub formal_id: FormalId,
    pub generation: u32,
}

impl ObjectIdentity {
    pub fn new(formal_id: FormalId, generation: u32) -> Self {
        Self {
            formal_id,
            generation,
        }
    }

    /// High 32 bits of the formal id.
    pub fn formal_hi(&self) -> u32 {
        (self.formal_id >> 32) as u32
    }

    /// Low 32 bits of the formal id.
    pub fn formal_lo(&self) -> u32 {
        (self.formal_id & 0xFFFF_FFFF) as u32
    }

    /// Rebuild a formal id from its two halves.
    pub fn join_formal(hi: u32, lo: u32) -> FormalId {
        ((hi as u64) << 32) | lo as u64
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.formal_id, self.generation)
    }
}

/// Object type, with the on-disk type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FileType {
    None = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 5,
    BlockDevice = 7,
    CharDevice = 8,
    Fifo = 101,
    Socket = 102,
}

impl FileType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(FileType::None),
            1 => Some(FileType::Regular),
            2 => Some(FileType::Directory),
            5 => Some(FileType::Symlink),
            7 => Some(FileType::BlockDevice),
            8 => Some(FileType::CharDevice),
            101 => Some(FileType::Fifo),
            102 => Some(FileType::Socket),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn to_mode(&self) -> u32 {
        match self {
            FileType::None => 0,
            FileType::Regular => libc::S_IFREG as u32,
            FileType::Directory => libc::S_IFDIR as u32,
            FileType::Symlink => libc::S_IFLNK as u32,
            FileType::BlockDevice => libc::S_IFBLK as u32,
            FileType::CharDevice => libc::S_IFCHR as u32,
            FileType::Fifo => libc::S_IFIFO as u32,
            FileType::Socket => libc::S_IFSOCK as u32,
        }
    }
}

/// Dinode flag bits.
pub mod dinode_flags {
    pub const JDATA: u32 = 0x0000_0001;
    pub const EXHASH: u32 = 0x0000_0002;
    pub const UNUSED: u32 = 0x0000_0004;
    pub const EA_INDIRECT: u32 = 0x0000_0008;
    pub const DIRECTIO: u32 = 0x0000_0010;
    pub const IMMUTABLE: u32 = 0x0000_0020;
    pub const APPENDONLY: u32 = 0x0000_0040;
    pub const NOATIME: u32 = 0x0000_0080;
    pub const SYNC: u32 = 0x0000_0100;
    pub const INHERIT_DIRECTIO: u32 = 0x4000_0000;
    pub const INHERIT_JDATA: u32 = 0x8000_0000;
}

/// Per-object flags that can be changed through the administrative protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFlag {
    JournaledData,
    DirectIo,
    Immutable,
    AppendOnly,
    InheritJournaledData,
    InheritDirectIo,
}

impl FileFlag {
    /// The dinode bit for this flag.
    pub fn bit(&self) -> u32 {
        match self {
            FileFlag::JournaledData => dinode_flags::JDATA,
            FileFlag::DirectIo => dinode_flags::DIRECTIO,
            FileFlag::Immutable => dinode_flags::IMMUTABLE,
            FileFlag::AppendOnly => dinode_flags::APPENDONLY,
            FileFlag::InheritJournaledData => dinode_flags::INHERIT_JDATA,
            FileFlag::InheritDirectIo => dinode_flags::INHERIT_DIRECTIO,
        }
    }

    /// Immutable and append-only need `linux_immutable`, not just ownership.
    pub fn requires_immutable_capability(&self) -> bool {
        matches!(self, FileFlag::Immutable | FileFlag::AppendOnly)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileFlag::JournaledData => "journaled-data",
            FileFlag::DirectIo => "direct-io",
            FileFlag::Immutable => "immutable",
            FileFlag::AppendOnly => "append-only",
            FileFlag::InheritJournaledData => "inherit-journaled-data",
            FileFlag::InheritDirectIo => "inherit-direct-io",
        }
    }
}

impl FromStr for FileFlag {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "journaled-data" | "jdata" => Ok(FileFlag::JournaledData),
            "direct-io" | "directio" => Ok(FileFlag::DirectIo),
            "immutable" => Ok(FileFlag::Immutable),
            "append-only" | "appendonly" => Ok(FileFlag::AppendOnly),
            "inherit-journaled-data" | "inherit_jdata" => Ok(FileFlag::InheritJournaledData),
            "inherit-direct-io" | "inherit_directio" => Ok(FileFlag::InheritDirectIo),
            other => Err(TesseraError::InvalidArgument(format!(
                "unknown file flag: {}",
                other
            ))),
        }
    }
}

/// Capabilities a caller may hold beyond plain ownership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Administrative capability (tunables, privileged objects, quota sync).
    pub sys_admin: bool,
    /// Ownership override.
    pub fowner: bool,
    /// May change the immutable and append-only flags.
    pub linux_immutable: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            sys_admin: true,
            fowner: true,
            linux_immutable: true,
        }
    }
}

/// Identity of the caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    pub caps: Capabilities,
}

impl Credentials {
    /// The superuser with every capability.
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            umask: 0o022,
            caps: Capabilities::all(),
        }
    }

    /// An unprivileged user.
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            umask: 0o022,
            caps: Capabilities::default(),
        }
    }

    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask & 0o777;
        self
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// True if the caller owns an object with `uid` or may override ownership.
    pub fn owns_or_overrides(&self, uid: u32) -> bool {
        self.uid == uid || self.caps.fowner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_halves() {
        let formal = 0x1234_5678_9abc_def0;
        let id = ObjectIdentity::new(formal, 7);
        assert_eq!(id.formal_hi(), 0x1234_5678);
        assert_eq!(id.formal_lo(), 0x9abc_def0);
        assert_eq!(ObjectIdentity::join_formal(id.formal_hi(), id.formal_lo()), formal);
    }

    #[test]
    fn test_file_type_codes() {
        for ft in [
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::Fifo,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_code(ft.code()), Some(ft));
        }
        assert_eq!(FileType::from_code(3), None);
    }

    #[test]
    fn test_file_flag_parse() {
        assert_eq!("jdata".parse::<FileFlag>().unwrap(), FileFlag::JournaledData);
        assert_eq!("append-only".parse::<FileFlag>().unwrap(), FileFlag::AppendOnly);
        assert!("bogus".parse::<FileFlag>().is_err());
        assert!(!FileFlag::DirectIo.requires_immutable_capability());
    }

    #[test]
    fn test_credentials() {
        let user = Credentials::user(1000, 1000);
        assert!(user.owns_or_overrides(1000));
        assert!(!user.owns_or_overrides(0));
        assert!(Credentials::root().owns_or_overrides(1000));
    }
}
