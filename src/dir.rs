//! Directory collaborator.
//!
//! Name resolution belongs to the host's directory layer. Tessera only needs
//! to link and unlink names, look a name up, and scan a directory for the
//! entry naming a given object. [`MemDirectory`] is the in-memory
//! implementation used by a formatted [`crate::mount::Mount`].

use crate::error::{Result, TesseraError};
use crate::types::{FileType, FormalId, ObjectIdentity};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub identity: ObjectIdentity,
    pub file_type: FileType,
}

/// Directory operations consumed by the metadata layer.
pub trait DirectoryOps: Send + Sync {
    /// Create the entry table of a new directory with `.` and `..`.
    fn init_dir(&self, dir: ObjectIdentity, parent: ObjectIdentity) -> Result<()>;

    fn lookup(&self, dir: FormalId, name: &str) -> Result<Option<DirEntry>>;

    fn link(&self, dir: FormalId, entry: DirEntry) -> Result<()>;

    fn unlink(&self, dir: FormalId, name: &str) -> Result<DirEntry>;

    /// Entries in name order, including `.` and `..`.
    fn entries(&self, dir: FormalId) -> Result<Vec<DirEntry>>;

    /// Forget a removed directory.
    fn drop_dir(&self, dir: FormalId);
}

/// In-memory directories.
#[derive(Debug, Default)]
pub struct MemDirectory {
    dirs: RwLock<HashMap<FormalId, BTreeMap<String, DirEntry>>>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_a_dir(dir: FormalId) -> TesseraError {
    TesseraError::NotFound(format!("directory {}", dir))
}

impl DirectoryOps for MemDirectory {
    fn init_dir(&self, dir: ObjectIdentity, parent: ObjectIdentity) -> Result<()> {
        let mut table = BTreeMap::new();
        for (name, identity) in [(".", dir), ("..", parent)] {
            table.insert(
                name.to_string(),
                DirEntry {
                    name: name.to_string(),
                    identity,
                    file_type: FileType::Directory,
                },
            );
        }
        self.dirs.write().insert(dir.formal_id, table);
        Ok(())
    }

    fn lookup(&self, dir: FormalId, name: &str) -> Result<Option<DirEntry>> {
        let dirs = self.dirs.read();
        let table = dirs.get(&dir).ok_or_else(|| not_a_dir(dir))?;
        Ok(table.get(name).cloned())
    }

    fn link(&self, dir: FormalId, entry: DirEntry) -> Result<()> {
        let mut dirs = self.dirs.write();
        let table = dirs.get_mut(&dir).ok_or_else(|| not_a_dir(dir))?;
        if table.contains_key(&entry.name) {
            return Err(TesseraError::InvalidArgument(format!(
                "{:?} already exists",
                entry.name
            )));
        }
        table.insert(entry.name.clone(), entry);
        Ok(())
    }

    fn unlink(&self, dir: FormalId, name: &str) -> Result<DirEntry> {
        if name == "." || name == ".." {
            return Err(TesseraError::InvalidArgument(format!("cannot unlink {:?}", name)));
        }
        let mut dirs = self.dirs.write();
        let table = dirs.get_mut(&dir).ok_or_else(|| not_a_dir(dir))?;
        table
            .remove(name)
            .ok_or_else(|| TesseraError::NotFound(name.to_string()))
    }

    fn entries(&self, dir: FormalId) -> Result<Vec<DirEntry>> {
        let dirs = self.dirs.read();
        let table = dirs.get(&dir).ok_or_else(|| not_a_dir(dir))?;
        Ok(table.values().cloned().collect())
    }

    fn drop_dir(&self, dir: FormalId) {
        self.dirs.write().remove(&dir);
    }
}
