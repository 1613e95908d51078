//! Administrative request protocol.
//!
//! A request names a command, its string arguments, an optional input
//! payload and the size of the caller's output buffer. Text reports come
//! from the table in [`report`]; the remaining commands return binary
//! records or act on the filesystem.
//!
//! | Command | Needs | Returns |
//! |---|---|---|
//! | `get_cookie` `get_args` `get_lockstruct` `get_stat` `get_counters` `get_tune` | | text |
//! | `get_super` | buffer of exactly the superblock size | superblock |
//! | `set_tune NAME VALUE` | `sys_admin` | |
//! | `do_reclaim` | `sys_admin` | text |
//! | `do_shrink` | `sys_admin` | |
//! | `get_file_stat` | buffer of exactly the dinode size | dinode |
//! | `set_file_flag set/clear FLAG` | owner, `linux_immutable` for some flags | |
//! | `get_file_meta` | owner | dinode and attribute blocks |
//! | `do_file_flush` | | |
//! | `get_hfile_stat NAME` `do_hfile_read NAME` `do_hfile_write NAME` `do_hfile_trunc NAME` | `sys_admin` | |
//! | `do_quota_sync` `do_quota_refresh ID` | `sys_admin` | |
//! | `do_quota_read ID` | buffer of exactly one quota record | record |

pub mod flags;
pub mod report;

use crate::config::TuneEffect;
use crate::disk::{DINODE_SIZE, SB_ADDR, SUPERBLOCK_SIZE};
use crate::eattr::EaStore;
use crate::error::{Result, TesseraError};
use crate::hidden::HiddenFile;
use crate::inode::Inode;
use crate::lock::{LockFlags, LockGuard, LockMode, LockRequest, LockScope};
use crate::mount::Mount;
use crate::observability;
use crate::quota::{QuotaId, QUOTA_RECORD_SIZE};
use crate::types::{Credentials, FormalId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One administrative request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub command: String,
    pub args: Vec<String>,
    pub payload_in: Option<Vec<u8>>,
    /// Size of the caller's output buffer.
    pub payload_max_out: u32,
    /// Byte offset for privileged-object reads, writes and truncates.
    pub offset: u64,
}

impl AdminRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_in = Some(payload);
        self
    }

    pub fn with_max_out(mut self, max_out: u32) -> Self {
        self.payload_max_out = max_out;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub bytes_written: u32,
    pub payload: Vec<u8>,
}

impl AdminResponse {
    fn done() -> Self {
        Self::default()
    }

    fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            bytes_written: payload.len() as u32,
            payload,
        }
    }

    /// The payload as text, for report commands.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| TesseraError::Serialization(format!("report is not UTF-8: {}", e)))
    }
}

fn expect_args(req: &AdminRequest, n: usize) -> Result<()> {
    if req.args.len() != n {
        return Err(TesseraError::InvalidArgument(format!(
            "{} takes {} argument(s), got {}",
            req.command,
            n,
            req.args.len()
        )));
    }
    Ok(())
}

fn expect_max_out(req: &AdminRequest, size: usize) -> Result<()> {
    if req.payload_max_out as usize != size {
        return Err(TesseraError::InvalidArgument(format!(
            "{} needs a {} byte buffer, got {}",
            req.command, size, req.payload_max_out
        )));
    }
    Ok(())
}

fn require_sys_admin(creds: &Credentials, command: &str) -> Result<()> {
    if !creds.caps.sys_admin {
        warn!(uid = creds.uid, command, "administrative command refused");
        return Err(TesseraError::PermissionDenied(format!(
            "{} requires sys_admin",
            command
        )));
    }
    Ok(())
}

fn hidden_arg(req: &AdminRequest) -> Result<HiddenFile> {
    expect_args(req, 1)?;
    req.args[0].parse()
}

impl Mount {
    /// Run one administrative command against `target`.
    pub async fn admin(&self, creds: &Credentials, target: &Inode, req: &AdminRequest) -> Result<AdminResponse> {
        let result = self.dispatch_admin(creds, target, req).await;
        observability::record_admin_command(&req.command, result.is_ok());
        match &result {
            Ok(resp) => debug!(command = %req.command, bytes = resp.bytes_written, "admin command done"),
            Err(e) => debug!(command = %req.command, error = %e, "admin command failed"),
        }
        result
    }

    async fn dispatch_admin(&self, creds: &Credentials, target: &Inode, req: &AdminRequest) -> Result<AdminResponse> {
        if let Some(render) = report::lookup(&req.command) {
            expect_args(req, 0)?;
            let text = render(&report::ReportContext { mount: self })?;
            let lockdump = self.tunables().lockdump_size;
            return Ok(AdminResponse::with_payload(report::finish(
                text,
                lockdump,
                req.payload_max_out,
            )?));
        }

        match req.command.as_str() {
            "get_super" => {
                expect_args(req, 0)?;
                expect_max_out(req, SUPERBLOCK_SIZE)?;
                let _lock = self
                    .locks
                    .acquire(LockRequest::new(LockScope::Superblock, LockMode::Shared, self.holder()))
                    .await?;
                let mut block = self.device.read_block(SB_ADDR)?;
                block.truncate(SUPERBLOCK_SIZE);
                Ok(AdminResponse::with_payload(block))
            }
            "set_tune" => {
                require_sys_admin(creds, &req.command)?;
                expect_args(req, 2)?;
                let effect = self.tune.write().set(&req.args[0], &req.args[1])?;
                info!(name = %req.args[0], value = %req.args[1], "tunable set");
                if effect == TuneEffect::QuotaSync {
                    self.quota_sync(None).await?;
                }
                Ok(AdminResponse::done())
            }
            "do_reclaim" => {
                require_sys_admin(creds, &req.command)?;
                expect_args(req, 0)?;
                let (dinodes, metadata) = self
                    .regions
                    .reclaim(&self.locks, self.holder(), self.device(), self.journal())
                    .await?;
                let lockdump = self.tunables().lockdump_size;
                Ok(AdminResponse::with_payload(report::finish(
                    report::reclaim(dinodes, metadata),
                    lockdump,
                    req.payload_max_out,
                )?))
            }
            "do_shrink" => {
                require_sys_admin(creds, &req.command)?;
                expect_args(req, 0)?;
                let locks = self.locks.shrink();
                let inodes = self.inodes.evict_unused(&self.pinned_objects());
                let quota = self.quota.shrink();
                info!(locks, inodes, quota, "caches shrunk");
                Ok(AdminResponse::done())
            }
            "get_file_stat" => {
                expect_args(req, 0)?;
                expect_max_out(req, DINODE_SIZE)?;
                let _lock = self.acquire_any_shared(target).await?;
                Ok(AdminResponse::with_payload(target.dinode().encode()))
            }
            "set_file_flag" => {
                flags::set_file_flag(self, creds, target, &req.args).await?;
                Ok(AdminResponse::done())
            }
            "get_file_meta" => {
                expect_args(req, 0)?;
                self.file_meta(creds, target, req.payload_max_out).await
            }
            "do_file_flush" => {
                expect_args(req, 0)?;
                if !self.pinned_objects().contains(&target.formal_id()) {
                    self.inodes.remove(target.formal_id());
                }
                Ok(AdminResponse::done())
            }
            "get_hfile_stat" => {
                let which = hidden_arg(req)?;
                expect_max_out(req, DINODE_SIZE)?;
                let dinode = self.hfile_stat(creds, which).await?;
                Ok(AdminResponse::with_payload(dinode.encode()))
            }
            "do_hfile_read" => {
                let which = hidden_arg(req)?;
                let data = self
                    .hfile_read(creds, which, req.offset, req.payload_max_out as usize)
                    .await?;
                Ok(AdminResponse::with_payload(data))
            }
            "do_hfile_write" => {
                let which = hidden_arg(req)?;
                let data = req.payload_in.as_deref().ok_or_else(|| {
                    TesseraError::InvalidArgument("do_hfile_write needs a payload".to_string())
                })?;
                let written = self.hfile_write(creds, which, req.offset, data).await?;
                Ok(AdminResponse {
                    bytes_written: written as u32,
                    payload: Vec::new(),
                })
            }
            "do_hfile_trunc" => {
                let which = hidden_arg(req)?;
                self.hfile_truncate(creds, which, req.offset).await?;
                Ok(AdminResponse::done())
            }
            "do_quota_sync" => {
                require_sys_admin(creds, &req.command)?;
                expect_args(req, 0)?;
                self.quota_sync(None).await?;
                Ok(AdminResponse::done())
            }
            "do_quota_refresh" => {
                require_sys_admin(creds, &req.command)?;
                expect_args(req, 1)?;
                self.quota_refresh(QuotaId::parse(&req.args[0])?).await?;
                Ok(AdminResponse::done())
            }
            "do_quota_read" => {
                expect_args(req, 1)?;
                expect_max_out(req, QUOTA_RECORD_SIZE)?;
                let record = self.quota_read(QuotaId::parse(&req.args[0])?).await?;
                Ok(AdminResponse::with_payload(record.encode()))
            }
            other => Err(TesseraError::Unsupported(format!("admin command {:?}", other))),
        }
    }

    async fn acquire_any_shared(&self, target: &Inode) -> Result<LockGuard> {
        self.locks
            .acquire(
                LockRequest::new(LockScope::Inode(target.formal_id()), LockMode::Shared, self.holder())
                    .with_flags(LockFlags::default().with_any()),
            )
            .await
    }

    /// The dinode block followed by the attribute chain.
    async fn file_meta(&self, creds: &Credentials, target: &Inode, max_out: u32) -> Result<AdminResponse> {
        let _lock = self.acquire_any_shared(target).await?;
        let dinode = target.dinode();
        if !creds.owns_or_overrides(dinode.uid) {
            return Err(TesseraError::PermissionDenied(format!(
                "uid {} does not own {}",
                creds.uid,
                target.identity()
            )));
        }

        let mut blocks = vec![dinode.addr];
        if dinode.eattr != 0 {
            blocks.extend_from_slice(EaStore::load(self.device(), dinode.eattr)?.chain());
        }
        let needed = blocks.len() * self.block_size();
        if needed > max_out as usize {
            return Err(TesseraError::OutOfSpace(format!(
                "file metadata needs {} bytes, buffer holds {}",
                needed, max_out
            )));
        }
        let mut out = Vec::new();
        out.try_reserve_exact(needed)?;
        for addr in blocks {
            out.extend_from_slice(&self.device.read_block(addr)?);
        }
        Ok(AdminResponse::with_payload(out))
    }

    /// Objects that stay cached for the life of the mount.
    fn pinned_objects(&self) -> Vec<FormalId> {
        let mut keep: Vec<FormalId> = HiddenFile::ALL
            .iter()
            .map(|h| h.identity(self.superblock()).formal_id)
            .collect();
        keep.push(self.root_identity().formal_id);
        keep
    }
}
