//! Cluster lock handles for Tessera.
//!
//! Every access to a disk-resident object is mediated by a lock on a named
//! [`LockScope`]. A request names a mode ([`LockMode::Shared`] or
//! [`LockMode::Exclusive`]) and optional [`LockFlags`]. Granted requests are
//! represented by a [`LockGuard`], which releases the grant when dropped, so
//! release happens on every exit path including early error returns.
//!
//! Acquisition is the only suspension point: an incompatible request waits
//! (FIFO, with `priority` requests jumping ahead of ordinary waiters) until
//! the conflicting grants are released or the wait times out. Release is
//! synchronous and hands the lock to queued waiters in order.

use crate::config::LockConfig;
use crate::counters::RollingCounter;
use crate::error::{Result, TesseraError};
use crate::quota::QuotaId;
use crate::types::{BlockAddr, FormalId, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared lock (multiple readers).
    Shared,
    /// Exclusive lock (single writer).
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "SH"),
            LockMode::Exclusive => write!(f, "EX"),
        }
    }
}

/// Lock scope - what is being locked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// An object, keyed by formal id.
    Inode(FormalId),
    /// The resource index (list of regions).
    ResourceIndex,
    /// One allocation region, keyed by its header address.
    Region(BlockAddr),
    /// The superblock.
    Superblock,
    /// One quota id.
    Quota(QuotaId),
    /// Named lock for arbitrary coordination.
    Named(String),
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Inode(id) => write!(f, "inode:{}", id),
            LockScope::ResourceIndex => write!(f, "rindex"),
            LockScope::Region(addr) => write!(f, "region:{}", addr),
            LockScope::Superblock => write!(f, "sb"),
            LockScope::Quota(id) => write!(f, "quota:{}", id),
            LockScope::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Request modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFlags {
    /// A Shared request may be satisfied by an Exclusive grant the same owner
    /// already holds.
    pub any: bool,
    /// Jump ahead of ordinary waiters.
    pub priority: bool,
    /// Shared across the cluster, exclusive among holders on this node.
    pub local_exclusive: bool,
    /// Flush on release.
    pub sync: bool,
    /// Fail at once instead of waiting.
    pub try_lock: bool,
}

impl LockFlags {
    pub fn with_any(mut self) -> Self {
        self.any = true;
        self
    }

    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn with_local_exclusive(mut self) -> Self {
        self.local_exclusive = true;
        self
    }

    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn with_try(mut self) -> Self {
        self.try_lock = true;
        self
    }
}

/// Lock holder information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    /// Request (call stack) that owns the grant.
    pub owner_id: u64,
    /// Node the owner runs on.
    pub node_id: NodeId,
}

impl LockHolder {
    /// Create a new lock holder.
    pub fn new(owner_id: u64, node_id: NodeId) -> Self {
        Self { owner_id, node_id }
    }
}

/// Lock request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// What to lock.
    pub scope: LockScope,
    /// Lock mode.
    pub mode: LockMode,
    /// Who is requesting.
    pub holder: LockHolder,
    /// Request modifiers.
    pub flags: LockFlags,
    /// Wait timeout (None = manager default).
    pub wait_timeout: Option<Duration>,
}

impl LockRequest {
    /// Create a new lock request.
    pub fn new(scope: LockScope, mode: LockMode, holder: LockHolder) -> Self {
        Self {
            scope,
            mode,
            holder,
            flags: LockFlags::default(),
            wait_timeout: None,
        }
    }

    /// Set request flags.
    pub fn with_flags(mut self, flags: LockFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set wait timeout.
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// A granted request.
#[derive(Debug, Clone)]
struct Grant {
    id: u64,
    mode: LockMode,
    holder: LockHolder,
    flags: LockFlags,
}

impl Grant {
    fn conflicts_with(&self, mode: LockMode, holder: &LockHolder, flags: &LockFlags) -> bool {
        match (self.mode, mode) {
            (LockMode::Exclusive, LockMode::Shared) => {
                !(flags.any && self.holder.owner_id == holder.owner_id)
            }
            (LockMode::Exclusive, LockMode::Exclusive) | (LockMode::Shared, LockMode::Exclusive) => {
                true
            }
            (LockMode::Shared, LockMode::Shared) => {
                (flags.local_exclusive || self.flags.local_exclusive)
                    && self.holder.node_id == holder.node_id
            }
        }
    }
}

struct Waiter {
    id: u64,
    mode: LockMode,
    holder: LockHolder,
    flags: LockFlags,
    sender: oneshot::Sender<()>,
}

/// Internal lock state.
#[derive(Default)]
struct LockState {
    grants: Vec<Grant>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn is_idle(&self) -> bool {
        self.grants.is_empty() && self.waiters.is_empty()
    }

    fn compatible(&self, mode: LockMode, holder: &LockHolder, flags: &LockFlags) -> bool {
        !self
            .grants
            .iter()
            .any(|g| g.conflicts_with(mode, holder, flags))
    }

    /// Satisfied by a grant the same owner already holds.
    fn recursive(&self, mode: LockMode, holder: &LockHolder, flags: &LockFlags) -> bool {
        mode == LockMode::Shared
            && flags.any
            && self.grants.iter().any(|g| g.holder.owner_id == holder.owner_id)
    }

    fn enqueue(&mut self, waiter: Waiter) {
        if waiter.flags.priority {
            let pos = self
                .waiters
                .iter()
                .position(|w| !w.flags.priority)
                .unwrap_or(self.waiters.len());
            self.waiters.insert(pos, waiter);
        } else {
            self.waiters.push_back(waiter);
        }
    }
}

/// Lock event for notifications.
#[derive(Debug, Clone)]
pub enum LockEvent {
    /// Lock was granted.
    Granted {
        scope: LockScope,
        mode: LockMode,
        holder: LockHolder,
    },
    /// Lock was released.
    Released { scope: LockScope, holder: LockHolder },
    /// Request had to queue behind incompatible grants.
    Contended { scope: LockScope, holder: LockHolder },
    /// Request gave up waiting.
    TimedOut { scope: LockScope, holder: LockHolder },
}

/// Lock statistics.
#[derive(Debug, Default)]
struct LockStats {
    acquired: AtomicU64,
    released: AtomicU64,
    contention: AtomicU64,
    timeouts: AtomicU64,
    synced: AtomicU64,
    nq_calls: RollingCounter,
    dq_calls: RollingCounter,
    reclaimed: RollingCounter,
}

/// Public lock statistics.
#[derive(Debug, Clone, Default)]
pub struct LockManagerStats {
    /// Total grants handed out.
    pub acquired: u64,
    /// Total grants released.
    pub released: u64,
    /// Requests that had to wait.
    pub contention: u64,
    /// Requests that gave up waiting.
    pub timeouts: u64,
    /// Releases of `sync` grants.
    pub synced: u64,
    /// Lock entries in the table.
    pub entries: usize,
    /// Grants currently held.
    pub holders: usize,
    /// Requests currently queued.
    pub waiters: usize,
}

/// The cluster lock manager.
pub struct LockManager {
    config: LockConfig,
    locks: Mutex<HashMap<LockScope, LockState>>,
    next_id: AtomicU64,
    events: broadcast::Sender<LockEvent>,
    stats: LockStats,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1000);

        Arc::new(Self {
            config,
            locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            stats: LockStats::default(),
        })
    }

    /// Allocate an owner id for a new request call stack.
    pub fn new_owner(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquire a lock, returning a guard that releases it on drop.
    pub async fn acquire(self: &Arc<Self>, request: LockRequest) -> Result<LockGuard> {
        self.stats.nq_calls.inc();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let receiver = {
            let mut locks = self.locks.lock();

            if !locks.contains_key(&request.scope) && locks.len() >= self.config.max_total_locks {
                locks.retain(|_, s| !s.is_idle());
                if locks.len() >= self.config.max_total_locks {
                    return Err(TesseraError::OutOfMemory("lock table full".to_string()));
                }
            }

            let state = locks.entry(request.scope.clone()).or_default();
            let may_pass = state.waiters.is_empty()
                || request.flags.priority
                || state.recursive(request.mode, &request.holder, &request.flags);

            if may_pass && state.compatible(request.mode, &request.holder, &request.flags) {
                state.grants.push(Grant {
                    id,
                    mode: request.mode,
                    holder: request.holder,
                    flags: request.flags,
                });
                drop(locks);
                return Ok(self.granted(&request, id));
            }

            self.stats.contention.fetch_add(1, Ordering::Relaxed);
            if request.flags.try_lock {
                return Err(TesseraError::LockTimeout(format!(
                    "{} busy (try lock)",
                    request.scope
                )));
            }

            let (sender, receiver) = oneshot::channel();
            state.enqueue(Waiter {
                id,
                mode: request.mode,
                holder: request.holder,
                flags: request.flags,
                sender,
            });
            receiver
        };

        debug!(scope = %request.scope, mode = %request.mode, owner = request.holder.owner_id, "lock contended");
        let _ = self.events.send(LockEvent::Contended {
            scope: request.scope.clone(),
            holder: request.holder,
        });

        let mut pending = PendingWait {
            manager: self,
            scope: &request.scope,
            id,
            armed: true,
        };
        let timeout = request.wait_timeout.unwrap_or(self.config.wait_timeout);
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => {
                pending.armed = false;
                Ok(self.granted(&request, id))
            }
            Ok(Err(_)) => Err(TesseraError::InternalInconsistency(format!(
                "lock waiter on {} dropped",
                request.scope
            ))),
            Err(_) => {
                drop(pending);
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(scope = %request.scope, mode = %request.mode, ?timeout, "lock wait timed out");
                let _ = self.events.send(LockEvent::TimedOut {
                    scope: request.scope.clone(),
                    holder: request.holder,
                });
                Err(TesseraError::LockTimeout(request.scope.to_string()))
            }
        }
    }

    /// Withdraw a waiter that stopped waiting and let the waiters queued
    /// behind it through. A grant that raced the withdrawal is released.
    fn abandon_wait(&self, scope: &LockScope, id: u64) {
        let granted = {
            let mut locks = self.locks.lock();
            let Some(state) = locks.get_mut(scope) else {
                return;
            };
            let before = state.waiters.len();
            state.waiters.retain(|w| w.id != id);
            if before != state.waiters.len() {
                Self::promote_waiters(state);
                false
            } else {
                state.grants.iter().any(|g| g.id == id)
            }
        };
        if granted {
            self.release_grant(scope, id);
        }
    }

    fn granted(self: &Arc<Self>, request: &LockRequest, id: u64) -> LockGuard {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(scope = %request.scope, mode = %request.mode, owner = request.holder.owner_id, "lock granted");
        let _ = self.events.send(LockEvent::Granted {
            scope: request.scope.clone(),
            mode: request.mode,
            holder: request.holder,
        });
        LockGuard {
            manager: Arc::clone(self),
            scope: request.scope.clone(),
            mode: request.mode,
            holder: request.holder,
            id,
            released: false,
        }
    }

    /// Release one grant and hand the lock to queued waiters in order.
    fn release_grant(&self, scope: &LockScope, id: u64) {
        self.stats.dq_calls.inc();
        let mut locks = self.locks.lock();
        let Some(state) = locks.get_mut(scope) else {
            return;
        };
        let Some(pos) = state.grants.iter().position(|g| g.id == id) else {
            return;
        };
        let grant = state.grants.remove(pos);

        self.stats.released.fetch_add(1, Ordering::Relaxed);
        if grant.flags.sync {
            self.stats.synced.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.events.send(LockEvent::Released {
            scope: scope.clone(),
            holder: grant.holder,
        });

        Self::promote_waiters(state);
    }

    fn promote_waiters(state: &mut LockState) {
        while let Some(front) = state.waiters.front() {
            if !state.compatible(front.mode, &front.holder, &front.flags) {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.grants.push(Grant {
                id: waiter.id,
                mode: waiter.mode,
                holder: waiter.holder,
                flags: waiter.flags,
            });
            if waiter.sender.send(()).is_err() {
                // The waiting future is gone; revoke its grant.
                state.grants.retain(|g| g.id != waiter.id);
            }
        }
    }

    /// Drop idle lock entries. Returns how many were dropped.
    pub fn shrink(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, s| !s.is_idle());
        let dropped = before - locks.len();
        self.stats.reclaimed.add(dropped as i32);
        dropped
    }

    /// Modes currently granted on a scope.
    pub fn holders(&self, scope: &LockScope) -> Vec<(LockMode, LockHolder)> {
        self.locks
            .lock()
            .get(scope)
            .map(|s| s.grants.iter().map(|g| (g.mode, g.holder)).collect())
            .unwrap_or_default()
    }

    /// Subscribe to lock events.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Lock-call counters reported as differences since the last read.
    pub fn call_counters(&self) -> (u32, u32, u32) {
        (
            self.stats.nq_calls.read_and_clamp(),
            self.stats.dq_calls.read_and_clamp(),
            self.stats.reclaimed.read_and_clamp(),
        )
    }

    /// Get lock statistics.
    pub fn stats(&self) -> LockManagerStats {
        let locks = self.locks.lock();
        LockManagerStats {
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            contention: self.stats.contention.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            synced: self.stats.synced.load(Ordering::Relaxed),
            entries: locks.len(),
            holders: locks.values().map(|s| s.grants.len()).sum(),
            waiters: locks.values().map(|s| s.waiters.len()).sum(),
        }
    }
}

/// A queued acquire that has not been granted yet. Dropping it, on timeout
/// or when the acquiring future is cancelled, leaves the queue.
struct PendingWait<'a> {
    manager: &'a LockManager,
    scope: &'a LockScope,
    id: u64,
    armed: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon_wait(self.scope, self.id);
        }
    }
}

/// RAII lock guard.
pub struct LockGuard {
    manager: Arc<LockManager>,
    scope: LockScope,
    mode: LockMode,
    holder: LockHolder,
    id: u64,
    released: bool,
}

impl LockGuard {
    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holder(&self) -> LockHolder {
        self.holder
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release_grant(&self.scope, self.id);
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
