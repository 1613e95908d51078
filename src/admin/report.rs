//! Text reports.
//!
//! Every report starts with a `version 0` line. The set of reports is the
//! closed table in [`REPORTS`].

use crate::counters::CounterLine;
use crate::error::{Result, TesseraError};
use crate::mount::Mount;
use crate::observability;
use std::fmt::Write;

/// Size in bytes of the lock value block reported by `get_lockstruct`.
pub const LVB_SIZE: u32 = 32;

/// What a report handler may look at.
pub struct ReportContext<'a> {
    pub mount: &'a Mount,
}

pub type ReportFn = fn(&ReportContext<'_>) -> Result<String>;

/// Command name to report handler.
pub const REPORTS: &[(&str, ReportFn)] = &[
    ("get_cookie", cookie),
    ("get_args", args),
    ("get_lockstruct", lockstruct),
    ("get_stat", stat),
    ("get_stat_gfs", stat),
    ("get_counters", counters),
    ("get_tune", tune),
];

pub fn lookup(command: &str) -> Option<ReportFn> {
    REPORTS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, f)| *f)
}

/// Check a rendered report against the caller's buffer.
///
/// The limit is the smaller of `lockdump_size` and `max_out`; the text
/// must leave room for a terminator.
pub fn finish(text: String, lockdump_size: u32, max_out: u32) -> Result<Vec<u8>> {
    let limit = lockdump_size.min(max_out) as usize;
    if text.len() >= limit {
        return Err(TesseraError::OutOfSpace(format!(
            "report of {} bytes does not fit {} bytes",
            text.len(),
            limit
        )));
    }
    Ok(text.into_bytes())
}

fn header() -> String {
    String::from("version 0\n")
}

// Writing to a String cannot fail.
macro_rules! emit {
    ($out:expr, $($arg:tt)*) => {
        let _ = writeln!($out, $($arg)*);
    };
}

fn cookie(ctx: &ReportContext<'_>) -> Result<String> {
    let mut out = header();
    let _ = write!(out, "{}", ctx.mount.cookie());
    Ok(out)
}

fn args(ctx: &ReportContext<'_>) -> Result<String> {
    let a = ctx.mount.args();
    let mut out = header();
    emit!(out, "lockproto {}", a.lockproto);
    emit!(out, "locktable {}", a.locktable);
    emit!(out, "hostdata {}", a.hostdata);
    emit!(out, "ignore_local_fs {}", u8::from(a.ignore_local_fs));
    emit!(out, "localcaching {}", u8::from(a.localcaching));
    emit!(out, "localflocks {}", u8::from(a.localflocks));
    emit!(out, "oopses_ok {}", u8::from(a.oopses_ok));
    emit!(out, "upgrade {}", u8::from(a.upgrade));
    emit!(out, "num_glockd {}", a.num_glockd);
    emit!(out, "posix_acls {}", u8::from(a.posix_acls));
    emit!(out, "suiddir {}", u8::from(a.suiddir));
    Ok(out)
}

fn lockstruct(ctx: &ReportContext<'_>) -> Result<String> {
    let mut out = header();
    emit!(out, "jid {}", ctx.mount.jid());
    emit!(out, "first {}", u8::from(ctx.mount.jid() == 0));
    emit!(out, "lvb_size {}", LVB_SIZE);
    emit!(out, "flags {}", 0);
    Ok(out)
}

fn stat(ctx: &ReportContext<'_>) -> Result<String> {
    let counts = ctx.mount.regions().stat();
    let mut out = header();
    emit!(out, "bsize {}", ctx.mount.block_size());
    emit!(out, "total_blocks {}", counts.total);
    emit!(out, "free {}", counts.free);
    emit!(out, "used_dinode {}", counts.used_dinode);
    emit!(out, "used_data {}", counts.used_data);
    emit!(out, "used_meta {}", counts.used_meta);
    emit!(out, "free_meta {}", counts.free_meta);
    Ok(out)
}

fn counter_lines(mount: &Mount) -> Vec<CounterLine> {
    let locks = mount.locks().stats();
    observability::update_lock_gauges(locks.entries, locks.holders);
    let journal = mount.journal().stats();
    let (nq, dq, reclaimed) = mount.locks().call_counters();

    let mut lines = vec![
        CounterLine::gauge("sd_glock_count", "locks", locks.entries as i64),
        CounterLine::gauge("sd_glock_held_count", "locks held", locks.holders as i64),
        CounterLine::gauge("sd_inode_count", "incore inodes", mount.inodes().len() as i64),
        CounterLine::gauge("sd_quota_count", "quota IDs", mount.quota().len() as i64),
        CounterLine::gauge("sd_log_seg_free", "log blocks free", journal.free_blocks as i64),
        CounterLine::gauge("ji_nsegment", "log blocks total", journal.total_blocks as i64),
        CounterLine::gauge("sd_log_wrap", "log wraps", journal.wraps as i64),
        CounterLine::gauge("sd_lock_waiters", "lock waiters", locks.waiters as i64),
    ];
    let diff = |name, description, value: u32| CounterLine {
        name,
        description,
        diff: true,
        value: value as i64,
    };
    lines.push(diff("sd_reclaimed", "glocks reclaimed", reclaimed));
    lines.push(diff("sd_glock_nq_calls", "glock nq calls", nq));
    lines.push(diff("sd_glock_dq_calls", "glock dq calls", dq));
    lines.extend(mount.counters().diff_lines());
    lines
}

fn counters(ctx: &ReportContext<'_>) -> Result<String> {
    let mut out = header();
    for l in counter_lines(ctx.mount) {
        emit!(
            out,
            "{}:{}:{}:{}",
            l.name,
            l.description,
            if l.diff { "diff" } else { "" },
            l.value
        );
    }
    Ok(out)
}

fn tune(ctx: &ReportContext<'_>) -> Result<String> {
    let mut out = header();
    for (name, value) in ctx.mount.tunables().entries() {
        emit!(out, "{} {}", name, value);
    }
    Ok(out)
}

/// Output of `do_reclaim`.
pub fn reclaim(dinodes: u64, metadata: u64) -> String {
    let mut out = header();
    emit!(out, "inodes {}", dinodes);
    emit!(out, "metadata {}", metadata);
    out
}
