//! Per-mount operation counters.
//!
//! Counters live on the mount, never in process-wide statics. "Diff"
//! counters are read through [`RollingCounter::read_and_clamp`], which treats
//! a wrapped (negative) value as a reset.

use std::sync::atomic::{AtomicI32, Ordering};

/// A wrapping atomic counter.
#[derive(Debug, Default)]
pub struct RollingCounter(AtomicI32);

impl RollingCounter {
    pub fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: i32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Raw value, possibly negative after wrapping.
    pub fn read(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Read as unsigned; a negative value is reset to zero first.
    pub fn read_and_clamp(&self) -> u32 {
        let x = self.0.load(Ordering::Relaxed);
        if x < 0 {
            self.0.store(0, Ordering::Relaxed);
            return 0;
        }
        x as u32
    }

    #[cfg(test)]
    pub(crate) fn set(&self, v: i32) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// Counters owned by one mount.
#[derive(Debug, Default)]
pub struct MountCounters {
    pub fh2dentry_misses: RollingCounter,
    pub ops_export: RollingCounter,
    pub ops_inode: RollingCounter,
    pub ops_super: RollingCounter,
    pub bio_reads: RollingCounter,
    pub bio_writes: RollingCounter,
}

/// One line of the counter report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterLine {
    pub name: &'static str,
    pub description: &'static str,
    /// True for counters reported as a difference since the last read.
    pub diff: bool,
    pub value: i64,
}

impl MountCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff counters in reporting order.
    pub fn diff_lines(&self) -> Vec<CounterLine> {
        let diff = |name, description, c: &RollingCounter| CounterLine {
            name,
            description,
            diff: true,
            value: c.read_and_clamp() as i64,
        };
        vec![
            diff("sd_fh2dentry_misses", "fh2dentry misses", &self.fh2dentry_misses),
            diff("sd_ops_export", "export operations", &self.ops_export),
            diff("sd_ops_inode", "inode operations", &self.ops_inode),
            diff("sd_ops_super", "super operations", &self.ops_super),
            diff("sd_bio_reads", "block I/O reads", &self.bio_reads),
            diff("sd_bio_writes", "block I/O writes", &self.bio_writes),
        ]
    }
}

impl CounterLine {
    pub fn gauge(name: &'static str, description: &'static str, value: i64) -> Self {
        Self {
            name,
            description,
            diff: false,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_read() {
        let c = RollingCounter::new();
        c.inc();
        c.add(4);
        c.dec();
        assert_eq!(c.read(), 4);
        assert_eq!(c.read_and_clamp(), 4);
    }

    #[test]
    fn test_negative_resets() {
        let c = RollingCounter::new();
        c.set(i32::MAX);
        c.inc();
        assert!(c.read() < 0);
        assert_eq!(c.read_and_clamp(), 0);
        assert_eq!(c.read(), 0);
    }

    #[test]
    fn test_diff_lines() {
        let counters = MountCounters::new();
        counters.ops_export.inc();
        counters.ops_export.inc();
        let lines = counters.diff_lines();
        let export = lines.iter().find(|l| l.name == "sd_ops_export").unwrap();
        assert_eq!(export.value, 2);
        assert!(export.diff);
    }
}
