//! Runtime tunables.
//!
//! The tunable table is numeric and flat. `get_tune` reports it in
//! declaration order; `set_tune` changes one entry at a time, enforcing the
//! per-parameter rules below.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Side effect the caller must carry out after a successful `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneEffect {
    /// Nothing beyond storing the value.
    None,
    /// Quota accounting was switched off; pending quota changes must be synced.
    QuotaSync,
}

/// How a tunable's value is checked before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Any,
    NonZero,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub ilimit1: u32,
    pub ilimit1_tries: u32,
    pub ilimit1_min: u32,
    pub ilimit2: u32,
    pub ilimit2_tries: u32,
    pub ilimit2_min: u32,
    pub demote_secs: u32,
    pub incore_log_blocks: u32,
    pub jindex_refresh_secs: u32,
    pub depend_secs: u32,
    pub scand_secs: u32,
    pub recoverd_secs: u32,
    pub logd_secs: u32,
    pub quotad_secs: u32,
    pub inoded_secs: u32,
    pub quota_simul_sync: u32,
    pub quota_warn_period: u32,
    pub atime_quantum: u32,
    pub quota_quantum: u32,
    pub quota_scale_num: u32,
    pub quota_scale_den: u32,
    pub quota_enforce: u32,
    pub quota_account: u32,
    pub new_files_jdata: u32,
    pub new_files_directio: u32,
    pub max_atomic_write: u32,
    pub max_readahead: u32,
    pub lockdump_size: u32,
    pub stall_secs: u32,
    pub complain_secs: u32,
    pub reclaim_limit: u32,
    pub entries_per_readdir: u32,
    pub prefetch_secs: u32,
    pub statfs_slots: u32,
    pub max_mhc: u32,
    pub greedy_default: u32,
    pub greedy_quantum: u32,
    pub greedy_max: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ilimit1: 100,
            ilimit1_tries: 3,
            ilimit1_min: 1,
            ilimit2: 500,
            ilimit2_tries: 10,
            ilimit2_min: 3,
            demote_secs: 300,
            incore_log_blocks: 1024,
            jindex_refresh_secs: 60,
            depend_secs: 60,
            scand_secs: 5,
            recoverd_secs: 60,
            logd_secs: 1,
            quotad_secs: 5,
            inoded_secs: 15,
            quota_simul_sync: 64,
            quota_warn_period: 10,
            atime_quantum: 3600,
            quota_quantum: 60,
            quota_scale_num: 1,
            quota_scale_den: 1,
            quota_enforce: 1,
            quota_account: 1,
            new_files_jdata: 0,
            new_files_directio: 0,
            max_atomic_write: 4 << 20,
            max_readahead: 1 << 18,
            lockdump_size: 131072,
            stall_secs: 600,
            complain_secs: 10,
            reclaim_limit: 5000,
            entries_per_readdir: 32,
            prefetch_secs: 10,
            statfs_slots: 64,
            max_mhc: 10000,
            greedy_default: 100,
            greedy_quantum: 25,
            greedy_max: 250,
        }
    }
}

impl Tunables {
    /// All tunables as `(name, value)` in reporting order.
    pub fn entries(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("ilimit1", self.ilimit1),
            ("ilimit1_tries", self.ilimit1_tries),
            ("ilimit1_min", self.ilimit1_min),
            ("ilimit2", self.ilimit2),
            ("ilimit2_tries", self.ilimit2_tries),
            ("ilimit2_min", self.ilimit2_min),
            ("demote_secs", self.demote_secs),
            ("incore_log_blocks", self.incore_log_blocks),
            ("jindex_refresh_secs", self.jindex_refresh_secs),
            ("depend_secs", self.depend_secs),
            ("scand_secs", self.scand_secs),
            ("recoverd_secs", self.recoverd_secs),
            ("logd_secs", self.logd_secs),
            ("quotad_secs", self.quotad_secs),
            ("inoded_secs", self.inoded_secs),
            ("quota_simul_sync", self.quota_simul_sync),
            ("quota_warn_period", self.quota_warn_period),
            ("atime_quantum", self.atime_quantum),
            ("quota_quantum", self.quota_quantum),
            ("quota_scale_num", self.quota_scale_num),
            ("quota_scale_den", self.quota_scale_den),
            ("quota_enforce", self.quota_enforce),
            ("quota_account", self.quota_account),
            ("new_files_jdata", self.new_files_jdata),
            ("new_files_directio", self.new_files_directio),
            ("max_atomic_write", self.max_atomic_write),
            ("max_readahead", self.max_readahead),
            ("lockdump_size", self.lockdump_size),
            ("stall_secs", self.stall_secs),
            ("complain_secs", self.complain_secs),
            ("reclaim_limit", self.reclaim_limit),
            ("entries_per_readdir", self.entries_per_readdir),
            ("prefetch_secs", self.prefetch_secs),
            ("statfs_slots", self.statfs_slots),
            ("max_mhc", self.max_mhc),
            ("greedy_default", self.greedy_default),
            ("greedy_quantum", self.greedy_quantum),
            ("greedy_max", self.greedy_max),
        ]
    }

    /// Set one tunable from its textual value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<TuneEffect> {
        match name {
            "quota_scale" => {
                let mut parts = value.split_whitespace();
                let num = parts.next().map(parse_u32).transpose()?;
                let den = parts.next().map(parse_u32).transpose()?;
                match (num, den) {
                    (Some(num), Some(den)) if den != 0 => {
                        self.quota_scale_num = num;
                        self.quota_scale_den = den;
                        Ok(TuneEffect::None)
                    }
                    _ => Err(TesseraError::InvalidArgument(format!(
                        "quota_scale needs \"num den\" with den != 0, got {:?}",
                        value
                    ))),
                }
            }
            "quota_enforce" => {
                let x = normalize(parse_u32(value)?);
                self.quota_enforce = x;
                if x != 0 {
                    self.quota_account = 1;
                }
                Ok(TuneEffect::None)
            }
            "quota_account" => {
                let x = normalize(parse_u32(value)?);
                self.quota_account = x;
                if x == 0 {
                    self.quota_enforce = 0;
                    return Ok(TuneEffect::QuotaSync);
                }
                Ok(TuneEffect::None)
            }
            _ => {
                let (field, rule) = self.field_mut(name).ok_or_else(|| {
                    TesseraError::InvalidArgument(format!("unknown tunable: {}", name))
                })?;
                let x = parse_u32(value)?;
                *field = match rule {
                    Rule::Any => x,
                    Rule::Boolean => normalize(x),
                    Rule::NonZero if x == 0 => {
                        return Err(TesseraError::InvalidArgument(format!(
                            "{} must be non-zero",
                            name
                        )))
                    }
                    Rule::NonZero => x,
                };
                Ok(TuneEffect::None)
            }
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<(&mut u32, Rule)> {
        let entry = match name {
            "ilimit1" => (&mut self.ilimit1, Rule::Any),
            "ilimit1_tries" => (&mut self.ilimit1_tries, Rule::Any),
            "ilimit1_min" => (&mut self.ilimit1_min, Rule::Any),
            "ilimit2" => (&mut self.ilimit2, Rule::Any),
            "ilimit2_tries" => (&mut self.ilimit2_tries, Rule::Any),
            "ilimit2_min" => (&mut self.ilimit2_min, Rule::Any),
            "demote_secs" => (&mut self.demote_secs, Rule::Any),
            "incore_log_blocks" => (&mut self.incore_log_blocks, Rule::Any),
            "jindex_refresh_secs" => (&mut self.jindex_refresh_secs, Rule::Any),
            "depend_secs" => (&mut self.depend_secs, Rule::Any),
            "scand_secs" => (&mut self.scand_secs, Rule::Any),
            "recoverd_secs" => (&mut self.recoverd_secs, Rule::Any),
            "logd_secs" => (&mut self.logd_secs, Rule::Any),
            "quotad_secs" => (&mut self.quotad_secs, Rule::Any),
            "inoded_secs" => (&mut self.inoded_secs, Rule::Any),
            "quota_simul_sync" => (&mut self.quota_simul_sync, Rule::NonZero),
            "quota_warn_period" => (&mut self.quota_warn_period, Rule::Any),
            "atime_quantum" => (&mut self.atime_quantum, Rule::Any),
            "quota_quantum" => (&mut self.quota_quantum, Rule::Any),
            "new_files_jdata" => (&mut self.new_files_jdata, Rule::Boolean),
            "new_files_directio" => (&mut self.new_files_directio, Rule::Boolean),
            "max_atomic_write" => (&mut self.max_atomic_write, Rule::NonZero),
            "max_readahead" => (&mut self.max_readahead, Rule::Any),
            "lockdump_size" => (&mut self.lockdump_size, Rule::NonZero),
            "stall_secs" => (&mut self.stall_secs, Rule::NonZero),
            "complain_secs" => (&mut self.complain_secs, Rule::Any),
            "reclaim_limit" => (&mut self.reclaim_limit, Rule::Any),
            "entries_per_readdir" => (&mut self.entries_per_readdir, Rule::NonZero),
            "prefetch_secs" => (&mut self.prefetch_secs, Rule::Any),
            "statfs_slots" => (&mut self.statfs_slots, Rule::NonZero),
            "max_mhc" => (&mut self.max_mhc, Rule::Any),
            "greedy_default" => (&mut self.greedy_default, Rule::NonZero),
            "greedy_quantum" => (&mut self.greedy_quantum, Rule::NonZero),
            "greedy_max" => (&mut self.greedy_max, Rule::NonZero),
            _ => return None,
        };
        Some(entry)
    }
}

fn parse_u32(value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| TesseraError::InvalidArgument(format!("bad value {:?}: {}", value, e)))
}

fn normalize(x: u32) -> u32 {
    (x != 0) as u32
}
