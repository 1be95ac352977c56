// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Interfaces between the governor and the platform it runs on.
//!
//! The governor never touches hardware or scheduler internals directly. It
//! pulls utilization from a [`UtilSource`], idle-entry counters from an
//! [`IdleCalls`] and changes frequency through a [`FreqDriver`].

use std::ops::BitOr;
use std::ops::BitOrAssign;

use anyhow::Result;

/// A CPU frequency in kHz, as used throughout cpufreq.
pub type Freq = u32;

/// Fixed-point scale of CPU capacity and utilization.
pub const SCHED_CAPACITY_SCALE: u64 = 1024;

/// Event class that triggered a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NORMAL: UpdateFlags = UpdateFlags(0);
    /// A task woke up after blocking on I/O.
    pub const IOWAIT: UpdateFlags = UpdateFlags(1 << 0);
    /// A deadline-class task became runnable.
    pub const DEADLINE: UpdateFlags = UpdateFlags(1 << 1);

    pub fn contains(&self, other: UpdateFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        UpdateFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Utilization of one CPU against its capacity ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuUtil {
    pub util: u64,
    pub capacity: u64,
}

impl CpuUtil {
    pub fn new(util: u64, capacity: u64) -> Self {
        Self { util, capacity }
    }

    /// Strict ratio comparison, `self.util / self.capacity > other.util /
    /// other.capacity`, done by cross-multiplication.
    pub fn dominates(&self, other: &CpuUtil) -> bool {
        self.util as u128 * other.capacity as u128 > other.util as u128 * self.capacity as u128
    }
}

/// Frequency bounds of a policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreqLimits {
    /// Current policy floor (scaling_min_freq).
    pub min: Freq,
    /// Current policy ceiling (scaling_max_freq).
    pub max: Freq,
    /// Hardware maximum (cpuinfo_max_freq).
    pub cpuinfo_max: Freq,
}

/// The frequency driver of one policy.
///
/// `commit_immediate` is called from the sampling context with the group's
/// state lock held and must not block. `commit_blocking` is only ever called
/// from the policy's worker thread and may take as long as the transition
/// needs.
pub trait FreqDriver: Send + Sync {
    fn limits(&self) -> FreqLimits;

    /// Frequency the hardware is running at, used to seed the governor's
    /// view when it starts.
    fn cur(&self) -> Freq;

    /// Lowest supported frequency at or above `freq`, clamped to the policy
    /// limits.
    fn resolve(&self, freq: Freq) -> Freq;

    /// Whether `commit_immediate` can be used at all on this policy.
    fn fast_switch(&self) -> bool;

    /// Switch right away. `None` means the request was not applied.
    fn commit_immediate(&self, freq: Freq) -> Option<Freq>;

    /// Switch and wait for the transition to complete.
    fn commit_blocking(&self, freq: Freq) -> Result<()>;

    /// Re-read or enforce the policy limits after they changed.
    fn apply_limits(&self) -> Result<()> {
        Ok(())
    }

    /// Whether a sample taken on `cpu` may commit on this policy directly.
    /// Only consulted when fast switching.
    fn can_update_from(&self, _cpu: usize) -> bool {
        true
    }
}

/// Source of per-CPU utilization.
pub trait UtilSource: Send + Sync {
    fn cpu_util(&self, cpu: usize, now: u64) -> CpuUtil;

    /// Whether utilization is already scaled by the current frequency. When
    /// it isn't, the governor maps it against the applied frequency rather
    /// than the hardware maximum.
    fn freq_invariant(&self) -> bool {
        true
    }
}

/// Per-CPU count of idle entries.
pub trait IdleCalls: Send + Sync {
    /// `None` when the platform doesn't account idle entries, in which case
    /// no CPU is ever considered busy.
    fn idle_calls(&self, cpu: usize) -> Option<u64>;
}

/// Platforms without idle accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIdleCalls;

impl IdleCalls for NoIdleCalls {
    fn idle_calls(&self, _cpu: usize) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = UpdateFlags::IOWAIT | UpdateFlags::DEADLINE;
        assert!(flags.contains(UpdateFlags::IOWAIT));
        assert!(flags.contains(UpdateFlags::DEADLINE));
        assert!(!UpdateFlags::NORMAL.contains(UpdateFlags::IOWAIT));
        assert!(!UpdateFlags::IOWAIT.contains(UpdateFlags::NORMAL));
    }

    #[test]
    fn test_dominates_is_strict() {
        let a = CpuUtil::new(512, 1024);
        let b = CpuUtil::new(256, 512);
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(CpuUtil::new(300, 512).dominates(&a));
    }
}
