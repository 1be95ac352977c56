// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU governor state and its aggregation across a shared policy.
//!
//! All CPUs of a policy run at the same frequency, so the policy has to
//! satisfy its most demanding CPU. CPUs that haven't reported for longer
//! than a load-tracking window are assumed idle and ignored.

use crate::busy::BusyDetector;
use crate::iowait::IowaitBoost;
use crate::CpuUtil;
use crate::Freq;
use crate::IdleCalls;
use crate::UpdateFlags;

/// State the governor keeps for one CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreState {
    pub cpu: usize,
    pub sample: CpuUtil,
    pub flags: UpdateFlags,
    pub last_update: u64,
    pub iowait: IowaitBoost,
    pub busy: BusyDetector,
}

impl CoreState {
    pub fn new(cpu: usize, cpuinfo_max: Freq) -> Self {
        Self {
            cpu,
            sample: CpuUtil::default(),
            flags: UpdateFlags::NORMAL,
            last_update: 0,
            iowait: IowaitBoost::new(cpuinfo_max),
            busy: BusyDetector::default(),
        }
    }
}

/// Stale threshold for a load-tracking window of `window_ns`.
pub fn stale_ns(window_ns: u64) -> u64 {
    window_ns + (window_ns >> 3)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    /// A live CPU runs a deadline task, the policy goes to max.
    Deadline,
    /// The most demanding CPU's sample, boost applied, and whether any live
    /// CPU is busy.
    Util { sample: CpuUtil, busy: bool },
}

/// Combine the samples of all `cores` of a policy at `now`. `trigger` is
/// the index of the CPU whose sample started this pass; it is the only one
/// whose busy state is recorded.
pub fn aggregate(
    cores: &mut [CoreState],
    trigger: usize,
    now: u64,
    stale_ns: u64,
    min_freq: Freq,
    idle: &dyn IdleCalls,
) -> Aggregate {
    let mut max = CpuUtil::new(0, 1);
    let mut busy = false;
    let mut trigger_util = 0;

    for (slot, core) in cores.iter_mut().enumerate() {
        if now.saturating_sub(core.last_update) > stale_ns {
            core.iowait.clear();
            continue;
        }

        if core.flags.contains(UpdateFlags::DEADLINE) {
            return Aggregate::Deadline;
        }

        if slot == trigger {
            trigger_util = core.sample.util;
        }
        busy |= core.busy.is_busy(idle.idle_calls(core.cpu));

        let mut sample = core.sample;
        core.iowait.apply(min_freq, &mut sample);
        if sample.dominates(&max) {
            max = sample;
        }
    }

    if let Some(core) = cores.get_mut(trigger) {
        core.busy.record(idle.idle_calls(core.cpu), trigger_util);
    }

    Aggregate::Util { sample: max, busy }
}
