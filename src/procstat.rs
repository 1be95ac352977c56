// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization samples from `/proc/stat`.
//!
//! Every [`ProcSampler::refresh`] turns the per-CPU time deltas since the
//! previous refresh into a utilization sample. The busy fraction is scaled
//! by the CPU's capacity, which makes it comparable across CPUs but not
//! frequency invariant. Time spent in iowait raises the IOWAIT flag and
//! any idle time counts as one idle entry.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::trace;

use crate::misc::read_from_file;
use crate::platform::SCHED_CAPACITY_SCALE;
use crate::CpuUtil;
use crate::IdleCalls;
use crate::UpdateFlags;
use crate::UtilSource;

pub const DEFAULT_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSample {
    pub util: u64,
    pub iowait: bool,
    pub idled: bool,
}

/// Sample of one CPU between `prev` and `curr`. `None` if a counter is
/// missing.
pub fn cpu_sample(curr: &procfs::CpuStat, prev: &procfs::CpuStat, capacity: u64) -> Option<CpuSample> {
    let delta = |c: Option<u64>, p: Option<u64>| -> Option<u64> { Some(c?.saturating_sub(p?)) };

    let idle = delta(curr.idle_usec, prev.idle_usec)?;
    let iowait = delta(curr.iowait_usec, prev.iowait_usec)?;
    let busy = delta(curr.user_usec, prev.user_usec)?
        + delta(curr.nice_usec, prev.nice_usec)?
        + delta(curr.system_usec, prev.system_usec)?
        + delta(curr.irq_usec, prev.irq_usec)?
        + delta(curr.softirq_usec, prev.softirq_usec)?
        + delta(curr.stolen_usec, prev.stolen_usec)?;
    let total = busy + idle + iowait;

    let util = match total {
        0 => 0,
        total => busy * capacity / total,
    };

    Some(CpuSample {
        util: util.min(capacity),
        iowait: iowait > 0,
        idled: idle + iowait > 0,
    })
}

#[derive(Default)]
struct SamplerState {
    prev: BTreeMap<u32, procfs::CpuStat>,
    utils: BTreeMap<usize, CpuUtil>,
    idle_calls: BTreeMap<usize, u64>,
}

pub struct ProcSampler {
    reader: Mutex<procfs::ProcReader>,
    cpu_root: PathBuf,
    capacity: Mutex<BTreeMap<usize, u64>>,
    state: Mutex<SamplerState>,
}

impl ProcSampler {
    pub fn new(cpu_root: &Path) -> Result<Self> {
        let reader = procfs::ProcReader::new();
        let prev = read_cpus(&reader)?;

        Ok(Self {
            reader: Mutex::new(reader),
            cpu_root: cpu_root.to_path_buf(),
            capacity: Mutex::new(BTreeMap::new()),
            state: Mutex::new(SamplerState {
                prev,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capacity of `cpu`, `cpu_capacity` from sysfs if the platform has
    /// asymmetric CPUs.
    pub fn capacity(&self, cpu: usize) -> u64 {
        let mut cache = self.capacity.lock().unwrap_or_else(PoisonError::into_inner);
        *cache.entry(cpu).or_insert_with(|| {
            read_from_file(&self.cpu_root.join(format!("cpu{}/cpu_capacity", cpu)))
                .unwrap_or(SCHED_CAPACITY_SCALE)
        })
    }

    /// Take a new sample of every CPU. Returns the CPUs sampled with the
    /// event flags to report them with.
    pub fn refresh(&self) -> Result<Vec<(usize, UpdateFlags)>> {
        let curr = read_cpus(&self.reader.lock().unwrap_or_else(PoisonError::into_inner))?;
        let mut events = vec![];

        let mut guard = self.state();
        let st = &mut *guard;
        for (&cpu32, stat) in curr.iter() {
            let cpu = cpu32 as usize;
            let Some(prev) = st.prev.get(&cpu32) else {
                continue;
            };
            let capacity = self.capacity(cpu);
            let Some(sample) = cpu_sample(stat, prev, capacity) else {
                continue;
            };

            st.utils.insert(cpu, CpuUtil::new(sample.util, capacity));
            if sample.idled {
                *st.idle_calls.entry(cpu).or_insert(0) += 1;
            }
            trace!("cpu{}: util {}/{} iowait {}", cpu, sample.util, capacity, sample.iowait);

            let flags = if sample.iowait {
                UpdateFlags::IOWAIT
            } else {
                UpdateFlags::NORMAL
            };
            events.push((cpu, flags));
        }
        st.prev = curr;

        Ok(events)
    }
}

fn read_cpus(reader: &procfs::ProcReader) -> Result<BTreeMap<u32, procfs::CpuStat>> {
    reader
        .read_stat()
        .context("Failed to read procfs")?
        .cpus_map
        .ok_or_else(|| anyhow!("Expected cpus_map to exist"))
}

impl UtilSource for ProcSampler {
    fn cpu_util(&self, cpu: usize, _now: u64) -> CpuUtil {
        match self.state().utils.get(&cpu) {
            Some(util) => *util,
            None => CpuUtil::new(0, self.capacity(cpu)),
        }
    }

    /// Time-based busy fractions don't account for the frequency the CPU
    /// ran at.
    fn freq_invariant(&self) -> bool {
        false
    }
}

impl IdleCalls for ProcSampler {
    fn idle_calls(&self, cpu: usize) -> Option<u64> {
        Some(self.state().idle_calls.get(&cpu).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(busy: u64, idle: u64, iowait: u64) -> procfs::CpuStat {
        procfs::CpuStat {
            user_usec: Some(busy),
            nice_usec: Some(0),
            system_usec: Some(0),
            idle_usec: Some(idle),
            iowait_usec: Some(iowait),
            irq_usec: Some(0),
            softirq_usec: Some(0),
            stolen_usec: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_sample() {
        let prev = stat(1000, 1000, 0);

        let s = cpu_sample(&stat(1750, 1250, 0), &prev, 1024).unwrap();
        assert_eq!(
            s,
            CpuSample {
                util: 768,
                iowait: false,
                idled: true
            }
        );

        let s = cpu_sample(&stat(1500, 1000, 500), &prev, 512).unwrap();
        assert_eq!(s.util, 256);
        assert!(s.iowait);

        let s = cpu_sample(&stat(2000, 1000, 0), &prev, 1024).unwrap();
        assert_eq!((s.util, s.idled), (1024, false));

        // No time passed.
        assert_eq!(cpu_sample(&prev, &prev, 1024).unwrap().util, 0);
    }

    #[test]
    fn test_missing_counters() {
        let prev = stat(0, 0, 0);
        let curr = procfs::CpuStat {
            iowait_usec: None,
            ..stat(10, 10, 0)
        };
        assert!(cpu_sample(&curr, &prev, 1024).is_none());
    }
}
