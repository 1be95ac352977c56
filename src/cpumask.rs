// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A set of CPU ids backed by a BitVec of u64's. Policies and perf domains
//! describe their span with a Cpumask, and the governor only ever needs to
//! build them from a cpulist ("0-3,6") or an explicit list of ids and to
//! compare them.
//!
//!```
//!     use scx_freqgov::Cpumask;
//!     let mask = Cpumask::from_cpulist("0-2,5").unwrap();
//!     assert!(mask.test_cpu(1));
//!     assert!(!mask.test_cpu(3));
//!     assert_eq!(mask.weight(), 4);
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Default)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: BitVec::new(),
        }
    }

    /// Build a Cpumask from a cpulist string such as "0-3,8,10-11".
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id);
        }

        Ok(mask)
    }

    /// Build a Cpumask with the given CPU ids set.
    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Cpumask {
        let mut mask = Cpumask::new();
        for cpu in cpus {
            mask.set_cpu(cpu);
        }
        mask
    }

    /// Set a bit in the Cpumask, growing it as needed.
    pub fn set_cpu(&mut self, cpu: usize) {
        if cpu >= self.mask.len() {
            self.mask.resize(cpu + 1, false);
        }
        self.mask.set(cpu, true);
    }

    /// Clear a bit from the Cpumask. Clearing a CPU beyond the end of the
    /// mask is a no-op.
    pub fn clear_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
    }

    /// Test whether the specified CPU bit is set in the Cpumask.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The lowest CPU set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Iterate over the CPU ids set in the mask, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

/// Two masks are equal when they contain the same CPUs, regardless of how
/// far each backing BitVec has grown.
impl PartialEq for Cpumask {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Invalid cpu range {}", group.trim());
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end = cpus.next().unwrap_or(end);
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
