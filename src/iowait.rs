// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU I/O wait boost.
//!
//! A CPU that keeps waking tasks out of I/O wait is boosted, starting at the
//! policy minimum and doubling on every consecutive I/O wakeup up to the
//! hardware maximum. Each frequency decision that consumes the boost halves
//! it, and a CPU that goes without a sample for more than a tick loses it
//! altogether.

use crate::CpuUtil;
use crate::Freq;
use crate::UpdateFlags;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IowaitBoost {
    boost: Freq,
    pending: bool,
    max: Freq,
}

impl IowaitBoost {
    pub fn new(max: Freq) -> Self {
        Self {
            boost: 0,
            pending: false,
            max,
        }
    }

    pub fn boost(&self) -> Freq {
        self.boost
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn max(&self) -> Freq {
        self.max
    }

    pub fn clear(&mut self) {
        self.boost = 0;
        self.pending = false;
    }

    /// Account a new sample taken `elapsed_ns` after the previous one.
    pub fn update(&mut self, elapsed_ns: u64, flags: UpdateFlags, tick_ns: u64, min: Freq) {
        // The CPU has most likely been idle.
        if self.boost != 0 && elapsed_ns > tick_ns {
            self.clear();
        }

        if !flags.contains(UpdateFlags::IOWAIT) || self.pending {
            return;
        }

        self.pending = true;
        self.boost = if self.boost != 0 {
            self.boost.saturating_mul(2).min(self.max)
        } else {
            min
        };
    }

    /// Consume the boost for one frequency decision, raising `sample` to
    /// `{boost, max}` if that is the higher ratio.
    pub fn apply(&mut self, min: Freq, sample: &mut CpuUtil) {
        if self.boost == 0 {
            return;
        }

        if self.pending {
            self.pending = false;
        } else {
            self.boost >>= 1;
            if self.boost < min {
                self.boost = 0;
                return;
            }
        }

        let boosted = CpuUtil::new(self.boost as u64, self.max as u64);
        if boosted.dominates(sample) {
            *sample = boosted;
        }
    }
}
