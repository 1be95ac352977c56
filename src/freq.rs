// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization to frequency mapping.
//!
//! If utilization is frequency invariant, the next frequency is chosen
//! proportional to it against the hardware maximum:
//!
//! ```text
//! next_freq = C * max_freq * util / capacity
//! ```
//!
//! Otherwise util is only meaningful at the frequency the CPU currently
//! runs at, so the applied frequency is used as the reference:
//!
//! ```text
//! next_freq = C * cur_freq * util / capacity
//! ```
//!
//! C = 1.25 puts the tipping point at util / capacity = 0.8. Busy CPUs may
//! additionally be moved up the energy model's frequency table, spending at
//! most [`BUSY_COST_MARGIN`] more power.

use crate::platform::SCHED_CAPACITY_SCALE;
use crate::EnergyDomain;
use crate::Freq;

/// Extra cost a busy CPU may spend to get to a higher frequency, scaled by
/// 1024 (512 = up to 1.5x the cost of the base step).
pub const BUSY_COST_MARGIN: u64 = SCHED_CAPACITY_SCALE / 2;

/// `1.25 * freq * util / capacity`.
pub fn map_util_freq(util: u64, freq: u64, capacity: u64) -> u64 {
    (freq + (freq >> 2)) * util / capacity.max(1)
}

/// Compute the raw (not yet driver-quantized) next frequency.
pub fn next_raw_frequency(
    util: u64,
    capacity: u64,
    reference: Freq,
    busy: bool,
    domain: Option<&dyn EnergyDomain>,
) -> Freq {
    let mut freq = map_util_freq(util, reference as u64, capacity);

    if busy {
        if let Some(domain) = domain {
            freq = domain.higher_freq(saturate(freq), BUSY_COST_MARGIN) as u64;
        }
    }

    // Second-order correction for the driver's step granularity.
    saturate(map_util_freq(util, freq, capacity))
}

fn saturate(freq: u64) -> Freq {
    freq.min(Freq::MAX as u64) as Freq
}

/// Last raw frequency handed to the driver for quantization.
///
/// A raw value identical to the previous one resolves to the same driver
/// frequency, so the driver is skipped unless a recompute was forced (e.g.
/// the policy limits changed).
#[derive(Clone, Debug, Default)]
pub struct RawFreqCache {
    cached_raw: Freq,
    need_update: bool,
}

impl RawFreqCache {
    pub fn resolve(&mut self, raw: Freq, pending: Freq, resolve: impl FnOnce(Freq) -> Freq) -> Freq {
        if raw == self.cached_raw && !self.need_update {
            return pending;
        }

        self.need_update = false;
        self.cached_raw = raw;
        resolve(raw)
    }

    pub fn invalidate(&mut self) {
        self.cached_raw = 0;
    }

    pub fn force_update(&mut self) {
        self.need_update = true;
    }

    pub fn need_update(&self) -> bool {
        self.need_update
    }

    pub fn cached_raw(&self) -> Freq {
        self.cached_raw
    }
}
