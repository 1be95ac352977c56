// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! [`FreqDriver`](crate::FreqDriver) implementations.

mod sysfs;
pub use sysfs::SysfsPolicy;
pub use sysfs::DEFAULT_CPUFREQ_ROOT;

mod table;
pub use table::TableDriver;

use crate::Freq;
use crate::FreqLimits;

/// Lowest entry of the ascending `table` at or above `freq`, clamped to
/// `limits`. Without a table the request is only clamped.
pub(crate) fn resolve_in_table(table: &[Freq], limits: &FreqLimits, freq: Freq) -> Freq {
    let freq = freq.clamp(limits.min, limits.max.max(limits.min));
    let idx = table.partition_point(|&f| f < freq);
    match table.get(idx) {
        Some(&f) if f <= limits.max => f,
        // Past the last step within limits, settle on the highest one.
        _ => table
            .iter()
            .rev()
            .find(|&&f| f <= limits.max && f >= limits.min)
            .copied()
            .unwrap_or(freq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_in_table() {
        let table = [300_000, 600_000, 900_000, 1_200_000];
        let limits = FreqLimits {
            min: 300_000,
            max: 1_200_000,
            cpuinfo_max: 1_200_000,
        };
        assert_eq!(resolve_in_table(&table, &limits, 0), 300_000);
        assert_eq!(resolve_in_table(&table, &limits, 600_000), 600_000);
        assert_eq!(resolve_in_table(&table, &limits, 600_001), 900_000);
        assert_eq!(resolve_in_table(&table, &limits, 5_000_000), 1_200_000);

        let capped = FreqLimits {
            max: 1_000_000,
            ..limits
        };
        assert_eq!(resolve_in_table(&table, &capped, 950_000), 900_000);
        assert_eq!(resolve_in_table(&[], &capped, 950_000), 950_000);
        assert_eq!(resolve_in_table(&[], &capped, 2_000_000), 1_000_000);
    }
}
