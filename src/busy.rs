// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Detects CPUs that haven't entered idle since they were last looked at.
//!
//! A busy CPU gets an energy-aware frequency boost and is not allowed to
//! drop its frequency, since a reduction would most likely be premature.

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusyDetector {
    saved_idle_calls: u64,
    previous_util: u64,
}

impl BusyDetector {
    /// Whether the CPU hasn't idled since the last check. `idle_calls` is
    /// the platform's idle-entry counter for the CPU, `None` when the
    /// platform doesn't account idle entries.
    pub fn is_busy(&mut self, idle_calls: Option<u64>) -> bool {
        let Some(idle_calls) = idle_calls else {
            return false;
        };

        let busy = idle_calls == self.saved_idle_calls;
        self.saved_idle_calls = idle_calls;
        busy
    }

    /// Remember the idle-entry count for the CPU whose utilization drove the
    /// last decision.
    ///
    /// If utilization didn't grow, the CPU must not be reported busy on the
    /// next check just because it stayed idle and the counter didn't move, so
    /// the saved count is pushed one behind.
    pub fn record(&mut self, idle_calls: Option<u64>, util: u64) {
        let Some(idle_calls) = idle_calls else {
            return;
        };

        self.saved_idle_calls = idle_calls;
        if util <= self.previous_util {
            self.saved_idle_calls = self.saved_idle_calls.wrapping_sub(1);
        }
        self.previous_util = util;
    }

    pub fn saved_idle_calls(&self) -> u64 {
        self.saved_idle_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_when_counter_is_stale() {
        let mut b = BusyDetector::default();
        assert!(!b.is_busy(Some(3)));
        assert!(b.is_busy(Some(3)));
        assert!(!b.is_busy(Some(4)));
    }

    #[test]
    fn test_record_on_falling_util() {
        let mut b = BusyDetector::default();
        b.record(Some(10), 500);
        assert_eq!(b.saved_idle_calls(), 10);
        assert!(b.is_busy(Some(10)));

        // Util didn't grow, an unchanged counter doesn't read as busy.
        b.record(Some(10), 400);
        assert_eq!(b.saved_idle_calls(), 9);
        assert!(!b.is_busy(Some(10)));
    }

    #[test]
    fn test_record_wraps() {
        let mut b = BusyDetector::default();
        b.record(Some(0), 0);
        assert_eq!(b.saved_idle_calls(), u64::MAX);
    }

    #[test]
    fn test_no_idle_accounting() {
        let mut b = BusyDetector::default();
        b.record(None, 100);
        assert!(!b.is_busy(None));
        assert!(!b.is_busy(None));
        assert_eq!(b, BusyDetector::default());
    }
}
