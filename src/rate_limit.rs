// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Asymmetric frequency change hysteresis.
//!
//! Frequency may go up `up_delay` after the last accepted change and down
//! only `down_delay` after it. Falls are damped to the average of the
//! pending and the candidate frequency.

use metrics::counter;

use crate::freq::RawFreqCache;
use crate::Freq;

pub const NSEC_PER_USEC: u64 = 1_000;

/// Fixed up rate limit.
pub const UP_RATE_LIMIT_US: u32 = 500;
/// Fixed down rate limit.
pub const DOWN_RATE_LIMIT_US: u32 = 20_000;

#[derive(Clone, Debug)]
pub struct RateLimiter {
    next_freq: Freq,
    last_update: u64,
    up_delay_ns: u64,
    down_delay_ns: u64,
    min_rate_limit_ns: u64,
    cache: RawFreqCache,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            UP_RATE_LIMIT_US as u64 * NSEC_PER_USEC,
            DOWN_RATE_LIMIT_US as u64 * NSEC_PER_USEC,
        )
    }
}

impl RateLimiter {
    pub fn new(up_delay_ns: u64, down_delay_ns: u64) -> Self {
        Self {
            next_freq: 0,
            last_update: 0,
            up_delay_ns,
            down_delay_ns,
            min_rate_limit_ns: up_delay_ns.min(down_delay_ns),
            cache: RawFreqCache::default(),
        }
    }

    pub fn set_delays(&mut self, up_delay_ns: u64, down_delay_ns: u64) {
        self.up_delay_ns = up_delay_ns;
        self.down_delay_ns = down_delay_ns;
        self.min_rate_limit_ns = up_delay_ns.min(down_delay_ns);
    }

    /// Back to the just-started state, keeping the delays.
    pub fn reset(&mut self) {
        self.next_freq = 0;
        self.last_update = 0;
        self.cache = RawFreqCache::default();
    }

    pub fn next_freq(&self) -> Freq {
        self.next_freq
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn up_delay_ns(&self) -> u64 {
        self.up_delay_ns
    }

    pub fn down_delay_ns(&self) -> u64 {
        self.down_delay_ns
    }

    pub fn min_rate_limit_ns(&self) -> u64 {
        self.min_rate_limit_ns
    }

    pub fn cached_raw(&self) -> Freq {
        self.cache.cached_raw()
    }

    pub fn need_update(&self) -> bool {
        self.cache.need_update()
    }

    /// Make the next sample recompute regardless of the rate limit and of
    /// the raw frequency cache.
    pub fn force_update(&mut self) {
        self.cache.force_update();
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    /// Whether a sample at `now` should compute a new frequency at all.
    /// `can_commit_here` is false when the sampling CPU would not be able
    /// to commit the result on its own.
    pub fn should_recompute(&self, now: u64, can_commit_here: bool) -> bool {
        if !can_commit_here {
            return false;
        }

        if self.cache.need_update() {
            return true;
        }

        now.saturating_sub(self.last_update) >= self.min_rate_limit_ns
    }

    /// Quantize `raw` through `resolve` unless it is the same raw frequency
    /// as last time.
    pub fn resolve(&mut self, raw: Freq, resolve: impl FnOnce(Freq) -> Freq) -> Freq {
        self.cache.resolve(raw, self.next_freq, resolve)
    }

    fn throttled(&self, now: u64, freq: Freq) -> bool {
        let elapsed = now.saturating_sub(self.last_update);

        (freq > self.next_freq && elapsed < self.up_delay_ns)
            || (freq < self.next_freq && elapsed < self.down_delay_ns)
    }

    /// Pass `freq` through the up/down delays. Returns the frequency to
    /// commit, if any.
    pub fn gate(&mut self, now: u64, freq: Freq) -> Option<Freq> {
        if self.throttled(now, freq) {
            // next_freq stays, don't short-circuit the next identical raw value
            self.cache.invalidate();
            counter!("freq_throttled_total").increment(1);
            return None;
        }

        self.accept(now, freq)
    }

    /// Like [`RateLimiter::gate`] but ignoring the up/down delays.
    pub fn force(&mut self, now: u64, freq: Freq) -> Option<Freq> {
        self.accept(now, freq)
    }

    fn accept(&mut self, now: u64, mut freq: Freq) -> Option<Freq> {
        if freq == self.next_freq {
            return None;
        }

        if freq < self.next_freq {
            freq = ((self.next_freq as u64 + freq as u64) >> 1) as Freq;
        }

        self.next_freq = freq;
        self.last_update = now;
        Some(freq)
    }
}
