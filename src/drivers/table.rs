// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A driver over an in-memory frequency table. Nothing is written anywhere,
//! committed frequencies are only recorded. Used for dry runs.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Result;
use crossbeam::channel::Receiver;
use log::info;

use super::resolve_in_table;
use crate::Cpumask;
use crate::Freq;
use crate::FreqDriver;
use crate::FreqLimits;

#[derive(Debug)]
pub struct TableDriver {
    table: Vec<Freq>,
    min: AtomicU32,
    max: AtomicU32,
    cpuinfo_max: Freq,
    cur: AtomicU32,
    fast_switch: bool,
    update_from: Option<Cpumask>,
    reject: AtomicBool,
    fail: AtomicBool,
    verbose: bool,
    hold: Option<Receiver<()>>,
    resolves: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    commits: Mutex<Vec<Freq>>,
}

impl TableDriver {
    /// Driver over `table`, limits spanning the whole table.
    pub fn new(mut table: Vec<Freq>) -> Self {
        table.sort_unstable();
        table.dedup();
        let min = table.first().copied().unwrap_or(0);
        let max = table.last().copied().unwrap_or(0);

        Self {
            table,
            min: AtomicU32::new(min),
            max: AtomicU32::new(max),
            cpuinfo_max: max,
            cur: AtomicU32::new(min),
            fast_switch: false,
            update_from: None,
            reject: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            verbose: false,
            hold: None,
            resolves: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            commits: Mutex::new(vec![]),
        }
    }

    /// Mirror a real policy's table, limits and current frequency.
    pub fn mirror(driver: &dyn FreqDriver, table: &[Freq]) -> Self {
        let limits = driver.limits();
        let mut mirror = Self::new(table.to_vec());
        mirror.cpuinfo_max = limits.cpuinfo_max;
        mirror.set_limits(limits.min, limits.max);
        mirror.cur.store(driver.cur(), Ordering::Relaxed);
        mirror
    }

    pub fn fast_switch(mut self, enable: bool) -> Self {
        self.fast_switch = enable;
        self
    }

    /// Only allow immediate commits from samples taken on `cpus`.
    pub fn update_from(mut self, cpus: Cpumask) -> Self {
        self.update_from = Some(cpus);
        self
    }

    /// Log every commit at info level.
    pub fn verbose(mut self, enable: bool) -> Self {
        self.verbose = enable;
        self
    }

    /// Make every blocking commit wait for a token on `hold`.
    pub fn hold_commits(mut self, hold: Receiver<()>) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn set_limits(&self, min: Freq, max: Freq) {
        self.min.store(min, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
    }

    pub fn reject_commits(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Frequencies committed so far, in order.
    pub fn commits(&self) -> Vec<Freq> {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Highest number of blocking commits observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, freq: Freq) {
        self.cur.store(freq, Ordering::Relaxed);
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(freq);
        if self.verbose {
            info!("{}kHz", freq);
        }
    }
}

impl FreqDriver for TableDriver {
    fn limits(&self) -> FreqLimits {
        FreqLimits {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            cpuinfo_max: self.cpuinfo_max,
        }
    }

    fn cur(&self) -> Freq {
        self.cur.load(Ordering::Relaxed)
    }

    fn resolve(&self, freq: Freq) -> Freq {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        resolve_in_table(&self.table, &self.limits(), freq)
    }

    fn fast_switch(&self) -> bool {
        self.fast_switch
    }

    fn commit_immediate(&self, freq: Freq) -> Option<Freq> {
        if self.reject.load(Ordering::Relaxed) {
            return None;
        }
        let freq = resolve_in_table(&self.table, &self.limits(), freq);
        self.record(freq);
        Some(freq)
    }

    fn commit_blocking(&self, freq: Freq) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(hold) = &self.hold {
            let _ = hold.recv();
        }

        let ret = if self.fail.load(Ordering::Relaxed) {
            Err(anyhow::anyhow!("transition to {}kHz failed", freq))
        } else {
            self.record(freq);
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ret
    }

    fn apply_limits(&self) -> Result<()> {
        let limits = self.limits();
        if limits.min > limits.max {
            bail!("Invalid limits {}-{}kHz", limits.min, limits.max);
        }
        Ok(())
    }

    fn can_update_from(&self, cpu: usize) -> bool {
        match &self.update_from {
            Some(cpus) => cpus.test_cpu(cpu),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_driver() {
        let driver = TableDriver::new(vec![1_000_000, 500_000, 1_000_000]);
        assert_eq!(
            driver.limits(),
            FreqLimits {
                min: 500_000,
                max: 1_000_000,
                cpuinfo_max: 1_000_000
            }
        );
        assert_eq!(driver.resolve(600_000), 1_000_000);
        assert_eq!(driver.resolves(), 1);

        driver.commit_blocking(500_000).unwrap();
        driver.fail_commits(true);
        assert!(driver.commit_blocking(1_000_000).is_err());
        assert_eq!(driver.commits(), vec![500_000]);
        assert_eq!(driver.cur(), 500_000);
        assert_eq!(driver.max_in_flight(), 1);

        driver.set_limits(900_000, 600_000);
        assert!(driver.apply_limits().is_err());
    }

    #[test]
    fn test_update_from() {
        let driver = TableDriver::new(vec![1]).update_from(Cpumask::from_cpus([1, 2]));
        assert!(driver.can_update_from(2));
        assert!(!driver.can_update_from(0));
    }
}
