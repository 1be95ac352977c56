// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! cpufreq policies driven through sysfs.
//!
//! Frequency changes go through `scaling_setspeed`, which requires the
//! policy to run the `userspace` governor. [`SysfsPolicy::take_over`]
//! switches the policy to it and [`SysfsPolicy::restore`] puts back
//! whatever governor was there before.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::info;
use log::warn;

use super::resolve_in_table;
use crate::misc::read_file_string;
use crate::misc::read_file_usize_vec;
use crate::misc::read_from_file;
use crate::misc::write_to_file;
use crate::Cpumask;
use crate::Freq;
use crate::FreqDriver;
use crate::FreqLimits;

pub const DEFAULT_CPUFREQ_ROOT: &str = "/sys/devices/system/cpu/cpufreq";

const USERSPACE_GOVERNOR: &str = "userspace";

#[derive(Debug)]
pub struct SysfsPolicy {
    path: PathBuf,
    cpus: Cpumask,
    table: Vec<Freq>,
    min: AtomicU32,
    max: AtomicU32,
    cpuinfo_max: Freq,
    saved_governor: Mutex<Option<String>>,
}

impl SysfsPolicy {
    /// All policies under `root`, ordered by their first CPU.
    pub fn discover(root: &Path) -> Result<Vec<SysfsPolicy>> {
        let pattern = root.join("policy[0-9]*");
        let mut policies = vec![];
        for path in glob(&pattern.to_string_lossy())?.filter_map(Result::ok) {
            policies.push(SysfsPolicy::open(&path)?);
        }
        if policies.is_empty() {
            bail!("No cpufreq policy found under {:?}", root);
        }
        policies.sort_by_key(|p| p.id());
        Ok(policies)
    }

    pub fn open(path: &Path) -> Result<SysfsPolicy> {
        let cpus = Cpumask::from_cpus(read_file_usize_vec(&path.join("related_cpus"))?);
        if cpus.is_empty() {
            bail!("{:?} has no related CPUs", path);
        }

        let mut table: Vec<Freq> = match read_file_usize_vec(&path.join("scaling_available_frequencies")) {
            Ok(freqs) => freqs.into_iter().map(|f| f as Freq).collect(),
            Err(_) => vec![],
        };
        table.sort_unstable();
        table.dedup();

        let policy = SysfsPolicy {
            path: path.to_path_buf(),
            cpus,
            table,
            min: AtomicU32::new(0),
            max: AtomicU32::new(0),
            cpuinfo_max: read_from_file(&path.join("cpuinfo_max_freq"))?,
            saved_governor: Mutex::new(None),
        };
        policy.apply_limits()?;

        debug!(
            "{:?}: cpus {} limits {:?} {} steps",
            path,
            policy.cpus,
            policy.limits(),
            policy.table.len()
        );
        Ok(policy)
    }

    pub fn id(&self) -> usize {
        self.cpus.first().unwrap_or(0)
    }

    pub fn cpus(&self) -> &Cpumask {
        &self.cpus
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Available frequencies, ascending. Empty if the driver doesn't
    /// publish a table.
    pub fn table(&self) -> &[Freq] {
        &self.table
    }

    pub fn governor(&self) -> Result<String> {
        read_file_string(&self.path.join("scaling_governor"))
    }

    /// Switch the policy to the userspace governor, remembering the
    /// current one.
    pub fn take_over(&self) -> Result<()> {
        let current = self.governor()?;
        let mut saved = self.saved_governor.lock().unwrap_or_else(PoisonError::into_inner);
        if current != USERSPACE_GOVERNOR {
            write_to_file(&self.path.join("scaling_governor"), USERSPACE_GOVERNOR)
                .context("Is the userspace governor available?")?;
            info!("policy{}: {} -> {}", self.id(), current, USERSPACE_GOVERNOR);
        }
        saved.get_or_insert(current);
        Ok(())
    }

    /// Put back the governor found by [`SysfsPolicy::take_over`].
    pub fn restore(&self) -> Result<()> {
        let saved = self
            .saved_governor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(governor) = saved {
            if governor != USERSPACE_GOVERNOR {
                write_to_file(&self.path.join("scaling_governor"), &governor)?;
                info!("policy{}: restored {}", self.id(), governor);
            }
        }
        Ok(())
    }
}

impl FreqDriver for SysfsPolicy {
    fn limits(&self) -> FreqLimits {
        FreqLimits {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            cpuinfo_max: self.cpuinfo_max,
        }
    }

    fn cur(&self) -> Freq {
        match read_from_file(&self.path.join("scaling_cur_freq")) {
            Ok(freq) => freq,
            Err(e) => {
                warn!("{:#}", e);
                self.min.load(Ordering::Relaxed)
            }
        }
    }

    fn resolve(&self, freq: Freq) -> Freq {
        resolve_in_table(&self.table, &self.limits(), freq)
    }

    /// Writing sysfs may sleep.
    fn fast_switch(&self) -> bool {
        false
    }

    fn commit_immediate(&self, _freq: Freq) -> Option<Freq> {
        None
    }

    fn commit_blocking(&self, freq: Freq) -> Result<()> {
        write_to_file(&self.path.join("scaling_setspeed"), &freq.to_string())
    }

    fn apply_limits(&self) -> Result<()> {
        let min: Freq = read_from_file(&self.path.join("scaling_min_freq"))?;
        let max: Freq = read_from_file(&self.path.join("scaling_max_freq"))?;
        self.min.store(min, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, val: &str) {
        std::fs::write(dir.join(name), val).unwrap();
    }

    fn policy_dir(root: &Path, id: usize, cpus: &str, freqs: Option<&str>) -> PathBuf {
        let dir = root.join(format!("policy{}", id));
        std::fs::create_dir_all(&dir).unwrap();
        write(&dir, "related_cpus", cpus);
        write(&dir, "cpuinfo_max_freq", "1800000\n");
        write(&dir, "scaling_min_freq", "600000\n");
        write(&dir, "scaling_max_freq", "1800000\n");
        write(&dir, "scaling_cur_freq", "1200000\n");
        write(&dir, "scaling_governor", "schedutil\n");
        write(&dir, "scaling_setspeed", "<unsupported>\n");
        if let Some(freqs) = freqs {
            write(&dir, "scaling_available_frequencies", freqs);
        }
        dir
    }

    #[test]
    fn test_discover_and_quantize() {
        let tmp = TempDir::new().unwrap();
        policy_dir(tmp.path(), 4, "4 5 6 7\n", Some("1800000 600000 1200000 \n"));
        policy_dir(tmp.path(), 0, "0 1\n", None);

        let policies = SysfsPolicy::discover(tmp.path()).unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].id(), 0);
        assert_eq!(policies[1].cpus(), &Cpumask::from_cpus(4..8));

        let big = &policies[1];
        assert_eq!(big.table(), &[600_000, 1_200_000, 1_800_000]);
        assert_eq!(big.resolve(700_000), 1_200_000);
        assert_eq!(big.resolve(100), 600_000);
        assert_eq!(big.cur(), 1_200_000);

        // No table, only clamped.
        assert_eq!(policies[0].resolve(700_000), 700_000);
    }

    #[test]
    fn test_limits_follow_sysfs() {
        let tmp = TempDir::new().unwrap();
        let dir = policy_dir(tmp.path(), 0, "0\n", Some("600000 1200000 1800000\n"));
        let policy = SysfsPolicy::open(&dir).unwrap();
        assert_eq!(policy.resolve(1_500_000), 1_800_000);

        write(&dir, "scaling_max_freq", "1200000\n");
        assert_eq!(policy.resolve(1_500_000), 1_800_000);
        policy.apply_limits().unwrap();
        assert_eq!(policy.limits().max, 1_200_000);
        assert_eq!(policy.resolve(1_500_000), 1_200_000);
    }

    #[test]
    fn test_take_over_and_restore() {
        let tmp = TempDir::new().unwrap();
        let dir = policy_dir(tmp.path(), 0, "0\n", None);
        let policy = SysfsPolicy::open(&dir).unwrap();

        policy.take_over().unwrap();
        assert_eq!(policy.governor().unwrap(), "userspace");
        policy.commit_blocking(900_000).unwrap();
        assert_eq!(read_file_string(&dir.join("scaling_setspeed")).unwrap(), "900000");

        policy.restore().unwrap();
        assert_eq!(policy.governor().unwrap(), "schedutil");
        // Nothing left to restore.
        write(&dir, "scaling_governor", "performance\n");
        policy.restore().unwrap();
        assert_eq!(policy.governor().unwrap(), "performance");
    }

    #[test]
    fn test_missing_policy_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(SysfsPolicy::discover(tmp.path()).is_err());
    }
}
