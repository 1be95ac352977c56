// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 Valve Corporation.
// Author: Changwoo Min <changwoo@igalia.com>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy Model
//!
//! Performance domains and their per-frequency cost, loaded from the
//! kernel's debugfs energy model. The governor uses a perf domain to trade
//! a bounded amount of extra power for a higher frequency when a CPU is
//! busy.

use crate::misc::read_from_file;
use crate::Cpumask;
use crate::Freq;
use crate::platform::SCHED_CAPACITY_SCALE;
use anyhow::bail;
use anyhow::Result;
use glob::glob;
use log::warn;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_EM_ROOT: &str = "/sys/kernel/debug/energy_model";

/// A perf domain as seen by the governor.
pub trait EnergyDomain: Send + Sync + fmt::Debug {
    /// CPUs covered by the domain.
    fn span(&self) -> &Cpumask;

    /// Highest frequency whose cost stays within `cost_margin` (scaled by
    /// 1024) of the cost of the first step at or above `freq`. Returns
    /// `freq` unchanged when no step qualifies.
    fn higher_freq(&self, freq: Freq, cost_margin: u64) -> Freq;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PerfState {
    pub cost: usize,
    pub frequency: usize,
    pub inefficient: usize,
    pub performance: usize,
    pub power: usize,
}

#[derive(Debug, Clone, Eq)]
pub struct PerfDomain {
    /// Monotonically increasing unique id.
    pub id: usize,
    /// Cpumask of all CPUs in this performance domain.
    pub span: Cpumask,
    /// Table of performance states indexed by performance.
    pub perf_table: BTreeMap<usize, Arc<PerfState>>,
}

#[derive(Debug, Default)]
pub struct EnergyModel {
    /// Performance domains indexed by domain id
    pub perf_doms: BTreeMap<usize, Arc<PerfDomain>>,
}

impl EnergyModel {
    /// Build an EnergyModel from an energy_model directory laid out like
    /// debugfs: `<root>/cpu<N>/{cpus,ps:<freq>/{cost,frequency,...}}`.
    pub fn from_root(root: &Path) -> Result<EnergyModel> {
        let mut perf_doms = BTreeMap::new();
        let pd_paths = match get_pd_paths(root) {
            Ok(pd_paths) => pd_paths,
            Err(_) => {
                bail!("Fail to locate the energy model directory");
            }
        };

        for (pd_id, pd_path) in pd_paths {
            let pd = PerfDomain::new(pd_id, &pd_path)?;
            perf_doms.insert(pd.id, pd.into());
        }

        Ok(EnergyModel { perf_doms })
    }

    pub fn from_domains(domains: Vec<PerfDomain>) -> EnergyModel {
        EnergyModel {
            perf_doms: domains.into_iter().map(|pd| (pd.id, Arc::new(pd))).collect(),
        }
    }

    pub fn get_pd_by_cpu_id(&self, cpu_id: usize) -> Option<&Arc<PerfDomain>> {
        self.perf_doms.values().find(|&pd| pd.span.test_cpu(cpu_id))
    }

    /// The perf domain covering exactly `cpus`. If the domain of the first
    /// CPU spans a different set, the policy gets no domain.
    pub fn domain_for(&self, cpus: &Cpumask) -> Option<Arc<PerfDomain>> {
        let first = cpus.first()?;
        let pd = self.get_pd_by_cpu_id(first)?;
        if pd.span == *cpus {
            Some(pd.clone())
        } else {
            warn!(
                "Not all CPUs in policy {} ({}) share perf domain {} ({}), no perf domain registered",
                first, cpus, pd.id, pd.span
            );
            None
        }
    }
}

impl PerfDomain {
    /// Build a PerfDomain
    pub fn new(id: usize, root: &Path) -> Result<PerfDomain> {
        let mut perf_table = BTreeMap::new();
        let cpulist = std::fs::read_to_string(root.join("cpus"))?;
        let span = Cpumask::from_cpulist(&cpulist)?;

        for ps_path in get_ps_paths(root)? {
            let ps = PerfState::new(&ps_path)?;
            perf_table.insert(ps.performance, ps.into());
        }

        Ok(PerfDomain {
            id,
            span,
            perf_table,
        })
    }

    pub fn from_states(id: usize, span: Cpumask, states: Vec<PerfState>) -> PerfDomain {
        PerfDomain {
            id,
            span,
            perf_table: states
                .into_iter()
                .map(|ps| (ps.performance, Arc::new(ps)))
                .collect(),
        }
    }
}

impl EnergyDomain for PerfDomain {
    fn span(&self) -> &Cpumask {
        &self.span
    }

    fn higher_freq(&self, freq: Freq, cost_margin: u64) -> Freq {
        let max_cost = match self
            .perf_table
            .values()
            .find(|ps| ps.frequency >= freq as usize)
        {
            Some(ps) => {
                let cost = ps.cost as u64;
                cost + cost * cost_margin / SCHED_CAPACITY_SCALE
            }
            None => 0,
        };

        self.perf_table
            .values()
            .rev()
            .find(|ps| ps.cost as u64 <= max_cost)
            .map(|ps| ps.frequency.min(Freq::MAX as usize) as Freq)
            .unwrap_or(freq)
    }
}

impl PartialEq for PerfDomain {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.span == other.span && self.perf_table == other.perf_table
    }
}

impl PerfState {
    /// Build a PerfState
    pub fn new(root: &Path) -> Result<PerfState> {
        let cost = read_from_file(&root.join("cost"))?;
        let frequency = read_from_file(&root.join("frequency"))?;
        let inefficient = read_from_file(&root.join("inefficient")).unwrap_or(0);
        let performance = read_from_file(&root.join("performance"))?;
        let power = read_from_file(&root.join("power"))?;

        Ok(PerfState {
            cost,
            frequency,
            inefficient,
            performance,
            power,
        })
    }
}

impl fmt::Display for EnergyModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (_, pd) in self.perf_doms.iter() {
            writeln!(f, "{pd:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "# perf domain: {:#}, cpus: {:#}", self.id, self.span)?;
        writeln!(f, "cost, frequency, inefficient, performance, power")?;
        for (_, ps) in self.perf_table.iter() {
            writeln!(f, "{ps:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}",
            self.cost, self.frequency, self.inefficient, self.performance, self.power
        )?;
        Ok(())
    }
}

/*********************************************************
 * Helper structs/functions for creating the EnergyModel *
 *********************************************************/
fn get_ps_paths(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = root.join("ps:[0-9]*");
    let ps_paths = glob(&pattern.to_string_lossy())?;
    Ok(ps_paths.filter_map(Result::ok).collect())
}

fn get_pd_paths(root: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let prefix = root.join("cpu").to_string_lossy().into_owned();
    let pd_paths = glob(&(prefix.clone() + "[0-9]*"))?;

    let mut pd_vec = vec![];
    for pd_path in pd_paths.filter_map(Result::ok) {
        let pd_str = pd_path.to_string_lossy().into_owned();
        let pd_id: usize = pd_str[prefix.len()..].parse()?;
        pd_vec.push((pd_id, pd_path));
    }
    if pd_vec.is_empty() {
        bail!("There is no performance domain.");
    }
    pd_vec.sort();

    Ok(pd_vec
        .into_iter()
        .enumerate()
        .map(|(id, (_, path))| (id, path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ps(frequency: usize, cost: usize) -> PerfState {
        PerfState {
            cost,
            frequency,
            inefficient: 0,
            performance: frequency / 1000,
            power: cost,
        }
    }

    fn little() -> PerfDomain {
        PerfDomain::from_states(
            0,
            Cpumask::from_cpus(0..4),
            vec![
                ps(500_000, 100),
                ps(1_000_000, 140),
                ps(1_500_000, 200),
                ps(2_000_000, 320),
            ],
        )
    }

    #[test]
    fn test_higher_freq_within_margin() {
        let pd = little();
        // 900MHz rounds up to the 1GHz step, cost 140, margin 1.5x = 210.
        assert_eq!(pd.higher_freq(900_000, 512), 1_500_000);
        // Zero margin only rounds up to the step itself.
        assert_eq!(pd.higher_freq(900_000, 0), 1_000_000);
        // Nothing at or above the request leaves it unchanged.
        assert_eq!(pd.higher_freq(2_500_000, 512), 2_500_000);
    }

    #[test]
    fn test_domain_for_requires_exact_span() {
        let em = EnergyModel::from_domains(vec![little()]);
        assert!(em.domain_for(&Cpumask::from_cpus(0..4)).is_some());
        assert!(em.domain_for(&Cpumask::from_cpus(0..2)).is_none());
        assert!(em.domain_for(&Cpumask::from_cpus([7])).is_none());
    }

    #[test]
    fn test_load_from_debugfs_layout() {
        let tmp = TempDir::new().unwrap();
        let pd = tmp.path().join("cpu4");
        std::fs::create_dir_all(&pd).unwrap();
        std::fs::write(pd.join("cpus"), "4-7\n").unwrap();
        for (freq, cost) in [(1_000_000usize, 300usize), (2_000_000, 700)] {
            let dir = pd.join(format!("ps:{freq}"));
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("cost"), format!("{cost}\n")).unwrap();
            std::fs::write(dir.join("frequency"), format!("{freq}\n")).unwrap();
            std::fs::write(dir.join("inefficient"), "0\n").unwrap();
            std::fs::write(dir.join("performance"), format!("{}\n", freq / 2000)).unwrap();
            std::fs::write(dir.join("power"), format!("{cost}\n")).unwrap();
        }

        let em = EnergyModel::from_root(tmp.path()).unwrap();
        assert_eq!(em.perf_doms.len(), 1);
        let pd = em.get_pd_by_cpu_id(5).unwrap();
        assert_eq!(pd.span, Cpumask::from_cpus(4..8));
        assert_eq!(pd.perf_table.len(), 2);
        assert_eq!(pd.higher_freq(1_000_000, 0), 1_000_000);
    }
}
