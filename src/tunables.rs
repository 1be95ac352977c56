// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Governor tunables
//!
//! `up_rate_limit_us`, `down_rate_limit_us` and `iowait_boost_enable`. A
//! tunable set is either shared by every policy (global) or owned by one
//! policy. Per-policy sets remember their rate limits when their policy
//! goes away and get them back when a policy covering the same CPUs is
//! initialized again.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;

use crate::rate_limit::DOWN_RATE_LIMIT_US;
use crate::rate_limit::NSEC_PER_USEC;
use crate::rate_limit::UP_RATE_LIMIT_US;
use crate::Cpumask;
use crate::FrequencyGroup;

/// What happens to writes to the rate limit tunables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RateLimitWrites {
    /// Accept and ignore, the built-in rate limits always apply.
    #[default]
    Locked,
    /// Validate, store and apply to every policy using the set.
    Tunable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tunable {
    UpRateLimitUs,
    DownRateLimitUs,
    IowaitBoostEnable,
}

impl Tunable {
    pub const ALL: [Tunable; 3] = [
        Tunable::UpRateLimitUs,
        Tunable::DownRateLimitUs,
        Tunable::IowaitBoostEnable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tunable::UpRateLimitUs => "up_rate_limit_us",
            Tunable::DownRateLimitUs => "down_rate_limit_us",
            Tunable::IowaitBoostEnable => "iowait_boost_enable",
        }
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Tunable {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Tunable::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| anyhow!("Unknown tunable {:?}", s))
    }
}

/// Parse a boolean the way sysfs attributes accept them: y/Y/1, n/N/0,
/// on/off.
pub fn parse_bool(input: &str) -> Result<bool> {
    let s = input.trim_end_matches('\n');
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some('y' | 'Y' | '1'), _) => Ok(true),
        (Some('n' | 'N' | '0'), _) => Ok(false),
        (Some('o' | 'O'), Some('n' | 'N')) => Ok(true),
        (Some('o' | 'O'), Some('f' | 'F')) => Ok(false),
        _ => bail!("Invalid boolean {:?}", s),
    }
}

fn parse_us(input: &str) -> Result<u32> {
    let s = input.trim_end_matches('\n');
    s.parse::<u32>()
        .with_context(|| format!("Invalid rate limit {:?}", s))
}

pub struct TunableSet {
    up_rate_limit_us: AtomicU32,
    down_rate_limit_us: AtomicU32,
    iowait_boost_enable: AtomicBool,
    rate_limit_writes: RateLimitWrites,
    members: Mutex<BTreeMap<usize, Weak<FrequencyGroup>>>,
}

impl Default for TunableSet {
    fn default() -> Self {
        Self::new(RateLimitWrites::default())
    }
}

impl fmt::Debug for TunableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunableSet")
            .field("up_rate_limit_us", &self.up_rate_limit_us())
            .field("down_rate_limit_us", &self.down_rate_limit_us())
            .field("iowait_boost_enable", &self.iowait_boost_enable())
            .field("rate_limit_writes", &self.rate_limit_writes)
            .finish()
    }
}

impl TunableSet {
    pub fn new(rate_limit_writes: RateLimitWrites) -> Self {
        Self {
            up_rate_limit_us: AtomicU32::new(UP_RATE_LIMIT_US),
            down_rate_limit_us: AtomicU32::new(DOWN_RATE_LIMIT_US),
            iowait_boost_enable: AtomicBool::new(false),
            rate_limit_writes,
            members: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn up_rate_limit_us(&self) -> u32 {
        self.up_rate_limit_us.load(Ordering::Relaxed)
    }

    pub fn down_rate_limit_us(&self) -> u32 {
        self.down_rate_limit_us.load(Ordering::Relaxed)
    }

    pub fn up_delay_ns(&self) -> u64 {
        self.up_rate_limit_us() as u64 * NSEC_PER_USEC
    }

    pub fn down_delay_ns(&self) -> u64 {
        self.down_rate_limit_us() as u64 * NSEC_PER_USEC
    }

    pub fn iowait_boost_enable(&self) -> bool {
        self.iowait_boost_enable.load(Ordering::Relaxed)
    }

    pub fn rate_limit_writes(&self) -> RateLimitWrites {
        self.rate_limit_writes
    }

    fn members(&self) -> MutexGuard<'_, BTreeMap<usize, Weak<FrequencyGroup>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Policies currently using this set.
    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    pub fn attach(&self, group: &Arc<FrequencyGroup>) -> usize {
        let mut members = self.members();
        members.insert(group.policy(), Arc::downgrade(group));
        members.len()
    }

    /// Returns the number of policies still attached.
    pub fn detach(&self, policy: usize) -> usize {
        let mut members = self.members();
        members.remove(&policy);
        members.len()
    }

    pub fn show(&self, name: &str) -> Result<String> {
        Ok(match name.parse::<Tunable>()? {
            Tunable::UpRateLimitUs => self.up_rate_limit_us().to_string(),
            Tunable::DownRateLimitUs => self.down_rate_limit_us().to_string(),
            Tunable::IowaitBoostEnable => (self.iowait_boost_enable() as u32).to_string(),
        })
    }

    pub fn store(&self, name: &str, input: &str) -> Result<()> {
        let tunable = name.parse::<Tunable>()?;

        if tunable == Tunable::IowaitBoostEnable {
            let enable = parse_bool(input)?;
            self.iowait_boost_enable.store(enable, Ordering::Relaxed);
            debug!("{} = {}", tunable, enable);
            return Ok(());
        }

        if self.rate_limit_writes == RateLimitWrites::Locked {
            debug!("Ignoring write of {:?} to {}", input, tunable);
            return Ok(());
        }

        let us = parse_us(input)?;
        match tunable {
            Tunable::UpRateLimitUs => self.up_rate_limit_us.store(us, Ordering::Relaxed),
            _ => self.down_rate_limit_us.store(us, Ordering::Relaxed),
        }
        debug!("{} = {}", tunable, us);
        self.propagate();
        Ok(())
    }

    fn set_rate_limits_us(&self, up: u32, down: u32) {
        self.up_rate_limit_us.store(up, Ordering::Relaxed);
        self.down_rate_limit_us.store(down, Ordering::Relaxed);
    }

    fn propagate(&self) {
        let (up, down) = (self.up_delay_ns(), self.down_delay_ns());
        for group in self.members().values().filter_map(Weak::upgrade) {
            group.set_rate_limits(up, down);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CachedRateLimits {
    up_us: u32,
    down_us: u32,
}

#[derive(Default)]
struct RegistryInner {
    global: Option<Arc<TunableSet>>,
    cached: BTreeMap<usize, CachedRateLimits>,
}

/// Hands out tunable sets to policies.
pub struct TunablesRegistry {
    per_policy: bool,
    rate_limit_writes: RateLimitWrites,
    inner: Mutex<RegistryInner>,
}

impl TunablesRegistry {
    pub fn new(per_policy: bool, rate_limit_writes: RateLimitWrites) -> Self {
        Self {
            per_policy,
            rate_limit_writes,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find or create the tunable set for a policy spanning `cpus`, build
    /// the policy's group with it through `build` and attach the group.
    /// If `build` fails, a set created for it is dropped again.
    pub fn attach_new(
        &self,
        cpus: &Cpumask,
        build: impl FnOnce(Arc<TunableSet>) -> Result<Arc<FrequencyGroup>>,
    ) -> Result<Arc<FrequencyGroup>> {
        let mut inner = self.inner();

        if let Some(global) = inner.global.clone() {
            if self.per_policy {
                bail!("Global tunables exist while per-policy tunables are configured");
            }
            let group = build(global.clone())?;
            let count = global.attach(&group);
            debug!("policy{}: attached to global tunables ({} users)", group.policy(), count);
            return Ok(group);
        }

        let set = Arc::new(TunableSet::new(self.rate_limit_writes));
        if let Some(cached) = cpus.first().and_then(|cpu| inner.cached.get(&cpu)) {
            info!(
                "Restoring rate limits up {}us down {}us for CPUs {}",
                cached.up_us, cached.down_us, cpus
            );
            set.set_rate_limits_us(cached.up_us, cached.down_us);
        }

        let group = build(set.clone())?;
        set.attach(&group);
        if !self.per_policy {
            inner.global = Some(set);
        }
        Ok(group)
    }

    /// Detach `group` from its tunable set, releasing the set if it was
    /// the last user.
    pub fn detach(&self, group: &FrequencyGroup) {
        let mut inner = self.inner();
        let set = group.tunables();

        if set.detach(group.policy()) > 0 {
            return;
        }

        if self.per_policy {
            let cached = CachedRateLimits {
                up_us: set.up_rate_limit_us(),
                down_us: set.down_rate_limit_us(),
            };
            for cpu in group.cpus().iter() {
                inner.cached.insert(cpu, cached);
            }
        }
        if inner
            .global
            .as_ref()
            .is_some_and(|global| Arc::ptr_eq(global, set))
        {
            inner.global = None;
        }
    }

    pub fn global(&self) -> Option<Arc<TunableSet>> {
        self.inner().global.clone()
    }
}
