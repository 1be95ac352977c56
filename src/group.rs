// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The governor instance of one cpufreq policy.
//!
//! A policy with a single CPU maps that CPU's sample straight to a
//! frequency. A CPU that hasn't idled since the previous decision is not
//! allowed to go down. A policy spanning several CPUs records the sample
//! in the CPU's slot and aggregates every CPU that reported recently,
//! taking the highest utilization ratio. Both paths then go through the
//! rate limiter and hand accepted frequencies to the commit dispatcher,
//! all under the group lock.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::aggregate::aggregate;
use crate::aggregate::Aggregate;
use crate::aggregate::CoreState;
use crate::dispatch::CommitDispatcher;
use crate::dispatch::CommitState;
use crate::freq::next_raw_frequency;
use crate::rate_limit::RateLimiter;
use crate::Cpumask;
use crate::CpuUtil;
use crate::EnergyDomain;
use crate::Freq;
use crate::FreqDriver;
use crate::FreqLimits;
use crate::IdleCalls;
use crate::TunableSet;
use crate::UpdateFlags;
use crate::UtilSource;

/// Everything the sampling path mutates, behind the group lock.
#[derive(Debug)]
pub struct GroupState {
    pub cores: Vec<CoreState>,
    pub limiter: RateLimiter,
}

pub struct GroupParams {
    pub tick_ns: u64,
    pub stale_ns: u64,
    pub rt_priority: Option<i32>,
}

/// Governor instance of one cpufreq policy.
pub struct FrequencyGroup {
    policy: usize,
    cpus: Cpumask,
    cpu_ids: Vec<usize>,
    driver: Arc<dyn FreqDriver>,
    util: Arc<dyn UtilSource>,
    idle: Arc<dyn IdleCalls>,
    domain: Option<Arc<dyn EnergyDomain>>,
    tunables: Arc<TunableSet>,
    tick_ns: u64,
    stale_ns: u64,
    state: Arc<Mutex<GroupState>>,
    commit: Arc<CommitState>,
    dispatcher: CommitDispatcher,
    started: AtomicBool,
}

fn lock(state: &Mutex<GroupState>) -> MutexGuard<'_, GroupState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrequencyGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cpus: Cpumask,
        driver: Arc<dyn FreqDriver>,
        util: Arc<dyn UtilSource>,
        idle: Arc<dyn IdleCalls>,
        domain: Option<Arc<dyn EnergyDomain>>,
        tunables: Arc<TunableSet>,
        params: &GroupParams,
    ) -> Result<Self> {
        let policy = cpus.first().unwrap_or(0);
        let cpu_ids: Vec<usize> = cpus.iter().collect();
        let cpuinfo_max = driver.limits().cpuinfo_max;

        let state = Arc::new(Mutex::new(GroupState {
            cores: cpu_ids
                .iter()
                .map(|&cpu| CoreState::new(cpu, cpuinfo_max))
                .collect(),
            limiter: RateLimiter::new(tunables.up_delay_ns(), tunables.down_delay_ns()),
        }));
        let commit = Arc::new(CommitState::default());

        let dispatcher = if driver.fast_switch() {
            CommitDispatcher::immediate(policy, driver.clone(), commit.clone())
        } else {
            let state = state.clone();
            let snapshot_commit = commit.clone();
            CommitDispatcher::deferred(
                policy,
                &cpus,
                params.rt_priority,
                driver.clone(),
                commit.clone(),
                move || {
                    let st = lock(&state);
                    let freq = st.limiter.next_freq();
                    snapshot_commit
                        .work_in_progress
                        .store(false, Ordering::Release);
                    freq
                },
            )?
        };

        match &domain {
            Some(pd) => debug!("policy{}: energy-aware boost on CPUs {}", policy, pd.span()),
            None => debug!("policy{}: no perf domain", policy),
        }

        Ok(Self {
            policy,
            cpus,
            cpu_ids,
            driver,
            util,
            idle,
            domain,
            tunables,
            tick_ns: params.tick_ns,
            stale_ns: params.stale_ns,
            state,
            commit,
            dispatcher,
            started: AtomicBool::new(false),
        })
    }

    /// Id of the policy, its first CPU.
    pub fn policy(&self) -> usize {
        self.policy
    }

    pub fn cpus(&self) -> &Cpumask {
        &self.cpus
    }

    pub fn is_shared(&self) -> bool {
        self.cpu_ids.len() > 1
    }

    pub fn slot_of(&self, cpu: usize) -> Option<usize> {
        self.cpu_ids.iter().position(|&c| c == cpu)
    }

    pub fn tunables(&self) -> &Arc<TunableSet> {
        &self.tunables
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn fast_switch(&self) -> bool {
        self.dispatcher.is_immediate()
    }

    /// Frequency last applied by the driver.
    pub fn cur(&self) -> Freq {
        self.commit.cur()
    }

    /// Last frequency accepted by the rate limiter.
    pub fn next_freq(&self) -> Freq {
        lock(&self.state).limiter.next_freq()
    }

    pub fn core(&self, slot: usize) -> Option<CoreState> {
        lock(&self.state).cores.get(slot).cloned()
    }

    pub fn start(&self) {
        let limits = self.driver.limits();
        let mut st = lock(&self.state);

        st.limiter
            .set_delays(self.tunables.up_delay_ns(), self.tunables.down_delay_ns());
        st.limiter.reset();
        for (core, &cpu) in st.cores.iter_mut().zip(self.cpu_ids.iter()) {
            *core = CoreState::new(cpu, limits.cpuinfo_max);
        }
        self.commit.work_in_progress.store(false, Ordering::Release);
        self.commit.cur.store(self.driver.cur(), Ordering::Relaxed);
        self.started.store(true, Ordering::Release);

        info!(
            "policy{}: started on {} ({}), up {}us down {}us",
            self.policy,
            self.cpus,
            if self.fast_switch() { "fast switch" } else { "worker" },
            st.limiter.up_delay_ns() / 1000,
            st.limiter.down_delay_ns() / 1000,
        );
    }

    /// Drain in-flight commits. Sampling must already have been cut off.
    pub fn stop(&self) {
        assert!(
            self.started.swap(false, Ordering::AcqRel),
            "policy{} stopped without being started",
            self.policy
        );
        self.dispatcher.flush();
        debug!("policy{}: stopped", self.policy);
    }

    /// The policy limits changed, make the next sample recompute.
    pub fn limits_changed(&self) -> Result<()> {
        if !self.fast_switch() {
            self.commit
                .with_work_lock(|| self.driver.apply_limits())?;
        }
        lock(&self.state).limiter.force_update();
        Ok(())
    }

    pub fn set_rate_limits(&self, up_delay_ns: u64, down_delay_ns: u64) {
        lock(&self.state).limiter.set_delays(up_delay_ns, down_delay_ns);
    }

    /// Up and down delays in effect, in ns.
    pub fn rate_limits(&self) -> (u64, u64) {
        let st = lock(&self.state);
        (st.limiter.up_delay_ns(), st.limiter.down_delay_ns())
    }

    /// Sample of the CPU in `slot` at `now`, taken on `origin_cpu`.
    pub fn update(&self, slot: usize, origin_cpu: usize, now: u64, flags: UpdateFlags) {
        let can_commit_here = !self.fast_switch() || self.driver.can_update_from(origin_cpu);
        if self.is_shared() {
            self.update_shared(slot, now, flags, can_commit_here);
        } else {
            self.update_single(now, flags, can_commit_here);
        }
    }

    fn update_iowait(&self, core: &mut CoreState, now: u64, flags: UpdateFlags, min: Freq) {
        if self.tunables.iowait_boost_enable() {
            core.iowait
                .update(now.saturating_sub(core.last_update), flags, self.tick_ns, min);
        }
        core.last_update = now;
    }

    fn next_freq_for(
        &self,
        limiter: &mut RateLimiter,
        sample: CpuUtil,
        busy: bool,
        limits: &FreqLimits,
    ) -> Freq {
        let reference = if self.util.freq_invariant() {
            limits.cpuinfo_max
        } else {
            self.commit.cur()
        };
        let raw = next_raw_frequency(
            sample.util,
            sample.capacity,
            reference,
            busy,
            self.domain.as_deref(),
        );
        limiter.resolve(raw, |freq| self.driver.resolve(freq))
    }

    pub fn update_single(&self, now: u64, flags: UpdateFlags, can_commit_here: bool) {
        let limits = self.driver.limits();
        let cpu = self.policy;
        let mut guard = lock(&self.state);
        let st = &mut *guard;
        let Some(core) = st.cores.first_mut() else {
            return;
        };

        core.flags = flags;
        self.update_iowait(core, now, flags, limits.min);

        if self.commit.in_progress() {
            return;
        }
        if !st.limiter.should_recompute(now, can_commit_here) {
            return;
        }

        let idle_calls = self.idle.idle_calls(cpu);
        let busy = core.busy.is_busy(idle_calls);

        let decision = if flags.contains(UpdateFlags::DEADLINE) {
            core.busy.record(idle_calls, core.sample.util);
            st.limiter.force(now, limits.cpuinfo_max)
        } else {
            let mut sample = self.util.cpu_util(cpu, now);
            core.sample = sample;
            core.busy.record(idle_calls, sample.util);
            core.iowait.apply(limits.min, &mut sample);

            let mut next = self.next_freq_for(&mut st.limiter, sample, busy, &limits);
            // Don't drop the frequency of a CPU that hasn't idled, the
            // reduction would most likely be premature.
            if busy && next < st.limiter.next_freq() {
                next = st.limiter.next_freq();
                st.limiter.invalidate_cache();
            }
            st.limiter.gate(now, next)
        };

        if let Some(freq) = decision {
            self.dispatcher.dispatch(freq);
        }
    }

    pub fn update_shared(&self, slot: usize, now: u64, flags: UpdateFlags, can_commit_here: bool) {
        let Some(&cpu) = self.cpu_ids.get(slot) else {
            warn!("policy{}: no CPU in slot {}", self.policy, slot);
            return;
        };
        let limits = self.driver.limits();
        let sample = self.util.cpu_util(cpu, now);

        let mut guard = lock(&self.state);
        let st = &mut *guard;
        let core = &mut st.cores[slot];
        core.sample = sample;
        core.flags = flags;
        self.update_iowait(core, now, flags, limits.min);

        if !st.limiter.should_recompute(now, can_commit_here) {
            return;
        }

        let decision = if flags.contains(UpdateFlags::DEADLINE) {
            st.limiter.force(now, limits.cpuinfo_max)
        } else {
            match aggregate(
                &mut st.cores,
                slot,
                now,
                self.stale_ns,
                limits.min,
                self.idle.as_ref(),
            ) {
                Aggregate::Deadline => st.limiter.force(now, limits.cpuinfo_max),
                Aggregate::Util { sample, busy } => {
                    let next = self.next_freq_for(&mut st.limiter, sample, busy, &limits);
                    st.limiter.gate(now, next)
                }
            }
        };

        if let Some(freq) = decision {
            self.dispatcher.dispatch(freq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::TableDriver;
    use crate::NoIdleCalls;
    use std::collections::BTreeMap;

    const US: u64 = 1_000;
    const MS: u64 = 1_000_000;

    #[derive(Default)]
    struct FakeUtil(Mutex<BTreeMap<usize, CpuUtil>>);

    impl FakeUtil {
        fn set(&self, cpu: usize, util: u64) {
            self.0.lock().unwrap().insert(cpu, CpuUtil::new(util, 1024));
        }
    }

    impl UtilSource for FakeUtil {
        fn cpu_util(&self, cpu: usize, _now: u64) -> CpuUtil {
            self.0
                .lock()
                .unwrap()
                .get(&cpu)
                .copied()
                .unwrap_or(CpuUtil::new(0, 1024))
        }
    }

    fn params() -> GroupParams {
        GroupParams {
            tick_ns: 4 * MS,
            stale_ns: 22_500 * US,
            rt_priority: None,
        }
    }

    fn table() -> Vec<Freq> {
        vec![400_000, 800_000, 1_200_000, 1_600_000, 2_000_000]
    }

    fn fast_group(cpus: Cpumask, util: Arc<FakeUtil>) -> (FrequencyGroup, Arc<TableDriver>) {
        let driver = Arc::new(TableDriver::new(table()).fast_switch(true));
        let group = FrequencyGroup::new(
            cpus,
            driver.clone(),
            util,
            Arc::new(NoIdleCalls),
            None,
            Arc::new(TunableSet::default()),
            &params(),
        )
        .unwrap();
        group.start();
        (group, driver)
    }

    #[test]
    fn test_single_fast_path() {
        let util = Arc::new(FakeUtil::default());
        let (group, driver) = fast_group(Cpumask::from_cpus([0]), util.clone());
        assert!(!group.is_shared());

        // 1.25 * 1.25 * 2GHz * (512 / 1024)^2 = 781.25MHz -> 800MHz
        util.set(0, 512);
        group.update(0, 0, 1 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 800_000);
        assert_eq!(group.cur(), 800_000);
        assert_eq!(driver.commits(), vec![800_000]);

        // Within min rate limit nothing is computed.
        util.set(0, 1024);
        group.update(0, 0, 1 * MS + 100 * US, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 800_000);
        group.update(0, 0, 2 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 2_000_000);
    }

    #[test]
    fn test_same_raw_skips_driver() {
        let util = Arc::new(FakeUtil::default());
        let (group, driver) = fast_group(Cpumask::from_cpus([0]), util.clone());

        util.set(0, 512);
        group.update(0, 0, 1 * MS, UpdateFlags::NORMAL);
        group.update(0, 0, 2 * MS, UpdateFlags::NORMAL);
        group.update(0, 0, 3 * MS, UpdateFlags::NORMAL);
        assert_eq!(driver.resolves(), 1);

        group.limits_changed().unwrap();
        group.update(0, 0, 3 * MS + 1, UpdateFlags::NORMAL);
        assert_eq!(driver.resolves(), 2);
    }

    #[test]
    fn test_deadline_goes_to_max() {
        let util = Arc::new(FakeUtil::default());
        let (group, _) = fast_group(Cpumask::from_cpus([0]), util.clone());

        util.set(0, 10);
        group.update(0, 0, 1 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 400_000);
        group.update(0, 0, 1 * MS + 500 * US, UpdateFlags::DEADLINE);
        assert_eq!(group.next_freq(), 2_000_000);
    }

    #[test]
    fn test_shared_takes_max_and_honors_deadline() {
        let util = Arc::new(FakeUtil::default());
        let (group, _) = fast_group(Cpumask::from_cpus([2, 3]), util.clone());
        assert!(group.is_shared());
        assert_eq!(group.policy(), 2);

        util.set(2, 100);
        util.set(3, 700);
        group.update(1, 3, 1 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 1_600_000);
        // CPU 3 still dominates, same raw frequency.
        group.update(0, 2, 2 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 1_600_000);

        // CPU 3 goes stale, CPU 2 drives the frequency down after the
        // down delay, damped.
        group.update(0, 2, 40 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), (1_600_000 + 400_000) / 2);

        group.update(1, 3, 41 * MS, UpdateFlags::DEADLINE);
        assert_eq!(group.next_freq(), 2_000_000);
    }

    #[test]
    fn test_remote_sample_without_permission() {
        let util = Arc::new(FakeUtil::default());
        let driver = Arc::new(
            TableDriver::new(table())
                .fast_switch(true)
                .update_from(Cpumask::from_cpus([0])),
        );
        let group = FrequencyGroup::new(
            Cpumask::from_cpus([0]),
            driver.clone(),
            util.clone(),
            Arc::new(NoIdleCalls),
            None,
            Arc::new(TunableSet::default()),
            &params(),
        )
        .unwrap();
        group.start();

        util.set(0, 512);
        group.update(0, 5, 1 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 0);
        group.update(0, 0, 1 * MS, UpdateFlags::NORMAL);
        assert_eq!(group.next_freq(), 800_000);
    }

    #[test]
    #[should_panic(expected = "stopped without being started")]
    fn test_stop_unstarted_panics() {
        let driver = Arc::new(TableDriver::new(table()).fast_switch(true));
        let group = FrequencyGroup::new(
            Cpumask::from_cpus([0]),
            driver,
            Arc::new(FakeUtil::default()),
            Arc::new(NoIdleCalls),
            None,
            Arc::new(TunableSet::default()),
            &params(),
        )
        .unwrap();
        group.stop();
    }
}
