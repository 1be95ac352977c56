// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::info;
use log::warn;

use crate::aggregate::stale_ns;
use crate::group::GroupParams;
use crate::tunables::TunablesRegistry;
use crate::Cpumask;
use crate::EnergyDomain;
use crate::EnergyModel;
use crate::FreqDriver;
use crate::FrequencyGroup;
use crate::IdleCalls;
use crate::RateLimitWrites;
use crate::TunableSet;
use crate::UpdateFlags;
use crate::UtilSource;

#[derive(Clone, Debug)]
pub struct GovernorConfig {
    /// A CPU whose last sample is older than this loses its I/O wait boost.
    pub tick_ns: u64,
    /// Load tracking window. CPUs of a shared policy that haven't reported
    /// for 1.125 windows are ignored.
    pub load_window_ns: u64,
    /// One tunable set per policy instead of a single global one.
    pub per_policy_tunables: bool,
    pub rate_limit_writes: RateLimitWrites,
    /// SCHED_FIFO priority of the commit workers.
    pub worker_rt_priority: Option<i32>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            tick_ns: 4_000_000,
            load_window_ns: 20_000_000,
            per_policy_tunables: false,
            rate_limit_writes: RateLimitWrites::Locked,
            worker_rt_priority: None,
        }
    }
}

/// A set of CPUs sharing one clock and the driver controlling it.
#[derive(Clone)]
pub struct Policy {
    pub cpus: Cpumask,
    pub driver: Arc<dyn FreqDriver>,
}

impl Policy {
    pub fn new(cpus: Cpumask, driver: Arc<dyn FreqDriver>) -> Self {
        Self { cpus, driver }
    }
}

struct Hook {
    group: Arc<FrequencyGroup>,
    slot: usize,
}

/// Routes samples to the governor instance of each policy and drives the
/// instances' lifecycle.
pub struct Governor {
    params: GroupParams,
    util: Arc<dyn UtilSource>,
    idle: Arc<dyn IdleCalls>,
    energy: Option<EnergyModel>,
    registry: TunablesRegistry,
    groups: Mutex<BTreeMap<usize, Arc<FrequencyGroup>>>,
    hooks: RwLock<BTreeMap<usize, Hook>>,
}

impl Governor {
    pub fn new(
        config: GovernorConfig,
        util: Arc<dyn UtilSource>,
        idle: Arc<dyn IdleCalls>,
        energy: Option<EnergyModel>,
    ) -> Self {
        Self {
            params: GroupParams {
                tick_ns: config.tick_ns,
                stale_ns: stale_ns(config.load_window_ns),
                rt_priority: config.worker_rt_priority,
            },
            util,
            idle,
            energy,
            registry: TunablesRegistry::new(config.per_policy_tunables, config.rate_limit_writes),
            groups: Mutex::new(BTreeMap::new()),
            hooks: RwLock::new(BTreeMap::new()),
        }
    }

    fn groups(&self) -> MutexGuard<'_, BTreeMap<usize, Arc<FrequencyGroup>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, policy: usize) -> Result<Arc<FrequencyGroup>> {
        self.groups()
            .get(&policy)
            .cloned()
            .ok_or_else(|| anyhow!("policy{} is not initialized", policy))
    }

    /// Set up the governor for `policy`. Returns the policy id.
    pub fn init_policy(&self, policy: Policy) -> Result<usize> {
        let Some(id) = policy.cpus.first() else {
            bail!("Policy without CPUs");
        };

        let mut groups = self.groups();
        if groups.contains_key(&id) {
            bail!("policy{} is already initialized", id);
        }

        let domain = self
            .energy
            .as_ref()
            .and_then(|em| em.domain_for(&policy.cpus))
            .map(|pd| pd as Arc<dyn EnergyDomain>);

        let group = self.registry.attach_new(&policy.cpus, |tunables| {
            Ok(Arc::new(FrequencyGroup::new(
                policy.cpus.clone(),
                policy.driver.clone(),
                self.util.clone(),
                self.idle.clone(),
                domain,
                tunables,
                &self.params,
            )?))
        })?;

        info!("policy{}: initialized for CPUs {}", id, policy.cpus);
        groups.insert(id, group);
        Ok(id)
    }

    /// Tear down a stopped policy.
    pub fn exit_policy(&self, policy: usize) -> Result<()> {
        let mut groups = self.groups();
        let Some(group) = groups.get(&policy) else {
            bail!("policy{} is not initialized", policy);
        };
        if group.is_started() {
            bail!("policy{} must be stopped before exit", policy);
        }

        self.registry.detach(group);
        groups.remove(&policy);
        info!("policy{}: exited", policy);
        Ok(())
    }

    /// Reset the policy's state and start routing its CPUs' samples to it.
    pub fn start(&self, policy: usize) -> Result<()> {
        let group = self.lookup(policy)?;
        group.start();

        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        for (slot, cpu) in group.cpus().iter().enumerate() {
            if hooks.contains_key(&cpu) {
                warn!("CPU {} already hooked, replacing", cpu);
            }
            hooks.insert(
                cpu,
                Hook {
                    group: group.clone(),
                    slot,
                },
            );
        }
        Ok(())
    }

    /// Stop routing samples to the policy, wait for samples in flight and
    /// for queued commits.
    pub fn stop(&self, policy: usize) -> Result<()> {
        let group = self.lookup(policy)?;
        {
            // Updates hold the read side for their whole duration.
            let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
            for cpu in group.cpus().iter() {
                hooks.remove(&cpu);
            }
        }
        group.stop();
        Ok(())
    }

    pub fn limits_changed(&self, policy: usize) -> Result<()> {
        self.lookup(policy)?.limits_changed()
    }

    /// A sample of `cpu` taken on `cpu` itself.
    pub fn on_sample(&self, cpu: usize, now: u64, flags: UpdateFlags) {
        self.on_remote_sample(cpu, cpu, now, flags)
    }

    /// A sample of `cpu` taken on `origin_cpu`.
    pub fn on_remote_sample(&self, cpu: usize, origin_cpu: usize, now: u64, flags: UpdateFlags) {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = hooks.get(&cpu) {
            hook.group.update(hook.slot, origin_cpu, now, flags);
        }
    }

    pub fn is_hooked(&self, cpu: usize) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&cpu)
    }

    pub fn group(&self, policy: usize) -> Option<Arc<FrequencyGroup>> {
        self.groups().get(&policy).cloned()
    }

    pub fn tunables(&self, policy: usize) -> Option<Arc<TunableSet>> {
        self.group(policy).map(|g| g.tunables().clone())
    }

    pub fn policies(&self) -> Vec<usize> {
        self.groups().keys().copied().collect()
    }
}
