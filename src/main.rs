// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_freqgov::drivers::SysfsPolicy;
use scx_freqgov::drivers::TableDriver;
use scx_freqgov::drivers::DEFAULT_CPUFREQ_ROOT;
use scx_freqgov::energy_model::DEFAULT_EM_ROOT;
use scx_freqgov::misc::read_from_file;
use scx_freqgov::procstat::ProcSampler;
use scx_freqgov::procstat::DEFAULT_CPU_ROOT;
use scx_freqgov::EnergyModel;
use scx_freqgov::Freq;
use scx_freqgov::FreqDriver;
use scx_freqgov::Governor;
use scx_freqgov::GovernorConfig;
use scx_freqgov::LogRecorderBuilder;
use scx_freqgov::Policy;
use scx_freqgov::RateLimitWrites;

/// scx_freqgov: A utilization-driven CPU frequency governor
///
/// Every sampling interval, the per-CPU utilization is read from /proc/stat
/// and fed to the governor instance of the CPU's cpufreq policy, which maps
/// it to a frequency with 25% headroom. Frequency increases are allowed
/// after 500us and decreases after 20ms since the last change, and
/// decreases are damped to the average of the current and the requested
/// frequency. CPUs waking from I/O wait get a boost that doubles on every
/// consecutive wait and decays once they stop.
///
/// On policies spanning several CPUs, the most utilized CPU that reported
/// recently enough decides the frequency.
///
/// Frequencies are written to scaling_setspeed by a dedicated thread per
/// policy. The policies are switched to the userspace governor for the
/// lifetime of the process and their previous governors are restored on
/// exit. With --dry-run, nothing is written and decisions are only logged.
#[derive(Debug, Parser)]
struct Opts {
    /// Sampling interval in milliseconds.
    #[clap(short = 'i', long, default_value = "10")]
    interval_ms: u64,

    /// A CPU whose last sample is older than this many microseconds loses
    /// its I/O wait boost.
    #[clap(short = 't', long, default_value = "4000")]
    tick_us: u64,

    /// Load tracking window in microseconds. CPUs of a shared policy that
    /// haven't reported for 1.125 windows don't take part in its frequency
    /// decision.
    #[clap(short = 'l', long, default_value = "20000")]
    load_window_us: u64,

    /// Give every policy its own tunables instead of sharing one set.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    per_policy_tunables: bool,

    /// Boost CPUs that wake up from I/O wait.
    #[clap(short = 'w', long, action = clap::ArgAction::SetTrue)]
    iowait_boost: bool,

    /// Whether writes to the rate limit tunables take effect.
    #[clap(long, value_enum, default_value_t = RateLimitWrites::Locked)]
    rate_limit_writes: RateLimitWrites,

    /// Up rate limit in microseconds. Only honored with
    /// --rate-limit-writes=tunable.
    #[clap(long)]
    up_rate_limit_us: Option<u32>,

    /// Down rate limit in microseconds. Only honored with
    /// --rate-limit-writes=tunable.
    #[clap(long)]
    down_rate_limit_us: Option<u32>,

    /// SCHED_FIFO priority of the per-policy commit threads. 0 leaves them
    /// under the default scheduling policy.
    #[clap(long, default_value = "50")]
    worker_rt_priority: i32,

    /// Don't touch cpufreq, only log the frequencies that would be set.
    #[clap(short = 'n', long, action = clap::ArgAction::SetTrue)]
    dry_run: bool,

    /// cpufreq sysfs directory holding the policyN directories.
    #[clap(long, default_value = DEFAULT_CPUFREQ_ROOT)]
    cpufreq_root: PathBuf,

    /// sysfs directory holding the cpuN directories.
    #[clap(long, default_value = DEFAULT_CPU_ROOT)]
    cpu_root: PathBuf,

    /// debugfs energy model directory. Frequencies of busy CPUs are raised
    /// to more efficient steps when it's available.
    #[clap(long, default_value = DEFAULT_EM_ROOT)]
    energy_model_root: PathBuf,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

struct Managed {
    id: usize,
    sysfs: Arc<SysfsPolicy>,
    mirror: Option<Arc<TableDriver>>,
}

impl Managed {
    fn driver(&self) -> &dyn FreqDriver {
        match &self.mirror {
            Some(mirror) => mirror.as_ref(),
            None => self.sysfs.as_ref(),
        }
    }

    /// Whether the sysfs limits moved away from what the driver has.
    fn limits_moved(&self) -> Result<Option<(Freq, Freq)>> {
        let path = self.sysfs.path();
        let min: Freq = read_from_file(&path.join("scaling_min_freq"))?;
        let max: Freq = read_from_file(&path.join("scaling_max_freq"))?;
        let limits = self.driver().limits();
        if (limits.min, limits.max) == (min, max) {
            return Ok(None);
        }
        Ok(Some((min, max)))
    }
}

struct Daemon {
    opts: Opts,
    governor: Governor,
    sampler: Arc<ProcSampler>,
    policies: Vec<Managed>,
    started_at: Instant,
}

impl Daemon {
    fn init(opts: Opts) -> Result<Self> {
        let sampler = Arc::new(ProcSampler::new(&opts.cpu_root)?);

        let energy = match EnergyModel::from_root(&opts.energy_model_root) {
            Ok(em) => {
                debug!("Energy model:\n{}", em);
                Some(em)
            }
            Err(e) => {
                debug!("No energy model: {:#}", e);
                None
            }
        };

        let config = GovernorConfig {
            tick_ns: opts.tick_us * 1000,
            load_window_ns: opts.load_window_us * 1000,
            per_policy_tunables: opts.per_policy_tunables,
            rate_limit_writes: opts.rate_limit_writes,
            worker_rt_priority: match opts.worker_rt_priority {
                0 => None,
                prio => Some(prio),
            },
        };
        let governor = Governor::new(config, sampler.clone(), sampler.clone(), energy);

        let mut daemon = Self {
            opts,
            governor,
            sampler,
            policies: vec![],
            started_at: Instant::now(),
        };
        for sysfs in SysfsPolicy::discover(&daemon.opts.cpufreq_root)? {
            if let Err(e) = daemon.manage(sysfs) {
                daemon.shutdown();
                return Err(e);
            }
        }
        Ok(daemon)
    }

    fn manage(&mut self, sysfs: SysfsPolicy) -> Result<()> {
        let sysfs = Arc::new(sysfs);
        let cpus = sysfs.cpus().clone();

        let (driver, mirror): (Arc<dyn FreqDriver>, _) = if self.opts.dry_run {
            let mirror = Arc::new(TableDriver::mirror(sysfs.as_ref(), sysfs.table()).verbose(true));
            (mirror.clone() as Arc<dyn FreqDriver>, Some(mirror))
        } else {
            sysfs.take_over()?;
            (sysfs.clone() as Arc<dyn FreqDriver>, None)
        };

        let id = match self.governor.init_policy(Policy::new(cpus, driver)) {
            Ok(id) => id,
            Err(e) => {
                if let Err(e) = sysfs.restore() {
                    warn!("{:#}", e);
                }
                return Err(e);
            }
        };
        self.policies.push(Managed { id, sysfs, mirror });
        self.governor.start(id)?;

        let tunables = self
            .governor
            .tunables(id)
            .context("Governor lost a policy it just initialized")?;
        tunables.store("iowait_boost_enable", if self.opts.iowait_boost { "1" } else { "0" })?;
        let rate_limits_set =
            self.opts.up_rate_limit_us.is_some() || self.opts.down_rate_limit_us.is_some();
        if rate_limits_set && tunables.rate_limit_writes() == RateLimitWrites::Locked {
            warn!("Rate limits are locked, pass --rate-limit-writes=tunable to change them");
        }
        if let Some(us) = self.opts.up_rate_limit_us {
            tunables.store("up_rate_limit_us", &us.to_string())?;
        }
        if let Some(us) = self.opts.down_rate_limit_us {
            tunables.store("down_rate_limit_us", &us.to_string())?;
        }
        Ok(())
    }

    fn now(&self) -> u64 {
        self.started_at.elapsed().as_nanos() as u64
    }

    fn check_limits(&self) {
        for policy in self.policies.iter() {
            match policy.limits_moved() {
                Ok(None) => {}
                Ok(Some((min, max))) => {
                    info!("policy{}: limits {}-{}kHz", policy.id, min, max);
                    if let Some(mirror) = &policy.mirror {
                        mirror.set_limits(min, max);
                    }
                    if let Err(e) = self.governor.limits_changed(policy.id) {
                        warn!("policy{}: {:#}", policy.id, e);
                    }
                }
                Err(e) => warn!("policy{}: {:#}", policy.id, e),
            }
        }
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = Duration::from_millis(self.opts.interval_ms.max(1));
        let limits_interval = Duration::from_secs(1);
        let mut next_limits_at = Instant::now() + limits_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();

            for (cpu, flags) in self.sampler.refresh()? {
                self.governor.on_sample(cpu, self.now(), flags);
            }

            if started >= next_limits_at {
                self.check_limits();
                next_limits_at = started + limits_interval;
            }

            std::thread::sleep(interval.saturating_sub(started.elapsed()));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for policy in self.policies.drain(..) {
            let started = self
                .governor
                .group(policy.id)
                .map_or(false, |group| group.is_started());
            let ret = match started {
                true => self.governor.stop(policy.id),
                false => Ok(()),
            };
            if let Err(e) = ret.and_then(|_| self.governor.exit_policy(policy.id)) {
                warn!("policy{}: {:#}", policy.id, e);
            }
            if let Err(e) = policy.sysfs.restore() {
                warn!("policy{}: {:#}", policy.id, e);
            }
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    } else {
        LogRecorderBuilder::new()
            .with_reporting_interval(Duration::from_secs(3))
            .install()?;
    }

    let mut daemon = Daemon::init(opts)?;
    info!(
        "scx_freqgov running on {} policies{}",
        daemon.policies.len(),
        if daemon.opts.dry_run { " (dry run)" } else { "" }
    );

    let ret = daemon.run(shutdown);
    daemon.shutdown();
    ret
}
