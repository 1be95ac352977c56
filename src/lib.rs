// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utilization-driven CPU frequency governor
//!
//! This crate decides, for each cpufreq policy (a set of CPUs sharing one
//! clock), the next frequency to request given a stream of per-CPU
//! utilization samples. Every sample runs through the same pipeline:
//!
//! 1. per-CPU I/O-wait boost and busy tracking,
//! 2. for policies spanning several CPUs, aggregation of every live CPU's
//!    latest sample,
//! 3. utilization to frequency mapping, optionally boosted through the
//!    energy model,
//! 4. asymmetric up/down rate limiting,
//! 5. commit, either immediately in the caller's context (fast switch) or
//!    through a dedicated per-policy worker thread.
//!
//! The platform side (frequency driver, utilization source, idle-entry
//! counters) is abstracted behind the traits in [`platform`]. The
//! [`drivers`] and [`procstat`] modules provide Linux implementations on top
//! of the cpufreq sysfs interface and `/proc/stat`, which is what the
//! `scx_freqgov` binary uses.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

pub mod misc;

pub mod energy_model;
pub use energy_model::EnergyDomain;
pub use energy_model::EnergyModel;

pub mod platform;
pub use platform::CpuUtil;
pub use platform::Freq;
pub use platform::FreqDriver;
pub use platform::FreqLimits;
pub use platform::IdleCalls;
pub use platform::NoIdleCalls;
pub use platform::UpdateFlags;
pub use platform::UtilSource;

pub mod freq;
pub mod iowait;
pub mod busy;
pub mod rate_limit;
pub mod aggregate;
pub mod dispatch;

mod group;
pub use group::FrequencyGroup;

pub mod tunables;
pub use tunables::RateLimitWrites;
pub use tunables::TunableSet;

mod governor;
pub use governor::Governor;
pub use governor::GovernorConfig;
pub use governor::Policy;

pub mod drivers;
pub mod procstat;

mod log_recorder;
pub use log_recorder::LogRecorderBuilder;
