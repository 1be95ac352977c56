// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Getting an accepted frequency to the driver.
//!
//! Drivers that can switch frequency without sleeping are called right away
//! from the sampling context. Everything else goes through a dedicated
//! worker thread per policy. The sampling side only ever kicks the worker
//! once per pending frequency: while a commit is queued, newer decisions
//! just move `next_freq` and the worker picks up whatever is latest when
//! it gets to run.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::Sender;
use crossbeam::channel::TrySendError;
use log::debug;
use log::trace;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;

use crate::Cpumask;
use crate::Freq;
use crate::FreqDriver;

/// Commit bookkeeping shared between the sampling side and the worker.
#[derive(Debug, Default)]
pub struct CommitState {
    /// Frequency last applied by the driver.
    pub cur: AtomicU32,
    /// A deferred commit is queued and hasn't snapshotted `next_freq` yet.
    /// Only written with the group's state lock held.
    pub work_in_progress: AtomicBool,
    /// Serializes the blocking driver calls of a policy.
    pub work_lock: Mutex<()>,
}

impl CommitState {
    pub fn cur(&self) -> Freq {
        self.cur.load(Ordering::Relaxed)
    }

    pub fn in_progress(&self) -> bool {
        self.work_in_progress.load(Ordering::Acquire)
    }

    /// Run `f` with the blocking commit path quiesced.
    pub fn with_work_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.work_lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

/// Outcome of [`Worker::kick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kick {
    Queued,
    /// A commit is already waiting in the queue.
    Coalesced,
    /// The worker thread is gone, nothing will run.
    Gone,
}

pub enum Work {
    Commit,
    Flush(Sender<()>),
    Exit,
}

/// A thread consuming [`Work`] from a single-slot queue.
pub struct Worker {
    tx: Sender<Work>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker calling `commit` for every queued commit. With
    /// `rt_priority`, the thread runs SCHED_FIFO at that priority. The
    /// thread is restricted to `cpus` when possible.
    pub fn spawn(
        name: String,
        rt_priority: Option<i32>,
        cpus: &Cpumask,
        mut commit: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Work>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let cpus = cpus.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = set_affinity(&cpus) {
                    warn!("Failed to bind worker to {}: {:#}", cpus, e);
                }
                if let Some(prio) = rt_priority {
                    if let Err(e) = set_fifo(prio) {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                }
                let _ = ready_tx.send(Ok(()));

                while let Ok(work) = rx.recv() {
                    match work {
                        Work::Commit => commit(),
                        Work::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        Work::Exit => break,
                    }
                }
            })
            .with_context(|| format!("Failed to spawn {}", name))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| anyhow!("{} exited during startup", name))
            .and_then(|r| r);
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        debug!("Started {}", name);
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue a commit.
    pub fn kick(&self) -> Kick {
        match self.tx.try_send(Work::Commit) {
            Ok(()) => Kick::Queued,
            Err(TrySendError::Full(_)) => Kick::Coalesced,
            Err(TrySendError::Disconnected(_)) => {
                warn!("Frequency worker is gone, dropping commit");
                Kick::Gone
            }
        }
    }

    /// Wait until everything queued so far has been processed.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Work::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.tx.send(Work::Exit);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn set_fifo(prio: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: prio,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        bail!(
            "Failed to set SCHED_FIFO priority {}: {}",
            prio,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn set_affinity(cpus: &Cpumask) -> Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }

    let ret = unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        for cpu in cpus.iter().filter(|&cpu| cpu < libc::CPU_SETSIZE as usize) {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
        libc::sched_setaffinity(0, std::mem::size_of_val(&cpu_set), &cpu_set)
    };
    if ret != 0 {
        bail!("{}", std::io::Error::last_os_error());
    }
    Ok(())
}

pub enum CommitPath {
    Immediate,
    Deferred(Worker),
}

struct Metrics {
    immediate: Counter,
    deferred: Counter,
    rejected: Counter,
    errors: Counter,
    freq: Gauge,
    commit_us: Histogram,
}

impl Metrics {
    fn new(policy: usize) -> Self {
        Self {
            immediate: counter!("freq_commits_total", "path" => "immediate"),
            deferred: counter!("freq_commits_total", "path" => "deferred"),
            rejected: counter!("freq_commit_rejected_total"),
            errors: counter!("freq_commit_errors_total"),
            freq: gauge!("policy_freq_khz", "policy" => policy.to_string()),
            commit_us: histogram!("freq_commit_latency_us", "policy" => policy.to_string()),
        }
    }
}

/// Commit path of one policy, chosen once from the driver's capabilities.
pub struct CommitDispatcher {
    path: CommitPath,
    driver: Arc<dyn FreqDriver>,
    state: Arc<CommitState>,
    metrics: Arc<Metrics>,
}

impl CommitDispatcher {
    pub fn immediate(policy: usize, driver: Arc<dyn FreqDriver>, state: Arc<CommitState>) -> Self {
        Self {
            path: CommitPath::Immediate,
            driver,
            state,
            metrics: Arc::new(Metrics::new(policy)),
        }
    }

    /// Start the policy's worker. `snapshot` is called by the worker to read
    /// the frequency to commit; it must clear `work_in_progress` under the
    /// same lock `next_freq` is protected by.
    pub fn deferred(
        policy: usize,
        cpus: &Cpumask,
        rt_priority: Option<i32>,
        driver: Arc<dyn FreqDriver>,
        state: Arc<CommitState>,
        snapshot: impl Fn() -> Freq + Send + 'static,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new(policy));
        let commit = {
            let driver = driver.clone();
            let state = state.clone();
            let metrics = metrics.clone();
            move || {
                let freq = snapshot();
                let started_at = Instant::now();
                state.with_work_lock(|| match driver.commit_blocking(freq) {
                    Ok(()) => {
                        state.cur.store(freq, Ordering::Relaxed);
                        metrics.deferred.increment(1);
                        metrics.freq.set(freq as f64);
                        metrics
                            .commit_us
                            .record(started_at.elapsed().as_secs_f64() * 1_000_000.0);
                        trace!("policy{}: committed {}kHz", policy, freq);
                    }
                    Err(e) => {
                        metrics.errors.increment(1);
                        warn!("policy{}: failed to set {}kHz: {:#}", policy, freq, e);
                    }
                })
            }
        };

        let worker = Worker::spawn(format!("freqgov:{}", policy), rt_priority, cpus, commit)?;
        Ok(Self {
            path: CommitPath::Deferred(worker),
            driver,
            state,
            metrics,
        })
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.path, CommitPath::Immediate)
    }

    /// Hand an accepted frequency to the driver. Must be called with the
    /// group's state lock held.
    pub fn dispatch(&self, freq: Freq) {
        match &self.path {
            CommitPath::Immediate => match self.driver.commit_immediate(freq) {
                Some(applied) => {
                    self.state.cur.store(applied, Ordering::Relaxed);
                    self.metrics.immediate.increment(1);
                    self.metrics.freq.set(applied as f64);
                }
                None => self.metrics.rejected.increment(1),
            },
            CommitPath::Deferred(worker) => {
                if self.state.in_progress() {
                    return;
                }
                self.state.work_in_progress.store(true, Ordering::Release);
                match worker.kick() {
                    Kick::Queued => {}
                    Kick::Coalesced => trace!("Commit of {}kHz coalesced", freq),
                    // Nobody will clear it.
                    Kick::Gone => self.state.work_in_progress.store(false, Ordering::Release),
                }
            }
        }
    }

    /// Wait for queued deferred commits to complete.
    pub fn flush(&self) {
        if let CommitPath::Deferred(worker) = &self.path {
            worker.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::TableDriver;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_coalesces_and_flushes() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = {
            let runs = runs.clone();
            Worker::spawn("freqgov:test".into(), None, &Cpumask::new(), move || {
                let _ = gate_rx.recv();
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        // First commit is picked up and blocks on the gate, the second sits
        // in the slot and the third finds it full.
        assert_eq!(worker.kick(), Kick::Queued);
        while !worker.tx.is_empty() {
            std::thread::yield_now();
        }
        assert_eq!(worker.kick(), Kick::Queued);
        assert_eq!(worker.kick(), Kick::Coalesced);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        worker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_immediate_stores_applied_freq() {
        let driver = Arc::new(TableDriver::new(vec![500_000, 1_000_000, 1_500_000]).fast_switch(true));
        let state = Arc::new(CommitState::default());
        let dispatcher = CommitDispatcher::immediate(0, driver.clone(), state.clone());

        assert!(dispatcher.is_immediate());
        dispatcher.dispatch(1_000_000);
        assert_eq!(state.cur(), 1_000_000);

        driver.reject_commits(true);
        dispatcher.dispatch(1_500_000);
        assert_eq!(state.cur(), 1_000_000);
    }

    #[test]
    fn test_deferred_commits_snapshot() {
        let driver = Arc::new(TableDriver::new(vec![500_000, 1_000_000]));
        let state = Arc::new(CommitState::default());
        let next = Arc::new(AtomicU32::new(1_000_000));
        let dispatcher = {
            let state = state.clone();
            let next = next.clone();
            CommitDispatcher::deferred(0, &Cpumask::new(), None, driver.clone(), state.clone(), move || {
                state.work_in_progress.store(false, Ordering::Release);
                next.load(Ordering::SeqCst)
            })
            .unwrap()
        };

        assert!(!dispatcher.is_immediate());
        dispatcher.dispatch(1_000_000);
        dispatcher.flush();
        assert_eq!(state.cur(), 1_000_000);
        assert!(!state.in_progress());
        assert_eq!(driver.commits(), vec![1_000_000]);
    }

    #[test]
    fn test_dead_worker_releases_in_progress() {
        let driver = Arc::new(TableDriver::new(vec![500_000, 1_000_000]));
        let state = Arc::new(CommitState::default());
        let mut dispatcher = {
            let state = state.clone();
            CommitDispatcher::deferred(0, &Cpumask::new(), None, driver.clone(), state.clone(), move || {
                state.work_in_progress.store(false, Ordering::Release);
                panic!("snapshot failed");
            })
            .unwrap()
        };

        dispatcher.dispatch(1_000_000);
        if let CommitPath::Deferred(worker) = &mut dispatcher.path {
            assert!(worker.handle.take().unwrap().join().is_err());
            assert_eq!(worker.kick(), Kick::Gone);
        }
        assert!(!state.in_progress());

        // The queue is disconnected now, the flag must not stick.
        dispatcher.dispatch(500_000);
        assert!(!state.in_progress());
        assert!(driver.commits().is_empty());
    }
}
