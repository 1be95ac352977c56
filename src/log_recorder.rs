// Copyright (c) Netflix, Inc.
// Author: Jose Fernandez

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

/// Installs a recorder that periodically logs every commit counter, the
/// applied frequency of each policy and the blocking commit latencies.
///
/// ```no_run
/// use std::time::Duration;
/// use scx_freqgov::LogRecorderBuilder;
///
/// LogRecorderBuilder::new()
///     .with_reporting_interval(Duration::from_secs(3))
///     .install()
///     .unwrap();
/// ```
pub struct LogRecorderBuilder {
    reporting_interval: Duration,
}

impl Default for LogRecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {
            reporting_interval: Duration::from_secs(3),
        }
    }

    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    pub fn install(self) -> Result<()> {
        let recorder = LogRecorder {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        };
        recorder.start(self.reporting_interval)?;
        metrics::set_global_recorder(recorder).context("Failed to install log recorder")?;
        Ok(())
    }
}

struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h: &Arc<metrics_util::AtomicBucket<f64>>| {
                h.clone().into()
            })
    }
}

impl LogRecorder {
    fn start(&self, reporting_interval: Duration) -> Result<()> {
        let registry = self.registry.clone();

        thread::Builder::new()
            .name("freqgov-metrics".into())
            .spawn(move || {
                let mut prev_counters: HashMap<Key, u64> = HashMap::new();
                let mut prev_instant = Instant::now();

                loop {
                    thread::sleep(reporting_interval.saturating_sub(prev_instant.elapsed()));

                    let period_secs = prev_instant.elapsed().as_secs_f64();
                    prev_instant = Instant::now();

                    log_counters(&registry, &mut prev_counters, period_secs);
                    log_gauges(&registry);
                    log_histograms(&registry);
                }
            })
            .context("Failed to spawn metrics reporter")?;
        Ok(())
    }
}

fn describe(key: &Key) -> String {
    let mut name = key.name().to_string();
    for label in key.labels() {
        name.push_str(&format!(" {}={}", label.key(), label.value()));
    }
    name
}

fn log_counters(
    registry: &Registry<Key, AtomicStorage>,
    prev_counters: &mut HashMap<Key, u64>,
    period_secs: f64,
) {
    // name -> [(key, value)]
    let mut by_name: BTreeMap<String, Vec<(Key, u64)>> = BTreeMap::new();
    for (key, counter) in registry.get_counter_handles() {
        let value = counter.load(Relaxed);
        by_name
            .entry(key.name().to_string())
            .or_default()
            .push((key, value));
    }

    for (name, mut values) in by_name {
        values.sort_by(|a, b| b.1.cmp(&a.1));
        let total: u64 = values.iter().map(|(_, v)| *v).sum();
        let rate = |key: &Key, value: u64, prev: &HashMap<Key, u64>| {
            let prev = prev.get(key).copied().unwrap_or(0);
            value.saturating_sub(prev) as f64 / period_secs.max(f64::EPSILON)
        };
        let total_rate: f64 = values
            .iter()
            .map(|(key, value)| rate(key, *value, prev_counters))
            .sum();

        info!("{}: {} [{:.1}/s]", name, total, total_rate);
        if values.len() > 1 {
            for (key, value) in values.iter() {
                let pct = if total == 0 {
                    0.0
                } else {
                    *value as f64 * 100.0 / total as f64
                };
                let labels: Vec<String> = key.labels().map(|l| l.value().to_string()).collect();
                info!(
                    "  {}: {} ({:.1}%) [{:.1}/s]",
                    labels.join(","),
                    value,
                    pct,
                    rate(key, *value, prev_counters)
                );
            }
        }

        for (key, value) in values {
            prev_counters.insert(key, value);
        }
    }
}

fn log_gauges(registry: &Registry<Key, AtomicStorage>) {
    let mut gauges: Vec<(Key, f64)> = registry
        .get_gauge_handles()
        .into_iter()
        .map(|(key, gauge)| (key, f64::from_bits(gauge.load(Relaxed))))
        .collect();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in gauges {
        info!("{}: {:.0}", describe(&key), value);
    }
}

fn log_histograms(registry: &Registry<Key, AtomicStorage>) {
    let mut handles: Vec<_> = registry.get_histogram_handles().into_iter().collect();
    handles.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, histogram) in handles {
        let mut sum = 0.0;
        let mut count = 0;
        let mut min = f64::MAX;
        let mut max = 0.0f64;

        // Drain so the bucket doesn't grow without bound.
        histogram.clear_with(|elements| {
            for &element in elements {
                sum += element;
                count += 1;
                min = min.min(element);
                max = max.max(element);
            }
        });
        if count == 0 {
            continue;
        }

        info!(
            "{}: n={} avg={:.2} min={:.2} max={:.2}",
            describe(&key),
            count,
            sum / count as f64,
            min,
            max
        );
    }
}
