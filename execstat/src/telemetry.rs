//! Metrics published from each sampling cycle.
//!
//! Instruments live in an OpenTelemetry meter provider whose reader is a Prometheus
//! exporter, so the same registry can be scraped over HTTP while the sampling loop keeps
//! writing to it.
//!
//! Exposed series (Prometheus appends `_total` to counters; do NOT add it to the names here):
//! - `execstat_execve_calls_total{comm}`: per-name execve calls, never decreasing
//! - `execstat_process_instances{comm}`: map entries per name in the latest sample
//! - `execstat_execve_calls_all_total`: all execve calls, never decreasing

use anyhow::{Context, Result};
use log::{debug, info, warn};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter, MeterProvider as _, ObservableGauge};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::aggregate::AggregatedStat;

const METER_NAME: &str = "execstat";

const COMM_LABEL: &str = "comm";

/// Meter provider plus the Prometheus registry it feeds.
pub struct Telemetry {
    registry: Registry,
    provider: SdkMeterProvider,
}

/// Build a meter provider backed by a fresh Prometheus registry.
pub fn init_metrics() -> Result<Telemetry> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .without_scope_info()
        .without_target_info()
        .build()
        .context("Failed to create Prometheus exporter")?;

    let provider = SdkMeterProvider::builder().with_reader(exporter).build();

    info!("Metrics registry initialized");
    Ok(Telemetry { registry, provider })
}

impl Telemetry {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter(METER_NAME)
    }

    pub fn shutdown(&self) {
        info!("Shutting down metrics provider...");
        if let Err(e) = self.provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct NameCounter {
    /// Total observed in the previous sample; deltas are measured from here.
    baseline: u64,
    /// Cumulative value exposed so far.
    exposed: u64,
}

/// Increments to apply for one sample.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleDelta {
    /// `(name, increment)` in report order.
    pub per_name: Vec<(String, u64)>,
    pub global: u64,
}

/// Last observed totals and exposed counter values, per process name.
///
/// A total that drops below its baseline (map reset, entry recycled) adds nothing and becomes
/// the new baseline, so exposed values only ever grow.
#[derive(Debug, Default)]
pub struct CounterState {
    names: HashMap<String, NameCounter>,
    global_exposed: u64,
}

impl CounterState {
    pub fn advance(&mut self, stats: &[AggregatedStat]) -> CycleDelta {
        let mut delta = CycleDelta::default();

        for stat in stats {
            let counter = self.names.entry(stat.name.clone()).or_default();
            let current = stat.total_count;

            let increment = if current >= counter.baseline {
                current - counter.baseline
            } else {
                debug!(
                    "Total for {} dropped from {} to {}; rebasing",
                    stat.name, counter.baseline, current
                );
                0
            };

            counter.baseline = current;
            counter.exposed = counter.exposed.saturating_add(increment);
            delta.global = delta.global.saturating_add(increment);
            delta.per_name.push((stat.name.clone(), increment));
        }

        self.global_exposed = self.global_exposed.saturating_add(delta.global);
        delta
    }

    pub fn exposed(&self, name: &str) -> Option<u64> {
        self.names.get(name).map(|c| c.exposed)
    }

    pub fn baseline(&self, name: &str) -> Option<u64> {
        self.names.get(name).map(|c| c.baseline)
    }

    pub fn global_exposed(&self) -> u64 {
        self.global_exposed
    }
}

/// Writes aggregated samples into the metric instruments.
pub struct MetricPublisher {
    state: CounterState,
    execve_calls: Counter<u64>,
    execve_calls_all: Counter<u64>,
    instances: Arc<RwLock<HashMap<String, u64>>>,
    _instances_gauge: ObservableGauge<u64>,
}

impl MetricPublisher {
    pub fn new(meter: &Meter, state: CounterState) -> Self {
        let execve_calls = meter
            .u64_counter("execstat_execve_calls")
            .with_description("execve calls per process name")
            .build();
        let execve_calls_all = meter
            .u64_counter("execstat_execve_calls_all")
            .with_description("execve calls across all process names")
            .build();
        // Expose the global series from the start, before the first sample lands.
        execve_calls_all.add(0, &[]);

        let instances: Arc<RwLock<HashMap<String, u64>>> = Arc::default();
        let snapshot = instances.clone();
        let instances_gauge = meter
            .u64_observable_gauge("execstat_process_instances")
            .with_description("Map entries per process name in the latest sample")
            .with_callback(move |observer| {
                if let Ok(instances) = snapshot.read() {
                    for (name, count) in instances.iter() {
                        observer.observe(*count, &[KeyValue::new(COMM_LABEL, name.clone())]);
                    }
                }
            })
            .build();

        Self {
            state,
            execve_calls,
            execve_calls_all,
            instances,
            _instances_gauge: instances_gauge,
        }
    }

    pub fn publish(&mut self, stats: &[AggregatedStat]) {
        let delta = self.state.advance(stats);

        for (name, increment) in &delta.per_name {
            self.execve_calls
                .add(*increment, &[KeyValue::new(COMM_LABEL, name.clone())]);
        }
        self.execve_calls_all.add(delta.global, &[]);

        let current: HashMap<String, u64> = stats
            .iter()
            .map(|s| (s.name.clone(), s.executions as u64))
            .collect();
        match self.instances.write() {
            Ok(mut instances) => *instances = current,
            Err(poisoned) => *poisoned.into_inner() = current,
        }

        debug!(
            "Published {} names, +{} calls (total {})",
            stats.len(),
            delta.global,
            self.state.global_exposed()
        );
    }

    pub fn state(&self) -> &CounterState {
        &self.state
    }
}
