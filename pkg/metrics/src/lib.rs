//! Prometheus text-format metrics for the lease coordinator.

pub mod lease;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub use lease::LeaseMetrics;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
}

struct Family {
    help: String,
    metric: Metric,
}

/// Thread-safe registry. Callers keep the returned handles and update them
/// without touching the registry again; only rendering takes the lock.
///
/// Every sample carries the registry's constant labels, so several
/// coordinators in one process stay distinguishable.
#[derive(Default)]
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
    const_labels: Vec<(String, String)>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_const_label(mut self, key: &str, value: &str) -> Self {
        self.const_labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Register a counter, or return the existing one with that name.
    ///
    /// A name already taken by a gauge yields a detached counter that is
    /// never rendered.
    pub fn register_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        let family = families.entry(name.to_string()).or_insert_with(|| Family {
            help: help.to_string(),
            metric: Metric::Counter(Arc::new(Counter::default())),
        });
        match &family.metric {
            Metric::Counter(c) => c.clone(),
            Metric::Gauge(_) => Arc::new(Counter::default()),
        }
    }

    /// Register a gauge, or return the existing one with that name.
    pub fn register_gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        let family = families.entry(name.to_string()).or_insert_with(|| Family {
            help: help.to_string(),
            metric: Metric::Gauge(Arc::new(Gauge::default())),
        });
        match &family.metric {
            Metric::Gauge(g) => g.clone(),
            Metric::Counter(_) => Arc::new(Gauge::default()),
        }
    }

    fn labels(&self) -> String {
        if self.const_labels.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = self
            .const_labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        format!("{{{}}}", pairs.join(","))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let labels = self.labels();
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        let mut output = String::new();
        for (name, family) in families.iter() {
            let (kind, value) = match &family.metric {
                Metric::Counter(c) => ("counter", c.get().to_string()),
                Metric::Gauge(g) => ("gauge", g.get().to_string()),
            };
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} {}", name, kind);
            let _ = writeln!(output, "{}{} {}", name, labels, value);
        }
        output
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
