use std::sync::Arc;

use crate::{Counter, Gauge, MetricsRegistry};

pub const LEASE_ACQUIRED_TOTAL: &str = "lease_acquired_total";
pub const LEASE_ACQUIRE_FAILED_TOTAL: &str = "lease_acquire_failed_total";
pub const LEASE_RENEW_FAILED_TOTAL: &str = "lease_renew_failed_total";
pub const LEASE_RELEASED_TOTAL: &str = "lease_released_total";
pub const RECONCILE_TICKS_TOTAL: &str = "reconcile_ticks_total";
pub const RECONCILE_STORE_ERRORS_TOTAL: &str = "reconcile_store_errors_total";
pub const LEASES_OWNED: &str = "leases_owned";
pub const LIVE_INSTANCES: &str = "live_instances";
pub const POLLERS_RUNNING: &str = "pollers_running";

/// Handles for every metric the coordinator updates.
#[derive(Clone)]
pub struct LeaseMetrics {
    pub acquired: Arc<Counter>,
    pub acquire_failed: Arc<Counter>,
    pub renew_failed: Arc<Counter>,
    pub released: Arc<Counter>,
    pub ticks: Arc<Counter>,
    pub store_errors: Arc<Counter>,
    pub leases_owned: Arc<Gauge>,
    pub live_instances: Arc<Gauge>,
    pub pollers_running: Arc<Gauge>,
}

impl LeaseMetrics {
    pub fn register(registry: &MetricsRegistry) -> Self {
        Self {
            acquired: registry.register_counter(LEASE_ACQUIRED_TOTAL, "Leases acquired"),
            acquire_failed: registry
                .register_counter(LEASE_ACQUIRE_FAILED_TOTAL, "Lease acquisitions that failed"),
            renew_failed: registry
                .register_counter(LEASE_RENEW_FAILED_TOTAL, "Lease renewals that failed"),
            released: registry.register_counter(LEASE_RELEASED_TOTAL, "Leases released"),
            ticks: registry.register_counter(RECONCILE_TICKS_TOTAL, "Reconciliation ticks run"),
            store_errors: registry.register_counter(
                RECONCILE_STORE_ERRORS_TOTAL,
                "Store errors seen during reconciliation",
            ),
            leases_owned: registry.register_gauge(LEASES_OWNED, "Leases currently owned"),
            live_instances: registry
                .register_gauge(LIVE_INSTANCES, "Instances in the current live set"),
            pollers_running: registry.register_gauge(POLLERS_RUNNING, "Running poller tasks"),
        }
    }

    /// Metrics bound to a private registry, for callers that do not export them.
    pub fn detached() -> Self {
        Self::register(&MetricsRegistry::new())
    }
}
