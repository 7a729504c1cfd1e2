//! Prometheus counters for catalog and health activity, served on
//! `/metrics` by the status API.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    /// Records that changed the visible catalog, local or gossiped
    pub records_merged: IntCounter,
    /// Gossiped records refused as malformed
    pub records_rejected: IntCounter,
    /// Tombstones written, by reason: local, lease, host
    pub tombstones: IntCounterVec,
    /// Tombstones dropped after outliving the tombstone lifespan
    pub tombstones_removed: IntCounter,
    /// Health check outcomes, by result: success, failure
    pub health_checks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("sidecar".to_string()), None)?;

        let records_merged = IntCounter::new("records_merged_total", "Records that changed the catalog")?;
        let records_rejected = IntCounter::new("records_rejected_total", "Gossiped records rejected as malformed")?;
        let tombstones = IntCounterVec::new(
            Opts::new("tombstones_total", "Tombstones written"),
            &["reason"],
        )?;
        let tombstones_removed = IntCounter::new("tombstones_removed_total", "Tombstones aged out of the catalog")?;
        let health_checks = IntCounterVec::new(
            Opts::new("health_checks_total", "Health check results"),
            &["result"],
        )?;

        registry.register(Box::new(records_merged.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(tombstones.clone()))?;
        registry.register(Box::new(tombstones_removed.clone()))?;
        registry.register(Box::new(health_checks.clone()))?;

        Ok(Self {
            registry,
            records_merged,
            records_rejected,
            tombstones,
            tombstones_removed,
            health_checks,
        })
    }

    pub fn tombstoned(&self, reason: &str, count: usize) {
        self.tombstones.with_label_values(&[reason]).inc_by(count as u64);
    }

    pub fn check_result(&self, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.health_checks.with_label_values(&[result]).inc();
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
