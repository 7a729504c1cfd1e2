//! Local health monitoring.
//!
//! Each discovered instance carries a small state machine:
//!
//! - `Unknown -> Healthy` on the first successful check
//! - `Healthy -> Unhealthy` after `failure_threshold` consecutive failures
//! - `Unhealthy -> Healthy` after `success_threshold` consecutive successes
//! - `Unknown -> Unhealthy` after `failure_threshold` consecutive failures
//!
//! An instance that drops out of discovery is forgotten and tombstoned in
//! the catalog straight away.

pub mod checker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use shared::types::{ServiceInstance, Status};
use crate::catalog_manager::CatalogHandle;
use crate::config::HealthConfig;
use crate::discovery::{DiscoveredService, Discoverer};
use crate::metrics::Metrics;
use checker::{build_checker, CheckSpec, HealthChecker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub failures: u32,
    pub successes: u32,
}

/// Debounce counters for one instance
#[derive(Debug, Clone)]
pub struct CheckState {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Default for CheckState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

impl CheckState {
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Fold in one check result. Returns the new status if it changed.
    pub fn record(&mut self, ok: bool, thresholds: Thresholds) -> Option<HealthStatus> {
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        let next = match self.status {
            HealthStatus::Unknown if ok => HealthStatus::Healthy,
            HealthStatus::Unhealthy if ok && self.consecutive_successes >= thresholds.successes => {
                HealthStatus::Healthy
            }
            HealthStatus::Unknown | HealthStatus::Healthy
                if !ok && self.consecutive_failures >= thresholds.failures =>
            {
                HealthStatus::Unhealthy
            }
            current => current,
        };

        if next == self.status {
            return None;
        }
        self.status = next;
        Some(next)
    }
}

struct Entry {
    service: ServiceInstance,
    spec: CheckSpec,
    checker: Arc<dyn HealthChecker>,
    state: CheckState,
}

pub struct Monitor {
    hostname: String,
    entries: Mutex<HashMap<String, Entry>>,
    default_check_host: String,
    default_check_endpoint: String,
    thresholds: Thresholds,
    check_timeout: Duration,
    max_concurrent: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Monitor {
    pub fn new(hostname: impl Into<String>, config: &HealthConfig, default_check_host: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            entries: Mutex::new(HashMap::new()),
            default_check_host: default_check_host.into(),
            default_check_endpoint: config.default_check_endpoint.clone(),
            thresholds: Thresholds {
                failures: config.failure_threshold,
                successes: config.success_threshold,
            },
            check_timeout: Duration::from_millis(config.check_timeout_millis),
            max_concurrent: config.max_concurrent_checks.max(1),
            metrics: None,
        }
    }

    /// Count check results in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The check discovery configured, or the default one
    fn check_spec(&self, svc: &DiscoveredService) -> CheckSpec {
        svc.check.clone().unwrap_or_else(|| self.default_check(svc))
    }

    /// Check used when discovery did not configure one: an HTTP GET of the
    /// default endpoint on the first exposed port.
    fn default_check(&self, svc: &DiscoveredService) -> CheckSpec {
        match svc.ports.first() {
            Some(port) => CheckSpec::HttpGet {
                url: format!(
                    "http://{}:{}{}",
                    self.default_check_host, port.port, self.default_check_endpoint
                ),
            },
            None => CheckSpec::AlwaysSuccessful,
        }
    }

    /// Start checking an instance. Its classification starts over as
    /// `Unknown`.
    fn track(&self, service: ServiceInstance, spec: CheckSpec) {
        let checker = build_checker(&spec);
        self.add(service, spec, checker);
    }

    fn add(&self, service: ServiceInstance, spec: CheckSpec, checker: Arc<dyn HealthChecker>) {
        tracing::info!("Adding health check for {} ({}): {}", service.id, service.name, checker.describe());
        self.entries().insert(
            service.id.clone(),
            Entry {
                service,
                spec,
                checker,
                state: CheckState::default(),
            },
        );
    }

    /// Sync tracked instances with one discovery poll. Departed instances
    /// are dropped and tombstoned in the catalog.
    pub async fn refresh(&self, disco: &dyn Discoverer, catalog: &CatalogHandle) -> Result<()> {
        let discovered = disco.enumerate().await?;
        let now = Utc::now();
        let present: HashSet<&str> = discovered.iter().map(|svc| svc.id.as_str()).collect();

        let mut fresh = Vec::new();
        let removed: Vec<String> = {
            let mut entries = self.entries();
            let removed: Vec<String> = entries
                .keys()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect();
            for id in &removed {
                entries.remove(id);
            }

            for svc in &discovered {
                let Some(entry) = entries.get_mut(&svc.id) else {
                    fresh.push(svc);
                    continue;
                };
                // keep the debounce state; follow address, port and check changes
                entry.service = svc.to_instance(&self.hostname, now);
                let spec = self.check_spec(svc);
                if spec != entry.spec {
                    entry.checker = build_checker(&spec);
                    tracing::info!("Health check for {} changed: {}", svc.id, entry.checker.describe());
                    entry.spec = spec;
                }
            }
            removed
        };

        for svc in fresh {
            self.track(svc.to_instance(&self.hostname, now), self.check_spec(svc));
        }

        if !removed.is_empty() {
            tracing::info!("Instances gone from discovery: {:?}", removed);
            catalog.tombstone_local(removed).await?;
        }
        Ok(())
    }

    /// Run every check once, at most `max_concurrent` at a time. A check
    /// that outlives the timeout counts as a failure.
    pub async fn check_all(&self) {
        let targets: Vec<(String, Arc<dyn HealthChecker>)> = self
            .entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.checker.clone()))
            .collect();

        let timeout = self.check_timeout;
        let checks: Vec<_> = targets
            .into_iter()
            .map(|(id, checker)| check_one(id, checker, timeout))
            .collect();
        let results: Vec<(String, bool)> = stream::iter(checks)
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut entries = self.entries();
        for (id, ok) in results {
            if let Some(metrics) = &self.metrics {
                metrics.check_result(ok);
            }
            // removed while its check was running
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            if let Some(status) = entry.state.record(ok, self.thresholds) {
                tracing::info!("{} ({}) is now {:?}", id, entry.service.name, status);
            }
        }
    }

    /// Instances currently classified healthy, as alive catalog records
    pub fn services(&self) -> Vec<ServiceInstance> {
        let mut services: Vec<ServiceInstance> = self
            .entries()
            .values()
            .filter(|entry| entry.state.status() == HealthStatus::Healthy)
            .map(|entry| {
                let mut svc = entry.service.clone();
                svc.status = Status::Alive;
                svc
            })
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Discovery poll loop
    pub async fn watch(
        self: Arc<Self>,
        disco: Arc<dyn Discoverer>,
        catalog: CatalogHandle,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(disco.as_ref(), &catalog).await {
                        tracing::error!("Failed to refresh discovered services: {:#}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Discovery watch shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Health check loop
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn check_one(id: String, checker: Arc<dyn HealthChecker>, timeout: Duration) -> (String, bool) {
    let ok = match tokio::time::timeout(timeout, checker.check()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!("Check failed for {}: {:#}", id, e);
            false
        }
        Err(_) => {
            tracing::debug!("Check timed out for {} after {:?}", id, timeout);
            false
        }
    };
    (id, ok)
}
