//! The convergent service catalog.
//!
//! `ServicesState` holds one record per `(host, instance id)` and reconciles
//! local and gossiped writes with last-writer-wins on the `updated` stamp.
//! Equal stamps keep the record already held, so two nodes racing the same
//! instance at the same instant settle on whatever each already had rather
//! than flapping on arrival order. Removal always goes through a tombstone
//! which only `expire` deletes, once it has outlived the tombstone lifespan.
//!
//! Nothing here does I/O or takes a lock; `catalog_manager` owns the single
//! instance and serializes access to it.

pub mod hash;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use shared::types::{RecordError, ServiceInstance, ServicesSnapshot, Status};
use crate::gossip::Member;
use crate::metrics::Metrics;

/// How long records of each status live without a refresh
#[derive(Debug, Clone, Copy)]
pub struct Lifespans {
    pub alive: Duration,
    pub tombstone: Duration,
}

/// Shift applied to a departed host's records so the tombstone beats the
/// alive record it replaces.
const HOST_DEPARTURE_BUMP_SECS: i64 = 1;

pub struct ServicesState {
    hostname: String,
    servers: HashMap<String, HashMap<String, ServiceInstance>>,
    last_changed: Option<DateTime<Utc>>,
    name_match: Option<Regex>,
    lifespans: Lifespans,
    metrics: Option<Arc<Metrics>>,
}

impl ServicesState {
    pub fn new(hostname: impl Into<String>, lifespans: Lifespans, name_match: Option<Regex>) -> Self {
        Self {
            hostname: hostname.into(),
            servers: HashMap::new(),
            last_changed: None,
            name_match,
            lifespans,
            metrics: None,
        }
    }

    /// Count merges, rejections and tombstones in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply a record, local or gossiped. Returns true if the visible state
    /// changed.
    ///
    /// The record is taken only if its `updated` is strictly newer than the
    /// one held. That single rule is what keeps a tombstone from being
    /// overwritten by an alive record of the same or an older stamp.
    pub fn merge(&mut self, record: ServiceInstance, now: DateTime<Utc>) -> Result<bool, RecordError> {
        if let Err(e) = record.validate() {
            if let Some(metrics) = &self.metrics {
                metrics.records_rejected.inc();
            }
            return Err(e);
        }

        let host = self.servers.entry(record.hostname.clone()).or_default();
        let changed = match host.get(&record.id) {
            Some(existing) if record.updated <= existing.updated => return Ok(false),
            Some(existing) => existing.differs_visibly(&record),
            None => true,
        };

        host.insert(record.id.clone(), record);
        if changed {
            self.last_changed = Some(now);
            if let Some(metrics) = &self.metrics {
                metrics.records_merged.inc();
            }
        }
        Ok(changed)
    }

    /// Demote alive records whose lease lapsed and drop tombstones that
    /// outlived the tombstone lifespan. Returns true if anything changed.
    ///
    /// A demoted record is stamped with the instant its lease ran out, so
    /// every node expiring the same stale record produces the same
    /// tombstone.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let Lifespans { alive, tombstone } = self.lifespans;
        let mut lapsed = 0;
        let mut removed = 0;

        for services in self.servers.values_mut() {
            services.retain(|id, svc| match svc.status {
                Status::Alive if now - svc.updated > alive => {
                    tracing::info!(
                        "Lease lapsed for {} on {}, tombstoning",
                        id,
                        svc.hostname
                    );
                    svc.status = Status::Tombstone;
                    svc.updated += alive;
                    lapsed += 1;
                    true
                }
                Status::Tombstone if now - svc.updated > tombstone => {
                    tracing::debug!("Removing expired tombstone {} on {}", id, svc.hostname);
                    removed += 1;
                    false
                }
                _ => true,
            });
        }
        self.servers.retain(|_, services| !services.is_empty());

        if let Some(metrics) = &self.metrics {
            metrics.tombstoned("lease", lapsed);
            metrics.tombstones_removed.inc_by(removed as u64);
        }
        let changed = lapsed + removed > 0;
        if changed {
            self.last_changed = Some(now);
        }
        changed
    }

    /// Tombstone every alive record owned by a host that left the cluster.
    pub fn expire_host(&mut self, host: &str, now: DateTime<Utc>) -> bool {
        let Some(services) = self.servers.get_mut(host) else {
            return false;
        };

        let mut departed = 0;
        for svc in services.values_mut().filter(|svc| svc.is_alive()) {
            svc.status = Status::Tombstone;
            svc.updated += Duration::seconds(HOST_DEPARTURE_BUMP_SECS);
            departed += 1;
        }

        if departed == 0 {
            return false;
        }
        tracing::info!("Tombstoned {} services of departed host {}", departed, host);
        if let Some(metrics) = &self.metrics {
            metrics.tombstoned("host", departed);
        }
        self.last_changed = Some(now);
        true
    }

    /// A fresh write stamp for a local record: `now`, unless the record
    /// already holds a stamp at or past `now`.
    fn stamp(&self, id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.local(id) {
            Some(existing) if existing.updated >= now => existing.updated + Duration::milliseconds(1),
            _ => now,
        }
    }

    fn local(&self, id: &str) -> Option<&ServiceInstance> {
        self.get(&self.hostname, id)
    }

    /// Re-announce local instances as alive with fresh stamps, from a live
    /// set read at `taken`. Returns the records as written, ready to gossip.
    ///
    /// An instance tombstoned here after `taken` stays a tombstone: the live
    /// set predates its removal.
    pub fn announce_alive(
        &mut self,
        services: Vec<ServiceInstance>,
        taken: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<ServiceInstance> {
        let current: Vec<ServiceInstance> = services
            .into_iter()
            .filter(|svc| match self.local(&svc.id) {
                Some(held) if held.is_tombstone() && held.updated > taken => {
                    tracing::debug!("Not announcing {}, tombstoned since the live set was read", svc.id);
                    false
                }
                _ => true,
            })
            .collect();
        self.announce(current, now)
    }

    fn announce(&mut self, services: Vec<ServiceInstance>, now: DateTime<Utc>) -> Vec<ServiceInstance> {
        let mut written = Vec::with_capacity(services.len());
        for mut svc in services {
            svc.hostname = self.hostname.clone();
            svc.status = Status::Alive;
            svc.updated = self.stamp(&svc.id, now);
            match self.merge(svc.clone(), now) {
                Ok(_) => written.push(svc),
                Err(e) => tracing::warn!("Refusing to announce local service: {}", e),
            }
        }
        written
    }

    /// Tombstone local instances by ID. Instances not held alive are
    /// skipped. Returns the tombstones as written.
    pub fn tombstone_local(&mut self, ids: &[String], now: DateTime<Utc>) -> Vec<ServiceInstance> {
        let mut written = Vec::new();
        for id in ids {
            let Some(existing) = self.local(id).filter(|svc| svc.is_alive()) else {
                continue;
            };
            let mut svc = existing.clone();
            svc.status = Status::Tombstone;
            svc.updated = self.stamp(id, now);
            if let Ok(true) = self.merge(svc.clone(), now) {
                tracing::info!("Tombstoned local service {} ({})", id, svc.name);
                written.push(svc);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.tombstoned("local", written.len());
        }
        written
    }

    /// Reconcile the catalog with the set of instances currently healthy on
    /// this host: announce any that are not yet alive here, tombstone any
    /// held alive that are no longer in the set.
    pub fn track_local(&mut self, live: Vec<ServiceInstance>, now: DateTime<Utc>) -> Vec<ServiceInstance> {
        let live_ids: HashSet<&str> = live.iter().map(|svc| svc.id.as_str()).collect();
        let missing: Vec<String> = self
            .local_services()
            .filter(|svc| svc.is_alive() && !live_ids.contains(svc.id.as_str()))
            .map(|svc| svc.id.clone())
            .collect();

        let fresh: Vec<ServiceInstance> = live
            .into_iter()
            .filter(|svc| !self.local(&svc.id).is_some_and(|held| held.is_alive()))
            .collect();

        let mut written = self.announce(fresh, now);
        written.extend(self.tombstone_local(&missing, now));
        written
    }

    fn local_services(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.servers
            .get(&self.hostname)
            .into_iter()
            .flat_map(|services| services.values())
    }

    /// Tombstones owned by this host, still waiting to age out
    pub fn local_tombstones(&self) -> Vec<ServiceInstance> {
        self.local_services()
            .filter(|svc| svc.is_tombstone())
            .cloned()
            .collect()
    }

    pub fn get(&self, host: &str, id: &str) -> Option<&ServiceInstance> {
        self.servers.get(host).and_then(|services| services.get(id))
    }

    pub fn services_for_host(&self, host: &str) -> Vec<ServiceInstance> {
        let mut services: Vec<ServiceInstance> = self
            .servers
            .get(host)
            .map(|services| services.values().cloned().collect())
            .unwrap_or_default();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub fn all_services(&self) -> Vec<ServiceInstance> {
        self.snapshot().services().cloned().collect()
    }

    pub fn snapshot(&self) -> ServicesSnapshot {
        let servers = self
            .servers
            .iter()
            .map(|(host, services)| {
                let services: BTreeMap<String, ServiceInstance> = services
                    .iter()
                    .map(|(id, svc)| (id.clone(), svc.clone()))
                    .collect();
                (host.clone(), services)
            })
            .collect();

        ServicesSnapshot {
            hostname: self.hostname.clone(),
            last_changed: self.last_changed,
            servers,
        }
    }

    /// Logical service name: the first capture of the configured matcher,
    /// falling back to the raw name, then to the image.
    pub fn service_name(&self, svc: &ServiceInstance) -> String {
        service_name(self.name_match.as_ref(), svc)
    }

    /// Human-readable dump of the catalog and cluster members.
    pub fn format(&self, members: &[Member], now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let snapshot = self.snapshot();

        let _ = writeln!(out, "Services ------------------------------");
        for (host, services) in &snapshot.servers {
            let _ = writeln!(out, "  {} ({} records)", host, services.len());
            for svc in services.values() {
                let age = (now - svc.updated).num_seconds();
                let _ = writeln!(
                    out,
                    "      {:<20} {:<14} {:<10} {:>5}s ago  {}",
                    self.service_name(svc),
                    short_id(&svc.id),
                    svc.status,
                    age,
                    svc.image
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Members -------------------------------");
        for member in members {
            let _ = writeln!(out, "  {:<30} {}", member.name, member.addr);
        }
        out
    }
}

pub fn service_name(name_match: Option<&Regex>, svc: &ServiceInstance) -> String {
    let fallback = || {
        if svc.name.is_empty() {
            svc.image.clone()
        } else {
            svc.name.clone()
        }
    };

    let Some(re) = name_match else {
        return fallback();
    };
    re.captures(&svc.name)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(fallback)
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use chrono::TimeZone;
    use shared::types::Port;

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn record(host: &str, id: &str, status: Status, updated: DateTime<Utc>) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: "web-frontend-1".to_string(),
            image: "nginx:1.25".to_string(),
            created: at(0),
            hostname: host.to_string(),
            ports: vec![Port { port_type: "tcp".to_string(), port: 8080, service_port: Some(80) }],
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            status,
            updated,
        }
    }

    fn lifespans() -> Lifespans {
        Lifespans {
            alive: Duration::seconds(80),
            tombstone: Duration::hours(3),
        }
    }

    fn state(host: &str) -> ServicesState {
        ServicesState::new(host, lifespans(), None)
    }

    #[test]
    fn test_merge_order_independent() {
        let a = record("node-a", "1", Status::Alive, at(100));
        let b = record("node-a", "1", Status::Tombstone, at(150));

        let mut forward = state("node-b");
        forward.merge(a.clone(), at(200)).unwrap();
        forward.merge(b.clone(), at(200)).unwrap();

        let mut backward = state("node-b");
        backward.merge(b.clone(), at(200)).unwrap();
        backward.merge(a, at(200)).unwrap();

        assert_eq!(forward.get("node-a", "1"), Some(&b));
        assert_eq!(backward.get("node-a", "1"), Some(&b));
    }

    #[test]
    fn test_newer_alive_supersedes_tombstone() {
        let mut s = state("node-b");
        s.merge(record("node-a", "1", Status::Tombstone, at(100)), at(100)).unwrap();
        let changed = s.merge(record("node-a", "1", Status::Alive, at(101)), at(101)).unwrap();

        assert!(changed);
        assert!(s.get("node-a", "1").unwrap().is_alive());
    }

    #[test]
    fn test_tombstone_dominates_older_or_equal_alive() {
        let mut s = state("node-b");
        s.merge(record("node-a", "1", Status::Tombstone, at(100)), at(100)).unwrap();

        for stamp in [at(50), at(99), at(100)] {
            let changed = s.merge(record("node-a", "1", Status::Alive, stamp), at(100)).unwrap();
            assert!(!changed);
            assert!(s.get("node-a", "1").unwrap().is_tombstone());
        }
    }

    #[test]
    fn test_equal_timestamp_keeps_existing_in_both_orders() {
        let alive = record("node-a", "1", Status::Alive, at(100));
        let mut other = alive.clone();
        other.ports[0].port = 9090;

        let mut first = state("node-c");
        first.merge(alive.clone(), at(100)).unwrap();
        assert!(!first.merge(other.clone(), at(100)).unwrap());

        let mut second = state("node-c");
        second.merge(other.clone(), at(100)).unwrap();
        assert!(!second.merge(alive.clone(), at(100)).unwrap());

        assert_eq!(first.get("node-a", "1"), Some(&alive));
        assert_eq!(second.get("node-a", "1"), Some(&other));

        // replaying either side is idempotent
        assert!(!first.merge(alive, at(100)).unwrap());
        assert!(!second.merge(other, at(100)).unwrap());
    }

    #[test]
    fn test_refresh_without_visible_change_reports_unchanged() {
        let mut s = state("node-b");
        assert!(s.merge(record("node-a", "1", Status::Alive, at(100)), at(100)).unwrap());
        assert!(!s.merge(record("node-a", "1", Status::Alive, at(120)), at(120)).unwrap());
        assert_eq!(s.get("node-a", "1").unwrap().updated, at(120));
    }

    #[test]
    fn test_malformed_record_rejected_without_state_change() {
        let mut s = state("node-b");
        let mut bad = record("node-a", "1", Status::Alive, at(100));
        bad.status = Status::Unknown;

        assert!(s.merge(bad, at(100)).is_err());
        assert!(s.all_services().is_empty());
        assert_eq!(s.snapshot().last_changed, None);
    }

    #[test]
    fn test_lease_lapse_then_remote_convergence() {
        let mut a = state("node-a");
        let mut b = state("node-b");
        let original = record("node-a", "1", Status::Alive, at(100));
        a.merge(original.clone(), at(100)).unwrap();
        b.merge(original, at(100)).unwrap();

        // five minutes with no refresh
        assert!(a.expire(at(400)));
        let tomb = a.get("node-a", "1").unwrap().clone();
        assert_eq!(tomb.status, Status::Tombstone);
        assert_eq!(tomb.updated, at(180));

        assert!(b.merge(tomb.clone(), at(401)).unwrap());
        assert_eq!(b.get("node-a", "1"), Some(&tomb));
    }

    #[test]
    fn test_lease_not_lapsed_keeps_alive() {
        let mut s = state("node-b");
        s.merge(record("node-a", "1", Status::Alive, at(100)), at(100)).unwrap();
        assert!(!s.expire(at(180)));
        assert!(s.get("node-a", "1").unwrap().is_alive());
        assert!(s.expire(at(181)));
        assert!(s.get("node-a", "1").unwrap().is_tombstone());
    }

    #[test]
    fn test_tombstone_garbage_collection_bound() {
        let mut s = state("node-b");
        let tomb_at = at(1000);
        s.merge(record("node-a", "1", Status::Tombstone, tomb_at), tomb_at).unwrap();

        let lifespan = lifespans().tombstone;
        assert!(!s.expire(tomb_at + lifespan));
        assert!(s.get("node-a", "1").is_some());

        // one expiry tick later it is gone, host entry included
        assert!(s.expire(tomb_at + lifespan + Duration::seconds(1)));
        assert!(s.get("node-a", "1").is_none());
        assert!(s.services_for_host("node-a").is_empty());
        assert!(s.snapshot().servers.is_empty());
    }

    #[test]
    fn test_local_tombstone_beats_recent_alive_announce() {
        let mut s = state("node-a");
        let svc = record("node-a", "2", Status::Alive, at(0));
        let now = at(500);

        let announced = s.announce_alive(vec![svc], now, now);
        assert_eq!(announced[0].updated, now);

        // lost from the live set within the same instant
        let written = s.track_local(Vec::new(), now);
        assert_eq!(written.len(), 1);
        assert!(written[0].is_tombstone());
        assert!(written[0].updated > announced[0].updated);

        let held = s.get("node-a", "2").unwrap();
        assert!(held.is_tombstone());

        // the earlier alive copy arriving late cannot undo it
        let mut peer = state("node-b");
        peer.merge(written[0].clone(), now).unwrap();
        assert!(!peer.merge(announced[0].clone(), now).unwrap());
        assert!(peer.get("node-a", "2").unwrap().is_tombstone());
    }

    #[test]
    fn test_track_local_announces_new_and_tombstones_missing() {
        let mut s = state("node-a");
        s.announce_alive(vec![record("node-a", "1", Status::Alive, at(0))], at(10), at(10));

        let written = s.track_local(vec![record("", "2", Status::Unknown, at(0))], at(20));
        let by_id: HashMap<&str, &ServiceInstance> = written.iter().map(|svc| (svc.id.as_str(), svc)).collect();

        assert!(by_id["2"].is_alive());
        assert_eq!(by_id["2"].hostname, "node-a");
        assert!(by_id["1"].is_tombstone());

        // nothing to do on a steady set
        let again = s.track_local(vec![record("node-a", "2", Status::Alive, at(0))], at(21));
        assert!(again.is_empty());
    }

    #[test]
    fn test_local_tombstones_only_returns_own_tombstones() {
        let mut s = state("node-a");
        s.merge(record("node-a", "1", Status::Tombstone, at(10)), at(10)).unwrap();
        s.merge(record("node-a", "2", Status::Alive, at(10)), at(10)).unwrap();
        s.merge(record("node-b", "3", Status::Tombstone, at(10)), at(10)).unwrap();

        let tombs = s.local_tombstones();
        assert_eq!(tombs.len(), 1);
        assert_eq!(tombs[0].id, "1");
    }

    #[test]
    fn test_expire_host_tombstones_alive_records() {
        let mut s = state("node-a");
        s.merge(record("node-b", "1", Status::Alive, at(10)), at(10)).unwrap();
        s.merge(record("node-b", "2", Status::Tombstone, at(5)), at(10)).unwrap();

        assert!(s.expire_host("node-b", at(20)));
        let svc = s.get("node-b", "1").unwrap();
        assert!(svc.is_tombstone());
        assert_eq!(svc.updated, at(11));
        assert_eq!(s.get("node-b", "2").unwrap().updated, at(5));

        assert!(!s.expire_host("node-b", at(21)));
        assert!(!s.expire_host("node-unknown", at(21)));
    }

    #[test]
    fn test_service_name_uses_matcher_with_fallback() {
        let re = Regex::new(r"^(.+)-\d+$").unwrap();
        let s = ServicesState::new("node-a", lifespans(), Some(re));

        let svc = record("node-a", "1", Status::Alive, at(0));
        assert_eq!(s.service_name(&svc), "web-frontend");

        let mut plain = svc.clone();
        plain.name = "billing".to_string();
        assert_eq!(s.service_name(&plain), "billing");

        let mut unnamed = svc;
        unnamed.name.clear();
        assert_eq!(s.service_name(&unnamed), "nginx:1.25");

        assert_eq!(state("node-a").service_name(&plain), "billing");
    }

    #[test]
    fn test_format_lists_hosts_and_members() {
        let mut s = state("node-a");
        s.merge(record("node-a", "abcdef0123456789", Status::Alive, at(10)), at(10)).unwrap();
        let members = vec![Member {
            name: "node-b".to_string(),
            addr: "10.0.0.2:7946".parse().unwrap(),
        }];

        let out = s.format(&members, at(40));
        assert!(out.contains("node-a (1 records)"));
        assert!(out.contains("abcdef012345"));
        assert!(out.contains("30s ago"));
        assert!(out.contains("node-b"));
    }

    #[test]
    fn test_announce_skips_instances_tombstoned_after_live_read() {
        let mut s = state("node-a");
        s.announce_alive(vec![record("node-a", "1", Status::Alive, at(0))], at(10), at(10));
        s.tombstone_local(&["1".to_string()], at(20));

        // a live set read before the tombstone
        let written = s.announce_alive(vec![record("node-a", "1", Status::Alive, at(15))], at(15), at(21));
        assert!(written.is_empty());
        assert!(s.get("node-a", "1").unwrap().is_tombstone());

        // one read after it brings the instance back
        let written = s.announce_alive(vec![record("node-a", "1", Status::Alive, at(25))], at(25), at(25));
        assert_eq!(written.len(), 1);
        assert!(s.get("node-a", "1").unwrap().is_alive());
    }

    #[test]
    fn test_metrics_count_merges_rejections_and_tombstones() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut s = state("node-a").with_metrics(metrics.clone());

        s.merge(record("node-b", "1", Status::Alive, at(0)), at(0)).unwrap();
        s.merge(record("node-b", "2", Status::Alive, at(0)), at(0)).unwrap();
        assert!(s.merge(record("node-b", "", Status::Alive, at(0)), at(0)).is_err());
        assert!(s.expire_host("node-b", at(1)));
        assert!(s.expire(at(4 * 60 * 60)));

        assert_eq!(metrics.records_merged.get(), 2);
        assert_eq!(metrics.records_rejected.get(), 1);
        assert_eq!(metrics.tombstones.with_label_values(&["host"]).get(), 2);
        assert_eq!(metrics.tombstones_removed.get(), 2);
    }
}
