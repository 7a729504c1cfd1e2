use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Port, ServicesSnapshot, Status};

/// Only stable fields: `updated` moves on every heartbeat without the
/// catalog meaningfully changing. Must cover the same fields as
/// `ServiceInstance::differs_visibly`, or a visible change goes unnotified.
#[derive(Serialize)]
struct HashView<'a> {
    hostname: &'a str,
    id: &'a str,
    name: &'a str,
    image: &'a str,
    created: DateTime<Utc>,
    ip: IpAddr,
    ports: &'a [Port],
    status: Status,
}

/// Computes a SHA-256 hash of the catalog contents.
/// Snapshot maps are ordered, so the output is deterministic.
pub fn compute_hash(snapshot: &ServicesSnapshot) -> String {
    let views: Vec<HashView<'_>> = snapshot
        .services()
        .map(|s| HashView {
            hostname: &s.hostname,
            id: &s.id,
            name: &s.name,
            image: &s.image,
            created: s.created,
            ip: s.ip,
            ports: &s.ports,
            status: s.status,
        })
        .collect();

    // serializing plain strings, numbers and enums cannot fail
    let json = serde_json::to_string(&views).unwrap_or_default();

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
