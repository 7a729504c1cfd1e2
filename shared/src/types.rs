use std::collections::BTreeMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Replication status of a service record.
///
/// `Unknown` only exists locally while a fresh instance has not been
/// classified yet. It is never accepted from, or sent over, the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Alive,
    Tombstone,
    Unknown,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Alive => f.write_str("Alive"),
            Status::Tombstone => f.write_str("Tombstone"),
            Status::Unknown => f.write_str("Unknown"),
        }
    }
}

/// An exposed port mapping of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    /// "tcp" or "udp"
    pub port_type: String,

    /// Port reachable on the host
    pub port: u16,

    /// Port the service listens on inside its runtime, if different
    #[serde(default)]
    pub service_port: Option<u16>,
}

/// One running service instance on one host.
/// `(hostname, id)` identifies the instance cluster-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance ID, unique on the owning host (e.g. container ID)
    pub id: String,

    /// Raw service name as reported by discovery
    pub name: String,

    /// Origin image or descriptor string
    pub image: String,

    /// When the instance was created on its host
    pub created: DateTime<Utc>,

    /// Owning host identifier
    pub hostname: String,

    /// Exposed ports, in discovery order
    pub ports: Vec<Port>,

    /// Address the instance is reachable on
    pub ip: IpAddr,

    pub status: Status,

    /// Last write time on the owning host; drives last-writer-wins merging
    pub updated: DateTime<Utc>,
}

/// Reasons an incoming record is refused before it reaches the catalog
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has an empty instance id")]
    EmptyId,

    #[error("record {0} has an empty hostname")]
    EmptyHostname(String),

    #[error("record {0} carries a non-replicable status {1}")]
    UnreplicableStatus(String, Status),

    #[error("record {0} has no update timestamp")]
    MissingTimestamp(String),
}

impl ServiceInstance {
    /// Check that a record is fit to be merged or gossiped.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.hostname.trim().is_empty() {
            return Err(RecordError::EmptyHostname(self.id.clone()));
        }
        if self.status == Status::Unknown {
            return Err(RecordError::UnreplicableStatus(self.id.clone(), self.status));
        }
        if self.updated.timestamp() <= 0 {
            return Err(RecordError::MissingTimestamp(self.id.clone()));
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.status == Status::Alive
    }

    pub fn is_tombstone(&self) -> bool {
        self.status == Status::Tombstone
    }

    /// Returns true if the two records differ in anything a reader would
    /// see, ignoring the update timestamp.
    pub fn differs_visibly(&self, other: &ServiceInstance) -> bool {
        self.status != other.status
            || self.name != other.name
            || self.image != other.image
            || self.ports != other.ports
            || self.ip != other.ip
            || self.created != other.created
    }
}

/// Point-in-time copy of the whole catalog, handed to listeners and the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesSnapshot {
    /// Host the snapshot was taken on
    pub hostname: String,

    /// Last time the visible catalog changed
    pub last_changed: Option<DateTime<Utc>>,

    /// Records keyed by host, then by instance ID
    pub servers: BTreeMap<String, BTreeMap<String, ServiceInstance>>,
}

impl ServicesSnapshot {
    /// All records across all hosts
    pub fn services(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.servers.values().flat_map(|svcs| svcs.values())
    }

    /// Only the records currently marked alive
    pub fn alive(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.services().filter(|svc| svc.is_alive())
    }
}
