//! Cluster transport: who the peers are and how records reach them.
//!
//! Delivery is best effort. Nothing is acknowledged or retried; the
//! broadcast loops re-send on their next tick instead.

pub mod advertise;
pub mod browser;
pub mod udp;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use serde::Serialize;
use shared::types::ServiceInstance;

pub use udp::UdpGossip;

/// A peer known to this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Send records to every known member
    async fn broadcast(&self, records: Vec<ServiceInstance>);

    /// Send a full catalog to one member, asking for its catalog back
    async fn push_pull(&self, records: Vec<ServiceInstance>);

    /// Current members, for diagnostics
    fn members(&self) -> Vec<Member>;
}

/// Shared member table, fed by static seeds and mDNS browsing
#[derive(Clone, Default)]
pub struct Members {
    inner: Arc<RwLock<HashMap<String, Member>>>,
}

impl Members {
    pub fn with_seeds(seeds: &[SocketAddr]) -> Self {
        let members = Self::default();
        for addr in seeds {
            members.upsert(Member {
                name: addr.to_string(),
                addr: *addr,
            });
        }
        members
    }

    /// Insert or refresh a member. Returns true if it was not known yet.
    pub fn upsert(&self, member: Member) -> bool {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert(member.name.clone(), member).is_none()
    }

    pub fn remove(&self, name: &str) -> Option<Member> {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(name)
    }

    /// Members sorted by name
    pub fn list(&self) -> Vec<Member> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut members: Vec<Member> = inner.values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Distinct peer addresses, excluding `own`. A seed and its mDNS entry
    /// share an address and are only sent to once.
    pub fn peer_addrs(&self, own: SocketAddr) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.list()
            .into_iter()
            .map(|member| member.addr)
            .filter(|addr| *addr != own && seen.insert(*addr))
            .collect()
    }
}
