//! Sources of "what is running on this host right now".

pub mod static_file;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use shared::types::{Port, ServiceInstance, Status};
use crate::health::checker::CheckSpec;

pub use static_file::StaticDiscovery;

/// Metadata key that overrides the reported instance name
pub const SERVICE_NAME_KEY: &str = "ServiceName";

/// One instance as reported by a discovery provider
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub ip: IpAddr,
    pub ports: Vec<Port>,
    pub metadata: HashMap<String, String>,
    /// How to check this instance; the monitor's default applies if unset
    pub check: Option<CheckSpec>,
}

impl DiscoveredService {
    /// Catalog record for this instance, not yet classified
    pub fn to_instance(&self, hostname: &str, now: DateTime<Utc>) -> ServiceInstance {
        let name = self
            .metadata
            .get(SERVICE_NAME_KEY)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name);

        ServiceInstance {
            id: self.id.clone(),
            name: name.clone(),
            image: self.image.clone(),
            created: self.created,
            hostname: hostname.to_string(),
            ports: self.ports.clone(),
            ip: self.ip,
            status: Status::Unknown,
            updated: now,
        }
    }
}

#[async_trait]
pub trait Discoverer: Send + Sync {
    fn name(&self) -> &str;

    /// Instances currently present. An empty list is a valid answer.
    async fn enumerate(&self) -> Result<Vec<DiscoveredService>>;
}

/// Union of several providers.
///
/// A provider that fails contributes its last successful answer, so one
/// transient error does not make every instance it knows look departed.
pub struct MultiDiscovery {
    discoverers: Vec<Box<dyn Discoverer>>,
    last_good: Mutex<HashMap<usize, Vec<DiscoveredService>>>,
}

impl MultiDiscovery {
    pub fn new(discoverers: Vec<Box<dyn Discoverer>>) -> Self {
        Self {
            discoverers,
            last_good: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Discoverer for MultiDiscovery {
    fn name(&self) -> &str {
        "multi"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredService>> {
        let results = join_all(self.discoverers.iter().map(|d| d.enumerate())).await;

        let mut last_good = match self.last_good.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut seen = HashSet::new();
        let mut services = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            let found = match result {
                Ok(found) => {
                    last_good.insert(idx, found.clone());
                    found
                }
                Err(e) => {
                    tracing::warn!(
                        "Discovery via {} failed, reusing last result: {:#}",
                        self.discoverers[idx].name(),
                        e
                    );
                    last_good.get(&idx).cloned().unwrap_or_default()
                }
            };
            services.extend(found.into_iter().filter(|svc| seen.insert(svc.id.clone())));
        }

        Ok(services)
    }
}
