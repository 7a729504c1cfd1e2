use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::types::Port;
use crate::health::checker::CheckSpec;
use super::{DiscoveredService, Discoverer};

/// One entry of the static discovery file
#[derive(Debug, Clone, Deserialize)]
struct StaticTarget {
    id: String,
    name: String,
    #[serde(default)]
    image: String,
    /// Defaults to the host's advertised address
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    ports: Vec<Port>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    check: Option<CheckSpec>,
}

/// Services listed in a JSON file. The file is re-read on every poll so
/// edits take effect without a restart.
pub struct StaticDiscovery {
    path: PathBuf,
    default_ip: IpAddr,
    started: DateTime<Utc>,
}

impl StaticDiscovery {
    pub fn new(path: impl Into<PathBuf>, default_ip: IpAddr) -> Self {
        Self {
            path: path.into(),
            default_ip,
            started: Utc::now(),
        }
    }

    fn parse(&self, contents: &str) -> Result<Vec<DiscoveredService>> {
        let targets: Vec<StaticTarget> = serde_json::from_str(contents)
            .with_context(|| format!("Failed to parse static discovery file: {}", self.path.display()))?;

        Ok(targets
            .into_iter()
            .map(|t| DiscoveredService {
                id: t.id,
                name: t.name,
                image: t.image,
                created: self.started,
                ip: t.ip.unwrap_or(self.default_ip),
                ports: t.ports,
                metadata: t.metadata,
                check: t.check,
            })
            .collect())
    }
}

#[async_trait]
impl Discoverer for StaticDiscovery {
    fn name(&self) -> &str {
        "static"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredService>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read static discovery file: {}", self.path.display()))?;
        self.parse(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const FILE: &str = r#"[
        {
            "id": "billing-1",
            "name": "billing",
            "image": "billing:2.1",
            "ports": [{ "port_type": "tcp", "port": 9000 }],
            "check": { "type": "HttpGet", "url": "http://127.0.0.1:9000/health" }
        },
        {
            "id": "cache-1",
            "name": "cache",
            "ip": "10.1.1.1",
            "ports": [{ "port_type": "tcp", "port": 6379 }],
            "check": { "type": "Tcp", "addr": "10.1.1.1:6379" }
        }
    ]"#;

    #[tokio::test]
    async fn test_enumerates_file_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FILE.as_bytes()).unwrap();

        let default_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let disco = StaticDiscovery::new(file.path(), default_ip);
        let found = disco.enumerate().await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].ip, default_ip);
        assert_eq!(found[0].ports[0].port, 9000);
        assert!(matches!(found[0].check, Some(CheckSpec::HttpGet { .. })));
        assert_eq!(found[1].ip, IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        assert!(found[1].image.is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_invalid_file_errors() {
        let disco = StaticDiscovery::new("/nonexistent/static.json", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(disco.enumerate().await.is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let disco = StaticDiscovery::new(file.path(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(disco.enumerate().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_file_is_no_services() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[]").unwrap();
        let disco = StaticDiscovery::new(file.path(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(disco.enumerate().await.unwrap().is_empty());
    }
}
