use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};

/// Discovery methods understood by `[sidecar].discovery`
pub const KNOWN_DISCOVERY: &[&str] = &["static"];

/// Longest lifespan accepted for records of either status, ten years
pub const MAX_LIFESPAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub static_discovery: StaticDiscoveryConfig,
    #[serde(default)]
    pub listeners: ListenersConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SidecarConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Overrides the system hostname as this node's identifier
    #[serde(default)]
    pub hostname: Option<String>,
    /// Address peers reach this node on. Detected from the local private
    /// interfaces when unset.
    #[serde(default)]
    pub advertise_ip: Option<String>,
    /// Interface addresses never picked when detecting the advertised IP
    #[serde(default)]
    pub exclude_ips: Vec<String>,
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
    /// Static peers, as "ip:port"
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Find peers of the same cluster over mDNS, in addition to seeds
    #[serde(default = "default_mdns")]
    pub mdns: bool,
    /// Restricts mDNS peer discovery to one interface
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_discovery")]
    pub discovery: Vec<String>,
    /// Defaults to one second below the alive lifespan
    #[serde(default)]
    pub push_pull_interval_secs: Option<u64>,
    #[serde(default = "default_gossip_send_timeout")]
    pub gossip_send_timeout_millis: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_alive_lifespan")]
    pub alive_lifespan_secs: u64,
    #[serde(default = "default_tombstone_lifespan")]
    pub tombstone_lifespan_secs: u64,
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
    #[serde(default = "default_alive_broadcast_interval")]
    pub alive_broadcast_interval_secs: u64,
    #[serde(default = "default_tombstone_broadcast_interval")]
    pub tombstone_broadcast_interval_secs: u64,
    #[serde(default = "default_tracking_interval")]
    pub tracking_interval_secs: u64,
    /// Regex whose first capture group is the logical service name
    #[serde(default)]
    pub service_name_match: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// How often discovery is polled for new or departed instances
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_millis: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default = "default_check_endpoint")]
    pub default_check_endpoint: String,
    /// Host used for default checks; falls back to the advertised IP
    #[serde(default)]
    pub default_check_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticDiscoveryConfig {
    #[serde(default = "default_static_file")]
    pub config_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenersConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_coalesce")]
    pub coalesce_millis: u64,
    #[serde(default = "default_listener_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_gossip_port() -> u16 {
    7946
}

fn default_mdns() -> bool {
    true
}

fn default_discovery() -> Vec<String> {
    vec!["static".to_string()]
}

fn default_gossip_send_timeout() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_alive_lifespan() -> u64 {
    80
}

fn default_tombstone_lifespan() -> u64 {
    3 * 60 * 60
}

fn default_expire_interval() -> u64 {
    1
}

fn default_alive_broadcast_interval() -> u64 {
    25
}

fn default_tombstone_broadcast_interval() -> u64 {
    2
}

fn default_tracking_interval() -> u64 {
    1
}

fn default_check_interval() -> u64 {
    3
}

fn default_watch_interval() -> u64 {
    1
}

fn default_check_timeout() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_concurrent_checks() -> usize {
    16
}

fn default_check_endpoint() -> String {
    "/".to_string()
}

fn default_static_file() -> PathBuf {
    PathBuf::from("/etc/sidecar/static.json")
}

fn default_coalesce() -> u64 {
    500
}

fn default_listener_timeout() -> u64 {
    5
}

fn default_listen() -> String {
    "0.0.0.0:7777".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            alive_lifespan_secs: default_alive_lifespan(),
            tombstone_lifespan_secs: default_tombstone_lifespan(),
            expire_interval_secs: default_expire_interval(),
            alive_broadcast_interval_secs: default_alive_broadcast_interval(),
            tombstone_broadcast_interval_secs: default_tombstone_broadcast_interval(),
            tracking_interval_secs: default_tracking_interval(),
            service_name_match: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            watch_interval_secs: default_watch_interval(),
            check_timeout_millis: default_check_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            max_concurrent_checks: default_max_concurrent_checks(),
            default_check_endpoint: default_check_endpoint(),
            default_check_host: None,
        }
    }
}

impl Default for StaticDiscoveryConfig {
    fn default() -> Self {
        Self {
            config_file: default_static_file(),
        }
    }
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            coalesce_millis: default_coalesce(),
            timeout_secs: default_listener_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl SidecarConfig {
    /// The configured advertise_ip, or the first private IPv4 address on a
    /// local interface that is not excluded
    pub fn advertise_ip(&self) -> Result<IpAddr> {
        if let Some(ip) = self.configured_ip()? {
            return Ok(ip);
        }

        let excluded = self.excluded_ips()?;
        let interfaces = local_ip_address::list_afinet_netifas()
            .context("Failed to list network interfaces")?;
        let Some((name, ip)) = pick_private_ip(&interfaces, &excluded) else {
            bail!("No private IPv4 address found on any interface, set sidecar.advertise_ip");
        };
        tracing::info!("Detected advertise address {} on {}", ip, name);
        Ok(ip)
    }

    fn configured_ip(&self) -> Result<Option<IpAddr>> {
        self.advertise_ip
            .as_deref()
            .map(|ip| ip.parse().with_context(|| format!("Invalid advertise_ip: {}", ip)))
            .transpose()
    }

    fn excluded_ips(&self) -> Result<Vec<IpAddr>> {
        self.exclude_ips
            .iter()
            .map(|ip| ip.parse().with_context(|| format!("Invalid exclude_ips entry: {}", ip)))
            .collect()
    }

    pub fn seed_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.seeds
            .iter()
            .map(|seed| {
                seed.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid seed address: {}", seed))
            })
            .collect()
    }

    /// Resolve this node's identifier, preferring the configured override
    pub fn node_name(&self) -> Result<String> {
        if let Some(name) = self.hostname.as_ref().filter(|n| !n.is_empty()) {
            return Ok(name.clone());
        }
        let name = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();
        Ok(name)
    }
}

/// First private IPv4 address among `interfaces` not listed in `excluded`,
/// with the interface it sits on
pub fn pick_private_ip<'a>(interfaces: &'a [(String, IpAddr)], excluded: &[IpAddr]) -> Option<(&'a str, IpAddr)> {
    interfaces
        .iter()
        .find(|(_, ip)| match ip {
            IpAddr::V4(v4) => v4.is_private() && !excluded.contains(ip),
            IpAddr::V6(_) => false,
        })
        .map(|(name, ip)| (name.as_str(), *ip))
}

fn lifespan(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_LIFESPAN_SECS) as i64)
}

impl CatalogConfig {
    pub fn alive_lifespan(&self) -> chrono::Duration {
        lifespan(self.alive_lifespan_secs)
    }

    pub fn tombstone_lifespan(&self) -> chrono::Duration {
        lifespan(self.tombstone_lifespan_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the daemon cannot run with. Only called at startup.
    pub fn validate(&self) -> Result<()> {
        self.sidecar.configured_ip()?;
        self.sidecar.excluded_ips()?;
        self.sidecar.seed_addrs()?;

        for method in &self.sidecar.discovery {
            if !KNOWN_DISCOVERY.contains(&method.as_str()) {
                bail!("Unknown discovery method: {}", method);
            }
        }

        let intervals = [
            ("catalog.alive_lifespan_secs", self.catalog.alive_lifespan_secs),
            ("catalog.tombstone_lifespan_secs", self.catalog.tombstone_lifespan_secs),
            ("catalog.expire_interval_secs", self.catalog.expire_interval_secs),
            ("catalog.alive_broadcast_interval_secs", self.catalog.alive_broadcast_interval_secs),
            ("catalog.tombstone_broadcast_interval_secs", self.catalog.tombstone_broadcast_interval_secs),
            ("catalog.tracking_interval_secs", self.catalog.tracking_interval_secs),
            ("health.check_interval_secs", self.health.check_interval_secs),
            ("health.watch_interval_secs", self.health.watch_interval_secs),
            ("health.check_timeout_millis", self.health.check_timeout_millis),
            ("sidecar.gossip_send_timeout_millis", self.sidecar.gossip_send_timeout_millis),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        let lifespans = [
            ("catalog.alive_lifespan_secs", self.catalog.alive_lifespan_secs),
            ("catalog.tombstone_lifespan_secs", self.catalog.tombstone_lifespan_secs),
        ];
        for (name, value) in lifespans {
            if value > MAX_LIFESPAN_SECS {
                bail!("{} ({}) must not exceed {}", name, value, MAX_LIFESPAN_SECS);
            }
        }
        if self.sidecar.push_pull_interval_secs == Some(0) {
            bail!("sidecar.push_pull_interval_secs must be greater than zero");
        }

        if self.catalog.alive_lifespan_secs <= self.catalog.alive_broadcast_interval_secs {
            bail!(
                "catalog.alive_lifespan_secs ({}) must exceed catalog.alive_broadcast_interval_secs ({})",
                self.catalog.alive_lifespan_secs,
                self.catalog.alive_broadcast_interval_secs
            );
        }

        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            bail!("health thresholds must be greater than zero");
        }
        if self.health.max_concurrent_checks == 0 {
            bail!("health.max_concurrent_checks must be greater than zero");
        }

        if let Some(pattern) = &self.catalog.service_name_match {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid service_name_match: {}", pattern))?;
        }

        Ok(())
    }

    pub fn push_pull_interval(&self) -> Duration {
        let secs = self
            .sidecar
            .push_pull_interval_secs
            .unwrap_or_else(|| self.catalog.alive_lifespan_secs.saturating_sub(1).max(1));
        Duration::from_secs(secs)
    }

    /// Host used for default health checks
    pub fn default_check_host(&self, advertise_ip: IpAddr) -> String {
        self.health
            .default_check_host
            .clone()
            .unwrap_or_else(|| advertise_ip.to_string())
    }
}
