mod config;
mod catalog;
mod catalog_manager;
mod health;
mod discovery;
mod broadcast;
mod gossip;
mod notify;
mod api;
mod metrics;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use regex::Regex;
use crate::broadcast::LiveServices;
use crate::catalog::{Lifespans, ServicesState};
use crate::catalog_manager::CatalogHandle;
use crate::config::Config;
use crate::discovery::{Discoverer, MultiDiscovery, StaticDiscovery};
use crate::gossip::{GossipTransport, Members, UdpGossip};
use crate::health::Monitor;
use crate::metrics::Metrics;
use crate::notify::{ChangeListener, UrlListener};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("sidecard={}", config.sidecar.log_level)));

    if config.sidecar.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_discovery(config: &Config, advertise_ip: IpAddr) -> Result<MultiDiscovery> {
    let mut discoverers: Vec<Box<dyn Discoverer>> = Vec::new();

    for method in &config.sidecar.discovery {
        match method.as_str() {
            "static" => {
                tracing::info!("Using static discovery from {:?}", config.static_discovery.config_file);
                discoverers.push(Box::new(StaticDiscovery::new(
                    config.static_discovery.config_file.clone(),
                    advertise_ip,
                )));
            }
            other => anyhow::bail!("Unknown discovery method: {}", other),
        }
    }

    Ok(MultiDiscovery::new(discoverers))
}

fn build_listeners(config: &Config) -> Result<Vec<Arc<dyn ChangeListener>>> {
    let timeout = Duration::from_secs(config.listeners.timeout_secs);
    config
        .listeners
        .urls
        .iter()
        .map(|url| {
            tracing::info!("Adding URL listener for {}", url);
            let listener: Arc<dyn ChangeListener> = Arc::new(UrlListener::new(url.as_str(), timeout)?);
            Ok::<_, anyhow::Error>(listener)
        })
        .collect()
}

fn create_mdns_daemon(interface: Option<&str>) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
    if let Some(interface) = interface {
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        daemon
            .enable_interface(interface)
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }
    Ok(daemon)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/sidecar/sidecar.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    init_tracing(&config);

    let node_name = config.sidecar.node_name()?;
    let advertise_ip = config.sidecar.advertise_ip()?;
    let seeds = config.sidecar.seed_addrs()?;
    let advertised = SocketAddr::new(advertise_ip, config.sidecar.gossip_port);
    let name_match = config
        .catalog
        .service_name_match
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid service_name_match")?;

    tracing::info!("Starting sidecard");
    tracing::info!("Loaded config from {}", config_path);
    tracing::info!("Cluster name: {}", config.sidecar.cluster_name);
    tracing::info!("Node name: {}", node_name);
    tracing::info!("Advertising on: {}", advertised);
    tracing::info!("Excluded IPs: {:?}", config.sidecar.exclude_ips);
    tracing::info!("Seeds: {:?}", seeds);
    tracing::info!("Service name match: {:?}", config.catalog.service_name_match);
    tracing::info!(
        "Lifespans: alive {}s, tombstone {}s",
        config.catalog.alive_lifespan_secs,
        config.catalog.tombstone_lifespan_secs
    );
    tracing::info!(
        "Broadcast intervals: alive {}s, tombstone {}s, tracking {}s, push/pull {:?}",
        config.catalog.alive_broadcast_interval_secs,
        config.catalog.tombstone_broadcast_interval_secs,
        config.catalog.tracking_interval_secs,
        config.push_pull_interval()
    );

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    // Catalog thread and its hash channel
    let state = ServicesState::new(
        node_name.clone(),
        Lifespans {
            alive: config.catalog.alive_lifespan(),
            tombstone: config.catalog.tombstone_lifespan(),
        },
        name_match.clone(),
    )
    .with_metrics(metrics.clone());
    let initial_hash = catalog::hash::compute_hash(&state.snapshot());
    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let catalog = CatalogHandle::spawn(state, name_match, hash_tx);

    // Gossip transport
    let members = Members::with_seeds(&seeds);
    let udp = Arc::new(
        UdpGossip::bind(
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.sidecar.gossip_port),
            advertised,
            config.sidecar.cluster_name.clone(),
            node_name.clone(),
            members.clone(),
            Duration::from_millis(config.sidecar.gossip_send_timeout_millis),
        )
        .await?,
    );
    let transport: Arc<dyn GossipTransport> = udp.clone();

    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // mDNS peer discovery
    let mdns = if config.sidecar.mdns {
        let daemon = create_mdns_daemon(config.sidecar.interface.as_deref())?;
        let service_info = gossip::advertise::register_sidecar(
            &daemon,
            &node_name,
            &config.sidecar.cluster_name,
            advertise_ip,
            config.sidecar.gossip_port,
        )?;

        let browser_daemon = daemon.clone();
        let browser_members = members.clone();
        let browser_catalog = catalog.clone();
        let browser_cluster = config.sidecar.cluster_name.clone();
        let browser_name = node_name.clone();
        let browser_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = gossip::browser::run_browser(
                browser_daemon,
                browser_members,
                browser_catalog,
                browser_cluster,
                browser_name,
                browser_cancel,
            )
            .await
            {
                tracing::error!("mDNS browser error: {}", e);
            }
        }));

        Some((daemon, service_info))
    } else {
        None
    };

    // Gossip receive loop
    let listen_gossip = udp.clone();
    let listen_catalog = catalog.clone();
    let listen_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = listen_gossip.listen(listen_catalog, listen_cancel).await {
            tracing::error!("Gossip listener error: {}", e);
        }
    }));

    // Discovery and health checks
    let discovery: Arc<dyn Discoverer> = Arc::new(build_discovery(&config, advertise_ip)?);
    let monitor = Arc::new(
        Monitor::new(node_name.clone(), &config.health, config.default_check_host(advertise_ip))
            .with_metrics(metrics.clone()),
    );

    let watch_monitor = monitor.clone();
    let watch_catalog = catalog.clone();
    let watch_interval = Duration::from_secs(config.health.watch_interval_secs);
    let watch_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_monitor.watch(discovery, watch_catalog, watch_interval, watch_cancel).await {
            tracing::error!("Discovery watch error: {}", e);
        }
    }));

    let check_monitor = monitor.clone();
    let check_interval = Duration::from_secs(config.health.check_interval_secs);
    let check_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = check_monitor.run(check_interval, check_cancel).await {
            tracing::error!("Health monitor error: {}", e);
        }
    }));

    // Catalog maintenance and anti-entropy
    let expiry_catalog = catalog.clone();
    let expiry_interval = Duration::from_secs(config.catalog.expire_interval_secs);
    let expiry_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = catalog_manager::run_expiry(expiry_catalog, expiry_interval, expiry_cancel).await {
            tracing::error!("Expiry loop error: {}", e);
        }
    }));

    let live_monitor = monitor.clone();
    let live: LiveServices = Arc::new(move || live_monitor.services());

    handles.push(tokio::spawn(broadcast::broadcast_alive(
        catalog.clone(),
        transport.clone(),
        live.clone(),
        Duration::from_secs(config.catalog.alive_broadcast_interval_secs),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(broadcast::broadcast_tombstones(
        catalog.clone(),
        transport.clone(),
        Duration::from_secs(config.catalog.tombstone_broadcast_interval_secs),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(broadcast::track_new_services(
        catalog.clone(),
        transport.clone(),
        live,
        Duration::from_secs(config.catalog.tracking_interval_secs),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(broadcast::push_pull(
        catalog.clone(),
        transport.clone(),
        config.push_pull_interval(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(broadcast::announce_members(
        catalog.clone(),
        transport.clone(),
        Duration::from_secs(10),
        cancel.clone(),
    )));

    // Change listeners
    let listeners = build_listeners(&config)?;
    let notify_catalog = catalog.clone();
    let notify_hash_rx = hash_rx.clone();
    let coalesce = Duration::from_millis(config.listeners.coalesce_millis);
    let listener_timeout = Duration::from_secs(config.listeners.timeout_secs);
    let notify_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = notify::run_notifier(
            notify_catalog,
            notify_hash_rx,
            listeners,
            coalesce,
            listener_timeout,
            notify_cancel,
        )
        .await
        {
            tracing::error!("Notifier error: {}", e);
        }
    }));

    // Status API
    let app_state = api::routes::AppState {
        catalog: catalog.clone(),
        hash_rx,
        members: members.clone(),
        cluster_name: config.sidecar.cluster_name.clone(),
        metrics,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    futures::future::join_all(handles).await;

    if let Some((daemon, service_info)) = mdns {
        if let Err(e) = gossip::advertise::unregister_sidecar(&daemon, &service_info) {
            tracing::error!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    if let Err(e) = catalog.shutdown().await {
        tracing::error!("Failed to shutdown catalog: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
