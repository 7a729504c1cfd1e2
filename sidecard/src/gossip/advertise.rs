use std::collections::HashMap;
use std::net::IpAddr;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{SIDECAR_SERVICE_TYPE, TXT_CLUSTER, TXT_GOSSIP_PORT};

/// Advertise this sidecar so peers of the same cluster can find it.
pub fn register_sidecar(
    daemon: &ServiceDaemon,
    node_name: &str,
    cluster: &str,
    ip: IpAddr,
    gossip_port: u16,
) -> Result<ServiceInfo> {
    let txt_records = HashMap::from([
        (TXT_CLUSTER.to_string(), cluster.to_string()),
        (TXT_GOSSIP_PORT.to_string(), gossip_port.to_string()),
    ]);

    let service_info = ServiceInfo::new(
        SIDECAR_SERVICE_TYPE,
        node_name,
        &format!("{}.local.", node_name),
        ip.to_string().as_str(),
        gossip_port,
        txt_records,
    )
    .context("Failed to create ServiceInfo")?;

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {}",
        SIDECAR_SERVICE_TYPE,
        node_name,
        gossip_port
    );

    Ok(service_info)
}

pub fn unregister_sidecar(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}
