use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{SIDECAR_SERVICE_TYPE, TXT_CLUSTER, TXT_GOSSIP_PORT};
use crate::catalog_manager::CatalogHandle;
use super::{Member, Members};

/// Keeps the member table in step with sidecars advertised over mDNS.
/// A peer that goes away has its services tombstoned right away instead of
/// waiting for their leases to lapse.
pub async fn run_browser(
    daemon: ServiceDaemon,
    members: Members,
    catalog: CatalogHandle,
    cluster: String,
    own_name: String,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS peer browser");

    let receiver = daemon
        .browse(SIDECAR_SERVICE_TYPE)
        .context("Failed to start peer browse")?;

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let Some(member) = member_from_info(&info, &cluster) else {
                            continue;
                        };
                        if member.name == own_name {
                            continue;
                        }
                        let name = member.name.clone();
                        let addr = member.addr;
                        if members.upsert(member) {
                            tracing::info!("Member joined: {} {}", name, addr);
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        let Some(name) = node_name(&fullname) else {
                            continue;
                        };
                        if members.remove(name).is_some() {
                            tracing::info!("Member left: {}", name);
                            if let Err(e) = catalog.expire_host(name.to_string()).await {
                                tracing::error!("Failed to expire services of {}: {}", name, e);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("mDNS browse channel closed: {}", e);
                        break;
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Node name from an instance fullname, e.g. "node-a._sidecar._udp.local."
fn node_name(fullname: &str) -> Option<&str> {
    fullname
        .strip_suffix(SIDECAR_SERVICE_TYPE)
        .and_then(|name| name.strip_suffix('.'))
        .filter(|name| !name.is_empty())
}

/// Convert an advertised sidecar into a member, if it belongs to our cluster
fn member_from_info(info: &ServiceInfo, cluster: &str) -> Option<Member> {
    if info.get_property_val_str(TXT_CLUSTER) != Some(cluster) {
        tracing::debug!("Skipping {} - different cluster", info.get_fullname());
        return None;
    }

    let name = node_name(info.get_fullname())?.to_string();
    let port = info
        .get_property_val_str(TXT_GOSSIP_PORT)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or_else(|| info.get_port());

    // prefer IPv4, fall back to whatever was advertised
    let addresses = info.get_addresses();
    let ip: IpAddr = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;

    Some(Member {
        name,
        addr: SocketAddr::new(ip, port),
    })
}
