//! Periodic anti-entropy tasks.
//!
//! None of these wait for acknowledgements. A record lost in transit is
//! repaired by the next tick re-sending it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use shared::types::ServiceInstance;
use crate::catalog_manager::CatalogHandle;
use crate::gossip::GossipTransport;

/// The locally healthy instances, as the health monitor sees them now
pub type LiveServices = Arc<dyn Fn() -> Vec<ServiceInstance> + Send + Sync>;

async fn every<F, Fut>(name: &str, interval: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick().await {
                    tracing::error!("{} tick failed: {:#}", name, e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("{} loop shutting down", name);
                break;
            }
        }
    }
}

/// Re-stamp and send every healthy local instance. Refreshes their leases
/// here and on every peer that hears it.
pub async fn alive_tick(catalog: &CatalogHandle, transport: &dyn GossipTransport, live: &LiveServices) -> Result<()> {
    let taken = Utc::now();
    let services = live();
    if services.is_empty() {
        return Ok(());
    }
    let written = catalog.announce_alive(services, taken).await?;
    tracing::debug!("Announcing {} alive services", written.len());
    transport.broadcast(written).await;
    Ok(())
}

/// Re-send local tombstones, unchanged, until they age out.
pub async fn tombstone_tick(catalog: &CatalogHandle, transport: &dyn GossipTransport) -> Result<()> {
    let tombstones = catalog.local_tombstones().await?;
    if tombstones.is_empty() {
        return Ok(());
    }
    tracing::debug!("Re-announcing {} tombstones", tombstones.len());
    transport.broadcast(tombstones).await;
    Ok(())
}

/// Announce newly healthy instances and tombstone the ones that left the
/// healthy set since the last tick.
pub async fn tracking_tick(catalog: &CatalogHandle, transport: &dyn GossipTransport, live: &LiveServices) -> Result<()> {
    let written = catalog.track_local(live()).await?;
    if written.is_empty() {
        return Ok(());
    }
    for svc in &written {
        tracing::info!("Local service {} ({}) is now {}", svc.id, svc.name, svc.status);
    }
    transport.broadcast(written).await;
    Ok(())
}

pub async fn broadcast_alive(
    catalog: CatalogHandle,
    transport: Arc<dyn GossipTransport>,
    live: LiveServices,
    interval: Duration,
    cancel: CancellationToken,
) {
    every("Broadcast alive", interval, cancel, || alive_tick(&catalog, transport.as_ref(), &live)).await;
}

pub async fn broadcast_tombstones(
    catalog: CatalogHandle,
    transport: Arc<dyn GossipTransport>,
    interval: Duration,
    cancel: CancellationToken,
) {
    every("Broadcast tombstones", interval, cancel, || tombstone_tick(&catalog, transport.as_ref())).await;
}

pub async fn track_new_services(
    catalog: CatalogHandle,
    transport: Arc<dyn GossipTransport>,
    live: LiveServices,
    interval: Duration,
    cancel: CancellationToken,
) {
    every("Track services", interval, cancel, || tracking_tick(&catalog, transport.as_ref(), &live)).await;
}

/// Full-catalog exchange with one random member, so a node that missed
/// broadcasts (or just joined) catches up without waiting out a lease.
pub async fn push_pull_tick(catalog: &CatalogHandle, transport: &dyn GossipTransport) -> Result<()> {
    let records = catalog.all_services().await?;
    transport.push_pull(records).await;
    Ok(())
}

async fn members_tick(catalog: &CatalogHandle, transport: &dyn GossipTransport) -> Result<()> {
    let members = transport.members();
    for member in &members {
        tracing::debug!("Member: {} {}", member.name, member.addr);
    }
    tracing::debug!("\n{}", catalog.format(members).await?);
    Ok(())
}

pub async fn push_pull(
    catalog: CatalogHandle,
    transport: Arc<dyn GossipTransport>,
    interval: Duration,
    cancel: CancellationToken,
) {
    every("Push/pull", interval, cancel, || push_pull_tick(&catalog, transport.as_ref())).await;
}

/// Debug dump of the member list and catalog
pub async fn announce_members(
    catalog: CatalogHandle,
    transport: Arc<dyn GossipTransport>,
    interval: Duration,
    cancel: CancellationToken,
) {
    every("Announce members", interval, cancel, || members_tick(&catalog, transport.as_ref())).await;
}
