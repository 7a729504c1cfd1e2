use std::thread;
use std::time::Duration;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{ServiceInstance, ServicesSnapshot};
use crate::catalog::{self, hash, ServicesState};
use crate::gossip::Member;

/// Commands sent to the catalog thread
pub enum CatalogCommand {
    Merge(Vec<ServiceInstance>, oneshot::Sender<usize>),
    AnnounceAlive(Vec<ServiceInstance>, DateTime<Utc>, oneshot::Sender<Vec<ServiceInstance>>),
    TombstoneLocal(Vec<String>, oneshot::Sender<Vec<ServiceInstance>>),
    TrackLocal(Vec<ServiceInstance>, oneshot::Sender<Vec<ServiceInstance>>),
    LocalTombstones(oneshot::Sender<Vec<ServiceInstance>>),
    ExpireHost(String, oneshot::Sender<bool>),
    Expire(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<ServicesSnapshot>),
    ServicesForHost(String, oneshot::Sender<Vec<ServiceInstance>>),
    Format(Vec<Member>, oneshot::Sender<String>),
    Shutdown,
}

/// Handle to the catalog. The catalog itself lives on one thread and every
/// operation is a message to it, so each call sees and leaves a whole state.
#[derive(Clone)]
pub struct CatalogHandle {
    tx: mpsc::Sender<CatalogCommand>,
    name_match: Option<Regex>,
}

impl CatalogHandle {
    /// Spawn the catalog thread owning `state`. Every visible change
    /// publishes a new content hash on `hash_tx`.
    pub fn spawn(mut state: ServicesState, name_match: Option<Regex>, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<CatalogCommand>(256);

        let publish_hash = |state: &ServicesState, hash_tx: &watch::Sender<String>| {
            let new_hash = hash::compute_hash(&state.snapshot());
            hash_tx.send_if_modified(|current| {
                if *current == new_hash {
                    return false;
                }
                *current = new_hash;
                true
            });
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                let now = Utc::now();
                match cmd {
                    CatalogCommand::Merge(records, reply) => {
                        let mut changed = 0;
                        for record in records {
                            match state.merge(record, now) {
                                Ok(true) => changed += 1,
                                Ok(false) => {}
                                Err(e) => tracing::warn!("Rejected gossiped record: {}", e),
                            }
                        }
                        if changed > 0 {
                            publish_hash(&state, &hash_tx);
                        }
                        let _ = reply.send(changed);
                    }
                    CatalogCommand::AnnounceAlive(services, taken, reply) => {
                        let written = state.announce_alive(services, taken, now);
                        publish_hash(&state, &hash_tx);
                        let _ = reply.send(written);
                    }
                    CatalogCommand::TombstoneLocal(ids, reply) => {
                        let written = state.tombstone_local(&ids, now);
                        if !written.is_empty() {
                            publish_hash(&state, &hash_tx);
                        }
                        let _ = reply.send(written);
                    }
                    CatalogCommand::TrackLocal(live, reply) => {
                        let written = state.track_local(live, now);
                        if !written.is_empty() {
                            publish_hash(&state, &hash_tx);
                        }
                        let _ = reply.send(written);
                    }
                    CatalogCommand::LocalTombstones(reply) => {
                        let _ = reply.send(state.local_tombstones());
                    }
                    CatalogCommand::ExpireHost(host, reply) => {
                        let changed = state.expire_host(&host, now);
                        if changed {
                            publish_hash(&state, &hash_tx);
                        }
                        let _ = reply.send(changed);
                    }
                    CatalogCommand::Expire(reply) => {
                        let changed = state.expire(now);
                        if changed {
                            publish_hash(&state, &hash_tx);
                        }
                        let _ = reply.send(changed);
                    }
                    CatalogCommand::Snapshot(reply) => {
                        let _ = reply.send(state.snapshot());
                    }
                    CatalogCommand::ServicesForHost(host, reply) => {
                        let _ = reply.send(state.services_for_host(&host));
                    }
                    CatalogCommand::Format(members, reply) => {
                        let _ = reply.send(state.format(&members, now));
                    }
                    CatalogCommand::Shutdown => {
                        tracing::info!("Catalog thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx, name_match }
    }

    /// Merge gossiped records. Returns how many changed the visible state.
    pub async fn merge(&self, records: Vec<ServiceInstance>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::Merge(records, reply)).await?;
        Ok(rx.await?)
    }

    /// Write local instances, read from the live set at `taken`, as alive
    /// with fresh stamps
    pub async fn announce_alive(&self, services: Vec<ServiceInstance>, taken: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::AnnounceAlive(services, taken, reply)).await?;
        Ok(rx.await?)
    }

    /// Tombstone local instances by ID
    pub async fn tombstone_local(&self, ids: Vec<String>) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::TombstoneLocal(ids, reply)).await?;
        Ok(rx.await?)
    }

    /// Reconcile local records against the currently healthy set
    pub async fn track_local(&self, live: Vec<ServiceInstance>) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::TrackLocal(live, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn local_tombstones(&self) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::LocalTombstones(reply)).await?;
        Ok(rx.await?)
    }

    /// Tombstone everything a departed host was running
    pub async fn expire_host(&self, host: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::ExpireHost(host, reply)).await?;
        Ok(rx.await?)
    }

    /// Run lease and tombstone expiry
    pub async fn expire(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::Expire(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn snapshot(&self) -> Result<ServicesSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::Snapshot(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn services_for_host(&self, host: String) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::ServicesForHost(host, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn all_services(&self) -> Result<Vec<ServiceInstance>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.services().cloned().collect())
    }

    pub async fn format(&self, members: Vec<Member>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CatalogCommand::Format(members, reply)).await?;
        Ok(rx.await?)
    }

    pub fn service_name(&self, svc: &ServiceInstance) -> String {
        catalog::service_name(self.name_match.as_ref(), svc)
    }

    /// Shutdown the catalog thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(CatalogCommand::Shutdown).await?;
        Ok(())
    }
}

/// Expiry loop: demotes lapsed leases and collects old tombstones on a
/// fixed tick.
pub async fn run_expiry(
    catalog: CatalogHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = catalog.expire().await {
                    tracing::error!("Failed to run expiry: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Expiry loop shutting down");
                break;
            }
        }
    }

    Ok(())
}
