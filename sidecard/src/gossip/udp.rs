use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use shared::protocol::{GossipMessage, MAX_MESSAGE_BYTES, MAX_RECORDS_PER_MESSAGE};
use shared::types::ServiceInstance;
use crate::catalog_manager::CatalogHandle;
use super::{GossipTransport, Member, Members};

/// Largest datagram we expect to receive
const MAX_DATAGRAM: usize = 65_507;

/// JSON-over-UDP gossip between sidecars.
pub struct UdpGossip {
    socket: Arc<UdpSocket>,
    cluster: String,
    hostname: String,
    advertised: SocketAddr,
    members: Members,
    send_timeout: Duration,
}

impl UdpGossip {
    pub async fn bind(
        bind_addr: SocketAddr,
        advertised: SocketAddr,
        cluster: String,
        hostname: String,
        members: Members,
        send_timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind gossip socket on {}", bind_addr))?;

        Ok(Self {
            socket: Arc::new(socket),
            cluster,
            hostname,
            advertised,
            members,
            send_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Gossip socket has no local address")
    }

    /// Split records into datagram-sized messages, bounded both by record
    /// count and by encoded size. A record that cannot fit in a datagram on
    /// its own is dropped with a warning.
    fn encode(&self, records: &[ServiceInstance], push_pull: bool) -> Vec<Vec<u8>> {
        let message = |records: Vec<ServiceInstance>| GossipMessage {
            cluster: self.cluster.clone(),
            from: self.hostname.clone(),
            push_pull,
            records,
        };
        let envelope = match serde_json::to_vec(&message(Vec::new())) {
            Ok(payload) => payload.len(),
            Err(e) => {
                tracing::error!("Failed to encode gossip message: {}", e);
                return Vec::new();
            }
        };

        let mut chunks: Vec<Vec<ServiceInstance>> = Vec::new();
        let mut current: Vec<ServiceInstance> = Vec::new();
        let mut size = envelope;
        for record in records {
            let len = match serde_json::to_vec(record) {
                Ok(encoded) => encoded.len(),
                Err(e) => {
                    tracing::error!("Failed to encode record {}: {}", record.id, e);
                    continue;
                }
            };
            if envelope + len > MAX_MESSAGE_BYTES {
                tracing::warn!(
                    "Record {} on {} encodes to {} bytes, too large to gossip",
                    record.id,
                    record.hostname,
                    len
                );
                continue;
            }

            // records after the first are preceded by a comma
            if !current.is_empty()
                && (size + len + 1 > MAX_MESSAGE_BYTES || current.len() == MAX_RECORDS_PER_MESSAGE)
            {
                chunks.push(std::mem::take(&mut current));
                size = envelope;
            }
            size += if current.is_empty() { len } else { len + 1 };
            current.push(record.clone());
        }
        if !current.is_empty() || (chunks.is_empty() && push_pull) {
            // an empty catalog still asks the peer for theirs
            chunks.push(current);
        }

        let mut payloads = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match serde_json::to_vec(&message(chunk)) {
                Ok(payload) => payloads.push(payload),
                Err(e) => tracing::error!("Failed to encode gossip message: {}", e),
            }
        }
        payloads
    }

    async fn send_all(&self, payloads: &[Vec<u8>], addr: SocketAddr) {
        for payload in payloads {
            match tokio::time::timeout(self.send_timeout, self.socket.send_to(payload, addr)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!("Gossip send to {} failed: {}", addr, e),
                Err(_) => tracing::debug!("Gossip send to {} timed out", addr),
            }
        }
    }

    /// Receive loop: merges every inbound message into the catalog and
    /// answers push/pull requests with the local catalog.
    pub async fn listen(self: Arc<Self>, catalog: CatalogHandle, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Gossip listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("Gossip receive failed: {}", e);
                            continue;
                        }
                    };
                    self.handle(&buf[..len], src, &catalog).await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Gossip listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, payload: &[u8], src: SocketAddr, catalog: &CatalogHandle) {
        let message: GossipMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Dropping malformed gossip from {}: {}", src, e);
                return;
            }
        };

        if message.cluster != self.cluster {
            tracing::debug!("Ignoring gossip from {} for cluster {}", src, message.cluster);
            return;
        }
        if message.from == self.hostname {
            return;
        }

        match catalog.merge(message.records).await {
            Ok(changed) if changed > 0 => {
                tracing::debug!("Merged {} changed records from {}", changed, message.from);
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to merge gossip from {}: {}", message.from, e),
        }

        if message.push_pull {
            match catalog.all_services().await {
                Ok(records) => {
                    let payloads = self.encode(&records, false);
                    self.send_all(&payloads, src).await;
                }
                Err(e) => tracing::error!("Failed to read catalog for push/pull: {}", e),
            }
        }
    }
}

#[async_trait]
impl GossipTransport for UdpGossip {
    async fn broadcast(&self, records: Vec<ServiceInstance>) {
        if records.is_empty() {
            return;
        }
        let payloads = self.encode(&records, false);
        for addr in self.members.peer_addrs(self.advertised) {
            self.send_all(&payloads, addr).await;
        }
    }

    async fn push_pull(&self, records: Vec<ServiceInstance>) {
        let peers = self.members.peer_addrs(self.advertised);
        let chosen = {
            let mut rng = rand::thread_rng();
            peers.choose(&mut rng).copied()
        };
        let Some(addr) = chosen else {
            return;
        };
        tracing::debug!("Push/pull with {}", addr);
        let payloads = self.encode(&records, true);
        self.send_all(&payloads, addr).await;
    }

    fn members(&self) -> Vec<Member> {
        self.members.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::watch;
    use shared::types::Status;
    use crate::catalog::tests::record;
    use crate::catalog::{Lifespans, ServicesState};

    fn catalog(host: &str) -> CatalogHandle {
        let state = ServicesState::new(
            host,
            Lifespans {
                alive: chrono::Duration::seconds(80),
                tombstone: chrono::Duration::hours(3),
            },
            None,
        );
        let (hash_tx, _) = watch::channel(String::new());
        CatalogHandle::spawn(state, None, hash_tx)
    }

    async fn node(name: &str, cluster: &str) -> Arc<UdpGossip> {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let gossip = UdpGossip::bind(
            any,
            any,
            cluster.to_string(),
            name.to_string(),
            Members::default(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        Arc::new(gossip)
    }

    async fn wait_for<F, Fut>(mut f: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if f().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_encode_chunks_large_batches() {
        let gossip = node("node-a", "test").await;
        let records: Vec<ServiceInstance> = (0..MAX_RECORDS_PER_MESSAGE + 1)
            .map(|i| record("node-a", &i.to_string(), Status::Alive, Utc::now()))
            .collect();

        assert_eq!(gossip.encode(&records, false).len(), 2);
        assert!(gossip.encode(&[], false).is_empty());
        assert_eq!(gossip.encode(&[], true).len(), 1);
    }

    fn decode(payloads: &[Vec<u8>]) -> Vec<ServiceInstance> {
        payloads
            .iter()
            .flat_map(|p| serde_json::from_slice::<GossipMessage>(p).unwrap().records)
            .collect()
    }

    #[tokio::test]
    async fn test_encode_bounds_datagram_size() {
        let gossip = node("node-a", "test").await;
        let records: Vec<ServiceInstance> = (0..MAX_RECORDS_PER_MESSAGE)
            .map(|i| {
                let mut svc = record("node-a", &i.to_string(), Status::Alive, Utc::now());
                svc.image = "x".repeat(1100);
                svc
            })
            .collect();

        let payloads = gossip.encode(&records, false);
        assert!(payloads.len() > 1);
        assert!(payloads.iter().all(|p| p.len() <= MAX_MESSAGE_BYTES));
        assert_eq!(decode(&payloads).len(), records.len());
    }

    #[tokio::test]
    async fn test_encode_drops_only_oversized_record() {
        let gossip = node("node-a", "test").await;
        let mut huge = record("node-a", "huge", Status::Alive, Utc::now());
        huge.image = "x".repeat(MAX_MESSAGE_BYTES);
        let records = vec![
            record("node-a", "1", Status::Alive, Utc::now()),
            huge,
            record("node-a", "2", Status::Alive, Utc::now()),
        ];

        let ids: Vec<String> = decode(&gossip.encode(&records, false))
            .into_iter()
            .map(|svc| svc.id)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_large_batch_reaches_peer() {
        let a = node("node-a", "test").await;
        let b = node("node-b", "test").await;
        a.members.upsert(Member { name: "node-b".to_string(), addr: b.local_addr().unwrap() });

        let b_catalog = catalog("node-b");
        let cancel = CancellationToken::new();
        tokio::spawn(b.clone().listen(b_catalog.clone(), cancel.clone()));

        let records: Vec<ServiceInstance> = (0..MAX_RECORDS_PER_MESSAGE)
            .map(|i| {
                let mut svc = record("node-a", &i.to_string(), Status::Alive, Utc::now());
                svc.image = "x".repeat(1100);
                svc
            })
            .collect();
        a.broadcast(records).await;

        let arrived = wait_for(|| {
            let c = b_catalog.clone();
            async move {
                c.all_services()
                    .await
                    .map(|s| s.len() == MAX_RECORDS_PER_MESSAGE)
                    .unwrap_or(false)
            }
        })
        .await;
        cancel.cancel();
        assert!(arrived);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_peer_catalog() {
        let a = node("node-a", "test").await;
        let b = node("node-b", "test").await;
        a.members.upsert(Member { name: "node-b".to_string(), addr: b.local_addr().unwrap() });

        let b_catalog = catalog("node-b");
        let cancel = CancellationToken::new();
        tokio::spawn(b.clone().listen(b_catalog.clone(), cancel.clone()));

        a.broadcast(vec![record("node-a", "1", Status::Alive, Utc::now())]).await;

        let arrived = wait_for(|| {
            let c = b_catalog.clone();
            async move { c.all_services().await.map(|s| s.len() == 1).unwrap_or(false) }
        })
        .await;
        cancel.cancel();
        assert!(arrived);
    }

    #[tokio::test]
    async fn test_push_pull_gets_reply() {
        let a = node("node-a", "test").await;
        let b = node("node-b", "test").await;
        a.members.upsert(Member { name: "node-b".to_string(), addr: b.local_addr().unwrap() });

        let a_catalog = catalog("node-a");
        let b_catalog = catalog("node-b");
        b_catalog
            .merge(vec![record("node-b", "9", Status::Alive, Utc::now())])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn(a.clone().listen(a_catalog.clone(), cancel.clone()));
        tokio::spawn(b.clone().listen(b_catalog.clone(), cancel.clone()));

        a.push_pull(Vec::new()).await;

        let pulled = wait_for(|| {
            let c = a_catalog.clone();
            async move {
                c.services_for_host("node-b".to_string())
                    .await
                    .map(|s| s.len() == 1)
                    .unwrap_or(false)
            }
        })
        .await;
        cancel.cancel();
        assert!(pulled);
    }

    #[tokio::test]
    async fn test_foreign_cluster_ignored() {
        let a = node("node-a", "other").await;
        let b = node("node-b", "test").await;
        a.members.upsert(Member { name: "node-b".to_string(), addr: b.local_addr().unwrap() });

        let b_catalog = catalog("node-b");
        let cancel = CancellationToken::new();
        tokio::spawn(b.clone().listen(b_catalog.clone(), cancel.clone()));

        a.broadcast(vec![record("node-a", "1", Status::Alive, Utc::now())]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        assert!(b_catalog.all_services().await.unwrap().is_empty());
    }
}
