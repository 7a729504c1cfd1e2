//! Change notification fan-out.
//!
//! Listeners are driven off the catalog's content hash rather than each
//! merge, so a burst of changes costs one notification per coalesce window.

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::ServicesSnapshot;
use crate::catalog_manager::CatalogHandle;

#[async_trait]
pub trait ChangeListener: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the whole current catalog. May be called again with the
    /// same content, so receivers must be idempotent.
    async fn notify(&self, snapshot: &ServicesSnapshot) -> Result<()>;
}

/// POSTs the JSON snapshot to a webhook
pub struct UrlListener {
    url: String,
    client: reqwest::Client,
}

impl UrlListener {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl ChangeListener for UrlListener {
    fn name(&self) -> &str {
        &self.url
    }

    async fn notify(&self, snapshot: &ServicesSnapshot) -> Result<()> {
        self.client
            .post(&self.url)
            .json(snapshot)
            .send()
            .await
            .with_context(|| format!("POST to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("{} rejected the update", self.url))?;
        Ok(())
    }
}

/// Notify every listener concurrently. A slow or failing listener is logged
/// and holds up nobody else beyond `timeout`.
pub async fn notify_all(listeners: &[Arc<dyn ChangeListener>], snapshot: &ServicesSnapshot, timeout: Duration) {
    let deliveries = listeners.iter().map(|listener| async move {
        match tokio::time::timeout(timeout, listener.notify(snapshot)).await {
            Ok(Ok(())) => tracing::debug!("Notified {}", listener.name()),
            Ok(Err(e)) => tracing::warn!("Listener {} failed: {:#}", listener.name(), e),
            Err(_) => tracing::warn!("Listener {} timed out after {:?}", listener.name(), timeout),
        }
    });
    futures::future::join_all(deliveries).await;
}

pub async fn run_notifier(
    catalog: CatalogHandle,
    mut hash_rx: watch::Receiver<String>,
    listeners: Vec<Arc<dyn ChangeListener>>,
    coalesce: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    if listeners.is_empty() {
        tracing::info!("No change listeners configured");
        return Ok(());
    }

    // listeners start from the current state
    hash_rx.borrow_and_update();
    let snapshot = catalog.snapshot().await?;
    notify_all(&listeners, &snapshot, timeout).await;

    loop {
        tokio::select! {
            changed = hash_rx.changed() => {
                if changed.is_err() {
                    tracing::info!("Catalog closed, notifier exiting");
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(coalesce) => {}
                    _ = cancel.cancelled() => break,
                }

                let hash = hash_rx.borrow_and_update().clone();
                match catalog.snapshot().await {
                    Ok(snapshot) => {
                        tracing::info!("Catalog changed ({}), notifying {} listeners", hash, listeners.len());
                        notify_all(&listeners, &snapshot, timeout).await;
                    }
                    Err(e) => tracing::error!("Failed to snapshot catalog: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Notifier shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::Utc;
    use shared::types::Status;
    use crate::catalog::tests::record;
    use crate::catalog::{Lifespans, ServicesState};

    struct Counting {
        calls: Arc<AtomicUsize>,
        last_len: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChangeListener for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn notify(&self, snapshot: &ServicesSnapshot) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(snapshot.services().count(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl ChangeListener for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn notify(&self, _snapshot: &ServicesSnapshot) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ChangeListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _snapshot: &ServicesSnapshot) -> Result<()> {
            anyhow::bail!("renderer exploded")
        }
    }

    fn catalog() -> (CatalogHandle, watch::Receiver<String>) {
        let state = ServicesState::new(
            "node-a",
            Lifespans {
                alive: chrono::Duration::seconds(80),
                tombstone: chrono::Duration::hours(3),
            },
            None,
        );
        let (hash_tx, hash_rx) = watch::channel(String::new());
        (CatalogHandle::spawn(state, None, hash_tx), hash_rx)
    }

    fn counting() -> (Arc<dyn ChangeListener>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(0));
        let listener = Counting {
            calls: calls.clone(),
            last_len: last_len.clone(),
        };
        (Arc::new(listener), calls, last_len)
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let (catalog, hash_rx) = catalog();
        let (listener, calls, last_len) = counting();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_notifier(
            catalog.clone(),
            hash_rx,
            vec![listener],
            Duration::from_millis(200),
            Duration::from_secs(1),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for i in 0..5 {
            catalog
                .merge(vec![record("node-b", &i.to_string(), Status::Alive, Utc::now())])
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_len.load(Ordering::SeqCst), 5);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_listeners_do_not_block_others() {
        let (listener, calls, _) = counting();
        let listeners: Vec<Arc<dyn ChangeListener>> = vec![Arc::new(Stuck), Arc::new(Failing), listener];

        let started = std::time::Instant::now();
        notify_all(&listeners, &ServicesSnapshot::default(), Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_listeners_returns() {
        let (catalog, hash_rx) = catalog();
        let result = run_notifier(
            catalog,
            hash_rx,
            Vec::new(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
    }
}
