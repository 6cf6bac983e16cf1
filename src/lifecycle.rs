// DANS : src/lifecycle.rs

use crate::error::{WatchError, WatchResult};
use crate::feed::{ChangeFeed, SubscriptionId};
use crate::monitoring::metrics;
use futures_util::future::join_all;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

/// Bilan d'un `shutdown()`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub released: usize,
    pub failed: usize,
}

/// Propriétaire exclusif des abonnements en cours.
///
/// Chaque abonnement enregistré est désabonné exactement une fois, que ce
/// soit via `release` ou via `shutdown`.
pub struct ListenerLifecycle<F> {
    feed: Arc<F>,
    /// `None` une fois l'arrêt effectué.
    handles: Mutex<Option<BTreeSet<SubscriptionId>>>,
    unsubscribe_timeout: Duration,
}

impl<F: ChangeFeed> ListenerLifecycle<F> {
    pub fn new(feed: Arc<F>, unsubscribe_timeout: Duration) -> Self {
        Self {
            feed,
            handles: Mutex::new(Some(BTreeSet::new())),
            unsubscribe_timeout,
        }
    }

    pub fn feed(&self) -> &Arc<F> {
        &self.feed
    }

    pub async fn registered(&self) -> Vec<SubscriptionId> {
        self.handles
            .lock()
            .await
            .as_ref()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.handles.lock().await.is_none()
    }

    /// Prend possession d'un abonnement. Après l'arrêt, il est désabonné immédiatement.
    pub async fn register(&self, subscription: SubscriptionId) {
        {
            let mut handles = self.handles.lock().await;
            if let Some(set) = handles.as_mut() {
                if set.insert(subscription) {
                    metrics::ACTIVE_SUBSCRIPTIONS.inc();
                }
                debug!(subscription = %subscription, "[Lifecycle] Abonnement enregistré.");
                return;
            }
        }
        warn!(subscription = %subscription, "[Lifecycle] Enregistrement après l'arrêt, désabonnement immédiat.");
        let _ = self.unsubscribe_one(subscription).await;
    }

    /// Désabonne un seul abonnement maintenant (transport mort, remplacement...).
    /// Renvoie `Ok(false)` s'il n'était pas (ou plus) enregistré.
    pub async fn release(&self, subscription: SubscriptionId) -> WatchResult<bool> {
        let removed = {
            let mut handles = self.handles.lock().await;
            handles.as_mut().is_some_and(|set| set.remove(&subscription))
        };
        if !removed {
            return Ok(false);
        }
        metrics::ACTIVE_SUBSCRIPTIONS.dec();
        self.unsubscribe_one(subscription).await?;
        Ok(true)
    }

    /// Désabonne tout ce qui est enregistré, en parallèle. Idempotent : un second
    /// appel (même concurrent) attend le premier puis ne fait rien.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut handles = self.handles.lock().await;
        let Some(set) = handles.take() else {
            debug!("[Lifecycle] Arrêt déjà effectué.");
            return ShutdownReport::default();
        };

        info!(count = set.len(), "[Lifecycle] Désabonnement de tous les listeners...");
        let results = join_all(set.iter().map(|id| self.unsubscribe_one(*id))).await;
        metrics::ACTIVE_SUBSCRIPTIONS.sub(set.len() as i64);

        let failed = results.iter().filter(|r| r.is_err()).count();
        let report = ShutdownReport {
            released: results.len() - failed,
            failed,
        };
        info!(released = report.released, failed = report.failed, "[Lifecycle] Arrêt terminé.");
        report
    }

    async fn unsubscribe_one(&self, subscription: SubscriptionId) -> WatchResult<()> {
        info!(subscription = %subscription, "[Lifecycle] Désabonnement du listener.");
        let result = match timeout(self.unsubscribe_timeout, self.feed.unsubscribe(subscription)).await {
            Ok(result) => result,
            Err(_) => Err(WatchError::Transient(format!(
                "désabonnement de {} trop long (> {:?})",
                subscription, self.unsubscribe_timeout
            ))),
        };
        if let Err(e) = &result {
            warn!(subscription = %subscription, error = %e, "[Lifecycle] Échec du désabonnement, on continue.");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedFilter;
    use crate::testing::FakeFeed;
    use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
    use tokio::sync::mpsc;

    async fn subscribed(feed: &Arc<FakeFeed>, count: usize) -> Vec<SubscriptionId> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut ids = Vec::new();
        for _ in 0..count {
            let filter = FeedFilter::Account(Pubkey::new_unique());
            ids.push(feed.subscribe(filter, CommitmentConfig::confirmed(), tx.clone()).await.unwrap());
        }
        ids
    }

    fn lifecycle(feed: &Arc<FakeFeed>) -> ListenerLifecycle<FakeFeed> {
        ListenerLifecycle::new(feed.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn shutdown_twice_unsubscribes_each_handle_once() {
        let feed = Arc::new(FakeFeed::new());
        let ids = subscribed(&feed, 3).await;
        let lifecycle = lifecycle(&feed);
        for id in &ids {
            lifecycle.register(*id).await;
        }

        let first = lifecycle.shutdown().await;
        let second = lifecycle.shutdown().await;

        assert_eq!(first, ShutdownReport { released: 3, failed: 0 });
        assert_eq!(second, ShutdownReport::default());
        for id in ids {
            assert_eq!(feed.unsubscribe_count(id), 1);
        }
        assert!(feed.active().is_empty());
        assert!(lifecycle.is_shut_down().await);
    }

    #[tokio::test]
    async fn concurrent_shutdowns_do_not_double_unsubscribe() {
        let feed = Arc::new(FakeFeed::new());
        let ids = subscribed(&feed, 2).await;
        let lifecycle = lifecycle(&feed);
        for id in &ids {
            lifecycle.register(*id).await;
        }

        let (a, b) = tokio::join!(lifecycle.shutdown(), lifecycle.shutdown());
        assert_eq!(a.released + b.released, 2);
        for id in ids {
            assert_eq!(feed.unsubscribe_count(id), 1);
        }
    }

    #[tokio::test]
    async fn one_failing_unsubscribe_does_not_stop_the_others() {
        let feed = Arc::new(FakeFeed::new());
        let ids = subscribed(&feed, 3).await;
        feed.fail_unsubscribe(ids[1]);
        let lifecycle = lifecycle(&feed);
        for id in &ids {
            lifecycle.register(*id).await;
        }

        let report = lifecycle.shutdown().await;
        assert_eq!(report, ShutdownReport { released: 2, failed: 1 });
        for id in ids {
            assert_eq!(feed.unsubscribe_count(id), 1);
        }
    }

    #[tokio::test]
    async fn released_handle_is_not_unsubscribed_again_on_shutdown() {
        let feed = Arc::new(FakeFeed::new());
        let ids = subscribed(&feed, 2).await;
        let lifecycle = lifecycle(&feed);
        for id in &ids {
            lifecycle.register(*id).await;
        }

        assert!(lifecycle.release(ids[0]).await.unwrap());
        assert!(!lifecycle.release(ids[0]).await.unwrap());
        assert_eq!(lifecycle.registered().await, vec![ids[1]]);

        lifecycle.shutdown().await;
        assert_eq!(feed.unsubscribe_count(ids[0]), 1);
        assert_eq!(feed.unsubscribe_count(ids[1]), 1);
    }

    #[tokio::test]
    async fn register_after_shutdown_unsubscribes_immediately() {
        let feed = Arc::new(FakeFeed::new());
        let lifecycle = lifecycle(&feed);
        lifecycle.shutdown().await;

        let id = subscribed(&feed, 1).await[0];
        lifecycle.register(id).await;

        assert_eq!(feed.unsubscribe_count(id), 1);
        assert!(lifecycle.registered().await.is_empty());
    }
}
