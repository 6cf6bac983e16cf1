// DANS : src/watcher.rs

use crate::error::{WatchError, WatchResult};
use crate::feed::{ChangeFeed, FeedFilter, FeedMessage, RawNotification, SubscriptionId};
use crate::filtering::EntityFilter;
use crate::history::HistorySource;
use crate::lifecycle::ListenerLifecycle;
use crate::monitoring::metrics;
use crate::reconciler::{CycleOutcome, EventSink, Reconciler};
use crate::state::WatermarkStore;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use solana_sdk::commitment_config::CommitmentConfig;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, trace, warn};

/// Un abonnement à ouvrir au démarrage (et à rouvrir si son transport meurt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub filter: FeedFilter,
    pub commitment: CommitmentConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    pub resubscribe_attempts: u32,
    pub resubscribe_delay: Duration,
    /// Temps laissé aux cycles en vol pour finir après le signal d'arrêt.
    pub shutdown_grace: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            resubscribe_attempts: 5,
            resubscribe_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Compteurs d'une exécution, renvoyés à l'arrêt propre.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub notifications: u64,
    pub filtered: u64,
    pub decode_failures: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub events_applied: u64,
    pub resubscriptions: u64,
}

type Cycles = JoinSet<WatchResult<CycleOutcome>>;

/// La boucle principale : flux → liste blanche → réconciliation.
///
/// Chaque notification admise lance un cycle dans sa propre tâche ; c'est le
/// `Reconciler` qui sérialise les cycles d'un même compte. Quelle que soit la
/// sortie de `run` (signal, erreur), tous les abonnements sont libérés.
pub struct Watcher<F, W, H, A> {
    lifecycle: Arc<ListenerLifecycle<F>>,
    reconciler: Arc<Reconciler<W, H, A>>,
    filter: EntityFilter,
    subscriptions: Vec<SubscriptionSpec>,
    settings: WatcherSettings,
}

impl<F, W, H, A> Watcher<F, W, H, A>
where
    F: ChangeFeed,
    W: WatermarkStore,
    H: HistorySource,
    A: EventSink,
{
    pub fn new(
        lifecycle: Arc<ListenerLifecycle<F>>,
        reconciler: Arc<Reconciler<W, H, A>>,
        filter: EntityFilter,
        subscriptions: Vec<SubscriptionSpec>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            lifecycle,
            reconciler,
            filter,
            subscriptions,
            settings,
        }
    }

    pub fn lifecycle(&self) -> &Arc<ListenerLifecycle<F>> {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<W, H, A>> {
        &self.reconciler
    }

    /// Tourne jusqu'à ce que `shutdown` se résolve ou qu'une erreur fatale survienne.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> WatchResult<RunSummary> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cycles = Cycles::new();
        let mut summary = RunSummary::default();

        let result = self
            .dispatch(&tx, &mut rx, &mut cycles, &mut summary, shutdown)
            .await;

        // Après un signal on laisse aux cycles le temps de finir ; après une erreur on les abandonne.
        self.drain(&mut cycles, &mut summary, result.is_ok()).await;
        self.lifecycle.shutdown().await;

        match &result {
            Ok(()) => info!(summary = ?summary, "[Watcher] Arrêt propre."),
            Err(e) => error!(error = %e, summary = ?summary, "[Watcher] Arrêt sur erreur."),
        }
        result.map(|()| summary)
    }

    async fn dispatch(
        &self,
        tx: &mpsc::UnboundedSender<FeedMessage>,
        rx: &mut mpsc::UnboundedReceiver<FeedMessage>,
        cycles: &mut Cycles,
        summary: &mut RunSummary,
        shutdown: impl Future<Output = ()>,
    ) -> WatchResult<()> {
        let mut active: HashMap<SubscriptionId, SubscriptionSpec> = HashMap::new();
        for spec in &self.subscriptions {
            let id = self.open(spec, tx).await?;
            active.insert(id, spec.clone());
        }
        info!(
            subscriptions = active.len(),
            whitelist = self.filter.len(),
            "[Watcher] Abonnements actifs, en attente des notifications..."
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("[Watcher] Signal d'arrêt reçu.");
                    return Ok(());
                }

                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    Self::record(joined, summary)?;
                }

                Some(message) = rx.recv() => match message {
                    FeedMessage::Notification(notification) => {
                        self.admit(notification, cycles, summary);
                    }
                    FeedMessage::Closed { subscription, reason } => {
                        let Some(spec) = active.remove(&subscription) else {
                            debug!(subscription = %subscription, "[Watcher] Fermeture d'un abonnement déjà remplacé.");
                            continue;
                        };
                        let closed = WatchError::SubscriptionClosed { subscription, reason };
                        warn!(error = %closed, "[Watcher] Abonnement mort, ré-abonnement.");
                        if let Err(e) = self.lifecycle.release(subscription).await {
                            warn!(subscription = %subscription, error = %e, "[Watcher] Libération de l'abonnement mort en échec.");
                        }
                        let Some(id) = self.resubscribe(&spec, tx, closed.to_string(), &mut shutdown).await? else {
                            info!("[Watcher] Signal d'arrêt reçu pendant le ré-abonnement.");
                            return Ok(());
                        };
                        summary.resubscriptions += 1;
                        active.insert(id, spec);
                    }
                },
            }
        }
    }

    async fn open(
        &self,
        spec: &SubscriptionSpec,
        tx: &mpsc::UnboundedSender<FeedMessage>,
    ) -> WatchResult<SubscriptionId> {
        let id = self
            .lifecycle
            .feed()
            .subscribe(spec.filter.clone(), spec.commitment, tx.clone())
            .await?;
        self.lifecycle.register(id).await;
        info!(subscription = %id, "[Watcher] Listener enregistré.");
        Ok(id)
    }

    /// `Ok(None)` si le signal d'arrêt arrive avant qu'un nouvel abonnement soit en place.
    async fn resubscribe<S: Future<Output = ()>>(
        &self,
        spec: &SubscriptionSpec,
        tx: &mpsc::UnboundedSender<FeedMessage>,
        reason: String,
        shutdown: &mut Pin<&mut S>,
    ) -> WatchResult<Option<SubscriptionId>> {
        let attempts = self.settings.resubscribe_attempts;
        let mut last_error = reason;
        for attempt in 1..=attempts {
            let delay = self.settings.resubscribe_delay.saturating_mul(attempt);
            // Seuls l'attente et l'abonnement sont annulables ; l'enregistrement ne l'est pas.
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.as_mut() => return Ok(None),
                subscribed = async {
                    sleep(delay).await;
                    self.lifecycle
                        .feed()
                        .subscribe(spec.filter.clone(), spec.commitment, tx.clone())
                        .await
                } => subscribed,
            };
            match subscribed {
                Ok(id) => {
                    self.lifecycle.register(id).await;
                    info!(subscription = %id, attempt, "[Watcher] Listener ré-enregistré.");
                    return Ok(Some(id));
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "[Watcher] Ré-abonnement en échec.");
                    last_error = e.to_string();
                }
            }
        }
        Err(WatchError::SubscriptionLost {
            attempts,
            reason: last_error,
        })
    }

    fn admit(&self, notification: RawNotification, cycles: &mut Cycles, summary: &mut RunSummary) {
        summary.notifications += 1;
        trace!(
            entity = %notification.entity,
            slot = notification.slot,
            data = %STANDARD.encode(&notification.data),
            "[Watcher] Notification."
        );

        match self.filter.admit(&notification) {
            Ok(Some(entity)) => {
                debug!(entity = %entity, slot = notification.slot, "[Watcher] Notification admise.");
                let reconciler = self.reconciler.clone();
                let slot = notification.slot;
                cycles.spawn(async move { reconciler.run_cycle(&entity, slot).await });
            }
            Ok(None) => {
                summary.filtered += 1;
                metrics::NOTIFICATIONS_FILTERED.inc();
            }
            Err(e) => {
                summary.decode_failures += 1;
                metrics::DECODE_FAILURES.inc();
                warn!(error = %e, slot = notification.slot, "[Watcher] Notification ignorée.");
            }
        }
    }

    /// Une panique dans un cycle est une erreur non gérée : elle arrête la boucle.
    fn record(
        joined: Result<WatchResult<CycleOutcome>, JoinError>,
        summary: &mut RunSummary,
    ) -> WatchResult<()> {
        match joined {
            Ok(Ok(outcome)) => {
                summary.cycles_ok += 1;
                summary.events_applied += outcome.applied as u64;
                Ok(())
            }
            // Déjà journalisé par le Reconciler ; le watermark n'a pas bougé.
            Ok(Err(_)) => {
                summary.cycles_failed += 1;
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(WatchError::TaskPanicked(e.to_string())),
        }
    }

    async fn drain(&self, cycles: &mut Cycles, summary: &mut RunSummary, graceful: bool) {
        if cycles.is_empty() {
            return;
        }
        if graceful {
            info!(in_flight = cycles.len(), "[Watcher] Attente des cycles en cours...");
            let finished = timeout(self.settings.shutdown_grace, async {
                while let Some(joined) = cycles.join_next().await {
                    if let Err(e) = Self::record(joined, summary) {
                        error!(error = %e, "[Watcher] Cycle en échec pendant l'arrêt.");
                    }
                }
            })
            .await;
            if finished.is_ok() {
                return;
            }
            warn!(in_flight = cycles.len(), "[Watcher] Délai de grâce dépassé, abandon des cycles restants.");
        }

        // Un cycle abandonné n'a jamais écrit son watermark : il sera rejoué.
        cycles.abort_all();
        while cycles.join_next().await.is_some() {}
    }
}
