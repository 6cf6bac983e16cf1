//! Doublures en mémoire partagées par les tests unitaires.

use crate::error::{WatchError, WatchResult};
use crate::feed::{ChangeFeed, FeedFilter, FeedMessage, FeedSink, RawNotification, SubscriptionId};
use crate::filtering::TrackedEntity;
use crate::history::{HistoryEvent, HistorySource, PageQuery};
use crate::reconciler::EventSink;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey, signature::Signature};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{Notify, Semaphore};

/// Historique scripté : chaque compte a une liste d'événements append-only.
#[derive(Default)]
pub struct ScriptedLedger {
    /// Du plus ancien au plus récent.
    histories: Mutex<HashMap<Pubkey, Vec<HistoryEvent>>>,
    failures: Mutex<VecDeque<WatchError>>,
    calls: Mutex<Vec<(Pubkey, PageQuery)>>,
    gates: Mutex<HashMap<Pubkey, Arc<Semaphore>>>,
    call_made: Notify,
    next_slot: AtomicU64,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self {
            next_slot: AtomicU64::new(100),
            ..Default::default()
        }
    }

    /// Ajoute `count` transactions au compte ; renvoie leurs signatures, de la plus ancienne à la plus récente.
    pub fn append(&self, entity: Pubkey, count: usize) -> Vec<Signature> {
        let mut histories = self.histories.lock().unwrap();
        let history = histories.entry(entity).or_default();
        (0..count)
            .map(|_| {
                let event = HistoryEvent {
                    signature: Signature::new_unique(),
                    slot: self.next_slot.fetch_add(1, Ordering::Relaxed),
                    entity,
                    block_time: None,
                    failed: false,
                    memo: None,
                };
                let signature = event.signature;
                history.push(event);
                signature
            })
            .collect()
    }

    /// Ajoute une transaction avec un slot imposé, pour fabriquer des historiques désordonnés.
    pub fn append_at_slot(&self, entity: Pubkey, slot: u64) -> Signature {
        let event = HistoryEvent {
            signature: Signature::new_unique(),
            slot,
            entity,
            block_time: None,
            failed: false,
            memo: None,
        };
        let signature = event.signature;
        self.histories.lock().unwrap().entry(entity).or_default().push(event);
        signature
    }

    /// Les prochains appels échoueront avec ces erreurs, dans l'ordre.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = WatchError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Bloque les appels pour `entity` : chaque appel consomme un permis du sémaphore renvoyé.
    pub fn hold(&self, entity: Pubkey) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(entity, gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<(Pubkey, PageQuery)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, entity: &Pubkey) -> Vec<PageQuery> {
        self.calls()
            .into_iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, q)| q)
            .collect()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.call_made.notified();
            if self.calls.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn answer(&self, entity: &Pubkey, query: PageQuery) -> Vec<HistoryEvent> {
        let histories = self.histories.lock().unwrap();
        let Some(history) = histories.get(entity) else {
            return Vec::new();
        };
        let position = |sig: &Signature| history.iter().position(|e| &e.signature == sig);
        let lower = query.until.and_then(|s| position(&s)).map(|i| i + 1).unwrap_or(0);
        let upper = query.before.and_then(|s| position(&s)).unwrap_or(history.len());
        if lower >= upper {
            return Vec::new();
        }
        history[lower..upper]
            .iter()
            .rev()
            .take(query.limit)
            .cloned()
            .collect()
    }
}

impl HistorySource for ScriptedLedger {
    async fn list_events(&self, entity: &Pubkey, query: PageQuery) -> WatchResult<Vec<HistoryEvent>> {
        self.calls.lock().unwrap().push((*entity, query));
        self.call_made.notify_waiters();

        let gate = self.gates.lock().unwrap().get(entity).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self.answer(entity, query))
    }
}

impl HistorySource for Arc<ScriptedLedger> {
    async fn list_events(&self, entity: &Pubkey, query: PageQuery) -> WatchResult<Vec<HistoryEvent>> {
        self.as_ref().list_events(entity, query).await
    }
}

/// Enregistre chaque événement appliqué, dans l'ordre.
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(Pubkey, Signature)>>,
    fail_on: Mutex<HashSet<Signature>>,
}

impl RecordingSink {
    pub fn applied(&self) -> Vec<(Pubkey, Signature)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_for(&self, entity: &Pubkey) -> Vec<Signature> {
        self.applied()
            .into_iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, s)| s)
            .collect()
    }

    /// Le premier passage sur cette signature échouera.
    pub fn fail_once_on(&self, signature: Signature) {
        self.fail_on.lock().unwrap().insert(signature);
    }
}

impl EventSink for RecordingSink {
    async fn on_new_event(&self, entity: &TrackedEntity, event: &HistoryEvent) -> WatchResult<()> {
        if self.fail_on.lock().unwrap().remove(&event.signature) {
            return Err(WatchError::Sink {
                signature: event.signature.to_string(),
                reason: "échec simulé".into(),
            });
        }
        self.applied.lock().unwrap().push((entity.key, event.signature));
        Ok(())
    }
}

impl EventSink for Arc<RecordingSink> {
    async fn on_new_event(&self, entity: &TrackedEntity, event: &HistoryEvent) -> WatchResult<()> {
        self.as_ref().on_new_event(entity, event).await
    }
}

/// Flux factice : les tests poussent les notifications à la main.
#[derive(Default)]
pub struct FakeFeed {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<SubscriptionId, FeedSink>>,
    filters: Mutex<Vec<FeedFilter>>,
    unsubscribed: Mutex<HashMap<SubscriptionId, usize>>,
    failing_unsubscribes: Mutex<HashSet<SubscriptionId>>,
    failing_subscribes: Mutex<usize>,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn active(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.sinks.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn subscribe_count(&self) -> usize {
        self.filters.lock().unwrap().len()
    }

    pub fn unsubscribe_count(&self, id: SubscriptionId) -> usize {
        self.unsubscribed.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn fail_unsubscribe(&self, id: SubscriptionId) {
        self.failing_unsubscribes.lock().unwrap().insert(id);
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        *self.failing_subscribes.lock().unwrap() = count;
    }

    pub fn push(&self, id: SubscriptionId, entity: Pubkey, data: Vec<u8>, slot: u64) {
        let sink = self.sinks.lock().unwrap().get(&id).cloned().expect("abonnement actif");
        let notification = RawNotification { subscription: id, entity, data, slot };
        sink.send(FeedMessage::Notification(notification)).unwrap();
    }

    /// Simule la mort du transport.
    pub fn close(&self, id: SubscriptionId) {
        let sink = self.sinks.lock().unwrap().get(&id).cloned().expect("abonnement actif");
        sink.send(FeedMessage::Closed { subscription: id, reason: "transport coupé".into() })
            .unwrap();
    }
}

impl ChangeFeed for FakeFeed {
    async fn subscribe(
        &self,
        filter: FeedFilter,
        _commitment: CommitmentConfig,
        sink: FeedSink,
    ) -> WatchResult<SubscriptionId> {
        {
            let mut failing = self.failing_subscribes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(WatchError::Transient("nœud injoignable".into()));
            }
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.filters.lock().unwrap().push(filter);
        self.sinks.lock().unwrap().insert(id, sink);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> WatchResult<()> {
        if self.sinks.lock().unwrap().remove(&id).is_none() {
            return Err(WatchError::UnknownSubscription(id));
        }
        *self.unsubscribed.lock().unwrap().entry(id).or_default() += 1;
        if self.failing_unsubscribes.lock().unwrap().contains(&id) {
            return Err(WatchError::Transient("désabonnement refusé".into()));
        }
        Ok(())
    }
}

pub fn entity(key: Pubkey) -> TrackedEntity {
    TrackedEntity { key, owner: key, label: None }
}
