// DANS : src/reconciler/mod.rs

pub mod sink;

use crate::error::{WatchError, WatchResult};
use crate::filtering::TrackedEntity;
use crate::history::{HistoryEvent, HistoryFetcher, HistorySource};
use crate::monitoring::{metrics, phase_label};
use crate::state::WatermarkStore;
use serde::Deserialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info};

pub use sink::LoggingSink;

/// L'effet de bord déclenché pour chaque nouvel événement, dans l'ordre causal.
pub trait EventSink: Send + Sync + 'static {
    fn on_new_event(
        &self,
        entity: &TrackedEntity,
        event: &HistoryEvent,
    ) -> impl Future<Output = WatchResult<()>> + Send;
}

/// Que faire quand un compte n'a encore aucun watermark.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackfillPolicy {
    /// Rejouer tout l'historique disponible (borné) puis poser le watermark.
    #[default]
    Full,
    /// Poser le watermark sur la transaction la plus récente, sans rien rejouer.
    Seed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Applying,
}

/// Résultat d'un cycle de rattrapage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub entity: Pubkey,
    pub applied: usize,
    pub previous: Option<Signature>,
    pub current: Option<Signature>,
    /// Le watermark a été posé sans rejouer d'historique (`BackfillPolicy::Seed`).
    pub seeded: bool,
}

impl CycleOutcome {
    fn unchanged(entity: Pubkey, watermark: Option<Signature>) -> Self {
        Self {
            entity,
            applied: 0,
            previous: watermark,
            current: watermark,
            seeded: false,
        }
    }
}

/// La file d'un compte : un seul cycle à la fois.
#[derive(Default)]
struct EntityLane {
    /// Nombre de cycles terminés ou en cours ; le verrou est tenu pendant tout le cycle.
    serial: tokio::sync::Mutex<u64>,
    phase: Mutex<Phase>,
}

impl EntityLane {
    fn set_phase(&self, entity: &Pubkey, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                debug!(entity = %entity, from = ?*current, to = ?phase, "[Reconciler] Transition.");
                metrics::PHASE_TRANSITIONS.with_label_values(&[phase_label(phase)]).inc();
                *current = phase;
            }
        }
    }
}

/// Repasse la file en `Idle` même si le cycle est annulé en plein vol.
struct IdleOnDrop<'a> {
    lane: &'a EntityLane,
    entity: Pubkey,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.lane.set_phase(&self.entity, Phase::Idle);
    }
}

/// Le moteur de rattrapage d'historique.
///
/// Les cycles d'un même compte sont sérialisés (lecture du watermark, fetch,
/// application, écriture du watermark), ceux de comptes différents tournent
/// en parallèle. Le watermark n'est écrit qu'une fois les événements
/// appliqués : un cycle annulé ne fait jamais avancer le watermark.
pub struct Reconciler<W, H, A> {
    store: W,
    fetcher: HistoryFetcher<H>,
    sink: A,
    policy: BackfillPolicy,
    lanes: Mutex<HashMap<Pubkey, Arc<EntityLane>>>,
}

impl<W, H, A> Reconciler<W, H, A>
where
    W: WatermarkStore,
    H: HistorySource,
    A: EventSink,
{
    pub fn new(store: W, fetcher: HistoryFetcher<H>, sink: A, policy: BackfillPolicy) -> Self {
        Self {
            store,
            fetcher,
            sink,
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    pub fn fetcher(&self) -> &HistoryFetcher<H> {
        &self.fetcher
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    /// Les comptes qui ont déjà eu au moins un cycle.
    pub fn tracked_entities(&self) -> Vec<Pubkey> {
        self.lanes
            .lock()
            .map(|lanes| lanes.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn phase(&self, entity: &Pubkey) -> Phase {
        self.lanes
            .lock()
            .ok()
            .and_then(|lanes| lanes.get(entity).cloned())
            .and_then(|lane| lane.phase.lock().ok().map(|p| *p))
            .unwrap_or_default()
    }

    fn lane(&self, entity: &Pubkey) -> WatchResult<Arc<EntityLane>> {
        let mut lanes = self
            .lanes
            .lock()
            .map_err(|_| WatchError::Store("table des files empoisonnée".into()))?;
        Ok(lanes.entry(*entity).or_default().clone())
    }

    /// Pose un watermark de départ si le compte n'en a pas encore.
    /// Renvoie `true` si la valeur a été écrite.
    pub async fn seed_watermark(&self, entity: &Pubkey, signature: Signature) -> WatchResult<bool> {
        let lane = self.lane(entity)?;
        let _serial = lane.serial.lock().await;
        if self.store.get(entity).await?.is_some() {
            return Ok(false);
        }
        self.store.set(entity, signature).await?;
        info!(entity = %entity, signature = %signature, "[Reconciler] Watermark initial posé.");
        Ok(true)
    }

    /// Un cycle complet pour une notification admise par la liste blanche.
    pub async fn run_cycle(&self, entity: &TrackedEntity, trigger_slot: u64) -> WatchResult<CycleOutcome> {
        let lane = self.lane(&entity.key)?;
        let mut serial = lane.serial.lock().await;
        *serial += 1;
        let cycle = *serial;

        let _idle = IdleOnDrop {
            lane: &lane,
            entity: entity.key,
        };
        let result = self.catch_up(&lane, entity, trigger_slot, cycle).await;

        match &result {
            Ok(outcome) if outcome.seeded => metrics::CYCLES.with_label_values(&["seeded"]).inc(),
            Ok(outcome) if outcome.applied > 0 => metrics::CYCLES.with_label_values(&["applied"]).inc(),
            Ok(_) => metrics::CYCLES.with_label_values(&["noop"]).inc(),
            Err(e) => {
                metrics::CYCLES.with_label_values(&["error"]).inc();
                error!(entity = %entity, cycle, error = %e, "[Reconciler] Cycle en échec, watermark conservé.");
            }
        }
        result
    }

    async fn catch_up(
        &self,
        lane: &EntityLane,
        entity: &TrackedEntity,
        trigger_slot: u64,
        cycle: u64,
    ) -> WatchResult<CycleOutcome> {
        lane.set_phase(&entity.key, Phase::Fetching);
        let watermark = self.store.get(&entity.key).await?;
        debug!(
            entity = %entity,
            cycle,
            slot = trigger_slot,
            watermark = ?watermark.map(|s| s.to_string()),
            "[Reconciler] Recherche des nouvelles transactions."
        );

        let events = match (watermark, self.policy) {
            (Some(_), _) | (None, BackfillPolicy::Full) => {
                self.fetcher.fetch_since(&entity.key, watermark).await?
            }
            (None, BackfillPolicy::Seed) => return self.seed_from_head(entity).await,
        };

        let Some(newest) = events.first().map(|e| e.signature) else {
            debug!(entity = %entity, cycle, "[Reconciler] Rien de nouveau.");
            return Ok(CycleOutcome::unchanged(entity.key, watermark));
        };

        lane.set_phase(&entity.key, Phase::Applying);
        let mut last_applied = None;
        // Les événements arrivent du plus récent au plus ancien : on les applique dans l'autre sens.
        for event in events.iter().rev() {
            if let Err(e) = self.sink.on_new_event(entity, event).await {
                error!(entity = %entity, cycle, signature = %event.signature, error = %e, "[Reconciler] Échec du sink.");
                // L'erreur du sink reste celle qu'on remonte ; celle du stockage est seulement journalisée.
                if let Some(applied) = last_applied {
                    if let Err(store_error) = self.store.set(&entity.key, applied).await {
                        error!(
                            entity = %entity,
                            watermark = %applied,
                            error = %store_error,
                            "[Reconciler] Watermark partiel non enregistré, les événements appliqués seront rejoués."
                        );
                    }
                }
                return Err(e);
            }
            metrics::EVENTS_APPLIED.inc();
            last_applied = Some(event.signature);
        }

        self.store.set(&entity.key, newest).await?;
        info!(
            entity = %entity,
            cycle,
            slot = trigger_slot,
            applied = events.len(),
            watermark = %newest,
            "[Reconciler] Watermark avancé."
        );

        Ok(CycleOutcome {
            entity: entity.key,
            applied: events.len(),
            previous: watermark,
            current: Some(newest),
            seeded: false,
        })
    }

    async fn seed_from_head(&self, entity: &TrackedEntity) -> WatchResult<CycleOutcome> {
        let Some(head) = self.fetcher.fetch_newest(&entity.key).await? else {
            debug!(entity = %entity, "[Reconciler] Aucun historique, rien à amorcer.");
            return Ok(CycleOutcome::unchanged(entity.key, None));
        };
        self.store.set(&entity.key, head.signature).await?;
        info!(entity = %entity, watermark = %head.signature, "[Reconciler] Watermark amorcé sans rattrapage.");
        Ok(CycleOutcome {
            entity: entity.key,
            applied: 0,
            previous: None,
            current: Some(head.signature),
            seeded: true,
        })
    }
}
