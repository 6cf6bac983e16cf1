// DANS : src/history/mod.rs

pub mod fetcher;

use crate::error::WatchResult;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{future::Future, time::Duration};

pub use fetcher::HistoryFetcher;

/// Une transaction de l'historique d'un compte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    /// L'identifiant ordonné de l'événement (la signature de la transaction).
    pub signature: Signature,
    pub slot: u64,
    pub entity: Pubkey,
    pub block_time: Option<i64>,
    /// La transaction a échoué on-chain (elle fait quand même partie de l'historique).
    pub failed: bool,
    pub memo: Option<String>,
}

/// Une page de `getSignaturesForAddress`.
///
/// La source renvoie au plus `limit` événements, du plus récent au plus
/// ancien, strictement plus anciens que `before` et strictement plus récents
/// que `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub before: Option<Signature>,
    pub until: Option<Signature>,
    pub limit: usize,
}

/// Requête paginée d'historique vers l'extérieur (le nœud RPC en production).
pub trait HistorySource: Send + Sync + 'static {
    fn list_events(
        &self,
        entity: &Pubkey,
        query: PageQuery,
    ) -> impl Future<Output = WatchResult<Vec<HistoryEvent>>> + Send;
}

/// Ré-essais avec backoff exponentiel plafonné.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Délai avant la tentative `attempt + 1` (attempt commence à 0).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}
