// DANS : src/history/fetcher.rs

use super::{HistoryEvent, HistorySource, PageQuery, RetryPolicy};
use crate::error::WatchResult;
use crate::monitoring::metrics;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::HashSet;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Récupère tout ce qui est plus récent qu'un watermark, page par page.
pub struct HistoryFetcher<H> {
    source: H,
    retry: RetryPolicy,
    page_limit: usize,
    max_backfill: usize,
}

impl<H: HistorySource> HistoryFetcher<H> {
    pub fn new(source: H, retry: RetryPolicy, page_limit: usize, max_backfill: usize) -> Self {
        Self {
            source,
            retry,
            page_limit: page_limit.max(1),
            max_backfill: max_backfill.max(1),
        }
    }

    pub fn source(&self) -> &H {
        &self.source
    }

    /// Renvoie les événements strictement plus récents que `watermark`, du plus récent au plus ancien.
    ///
    /// Sans watermark, renvoie tout l'historique disponible, limité aux
    /// `max_backfill` événements les plus récents.
    pub async fn fetch_since(
        &self,
        entity: &Pubkey,
        watermark: Option<Signature>,
    ) -> WatchResult<Vec<HistoryEvent>> {
        let _timer = metrics::HISTORY_FETCH_LATENCY.start_timer();
        let mut events: Vec<HistoryEvent> = Vec::new();
        let mut seen = HashSet::new();
        let mut before = None;

        loop {
            let query = PageQuery {
                before,
                until: watermark,
                limit: self.page_limit,
            };
            let page = self.fetch_page(entity, query).await?;
            let page_len = page.len();

            for event in page {
                if Some(event.signature) == watermark || !seen.insert(event.signature) {
                    debug!(entity = %entity, signature = %event.signature, "[History] Doublon ignoré.");
                    continue;
                }
                if let Some(previous) = events.last() {
                    if event.slot > previous.slot {
                        metrics::HISTORY_ORDER_ANOMALIES.inc();
                        warn!(
                            entity = %entity,
                            signature = %event.signature,
                            slot = event.slot,
                            previous_slot = previous.slot,
                            "[History] Page hors d'ordre chronologique inverse."
                        );
                    }
                }
                events.push(event);

                if watermark.is_none() && events.len() >= self.max_backfill {
                    warn!(
                        entity = %entity,
                        max_backfill = self.max_backfill,
                        "[History] Historique initial tronqué aux événements les plus récents."
                    );
                    return Ok(events);
                }
            }

            if page_len < self.page_limit {
                break;
            }

            let next_before = events.last().map(|e| e.signature);
            if next_before == before {
                // Page pleine mais uniquement des doublons : on n'avancerait plus.
                warn!(entity = %entity, "[History] La pagination ne progresse plus, arrêt.");
                break;
            }
            before = next_before;
        }

        Ok(events)
    }

    /// L'événement le plus récent du compte, s'il y en a un.
    pub async fn fetch_newest(&self, entity: &Pubkey) -> WatchResult<Option<HistoryEvent>> {
        let query = PageQuery {
            before: None,
            until: None,
            limit: 1,
        };
        Ok(self.fetch_page(entity, query).await?.into_iter().next())
    }

    async fn fetch_page(&self, entity: &Pubkey, query: PageQuery) -> WatchResult<Vec<HistoryEvent>> {
        let mut attempt = 0;
        loop {
            match self.source.list_events(entity, query).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    metrics::HISTORY_FETCH_RETRIES.inc();
                    warn!(
                        entity = %entity,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "[History] Erreur transitoire, nouvelle tentative."
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
