// DANS : src/reconciler/sink.rs

use super::EventSink;
use crate::error::WatchResult;
use crate::filtering::TrackedEntity;
use crate::history::HistoryEvent;
use tracing::info;

/// Sink par défaut : journalise chaque nouvelle transaction.
/// C'est ici qu'un traitement métier viendrait se brancher.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    async fn on_new_event(&self, entity: &TrackedEntity, event: &HistoryEvent) -> WatchResult<()> {
        info!(
            entity = %entity.key,
            owner = %entity.owner,
            label = entity.label.as_deref().unwrap_or(""),
            signature = %event.signature,
            slot = event.slot,
            block_time = ?event.block_time,
            failed = event.failed,
            memo = event.memo.as_deref().unwrap_or(""),
            "[Sink] Nouvelle transaction."
        );
        Ok(())
    }
}
