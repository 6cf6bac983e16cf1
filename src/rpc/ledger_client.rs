// DANS : src/rpc/ledger_client.rs

use crate::error::{WatchError, WatchResult};
use crate::history::{HistoryEvent, HistorySource, PageQuery};
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
    rpc_client::GetConfirmedSignaturesForAddress2Config,
    rpc_response::RpcConfirmedTransactionStatusWithSignature,
};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey, signature::Signature};
use std::{str::FromStr, sync::Arc};

/// `getSignaturesForAddress` du nœud RPC, exposé comme `HistorySource`.
///
/// Pas de ré-essai ici : le client se contente de classer les erreurs,
/// c'est le `HistoryFetcher` qui décide de ré-essayer.
#[derive(Clone)]
pub struct RpcHistorySource {
    client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl RpcHistorySource {
    pub fn new(rpc_url: String, commitment: CommitmentConfig) -> Self {
        Self {
            client: Arc::new(RpcClient::new_with_commitment(rpc_url, commitment)),
            commitment,
        }
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    /// Détermine si une erreur du client est temporaire et si une nouvelle tentative doit être effectuée.
    fn is_retryable(error: &ClientError) -> bool {
        matches!(
            error.kind(),
            ClientErrorKind::Reqwest(_) | ClientErrorKind::RpcError(_) | ClientErrorKind::Io(_)
        )
    }

    fn classify(entity: &Pubkey, error: ClientError) -> WatchError {
        let message = format!("getSignaturesForAddress({}) : {}", entity, error);
        if Self::is_retryable(&error) {
            WatchError::Transient(message)
        } else {
            WatchError::Source(message)
        }
    }
}

fn to_event(entity: &Pubkey, status: RpcConfirmedTransactionStatusWithSignature) -> WatchResult<HistoryEvent> {
    let signature = Signature::from_str(&status.signature).map_err(|e| {
        WatchError::Source(format!("signature illisible '{}' : {}", status.signature, e))
    })?;
    Ok(HistoryEvent {
        signature,
        slot: status.slot,
        entity: *entity,
        block_time: status.block_time,
        failed: status.err.is_some(),
        memo: status.memo,
    })
}

impl HistorySource for RpcHistorySource {
    async fn list_events(&self, entity: &Pubkey, query: PageQuery) -> WatchResult<Vec<HistoryEvent>> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: query.before,
            until: query.until,
            limit: Some(query.limit),
            commitment: Some(self.commitment),
        };
        let statuses = self
            .client
            .get_signatures_for_address_with_config(entity, config)
            .await
            .map_err(|e| Self::classify(entity, e))?;

        statuses.into_iter().map(|status| to_event(entity, status)).collect()
    }
}
