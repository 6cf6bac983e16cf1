// DANS : src/error.rs

use crate::feed::SubscriptionId;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Toutes les erreurs que la bibliothèque peut remonter.
///
/// La distinction importante est `is_transient()` : seules les erreurs
/// transitoires sont ré-essayées par le `HistoryFetcher`.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Coupure réseau, erreur RPC, limite de débit... On peut ré-essayer.
    #[error("erreur transitoire de la source : {0}")]
    Transient(String),

    /// La source a répondu quelque chose d'inexploitable. Inutile de ré-essayer.
    #[error("erreur fatale de la source : {0}")]
    Source(String),

    #[error("données de compte illisibles pour {entity}: {reason}")]
    Decode { entity: Pubkey, reason: String },

    #[error("l'abonnement {subscription} s'est fermé : {reason}")]
    SubscriptionClosed {
        subscription: SubscriptionId,
        reason: String,
    },

    #[error("abonnement perdu après {attempts} tentatives de ré-abonnement : {reason}")]
    SubscriptionLost { attempts: u32, reason: String },

    #[error("abonnement inconnu : {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("échec du traitement de l'événement {signature} : {reason}")]
    Sink { signature: String, reason: String },

    #[error("erreur du stockage des watermarks : {0}")]
    Store(String),

    #[error("configuration invalide : {0}")]
    Config(String),

    #[error("une tâche de réconciliation a paniqué : {0}")]
    TaskPanicked(String),
}

impl WatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WatchError::Transient(_))
    }
}

pub type WatchResult<T> = std::result::Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(WatchError::Transient("429".into()).is_transient());
        assert!(!WatchError::Source("bad signature".into()).is_transient());
        assert!(!WatchError::Store("disk full".into()).is_transient());
    }
}
