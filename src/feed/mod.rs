// DANS : src/feed/mod.rs

pub mod pubsub;

use crate::error::WatchResult;
use solana_program_pack::Pack as _;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::{fmt, future::Future};
use tokio::sync::mpsc;

pub use pubsub::PubsubChangeFeed;

/// Identifiant opaque d'un abonnement, attribué par le `ChangeFeed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Le filtre côté serveur d'un abonnement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFilter {
    /// Un seul compte (`accountSubscribe`).
    Account(Pubkey),
    /// Tous les comptes d'un programme qui passent les filtres (`programSubscribe`).
    Program {
        program_id: Pubkey,
        /// Paires (offset, octets attendus) comparées octet par octet.
        memcmp: Vec<(usize, Vec<u8>)>,
        data_size: Option<u64>,
    },
}

impl FeedFilter {
    /// Filtre "tous les comptes de jetons SPL d'un mint donné".
    /// Le mint est stocké à l'offset 0 d'un compte de jetons.
    pub fn token_accounts_of_mint(mint: &Pubkey) -> Self {
        FeedFilter::Program {
            program_id: spl_token::id(),
            memcmp: vec![(0, mint.to_bytes().to_vec())],
            data_size: Some(spl_token::state::Account::LEN as u64),
        }
    }
}

/// Une notification brute : "l'état de ce compte a peut-être changé".
/// Rien ne garantit qu'elle corresponde à un nouvel historique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub subscription: SubscriptionId,
    pub entity: Pubkey,
    pub data: Vec<u8>,
    pub slot: u64,
}

/// Ce que le flux pousse vers le dispatcher.
#[derive(Debug)]
pub enum FeedMessage {
    Notification(RawNotification),
    /// Le transport est mort : l'abonnement ne livrera plus rien.
    Closed {
        subscription: SubscriptionId,
        reason: String,
    },
}

pub type FeedSink = mpsc::UnboundedSender<FeedMessage>;

/// Une source de notifications de changement de compte.
///
/// `subscribe` ne sérialise rien : chaque notification est poussée dans le
/// `sink` dès réception et le consommateur doit s'attendre à les traiter en
/// parallèle.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe(
        &self,
        filter: FeedFilter,
        commitment: CommitmentConfig,
        sink: FeedSink,
    ) -> impl Future<Output = WatchResult<SubscriptionId>> + Send;

    /// À appeler une seule fois par abonnement. Un id inconnu renvoie
    /// `WatchError::UnknownSubscription`.
    fn unsubscribe(&self, subscription: SubscriptionId)
    -> impl Future<Output = WatchResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_filter_matches_token_account_layout() {
        let mint = Pubkey::new_unique();
        match FeedFilter::token_accounts_of_mint(&mint) {
            FeedFilter::Program {
                program_id,
                memcmp,
                data_size,
            } => {
                assert_eq!(program_id, spl_token::id());
                assert_eq!(memcmp, vec![(0, mint.to_bytes().to_vec())]);
                assert_eq!(data_size, Some(165));
            }
            other => panic!("filtre inattendu : {:?}", other),
        }
    }
}
