// DANS : src/filtering/whitelist.rs

use crate::decoders::decode_token_account;
use crate::error::{WatchError, WatchResult};
use crate::feed::RawNotification;
use solana_sdk::pubkey::Pubkey;
use std::{collections::HashMap, fmt, str::FromStr};

/// Un compte suivi. Il devient "suivi" la première fois qu'une de ses
/// notifications passe la liste blanche, et le reste jusqu'à l'arrêt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntity {
    pub key: Pubkey,
    /// Propriétaire lu dans le compte de jetons (ou la clé elle-même en mode statique).
    pub owner: Pubkey,
    pub label: Option<String>,
}

impl fmt::Display for TrackedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", self.key, label),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Prédicat pur qui décide si une notification déclenche un cycle de rattrapage.
#[derive(Debug, Clone)]
pub enum EntityFilter {
    /// Ensemble fixe de comptes (variante "portefeuille personnel").
    Static(HashMap<Pubkey, Option<String>>),
    /// Comptes de jetons dont le propriétaire est dans la liste (variante "programme").
    OwnerWhitelist(HashMap<Pubkey, Option<String>>),
}

impl EntityFilter {
    /// `Ok(None)` : hors liste blanche. `Err(Decode)` : données illisibles,
    /// la notification doit être ignorée sans affecter les autres.
    pub fn admit(&self, notification: &RawNotification) -> WatchResult<Option<TrackedEntity>> {
        match self {
            EntityFilter::Static(accounts) => Ok(accounts.get(&notification.entity).map(|label| {
                TrackedEntity {
                    key: notification.entity,
                    owner: notification.entity,
                    label: label.clone(),
                }
            })),
            EntityFilter::OwnerWhitelist(owners) => {
                let decoded = decode_token_account(&notification.entity, &notification.data)?;
                Ok(owners.get(&decoded.owner).map(|label| TrackedEntity {
                    key: notification.entity,
                    owner: decoded.owner,
                    label: label.clone(),
                }))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EntityFilter::Static(m) | EntityFilter::OwnerWhitelist(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse des entrées `pubkey` ou `label=pubkey`.
pub fn parse_labeled_keys(entries: &[String]) -> WatchResult<HashMap<Pubkey, Option<String>>> {
    let mut keys = HashMap::with_capacity(entries.len());
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let (label, key) = match entry.split_once('=') {
            Some((label, key)) => (Some(label.trim().to_string()), key.trim()),
            None => (None, entry),
        };
        let pubkey = Pubkey::from_str(key)
            .map_err(|e| WatchError::Config(format!("clé invalide '{}' : {}", key, e)))?;
        keys.insert(pubkey, label);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::token_account::encode_token_account;
    use crate::feed::SubscriptionId;

    fn notification(entity: Pubkey, data: Vec<u8>) -> RawNotification {
        RawNotification { subscription: SubscriptionId(1), entity, data, slot: 10 }
    }

    #[test]
    fn owner_whitelist_admits_only_listed_owners() {
        let (mint, alice, mallory) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        let filter = EntityFilter::OwnerWhitelist(HashMap::from([(alice, Some("alice".to_string()))]));

        let alice_account = Pubkey::new_unique();
        let admitted = filter
            .admit(&notification(alice_account, encode_token_account(mint, alice, 1)))
            .unwrap()
            .unwrap();
        assert_eq!(admitted.key, alice_account);
        assert_eq!(admitted.owner, alice);
        assert_eq!(admitted.label.as_deref(), Some("alice"));

        let rejected = filter
            .admit(&notification(Pubkey::new_unique(), encode_token_account(mint, mallory, 1)))
            .unwrap();
        assert!(rejected.is_none());
    }

    #[test]
    fn owner_whitelist_reports_decode_errors() {
        let filter = EntityFilter::OwnerWhitelist(HashMap::from([(Pubkey::new_unique(), None)]));
        assert!(matches!(
            filter.admit(&notification(Pubkey::new_unique(), vec![0xde, 0xad])),
            Err(WatchError::Decode { .. })
        ));
    }

    #[test]
    fn static_filter_ignores_data() {
        let account = Pubkey::new_unique();
        let filter = EntityFilter::Static(HashMap::from([(account, None)]));
        let admitted = filter.admit(&notification(account, vec![])).unwrap().unwrap();
        assert_eq!(admitted.owner, account);
        assert!(filter.admit(&notification(Pubkey::new_unique(), vec![])).unwrap().is_none());
    }

    #[test]
    fn parses_plain_and_labeled_entries() {
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let parsed = parse_labeled_keys(&[a.to_string(), format!("receiver = {}", b), " ".to_string()]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&a], None);
        assert_eq!(parsed[&b].as_deref(), Some("receiver"));
        assert!(matches!(
            parse_labeled_keys(&["nope".to_string()]),
            Err(WatchError::Config(_))
        ));
    }
}
