// DANS : src/config.rs

use crate::error::{WatchError, WatchResult};
use crate::feed::FeedFilter;
use crate::filtering::{EntityFilter, parse_labeled_keys};
use crate::history::RetryPolicy;
use crate::reconciler::BackfillPolicy;
use crate::watcher::{SubscriptionSpec, WatcherSettings};
use anyhow::{Context, Result};
use serde::Deserialize;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
};
use spl_associated_token_account::get_associated_token_address;
use std::{collections::HashMap, path::PathBuf, str::FromStr, time::Duration};

/// Limite dure de `getSignaturesForAddress`.
pub const MAX_HISTORY_PAGE_LIMIT: usize = 1_000;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// `programSubscribe` sur les comptes de jetons du mint + liste blanche de propriétaires.
    #[default]
    Program,
    /// `accountSubscribe` sur un seul compte de jetons.
    Wallet,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub solana_rpc_url: String,
    pub solana_ws_url: Option<String>,
    #[serde(default)]
    pub watch_mode: WatchMode,
    pub token_mint: Option<String>,
    #[serde(default)]
    pub tracked_owners: Vec<String>,
    pub watched_account: Option<String>,
    /// Tableau JSON de clés secrètes en base58.
    pub secret_keys: Option<String>,
    #[serde(default = "default_receiver_index")]
    pub receiver_index: usize,
    #[serde(default = "default_commitment")]
    pub feed_commitment: String,
    #[serde(default = "default_commitment")]
    pub history_commitment: String,
    #[serde(default)]
    pub backfill_policy: BackfillPolicy,
    pub initial_watermark: Option<String>,
    #[serde(default = "default_max_backfill_events")]
    pub max_backfill_events: usize,
    #[serde(default = "default_history_page_limit")]
    pub history_page_limit: usize,
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,
    #[serde(default = "default_rpc_retry_delay_ms")]
    pub rpc_retry_delay_ms: u64,
    #[serde(default = "default_rpc_max_delay_ms")]
    pub rpc_max_delay_ms: u64,
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    pub watermark_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

fn default_receiver_index() -> usize { 2 }
fn default_commitment() -> String { "confirmed".to_string() }
fn default_max_backfill_events() -> usize { 1_000 }
fn default_history_page_limit() -> usize { MAX_HISTORY_PAGE_LIMIT }
fn default_rpc_max_retries() -> u32 { 5 }
fn default_rpc_retry_delay_ms() -> u64 { 250 }
fn default_rpc_max_delay_ms() -> u64 { 5_000 }
fn default_resubscribe_attempts() -> u32 { 5 }
fn default_shutdown_grace_secs() -> u64 { 10 }

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let config = envy::from_iter::<_, Config>(vars).context("Lecture des variables d'environnement")?;
        config.validate().context("Configuration invalide")?;
        Ok(config)
    }

    /// Vérifie tout ce qui ne peut être vérifié qu'après désérialisation.
    pub fn validate(&self) -> WatchResult<()> {
        if self.history_page_limit == 0 || self.history_page_limit > MAX_HISTORY_PAGE_LIMIT {
            return Err(WatchError::Config(format!(
                "HISTORY_PAGE_LIMIT doit être entre 1 et {}",
                MAX_HISTORY_PAGE_LIMIT
            )));
        }
        if self.max_backfill_events == 0 {
            return Err(WatchError::Config("MAX_BACKFILL_EVENTS doit être > 0".into()));
        }
        self.feed_commitment()?;
        self.history_commitment()?;
        self.initial_watermark()?;
        self.entity_filter()?;
        Ok(())
    }

    /// URL WebSocket explicite, sinon dérivée de l'URL RPC.
    pub fn ws_url(&self) -> String {
        match &self.solana_ws_url {
            Some(url) => url.clone(),
            None => derive_ws_url(&self.solana_rpc_url),
        }
    }

    pub fn feed_commitment(&self) -> WatchResult<CommitmentConfig> {
        parse_commitment("FEED_COMMITMENT", &self.feed_commitment)
    }

    /// `getSignaturesForAddress` n'accepte pas `processed`.
    pub fn history_commitment(&self) -> WatchResult<CommitmentConfig> {
        let commitment = parse_commitment("HISTORY_COMMITMENT", &self.history_commitment)?;
        if commitment == CommitmentConfig::processed() {
            return Err(WatchError::Config(
                "HISTORY_COMMITMENT=processed n'est pas accepté par getSignaturesForAddress (confirmed ou finalized)".into(),
            ));
        }
        Ok(commitment)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.rpc_max_retries,
            base_delay: Duration::from_millis(self.rpc_retry_delay_ms),
            max_delay: Duration::from_millis(self.rpc_max_delay_ms.max(self.rpc_retry_delay_ms)),
        }
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            resubscribe_attempts: self.resubscribe_attempts,
            resubscribe_delay: Duration::from_millis(self.rpc_retry_delay_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn token_mint(&self) -> WatchResult<Pubkey> {
        let mint = self
            .token_mint
            .as_deref()
            .ok_or_else(|| WatchError::Config("TOKEN_MINT manquant".into()))?;
        parse_pubkey("TOKEN_MINT", mint)
    }

    pub fn initial_watermark(&self) -> WatchResult<Option<Signature>> {
        self.initial_watermark
            .as_deref()
            .map(|s| {
                Signature::from_str(s.trim())
                    .map_err(|e| WatchError::Config(format!("INITIAL_WATERMARK invalide : {}", e)))
            })
            .transpose()
    }

    /// Les signataires de `SECRET_KEYS`, dans l'ordre.
    pub fn signers(&self) -> WatchResult<Vec<Keypair>> {
        let raw = self
            .secret_keys
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| WatchError::Config("SECRET_KEYS manquant".into()))?;
        let keys: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| WatchError::Config(format!("SECRET_KEYS doit être un tableau JSON de chaînes : {}", e)))?;

        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                let bytes = bs58::decode(key.trim())
                    .into_vec()
                    .map_err(|e| WatchError::Config(format!("SECRET_KEYS[{}] n'est pas du base58 : {}", i, e)))?;
                Keypair::try_from(bytes.as_slice())
                    .map_err(|e| WatchError::Config(format!("SECRET_KEYS[{}] invalide : {}", i, e)))
            })
            .collect()
    }

    /// Le compte suivi en mode `wallet` : `WATCHED_ACCOUNT`, sinon le compte de
    /// jetons associé du signataire `RECEIVER_INDEX` pour `TOKEN_MINT`.
    pub fn watched_account(&self) -> WatchResult<Pubkey> {
        if let Some(account) = &self.watched_account {
            return parse_pubkey("WATCHED_ACCOUNT", account);
        }
        let owner = self.receiver()?.pubkey();
        Ok(get_associated_token_address(&owner, &self.token_mint()?))
    }

    pub fn receiver(&self) -> WatchResult<Keypair> {
        let mut signers = self.signers()?;
        if self.receiver_index >= signers.len() {
            return Err(WatchError::Config(format!(
                "RECEIVER_INDEX={} mais SECRET_KEYS ne contient que {} clé(s)",
                self.receiver_index,
                signers.len()
            )));
        }
        Ok(signers.swap_remove(self.receiver_index))
    }

    pub fn entity_filter(&self) -> WatchResult<EntityFilter> {
        match self.watch_mode {
            WatchMode::Program => {
                self.token_mint()?;
                let owners = parse_labeled_keys(&self.tracked_owners)?;
                if owners.is_empty() {
                    return Err(WatchError::Config("TRACKED_OWNERS vide en mode program".into()));
                }
                Ok(EntityFilter::OwnerWhitelist(owners))
            }
            WatchMode::Wallet => {
                let label = self.watched_account.is_none().then(|| "receiver".to_string());
                Ok(EntityFilter::Static(HashMap::from([(self.watched_account()?, label)])))
            }
        }
    }

    pub fn subscriptions(&self) -> WatchResult<Vec<SubscriptionSpec>> {
        let filter = match self.watch_mode {
            WatchMode::Program => FeedFilter::token_accounts_of_mint(&self.token_mint()?),
            WatchMode::Wallet => FeedFilter::Account(self.watched_account()?),
        };
        Ok(vec![SubscriptionSpec {
            filter,
            commitment: self.feed_commitment()?,
        }])
    }
}

fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        rpc_url.to_string()
    }
}

fn parse_commitment(name: &str, value: &str) -> WatchResult<CommitmentConfig> {
    CommitmentConfig::from_str(value.trim())
        .map_err(|e| WatchError::Config(format!("{} invalide '{}' : {}", name, value, e)))
}

fn parse_pubkey(name: &str, value: &str) -> WatchResult<Pubkey> {
    Pubkey::from_str(value.trim()).map_err(|e| WatchError::Config(format!("{} invalide : {}", name, e)))
}
