// DANS : src/bin/account_watcher.rs

use account_watcher::{
    config::{Config, WatchMode},
    feed::PubsubChangeFeed,
    history::HistoryFetcher,
    lifecycle::ListenerLifecycle,
    monitoring::{logging::setup_logging, metrics::start_metrics_server},
    reconciler::{LoggingSink, Reconciler},
    rpc::RpcHistorySource,
    state::{InMemoryWatermarkStore, JsonFileWatermarkStore, WatermarkBackend},
    watcher::Watcher,
};
use anyhow::{Context, Result};
use solana_sdk::signer::Signer;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Délai maximum accordé à chaque désabonnement pendant l'arrêt.
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// SIGINT (Ctrl+C) ou SIGTERM, le premier des deux.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[Main] Impossible d'écouter Ctrl+C : {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("[Main] Impossible d'écouter SIGTERM : {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[Main] Signal d'interruption reçu."),
        _ = terminate => info!("[Main] SIGTERM reçu."),
    }
}

async fn run_watcher() -> Result<()> {
    let config = Config::load()?;
    info!(mode = ?config.watch_mode, rpc = %config.solana_rpc_url, "[Main] Démarrage de l'account watcher.");

    if config.watch_mode == WatchMode::Wallet && config.watched_account.is_none() {
        let signers = config.signers()?;
        if let Some(sender) = signers.get(1) {
            info!("[Main] sender: {}", sender.pubkey());
        }
        info!("[Main] receiver: {}", config.receiver()?.pubkey());
    }

    if let Some(port) = config.metrics_port {
        tokio::spawn(start_metrics_server(port));
    }

    let store = match &config.watermark_file {
        Some(path) => WatermarkBackend::File(
            JsonFileWatermarkStore::open(path)
                .with_context(|| format!("Ouverture du fichier de watermarks {:?}", path))?,
        ),
        None => {
            warn!("[Main] WATERMARK_FILE absent : les watermarks ne survivront pas au redémarrage.");
            WatermarkBackend::Memory(InMemoryWatermarkStore::new())
        }
    };

    let history = RpcHistorySource::new(config.solana_rpc_url.clone(), config.history_commitment()?);
    let fetcher = HistoryFetcher::new(
        history,
        config.retry_policy(),
        config.history_page_limit,
        config.max_backfill_events,
    );
    let reconciler = Arc::new(Reconciler::new(store, fetcher, LoggingSink, config.backfill_policy));

    if let Some(signature) = config.initial_watermark()? {
        if config.watch_mode == WatchMode::Wallet {
            let account = config.watched_account()?;
            if reconciler.seed_watermark(&account, signature).await? {
                info!(account = %account, "[Main] Watermark initial appliqué.");
            }
        } else {
            warn!("[Main] INITIAL_WATERMARK n'est utilisé qu'en mode wallet, ignoré.");
        }
    }

    let ws_url = config.ws_url();
    info!("[WebSocket] Connexion à: {}", ws_url);
    let feed = Arc::new(PubsubChangeFeed::connect(&ws_url).await?);
    let lifecycle = Arc::new(ListenerLifecycle::new(feed, UNSUBSCRIBE_TIMEOUT));

    let watcher = Watcher::new(
        lifecycle,
        reconciler,
        config.entity_filter()?,
        config.subscriptions()?,
        config.watcher_settings(),
    );
    let summary = watcher.run(shutdown_signal()).await?;
    info!(
        notifications = summary.notifications,
        cycles = summary.cycles_ok,
        events = summary.events_applied,
        "[Main] Terminé."
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    if let Err(e) = run_watcher().await {
        error!("[Main] L'account watcher s'est arrêté sur erreur : {:?}.", e);
        return Err(e);
    }
    Ok(())
}
