// DANS : src/monitoring/metrics.rs

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};
use tracing::{error, info};
use warp::Filter;

lazy_static! {
    // --- Flux de notifications ---
    pub static ref NOTIFICATIONS_RECEIVED: IntCounter = register_int_counter!(
        "watcher_notifications_received_total", "Nombre total de notifications reçues du WebSocket"
    ).unwrap();
    pub static ref NOTIFICATIONS_FILTERED: IntCounter = register_int_counter!(
        "watcher_notifications_filtered_total", "Notifications rejetées par la liste blanche"
    ).unwrap();
    pub static ref DECODE_FAILURES: IntCounter = register_int_counter!(
        "watcher_decode_failures_total", "Notifications ignorées car les données du compte sont illisibles"
    ).unwrap();
    pub static ref SUBSCRIPTION_DROPS: IntCounter = register_int_counter!(
        "watcher_subscription_drops_total", "Abonnements dont le transport est mort"
    ).unwrap();
    pub static ref WS_RECONNECTIONS: IntCounter = register_int_counter!(
        "watcher_ws_reconnections_total", "Reconnexions du client PubSub après un abonnement refusé"
    ).unwrap();
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        "watcher_active_subscriptions", "Abonnements actuellement enregistrés"
    ).unwrap();

    // --- Rattrapage d'historique ---
    pub static ref CYCLES: IntCounterVec = register_int_counter_vec!(
        "watcher_cycles_total",
        "Cycles de rattrapage, par résultat",
        &["outcome"] // "applied", "noop", "seeded", "error"
    ).unwrap();
    pub static ref PHASE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "watcher_cycle_phase_transitions_total",
        "Transitions de phase des cycles de rattrapage",
        &["phase"]
    ).unwrap();
    pub static ref EVENTS_APPLIED: IntCounter = register_int_counter!(
        "watcher_events_applied_total", "Événements d'historique appliqués"
    ).unwrap();
    pub static ref HISTORY_FETCH_RETRIES: IntCounter = register_int_counter!(
        "watcher_history_fetch_retries_total", "Ré-essais de getSignaturesForAddress après une erreur transitoire"
    ).unwrap();
    pub static ref HISTORY_ORDER_ANOMALIES: IntCounter = register_int_counter!(
        "watcher_history_order_anomalies_total", "Événements reçus hors de l'ordre chronologique inverse"
    ).unwrap();
    pub static ref HISTORY_FETCH_LATENCY: Histogram = register_histogram!(
        "watcher_history_fetch_latency_seconds", "Durée d'un fetch_since complet (toutes pages)"
    ).unwrap();
}

/// Expose `/metrics` sur le port donné. Ne rend jamais la main.
pub async fn start_metrics_server(port: u16) {
    let metrics_route = warp::path!("metrics").map(|| {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            error!(error = %e, "[Monitoring] Échec de l'encodage des métriques.");
        }
        warp::reply::with_header(buffer, "content-type", "text/plain; version=0.0.4")
    });
    info!(port, "[Monitoring] Serveur de métriques exposé sur /metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}
