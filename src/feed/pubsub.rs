// DANS : src/feed/pubsub.rs

use super::{ChangeFeed, FeedFilter, FeedMessage, FeedSink, RawNotification, SubscriptionId};
use crate::error::{WatchError, WatchResult};
use crate::monitoring::metrics;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::{StreamExt, future::BoxFuture, stream::BoxStream};
use solana_account_decoder::{UiAccount, UiAccountData, UiAccountEncoding};
use solana_client::{
    nonblocking::pubsub_client::PubsubClient,
    rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig},
    rpc_filter::{Memcmp, RpcFilterType},
};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::{
    collections::HashMap,
    future::Future,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{RwLock, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

type UnsubscribeFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct ActiveSubscription {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Le client partagé par tous les abonnements, remplacé quand sa connexion meurt.
///
/// Quand le WebSocket tombe, toutes les tâches du client s'arrêtent et chaque
/// nouvel abonnement sur ce client échoue : il faut en ouvrir un autre.
struct ClientSlot<C> {
    current: RwLock<Arc<C>>,
}

impl<C> ClientSlot<C> {
    fn new(client: C) -> Self {
        Self {
            current: RwLock::new(Arc::new(client)),
        }
    }

    async fn get(&self) -> Arc<C> {
        self.current.read().await.clone()
    }

    /// Remplace `failed` par un client neuf, sauf si une autre tâche l'a déjà fait.
    async fn replace<F, Fut>(&self, failed: &Arc<C>, connect: F) -> WatchResult<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WatchResult<C>>,
    {
        let mut current = self.current.write().await;
        if !Arc::ptr_eq(&current, failed) {
            return Ok(current.clone());
        }
        let fresh = Arc::new(connect().await?);
        *current = fresh.clone();
        Ok(fresh)
    }
}

/// `ChangeFeed` branché sur le WebSocket PubSub d'un nœud Solana.
///
/// Chaque abonnement vit dans sa propre tâche Tokio qui possède le flux ;
/// `unsubscribe` lui demande de s'arrêter et attend qu'elle ait appelé
/// l'`unsubscribe` du nœud. Un abonnement qui échoue provoque une reconnexion
/// puis une seconde tentative sur le nouveau client.
pub struct PubsubChangeFeed {
    ws_url: String,
    client: ClientSlot<PubsubClient>,
    next_id: AtomicU64,
    active: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
}

impl PubsubChangeFeed {
    pub async fn connect(ws_url: &str) -> WatchResult<Self> {
        info!(ws_url, "[Feed] Connexion au WebSocket PubSub.");
        let client = Self::open_client(ws_url).await?;
        Ok(Self {
            ws_url: ws_url.to_string(),
            client: ClientSlot::new(client),
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        })
    }

    async fn open_client(ws_url: &str) -> WatchResult<PubsubClient> {
        PubsubClient::new(ws_url)
            .await
            .map_err(|e| WatchError::Transient(format!("connexion PubSub impossible : {}", e)))
    }

    /// Démarre la tâche d'un abonnement et attend qu'elle soit prête.
    async fn start(
        &self,
        client: Arc<PubsubClient>,
        filter: FeedFilter,
        commitment: CommitmentConfig,
        sink: FeedSink,
    ) -> WatchResult<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        info!(subscription = %id, filter = ?filter, "[Feed] Ouverture d'un abonnement.");
        let task = tokio::spawn(Self::run_subscription(
            client, id, filter, commitment, sink, ready_tx, stop_rx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.active
                    .lock()
                    .map_err(|_| WatchError::Store("registre des abonnements empoisonné".into()))?
                    .insert(id, ActiveSubscription { stop: stop_tx, task });
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WatchError::Transient(
                "la tâche d'abonnement s'est arrêtée avant d'être prête".to_string(),
            )),
        }
    }

    fn account_config(commitment: CommitmentConfig) -> RpcAccountInfoConfig {
        RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(commitment),
            ..Default::default()
        }
    }

    fn program_config(
        memcmp: &[(usize, Vec<u8>)],
        data_size: Option<u64>,
        commitment: CommitmentConfig,
    ) -> RpcProgramAccountsConfig {
        let mut filters: Vec<RpcFilterType> = memcmp
            .iter()
            .map(|(offset, bytes)| RpcFilterType::Memcmp(Memcmp::new_base58_encoded(*offset, bytes)))
            .collect();
        if let Some(size) = data_size {
            filters.push(RpcFilterType::DataSize(size));
        }
        RpcProgramAccountsConfig {
            filters: Some(filters),
            account_config: Self::account_config(commitment),
            ..Default::default()
        }
    }

    /// Corps de la tâche d'un abonnement.
    async fn run_subscription(
        client: Arc<PubsubClient>,
        id: SubscriptionId,
        filter: FeedFilter,
        commitment: CommitmentConfig,
        sink: FeedSink,
        ready: oneshot::Sender<WatchResult<()>>,
        stop: oneshot::Receiver<()>,
    ) {
        match filter {
            FeedFilter::Account(pubkey) => {
                let subscribed = client
                    .account_subscribe(&pubkey, Some(Self::account_config(commitment)))
                    .await;
                match subscribed {
                    Ok((stream, unsubscribe)) => {
                        let _ = ready.send(Ok(()));
                        forward(id, stream, unsubscribe, stop, sink, move |response| {
                            let data = decode_ui_data(&response.value)?;
                            Some((pubkey, data, response.context.slot))
                        })
                        .await;
                    }
                    Err(e) => {
                        let _ = ready.send(Err(WatchError::Transient(format!(
                            "accountSubscribe({}) a échoué : {}",
                            pubkey, e
                        ))));
                    }
                }
            }
            FeedFilter::Program {
                program_id,
                memcmp,
                data_size,
            } => {
                let config = Self::program_config(&memcmp, data_size, commitment);
                match client.program_subscribe(&program_id, Some(config)).await {
                    Ok((stream, unsubscribe)) => {
                        let _ = ready.send(Ok(()));
                        forward(id, stream, unsubscribe, stop, sink, |response| {
                            let entity = Pubkey::from_str(&response.value.pubkey).ok()?;
                            let data = decode_ui_data(&response.value.account)?;
                            Some((entity, data, response.context.slot))
                        })
                        .await;
                    }
                    Err(e) => {
                        let _ = ready.send(Err(WatchError::Transient(format!(
                            "programSubscribe({}) a échoué : {}",
                            program_id, e
                        ))));
                    }
                }
            }
        }
    }
}

/// Les comptes sont demandés en base64 ; tout autre format est ignoré.
fn decode_ui_data(account: &UiAccount) -> Option<Vec<u8>> {
    match &account.data {
        UiAccountData::Binary(encoded, _) => STANDARD.decode(encoded).ok(),
        _ => None,
    }
}

/// Pousse chaque élément du flux dans le `sink` jusqu'à l'arrêt demandé ou la fin du flux.
async fn forward<T>(
    id: SubscriptionId,
    mut stream: BoxStream<'_, T>,
    unsubscribe: UnsubscribeFn,
    mut stop: oneshot::Receiver<()>,
    sink: FeedSink,
    to_notification: impl Fn(T) -> Option<(Pubkey, Vec<u8>, u64)>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!(subscription = %id, "[Feed] Arrêt demandé, désabonnement auprès du nœud.");
                unsubscribe().await;
                return;
            }
            item = stream.next() => match item {
                Some(item) => {
                    metrics::NOTIFICATIONS_RECEIVED.inc();
                    let Some((entity, data, slot)) = to_notification(item) else {
                        metrics::DECODE_FAILURES.inc();
                        warn!(subscription = %id, "[Feed] Notification illisible ignorée.");
                        continue;
                    };
                    let notification = RawNotification { subscription: id, entity, data, slot };
                    if sink.send(FeedMessage::Notification(notification)).is_err() {
                        // Plus personne n'écoute : on libère proprement le nœud.
                        unsubscribe().await;
                        return;
                    }
                }
                None => break,
            }
        }
    }

    metrics::SUBSCRIPTION_DROPS.inc();
    warn!(subscription = %id, "[Feed] Le flux WebSocket s'est terminé de manière inattendue.");
    let _ = sink.send(FeedMessage::Closed {
        subscription: id,
        reason: "le flux WebSocket s'est terminé".to_string(),
    });
}

impl ChangeFeed for PubsubChangeFeed {
    async fn subscribe(
        &self,
        filter: FeedFilter,
        commitment: CommitmentConfig,
        sink: FeedSink,
    ) -> WatchResult<SubscriptionId> {
        let client = self.client.get().await;
        let error = match self.start(client.clone(), filter.clone(), commitment, sink.clone()).await {
            Ok(id) => return Ok(id),
            Err(e) => e,
        };

        warn!(error = %error, "[Feed] Abonnement refusé, reconnexion du WebSocket.");
        let fresh = self
            .client
            .replace(&client, || async {
                metrics::WS_RECONNECTIONS.inc();
                Self::open_client(&self.ws_url).await
            })
            .await?;
        self.start(fresh, filter, commitment, sink).await
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> WatchResult<()> {
        let entry = self
            .active
            .lock()
            .map_err(|_| WatchError::Store("registre des abonnements empoisonné".into()))?
            .remove(&subscription);
        let Some(ActiveSubscription { stop, task }) = entry else {
            return Err(WatchError::UnknownSubscription(subscription));
        };

        // Si la tâche est déjà terminée (flux mort), l'envoi échoue : rien à faire de plus.
        let _ = stop.send(());
        task.await
            .map_err(|e| WatchError::Source(format!("tâche d'abonnement {} : {}", subscription, e)))?;
        info!(subscription = %subscription, "[Feed] Désabonné.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn replace_swaps_the_failed_client() {
        let slot = ClientSlot::new(1u32);
        let failed = slot.get().await;

        let fresh = slot.replace(&failed, || async { Ok(2u32) }).await.unwrap();
        assert_eq!(*fresh, 2);
        assert_eq!(*slot.get().await, 2);
    }

    #[tokio::test]
    async fn concurrent_failures_reconnect_once() {
        let slot = ClientSlot::new(1u32);
        let failed = slot.get().await;
        let connects = AtomicUsize::new(0);
        let counter = &connects;
        let connect = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(10 + n)
        };

        let (a, b) = tokio::join!(slot.replace(&failed, connect), slot.replace(&failed, connect));

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(*a.unwrap(), 10);
        assert_eq!(*b.unwrap(), 10);
    }

    #[tokio::test]
    async fn failed_reconnection_keeps_the_old_client() {
        let slot = ClientSlot::new(1u32);
        let failed = slot.get().await;

        let result = slot
            .replace(&failed, || async { Err::<u32, _>(WatchError::Transient("nœud injoignable".into())) })
            .await;
        assert!(matches!(result, Err(WatchError::Transient(_))));
        assert!(Arc::ptr_eq(&slot.get().await, &failed));

        // La tentative suivante peut encore remplacer ce client.
        assert_eq!(*slot.replace(&failed, || async { Ok(3u32) }).await.unwrap(), 3);
    }
}
