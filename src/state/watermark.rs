// DANS : src/state/watermark.rs

use crate::error::{WatchError, WatchResult};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    future::Future,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    str::FromStr,
    sync::RwLock,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Dernière signature traitée, par compte suivi.
///
/// L'appelant ne doit jamais supposer que la mémoire du processus est le seul
/// support possible : le `Reconciler` ne passe que par ce trait.
pub trait WatermarkStore: Send + Sync + 'static {
    fn get(&self, entity: &Pubkey)
    -> impl Future<Output = WatchResult<Option<Signature>>> + Send;

    /// Écrase la valeur précédente.
    fn set(&self, entity: &Pubkey, signature: Signature)
    -> impl Future<Output = WatchResult<()>> + Send;
}

/// Stockage en mémoire, pour la durée de vie du processus.
#[derive(Default)]
pub struct InMemoryWatermarkStore {
    marks: RwLock<HashMap<Pubkey, Signature>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (Pubkey, Signature)>) -> Self {
        Self {
            marks: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn snapshot(&self) -> HashMap<Pubkey, Signature> {
        self.marks.read().map(|m| m.clone()).unwrap_or_default()
    }

    fn read(&self, entity: &Pubkey) -> WatchResult<Option<Signature>> {
        let reader = self
            .marks
            .read()
            .map_err(|_| WatchError::Store("verrou des watermarks empoisonné".into()))?;
        Ok(reader.get(entity).copied())
    }

    fn write(&self, entity: &Pubkey, signature: Signature) -> WatchResult<()> {
        let mut writer = self
            .marks
            .write()
            .map_err(|_| WatchError::Store("verrou des watermarks empoisonné".into()))?;
        writer.insert(*entity, signature);
        Ok(())
    }
}

impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, entity: &Pubkey) -> WatchResult<Option<Signature>> {
        self.read(entity)
    }

    async fn set(&self, entity: &Pubkey, signature: Signature) -> WatchResult<()> {
        self.write(entity, signature)
    }
}

/// Stockage persistant : la table complète est réécrite en JSON après chaque `set`.
///
/// Format : `{ "<pubkey>": "<signature>" }`, trié par clé.
pub struct JsonFileWatermarkStore {
    path: PathBuf,
    memory: InMemoryWatermarkStore,
    file_lock: Mutex<()>,
}

impl JsonFileWatermarkStore {
    /// Charge le fichier s'il existe, sinon démarre avec une table vide.
    pub fn open(path: impl AsRef<Path>) -> WatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let memory = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| WatchError::Store(format!("ouverture de {:?} : {}", path, e)))?;
            let raw: BTreeMap<String, String> = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| WatchError::Store(format!("désérialisation de {:?} : {}", path, e)))?;
            let mut entries = Vec::with_capacity(raw.len());
            for (key, sig) in raw {
                let entity = Pubkey::from_str(&key)
                    .map_err(|e| WatchError::Store(format!("clé invalide '{}' : {}", key, e)))?;
                let signature = Signature::from_str(&sig)
                    .map_err(|e| WatchError::Store(format!("signature invalide '{}' : {}", sig, e)))?;
                entries.push((entity, signature));
            }
            info!(path = ?path, count = entries.len(), "[Watermarks] Watermarks rechargés depuis le disque.");
            InMemoryWatermarkStore::with_entries(entries)
        } else {
            info!(path = ?path, "[Watermarks] Aucun fichier existant, démarrage à vide.");
            InMemoryWatermarkStore::new()
        };

        Ok(Self {
            path,
            memory,
            file_lock: Mutex::new(()),
        })
    }

    fn persist(&self) -> WatchResult<()> {
        let snapshot: BTreeMap<String, String> = self
            .memory
            .snapshot()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        // Écriture dans un fichier temporaire puis renommage : un crash ne laisse
        // jamais un fichier à moitié écrit.
        let tmp = self.path.with_extension("json.tmp");
        let file = File::create(&tmp)
            .map_err(|e| WatchError::Store(format!("création de {:?} : {}", tmp, e)))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &snapshot)
            .map_err(|e| WatchError::Store(format!("sérialisation vers {:?} : {}", tmp, e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| WatchError::Store(format!("renommage vers {:?} : {}", self.path, e)))?;
        debug!(path = ?self.path, count = snapshot.len(), "[Watermarks] Sauvegardé.");
        Ok(())
    }
}

impl WatermarkStore for JsonFileWatermarkStore {
    async fn get(&self, entity: &Pubkey) -> WatchResult<Option<Signature>> {
        self.memory.read(entity)
    }

    async fn set(&self, entity: &Pubkey, signature: Signature) -> WatchResult<()> {
        let _lock = self.file_lock.lock().await;
        self.memory.write(entity, signature)?;
        self.persist()
    }
}

/// Choix du stockage à l'exécution (configuration `WATERMARK_FILE`).
pub enum WatermarkBackend {
    Memory(InMemoryWatermarkStore),
    File(JsonFileWatermarkStore),
}

impl WatermarkStore for WatermarkBackend {
    async fn get(&self, entity: &Pubkey) -> WatchResult<Option<Signature>> {
        match self {
            WatermarkBackend::Memory(store) => store.get(entity).await,
            WatermarkBackend::File(store) => store.get(entity).await,
        }
    }

    async fn set(&self, entity: &Pubkey, signature: Signature) -> WatchResult<()> {
        match self {
            WatermarkBackend::Memory(store) => store.set(entity, signature).await,
            WatermarkBackend::File(store) => store.set(entity, signature).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_entry_means_no_history_yet() {
        let store = InMemoryWatermarkStore::new();
        assert_eq!(store.get(&Pubkey::new_unique()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_overwrites_and_entities_are_independent() {
        let store = InMemoryWatermarkStore::new();
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (s1, s2) = (Signature::new_unique(), Signature::new_unique());

        store.set(&a, s1).await.unwrap();
        store.set(&a, s2).await.unwrap();
        store.set(&b, s1).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), Some(s2));
        assert_eq!(store.get(&b).await.unwrap(), Some(s1));
    }

    #[tokio::test]
    async fn json_file_store_survives_reload() {
        let dir = std::env::temp_dir().join(format!("watermarks-{}", Pubkey::new_unique()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("watermarks.json");
        let entity = Pubkey::new_unique();
        let signature = Signature::new_unique();

        {
            let store = JsonFileWatermarkStore::open(&path).unwrap();
            assert_eq!(store.get(&entity).await.unwrap(), None);
            store.set(&entity, signature).await.unwrap();
        }

        let reloaded = JsonFileWatermarkStore::open(&path).unwrap();
        assert_eq!(reloaded.get(&entity).await.unwrap(), Some(signature));
        assert!(!path.with_extension("json.tmp").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn corrupted_file_is_a_store_error() {
        let dir = std::env::temp_dir().join(format!("watermarks-{}", Pubkey::new_unique()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("watermarks.json");
        fs::write(&path, "{ \"pas-une-cle\": \"pas-une-signature\" }").unwrap();

        assert!(matches!(
            JsonFileWatermarkStore::open(&path),
            Err(WatchError::Store(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
