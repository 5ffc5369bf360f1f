//! Store persistant du cache vidéo
//!
//! [`CacheStore`] encapsule la base SQLite : initialisation unique, budgets
//! (octets et nombre d'entrées) appliqués avant l'admission d'une entrée,
//! invalidation par empreinte d'URL et publication d'événements.
//!
//! Toutes les erreurs sont typées ; c'est à l'appelant de les traiter comme
//! un miss (voir [`CacheError::is_store_failure`]).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};

use crate::db::{micros_to_datetime, CacheEntry, EntrySummary, Lookup, NewEntry, DB};
use crate::error::{CacheError, Result};
use crate::events::{EventBus, MissReason, StoreEvent, DEFAULT_EVENT_CAPACITY};
use crate::keys::fingerprint_url;

pub const DEFAULT_NAMESPACE: &str = "pmovideo";
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MAX_ENTRY_COUNT: u64 = 50;
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Paramètres du store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Répertoire du backend persistant ; `None` = aucun backend disponible
    pub directory: Option<PathBuf>,
    /// Nom logique du store (nom du fichier SQLite)
    pub namespace: String,
    pub max_cache_bytes: u64,
    pub max_entry_count: u64,
    /// Version du format des entrées ; l'incrémenter invalide tout le contenu
    pub schema_version: u32,
}

impl StoreSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::without_backend()
        }
    }

    /// Paramètres d'un environnement sans stockage persistant
    pub fn without_backend() -> Self {
        Self {
            directory: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_entry_count: DEFAULT_MAX_ENTRY_COUNT,
            schema_version: DEFAULT_SCHEMA_VERSION,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    pub fn with_max_entry_count(mut self, count: u64) -> Self {
        self.max_entry_count = count;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Vérifie la cohérence des paramètres
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CacheError::InvalidConfig(format!(
                "store namespace '{}' must match [A-Za-z0-9_-]+",
                self.namespace
            )));
        }
        if self.max_cache_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_cache_bytes must be greater than zero".into(),
            ));
        }
        if self.max_entry_count == 0 {
            return Err(CacheError::InvalidConfig(
                "max_entry_count must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Chemin du fichier SQLite : `{directory}/{namespace}.sqlite`
    pub fn database_path(&self) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.sqlite", self.namespace)))
    }
}

/// Statistiques du store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_bytes: u64,
    pub entry_count: u64,
    pub oldest_cached_at: Option<DateTime<Utc>>,
    pub newest_cached_at: Option<DateTime<Utc>>,
    pub max_cache_bytes: u64,
    pub max_entry_count: u64,
}

#[derive(Debug)]
enum Readiness {
    Ready(Arc<DB>),
    Unavailable(String),
}

/// Store persistant, borné en taille, des payloads vidéo
#[derive(Debug)]
pub struct CacheStore {
    settings: StoreSettings,
    ready: OnceCell<Readiness>,
    opens: AtomicUsize,
    clock: AtomicI64,
    events: EventBus<StoreEvent>,
}

impl CacheStore {
    /// Crée un store non initialisé
    ///
    /// Aucun accès disque n'est fait ici ; voir [`CacheStore::initialize`].
    pub fn new(settings: StoreSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            ready: OnceCell::new(),
            opens: AtomicUsize::new(0),
            clock: AtomicI64::new(0),
            events: EventBus::new(DEFAULT_EVENT_CAPACITY),
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Abonnement aux événements du store
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Nombre d'ouvertures effectives du backend (au plus une par instance)
    pub fn backend_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.ready.get(), Some(Readiness::Ready(_)))
    }

    /// Ouvre le backend persistant, une seule fois
    ///
    /// Les appels concurrents attendent la même initialisation et observent le
    /// même résultat, y compris en cas d'échec : un store indisponible le reste
    /// pour toute la vie de l'instance.
    ///
    /// À la première ouverture :
    /// 1. purge des entrées d'une autre version de schéma
    /// 2. éviction LRU au-delà des budgets (nombre puis octets)
    pub async fn initialize(&self) -> Result<()> {
        let readiness = self
            .ready
            .get_or_init(|| async { self.open_backend() })
            .await;

        match readiness {
            Readiness::Ready(_) => Ok(()),
            Readiness::Unavailable(reason) => Err(CacheError::StoreUnavailable(reason.clone())),
        }
    }

    fn open_backend(&self) -> Readiness {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (Some(dir), Some(path)) = (&self.settings.directory, self.settings.database_path())
        else {
            tracing::warn!("No persistent backend configured, video cache disabled");
            return Readiness::Unavailable("no persistent backend configured".to_string());
        };

        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(directory = %dir.display(), error = %e, "Cannot create cache directory");
            return Readiness::Unavailable(format!("{}: {}", dir.display(), e));
        }

        let db = match DB::open(&path) {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open cache database");
                return Readiness::Unavailable(format!("{}: {}", path.display(), e));
            }
        };

        match db.purge_schema_mismatch(self.settings.schema_version) {
            Ok(stale) => {
                for (asset_id, found) in &stale {
                    let mismatch = CacheError::SchemaVersionMismatch {
                        found: *found,
                        expected: self.settings.schema_version,
                    };
                    tracing::debug!(asset_id = %asset_id, "Purged entry: {}", mismatch);
                }
                if !stale.is_empty() {
                    tracing::info!(
                        purged = stale.len(),
                        schema_version = self.settings.schema_version,
                        "Purged entries written by another store version"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Schema cleanup failed");
                return Readiness::Unavailable(format!("schema cleanup failed: {e}"));
            }
        }

        match db.trim_to(self.settings.max_cache_bytes, self.settings.max_entry_count) {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    tracing::info!(
                        removed = evicted.len(),
                        "LRU eviction at startup to honour cache budgets"
                    );
                }
                for victim in evicted {
                    self.events.emit(StoreEvent::Evicted {
                        asset_id: victim.asset_id,
                        size_bytes: victim.size_bytes,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Startup trim failed");
                return Readiness::Unavailable(format!("startup trim failed: {e}"));
            }
        }

        // Réamorce l'horloge pour que l'ordre LRU survive aux redémarrages
        if let Ok(Some(max)) = db.max_timestamp() {
            self.clock.fetch_max(max, Ordering::SeqCst);
        }

        tracing::info!(
            path = %path.display(),
            max_cache_bytes = self.settings.max_cache_bytes,
            max_entry_count = self.settings.max_entry_count,
            "Video cache store ready"
        );
        Readiness::Ready(Arc::new(db))
    }

    fn db(&self) -> Result<&Arc<DB>> {
        match self.ready.get() {
            Some(Readiness::Ready(db)) => Ok(db),
            Some(Readiness::Unavailable(reason)) => {
                Err(CacheError::StoreUnavailable(reason.clone()))
            }
            None => Err(CacheError::StoreUnavailable(
                "store not initialized".to_string(),
            )),
        }
    }

    /// Horloge strictement croissante, en microsecondes
    fn tick(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn fail(&self, asset_id: &str, error: CacheError) -> CacheError {
        tracing::warn!(asset_id = %asset_id, error = %error, "Video cache store operation failed");
        self.events.emit(StoreEvent::Error {
            asset_id: asset_id.to_string(),
            cause: error.to_string(),
        });
        error
    }

    /// Ajoute ou remplace une entrée
    ///
    /// Si l'admission de `payload` dépasse un budget, les entrées les moins
    /// récemment consultées sont évincées d'abord, puis l'entrée est écrite.
    ///
    /// # Arguments
    ///
    /// * `asset_id` - Clé de l'entrée
    /// * `source_url` - URL configurée de l'asset (sert d'empreinte)
    /// * `payload` - Octets de la vidéo
    /// * `metadata` - Métadonnées applicatives, opaques pour le store
    pub async fn store(
        &self,
        asset_id: &str,
        source_url: &str,
        payload: &[u8],
        metadata: Option<&Value>,
    ) -> Result<()> {
        let db = self.db()?;

        let size = payload.len() as u64;
        if size > self.settings.max_cache_bytes {
            return Err(self.fail(
                asset_id,
                CacheError::EntryTooLarge {
                    asset_id: asset_id.to_string(),
                    size,
                    budget: self.settings.max_cache_bytes,
                },
            ));
        }

        let metadata_json = match metadata.map(serde_json::to_string).transpose() {
            Ok(json) => json,
            Err(e) => return Err(self.fail(asset_id, e.into())),
        };
        let fingerprint = fingerprint_url(source_url);

        let entry = NewEntry {
            asset_id,
            source_url,
            source_fingerprint: &fingerprint,
            payload,
            metadata_json: metadata_json.as_deref(),
            timestamp: self.tick(),
            schema_version: self.settings.schema_version,
        };

        let evicted = db
            .insert_with_eviction(
                &entry,
                self.settings.max_cache_bytes,
                self.settings.max_entry_count,
            )
            .map_err(|e| self.fail(asset_id, CacheError::store_failed(asset_id, e)))?;

        if !evicted.is_empty() {
            let freed: u64 = evicted.iter().map(|v| v.size_bytes).sum();
            tracing::info!(
                asset_id = %asset_id,
                removed = evicted.len(),
                freed_bytes = freed,
                "LRU eviction before admitting entry"
            );
        }
        for victim in evicted {
            self.events.emit(StoreEvent::Evicted {
                asset_id: victim.asset_id,
                size_bytes: victim.size_bytes,
            });
        }

        tracing::debug!(asset_id = %asset_id, size_bytes = size, "Stored entry");
        self.events.emit(StoreEvent::Stored {
            asset_id: asset_id.to_string(),
            size_bytes: size,
        });
        Ok(())
    }

    /// Récupère une entrée valide pour `source_url`
    ///
    /// Une entrée dont l'empreinte ne correspond plus à `source_url` est
    /// supprimée et traitée comme absente. Un hit met à jour la date d'accès.
    pub async fn get(&self, asset_id: &str, source_url: &str) -> Result<Option<CacheEntry>> {
        let db = self.db()?;
        let fingerprint = fingerprint_url(source_url);

        let lookup = match db.fetch_and_touch(asset_id, &fingerprint, self.tick()) {
            Ok(lookup) => lookup,
            Err(e) => {
                let error = self.fail(asset_id, CacheError::store_failed(asset_id, e));
                self.emit_miss(asset_id, MissReason::StoreFailure);
                return Err(error);
            }
        };

        match lookup {
            Lookup::Found(entry) => {
                tracing::debug!(asset_id = %asset_id, "Cache hit");
                self.events.emit(StoreEvent::Hit {
                    asset_id: asset_id.to_string(),
                });
                Ok(Some(entry))
            }
            Lookup::Absent => {
                tracing::debug!(asset_id = %asset_id, "Cache miss");
                self.emit_miss(asset_id, MissReason::NotFound);
                Ok(None)
            }
            Lookup::Stale => {
                tracing::debug!(asset_id = %asset_id, "Source changed, stale entry removed");
                self.emit_miss(asset_id, MissReason::SourceChanged);
                Ok(None)
            }
        }
    }

    /// Variante de [`CacheStore::get`] ne retournant que les octets
    pub async fn get_payload(&self, asset_id: &str, source_url: &str) -> Result<Option<Bytes>> {
        Ok(self
            .get(asset_id, source_url)
            .await?
            .map(|entry| entry.payload))
    }

    fn emit_miss(&self, asset_id: &str, reason: MissReason) {
        self.events.emit(StoreEvent::Miss {
            asset_id: asset_id.to_string(),
            reason,
        });
    }

    /// Vérifie la présence d'une entrée valide, sans mettre à jour la date d'accès
    pub async fn has(&self, asset_id: &str, source_url: &str) -> Result<bool> {
        let db = self.db()?;
        let fingerprint = fingerprint_url(source_url);

        match db
            .probe(asset_id, &fingerprint, None)
            .map_err(|e| self.fail(asset_id, CacheError::store_failed(asset_id, e)))?
        {
            Lookup::Found(()) => Ok(true),
            Lookup::Absent => Ok(false),
            Lookup::Stale => {
                tracing::debug!(asset_id = %asset_id, "Source changed, stale entry removed");
                Ok(false)
            }
        }
    }

    /// Comme [`CacheStore::get`], sans relire le payload
    ///
    /// Pour un appelant qui détient déjà les octets : la validité de l'entrée
    /// est vérifiée, sa date d'accès mise à jour et `hit` ou `miss` émis.
    pub async fn touch(&self, asset_id: &str, source_url: &str) -> Result<bool> {
        let db = self.db()?;
        let fingerprint = fingerprint_url(source_url);

        let lookup = match db.probe(asset_id, &fingerprint, Some(self.tick())) {
            Ok(lookup) => lookup,
            Err(e) => {
                let error = self.fail(asset_id, CacheError::store_failed(asset_id, e));
                self.emit_miss(asset_id, MissReason::StoreFailure);
                return Err(error);
            }
        };

        match lookup {
            Lookup::Found(()) => {
                self.events.emit(StoreEvent::Hit {
                    asset_id: asset_id.to_string(),
                });
                Ok(true)
            }
            Lookup::Absent => {
                self.emit_miss(asset_id, MissReason::NotFound);
                Ok(false)
            }
            Lookup::Stale => {
                tracing::debug!(asset_id = %asset_id, "Source changed, stale entry removed");
                self.emit_miss(asset_id, MissReason::SourceChanged);
                Ok(false)
            }
        }
    }

    /// Supprime une entrée
    ///
    /// # Returns
    ///
    /// `true` si l'entrée existait
    pub async fn remove(&self, asset_id: &str) -> Result<bool> {
        let db = self.db()?;
        db.delete(asset_id)
            .map_err(|e| self.fail(asset_id, CacheError::store_failed(asset_id, e)))
    }

    /// Supprime toutes les entrées (un seul événement `Cleared`)
    ///
    /// # Returns
    ///
    /// Le nombre d'entrées supprimées
    pub async fn clear(&self) -> Result<usize> {
        let db = self.db()?;
        let removed = db
            .purge()
            .map_err(|e| self.fail("*", CacheError::store_failed("*", e)))?;

        tracing::info!(removed, "Video cache cleared");
        self.events.emit(StoreEvent::Cleared);
        Ok(removed)
    }

    /// Octets totaux, nombre d'entrées et bornes de `cached_at`
    pub async fn stats(&self) -> Result<StoreStats> {
        let db = self.db()?;
        let raw = db
            .stats()
            .map_err(|e| self.fail("*", CacheError::store_failed("*", e)))?;

        Ok(StoreStats {
            total_bytes: raw.total_bytes,
            entry_count: raw.entry_count,
            oldest_cached_at: raw.oldest_cached_at.map(micros_to_datetime),
            newest_cached_at: raw.newest_cached_at.map(micros_to_datetime),
            max_cache_bytes: self.settings.max_cache_bytes,
            max_entry_count: self.settings.max_entry_count,
        })
    }

    /// Liste les entrées sans leur payload, de la moins à la plus récemment utilisée
    pub async fn list(&self) -> Result<Vec<EntrySummary>> {
        let db = self.db()?;
        db.list()
            .map_err(|e| self.fail("*", CacheError::store_failed("*", e)))
    }

    /// Métadonnées applicatives d'une entrée
    pub async fn metadata(&self, asset_id: &str) -> Result<Option<Value>> {
        let db = self.db()?;
        db.get_metadata(asset_id)
            .map_err(|e| self.fail(asset_id, CacheError::store_failed(asset_id, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;

    #[tokio::test]
    async fn test_concurrent_initialize_opens_backend_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(StoreSettings::new(temp_dir.path())).unwrap();

        let results = join_all((0..8).map(|_| store.initialize())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(store.backend_opens(), 1);
        assert!(store.is_ready());

        store.initialize().await.unwrap();
        assert_eq!(store.backend_opens(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_sticky() {
        let store = CacheStore::new(StoreSettings::without_backend()).unwrap();

        let results = join_all((0..3).map(|_| store.initialize())).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(CacheError::StoreUnavailable(_)))));
        assert_eq!(store.backend_opens(), 1);

        assert!(matches!(
            store.get("a", "u").await,
            Err(CacheError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(StoreSettings::new(temp_dir.path())).unwrap();

        let err = store.store("a", "u", b"x", None).await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_settings_validation() {
        assert!(StoreSettings::new("/tmp")
            .with_namespace("bad name")
            .validate()
            .is_err());
        assert!(StoreSettings::new("/tmp")
            .with_max_entry_count(0)
            .validate()
            .is_err());
        assert!(StoreSettings::new("/tmp")
            .with_namespace("video_cache-2")
            .validate()
            .is_ok());
        assert_eq!(
            StoreSettings::new("/tmp").database_path(),
            Some(PathBuf::from("/tmp/pmovideo.sqlite"))
        );
    }

    #[test]
    fn test_tick_is_strictly_increasing() {
        let store = CacheStore::new(StoreSettings::without_backend()).unwrap();
        let mut last = store.tick();
        for _ in 0..1000 {
            let next = store.tick();
            assert!(next > last);
            last = next;
        }
    }
}
