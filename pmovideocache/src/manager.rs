//! Façade du cache vidéo
//!
//! Le [`CacheManager`] est construit une fois par le contexte applicatif et
//! passé explicitement à ceux qui en ont besoin. Il fait le lien entre les
//! identifiants logiques du catalogue (`asset` + `variante`) et les clés du
//! store, détient la table des handles et notifie les abonnés de chaque
//! entrée ou sortie d'un asset du cache.
//!
//! Aucune erreur du store ne remonte d'ici : elles sont journalisées et
//! traitées comme une absence.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::download::Fetcher;
use crate::error::{CacheError, Result};
use crate::events::{Listeners, StoreEvent, SubscriptionId};
use crate::handle::{HandleTable, MediaHandle};
use crate::keys::{cache_key, split_cache_key, KEY_SEPARATOR};
use crate::preloader::{
    sniff_content_type, AssetMetadata, LoadingProgress, PreloadResult, Preloader,
    PreloaderSettings, CONTENT_TYPE_KEY,
};
use crate::resolver::{SourceKind, VideoSource};
use crate::store::{CacheStore, StoreSettings, StoreStats};

/// Variante de qualité d'un asset du catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub quality: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
}

/// Asset logique du catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogAsset {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub variants: Vec<CatalogVariant>,
}

impl CatalogAsset {
    pub fn variant(&self, quality: &str) -> Option<&CatalogVariant> {
        self.variants.iter().find(|v| v.quality == quality)
    }

    pub fn source(&self, variant: &CatalogVariant) -> VideoSource {
        VideoSource::new(
            cache_key(&self.id, &variant.quality),
            variant.url.clone(),
            variant.kind,
            variant.quality.clone(),
        )
    }

    pub fn metadata(&self, variant: &CatalogVariant) -> AssetMetadata {
        AssetMetadata {
            quality: variant.quality.clone(),
            label: self.label.clone(),
            duration_secs: self.duration_secs,
            content_type: None,
        }
    }
}

/// Liste des assets connus, fournie par la configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub assets: Vec<CatalogAsset>,
}

impl Catalog {
    pub fn new(assets: Vec<CatalogAsset>) -> Self {
        Self { assets }
    }

    pub fn asset(&self, logical_id: &str) -> Option<&CatalogAsset> {
        self.assets.iter().find(|a| a.id == logical_id)
    }

    /// Source et métadonnées de `(logical_id, variant)`
    pub fn lookup(&self, logical_id: &str, variant: &str) -> Option<(VideoSource, AssetMetadata)> {
        let asset = self.asset(logical_id)?;
        let variant = asset.variant(variant)?;
        Some((asset.source(variant), asset.metadata(variant)))
    }

    /// Toutes les sources, dans l'ordre du catalogue
    pub fn sources(&self) -> Vec<VideoSource> {
        self.assets
            .iter()
            .flat_map(|a| a.variants.iter().map(move |v| a.source(v)))
            .collect()
    }

    /// Métadonnées indexées par clé de cache
    pub fn metadata_map(&self) -> HashMap<String, AssetMetadata> {
        self.assets
            .iter()
            .flat_map(|a| {
                a.variants
                    .iter()
                    .map(move |v| (cache_key(&a.id, &v.quality), a.metadata(v)))
            })
            .collect()
    }

    /// Vérifie que chaque couple `(asset, variante)` donne une clé distincte
    ///
    /// Identifiants et variantes non vides, variantes sans `:` et sans
    /// doublon pour un même asset.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for asset in &self.assets {
            if asset.id.is_empty() {
                return Err(CacheError::InvalidConfig(
                    "catalog asset with an empty id".to_string(),
                ));
            }
            for variant in &asset.variants {
                if variant.quality.is_empty() || variant.quality.contains(KEY_SEPARATOR) {
                    return Err(CacheError::InvalidConfig(format!(
                        "invalid variant '{}' for asset '{}': must be non-empty and must not contain '{}'",
                        variant.quality, asset.id, KEY_SEPARATOR
                    )));
                }
                let key = cache_key(&asset.id, &variant.quality);
                if !seen.insert(key.clone()) {
                    return Err(CacheError::InvalidConfig(format!(
                        "duplicate catalog entry '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Notification d'entrée ou de sortie du cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Cached {
        key: String,
        logical_id: String,
        variant: String,
    },
    Evicted {
        key: String,
        logical_id: String,
        variant: String,
    },
}

impl CacheChange {
    fn cached(key: &str) -> Self {
        let (logical_id, variant) = split_cache_key(key).unwrap_or((key, ""));
        Self::Cached {
            key: key.to_string(),
            logical_id: logical_id.to_string(),
            variant: variant.to_string(),
        }
    }

    fn evicted(key: &str) -> Self {
        let (logical_id, variant) = split_cache_key(key).unwrap_or((key, ""));
        Self::Evicted {
            key: key.to_string(),
            logical_id: logical_id.to_string(),
            variant: variant.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            CacheChange::Cached { key, .. } | CacheChange::Evicted { key, .. } => key,
        }
    }
}

/// Statistiques agrégées
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// `None` si le store est indisponible
    pub store: Option<StoreStats>,
    pub handle_count: usize,
}

/// Point de coordination du cache vidéo
pub struct CacheManager {
    store: Arc<CacheStore>,
    handles: Arc<HandleTable>,
    preloader: Preloader,
    catalog: Catalog,
    ready: OnceCell<bool>,
    listeners: Listeners<CacheChange>,
    store_events: Mutex<broadcast::Receiver<StoreEvent>>,
}

impl CacheManager {
    /// Construit le manager autour d'un préchargeur existant
    ///
    /// Le store et la table des handles sont ceux du préchargeur.
    pub fn new(preloader: Preloader, catalog: Catalog) -> Self {
        let store = preloader.store().clone();
        let handles = preloader.handles().clone();
        let store_events = Mutex::new(store.subscribe());

        Self {
            store,
            handles,
            preloader,
            catalog,
            ready: OnceCell::new(),
            listeners: Listeners::new(),
            store_events,
        }
    }

    /// Construit store, table des handles et préchargeur à partir des paramètres
    pub fn from_settings(
        store_settings: StoreSettings,
        preloader_settings: PreloaderSettings,
        fetcher: Arc<dyn Fetcher>,
        catalog: Catalog,
    ) -> Result<Self> {
        catalog.validate()?;
        let store = Arc::new(CacheStore::new(store_settings)?);
        let handles = Arc::new(HandleTable::new());
        let preloader = Preloader::new(store, fetcher, handles, preloader_settings);
        Ok(Self::new(preloader, catalog))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn preloader(&self) -> &Preloader {
        &self.preloader
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// `true` si l'initialisation a réussi
    pub fn is_ready(&self) -> bool {
        self.ready.get().copied().unwrap_or(false)
    }

    /// Initialise le store, une seule fois
    ///
    /// En cas de succès, émet un handle pour chaque asset du catalogue déjà
    /// en cache. Les appels suivants retournent le même résultat sans rien
    /// refaire.
    ///
    /// # Returns
    ///
    /// `false` si le cache est indisponible ; l'application continue sans
    pub async fn initialize(&self) -> bool {
        *self
            .ready
            .get_or_init(|| async {
                match self.store.initialize().await {
                    Ok(()) => {
                        let minted = self.scan_store().await;
                        self.drain_store_events(false);
                        tracing::info!(
                            handles = minted.len(),
                            catalog_assets = self.catalog.len(),
                            "Video cache manager ready"
                        );
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Video cache unavailable, continuing without cache");
                        false
                    }
                }
            })
            .await
    }

    /// Relit le store et émet un handle pour chaque entrée valide du catalogue
    async fn scan_store(&self) -> Vec<String> {
        let entries = match self.store.list().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot scan video cache");
                return Vec::new();
            }
        };

        let mut minted = Vec::new();
        for summary in entries {
            let Some((source, _)) = split_cache_key(&summary.asset_id)
                .and_then(|(id, variant)| self.catalog.lookup(id, variant))
            else {
                tracing::debug!(asset_id = %summary.asset_id, "Cached entry not in catalog, skipped");
                continue;
            };

            match self.store.get(&source.id, &source.original_url).await {
                Ok(Some(entry)) => {
                    let content_type = entry
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get(CONTENT_TYPE_KEY))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            sniff_content_type(&entry.payload, &source.original_url).to_string()
                        });
                    self.handles.mint(&source.id, entry.payload, &content_type);
                    minted.push(source.id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(asset_id = %source.id, error = %e, "Cannot load cached entry");
                }
            }
        }
        minted
    }

    /// Handle déjà émis pour `(logical_id, variant)`, s'il existe
    pub fn get_handle(&self, logical_id: &str, variant: &str) -> Option<MediaHandle> {
        self.handles.get(&cache_key(logical_id, variant))
    }

    /// Précharge un seul asset à la demande
    ///
    /// # Returns
    ///
    /// Le handle émis, ou `None` si l'asset est inconnu ou n'a pas pu être obtenu
    pub async fn preload(&self, logical_id: &str, variant: &str) -> Option<MediaHandle> {
        let Some((source, metadata)) = self.catalog.lookup(logical_id, variant) else {
            tracing::warn!(logical_id, variant, "Asset not in catalog");
            return None;
        };

        if let Some(handle) = self.handles.get(&source.id) {
            return Some(handle);
        }

        let cancel = self.preloader.child_token();
        let result = self
            .preloader
            .preload(&source, Some(&metadata), &|_| {}, &cancel)
            .await;

        if result.persisted {
            self.listeners.notify(&CacheChange::cached(&source.id));
        } else if let Some(failure) = &result.error {
            tracing::warn!(
                key = %source.id,
                stage = %failure.stage,
                error = %failure.message,
                "On-demand preload failed"
            );
        }
        self.drain_store_events(true);

        result.handle
    }

    /// Précharge tout le catalogue, élément par élément
    ///
    /// # Arguments
    ///
    /// * `on_progress` - Progression de chaque asset
    /// * `cancel` - Interrompt le lot (les entrées déjà écrites restent)
    pub async fn preload_all(
        &self,
        on_progress: &(dyn Fn(&LoadingProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> HashMap<String, PreloadResult> {
        let sources = self.catalog.sources();
        let metadata = self.catalog.metadata_map();

        let results = self
            .preloader
            .preload_many(&sources, &metadata, on_progress, cancel)
            .await;

        for source in &sources {
            if results.get(&source.id).is_some_and(|r| r.persisted) {
                self.listeners.notify(&CacheChange::cached(&source.id));
            }
        }
        self.drain_store_events(true);

        results
    }

    /// Retire toutes les variantes d'un asset du store et de la table des handles
    ///
    /// # Returns
    ///
    /// Le nombre de variantes effectivement retirées
    pub async fn evict(&self, logical_id: &str) -> usize {
        let belongs = |key: &str| split_cache_key(key).is_some_and(|(id, _)| id == logical_id);

        let mut keys: BTreeSet<String> = self
            .catalog
            .asset(logical_id)
            .map(|a| {
                a.variants
                    .iter()
                    .map(|v| cache_key(logical_id, &v.quality))
                    .collect()
            })
            .unwrap_or_default();
        keys.extend(self.handles.keys().into_iter().filter(|k| belongs(k)));
        if let Ok(entries) = self.store.list().await {
            keys.extend(
                entries
                    .into_iter()
                    .map(|e| e.asset_id)
                    .filter(|k| belongs(k)),
            );
        }

        let mut removed = 0;
        for key in &keys {
            let from_store = match self.store.remove(key).await {
                Ok(existed) => existed,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Store removal skipped");
                    false
                }
            };
            let from_handles = self.handles.release(key);

            if from_store || from_handles {
                removed += 1;
                self.listeners.notify(&CacheChange::evicted(key));
            }
        }

        tracing::info!(logical_id, removed, "Evicted asset");
        removed
    }

    /// Libère tous les handles puis relit le store
    ///
    /// # Returns
    ///
    /// Le nombre de handles émis à nouveau
    pub async fn refresh(&self) -> usize {
        let before: BTreeSet<String> = self.handles.keys().into_iter().collect();
        let released = self.handles.release_all();

        let after: BTreeSet<String> = if self.is_ready() {
            self.scan_store().await.into_iter().collect()
        } else {
            BTreeSet::new()
        };

        for key in before.difference(&after) {
            self.listeners.notify(&CacheChange::evicted(key));
        }
        for key in after.difference(&before) {
            self.listeners.notify(&CacheChange::cached(key));
        }
        self.drain_store_events(false);

        tracing::info!(released, reminted = after.len(), "Video cache refreshed");
        after.len()
    }

    /// Vide le store et libère tous les handles
    ///
    /// # Returns
    ///
    /// Le nombre d'assets sortis du cache
    pub async fn clear(&self) -> usize {
        let mut keys: BTreeSet<String> = self.handles.keys().into_iter().collect();
        if let Ok(entries) = self.store.list().await {
            keys.extend(entries.into_iter().map(|e| e.asset_id));
        }

        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Video cache store could not be cleared");
        }
        self.handles.release_all();
        self.drain_store_events(false);

        for key in &keys {
            self.listeners.notify(&CacheChange::evicted(key));
        }
        keys.len()
    }

    /// Libère un handle précis ; l'entrée persistante est conservée
    pub fn release(&self, handle: &MediaHandle) -> bool {
        self.handles.release_handle(handle)
    }

    /// Enregistre un callback appelé à chaque entrée ou sortie du cache
    pub fn subscribe(
        &self,
        callback: impl Fn(&CacheChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Statistiques du store et nombre de handles en mémoire
    pub async fn stats(&self) -> ManagerStats {
        let store = match self.store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "Store stats unavailable");
                None
            }
        };
        ManagerStats {
            store,
            handle_count: self.handles.len(),
        }
    }

    /// Arrêt : annule les préchargements et libère toute la table des handles
    pub fn shutdown(&self) -> usize {
        self.preloader.cancel_all();
        let released = self.handles.release_all();
        tracing::info!(released, "Video cache manager shut down");
        released
    }

    /// Relaie les évictions LRU du store vers les abonnés
    fn drain_store_events(&self, notify: bool) {
        let mut evicted = Vec::new();
        {
            let mut rx = self.store_events.lock().unwrap();
            loop {
                match rx.try_recv() {
                    Ok(StoreEvent::Evicted { asset_id, .. }) => evicted.push(asset_id),
                    Ok(_) => {}
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed store events");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }

        if notify {
            for key in evicted {
                self.listeners.notify(&CacheChange::evicted(&key));
            }
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("store", &self.store.settings())
            .field("catalog_assets", &self.catalog.len())
            .field("handles", &self.handles.len())
            .field("listeners", &self.listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_YAML: &str = r#"
- id: intro
  label: Intro
  duration_secs: 42.5
  variants:
    - { quality: hd, url: "https://cdn.example.com/intro-hd.mp4" }
    - { quality: sd, url: "https://drive.google.com/file/d/abc/view", kind: indirect-share }
- id: outro
  variants: []
"#;

    #[test]
    fn test_catalog_from_yaml() {
        let catalog: Catalog = serde_yaml::from_str(CATALOG_YAML).unwrap();
        assert_eq!(catalog.len(), 2);

        let (source, metadata) = catalog.lookup("intro", "sd").unwrap();
        assert_eq!(source.id, "intro:sd");
        assert_eq!(source.kind, SourceKind::IndirectShare);
        assert_eq!(metadata.label.as_deref(), Some("Intro"));
        assert_eq!(metadata.duration_secs, Some(42.5));

        assert!(catalog.lookup("intro", "4k").is_none());
        assert_eq!(
            catalog
                .sources()
                .iter()
                .map(|s| s.id.as_str())
                .collect::<Vec<_>>(),
            vec!["intro:hd", "intro:sd"]
        );
        assert_eq!(catalog.metadata_map().len(), 2);
    }

    #[test]
    fn test_catalog_rejects_ambiguous_keys() {
        let variant = |quality: &str| CatalogVariant {
            quality: quality.to_string(),
            url: "https://cdn.example.com/a.mp4".to_string(),
            kind: SourceKind::Direct,
        };
        let asset = |id: &str, variants| CatalogAsset {
            id: id.to_string(),
            label: None,
            duration_secs: None,
            variants,
        };

        // "a" + "b:c" et "a:b" + "c" donneraient tous deux "a:b:c"
        let ambiguous = Catalog::new(vec![
            asset("a", vec![variant("b:c")]),
            asset("a:b", vec![variant("c")]),
        ]);
        assert!(matches!(
            ambiguous.validate(),
            Err(CacheError::InvalidConfig(_))
        ));

        let duplicated = Catalog::new(vec![asset("a", vec![variant("hd"), variant("hd")])]);
        assert!(duplicated.validate().is_err());
        assert!(Catalog::new(vec![asset("", vec![])]).validate().is_err());

        let fine = Catalog::new(vec![
            asset("tour:lisbon", vec![variant("hd"), variant("sd")]),
            asset("tour", vec![variant("hd")]),
        ]);
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_change_splits_key() {
        let change = CacheChange::cached("tour:lisbon:hd");
        assert_eq!(
            change,
            CacheChange::Cached {
                key: "tour:lisbon:hd".into(),
                logical_id: "tour:lisbon".into(),
                variant: "hd".into(),
            }
        );
        assert_eq!(change.key(), "tour:lisbon:hd");
    }
}
