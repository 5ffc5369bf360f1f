//! Orchestration du préchargement
//!
//! Pour chaque asset : consultation du store, puis en cas de miss résolution
//! de la source, téléchargement, étiquetage du type de contenu et écriture
//! dans le store. Le résultat expose un [`MediaHandle`] émis dans la
//! [`HandleTable`] partagée avec le [`CacheManager`](crate::CacheManager).
//!
//! ```text
//! pending ──hit──────────────────────────────────▶ complete
//!    │                                               ▲
//!    └─▶ fetching ─▶ processing ─▶ caching ─────────┘
//!           │            │           │
//!           └────────────┴───────────┴──▶ error
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::download::Fetcher;
use crate::error::CacheError;
use crate::events::{EventBus, DEFAULT_EVENT_CAPACITY};
use crate::db::CacheEntry;
use crate::handle::{HandleTable, MediaHandle};
use crate::resolver::{SourceResolver, VideoSource};
use crate::store::CacheStore;

/// Pause par défaut entre deux éléments d'un lot
pub const DEFAULT_ITEM_PAUSE: Duration = Duration::from_millis(150);

/// Type MIME à défaut de mieux
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Clé des métadonnées stockées portant le type MIME
pub const CONTENT_TYPE_KEY: &str = "content_type";

/// États d'une tentative de préchargement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadState {
    Pending,
    Fetching,
    Processing,
    Caching,
    Complete,
    Error,
}

impl PreloadState {
    /// Transitions autorisées ; aucun état n'est quitté après `complete` ou `error`
    pub fn can_advance_to(self, next: PreloadState) -> bool {
        use PreloadState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Complete)
                | (Fetching, Processing)
                | (Fetching, Error)
                | (Processing, Caching)
                | (Processing, Error)
                | (Caching, Complete)
                | (Caching, Error)
        )
    }
}

impl fmt::Display for PreloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreloadState::Pending => "pending",
            PreloadState::Fetching => "fetching",
            PreloadState::Processing => "processing",
            PreloadState::Caching => "caching",
            PreloadState::Complete => "complete",
            PreloadState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Étape rapportée dans un [`LoadingProgress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStage {
    Fetching,
    Processing,
    Caching,
    Complete,
    Error,
}

/// Progression d'un téléchargement en cours (jamais persistée)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadingProgress {
    pub asset_id: String,
    pub loaded: u64,
    /// 0 si la taille est inconnue
    pub total: u64,
    pub percentage: f64,
    pub stage: LoadingStage,
    pub error: Option<String>,
}

impl LoadingProgress {
    pub fn new(asset_id: &str, loaded: u64, total: u64, stage: LoadingStage) -> Self {
        let percentage = match stage {
            LoadingStage::Complete => 100.0,
            _ if total > 0 => (loaded as f64 * 100.0 / total as f64).min(100.0),
            _ => 0.0,
        };
        Self {
            asset_id: asset_id.to_string(),
            loaded,
            total,
            percentage,
            stage,
            error: None,
        }
    }

    fn failed(asset_id: &str, loaded: u64, message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new(asset_id, loaded, 0, LoadingStage::Error)
        }
    }
}

/// Métadonnées applicatives enregistrées avec l'entrée
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub quality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl AssetMetadata {
    pub fn new(quality: impl Into<String>) -> Self {
        Self {
            quality: quality.into(),
            ..Default::default()
        }
    }
}

/// Échec d'une tentative : étape fautive et message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadFailure {
    pub stage: PreloadState,
    pub message: String,
    pub cancelled: bool,
}

/// Résultat d'une tentative de préchargement
#[derive(Debug, Clone)]
pub struct PreloadResult {
    pub asset_id: String,
    pub success: bool,
    pub from_cache: bool,
    /// `true` si l'asset a été écrit dans le store pendant cette tentative
    pub persisted: bool,
    pub handle: Option<MediaHandle>,
    pub size_bytes: u64,
    pub elapsed: Duration,
    pub error: Option<PreloadFailure>,
}

impl PreloadResult {
    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.cancelled)
    }
}

/// Événements du préchargeur
#[derive(Debug, Clone)]
pub enum PreloadEvent {
    Start { asset_id: String },
    Progress(LoadingProgress),
    Complete { asset_id: String, result: PreloadResult },
    Error { asset_id: String, cause: String },
    Cancelled { asset_id: String },
}

/// Paramètres du préchargeur
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloaderSettings {
    /// Pause entre deux éléments de `preload_many`
    pub item_pause: Duration,
}

impl Default for PreloaderSettings {
    fn default() -> Self {
        Self {
            item_pause: DEFAULT_ITEM_PAUSE,
        }
    }
}

/// Détermine le type MIME d'un payload vidéo
///
/// Signature binaire d'abord (`ftyp`, EBML, `OggS`, synchro MPEG-TS),
/// extension de l'URL ensuite, `application/octet-stream` sinon.
pub fn sniff_content_type(payload: &[u8], url: &str) -> &'static str {
    if payload.len() >= 12 && &payload[4..8] == b"ftyp" {
        return if &payload[8..12] == b"qt  " {
            "video/quicktime"
        } else {
            "video/mp4"
        };
    }
    if payload.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return "video/webm";
    }
    if payload.starts_with(b"OggS") {
        return "video/ogg";
    }
    if payload.len() > 188 && payload[0] == 0x47 && payload[188] == 0x47 {
        return "video/mp2t";
    }

    let extension = Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
        });

    match extension.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("ogv" | "ogg") => "video/ogg",
        Some("ts") => "video/mp2t",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

/// Ce que le cache peut fournir avant tout téléchargement
enum CacheLookup {
    /// Handle déjà émis, entrée toujours valide dans le store
    Issued(MediaHandle),
    /// Entrée lue depuis le store
    Stored(CacheEntry),
    Miss,
}

/// Une instance de la machine à états
struct Attempt<'a> {
    asset_id: &'a str,
    state: PreloadState,
    started: Instant,
}

impl<'a> Attempt<'a> {
    fn new(asset_id: &'a str) -> Self {
        Self {
            asset_id,
            state: PreloadState::Pending,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: PreloadState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(asset_id = %self.asset_id, from = %self.state, to = %next, "Preload transition");
        self.state = next;
    }
}

/// Orchestrateur du préchargement
pub struct Preloader {
    store: Arc<CacheStore>,
    resolver: SourceResolver,
    fetcher: Arc<dyn Fetcher>,
    handles: Arc<HandleTable>,
    settings: PreloaderSettings,
    events: EventBus<PreloadEvent>,
    root: Mutex<CancellationToken>,
}

impl Preloader {
    pub fn new(
        store: Arc<CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        handles: Arc<HandleTable>,
        settings: PreloaderSettings,
    ) -> Self {
        Self {
            store,
            resolver: SourceResolver::default(),
            fetcher,
            handles,
            settings,
            events: EventBus::new(DEFAULT_EVENT_CAPACITY),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    /// Remplace le résolveur de sources par défaut
    pub fn with_resolver(mut self, resolver: SourceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadEvent> {
        self.events.subscribe()
    }

    /// Jeton enfant du jeton racine, annulé par [`Preloader::cancel_all`]
    pub fn child_token(&self) -> CancellationToken {
        self.root.lock().unwrap().child_token()
    }

    /// Annule tous les préchargements en cours
    ///
    /// Les lots démarrés ensuite ne sont pas affectés.
    pub fn cancel_all(&self) {
        let previous = std::mem::take(&mut *self.root.lock().unwrap());
        previous.cancel();
        tracing::info!("Cancelled all in-flight preloads");
    }

    /// Précharge un asset
    ///
    /// Un hit du store court-circuite directement vers `complete` ; si un
    /// handle a déjà été émis pour cet asset, il est retourné tel quel. Un échec
    /// du store pendant `caching` n'empêche pas le succès : les octets restent
    /// utilisables, `from_cache` vaut alors `false`.
    ///
    /// # Arguments
    ///
    /// * `source` - Descripteur de la source (son `id` est la clé de cache)
    /// * `metadata` - Métadonnées à enregistrer avec l'entrée
    /// * `on_progress` - Reçoit chaque [`LoadingProgress`]
    /// * `cancel` - Jeton d'annulation de cette tentative
    pub async fn preload(
        &self,
        source: &VideoSource,
        metadata: Option<&AssetMetadata>,
        on_progress: &(dyn Fn(&LoadingProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> PreloadResult {
        let mut attempt = Attempt::new(&source.id);
        self.events.emit(PreloadEvent::Start {
            asset_id: source.id.clone(),
        });

        let report = |progress: LoadingProgress| {
            on_progress(&progress);
            self.events.emit(PreloadEvent::Progress(progress));
        };

        match self.lookup_cache(source).await {
            CacheLookup::Issued(handle) => {
                let size = handle.size();
                attempt.advance(PreloadState::Complete);
                report(LoadingProgress::new(&source.id, size, size, LoadingStage::Complete));
                tracing::debug!(asset_id = %source.id, handle = %handle.id(), "Preload served by issued handle");

                return self.succeed(&attempt, handle, size, true, false);
            }
            CacheLookup::Stored(entry) => {
                let content_type = entry
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(CONTENT_TYPE_KEY))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        sniff_content_type(&entry.payload, &source.original_url).to_string()
                    });
                let size = entry.size_bytes;
                let handle = self.handles.mint(&source.id, entry.payload, &content_type);

                attempt.advance(PreloadState::Complete);
                report(LoadingProgress::new(&source.id, size, size, LoadingStage::Complete));
                tracing::debug!(asset_id = %source.id, size, "Preload served from cache");

                return self.succeed(&attempt, handle, size, true, false);
            }
            CacheLookup::Miss => {}
        }

        // fetching
        attempt.advance(PreloadState::Fetching);
        report(LoadingProgress::new(&source.id, 0, 0, LoadingStage::Fetching));

        let url = match self.resolver.resolve(source) {
            Ok(url) => url,
            Err(e) => return self.fail(&mut attempt, e, 0, &report),
        };

        let received = AtomicU64::new(0);
        let forward = |loaded: u64, total: u64| {
            received.store(loaded, Ordering::Relaxed);
            report(LoadingProgress::new(&source.id, loaded, total, LoadingStage::Fetching));
        };
        let payload = match self.fetcher.download(&url, cancel, &forward).await {
            Ok(payload) => payload,
            Err(e) => {
                let loaded = received.load(Ordering::Relaxed);
                return self.fail(&mut attempt, e, loaded, &report);
            }
        };
        let size = payload.len() as u64;

        // processing
        attempt.advance(PreloadState::Processing);
        report(LoadingProgress::new(&source.id, size, size, LoadingStage::Processing));

        let content_type = sniff_content_type(&payload, &url);
        let mut stored_metadata = metadata
            .cloned()
            .unwrap_or_else(|| AssetMetadata::new(&source.quality));
        stored_metadata.content_type = Some(content_type.to_string());
        let metadata_json = match serde_json::to_value(&stored_metadata) {
            Ok(json) => json,
            Err(e) => return self.fail(&mut attempt, e.into(), size, &report),
        };

        // caching
        attempt.advance(PreloadState::Caching);
        report(LoadingProgress::new(&source.id, size, size, LoadingStage::Caching));

        let persisted = match self
            .store
            .store(&source.id, &source.original_url, &payload, Some(&metadata_json))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    asset_id = %source.id,
                    error = %e,
                    "Could not persist preloaded asset, bytes kept in memory only"
                );
                false
            }
        };

        let handle = self.handles.mint(&source.id, payload, content_type);
        attempt.advance(PreloadState::Complete);
        report(LoadingProgress::new(&source.id, size, size, LoadingStage::Complete));
        tracing::info!(
            asset_id = %source.id,
            size,
            content_type,
            elapsed_ms = attempt.started.elapsed().as_millis() as u64,
            "Preload complete"
        );

        self.succeed(&attempt, handle, size, false, persisted)
    }

    /// Consulte la table des handles puis le store
    ///
    /// Un handle déjà émis est conservé tant que l'entrée reste valide : le
    /// remplacer révoquerait les références déjà distribuées.
    async fn lookup_cache(&self, source: &VideoSource) -> CacheLookup {
        if let Some(handle) = self.handles.get(&source.id) {
            return match self.store.touch(&source.id, &source.original_url).await {
                Ok(true) => CacheLookup::Issued(handle),
                Ok(false) => CacheLookup::Miss,
                Err(e) => {
                    tracing::debug!(asset_id = %source.id, error = %e, "Cache lookup failed, keeping issued handle");
                    CacheLookup::Issued(handle)
                }
            };
        }

        match self.store.get(&source.id, &source.original_url).await {
            Ok(Some(entry)) => CacheLookup::Stored(entry),
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                tracing::debug!(asset_id = %source.id, error = %e, "Cache lookup failed, downloading");
                CacheLookup::Miss
            }
        }
    }

    fn succeed(
        &self,
        attempt: &Attempt<'_>,
        handle: MediaHandle,
        size: u64,
        from_cache: bool,
        persisted: bool,
    ) -> PreloadResult {
        let result = PreloadResult {
            asset_id: attempt.asset_id.to_string(),
            success: true,
            from_cache,
            persisted,
            handle: Some(handle),
            size_bytes: size,
            elapsed: attempt.started.elapsed(),
            error: None,
        };
        self.events.emit(PreloadEvent::Complete {
            asset_id: attempt.asset_id.to_string(),
            result: result.clone(),
        });
        result
    }

    fn fail(
        &self,
        attempt: &mut Attempt<'_>,
        error: CacheError,
        loaded: u64,
        report: &dyn Fn(LoadingProgress),
    ) -> PreloadResult {
        let stage = attempt.state;
        let message = error.to_string();
        let cancelled = error.is_cancelled();

        attempt.advance(PreloadState::Error);
        report(LoadingProgress::failed(attempt.asset_id, loaded, &message));

        if cancelled {
            tracing::debug!(asset_id = %attempt.asset_id, %stage, "Preload cancelled");
            self.events.emit(PreloadEvent::Cancelled {
                asset_id: attempt.asset_id.to_string(),
            });
        } else {
            tracing::warn!(asset_id = %attempt.asset_id, %stage, error = %message, "Preload failed");
            self.events.emit(PreloadEvent::Error {
                asset_id: attempt.asset_id.to_string(),
                cause: message.clone(),
            });
        }

        PreloadResult {
            asset_id: attempt.asset_id.to_string(),
            success: false,
            from_cache: false,
            persisted: false,
            handle: None,
            size_bytes: 0,
            elapsed: attempt.started.elapsed(),
            error: Some(PreloadFailure {
                stage,
                message,
                cancelled,
            }),
        }
    }

    /// Précharge une liste de sources, une à la fois
    ///
    /// Une courte pause sépare deux éléments. Annuler `cancel` (ou appeler
    /// [`Preloader::cancel_all`]) interrompt le téléchargement en cours et
    /// empêche les suivants de démarrer : ils sont absents du résultat. Les
    /// entrées déjà écrites dans le store sont conservées.
    ///
    /// # Returns
    ///
    /// Les résultats indexés par `id` de source
    pub async fn preload_many(
        &self,
        sources: &[VideoSource],
        metadata: &HashMap<String, AssetMetadata>,
        on_progress: &(dyn Fn(&LoadingProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> HashMap<String, PreloadResult> {
        let batch = self.child_token();
        let _batch_guard = batch.clone().drop_guard();

        // Relaie l'annulation de l'appelant vers le lot
        let caller = cancel.clone();
        let linked = batch.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });

        let mut results = HashMap::with_capacity(sources.len());
        tracing::info!(count = sources.len(), "Starting preload batch");

        for (index, source) in sources.iter().enumerate() {
            if index > 0 && !self.settings.item_pause.is_zero() {
                tokio::select! {
                    _ = batch.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.item_pause) => {}
                }
            }
            if batch.is_cancelled() {
                tracing::info!(
                    skipped = sources.len() - index,
                    "Preload batch cancelled, remaining items not started"
                );
                break;
            }

            let result = self
                .preload(source, metadata.get(&source.id), on_progress, &batch)
                .await;
            results.insert(source.id.clone(), result);
        }

        let succeeded = results.values().filter(|r| r.success).count();
        let from_cache = results.values().filter(|r| r.from_cache).count();
        tracing::info!(
            succeeded,
            from_cache,
            failed = results.len() - succeeded,
            "Preload batch finished"
        );

        results
    }
}

impl fmt::Debug for Preloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preloader")
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .finish()
    }
}
