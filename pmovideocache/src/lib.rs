//! # pmovideocache - Cache local des vidéos pour PMOVideo
//!
//! Cette crate fournit un cache persistant, borné en taille, pour des assets
//! vidéo téléchargés, et l'orchestration du préchargement de ces assets.
//!
//! ## Vue d'ensemble
//!
//! - Stockage SQLite des payloads et de leurs métadonnées (un enregistrement par asset)
//! - Budgets en octets et en nombre d'entrées, appliqués par éviction LRU avant écriture
//! - Invalidation automatique quand l'URL source d'un asset change (empreinte)
//! - Purge des entrées d'une ancienne version de schéma au démarrage
//! - Téléchargement HTTP en streaming, annulable, avec progression
//! - Résolution des liens de partage (Google Drive, Dropbox) en URLs directes
//! - Handles locaux révocables vers les octets en mémoire
//!
//! ## Architecture
//!
//! ```text
//! CacheManager (façade, catalogue, handles, notifications)
//!     └── Preloader (machine à états par asset)
//!             ├── CacheStore     - store.rs + db.rs
//!             ├── SourceResolver - resolver.rs
//!             └── Fetcher        - download.rs (HttpDownloader)
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use pmovideocache::{
//!     CacheManager, Catalog, HttpDownloader, PreloaderSettings, StoreSettings,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pmovideocache::Result<()> {
//!     let fetcher = Arc::new(HttpDownloader::new(Duration::from_secs(300))?);
//!     let manager = CacheManager::from_settings(
//!         StoreSettings::new("./cache_video"),
//!         PreloaderSettings::default(),
//!         fetcher,
//!         Catalog::default(),
//!     )?;
//!
//!     if !manager.initialize().await {
//!         println!("Cache indisponible, lecture directe depuis le réseau");
//!     }
//!
//!     let results = manager
//!         .preload_all(&|p| println!("{} {:.0}%", p.asset_id, p.percentage), &CancellationToken::new())
//!         .await;
//!     println!("{} assets préchargés", results.len());
//!
//!     if let Some(handle) = manager.get_handle("intro", "hd") {
//!         println!("Lecture de {}", handle.uri());
//!     }
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Schéma de base de données
//!
//! ```sql
//! CREATE TABLE entries (
//!     asset_id TEXT PRIMARY KEY,        -- Clé "{id}:{variante}"
//!     source_url TEXT NOT NULL,         -- URL configurée de l'asset
//!     source_fingerprint TEXT NOT NULL, -- SHA256 tronqué de source_url
//!     payload BLOB NOT NULL,            -- Octets de la vidéo
//!     metadata_json TEXT,               -- Qualité, libellé, durée, type MIME
//!     cached_at INTEGER NOT NULL,       -- µs, immuable
//!     last_accessed_at INTEGER NOT NULL,-- µs, mis à jour à chaque lecture
//!     size_bytes INTEGER NOT NULL,
//!     schema_version INTEGER NOT NULL
//! );
//! ```

pub mod db;
pub mod download;
pub mod error;
pub mod events;
pub mod handle;
pub mod keys;
pub mod manager;
pub mod preloader;
pub mod resolver;
pub mod store;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use db::{CacheEntry, EntrySummary};
pub use download::{Fetcher, HttpDownloader};
pub use error::{CacheError, Result};
pub use events::{MissReason, StoreEvent, SubscriptionId};
pub use handle::{HandleId, HandleTable, MediaHandle};
pub use keys::{cache_key, fingerprint_url, split_cache_key};
pub use manager::{CacheChange, CacheManager, Catalog, CatalogAsset, CatalogVariant, ManagerStats};
pub use preloader::{
    AssetMetadata, LoadingProgress, LoadingStage, PreloadEvent, PreloadFailure, PreloadResult,
    PreloadState, Preloader, PreloaderSettings,
};
pub use resolver::{ShareProvider, SourceKind, SourceResolver, VideoSource};
pub use store::{CacheStore, StoreSettings, StoreStats};

#[cfg(feature = "pmoconfig")]
pub use config_ext::VideoCacheConfigExt;
