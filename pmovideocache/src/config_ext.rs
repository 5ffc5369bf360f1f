//! Extension pour intégrer le cache vidéo dans pmoconfig
//!
//! Ce module fournit le trait [`VideoCacheConfigExt`] qui lit la section
//! `video_cache` et la liste `catalog` de la configuration :
//!
//! ```yaml
//! video_cache:
//!   directory: cache_video
//!   store_namespace: pmovideo
//!   max_cache_bytes: 524288000
//!   max_entry_count: 50
//!   schema_version: 1
//!   preload_pause_ms: 150
//!   download_timeout_secs: 300
//! catalog:
//!   - id: intro
//!     variants:
//!       - { quality: hd, url: "https://cdn.example.com/intro.mp4" }
//! ```

use anyhow::{anyhow, Result};
use pmoconfig::Config;
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::download::{HttpDownloader, DEFAULT_DOWNLOAD_TIMEOUT};
use crate::manager::{CacheManager, Catalog};
use crate::preloader::{PreloaderSettings, DEFAULT_ITEM_PAUSE};
use crate::store::{
    StoreSettings, DEFAULT_MAX_CACHE_BYTES, DEFAULT_MAX_ENTRY_COUNT, DEFAULT_NAMESPACE,
    DEFAULT_SCHEMA_VERSION,
};

const SECTION: &str = "video_cache";
const DEFAULT_DIRECTORY: &str = "cache_video";

/// Trait d'extension ajoutant la configuration du cache vidéo à `pmoconfig::Config`
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::Config;
/// use pmovideocache::VideoCacheConfigExt;
///
/// let config = Config::load_config("")?;
/// let manager = config.create_cache_manager()?;
/// ```
pub trait VideoCacheConfigExt {
    /// Répertoire du store (absolu ou relatif au répertoire de configuration)
    fn get_video_cache_dir(&self) -> Result<PathBuf>;

    fn set_video_cache_dir(&self, directory: String) -> Result<()>;

    fn get_video_cache_namespace(&self) -> String;

    fn get_video_cache_max_bytes(&self) -> u64;

    fn set_video_cache_max_bytes(&self, bytes: u64) -> Result<()>;

    fn get_video_cache_max_entries(&self) -> u64;

    fn set_video_cache_max_entries(&self, count: u64) -> Result<()>;

    /// Version du format des entrées ; l'incrémenter vide le cache au prochain démarrage
    fn get_video_cache_schema_version(&self) -> Result<u32>;

    fn set_video_cache_schema_version(&self, version: u32) -> Result<()>;

    fn get_preload_pause(&self) -> Duration;

    fn get_download_timeout(&self) -> Duration;

    /// Paramètres complets du store, validés
    fn video_store_settings(&self) -> Result<StoreSettings>;

    fn preloader_settings(&self) -> PreloaderSettings;

    /// Liste des assets déclarés sous `catalog`
    fn video_catalog(&self) -> Result<Catalog>;

    /// Crée un [`CacheManager`] configuré, avec un téléchargeur HTTP
    ///
    /// Le manager n'est pas initialisé ; voir [`CacheManager::initialize`].
    fn create_cache_manager(&self) -> Result<CacheManager>;
}

impl VideoCacheConfigExt for Config {
    fn get_video_cache_dir(&self) -> Result<PathBuf> {
        self.get_managed_dir(&[SECTION, "directory"], DEFAULT_DIRECTORY)
    }

    fn set_video_cache_dir(&self, directory: String) -> Result<()> {
        self.set_managed_dir(&[SECTION, "directory"], directory)
    }

    fn get_video_cache_namespace(&self) -> String {
        match self.get_value(&[SECTION, "store_namespace"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_NAMESPACE.to_string(),
        }
    }

    fn get_video_cache_max_bytes(&self) -> u64 {
        self.get_u64(&[SECTION, "max_cache_bytes"], DEFAULT_MAX_CACHE_BYTES)
    }

    fn set_video_cache_max_bytes(&self, bytes: u64) -> Result<()> {
        self.set_u64(&[SECTION, "max_cache_bytes"], bytes)
    }

    fn get_video_cache_max_entries(&self) -> u64 {
        self.get_u64(&[SECTION, "max_entry_count"], DEFAULT_MAX_ENTRY_COUNT)
    }

    fn set_video_cache_max_entries(&self, count: u64) -> Result<()> {
        self.set_u64(&[SECTION, "max_entry_count"], count)
    }

    fn get_video_cache_schema_version(&self) -> Result<u32> {
        let version = self.get_u64(
            &[SECTION, "schema_version"],
            u64::from(DEFAULT_SCHEMA_VERSION),
        );
        u32::try_from(version).map_err(|_| anyhow!("schema_version {} is out of range", version))
    }

    fn set_video_cache_schema_version(&self, version: u32) -> Result<()> {
        self.set_u64(&[SECTION, "schema_version"], u64::from(version))
    }

    fn get_preload_pause(&self) -> Duration {
        Duration::from_millis(self.get_u64(
            &[SECTION, "preload_pause_ms"],
            DEFAULT_ITEM_PAUSE.as_millis() as u64,
        ))
    }

    fn get_download_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64(
            &[SECTION, "download_timeout_secs"],
            DEFAULT_DOWNLOAD_TIMEOUT.as_secs(),
        ))
    }

    fn video_store_settings(&self) -> Result<StoreSettings> {
        let settings = StoreSettings::new(self.get_video_cache_dir()?)
            .with_namespace(self.get_video_cache_namespace())
            .with_max_cache_bytes(self.get_video_cache_max_bytes())
            .with_max_entry_count(self.get_video_cache_max_entries())
            .with_schema_version(self.get_video_cache_schema_version()?);
        settings.validate()?;
        Ok(settings)
    }

    fn preloader_settings(&self) -> PreloaderSettings {
        PreloaderSettings {
            item_pause: self.get_preload_pause(),
        }
    }

    fn video_catalog(&self) -> Result<Catalog> {
        let catalog: Catalog = self.get_typed(&["catalog"])?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn create_cache_manager(&self) -> Result<CacheManager> {
        let fetcher = Arc::new(HttpDownloader::new(self.get_download_timeout())?);
        let manager = CacheManager::from_settings(
            self.video_store_settings()?,
            self.preloader_settings(),
            fetcher,
            self.video_catalog()?,
        )?;
        Ok(manager)
    }
}
