//! Gestion des erreurs du cache vidéo

use thiserror::Error;

use crate::handle::HandleId;

/// Type Result personnalisé pour pmovideocache
pub type Result<T> = std::result::Result<T, CacheError>;

/// Erreurs possibles du cache vidéo et du préchargement
#[derive(Error, Debug)]
pub enum CacheError {
    /// Aucun backend persistant utilisable (le cache est désactivé, pas l'application)
    #[error("Persistent store unavailable: {0}")]
    StoreUnavailable(String),

    /// Erreur d'E/S sur une opération précise du store
    #[error("Store operation failed for '{asset_id}': {source}")]
    StoreOperationFailed {
        asset_id: String,
        #[source]
        source: rusqlite::Error,
    },

    /// L'entrée ne peut pas tenir dans le budget, même cache vide
    #[error("Entry '{asset_id}' is too large ({size} bytes, budget {budget} bytes)")]
    EntryTooLarge {
        asset_id: String,
        size: u64,
        budget: u64,
    },

    /// Le descripteur de source ne correspond à aucun motif connu
    #[error("Unresolvable source: {0}")]
    UnresolvableSource(String),

    /// Réponse HTTP hors 2xx
    #[error("Download of {url} failed with HTTP status {status}")]
    DownloadFailed { url: String, status: u16 },

    /// Erreur réseau (connexion, lecture d'un chunk, timeout)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Annulation coopérative demandée par l'appelant
    #[error("Download cancelled")]
    DownloadCancelled,

    /// Entrée écrite par une version incompatible du store
    #[error("Schema version mismatch (found {found}, expected {expected})")]
    SchemaVersionMismatch { found: u32, expected: u32 },

    /// Le handle a été libéré par son propriétaire
    #[error("Handle {0} has been released")]
    HandleReleased(HandleId),

    /// Paramètres de configuration invalides
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Erreur de (dé)sérialisation des métadonnées JSON
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl CacheError {
    /// Construit une [`CacheError::StoreOperationFailed`] pour `asset_id`
    pub fn store_failed(asset_id: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::StoreOperationFailed {
            asset_id: asset_id.into(),
            source,
        }
    }

    /// Vérifie si l'erreur correspond à une annulation (terminaison normale)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::DownloadCancelled)
    }

    /// Vérifie si l'erreur vient du store persistant
    ///
    /// Ces erreurs se dégradent toujours en "absent" chez l'appelant.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable(_)
                | CacheError::StoreOperationFailed { .. }
                | CacheError::EntryTooLarge { .. }
        )
    }

    /// Code HTTP associé, si l'erreur vient d'une réponse non-2xx
    pub fn http_status(&self) -> Option<u16> {
        match self {
            CacheError::DownloadFailed { status, .. } => Some(*status),
            CacheError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
