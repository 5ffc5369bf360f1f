//! Résolution des descripteurs de source vers une URL directe
//!
//! Une source `direct` est téléchargée telle quelle. Une source
//! `indirect-share` est un lien de partage : chaque [`ShareProvider`] sait
//! extraire l'identifiant de la ressource d'un ou plusieurs formats d'URL et
//! le réécrire vers l'endpoint qui sert directement les octets.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{CacheError, Result};

/// Nature d'une source vidéo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[default]
    Direct,
    IndirectShare,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Direct => f.write_str("direct"),
            SourceKind::IndirectShare => f.write_str("indirect-share"),
        }
    }
}

/// Descripteur d'une source vidéo : `{ id, original_url, kind, quality }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSource {
    /// Clé de cache de l'asset (voir [`cache_key`](crate::cache_key))
    pub id: String,
    pub original_url: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub quality: String,
}

impl VideoSource {
    pub fn new(
        id: impl Into<String>,
        original_url: impl Into<String>,
        kind: SourceKind,
        quality: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            original_url: original_url.into(),
            kind,
            quality: quality.into(),
        }
    }

    pub fn direct(id: impl Into<String>, original_url: impl Into<String>, quality: impl Into<String>) -> Self {
        Self::new(id, original_url, SourceKind::Direct, quality)
    }
}

/// Fournisseur de liens de partage
///
/// Chaque implémentation reconnaît les URLs d'un hébergeur particulier.
pub trait ShareProvider: Send + Sync {
    /// Nom court, pour les logs
    fn name(&self) -> &'static str;

    /// Réécrit `url` vers l'endpoint direct, ou `None` si le format n'est pas reconnu
    fn direct_url(&self, url: &Url) -> Option<String>;
}

/// Liens Google Drive
///
/// Formats reconnus :
/// - `https://drive.google.com/file/d/<id>/view?...`
/// - `https://drive.google.com/open?id=<id>`
/// - `https://drive.google.com/uc?id=<id>&...`
#[derive(Debug, Default)]
pub struct GoogleDrive;

impl GoogleDrive {
    fn file_id(url: &Url) -> Option<String> {
        let mut segments = url.path_segments()?;
        while let Some(segment) = segments.next() {
            if segment == "d" {
                return segments.next().filter(|id| !id.is_empty()).map(str::to_string);
            }
        }

        url.query_pairs()
            .find(|(k, v)| k == "id" && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    }
}

impl ShareProvider for GoogleDrive {
    fn name(&self) -> &'static str {
        "google-drive"
    }

    fn direct_url(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        if host != "drive.google.com" && host != "docs.google.com" {
            return None;
        }
        let id = Self::file_id(url)?;
        Some(format!(
            "https://drive.google.com/uc?export=download&id={id}"
        ))
    }
}

/// Liens Dropbox (`?dl=0` devient `?dl=1`)
#[derive(Debug, Default)]
pub struct Dropbox;

impl ShareProvider for Dropbox {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    fn direct_url(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        if host == "dl.dropboxusercontent.com" {
            return Some(url.to_string());
        }
        if host != "www.dropbox.com" && host != "dropbox.com" {
            return None;
        }
        // Un lien de partage a au moins un segment /s/<id>/<nom> ou /scl/fi/<id>/<nom>
        if url.path_segments()?.filter(|s| !s.is_empty()).count() < 2 {
            return None;
        }

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "dl" && k != "raw")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut direct = url.clone();
        direct.set_fragment(None);
        {
            let mut query = direct.query_pairs_mut();
            query.clear();
            for (k, v) in &pairs {
                query.append_pair(k, v);
            }
            query.append_pair("dl", "1");
        }
        Some(direct.to_string())
    }
}

/// Résout un [`VideoSource`] en URL téléchargeable
pub struct SourceResolver {
    providers: Vec<Box<dyn ShareProvider>>,
}

impl SourceResolver {
    /// Résolveur sans aucun fournisseur de partage
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Ajoute un fournisseur ; ils sont essayés dans l'ordre d'enregistrement
    pub fn with_provider(mut self, provider: impl ShareProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Retourne l'URL directe de `source`
    ///
    /// # Errors
    ///
    /// [`CacheError::UnresolvableSource`] si l'URL est invalide ou si aucun
    /// fournisseur ne reconnaît un lien de partage. L'appelant peut encore
    /// tenter une lecture réseau de `original_url`, mais sans cache.
    pub fn resolve(&self, source: &VideoSource) -> Result<String> {
        let url = Url::parse(&source.original_url)
            .map_err(|_| CacheError::UnresolvableSource(source.original_url.clone()))?;

        match source.kind {
            SourceKind::Direct => Ok(source.original_url.clone()),
            SourceKind::IndirectShare => {
                for provider in &self.providers {
                    if let Some(direct) = provider.direct_url(&url) {
                        tracing::debug!(
                            asset_id = %source.id,
                            provider = provider.name(),
                            "Resolved share link"
                        );
                        return Ok(direct);
                    }
                }
                Err(CacheError::UnresolvableSource(source.original_url.clone()))
            }
        }
    }
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::empty().with_provider(GoogleDrive).with_provider(Dropbox)
    }
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("SourceResolver")
            .field("providers", &names)
            .finish()
    }
}
