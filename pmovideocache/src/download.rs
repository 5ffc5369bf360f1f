//! Téléchargement HTTP en streaming, annulable, avec progression
//!
//! La réponse est lue chunk par chunk (`bytes_stream`) puis assemblée en un
//! seul buffer contigu. Chaque attente (envoi de la requête, chunk suivant)
//! est mise en concurrence avec le [`CancellationToken`] : l'annulation
//! abandonne la requête en cours et retourne [`CacheError::DownloadCancelled`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};

/// Timeout par défaut d'un téléchargement complet
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// Au-delà, on laisse le buffer grandir plutôt que de faire confiance à content-length
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Source d'octets distante
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Télécharge `url` en mémoire
    ///
    /// # Arguments
    ///
    /// * `url` - URL directe de la ressource
    /// * `cancel` - Jeton d'annulation coopérative
    /// * `on_progress` - Appelé après chaque chunk avec `(reçus, attendus)`,
    ///   `attendus` valant 0 si le serveur n'annonce pas de taille
    ///
    /// # Errors
    ///
    /// - [`CacheError::DownloadCancelled`] si `cancel` est déclenché
    /// - [`CacheError::DownloadFailed`] pour une réponse hors 2xx
    /// - [`CacheError::Network`] pour une erreur de transport
    async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<Bytes>;
}

/// Implémentation reqwest de [`Fetcher`]
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(CacheError::DownloadCancelled);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(url = %url, "Download cancelled before response");
                return Err(CacheError::DownloadCancelled);
            }
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(total.min(MAX_PREALLOCATION) as usize);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(url = %url, loaded = buffer.len(), "Download cancelled mid-transfer");
                    return Err(CacheError::DownloadCancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk?);
                    on_progress(buffer.len() as u64, total);
                }
                None => break,
            }
        }

        tracing::debug!(url = %url, size = buffer.len(), "Download complete");
        Ok(buffer.freeze())
    }
}
