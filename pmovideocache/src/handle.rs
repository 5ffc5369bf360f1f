//! Handles locaux vers les payloads en mémoire
//!
//! La [`HandleTable`] est l'unique propriétaire des buffers. Les consommateurs
//! reçoivent un [`MediaHandle`], simple référence faible : dès que la table
//! libère l'entrée (éviction, refresh, arrêt), toute lecture ultérieure
//! échoue avec [`CacheError::HandleReleased`].

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{CacheError, Result};

/// Identifiant unique d'un handle pour la durée du processus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug)]
struct HandleInner {
    id: HandleId,
    content_type: String,
    payload: Bytes,
}

/// Référence révocable vers un payload détenu par la [`HandleTable`]
#[derive(Debug, Clone)]
pub struct MediaHandle {
    id: HandleId,
    asset_id: Arc<str>,
    size: u64,
    inner: Weak<HandleInner>,
}

impl MediaHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Clé de cache de l'asset référencé
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// Taille du payload au moment de l'émission du handle
    pub fn size(&self) -> u64 {
        self.size
    }

    /// URI locale à transmettre à la couche de lecture
    pub fn uri(&self) -> String {
        format!("pmovideo://handle/{}/{}", self.id.0, self.asset_id)
    }

    /// Indique si le propriétaire a libéré le handle
    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Type MIME du payload
    pub fn content_type(&self) -> Result<String> {
        self.upgrade().map(|inner| inner.content_type.clone())
    }

    /// Donne accès aux octets le temps d'un appel
    ///
    /// Le buffer reste la propriété de la table ; la fermeture ne doit pas le
    /// conserver au-delà de l'appel.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let inner = self.upgrade()?;
        Ok(f(&inner.payload))
    }

    fn upgrade(&self) -> Result<Arc<HandleInner>> {
        self.inner
            .upgrade()
            .ok_or(CacheError::HandleReleased(self.id))
    }
}

/// Table des handles émis, indexée par clé de cache
#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: AtomicU64,
    handles: Mutex<HashMap<String, Arc<HandleInner>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Émet un nouveau handle pour `asset_id`
    ///
    /// Un handle déjà émis pour la même clé est libéré et remplacé.
    pub fn mint(&self, asset_id: &str, payload: Bytes, content_type: &str) -> MediaHandle {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let size = payload.len() as u64;
        let inner = Arc::new(HandleInner {
            id,
            content_type: content_type.to_string(),
            payload,
        });
        let handle = MediaHandle {
            id,
            asset_id: Arc::from(asset_id),
            size,
            inner: Arc::downgrade(&inner),
        };

        let previous = self
            .handles
            .lock()
            .unwrap()
            .insert(asset_id.to_string(), inner);
        if let Some(previous) = previous {
            tracing::debug!(asset_id = %asset_id, old = %previous.id, new = %id, "Replaced local handle");
        }

        handle
    }

    /// Retourne le handle courant pour `asset_id`, s'il existe
    pub fn get(&self, asset_id: &str) -> Option<MediaHandle> {
        let handles = self.handles.lock().unwrap();
        handles.get(asset_id).map(|inner| MediaHandle {
            id: inner.id,
            asset_id: Arc::from(asset_id),
            size: inner.payload.len() as u64,
            inner: Arc::downgrade(inner),
        })
    }

    /// Libère le handle de `asset_id`
    ///
    /// # Returns
    ///
    /// `true` si un handle était émis pour cette clé
    pub fn release(&self, asset_id: &str) -> bool {
        self.handles.lock().unwrap().remove(asset_id).is_some()
    }

    /// Libère exactement ce handle (sans effet s'il a déjà été remplacé)
    pub fn release_handle(&self, handle: &MediaHandle) -> bool {
        let mut handles = self.handles.lock().unwrap();
        match handles.get(handle.asset_id()) {
            Some(inner) if inner.id == handle.id => {
                handles.remove(handle.asset_id());
                true
            }
            _ => false,
        }
    }

    /// Libère tous les handles dont la clé satisfait `predicate`
    ///
    /// # Returns
    ///
    /// Les clés libérées
    pub fn release_where(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        let mut handles = self.handles.lock().unwrap();
        let keys: Vec<String> = handles
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &keys {
            handles.remove(key);
        }
        keys
    }

    /// Libère l'intégralité de la table
    ///
    /// # Returns
    ///
    /// Le nombre de handles libérés
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.handles.lock().unwrap().drain().collect();
        drained.len()
    }

    /// Clés ayant actuellement un handle
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handles.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
