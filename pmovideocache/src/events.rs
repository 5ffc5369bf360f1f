//! Événements publiés par le store, le préchargeur et le manager

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Capacité par défaut des canaux d'événements
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Raison d'un `miss`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Aucune entrée pour cet asset
    NotFound,
    /// L'entrée pointait vers une autre URL source ; elle a été supprimée
    SourceChanged,
    /// Le store n'a pas pu répondre (backend absent ou en erreur)
    StoreFailure,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissReason::NotFound => "not-found",
            MissReason::SourceChanged => "source-changed",
            MissReason::StoreFailure => "store-failure",
        };
        f.write_str(s)
    }
}

/// Événements du [`CacheStore`](crate::CacheStore)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Hit { asset_id: String },
    Miss { asset_id: String, reason: MissReason },
    Stored { asset_id: String, size_bytes: u64 },
    Evicted { asset_id: String, size_bytes: u64 },
    Cleared,
    Error { asset_id: String, cause: String },
}

/// Bus d'événements diffusés à tous les abonnés actifs
///
/// Un abonné trop lent perd les plus anciens événements (`Lagged`), les
/// autres ne sont pas bloqués.
#[derive(Debug)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publie un événement ; sans abonné, il est simplement perdu
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Identifiant d'un abonnement, à rendre à `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registre de callbacks avec durée d'abonnement explicite
pub struct Listeners<T> {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<SubscriptionId, Listener<T>>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));
        id
    }

    /// # Returns
    ///
    /// `true` si l'abonnement existait
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.lock().unwrap().remove(&id).is_some()
    }

    /// Appelle chaque callback dans l'ordre d'abonnement
    ///
    /// Le verrou est relâché avant les appels : un callback peut se désabonner.
    pub fn notify(&self, event: &T) {
        let callbacks: Vec<Listener<T>> = self.callbacks.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_bus_delivers_to_every_subscriber() {
        let bus = EventBus::<StoreEvent>::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(StoreEvent::Cleared);

        assert_eq!(a.recv().await.unwrap(), StoreEvent::Cleared);
        assert_eq!(b.recv().await.unwrap(), StoreEvent::Cleared);
    }

    #[test]
    fn test_listeners_unsubscribe() {
        let listeners = Listeners::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = listeners.subscribe(move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.notify(&2);
        assert!(listeners.unsubscribe(id));
        listeners.notify(&5);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!listeners.unsubscribe(id));
        assert!(listeners.is_empty());
    }
}
