#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pmovideocache::{
    CacheError, CacheStore, Fetcher, HandleTable, HttpDownloader, Preloader, PreloaderSettings,
    StoreSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Téléchargeur HTTP qui compte ses appels
pub struct CountingFetcher {
    inner: HttpDownloader,
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HttpDownloader::new(Duration::from_secs(10)).unwrap(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> pmovideocache::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.download(url, cancel, on_progress).await
    }
}

/// Reçoit la moitié des octets puis attend l'annulation
pub struct StallingFetcher;

#[async_trait]
impl Fetcher for StallingFetcher {
    async fn download(
        &self,
        _url: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> pmovideocache::Result<Bytes> {
        on_progress(512, 1024);
        cancel.cancelled().await;
        Err(CacheError::DownloadCancelled)
    }
}

/// Payload commençant par une boîte `ftyp` MP4
pub fn mp4_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0, 0, 0, 0x18];
    payload.extend_from_slice(b"ftypisom");
    payload.resize(len.max(payload.len()), 0xAB);
    payload
}

pub async fn open_store(dir: &TempDir, max_bytes: u64, max_count: u64) -> Arc<CacheStore> {
    let settings = StoreSettings::new(dir.path())
        .with_max_cache_bytes(max_bytes)
        .with_max_entry_count(max_count);
    let store = Arc::new(CacheStore::new(settings).unwrap());
    store.initialize().await.unwrap();
    store
}

pub fn preloader(store: Arc<CacheStore>, fetcher: Arc<dyn Fetcher>) -> Preloader {
    Preloader::new(
        store,
        fetcher,
        Arc::new(HandleTable::new()),
        PreloaderSettings {
            item_pause: Duration::ZERO,
        },
    )
}
