mod common;

use common::{mp4_payload, open_store, preloader, CountingFetcher, StallingFetcher};
use pmovideocache::{
    AssetMetadata, CacheStore, LoadingProgress, LoadingStage, PreloadEvent, PreloadState,
    SourceKind, StoreSettings, VideoSource,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn recorder() -> (
    Arc<Mutex<Vec<LoadingProgress>>>,
    impl Fn(&LoadingProgress) + Send + Sync,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |p: &LoadingProgress| {
        sink.lock().unwrap().push(p.clone())
    })
}

#[tokio::test]
async fn test_preload_many_serves_cached_asset_without_download() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let fetcher = CountingFetcher::new();
    let preloader = preloader(store.clone(), fetcher.clone());

    let url = "https://cdn.example.com/intro-hd.mp4";
    store
        .store("intro:hd", url, &mp4_payload(64), None)
        .await
        .unwrap();

    let (seen, on_progress) = recorder();
    let results = preloader
        .preload_many(
            &[VideoSource::direct("intro:hd", url, "hd")],
            &HashMap::new(),
            &on_progress,
            &CancellationToken::new(),
        )
        .await;

    let result = &results["intro:hd"];
    assert!(result.success);
    assert!(result.from_cache);
    assert!(!result.persisted);
    assert_eq!(result.size_bytes, 64);
    assert_eq!(fetcher.calls(), 0);

    let handle = result.handle.as_ref().unwrap();
    assert_eq!(handle.with_bytes(|b| b.len()).unwrap(), 64);
    assert_eq!(handle.content_type().unwrap(), "video/mp4");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].stage, LoadingStage::Complete);
    assert_eq!(seen[0].percentage, 100.0);
}

#[tokio::test]
async fn test_preload_downloads_and_stores_on_miss() {
    let server = MockServer::start().await;
    serve(&server, "/intro.bin", mp4_payload(50_000)).await;

    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let fetcher = CountingFetcher::new();
    let preloader = preloader(store.clone(), fetcher.clone());
    let mut events = preloader.subscribe();

    let url = format!("{}/intro.bin", server.uri());
    let source = VideoSource::direct("intro:hd", &url, "hd");
    let metadata = AssetMetadata {
        label: Some("Intro".into()),
        ..AssetMetadata::new("hd")
    };

    let (seen, on_progress) = recorder();
    let result = preloader
        .preload(&source, Some(&metadata), &on_progress, &CancellationToken::new())
        .await;

    assert!(result.success);
    assert!(!result.from_cache);
    assert!(result.persisted);
    assert_eq!(result.size_bytes, 50_000);
    assert_eq!(fetcher.calls(), 1);

    // Étapes dans l'ordre, sans retour en arrière
    let stages: Vec<LoadingStage> = seen.lock().unwrap().iter().map(|p| p.stage).collect();
    let mut distinct = stages.clone();
    distinct.dedup();
    assert_eq!(
        distinct,
        vec![
            LoadingStage::Fetching,
            LoadingStage::Processing,
            LoadingStage::Caching,
            LoadingStage::Complete
        ]
    );

    // Entrée persistée avec le type MIME détecté
    let stored = store.metadata("intro:hd").await.unwrap().unwrap();
    assert_eq!(stored["content_type"], "video/mp4");
    assert_eq!(stored["label"], "Intro");
    assert!(store.has("intro:hd", &url).await.unwrap());

    assert!(matches!(events.try_recv(), Ok(PreloadEvent::Start { .. })));
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if let PreloadEvent::Complete { asset_id, result } = event {
            assert_eq!(asset_id, "intro:hd");
            assert!(result.success);
            completed = true;
        }
    }
    assert!(completed);

    // Seconde tentative : servie par le store
    let again = preloader
        .preload(&source, None, &|_| {}, &CancellationToken::new())
        .await;
    assert!(again.from_cache);
    assert!(!again.persisted);
    assert_eq!(fetcher.calls(), 1);

    // Le handle déjà émis est réutilisé, pas remplacé
    let first = result.handle.unwrap();
    let second = again.handle.unwrap();
    assert_eq!(second.id(), first.id());
    assert!(!first.is_released());
}

#[tokio::test]
async fn test_http_error_fails_in_fetching_stage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let preloader = preloader(store.clone(), CountingFetcher::new());

    let source = VideoSource::direct("intro:hd", format!("{}/intro.mp4", server.uri()), "hd");
    let (seen, on_progress) = recorder();
    let result = preloader
        .preload(&source, None, &on_progress, &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(result.handle.is_none());
    let failure = result.error.unwrap();
    assert_eq!(failure.stage, PreloadState::Fetching);
    assert!(failure.message.contains("503"));
    assert!(!failure.cancelled);

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.stage, LoadingStage::Error);
    assert!(last.error.is_some());
    assert_eq!(store.stats().await.unwrap().entry_count, 0);
}

#[tokio::test]
async fn test_unresolvable_share_link_fails_without_download() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let fetcher = CountingFetcher::new();
    let preloader = preloader(store, fetcher.clone());

    let source = VideoSource::new(
        "intro:hd",
        "https://share.example.com/s/abc",
        SourceKind::IndirectShare,
        "hd",
    );
    let result = preloader
        .preload(&source, None, &|_| {}, &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().message.contains("Unresolvable"));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_cancelled_download_leaves_no_entry() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let preloader = preloader(store.clone(), Arc::new(StallingFetcher));
    let mut events = preloader.subscribe();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let url = "https://cdn.example.com/big.mp4";
    let (seen, on_progress) = recorder();
    let result = preloader
        .preload(&VideoSource::direct("big:hd", url, "hd"), None, &on_progress, &cancel)
        .await;

    assert!(!result.success);
    assert!(result.is_cancelled());
    assert!(!result.persisted);

    // L'erreur rapporte les octets déjà reçus
    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.stage, LoadingStage::Error);
    assert_eq!(last.loaded, 512);
    assert!(!store.has("big:hd", url).await.unwrap());

    let mut saw_error = false;
    let mut saw_cancelled = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PreloadEvent::Error { .. } => saw_error = true,
            PreloadEvent::Cancelled { .. } => saw_cancelled = true,
            _ => {}
        }
    }
    assert!(saw_cancelled);
    assert!(!saw_error);
}

#[tokio::test]
async fn test_cancelling_batch_skips_queued_items() {
    let server = MockServer::start().await;
    serve(&server, "/one.mp4", mp4_payload(1_000)).await;
    Mock::given(method("GET"))
        .and(path("/two.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(mp4_payload(1_000))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/three.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(mp4_payload(1_000)))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let fetcher = CountingFetcher::new();
    let preloader = preloader(store.clone(), fetcher.clone());

    let sources: Vec<VideoSource> = ["one", "two", "three"]
        .iter()
        .map(|name| {
            VideoSource::direct(
                format!("{name}:hd"),
                format!("{}/{name}.mp4", server.uri()),
                "hd",
            )
        })
        .collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let results = preloader
        .preload_many(&sources, &HashMap::new(), &|_| {}, &cancel)
        .await;

    assert!(results["one:hd"].success);
    assert!(results["two:hd"].is_cancelled());
    assert!(!results.contains_key("three:hd"));
    assert_eq!(fetcher.calls(), 2);

    // L'élément déjà écrit n'est pas annulé
    assert!(store.has("one:hd", &sources[0].original_url).await.unwrap());
    assert!(!store.has("two:hd", &sources[1].original_url).await.unwrap());
}

#[tokio::test]
async fn test_cancel_all_stops_running_batch() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir, 1_000_000, 10).await;
    let preloader = Arc::new(preloader(store, Arc::new(StallingFetcher)));

    let sources = vec![
        VideoSource::direct("a:hd", "https://cdn.example.com/a.mp4", "hd"),
        VideoSource::direct("b:hd", "https://cdn.example.com/b.mp4", "hd"),
    ];

    let runner = preloader.clone();
    let batch = tokio::spawn(async move {
        runner
            .preload_many(&sources, &HashMap::new(), &|_| {}, &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    preloader.cancel_all();

    let results = tokio::time::timeout(Duration::from_secs(5), batch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results["a:hd"].is_cancelled());

    // Un nouveau jeton n'est pas affecté par l'annulation précédente
    assert!(!preloader.child_token().is_cancelled());
}

#[tokio::test]
async fn test_store_failure_still_completes() {
    let server = MockServer::start().await;
    serve(&server, "/intro.webm", vec![0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0]).await;

    let store = Arc::new(CacheStore::new(StoreSettings::without_backend()).unwrap());
    assert!(store.initialize().await.is_err());
    let preloader = preloader(store, CountingFetcher::new());

    let source = VideoSource::direct("intro:hd", format!("{}/intro.webm", server.uri()), "hd");
    let result = preloader
        .preload(&source, None, &|_| {}, &CancellationToken::new())
        .await;

    assert!(result.success);
    assert!(!result.from_cache);
    assert!(!result.persisted);
    let handle = result.handle.unwrap();
    assert_eq!(handle.content_type().unwrap(), "video/webm");
    assert_eq!(handle.size(), 8);
}
