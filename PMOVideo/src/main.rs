mod logs;

use pmoconfig::Config;
use pmovideocache::{LoadingProgress, LoadingStage, VideoCacheConfigExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Usage : `PMOVideo [config_dir] [--verbose]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_dir = String::new();
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            _ => config_dir = arg,
        }
    }

    // ========== PHASE 1 : Configuration et logs ==========
    let config = Arc::new(Config::load_config(&config_dir)?);
    let log_level = logs::init_logging(&config);
    if verbose {
        logs::set_level(&log_level, "DEBUG")?;
    }
    info!(config_dir = %config.directory(), "🎬 Starting PMOVideo...");

    // ========== PHASE 2 : Cache vidéo ==========
    let manager = config.create_cache_manager()?;
    if manager.initialize().await {
        let stats = manager.stats().await;
        info!(
            handles = stats.handle_count,
            bytes = stats.store.as_ref().map(|s| s.total_bytes).unwrap_or(0),
            "✅ Video cache ready"
        );
    } else {
        warn!("⚠️ Video cache unavailable, assets will be streamed from the network");
    }

    // ========== PHASE 3 : Préchargement du catalogue ==========
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, cancelling preload...");
            on_ctrl_c.cancel();
        }
    });

    info!(assets = manager.catalog().len(), "📥 Preloading catalog...");
    let results = manager.preload_all(&log_progress, &cancel).await;

    let mut keys: Vec<&String> = results.keys().collect();
    keys.sort();
    for key in keys {
        let result = &results[key];
        match (&result.handle, &result.error) {
            (Some(handle), _) => info!(
                key = %key,
                uri = %handle.uri(),
                size = result.size_bytes,
                from_cache = result.from_cache,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "  - ready"
            ),
            (None, Some(failure)) if failure.cancelled => info!(key = %key, "  - cancelled"),
            (None, Some(failure)) => warn!(
                key = %key,
                stage = %failure.stage,
                error = %failure.message,
                "  - failed"
            ),
            (None, None) => {}
        }
    }

    let stats = manager.stats().await;
    if let Some(store) = &stats.store {
        info!(
            entries = store.entry_count,
            bytes = store.total_bytes,
            max_bytes = store.max_cache_bytes,
            handles = stats.handle_count,
            "📊 Video cache stats"
        );
    }

    // ========== PHASE 4 : Arrêt ==========
    manager.shutdown();
    info!("✅ PMOVideo stopped");
    Ok(())
}

fn log_progress(progress: &LoadingProgress) {
    match progress.stage {
        LoadingStage::Fetching => tracing::trace!(
            asset_id = %progress.asset_id,
            loaded = progress.loaded,
            total = progress.total,
            "{:.0}%",
            progress.percentage
        ),
        LoadingStage::Error => tracing::debug!(
            asset_id = %progress.asset_id,
            error = ?progress.error,
            "Preload stage failed"
        ),
        stage => tracing::debug!(asset_id = %progress.asset_id, ?stage, "Preload stage"),
    }
}
