//! Installation du subscriber tracing

use pmoconfig::Config;
use tracing::Level;
use tracing_subscriber::{
    Registry,
    filter::LevelFilter,
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

/// Handle permettant de changer le niveau de log à chaud
pub type LevelHandle = reload::Handle<LevelFilter, Registry>;

/// Installe le subscriber global
///
/// Le niveau minimal vient de `host.logger.min_level` (TRACE si illisible),
/// la sortie console de `host.logger.enable_console`.
pub fn init_logging(config: &Config) -> LevelHandle {
    let log_level = match config.get_log_min_level() {
        Ok(l) => parse_level(&l).unwrap_or(LevelFilter::TRACE),
        Err(_) => LevelFilter::TRACE,
    };

    let (filter, reload_handle) = reload::Layer::new(log_level);
    let subscriber = Registry::default().with(filter);

    let enable_console = config.get_log_enable_console().unwrap_or(true);

    if enable_console {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    } else {
        subscriber.init();
    }

    reload_handle
}

/// Change le niveau de log courant
pub fn set_level(handle: &LevelHandle, level: &str) -> anyhow::Result<()> {
    let filter = parse_level(level).ok_or_else(|| anyhow::anyhow!("Unknown log level '{level}'"))?;
    handle.modify(|current| *current = filter)?;
    Ok(())
}

fn parse_level(s: &str) -> Option<LevelFilter> {
    let level = match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => return None,
    };
    Some(LevelFilter::from_level(level))
}
