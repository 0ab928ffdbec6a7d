//! Delivery configuration loading and validation

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::cache::CacheOptions;
use crate::transport::DispatcherOptions;

/// Delivery configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Whether delivery is enabled (default: true)
    pub enabled: bool,

    /// Debug mode - log envelopes instead of sending (default: false)
    pub debug: bool,

    /// Directory of the offline envelope cache
    pub cache_dir: PathBuf,

    /// Maximum envelopes kept on disk
    pub max_cache_items: usize,

    /// Maximum envelopes waiting in memory for a worker
    pub max_queue_size: usize,

    pub worker_pool_size: usize,

    /// A crash flush this soon after startup writes the startup crash marker
    pub startup_crash_duration_threshold_ms: u64,

    pub health_check_interval_ms: u64,

    /// Time `close` waits for pending work
    pub flush_timeout_ms: u64,

    pub enable_backpressure_handling: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            cache_dir: default_cache_dir(),
            max_cache_items: 30,
            max_queue_size: 100,
            worker_pool_size: 2,
            startup_crash_duration_threshold_ms: 2000,
            health_check_interval_ms: 10_000,
            flush_timeout_ms: 15_000,
            enable_backpressure_handling: true,
        }
    }
}

/// `~/.postbox/cache`, or a temp directory when there is no home
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".postbox").join("cache"))
        .unwrap_or_else(|| env::temp_dir().join("postbox").join("cache"))
}

impl DeliveryConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        if self.max_queue_size == 0 {
            bail!("max_queue_size must be at least 1");
        }
        if self.health_check_interval_ms == 0 {
            bail!("health_check_interval_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            directory: self.cache_dir.clone(),
            max_items: self.max_cache_items,
            startup_crash_threshold: chrono::Duration::milliseconds(
                i64::try_from(self.startup_crash_duration_threshold_ms).unwrap_or(i64::MAX),
            ),
        }
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            worker_pool_size: self.worker_pool_size,
            max_queue_size: self.max_queue_size,
            debug: self.debug,
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// `[delivery]` section as written in a file; unset keys keep the lower layer
#[derive(Debug, Default, Deserialize)]
struct PartialDeliveryConfig {
    enabled: Option<bool>,
    debug: Option<bool>,
    cache_dir: Option<PathBuf>,
    max_cache_items: Option<usize>,
    max_queue_size: Option<usize>,
    worker_pool_size: Option<usize>,
    startup_crash_duration_threshold_ms: Option<u64>,
    health_check_interval_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    enable_backpressure_handling: Option<bool>,
}

/// Load delivery configuration with precedence:
/// 1. Environment variables (highest priority)
/// 2. Local config (.postbox/config.local.toml)
/// 3. Project config (.postbox/config.toml)
/// 4. User config (~/.postbox/config.toml)
/// 5. Defaults
pub fn load_delivery_config() -> Result<DeliveryConfig> {
    load_delivery_config_from(dirs::home_dir().as_deref(), Path::new("."))
}

/// Same as [`load_delivery_config`] with explicit home and project roots.
pub fn load_delivery_config_from(home: Option<&Path>, project_root: &Path) -> Result<DeliveryConfig> {
    let mut config = DeliveryConfig::default();

    let mut layers = Vec::new();
    if let Some(home) = home {
        layers.push(home.join(".postbox").join("config.toml"));
    }
    layers.push(project_root.join(".postbox").join("config.toml"));
    layers.push(project_root.join(".postbox").join("config.local.toml"));

    for path in layers {
        if !path.exists() {
            continue;
        }
        match load_config_from_file(&path) {
            Ok(partial) => merge_config(&mut config, partial),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable config file"),
        }
    }

    apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(config)
}

/// Load the delivery section of a TOML file
fn load_config_from_file(path: &Path) -> Result<PartialDeliveryConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    #[derive(Deserialize)]
    struct FullConfig {
        #[serde(default)]
        delivery: Option<PartialDeliveryConfig>,
    }

    let full_config: FullConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;

    Ok(full_config.delivery.unwrap_or_default())
}

/// Overlay the keys set in `new` onto `base`
fn merge_config(base: &mut DeliveryConfig, new: PartialDeliveryConfig) {
    if let Some(v) = new.enabled {
        base.enabled = v;
    }
    if let Some(v) = new.debug {
        base.debug = v;
    }
    if let Some(v) = new.cache_dir {
        base.cache_dir = v;
    }
    if let Some(v) = new.max_cache_items {
        base.max_cache_items = v;
    }
    if let Some(v) = new.max_queue_size {
        base.max_queue_size = v;
    }
    if let Some(v) = new.worker_pool_size {
        base.worker_pool_size = v;
    }
    if let Some(v) = new.startup_crash_duration_threshold_ms {
        base.startup_crash_duration_threshold_ms = v;
    }
    if let Some(v) = new.health_check_interval_ms {
        base.health_check_interval_ms = v;
    }
    if let Some(v) = new.flush_timeout_ms {
        base.flush_timeout_ms = v;
    }
    if let Some(v) = new.enable_backpressure_handling {
        base.enable_backpressure_handling = v;
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut DeliveryConfig) -> Result<()> {
    // POSTBOX_DISABLED=1 disables delivery
    if env::var("POSTBOX_DISABLED").is_ok() {
        config.enabled = false;
    }

    // DO_NOT_TRACK=1 (universal opt-out)
    if env::var("DO_NOT_TRACK").is_ok() {
        config.enabled = false;
    }

    if env::var("POSTBOX_DEBUG").is_ok() {
        config.debug = true;
    }

    if let Ok(dir) = env::var("POSTBOX_CACHE_DIR") {
        config.cache_dir = PathBuf::from(dir);
    }

    if let Some(v) = env_number("POSTBOX_MAX_CACHE_ITEMS")? {
        config.max_cache_items = v;
    }
    if let Some(v) = env_number("POSTBOX_WORKER_POOL_SIZE")? {
        config.worker_pool_size = v;
    }
    if let Some(v) = env_number("POSTBOX_FLUSH_TIMEOUT_MS")? {
        config.flush_timeout_ms = v;
    }

    Ok(())
}

fn env_number<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
