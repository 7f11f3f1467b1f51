use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// In-memory configuration store
///
/// Uses `ArcSwap` for lock-free reads, so hot paths (fan-out, delivery
/// loops) can consult the configuration without contention.
#[derive(Clone)]
pub struct ConfigStore {
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Create a store holding `config`
    pub fn new(config: AppConfig) -> Self {
        Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Load configuration from a TOML file
    ///
    /// A missing file yields the default configuration.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        validate(&config)?;
        Ok(Self::new(config))
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins. The
    /// change is rejected as a whole if the result does not validate.
    pub fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        validate(&config)?;
        self.cache.store(Arc::new(config));
        tracing::debug!(key, "Configuration updated");
        Ok(())
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.stream.queue_depth == 0 {
        return Err(AppError::Config("stream.queue_depth must be at least 1".into()));
    }
    if config.session.sweep_interval_secs == 0 {
        return Err(AppError::Config(
            "session.sweep_interval_secs must be at least 1".into(),
        ));
    }
    if config.audio.bits_per_sample % 8 != 0 || config.audio.channels == 0 {
        return Err(AppError::Config("audio format is invalid".into()));
    }
    Ok(())
}
