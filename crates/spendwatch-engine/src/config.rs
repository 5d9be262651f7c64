//! Configuration loading.
//!
//! Config is YAML on disk, with every field optional thanks to serde
//! defaults. The path comes from the CLI argument, then the
//! `SPENDWATCH_CONFIG` environment variable, then built-in defaults.

use spendwatch_core::{EngineConfig, Result, SpendWatchError};
use tracing::info;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "SPENDWATCH_CONFIG";

/// Load configuration from an explicit path, the environment, or defaults.
pub fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    let path = path
        .map(|p| p.to_string())
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok());

    let config = match path {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                SpendWatchError::Config(format!("failed to read config file {path}: {e}"))
            })?;
            serde_yaml::from_str(&contents).map_err(|e| {
                SpendWatchError::Config(format!("failed to parse config file {path}: {e}"))
            })?
        }
        None => {
            info!("No config file specified, using defaults");
            EngineConfig::default()
        }
    };

    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &EngineConfig) -> Result<()> {
    if !config.budget.total_budget_usd.is_finite() || config.budget.total_budget_usd <= 0.0 {
        return Err(SpendWatchError::Config(format!(
            "budget.total_budget_usd must be positive, got {}",
            config.budget.total_budget_usd
        )));
    }
    if config.tracker.poll_interval_secs == 0 {
        return Err(SpendWatchError::Config(
            "tracker.poll_interval_secs must be at least 1".to_string(),
        ));
    }
    if config.tracker.max_consecutive_poll_failures == 0 {
        return Err(SpendWatchError::Config(
            "tracker.max_consecutive_poll_failures must be at least 1".to_string(),
        ));
    }
    if config.anomaly.window_size < config.anomaly.min_samples {
        return Err(SpendWatchError::Config(format!(
            "anomaly.window_size ({}) must be >= anomaly.min_samples ({})",
            config.anomaly.window_size, config.anomaly.min_samples
        )));
    }
    if config.alerting.evaluation_interval_secs == 0 {
        return Err(SpendWatchError::Config(
            "alerting.evaluation_interval_secs must be at least 1".to_string(),
        ));
    }
    config
        .listen_addr
        .parse::<std::net::SocketAddr>()
        .map_err(|e| {
            SpendWatchError::Config(format!("invalid listen_addr {}: {e}", config.listen_addr))
        })?;
    Ok(())
}
