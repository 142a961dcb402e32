//! Configuration loader and validator for the parcel scanner.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub resolver: Resolver,
    pub refresh: Refresh,
    pub shopify: Shopify,
    pub klaviyo: Klaviyo,
    pub ups: Ups,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Base tick of the background scheduler loop.
    pub sync_interval_secs: u64,
    /// Tracking refresh runs every `refresh_every_ticks` base ticks.
    pub refresh_every_ticks: u32,
}

/// Order resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolver {
    /// How far back the remote order search reaches.
    pub lookback_days: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
}

/// Tracking cache and refresh cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Refresh {
    /// Cache entries older than this are stale.
    pub ttl_minutes: i64,
    /// Only shipments scanned within this window are refreshed.
    pub activity_window_days: i64,
    /// Per-cycle candidate cap for UPS.
    pub ups_batch_size: u32,
    /// Per-cycle candidate cap for Canada Post.
    pub canada_post_batch_size: u32,
}

impl Refresh {
    pub fn batch_size_for(&self, carrier: crate::model::Carrier) -> u32 {
        match carrier {
            crate::model::Carrier::Ups => self.ups_batch_size,
            crate::model::Carrier::CanadaPost => self.canada_post_batch_size,
            _ => self.canada_post_batch_size.min(self.ups_batch_size),
        }
    }
}

/// Order platform API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shopify {
    pub shop_url: String,
    pub access_token: String,
    pub timeout_secs: u64,
}

/// Notification service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Klaviyo {
    pub api_key: String,
    pub enabled: bool,
    pub timeout_secs: u64,
}

/// UPS tracking adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ups {
    pub client_id: String,
    pub client_secret: String,
    pub timeout_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_secs must be > 0"));
    }
    if cfg.app.refresh_every_ticks == 0 {
        return Err(ConfigError::Invalid("app.refresh_every_ticks must be > 0"));
    }

    if cfg.resolver.lookback_days == 0 {
        return Err(ConfigError::Invalid("resolver.lookback_days must be > 0"));
    }
    if cfg.resolver.retry_max_attempts == 0 {
        return Err(ConfigError::Invalid("resolver.retry_max_attempts must be > 0"));
    }

    if cfg.refresh.ttl_minutes <= 0 {
        return Err(ConfigError::Invalid("refresh.ttl_minutes must be > 0"));
    }
    if cfg.refresh.activity_window_days <= 0 {
        return Err(ConfigError::Invalid("refresh.activity_window_days must be > 0"));
    }
    if cfg.refresh.ups_batch_size == 0 {
        return Err(ConfigError::Invalid("refresh.ups_batch_size must be > 0"));
    }
    if cfg.refresh.canada_post_batch_size == 0 {
        return Err(ConfigError::Invalid("refresh.canada_post_batch_size must be > 0"));
    }

    if cfg.shopify.shop_url.trim().is_empty() {
        return Err(ConfigError::Invalid("shopify.shop_url must be non-empty"));
    }
    if cfg.shopify.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("shopify.access_token must be non-empty"));
    }

    if cfg.klaviyo.enabled && cfg.klaviyo.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("klaviyo.api_key must be non-empty when enabled"));
    }

    // ups credentials may be empty: the adapter is only registered when set

    Ok(())
}

/// Example YAML config with the documented defaults.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 300
  refresh_every_ticks: 3

resolver:
  lookback_days: 365
  retry_max_attempts: 4
  retry_base_delay_secs: 1
  retry_max_delay_secs: 8

refresh:
  ttl_minutes: 120
  activity_window_days: 30
  ups_batch_size: 30
  canada_post_batch_size: 20

shopify:
  shop_url: "your-shop.myshopify.com"
  access_token: "YOUR_SHOPIFY_ACCESS_TOKEN"
  timeout_secs: 15

klaviyo:
  api_key: "YOUR_KLAVIYO_API_KEY"
  enabled: true
  timeout_secs: 10

ups:
  client_id: "YOUR_UPS_CLIENT_ID"
  client_secret: "YOUR_UPS_CLIENT_SECRET"
  timeout_secs: 10
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.refresh.ttl_minutes, 120);
        assert_eq!(cfg.refresh.ups_batch_size, 30);
        assert_eq!(cfg.refresh.canada_post_batch_size, 20);
        assert_eq!(cfg.resolver.lookback_days, 365);
    }

    #[test]
    fn invalid_shop_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.shopify.shop_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("shop_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_batch_sizes() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.refresh.ups_batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.refresh.canada_post_batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn klaviyo_key_required_only_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.klaviyo.api_key = "".into();
        assert!(validate(&cfg).is_err());

        cfg.klaviyo.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.sync_interval_secs, 300);
    }

    #[test]
    fn batch_size_per_carrier() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.refresh.batch_size_for(crate::model::Carrier::Ups), 30);
        assert_eq!(cfg.refresh.batch_size_for(crate::model::Carrier::CanadaPost), 20);
    }
}
