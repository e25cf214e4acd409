//! Configuration loader: merges defaults, an optional TOML file and
//! environment variables, then validates the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{OrchestratorConfig, SnapshotStore};
use crate::data::upstream::DEFAULT_BASE_URL;
use crate::data::{Category, Lookback, DEFAULT_HISTORY_DAYS};
use crate::derived::RiskConfig;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "statcache.toml";

/// Upper bound on any TTL, roughly a century
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config:\n - {0}")]
    Invalid(String),
}

/// Per-category freshness windows, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub global: u64,
    pub countries: u64,
    pub history: u64,
    pub vaccination: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            global: 3600,
            countries: 3600,
            history: 3600,
            vaccination: 3600,
        }
    }
}

impl TtlConfig {
    /// Same TTL for every category
    pub fn uniform(secs: u64) -> Self {
        Self {
            global: secs,
            countries: secs,
            history: secs,
            vaccination: secs,
        }
    }

    pub fn for_category(&self, category: Category) -> chrono::Duration {
        let secs = match category {
            Category::GlobalTotals => self.global,
            Category::AllCountries => self.countries,
            Category::CountryHistory => self.history,
            Category::CountryVaccination => self.vaccination,
        };
        chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
    }
}

/// Time limits for blocking operations, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub upstream_secs: u64,
    pub store_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_secs: 10,
            store_secs: 5,
        }
    }
}

/// In-memory cache bounds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cap on per-country entries; unbounded when absent
    pub max_keyed_entries: Option<usize>,
}

/// Background refresh of the zero-key categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
        }
    }
}

/// Lookback windows used when a request does not name one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub history_days: u32,
    /// `None` requests the full vaccination series
    pub vaccination_days: Option<u32>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            history_days: DEFAULT_HISTORY_DAYS,
            vaccination_days: None,
        }
    }
}

impl DefaultsConfig {
    pub fn history_lookback(&self) -> Lookback {
        Lookback::Days(self.history_days)
    }

    pub fn vaccination_lookback(&self) -> Lookback {
        self.vaccination_days.map_or(Lookback::All, Lookback::Days)
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    /// Snapshot root; the XDG cache directory when absent
    pub snapshot_dir: Option<PathBuf>,
    pub ttl: TtlConfig,
    pub timeouts: TimeoutConfig,
    pub cache: CacheConfig,
    pub refresh: RefreshSettings,
    pub risk: RiskConfig,
    pub defaults: DefaultsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            snapshot_dir: None,
            ttl: TtlConfig::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheConfig::default(),
            refresh: RefreshSettings::default(),
            risk: RiskConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, a TOML file and the environment
    ///
    /// An explicit `path` must exist; without one, `statcache.toml` in the
    /// working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `STATCACHE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STATCACHE_BASE_URL") {
            self.base_url = url.trim().to_string();
        }
        if let Some(dir) = lookup("STATCACHE_SNAPSHOT_DIR") {
            self.snapshot_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(raw) = lookup("STATCACHE_TTL_SECS") {
            self.ttl = TtlConfig::uniform(parse_positive(&raw, "STATCACHE_TTL_SECS")?);
        }
        if let Some(raw) = lookup("STATCACHE_UPSTREAM_TIMEOUT_SECS") {
            self.timeouts.upstream_secs = parse_positive(&raw, "STATCACHE_UPSTREAM_TIMEOUT_SECS")?;
        }
        if let Some(raw) = lookup("STATCACHE_REFRESH_INTERVAL_SECS") {
            self.refresh.interval_secs = parse_positive(&raw, "STATCACHE_REFRESH_INTERVAL_SECS")?;
        }
        Ok(())
    }

    /// Checks every setting, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues: Vec<String> = Vec::new();

        match reqwest::Url::parse(&self.base_url) {
            Ok(url) if url.cannot_be_a_base() => {
                issues.push(format!("base_url cannot be a base URL: {}", self.base_url))
            }
            Ok(_) => {}
            Err(e) => issues.push(format!("base_url is not a valid URL ({}): {}", e, self.base_url)),
        }

        for (name, secs) in [
            ("ttl.global", self.ttl.global),
            ("ttl.countries", self.ttl.countries),
            ("ttl.history", self.ttl.history),
            ("ttl.vaccination", self.ttl.vaccination),
            ("timeouts.upstream_secs", self.timeouts.upstream_secs),
            ("timeouts.store_secs", self.timeouts.store_secs),
            ("refresh.interval_secs", self.refresh.interval_secs),
        ] {
            if secs == 0 {
                issues.push(format!("{} must be > 0", name));
            }
        }

        if self.cache.max_keyed_entries == Some(0) {
            issues.push("cache.max_keyed_entries must be > 0 when set".into());
        }
        if self.defaults.history_days == 0 {
            issues.push("defaults.history_days must be > 0".into());
        }
        if self.defaults.vaccination_days == Some(0) {
            issues.push("defaults.vaccination_days must be > 0 when set".into());
        }

        issues.extend(self.risk.issues());

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues.join("\n - ")))
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.upstream_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.store_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_secs)
    }

    /// Snapshot root: configured, else XDG cache dir, else `./data`
    pub fn snapshot_store(&self) -> SnapshotStore {
        let store = match &self.snapshot_dir {
            Some(dir) => SnapshotStore::with_dir(dir.clone()),
            None => SnapshotStore::new().unwrap_or_else(|| SnapshotStore::with_dir(PathBuf::from("data"))),
        };
        store.with_timeout(self.store_timeout())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            ttl: self.ttl.clone(),
            upstream_timeout: self.upstream_timeout(),
            max_keyed_entries: self.cache.max_keyed_entries,
        }
    }
}

fn parse_positive(raw: &str, name: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid(format!("{} must be an integer > 0", name))),
    }
}
