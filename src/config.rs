//! Run settings and store credentials.
//!
//! Settings come from an optional TOML file; a missing or empty file yields
//! `Settings::default()`. Store credentials only ever come from the
//! environment and are held as [`SecretString`] so they never reach logs.
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the store's base URL.
pub const STORE_URL_ENV: &str = "SUPABASE_URL";
/// Environment variable holding the store's service-level bearer credential.
pub const STORE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";

// ============================================================================
// Error Types
// ============================================================================

/// Fatal configuration problems. Any of these aborts the run before the
/// first network request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} is too large")]
    TooLarge(String),

    #[error("Invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("Invalid store URL: {0}")]
    InvalidStoreUrl(String),

    #[error("Feed list is not valid JSON: {0}")]
    FeedListJson(#[from] serde_json::Error),

    #[error("Feed list must be a JSON array of feed entries")]
    NotASequence,

    #[error("Feed entry #{index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("Feed entry #{index}: invalid rss_url `{url}`: {reason}")]
    InvalidUrl {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("Feed entry #{index}: duplicate rss_url `{url}` (first listed as entry #{first})")]
    DuplicateUrl {
        index: usize,
        first: usize,
        url: String,
    },
}

// ============================================================================
// Settings
// ============================================================================

/// What counts as a failed run for the invoking scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// The run fails only if feeds were attempted and none succeeded.
    #[default]
    AnySuccess,
    /// The run fails if any single feed failed.
    AllOrNothing,
}

/// Tunables for one ingestion run.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path of the JSON feed list.
    pub feeds_path: PathBuf,

    /// Most-recent episodes kept per podcast per run.
    pub max_episodes_per_podcast: usize,

    /// Items retained while parsing a single feed document.
    pub max_items_per_feed: usize,

    /// Feeds processed at once. 1 = strictly sequential.
    pub concurrency: usize,

    pub fetch_timeout_secs: u64,

    pub store_timeout_secs: u64,

    /// Upper bound on a feed response body, in bytes.
    pub max_feed_bytes: usize,

    /// Total fetch attempts per feed, including the first.
    pub fetch_attempts: u32,

    /// Base delay between fetch attempts; doubles after each retry.
    pub retry_backoff_ms: u64,

    /// Minimum gap between the starts of two feeds, shared across workers.
    /// 0 disables pacing.
    pub feed_delay_ms: u64,

    /// Wall-clock budget for the whole run. 0 disables the deadline.
    pub run_deadline_secs: u64,

    pub failure_policy: FailurePolicy,

    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feeds_path: PathBuf::from("feeds.json"),
            max_episodes_per_podcast: 50,
            max_items_per_feed: 500,
            concurrency: 1,
            fetch_timeout_secs: 30,
            store_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            fetch_attempts: 3,
            retry_backoff_ms: 1000,
            feed_delay_ms: 1000,
            run_deadline_secs: 900,
            failure_policy: FailurePolicy::AnySuccess,
            user_agent: concat!("podcast-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    /// Maximum settings file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 13] = [
        "feeds_path",
        "max_episodes_per_podcast",
        "max_items_per_feed",
        "concurrency",
        "fetch_timeout_secs",
        "store_timeout_secs",
        "max_feed_bytes",
        "fetch_attempts",
        "retry_backoff_ms",
        "feed_delay_ms",
        "run_deadline_secs",
        "failure_policy",
        "user_agent",
    ];

    /// Load settings from a TOML file.
    ///
    /// - Missing file → `Ok(Settings::default())`
    /// - Empty file → `Ok(Settings::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Settings file {} ({} bytes, max {})",
                    path.display(),
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Settings file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let settings = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Parse settings from TOML text and validate them.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in settings file, ignoring");
                }
            }
        }

        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_episodes_per_podcast == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "max_episodes_per_podcast",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_items_per_feed < self.max_episodes_per_podcast {
            return Err(ConfigError::InvalidSetting {
                key: "max_items_per_feed",
                reason: format!(
                    "must be at least max_episodes_per_podcast ({})",
                    self.max_episodes_per_podcast
                ),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.fetch_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "fetch_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn feed_delay(&self) -> Duration {
        Duration::from_millis(self.feed_delay_ms)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        (self.run_deadline_secs > 0).then(|| Duration::from_secs(self.run_deadline_secs))
    }
}

// ============================================================================
// Store Credentials
// ============================================================================

/// Base URL and bearer credential for the remote store.
///
/// Custom Debug impl masks the key to prevent secret leakage in logs.
#[derive(Clone)]
pub struct StoreCredentials {
    pub base_url: url::Url,
    pub api_key: SecretString,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl StoreCredentials {
    /// Read credentials from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read credentials through an arbitrary lookup, so tests never touch the
    /// real environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };

        let raw_url = non_blank(STORE_URL_ENV)?;
        let api_key = non_blank(STORE_KEY_ENV)?;

        let base_url = url::Url::parse(&raw_url)
            .map_err(|e| ConfigError::InvalidStoreUrl(format!("{raw_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidStoreUrl(format!(
                "{raw_url}: scheme must be http or https"
            )));
        }

        Ok(Self {
            base_url,
            api_key: SecretString::from(api_key),
        })
    }

    pub fn expose_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.feeds_path, PathBuf::from("feeds.json"));
        assert_eq!(settings.max_episodes_per_podcast, 50);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(settings.failure_policy, FailurePolicy::AnySuccess);
        assert_eq!(settings.run_deadline(), Some(Duration::from_secs(900)));
        assert_eq!(settings.feed_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_feed_delay_can_be_disabled() {
        let settings = Settings::from_toml("feed_delay_ms = 0
").unwrap();
        assert_eq!(settings.feed_delay(), Duration::ZERO);
        settings.validate().unwrap();
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/podcast_ingest_nonexistent_settings.toml");
        let settings = Settings::load(path).unwrap();
        assert_eq!(settings.max_episodes_per_podcast, 50);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let settings = Settings::from_toml("   \n  \n").unwrap();
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn test_partial_settings_use_defaults_for_missing() {
        let dir = std::env::temp_dir().join("podcast_ingest_settings_partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(&path, "concurrency = 8\nfailure_policy = \"all-or-nothing\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.failure_policy, FailurePolicy::AllOrNothing);
        assert_eq!(settings.max_episodes_per_podcast, 50);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Settings::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let settings = Settings::from_toml("concurrency = 2\nsomething_else = true\n").unwrap();
        assert_eq!(settings.concurrency, 2);
    }

    #[test]
    fn test_zero_cap_rejected() {
        let err = Settings::from_toml("max_episodes_per_podcast = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "max_episodes_per_podcast",
                ..
            }
        ));
    }

    #[test]
    fn test_item_limit_below_cap_rejected() {
        let err =
            Settings::from_toml("max_episodes_per_podcast = 100\nmax_items_per_feed = 10\n")
                .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "max_items_per_feed",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_deadline_disables_it() {
        let settings = Settings::from_toml("run_deadline_secs = 0\n").unwrap();
        assert_eq!(settings.run_deadline(), None);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("podcast_ingest_settings_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_credentials_from_lookup() {
        let creds = StoreCredentials::from_lookup(lookup_from(&[
            (STORE_URL_ENV, "https://project.example.co"),
            (STORE_KEY_ENV, "service-key"),
        ]))
        .unwrap();
        assert_eq!(creds.base_url.as_str(), "https://project.example.co/");
        assert_eq!(creds.expose_key(), "service-key");
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let err = StoreCredentials::from_lookup(lookup_from(&[(STORE_KEY_ENV, "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(STORE_URL_ENV)));
    }

    #[test]
    fn test_blank_key_is_fatal() {
        let err = StoreCredentials::from_lookup(lookup_from(&[
            (STORE_URL_ENV, "https://project.example.co"),
            (STORE_KEY_ENV, "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(STORE_KEY_ENV)));
    }

    #[test]
    fn test_non_http_store_url_rejected() {
        let err = StoreCredentials::from_lookup(lookup_from(&[
            (STORE_URL_ENV, "ftp://project.example.co"),
            (STORE_KEY_ENV, "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStoreUrl(_)));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let creds = StoreCredentials::from_lookup(lookup_from(&[
            (STORE_URL_ENV, "https://project.example.co"),
            (STORE_KEY_ENV, "super-secret-key-12345"),
        ]))
        .unwrap();

        let debug_output = format!("{:?}", creds);
        assert!(!debug_output.contains("super-secret-key-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_example_settings_file_matches_defaults() {
        let example = Settings::from_toml(include_str!("../podcast-ingest.example.toml")).unwrap();
        let defaults = Settings::default();
        assert_eq!(example.feeds_path, defaults.feeds_path);
        assert_eq!(example.max_episodes_per_podcast, defaults.max_episodes_per_podcast);
        assert_eq!(example.max_feed_bytes, defaults.max_feed_bytes);
        assert_eq!(example.run_deadline(), defaults.run_deadline());
        assert_eq!(example.feed_delay(), defaults.feed_delay());
        assert_eq!(example.failure_policy, defaults.failure_policy);
    }
}
