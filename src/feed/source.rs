use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use url::Url;

use crate::config::ConfigError;

/// Feed lists above this size are refused outright.
const MAX_FEED_LIST_SIZE: u64 = 1_048_576;

/// A configured podcast feed plus optional metadata overrides.
///
/// Overrides win over whatever the feed itself declares.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedEntry {
    pub rss_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl FeedEntry {
    /// Entry with a URL and no overrides.
    pub fn new(rss_url: impl Into<String>) -> Self {
        Self {
            rss_url: rss_url.into(),
            title: None,
            categories: None,
            language: None,
            country: None,
        }
    }

    /// Name used in run logs: the override title if one is configured,
    /// otherwise the URL.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.rss_url)
    }
}

/// Reads and validates the feed list at `path`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, is too large, or its
/// content is rejected by [`parse_feed_entries`].
pub async fn load_feed_entries(path: &Path) -> Result<Vec<FeedEntry>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let meta = tokio::fs::metadata(path).await.map_err(io_err)?;
    if meta.len() > MAX_FEED_LIST_SIZE {
        return Err(ConfigError::TooLarge(format!(
            "Feed list {} ({} bytes, max {})",
            path.display(),
            meta.len(),
            MAX_FEED_LIST_SIZE
        )));
    }

    let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
    let entries = parse_feed_entries(&content)?;
    tracing::info!(path = %path.display(), feeds = entries.len(), "Loaded feed list");
    Ok(entries)
}

/// Parses a JSON feed list into validated [`FeedEntry`] records.
///
/// The document must be an array of objects, each with an absolute
/// `http`/`https` `rss_url`. Two entries whose URLs are equal after
/// normalization are rejected rather than processed twice. Blank override
/// strings are treated as absent.
pub fn parse_feed_entries(content: &str) -> Result<Vec<FeedEntry>, ConfigError> {
    let document: serde_json::Value = serde_json::from_str(content)?;
    let serde_json::Value::Array(items) = document else {
        return Err(ConfigError::NotASequence);
    };

    let mut entries = Vec::with_capacity(items.len());
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: "expected an object".into(),
            });
        }
        if item.get("rss_url").is_none() {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: "missing required field `rss_url`".into(),
            });
        }

        let entry: FeedEntry =
            serde_json::from_value(item).map_err(|e| ConfigError::InvalidEntry {
                index,
                reason: e.to_string(),
            })?;
        let entry = tidy_overrides(entry);

        let key = normalized_url(&entry.rss_url).map_err(|reason| ConfigError::InvalidUrl {
            index,
            url: entry.rss_url.clone(),
            reason,
        })?;

        if let Some(&first) = seen.get(&key) {
            return Err(ConfigError::DuplicateUrl {
                index,
                first,
                url: entry.rss_url,
            });
        }
        seen.insert(key, index);
        entries.push(entry);
    }

    Ok(entries)
}

/// Canonical form of a feed URL used for duplicate detection.
///
/// `url::Url` lowercases scheme and host and drops default ports; the path
/// and query stay case-sensitive.
fn normalized_url(raw: &str) -> Result<String, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("unsupported scheme `{scheme}` (only http/https)")),
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err("missing host".into()),
    }
    Ok(url.as_str().to_string())
}

fn tidy_overrides(mut entry: FeedEntry) -> FeedEntry {
    fn non_blank(value: Option<String>) -> Option<String> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    entry.rss_url = entry.rss_url.trim().to_string();
    entry.title = non_blank(entry.title);
    entry.language = non_blank(entry.language);
    entry.country = non_blank(entry.country);
    entry.categories = entry.categories.map(|cats| {
        cats.into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    });
    entry
}
