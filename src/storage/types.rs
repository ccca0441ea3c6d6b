use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Failures talking to the remote store. Never retried by the store client.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Store response did not contain a row id")]
    MissingId,

    #[error("Invalid store response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// Records
// ============================================================================

/// Identifier the store assigned to a podcast row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodcastId(String);

impl PodcastId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PodcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    #[default]
    Full,
    Trailer,
    Bonus,
}

impl EpisodeType {
    /// Reads an `itunes:episodeType` value. Unknown or missing values are
    /// [`EpisodeType::Full`].
    pub fn from_feed(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("trailer") => EpisodeType::Trailer,
            Some("bonus") => EpisodeType::Bonus,
            _ => EpisodeType::Full,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeType::Full => "full",
            EpisodeType::Trailer => "trailer",
            EpisodeType::Bonus => "bonus",
        }
    }
}

impl std::fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A podcast row as written by this crate. `id`, `created_at` and
/// `updated_at` are left to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPodcast {
    pub rss_url: String,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub language: String,
    pub image_url: Option<String>,
    pub categories: Vec<String>,
    pub is_explicit: bool,
    pub country: Option<String>,
    /// Episodes written for this podcast in the current run.
    pub total_episodes: usize,
    pub latest_episode_date: Option<DateTime<Utc>>,
}

/// An episode row as written by this crate. `podcast_id` is attached by the
/// store client once the owning podcast has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEpisode {
    /// Stable identity of the episode within its podcast.
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub duration: Option<u32>,
    pub audio_url: Option<String>,
    pub episode_type: EpisodeType,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub is_explicit: bool,
    pub image_url: Option<String>,
}

/// An episode that the store refused.
#[derive(Debug)]
pub struct EpisodeFailure {
    pub guid: String,
    pub title: String,
    pub error: UpsertError,
}

/// Outcome of writing one podcast's episodes. Individual failures do not
/// stop the rest of the batch.
#[derive(Debug, Default)]
pub struct EpisodeUpsertReport {
    pub upserted: usize,
    pub failures: Vec<EpisodeFailure>,
}

impl EpisodeUpsertReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}
