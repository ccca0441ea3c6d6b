//! Turns a parsed feed plus its configured entry into store records.
//!
//! Pure: no I/O, no clock. Given the same inputs the output is identical,
//! which is what keeps re-runs idempotent against the store.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::feed::{Enclosure, FeedEntry, ParsedFeed, ParsedItem};
use crate::storage::{EpisodeType, NewEpisode, NewPodcast};
use crate::util::{parse_duration, parse_pub_date};

/// Language written when neither the feed list nor the feed declares one.
pub const DEFAULT_LANGUAGE: &str = "en";
pub const UNTITLED_EPISODE: &str = "Untitled Episode";

/// Store-ready records for one feed.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFeed {
    pub podcast: NewPodcast,
    /// Newest first, at most `max_episodes` long.
    pub episodes: Vec<NewEpisode>,
}

/// Builds the podcast and episode records for `entry` from `parsed`.
///
/// Entry overrides win over channel values, which win over defaults.
/// Episodes are ordered by publish date, newest first, with undated
/// episodes last in document order, then cut to `max_episodes`. Items
/// sharing a guid collapse to the newest one.
pub fn normalize(entry: &FeedEntry, parsed: &ParsedFeed, max_episodes: usize) -> NormalizedFeed {
    let mut episodes: Vec<NewEpisode> = parsed.items.iter().map(episode_from_item).collect();
    sort_newest_first(&mut episodes);

    let mut seen = HashSet::new();
    let before = episodes.len();
    episodes.retain(|episode| seen.insert(episode.guid.clone()));
    if episodes.len() < before {
        tracing::debug!(
            feed = %entry.rss_url,
            dropped = before - episodes.len(),
            "Dropped items with duplicate guids"
        );
    }

    episodes.truncate(max_episodes);

    let channel = &parsed.channel;
    let podcast = NewPodcast {
        rss_url: entry.rss_url.clone(),
        title: entry
            .title
            .clone()
            .unwrap_or_else(|| channel.title.clone()),
        description: channel.description.clone(),
        author: channel.author.clone(),
        language: entry
            .language
            .clone()
            .or_else(|| channel.language.clone())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        image_url: channel.image_url.clone(),
        categories: entry
            .categories
            .clone()
            .unwrap_or_else(|| channel.categories.clone()),
        is_explicit: parse_explicit(channel.explicit.as_deref()),
        country: entry.country.clone(),
        total_episodes: episodes.len(),
        latest_episode_date: episodes.iter().filter_map(|e| e.published_at).max(),
    };

    NormalizedFeed { podcast, episodes }
}

/// Reads an explicit marker. `yes`, `true` and `explicit` are explicit;
/// everything else, including a missing marker, is not.
pub fn parse_explicit(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("yes" | "true" | "explicit")
    )
}

/// First enclosure with an `audio/*` type, else the first enclosure.
fn pick_audio_url(enclosures: &[Enclosure]) -> Option<String> {
    enclosures
        .iter()
        .find(|e| {
            e.mime_type
                .as_deref()
                .is_some_and(|t| t.trim().to_ascii_lowercase().starts_with("audio/"))
        })
        .or_else(|| enclosures.first())
        .map(|e| e.url.clone())
}

/// Feed guid when present. Otherwise a SHA-256 over the audio URL, title and
/// raw publish date, which is stable across runs of an unchanged feed.
fn episode_guid(item: &ParsedItem, audio_url: Option<&str>) -> String {
    if let Some(guid) = item.guid.as_deref().map(str::trim) {
        if !guid.is_empty() {
            return guid.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        audio_url.unwrap_or(""),
        item.title.as_deref().unwrap_or(""),
        item.published.as_deref().unwrap_or("")
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn parse_number(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.trim().parse().ok())
}

fn episode_from_item(item: &ParsedItem) -> NewEpisode {
    let audio_url = pick_audio_url(&item.enclosures);
    NewEpisode {
        guid: episode_guid(item, audio_url.as_deref()),
        title: item
            .title
            .clone()
            .unwrap_or_else(|| UNTITLED_EPISODE.to_string()),
        description: item.description.clone(),
        published_at: item.published.as_deref().and_then(parse_pub_date),
        duration: item.duration.as_deref().and_then(parse_duration),
        audio_url,
        episode_type: EpisodeType::from_feed(item.episode_type.as_deref()),
        season_number: parse_number(item.season.as_deref()),
        episode_number: parse_number(item.episode.as_deref()),
        is_explicit: parse_explicit(item.explicit.as_deref()),
        image_url: item.image_url.clone(),
    }
}

/// Stable: equal dates and undated episodes keep document order.
fn sort_newest_first(episodes: &mut [NewEpisode]) {
    episodes.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
