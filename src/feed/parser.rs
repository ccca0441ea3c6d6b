use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use thiserror::Error;

use super::rss;
use crate::util::parse_pub_date;

/// Errors produced when a fetched document is not a usable feed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not well-formed XML, or not a recognizable RSS/Atom/JSON feed.
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// The channel has no title (or only whitespace).
    #[error("Feed has no channel title")]
    MissingTitle,
}

/// A parsed feed document: channel metadata plus its items in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub channel: ParsedChannel,
    pub items: Vec<ParsedItem>,
    /// Items present in the document, including those past the item limit.
    pub items_seen: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChannel {
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub language: Option<String>,
    /// Raw explicit marker (`yes`, `true`, `clean`, ...).
    pub explicit: Option<String>,
    /// Flattened category terms, first-seen order, no duplicates.
    pub categories: Vec<String>,
}

/// One feed item. Values are kept as the feed spelled them; interpretation
/// happens in the normalizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedItem {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Raw publish date string.
    pub published: Option<String>,
    pub enclosures: Vec<Enclosure>,
    /// Raw duration (`3600`, `1:00:00`, ...).
    pub duration: Option<String>,
    pub season: Option<String>,
    pub episode: Option<String>,
    pub episode_type: Option<String>,
    pub explicit: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: Option<String>,
    pub length: Option<u64>,
}

/// Parses a feed document, keeping at most `item_limit` items: the newest by
/// publish date, returned in document order.
///
/// Documents rooted at `<rss>` go through the streaming podcast reader so
/// the iTunes extension fields survive and only the retained items are held
/// in memory. Atom, JSON Feed and RSS 1.0 documents are converted from the
/// generic `feed-rs` model.
///
/// # Errors
///
/// - [`ParseError::Malformed`] if the bytes are not a recognizable feed
/// - [`ParseError::MissingTitle`] if the channel has no title
pub fn parse_feed(bytes: &[u8], item_limit: usize) -> Result<ParsedFeed, ParseError> {
    let parsed = if rss::is_rss_document(bytes) {
        rss::read_rss(bytes, item_limit)?
    } else {
        let feed = parser::parse(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
        from_feed_model(feed, item_limit)
    };

    if parsed.channel.title.trim().is_empty() {
        return Err(ParseError::MissingTitle);
    }

    if parsed.items_seen > parsed.items.len() {
        tracing::debug!(
            title = %parsed.channel.title,
            seen = parsed.items_seen,
            kept = parsed.items.len(),
            "Feed items beyond limit dropped"
        );
    }

    Ok(parsed)
}

/// Bounded set of the newest items seen so far.
///
/// Items are ranked by parsed publish date; undated items rank oldest and,
/// among equal ranks, the later document position is evicted first.
pub(super) struct ItemWindow {
    limit: usize,
    kept: BinaryHeap<Reverse<Ranked>>,
    seen: usize,
}

struct Ranked {
    published: Option<DateTime<Utc>>,
    position: usize,
    item: ParsedItem,
}

impl Ranked {
    fn key(&self) -> (Option<DateTime<Utc>>, Reverse<usize>) {
        (self.published, Reverse(self.position))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl ItemWindow {
    pub(super) fn new(limit: usize) -> Self {
        Self {
            limit,
            kept: BinaryHeap::with_capacity(limit.min(1024)),
            seen: 0,
        }
    }

    pub(super) fn push(&mut self, item: ParsedItem) {
        let ranked = Ranked {
            published: item.published.as_deref().and_then(parse_pub_date),
            position: self.seen,
            item,
        };
        self.seen += 1;

        if self.kept.len() < self.limit {
            self.kept.push(Reverse(ranked));
        } else if let Some(mut oldest) = self.kept.peek_mut() {
            if ranked > oldest.0 {
                *oldest = Reverse(ranked);
            }
        }
    }

    /// Returns the kept items in document order and the number seen.
    pub(super) fn finish(self) -> (Vec<ParsedItem>, usize) {
        let mut kept: Vec<Ranked> = self.kept.into_iter().map(|Reverse(r)| r).collect();
        kept.sort_by_key(|r| r.position);
        (kept.into_iter().map(|r| r.item).collect(), self.seen)
    }
}

/// Trims `value`, mapping blank strings to `None`.
pub(super) fn clean(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Appends `term` unless an identical (case-sensitive) term is present.
pub(super) fn push_category(categories: &mut Vec<String>, term: &str) {
    if let Some(term) = clean(term) {
        if !categories.contains(&term) {
            categories.push(term);
        }
    }
}

fn from_feed_model(feed: Feed, item_limit: usize) -> ParsedFeed {
    let mut categories = Vec::new();
    for category in &feed.categories {
        push_category(
            &mut categories,
            category.label.as_deref().unwrap_or(&category.term),
        );
    }

    let channel = ParsedChannel {
        title: feed
            .title
            .as_ref()
            .and_then(|t| clean(&t.content))
            .unwrap_or_default(),
        description: feed.description.as_ref().and_then(|t| clean(&t.content)),
        author: feed.authors.first().and_then(|p| clean(&p.name)),
        image_url: feed
            .logo
            .as_ref()
            .or(feed.icon.as_ref())
            .and_then(|image| clean(&image.uri)),
        language: feed.language.as_deref().and_then(clean),
        explicit: None,
        categories,
    };

    let mut window = ItemWindow::new(item_limit);
    for entry in feed.entries {
        window.push(item_from_entry(entry));
    }
    let (items, items_seen) = window.finish();

    ParsedFeed {
        channel,
        items,
        items_seen,
    }
}

fn item_from_entry(entry: Entry) -> ParsedItem {
    let mut enclosures: Vec<Enclosure> = entry
        .links
        .iter()
        .filter(|link| link.rel.as_deref() == Some("enclosure"))
        .filter_map(|link| {
            clean(&link.href).map(|url| Enclosure {
                url,
                mime_type: link.media_type.clone(),
                length: None,
            })
        })
        .collect();

    let mut duration = None;
    for media in &entry.media {
        if duration.is_none() {
            duration = media.duration.map(|d| d.as_secs().to_string());
        }
        for content in &media.content {
            if let Some(url) = &content.url {
                if enclosures.iter().all(|e| e.url != url.as_str()) {
                    enclosures.push(Enclosure {
                        url: url.to_string(),
                        mime_type: content.content_type.as_ref().map(|m| m.to_string()),
                        length: content.size,
                    });
                }
            }
        }
    }

    ParsedItem {
        guid: clean(&entry.id),
        title: entry.title.as_ref().and_then(|t| clean(&t.content)),
        description: entry
            .summary
            .as_ref()
            .and_then(|s| clean(&s.content))
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref().and_then(clean))),
        published: entry
            .published
            .or(entry.updated)
            .map(|dt| dt.to_rfc3339()),
        enclosures,
        duration,
        ..ParsedItem::default()
    }
}
