//! Feed input: the configured feed list, HTTP retrieval and document parsing.
//!
//! - [`source`] - Reads the JSON feed list into validated [`FeedEntry`] records
//! - [`fetcher`] - Single-shot HTTP retrieval with timeout and size limits
//! - [`parser`] - Turns feed bytes into a [`ParsedFeed`]: a streaming
//!   podcast-namespace reader for RSS, `feed-rs` for everything else

mod fetcher;
mod parser;
mod rss;
mod source;

pub use fetcher::{build_client, fetch_feed, FetchError, FetchOptions};
pub use parser::{parse_feed, Enclosure, ParseError, ParsedChannel, ParsedFeed, ParsedItem};
pub use source::{load_feed_entries, parse_feed_entries, FeedEntry};
