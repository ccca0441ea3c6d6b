//! Parsing helpers for the loosely specified values podcast feeds carry.
//!
//! - **Dates**: RSS/Atom publish dates in their many real-world spellings
//! - **Durations**: `itunes:duration` seconds or clock values
//!
//! # Examples
//!
//! ```
//! use podcast_ingest::util::{parse_duration, parse_pub_date};
//!
//! assert_eq!(parse_duration("1:00:00"), Some(3600));
//! assert!(parse_pub_date("2024-01-03").is_some());
//! ```

mod dates;
mod duration;

pub use dates::parse_pub_date;
pub use duration::parse_duration;
