//! Podcast feed ingestion.
//!
//! Reads a list of podcast feeds, fetches and parses each one, normalizes the
//! channel and its most recent episodes, and upserts them into a
//! PostgREST-compatible store. One invocation is one batch run.

pub mod config;
pub mod feed;
pub mod normalize;
pub mod run;
pub mod storage;
pub mod util;
