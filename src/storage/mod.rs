//! Remote persistence of podcasts and episodes.
//!
//! [`PodcastStore`] is the seam the run orchestrator writes through.
//! [`RestStore`] talks to a PostgREST-compatible endpoint; [`DryRunStore`]
//! only logs what would have been written.

mod dry_run;
mod rest;
mod types;

use std::future::Future;

pub use dry_run::DryRunStore;
pub use rest::RestStore;
pub use types::{
    EpisodeFailure, EpisodeType, EpisodeUpsertReport, NewEpisode, NewPodcast, PodcastId,
    UpsertError,
};

/// Idempotent writes keyed by natural identity: a podcast by `rss_url`, an
/// episode by `(podcast_id, guid)`. Writing the same record twice updates
/// it in place.
pub trait PodcastStore: Send + Sync {
    /// Creates or updates the podcast and returns its store id.
    fn upsert_podcast(
        &self,
        podcast: &NewPodcast,
    ) -> impl Future<Output = Result<PodcastId, UpsertError>> + Send;

    /// Writes every episode independently. A refused episode is recorded in
    /// the report and does not stop the others.
    fn upsert_episodes(
        &self,
        podcast_id: &PodcastId,
        episodes: &[NewEpisode],
    ) -> impl Future<Output = EpisodeUpsertReport> + Send;
}
