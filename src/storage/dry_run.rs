use super::types::{EpisodeUpsertReport, NewEpisode, NewPodcast, PodcastId, UpsertError};
use super::PodcastStore;

/// Store that writes nothing. Podcast ids are derived from the feed URL so
/// the rest of the pipeline behaves as it would against a real store.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunStore;

impl PodcastStore for DryRunStore {
    async fn upsert_podcast(&self, podcast: &NewPodcast) -> Result<PodcastId, UpsertError> {
        tracing::info!(
            feed = %podcast.rss_url,
            title = %podcast.title,
            total_episodes = podcast.total_episodes,
            "Dry run: would upsert podcast"
        );
        Ok(PodcastId::new(format!("dry-run:{}", podcast.rss_url)))
    }

    async fn upsert_episodes(
        &self,
        podcast_id: &PodcastId,
        episodes: &[NewEpisode],
    ) -> EpisodeUpsertReport {
        for episode in episodes {
            tracing::debug!(
                podcast_id = %podcast_id,
                guid = %episode.guid,
                title = %episode.title,
                "Dry run: would upsert episode"
            );
        }
        EpisodeUpsertReport {
            upserted: episodes.len(),
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_counts_everything_as_written() {
        let podcast = NewPodcast {
            rss_url: "https://example.com/a.xml".into(),
            title: "Show A".into(),
            description: None,
            author: None,
            language: "en".into(),
            image_url: None,
            categories: Vec::new(),
            is_explicit: false,
            country: None,
            total_episodes: 0,
            latest_episode_date: None,
        };

        let id = DryRunStore.upsert_podcast(&podcast).await.unwrap();
        assert_eq!(id.as_str(), "dry-run:https://example.com/a.xml");

        let report = DryRunStore.upsert_episodes(&id, &[]).await;
        assert_eq!(report.upserted, 0);
        assert_eq!(report.failed(), 0);
    }
}
