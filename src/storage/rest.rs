use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;

use super::types::{
    EpisodeFailure, EpisodeUpsertReport, NewEpisode, NewPodcast, PodcastId, UpsertError,
};
use super::PodcastStore;
use crate::config::StoreCredentials;

/// Episode writes in flight for one podcast.
const EPISODE_CONCURRENCY: usize = 4;
/// Bytes of an error response kept for the log.
const ERROR_BODY_EXCERPT: usize = 300;

const PODCASTS_TABLE: &str = "podcasts";
const EPISODES_TABLE: &str = "episodes";

/// Client for a PostgREST-style store (`{base}/rest/v1/{table}`).
///
/// Podcasts are upserted on `rss_url`, episodes on `(podcast_id, guid)`.
/// Requests carry a fixed timeout and are never retried here.
#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    credentials: StoreCredentials,
    timeout: Duration,
}

#[derive(Serialize)]
struct EpisodeRow<'a> {
    podcast_id: &'a PodcastId,
    #[serde(flatten)]
    episode: &'a NewEpisode,
}

impl RestStore {
    pub fn new(client: reqwest::Client, credentials: StoreCredentials, timeout: Duration) -> Self {
        Self {
            client,
            credentials,
            timeout,
        }
    }

    /// `{base}/rest/v1/{table}?on_conflict={columns}`. Any path on the base
    /// URL is kept as a prefix.
    fn table_url(&self, table: &str, on_conflict: &str) -> url::Url {
        let mut url = self.credentials.base_url.clone();
        let path = format!("{}/rest/v1/{}", url.path().trim_end_matches('/'), table);
        url.set_path(&path);
        url.set_query(None);
        url.query_pairs_mut().append_pair("on_conflict", on_conflict);
        url
    }

    /// POSTs one row with merge-on-conflict semantics.
    async fn post_row<T: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
        return_representation: bool,
    ) -> Result<reqwest::Response, UpsertError> {
        let prefer = if return_representation {
            "resolution=merge-duplicates,return=representation"
        } else {
            "resolution=merge-duplicates,return=minimal"
        };
        let key = self.credentials.expose_key();

        let request = self
            .client
            .post(self.table_url(table, on_conflict))
            .header("apikey", key)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
            .header("Prefer", prefer)
            .json(row);

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| UpsertError::Timeout(self.timeout))?
            .map_err(UpsertError::Network)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = tokio::time::timeout(self.timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(UpsertError::HttpStatus {
                status,
                body: body.chars().take(ERROR_BODY_EXCERPT).collect(),
            });
        }

        Ok(response)
    }

    async fn upsert_episode(
        &self,
        podcast_id: &PodcastId,
        episode: &NewEpisode,
    ) -> Result<(), UpsertError> {
        let row = EpisodeRow {
            podcast_id,
            episode,
        };
        self.post_row(EPISODES_TABLE, "podcast_id,guid", &row, false)
            .await
            .map(|_| ())
    }
}

/// Pulls the row id out of a `return=representation` body, which PostgREST
/// sends as an array of rows.
fn extract_id(body: &serde_json::Value) -> Result<PodcastId, UpsertError> {
    let row = match body {
        serde_json::Value::Array(rows) => rows.first().ok_or(UpsertError::MissingId)?,
        serde_json::Value::Object(_) => body,
        other => {
            return Err(UpsertError::InvalidResponse(format!(
                "expected a row, got {other}"
            )))
        }
    };

    match row.get("id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(PodcastId::new(id.as_str())),
        Some(serde_json::Value::Number(id)) => Ok(PodcastId::new(id.to_string())),
        _ => Err(UpsertError::MissingId),
    }
}

impl PodcastStore for RestStore {
    async fn upsert_podcast(&self, podcast: &NewPodcast) -> Result<PodcastId, UpsertError> {
        let response = self
            .post_row(PODCASTS_TABLE, "rss_url", podcast, true)
            .await?;

        let body: serde_json::Value = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| UpsertError::Timeout(self.timeout))?
            .map_err(|e| UpsertError::InvalidResponse(e.to_string()))?;

        let id = extract_id(&body)?;
        tracing::debug!(feed = %podcast.rss_url, podcast_id = %id, "Podcast upserted");
        Ok(id)
    }

    async fn upsert_episodes(
        &self,
        podcast_id: &PodcastId,
        episodes: &[NewEpisode],
    ) -> EpisodeUpsertReport {
        // Indices keep the closure free of higher-ranked borrows, which the
        // `Send` bound on this future cannot express.
        let results: Vec<_> = stream::iter(0..episodes.len())
            .map(|index| {
                let episode = &episodes[index];
                async move { (episode, self.upsert_episode(podcast_id, episode).await) }
            })
            .buffer_unordered(EPISODE_CONCURRENCY)
            .collect()
            .await;

        let mut report = EpisodeUpsertReport::default();
        for (episode, result) in results {
            match result {
                Ok(()) => report.upserted += 1,
                Err(error) => {
                    tracing::warn!(
                        podcast_id = %podcast_id,
                        guid = %episode.guid,
                        title = %episode.title,
                        error = %error,
                        "Failed to upsert episode"
                    );
                    report.failures.push(EpisodeFailure {
                        guid: episode.guid.clone(),
                        title: episode.title.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}
