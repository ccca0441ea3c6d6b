//! Drives one ingestion run over the configured feed list.
//!
//! Every feed is an isolated unit of work: fetch, parse, normalize, then
//! write the podcast and its episodes. A failure anywhere in that chain is
//! captured as a [`FeedError`] for that feed only and the run moves on.

use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{FailurePolicy, Settings};
use crate::feed::{fetch_feed, parse_feed, FeedEntry, FetchError, FetchOptions, ParseError};
use crate::normalize::{normalize, NormalizedFeed};
use crate::storage::{PodcastId, PodcastStore, UpsertError};

// ============================================================================
// Error Types
// ============================================================================

/// Why a single feed was not ingested.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Upsert(#[from] UpsertError),

    #[error("Run deadline reached before the feed finished")]
    DeadlineExceeded,
}

impl FeedError {
    /// Stable name of the failure class, used in status output.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Fetch(_) => "FetchError",
            FeedError::Parse(_) => "ParseError",
            FeedError::Upsert(_) => "UpsertError",
            FeedError::DeadlineExceeded => "DeadlineExceeded",
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// What a successfully ingested feed produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedReport {
    pub podcast_id: PodcastId,
    pub title: String,
    pub episodes_upserted: usize,
    pub episode_failures: usize,
}

#[derive(Debug)]
pub struct FeedOutcome {
    pub rss_url: String,
    pub label: String,
    pub result: Result<FeedReport, FeedError>,
}

impl FeedOutcome {
    /// One human-readable line: `ok` or `FAILED` plus details.
    pub fn status_line(&self) -> String {
        match &self.result {
            Ok(report) if report.episode_failures > 0 => format!(
                "ok      {} ({} episodes, {} failed)",
                report.title, report.episodes_upserted, report.episode_failures
            ),
            Ok(report) => format!(
                "ok      {} ({} episodes)",
                report.title, report.episodes_upserted
            ),
            Err(e) => format!("FAILED  {}: {}: {}", self.label, e.kind(), e),
        }
    }
}

/// Outcomes of a run, in feed list order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<FeedOutcome>,
}

impl RunSummary {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    pub fn episodes_upserted(&self) -> usize {
        self.reports().map(|r| r.episodes_upserted).sum()
    }

    pub fn episode_failures(&self) -> usize {
        self.reports().map(|r| r.episode_failures).sum()
    }

    fn reports(&self) -> impl Iterator<Item = &FeedReport> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Failed feeds with their error.
    pub fn failures(&self) -> impl Iterator<Item = (&FeedOutcome, &FeedError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o, e)))
    }

    /// e.g. `4/5 podcasts processed, 247 episodes upserted, 1 failures`
    pub fn summary_line(&self) -> String {
        format!(
            "{}/{} podcasts processed, {} episodes upserted, {} failures",
            self.succeeded(),
            self.attempted(),
            self.episodes_upserted(),
            self.failed()
        )
    }

    pub fn is_success(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::AnySuccess => self.attempted() == 0 || self.succeeded() > 0,
            FailurePolicy::AllOrNothing => self.failed() == 0,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Knobs for [`Orchestrator`], usually taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Feeds processed at once. 1 = sequential.
    pub concurrency: usize,
    pub max_episodes: usize,
    pub max_items_per_feed: usize,
    pub fetch: FetchOptions,
    /// Total fetch attempts per feed for transient failures.
    pub fetch_attempts: u32,
    /// Delay before the first retry; doubles after each one.
    pub retry_backoff: Duration,
    /// Minimum gap between two feed starts.
    pub feed_delay: Duration,
    /// Wall-clock budget for the whole run.
    pub run_deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency,
            max_episodes: settings.max_episodes_per_podcast,
            max_items_per_feed: settings.max_items_per_feed,
            fetch: FetchOptions {
                timeout: settings.fetch_timeout(),
                max_bytes: settings.max_feed_bytes,
            },
            fetch_attempts: settings.fetch_attempts,
            retry_backoff: settings.retry_backoff(),
            feed_delay: settings.feed_delay(),
            run_deadline: settings.run_deadline(),
        }
    }
}

/// Spaces feed starts at least `interval` apart across all workers.
struct StartPacer {
    interval: Duration,
    next: tokio::sync::Mutex<Option<Instant>>,
}

impl StartPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: tokio::sync::Mutex::new(None),
        }
    }

    /// Waits until this caller may start. Waiters are served in arrival order.
    async fn wait_turn(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut next = self.next.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(Instant::now() + self.interval);
    }
}

pub struct Orchestrator<S> {
    client: reqwest::Client,
    store: S,
    options: RunOptions,
}

impl<S: PodcastStore> Orchestrator<S> {
    pub fn new(client: reqwest::Client, store: S, options: RunOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Processes every entry and reports outcomes in input order.
    ///
    /// Up to `concurrency` feeds are in flight at once, and consecutive feed
    /// starts are at least `feed_delay` apart. A feed still running
    /// when the run deadline passes is abandoned with
    /// [`FeedError::DeadlineExceeded`]; feeds not yet started by then fail
    /// the same way without touching the network.
    pub async fn run(&self, entries: &[FeedEntry]) -> RunSummary {
        if entries.is_empty() {
            tracing::info!("Feed list is empty, nothing to do");
            return RunSummary::default();
        }

        let deadline = self.options.run_deadline.map(|budget| Instant::now() + budget);
        let concurrency = self.options.concurrency.max(1);
        let pacer = &StartPacer::new(self.options.feed_delay);
        tracing::info!(feeds = entries.len(), concurrency, "Starting ingestion run");

        let mut indexed: Vec<(usize, FeedOutcome)> = stream::iter(entries.iter().enumerate())
            .map(|(index, entry)| async move {
                let work = async {
                    pacer.wait_turn().await;
                    self.process_feed(entry).await
                };
                let result = match deadline {
                    Some(deadline) if Instant::now() >= deadline => {
                        Err(FeedError::DeadlineExceeded)
                    }
                    Some(deadline) => tokio::time::timeout_at(deadline, work)
                        .await
                        .unwrap_or(Err(FeedError::DeadlineExceeded)),
                    None => work.await,
                };

                match &result {
                    Ok(report) => tracing::info!(
                        feed = %entry.rss_url,
                        title = %report.title,
                        episodes = report.episodes_upserted,
                        episode_failures = report.episode_failures,
                        "Feed ingested"
                    ),
                    Err(e) => tracing::warn!(
                        feed = %entry.rss_url,
                        kind = e.kind(),
                        error = %e,
                        "Feed failed"
                    ),
                }

                let outcome = FeedOutcome {
                    rss_url: entry.rss_url.clone(),
                    label: entry.label().to_string(),
                    result,
                };
                (index, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        let summary = RunSummary {
            outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
        };

        tracing::info!(
            attempted = summary.attempted(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            episodes = summary.episodes_upserted(),
            episode_failures = summary.episode_failures(),
            "Ingestion run finished"
        );
        summary
    }

    async fn process_feed(&self, entry: &FeedEntry) -> Result<FeedReport, FeedError> {
        let bytes = self.fetch_with_retry(&entry.rss_url).await?;
        let parsed = parse_feed(&bytes, self.options.max_items_per_feed)?;

        let NormalizedFeed { podcast, episodes } =
            normalize(entry, &parsed, self.options.max_episodes);
        let podcast_id = self.store.upsert_podcast(&podcast).await?;
        let report = self.store.upsert_episodes(&podcast_id, &episodes).await;

        Ok(FeedReport {
            podcast_id,
            title: podcast.title,
            episodes_upserted: report.upserted,
            episode_failures: report.failed(),
        })
    }

    /// Fetches with exponential backoff on transient errors.
    async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1;
        let mut delay = self.options.retry_backoff;

        loop {
            match fetch_feed(&self.client, url, &self.options.fetch).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.options.fetch_attempts => {
                    tracing::debug!(
                        feed = %url,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying feed fetch after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EpisodeUpsertReport, NewEpisode, NewPodcast};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SHOW_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Show</title>
    <item><guid>e1</guid><title>One</title><pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate></item>
    <item><guid>e2</guid><title>Two</title><pubDate>Tue, 02 Jan 2024 00:00:00 +0000</pubDate></item>
  </channel>
</rss>"#;

    /// Records writes; returns `id:{rss_url}` for every podcast.
    #[derive(Default)]
    struct RecordingStore {
        podcasts: Mutex<Vec<NewPodcast>>,
        fail_podcasts: bool,
    }

    impl PodcastStore for RecordingStore {
        async fn upsert_podcast(&self, podcast: &NewPodcast) -> Result<PodcastId, UpsertError> {
            if self.fail_podcasts {
                return Err(UpsertError::HttpStatus {
                    status: 500,
                    body: "down".into(),
                });
            }
            self.podcasts.lock().unwrap().push(podcast.clone());
            Ok(PodcastId::new(format!("id:{}", podcast.rss_url)))
        }

        async fn upsert_episodes(
            &self,
            _podcast_id: &PodcastId,
            episodes: &[NewEpisode],
        ) -> EpisodeUpsertReport {
            EpisodeUpsertReport {
                upserted: episodes.len(),
                failures: Vec::new(),
            }
        }
    }

    fn fast_options() -> RunOptions {
        RunOptions {
            fetch_attempts: 1,
            retry_backoff: Duration::ZERO,
            feed_delay: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    async fn mount_feed(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_empty_feed_list_is_successful_noop() {
        let orchestrator =
            Orchestrator::new(reqwest::Client::new(), RecordingStore::default(), fast_options());
        let summary = orchestrator.run(&[]).await;

        assert_eq!(summary.attempted(), 0);
        assert_eq!(summary.summary_line(), "0/0 podcasts processed, 0 episodes upserted, 0 failures");
        assert!(summary.is_success(FailurePolicy::AnySuccess));
        assert!(summary.is_success(FailurePolicy::AllOrNothing));
    }

    #[tokio::test]
    async fn test_outcomes_keep_input_order_under_concurrency() {
        let server = MockServer::start().await;
        for i in 0..4 {
            Mock::given(method("GET"))
                .and(path(format!("/{i}.xml")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(SHOW_RSS)
                        .set_delay(Duration::from_millis(40 * (4 - i))),
                )
                .mount(&server)
                .await;
        }
        let entries: Vec<_> = (0..4)
            .map(|i| FeedEntry::new(format!("{}/{i}.xml", server.uri())))
            .collect();

        let options = RunOptions {
            concurrency: 4,
            ..fast_options()
        };
        let orchestrator = Orchestrator::new(reqwest::Client::new(), RecordingStore::default(), options);
        let summary = orchestrator.run(&entries).await;

        let urls: Vec<_> = summary.outcomes.iter().map(|o| o.rss_url.clone()).collect();
        let expected: Vec<_> = entries.iter().map(|e| e.rss_url.clone()).collect();
        assert_eq!(urls, expected);
        assert_eq!(summary.succeeded(), 4);
        assert_eq!(summary.episodes_upserted(), 8);
    }

    #[tokio::test]
    async fn test_transient_fetch_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.xml"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_feed(&server, "/flaky.xml", SHOW_RSS).await;

        let options = RunOptions {
            fetch_attempts: 3,
            ..fast_options()
        };
        let orchestrator = Orchestrator::new(reqwest::Client::new(), RecordingStore::default(), options);
        let summary = orchestrator
            .run(&[FeedEntry::new(format!("{}/flaky.xml", server.uri()))])
            .await;

        assert_eq!(summary.succeeded(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_fetch_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let options = RunOptions {
            fetch_attempts: 3,
            ..fast_options()
        };
        let orchestrator = Orchestrator::new(reqwest::Client::new(), RecordingStore::default(), options);
        let summary = orchestrator
            .run(&[FeedEntry::new(format!("{}/gone.xml", server.uri()))])
            .await;

        let (_, error) = summary.failures().next().unwrap();
        assert!(matches!(error, FeedError::Fetch(FetchError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn test_store_failure_is_upsert_error() {
        let server = MockServer::start().await;
        mount_feed(&server, "/a.xml", SHOW_RSS).await;

        let store = RecordingStore {
            fail_podcasts: true,
            ..RecordingStore::default()
        };
        let orchestrator = Orchestrator::new(reqwest::Client::new(), store, fast_options());
        let summary = orchestrator
            .run(&[FeedEntry::new(format!("{}/a.xml", server.uri()))])
            .await;

        let outcome = &summary.outcomes[0];
        assert_eq!(outcome.result.as_ref().unwrap_err().kind(), "UpsertError");
        assert!(outcome.status_line().starts_with("FAILED"));
        assert!(!summary.is_success(FailurePolicy::AnySuccess));
    }

    #[tokio::test]
    async fn test_run_deadline_fails_slow_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(SHOW_RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let options = RunOptions {
            run_deadline: Some(Duration::from_millis(100)),
            ..fast_options()
        };
        let orchestrator = Orchestrator::new(reqwest::Client::new(), RecordingStore::default(), options);
        let entries = vec![
            FeedEntry::new(format!("{}/a.xml", server.uri())),
            FeedEntry::new(format!("{}/b.xml", server.uri())),
        ];
        let summary = orchestrator.run(&entries).await;

        assert_eq!(summary.failed(), 2);
        for (_, error) in summary.failures() {
            assert_eq!(error.kind(), "DeadlineExceeded");
        }
    }

    #[test]
    fn test_failure_policies() {
        let ok = || FeedOutcome {
            rss_url: "https://example.com/ok.xml".into(),
            label: "ok".into(),
            result: Ok(FeedReport {
                podcast_id: PodcastId::new("1"),
                title: "Ok".into(),
                episodes_upserted: 3,
                episode_failures: 1,
            }),
        };
        let failed = || FeedOutcome {
            rss_url: "https://example.com/bad.xml".into(),
            label: "bad".into(),
            result: Err(FeedError::Parse(ParseError::MissingTitle)),
        };

        let mixed = RunSummary {
            outcomes: vec![ok(), failed()],
        };
        assert!(mixed.is_success(FailurePolicy::AnySuccess));
        assert!(!mixed.is_success(FailurePolicy::AllOrNothing));
        assert_eq!(mixed.summary_line(), "1/2 podcasts processed, 3 episodes upserted, 1 failures");
        assert_eq!(mixed.episode_failures(), 1);
        assert_eq!(mixed.outcomes[0].status_line(), "ok      Ok (3 episodes, 1 failed)");
        assert_eq!(
            mixed.outcomes[1].status_line(),
            "FAILED  bad: ParseError: Feed has no channel title"
        );

        let all_failed = RunSummary {
            outcomes: vec![failed()],
        };
        assert!(!all_failed.is_success(FailurePolicy::AnySuccess));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_feed_starts() {
        let pacer = StartPacer::new(Duration::from_secs(1));
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait_turn().await;
        }
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_shared_by_concurrent_workers() {
        let pacer = StartPacer::new(Duration::from_millis(500));
        let started = Instant::now();
        let mut starts: Vec<Duration> = stream::iter(0..4)
            .map(|_| async {
                pacer.wait_turn().await;
                started.elapsed()
            })
            .buffer_unordered(4)
            .collect()
            .await;
        starts.sort();
        assert_eq!(
            starts,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_never_waits() {
        let pacer = StartPacer::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait_turn().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
