//! One relay pass: rotate, fetch, filter, select, download, upload, publish, commit
//!
//! The pipeline is strictly linear. Every stage before the commit is free of
//! persisted side effects, so a run that stops early (for any reason) leaves the
//! history and cursor documents exactly as it found them. The only exception
//! is the cursor-only advance when a source has nothing new to offer.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, info_span, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{MediaError, RelayError, Result};
use crate::fetcher::{FetchBatch, SourceFetcher};
use crate::media::{infer_extension, mime_for_extension, ImageConverter, MediaDownloader};
use crate::rate_limit::{RateLimitedCaller, RetryPolicy};
use crate::remote::SocialApi;
use crate::rotation;
use crate::state::{CursorMap, HistorySet, StateStore};
use crate::types::{CandidatePost, ImageMime, MediaRef, PostId, PublishSurface, SourceIdentity};

/// Per-deployment knobs of a relay pass
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub pool: Vec<SourceIdentity>,
    pub max_posts: u32,
    /// Text prefix; `{orig}` is replaced by the source handle
    pub prefix: String,
    /// Stop after selection, without downloading or writing state
    pub dry_run: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool: config.sources.pool.clone(),
            max_posts: config.sources.max_posts,
            prefix: config.post.prefix.clone(),
            dry_run: false,
        }
    }
}

/// How a pass ended when nothing went wrong
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The source pool is empty
    NoSources,
    /// The source has no eligible posts newer than its cursor
    NothingNew { source: SourceIdentity },
    /// Every eligible post was relayed before
    AllSeen { source: SourceIdentity },
    /// Dry run stopped after choosing a post
    DryRun {
        source: SourceIdentity,
        post_id: PostId,
        text: String,
    },
    Published {
        source: SourceIdentity,
        post_id: PostId,
        published_id: String,
        surface: PublishSurface,
    },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::NoSources => write!(f, "no sources configured"),
            RunOutcome::NothingNew { source } => write!(f, "no new media posts from {}", source),
            RunOutcome::AllSeen { source } => {
                write!(f, "all candidates from {} already relayed", source)
            }
            RunOutcome::DryRun {
                source, post_id, ..
            } => write!(f, "dry run picked {} from {}", post_id, source),
            RunOutcome::Published {
                source,
                post_id,
                published_id,
                surface,
            } => write!(
                f,
                "relayed {} from {} as {} via {} surface",
                post_id, source, published_id, surface
            ),
        }
    }
}

/// Counters reported at the end of every pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub remote_calls: u32,
    pub retries: u32,
    /// Posts returned by the fetch, eligible or not
    pub fetched: usize,
    pub eligible: usize,
    /// Eligible posts not yet in the history
    pub fresh: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stats: RunStats,
}

/// Compose the republished text
pub fn compose_text(prefix: &str, source: &str, post_id: &PostId) -> String {
    format!(
        "{}\nOriginal: https://twitter.com/{}/status/{}\n(Used with permission)",
        prefix.replace("{orig}", source),
        source,
        post_id
    )
}

/// Separate a run-ending quota abort from failures a fallback may recover
fn or_fallback<T>(result: Result<T>) -> Result<std::result::Result<T, RelayError>> {
    match result {
        Err(e) if e.is_quota_abort() => Err(e),
        other => Ok(other),
    }
}

pub struct RelayPipeline {
    api: Arc<dyn SocialApi>,
    downloader: Arc<dyn MediaDownloader>,
    converter: Arc<dyn ImageConverter>,
    fetcher: SourceFetcher,
    caller: RateLimitedCaller,
    store: StateStore,
    settings: PipelineSettings,
    rng: StdRng,
}

impl RelayPipeline {
    pub fn new(
        api: Arc<dyn SocialApi>,
        downloader: Arc<dyn MediaDownloader>,
        converter: Arc<dyn ImageConverter>,
        store: StateStore,
        settings: PipelineSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            fetcher: SourceFetcher::new(api.clone()),
            api,
            downloader,
            converter,
            caller: RateLimitedCaller::new(policy),
            store,
            settings,
            rng: StdRng::from_entropy(),
        }
    }

    /// Build a pipeline whose settings, retry policy and state paths come from `config`
    pub fn from_config(
        api: Arc<dyn SocialApi>,
        downloader: Arc<dyn MediaDownloader>,
        converter: Arc<dyn ImageConverter>,
        config: &Config,
    ) -> Self {
        let store = StateStore::new(config.state.history_file(), config.state.cursor_file());
        Self::new(
            api,
            downloader,
            converter,
            store,
            PipelineSettings::from_config(config),
            config.rate_limit.retry_policy(),
        )
    }

    /// Make candidate selection reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.settings.dry_run = enabled;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one pass at instant `now`
    ///
    /// # Errors
    ///
    /// Any stop after rotation that is not an expected empty outcome:
    /// `QuotaAbort` under the abort policy, surfaced remote failures,
    /// media problems, or a publish that failed on both surfaces. None of
    /// them leave a history entry behind.
    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<RunReport> {
        let span = info_span!(
            "relay_run",
            run_id = %Uuid::new_v4(),
            remote = self.api.name(),
            rate_limit = ?self.caller.policy().on_rate_limit,
            source = tracing::field::Empty
        );

        let calls_before = self.caller.call_count();
        let retries_before = self.caller.retry_count();
        let mut stats = RunStats::default();

        let result = self.run_stages(now, &mut stats).instrument(span.clone()).await;

        stats.remote_calls = self.caller.call_count() - calls_before;
        stats.retries = self.caller.retry_count() - retries_before;

        span.in_scope(|| match &result {
            Ok(outcome) => info!(
                remote_calls = stats.remote_calls,
                retries = stats.retries,
                fetched = stats.fetched,
                eligible = stats.eligible,
                fresh = stats.fresh,
                "Run finished: {}",
                outcome
            ),
            Err(e) => warn!(
                remote_calls = stats.remote_calls,
                retries = stats.retries,
                fetched = stats.fetched,
                eligible = stats.eligible,
                fresh = stats.fresh,
                "Run stopped: {}",
                e
            ),
        });

        result.map(|outcome| RunReport { outcome, stats })
    }

    async fn run_stages(&mut self, now: DateTime<Utc>, stats: &mut RunStats) -> Result<RunOutcome> {
        let Some(source) = rotation::select_source(&self.settings.pool, now).cloned() else {
            info!("No sources configured, nothing to do");
            return Ok(RunOutcome::NoSources);
        };
        Span::current().record("source", source.as_str());
        info!(
            "Slot {} of {} -> using source {}",
            rotation::current_slot(now),
            rotation::SLOT_COUNT,
            source
        );

        let (mut history, mut cursors) = self.store.load();
        info!(
            "Loaded {} history entries and {} cursors",
            history.len(),
            cursors.len()
        );

        // Fetch
        let cursor = cursors.get(&source).cloned();
        let batch = self
            .fetcher
            .fetch(&self.caller, &source, self.settings.max_posts, cursor.as_ref())
            .await?;
        stats.fetched = batch.fetched;
        stats.eligible = batch.candidates.len();

        if batch.is_empty() {
            info!("No new media posts from {}", source);
            let newest = match cursor {
                Some(_) => self.newest_unbounded(&source).await?,
                None => None,
            };
            let newest = newest.into_iter().chain(batch.newest_seen).max();
            if let Some(newest) = newest {
                self.advance_cursor(&mut cursors, &source, &newest);
            }
            return Ok(RunOutcome::NothingNew { source });
        }

        // Filter
        let fresh: Vec<&CandidatePost> = batch
            .candidates
            .iter()
            .filter(|post| !history.contains(&post.id))
            .collect();
        stats.fresh = fresh.len();

        if fresh.is_empty() {
            info!("All {} candidates already relayed", batch.candidates.len());
            if let Some(newest) = &batch.newest_seen {
                self.advance_cursor(&mut cursors, &source, newest);
            }
            return Ok(RunOutcome::AllSeen { source });
        }

        // Select
        let Some(chosen) = fresh.choose(&mut self.rng).map(|post| (*post).clone()) else {
            return Ok(RunOutcome::AllSeen { source });
        };
        info!(
            "Chosen post {} (created at {}) out of {} fresh candidates",
            chosen.id,
            chosen
                .created_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
            fresh.len()
        );

        let text = compose_text(&self.settings.prefix, &source, &chosen.id);

        if self.settings.dry_run {
            info!(
                "Dry run: would relay {} with media {:?} and text {:?}",
                chosen.id,
                chosen.media.first().and_then(|m| m.url.as_deref()),
                text
            );
            return Ok(RunOutcome::DryRun {
                source,
                post_id: chosen.id,
                text,
            });
        }

        let media_url = resolve_media_url(&chosen)?;
        let (bytes, mime) = self.download(&media_url).await?;
        let media = self.upload_with_fallback(&bytes, mime).await?;
        info!("Uploaded media {}", media.media_id);

        let (surface, published_id) = self.publish_with_fallback(&text, &media).await?;

        // Commit
        self.commit(&mut history, &mut cursors, &source, &chosen.id, batch.newest_seen.as_ref());

        Ok(RunOutcome::Published {
            source,
            post_id: chosen.id,
            published_id,
            surface,
        })
    }

    /// Newest post id of the source regardless of its cursor
    ///
    /// Used only to move the cursor, so failures other than a quota abort
    /// are logged and ignored.
    async fn newest_unbounded(&self, source: &str) -> Result<Option<PostId>> {
        match or_fallback(
            self.fetcher
                .fetch(&self.caller, source, self.settings.max_posts, None)
                .await,
        )? {
            Ok(FetchBatch { newest_seen, .. }) => Ok(newest_seen),
            Err(e) => {
                warn!("Cursor refresh for {} failed: {}", source, e);
                Ok(None)
            }
        }
    }

    /// Download into a scoped temp dir that is removed on every exit path
    async fn download(&self, url: &Url) -> Result<(Vec<u8>, ImageMime)> {
        let ext = infer_extension(url);
        let dir = TempDir::new().map_err(MediaError::from)?;
        let dest = dir.path().join(format!("media.{}", ext));

        info!("Downloading media {}", url);
        let size = self.downloader.download(url, &dest).await?;
        let bytes = tokio::fs::read(&dest).await.map_err(MediaError::from)?;
        info!("Downloaded {} bytes", size);

        Ok((bytes, mime_for_extension(&ext)))
    }

    /// Direct upload, then chunked upload, then JPEG conversion and direct upload
    async fn upload_with_fallback(&self, original: &[u8], mime: ImageMime) -> Result<MediaRef> {
        let api = self.api.as_ref();

        let direct_err = match or_fallback(
            self.caller
                .call("upload_media", || api.upload_media(original, mime, false))
                .await,
        )? {
            Ok(media) => return Ok(media),
            Err(e) => e,
        };
        warn!("Direct upload failed: {}. Trying chunked upload", direct_err);

        let chunked_err = match or_fallback(
            self.caller
                .call("upload_media_chunked", || api.upload_media(original, mime, true))
                .await,
        )? {
            Ok(media) => return Ok(media),
            Err(e) => e,
        };
        warn!(
            "Chunked upload failed: {}. Converting to JPEG and retrying",
            chunked_err
        );

        let converted = self.converter.to_jpeg(original).map_err(|e| {
            MediaError::Upload(format!(
                "direct: {}; chunked: {}; conversion: {}",
                direct_err, chunked_err, e
            ))
        })?;

        match or_fallback(
            self.caller
                .call("upload_media", || {
                    api.upload_media(&converted, ImageMime::Jpeg, false)
                })
                .await,
        )? {
            Ok(media) => Ok(media),
            Err(e) => Err(MediaError::Upload(format!(
                "direct: {}; chunked: {}; converted: {}",
                direct_err, chunked_err, e
            ))
            .into()),
        }
    }

    async fn publish_with_fallback(
        &self,
        text: &str,
        media: &MediaRef,
    ) -> Result<(PublishSurface, String)> {
        let api = self.api.as_ref();

        let primary_err = match or_fallback(
            self.caller
                .call("publish", || api.publish(PublishSurface::Primary, text, media))
                .await,
        )? {
            Ok(id) => {
                info!("Published {} on primary surface", id);
                return Ok((PublishSurface::Primary, id));
            }
            Err(e) => e,
        };
        warn!("Primary publish failed: {}. Trying legacy surface", primary_err);

        match or_fallback(
            self.caller
                .call("publish_legacy", || {
                    api.publish(PublishSurface::Legacy, text, media)
                })
                .await,
        )? {
            Ok(id) => {
                info!("Published {} on legacy surface", id);
                Ok((PublishSurface::Legacy, id))
            }
            Err(e) => Err(RelayError::Publish(format!(
                "primary: {}; legacy: {}",
                primary_err, e
            ))),
        }
    }

    fn commit(
        &self,
        history: &mut HistorySet,
        cursors: &mut CursorMap,
        source: &str,
        post_id: &PostId,
        newest_seen: Option<&PostId>,
    ) {
        history.insert(post_id);
        match self.store.save_history(history) {
            Ok(()) => info!("Recorded {} in history", post_id),
            Err(e) => warn!(
                "Failed to save history, {} may be relayed again: {}",
                post_id, e
            ),
        }

        if let Some(newest) = newest_seen {
            self.advance_cursor(cursors, source, newest);
        }
    }

    fn advance_cursor(&self, cursors: &mut CursorMap, source: &str, seen: &PostId) {
        if self.settings.dry_run {
            info!("Dry run: would advance cursor for {} to {}", source, seen);
            return;
        }
        if !cursors.advance(source, seen) {
            return;
        }
        match self.store.save_cursors(cursors) {
            Ok(()) => info!("Cursor for {} advanced to {}", source, seen),
            Err(e) => warn!("Failed to save cursor for {}: {}", source, e),
        }
    }
}

/// First eligible media URL of the post, which must be http(s)
fn resolve_media_url(post: &CandidatePost) -> Result<Url> {
    post.media
        .first()
        .and_then(|item| item.url.as_deref())
        .and_then(|raw| Url::parse(raw).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .ok_or_else(|| MediaError::MissingUrl(post.id.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::media::JpegConverter;
    use crate::remote::mock::{photo_timeline, MockOp, MockSocialApi};
    use crate::types::{MediaItem, MediaKind};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;

    struct FixedDownloader;

    #[async_trait]
    impl MediaDownloader for FixedDownloader {
        async fn download(&self, _url: &Url, dest: &Path) -> std::result::Result<u64, MediaError> {
            tokio::fs::write(dest, b"image-bytes").await?;
            Ok(11)
        }
    }

    fn slot_zero() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap()
    }

    fn pipeline(api: &MockSocialApi, dir: &TempDir) -> RelayPipeline {
        let settings = PipelineSettings {
            pool: vec!["a".to_string()],
            max_posts: 5,
            prefix: "Repost (via @{orig})".to_string(),
            dry_run: false,
        };
        RelayPipeline::new(
            Arc::new(api.clone()),
            Arc::new(FixedDownloader),
            Arc::new(JpegConverter),
            StateStore::new(dir.path().join("history.json"), dir.path().join("cursors.json")),
            settings,
            RetryPolicy::default(),
        )
        .with_seed(7)
    }

    fn candidate(url: Option<&str>) -> CandidatePost {
        CandidatePost {
            id: PostId::from("42"),
            created_at: None,
            media: vec![MediaItem {
                url: url.map(String::from),
                kind: MediaKind::Photo,
                alt_text: None,
            }],
        }
    }

    #[test]
    fn test_compose_text() {
        let text = compose_text("Repost (via @{orig})", "nasa", &PostId::from("1850000000000000000"));
        assert_eq!(
            text,
            "Repost (via @nasa)\nOriginal: https://twitter.com/nasa/status/1850000000000000000\n(Used with permission)"
        );
    }

    #[test]
    fn test_compose_text_without_placeholder() {
        let text = compose_text("Daily pick", "esa", &PostId::from("9"));
        assert!(text.starts_with("Daily pick\nOriginal: https://twitter.com/esa/status/9"));
    }

    #[test]
    fn test_resolve_media_url() {
        let url = resolve_media_url(&candidate(Some("https://pbs.twimg.com/media/a.jpg"))).unwrap();
        assert_eq!(url.host_str(), Some("pbs.twimg.com"));

        for bad in [None, Some("not a url"), Some("ftp://host/a.jpg")] {
            let err = resolve_media_url(&candidate(bad)).unwrap_err();
            assert!(matches!(err, RelayError::Media(MediaError::MissingUrl(ref id)) if id == "42"));
        }
    }

    #[test]
    fn test_or_fallback_only_escalates_quota_abort() {
        let abort: Result<()> = Err(RelayError::QuotaAbort("429".to_string()));
        assert!(or_fallback(abort).is_err());

        let remote: Result<()> =
            Err(RelayError::remote("publish", RemoteError::Fatal("403".to_string())));
        assert!(matches!(or_fallback(remote), Ok(Err(_))));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = RunOutcome::Published {
            source: "a".to_string(),
            post_id: PostId::from("101"),
            published_id: "900".to_string(),
            surface: PublishSurface::Legacy,
        };
        assert_eq!(outcome.to_string(), "relayed 101 from a as 900 via legacy surface");
    }

    #[tokio::test]
    async fn test_empty_pool_is_noop() {
        let dir = TempDir::new().unwrap();
        let api = MockSocialApi::new();
        let mut pipeline = pipeline(&api, &dir);
        pipeline.settings.pool.clear();

        let report = pipeline.run(slot_zero()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::NoSources);
        assert_eq!(report.stats, RunStats::default());
        assert_eq!(api.call_count(MockOp::ResolveUser), 0);
    }

    #[test]
    fn test_settings_follow_builders() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&MockSocialApi::new(), &dir);
        assert!(!pipeline.settings().dry_run);
        assert_eq!(pipeline.settings().pool, vec!["a".to_string()]);

        let pipeline = pipeline.dry_run(true);
        assert!(pipeline.settings().dry_run);
        assert_eq!(pipeline.settings().max_posts, 5);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let api = MockSocialApi::new().with_user("a", "1", photo_timeline(&[101, 102]));
        let mut pipeline = pipeline(&api, &dir).dry_run(true);

        let report = pipeline.run(slot_zero()).await.unwrap();
        match report.outcome {
            RunOutcome::DryRun { source, text, .. } => {
                assert_eq!(source, "a");
                assert!(text.starts_with("Repost (via @a)"));
            }
            other => panic!("Expected dry run outcome, got {:?}", other),
        }
        assert!(api.uploads().is_empty());
        assert!(api.publishes().is_empty());
        assert!(!pipeline.store().history_path().exists());
        assert!(!pipeline.store().cursor_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_stats() {
        let dir = TempDir::new().unwrap();
        let api = MockSocialApi::new()
            .with_user("a", "1", photo_timeline(&[101, 102, 103]))
            .fail_next(MockOp::PublishPrimary, RemoteError::Network("reset".to_string()));
        let mut pipeline = pipeline(&api, &dir);

        let report = pipeline.run(slot_zero()).await.unwrap();

        assert!(matches!(report.outcome, RunOutcome::Published { surface: PublishSurface::Primary, .. }));
        assert_eq!(report.stats.fetched, 3);
        assert_eq!(report.stats.eligible, 3);
        assert_eq!(report.stats.fresh, 3);
        assert_eq!(report.stats.retries, 1);
        // resolve, list, upload, publish twice
        assert_eq!(report.stats.remote_calls, 5);
    }
}
