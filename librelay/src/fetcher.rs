//! Incremental fetch of media-bearing posts for one source

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::rate_limit::RateLimitedCaller;
use crate::remote::{SocialApi, Timeline};
use crate::types::{CandidatePost, MediaItem, MediaKind, PostId};

/// Result of one fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    /// Posts with at least one eligible photo, in remote order
    pub candidates: Vec<CandidatePost>,
    /// Largest post id returned, eligible or not
    pub newest_seen: Option<PostId>,
    /// Posts returned before eligibility filtering
    pub fetched: usize,
}

impl FetchBatch {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub struct SourceFetcher {
    api: Arc<dyn SocialApi>,
}

impl SourceFetcher {
    pub fn new(api: Arc<dyn SocialApi>) -> Self {
        Self { api }
    }

    /// Fetch up to `limit` recent posts of `source` newer than `cursor`
    ///
    /// An unknown source or a page without eligible posts gives an empty
    /// batch. Remote failures that survive the retry policy are returned.
    pub async fn fetch(
        &self,
        caller: &RateLimitedCaller,
        source: &str,
        limit: u32,
        cursor: Option<&PostId>,
    ) -> Result<FetchBatch> {
        let api = self.api.as_ref();

        let user_id = match caller
            .call("resolve_user_id", || api.resolve_user_id(source))
            .await?
        {
            Some(id) => id,
            None => {
                info!("[{}] user not found, nothing to fetch", source);
                return Ok(FetchBatch::default());
            }
        };

        let timeline = caller
            .call("list_recent_posts", || {
                api.list_recent_posts(&user_id, limit, cursor)
            })
            .await?;

        let batch = eligible_posts(timeline);
        debug!(
            "[{}] fetched {} posts, {} with eligible media (cursor: {:?})",
            source,
            batch.fetched,
            batch.candidates.len(),
            cursor.map(|c| c.as_str())
        );

        Ok(batch)
    }
}

/// Cross-reference posts with their media and keep those with a usable photo
pub fn eligible_posts(timeline: Timeline) -> FetchBatch {
    let media_by_key: HashMap<&str, MediaItem> = timeline
        .media
        .iter()
        .map(|m| {
            (
                m.media_key.as_str(),
                MediaItem {
                    url: m.url.clone(),
                    kind: m
                        .kind
                        .as_deref()
                        .map(MediaKind::parse)
                        .unwrap_or_else(|| MediaKind::Other(String::new())),
                    alt_text: m.alt_text.clone(),
                },
            )
        })
        .collect();

    let newest_seen = timeline.posts.iter().map(|p| &p.id).max().cloned();
    let fetched = timeline.posts.len();

    let candidates = timeline
        .posts
        .iter()
        .filter_map(|post| {
            let media: Vec<MediaItem> = post
                .media_keys
                .iter()
                .filter_map(|key| media_by_key.get(key.as_str()))
                .filter(|item| item.is_eligible())
                .cloned()
                .collect();

            (!media.is_empty()).then(|| CandidatePost {
                id: post.id.clone(),
                created_at: post.created_at,
                media,
            })
        })
        .collect();

    FetchBatch {
        candidates,
        newest_seen,
        fetched,
    }
}
