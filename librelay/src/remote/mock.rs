//! Mock remote API for testing
//!
//! [`MockSocialApi`] keeps users and timelines in memory and can be scripted
//! to fail specific operations, either for the next N calls or permanently.
//! It records every upload and publish so tests can check exactly which
//! bytes and text reached the remote.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{RemoteError, RemoteResult};
use crate::remote::{SocialApi, Timeline, TimelineMedia, TimelinePost};
use crate::types::{ImageMime, MediaRef, PostId, PublishSurface};

/// Operations that can be scripted and counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ResolveUser,
    ListPosts,
    UploadDirect,
    UploadChunked,
    PublishPrimary,
    PublishLegacy,
}

/// An upload that reached the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub bytes: Vec<u8>,
    pub mime: ImageMime,
    pub chunked: bool,
}

/// A publish that reached the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub surface: PublishSurface,
    pub text: String,
    pub media: MediaRef,
}

#[derive(Default)]
struct MockState {
    users: HashMap<String, String>,
    timelines: HashMap<String, Timeline>,
    queued_failures: HashMap<MockOp, VecDeque<RemoteError>>,
    permanent_failures: HashMap<MockOp, RemoteError>,
    call_counts: HashMap<MockOp, usize>,
    list_since: Vec<Option<PostId>>,
    uploads: Vec<RecordedUpload>,
    publishes: Vec<RecordedPublish>,
    next_id: u64,
}

/// In-memory [`SocialApi`]
///
/// Cloning shares the underlying state, so a test can keep a handle while
/// the pipeline owns another.
#[derive(Clone, Default)]
pub struct MockSocialApi {
    state: Arc<Mutex<MockState>>,
}

impl MockSocialApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle and its timeline
    pub fn with_user(self, handle: &str, user_id: &str, timeline: Timeline) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.users.insert(handle.to_string(), user_id.to_string());
            state.timelines.insert(user_id.to_string(), timeline);
        }
        self
    }

    /// Fail the next call of `op` with `error` (queued failures run in order)
    pub fn fail_next(self, op: MockOp, error: RemoteError) -> Self {
        self.state
            .lock()
            .unwrap()
            .queued_failures
            .entry(op)
            .or_default()
            .push_back(error);
        self
    }

    /// Fail every call of `op` with `error`
    pub fn fail_always(self, op: MockOp, error: RemoteError) -> Self {
        self.state
            .lock()
            .unwrap()
            .permanent_failures
            .insert(op, error);
        self
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state
            .lock()
            .unwrap()
            .call_counts
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// `since` argument of each list call, in order
    pub fn list_cursors(&self) -> Vec<Option<PostId>> {
        self.state.lock().unwrap().list_since.clone()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.state.lock().unwrap().publishes.clone()
    }

    /// Count the call and pop the scripted failure for it, if any
    fn begin(&self, op: MockOp) -> RemoteResult<()> {
        let mut state = self.state.lock().unwrap();
        *state.call_counts.entry(op).or_insert(0) += 1;

        if let Some(error) = state
            .queued_failures
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        if let Some(error) = state.permanent_failures.get(&op) {
            return Err(error.clone());
        }
        Ok(())
    }
}

/// A timeline where each id carries one photo
pub fn photo_timeline(ids: &[u64]) -> Timeline {
    let mut timeline = Timeline::default();
    for id in ids.iter().rev() {
        let key = format!("3_{}", id);
        timeline.posts.push(TimelinePost {
            id: PostId::from(*id),
            created_at: None,
            media_keys: vec![key.clone()],
        });
        timeline.media.push(TimelineMedia {
            media_key: key,
            kind: Some("photo".to_string()),
            url: Some(format!("https://media.example/{}.png", id)),
            alt_text: None,
        });
    }
    timeline
}

#[async_trait]
impl SocialApi for MockSocialApi {
    async fn resolve_user_id(&self, handle: &str) -> RemoteResult<Option<String>> {
        self.begin(MockOp::ResolveUser)?;
        Ok(self.state.lock().unwrap().users.get(handle).cloned())
    }

    async fn list_recent_posts(
        &self,
        user_id: &str,
        limit: u32,
        since: Option<&PostId>,
    ) -> RemoteResult<Timeline> {
        self.state.lock().unwrap().list_since.push(since.cloned());
        self.begin(MockOp::ListPosts)?;

        let state = self.state.lock().unwrap();
        let Some(full) = state.timelines.get(user_id) else {
            return Ok(Timeline::default());
        };

        let mut posts: Vec<TimelinePost> = full
            .posts
            .iter()
            .filter(|p| since.map_or(true, |s| &p.id > s))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.id.cmp(&a.id));
        posts.truncate(limit as usize);

        let media = full
            .media
            .iter()
            .filter(|m| posts.iter().any(|p| p.media_keys.contains(&m.media_key)))
            .cloned()
            .collect();

        Ok(Timeline { posts, media })
    }

    async fn upload_media(
        &self,
        bytes: &[u8],
        mime: ImageMime,
        chunked: bool,
    ) -> RemoteResult<MediaRef> {
        let op = if chunked {
            MockOp::UploadChunked
        } else {
            MockOp::UploadDirect
        };
        self.begin(op)?;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let media_id = format!("media-{}", state.next_id);
        state.uploads.push(RecordedUpload {
            bytes: bytes.to_vec(),
            mime,
            chunked,
        });

        Ok(MediaRef { media_id })
    }

    async fn publish(
        &self,
        surface: PublishSurface,
        text: &str,
        media: &MediaRef,
    ) -> RemoteResult<String> {
        let op = match surface {
            PublishSurface::Primary => MockOp::PublishPrimary,
            PublishSurface::Legacy => MockOp::PublishLegacy,
        };
        self.begin(op)?;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let post_id = format!("published-{}", state.next_id);
        state.publishes.push(RecordedPublish {
            surface,
            text: text.to_string(),
            media: media.clone(),
        });

        Ok(post_id)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
