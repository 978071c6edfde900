//! Remote social-media API abstraction
//!
//! [`SocialApi`] is the capability surface the relay needs from the remote:
//! resolving a handle, listing recent posts with their media, uploading media
//! and publishing. Implementations report failures as [`RemoteError`] and
//! leave retry decisions to [`crate::rate_limit::RateLimitedCaller`].
//!
//! # Examples
//!
//! ```no_run
//! use librelay::remote::{SocialApi, x::{XClient, XCredentials}};
//! use std::time::Duration;
//!
//! # async fn example(credentials: XCredentials) -> Result<(), Box<dyn std::error::Error>> {
//! let client = XClient::new(credentials, Duration::from_secs(30))?;
//!
//! if let Some(user_id) = client.resolve_user_id("nasa").await? {
//!     let timeline = client.list_recent_posts(&user_id, 10, None).await?;
//!     println!("{} posts, {} media", timeline.posts.len(), timeline.media.len());
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemoteResult;
use crate::types::{ImageMime, MediaRef, PostId, PublishSurface};

pub mod oauth;
pub mod x;

// Available for all builds (not just tests) so integration tests can drive the pipeline
pub mod mock;

/// A post as listed by the remote, before eligibility filtering
#[derive(Debug, Clone, PartialEq)]
pub struct TimelinePost {
    pub id: PostId,
    pub created_at: Option<DateTime<Utc>>,
    /// Keys into [`Timeline::media`]
    pub media_keys: Vec<String>,
}

/// Media metadata listed alongside posts; every field but the key is optional
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineMedia {
    pub media_key: String,
    pub kind: Option<String>,
    pub url: Option<String>,
    pub alt_text: Option<String>,
}

/// One page of recent posts plus the media they reference
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    /// Newest first, as the remote returns them
    pub posts: Vec<TimelinePost>,
    pub media: Vec<TimelineMedia>,
}

/// Remote capability surface used by the relay
#[async_trait]
pub trait SocialApi: Send + Sync {
    /// Resolve a handle to the remote's internal user id
    ///
    /// Returns `Ok(None)` when the handle does not exist.
    async fn resolve_user_id(&self, handle: &str) -> RemoteResult<Option<String>>;

    /// List up to `limit` most recent posts of `user_id`
    ///
    /// With `since`, only posts strictly newer than that id are returned.
    async fn list_recent_posts(
        &self,
        user_id: &str,
        limit: u32,
        since: Option<&PostId>,
    ) -> RemoteResult<Timeline>;

    /// Upload media to the operator account
    ///
    /// `chunked` selects the segmented upload protocol instead of a single request.
    async fn upload_media(
        &self,
        bytes: &[u8],
        mime: ImageMime,
        chunked: bool,
    ) -> RemoteResult<MediaRef>;

    /// Publish a post with one attached medium, returning the new post id
    async fn publish(
        &self,
        surface: PublishSurface,
        text: &str,
        media: &MediaRef,
    ) -> RemoteResult<String>;

    /// Lowercase identifier for logs (e.g. "x", "mock")
    fn name(&self) -> &str;
}
