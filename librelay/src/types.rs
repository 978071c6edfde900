//! Core types for the relay job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Handle of a content source (e.g. "nasa"), supplied by configuration
pub type SourceIdentity = String;

/// Identifier of a remote post
///
/// Remote ids are decimal strings that grow over time. They are kept as
/// strings and ordered numerically: shorter (after leading zeros) is smaller,
/// equal lengths compare digit by digit. This is the same order as comparing
/// the integers, without any width limit, and still a total order if an id
/// ever contains something other than digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn significant(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() && !self.0.is_empty() {
            "0"
        } else {
            trimmed
        }
    }
}

impl Ord for PostId {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.significant(), other.significant());
        a.len()
            .cmp(&b.len())
            .then_with(|| a.cmp(b))
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PostId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for PostId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Kind of an attached medium as reported by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Other(String),
}

impl MediaKind {
    pub fn parse(kind: &str) -> Self {
        if kind.eq_ignore_ascii_case("photo") {
            MediaKind::Photo
        } else {
            MediaKind::Other(kind.to_string())
        }
    }
}

/// One downloadable asset attached to a post
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub url: Option<String>,
    pub kind: MediaKind,
    pub alt_text: Option<String>,
}

impl MediaItem {
    /// Only photos with a URL can be relayed
    pub fn is_eligible(&self) -> bool {
        self.kind == MediaKind::Photo && self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// A fetched post carrying at least one eligible photo
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePost {
    pub id: PostId,
    pub created_at: Option<DateTime<Utc>>,
    /// Eligible media in the order the remote attached them
    pub media: Vec<MediaItem>,
}

/// Handle for media already uploaded to the operator account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub media_id: String,
}

/// Which publish endpoint to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishSurface {
    /// Current API surface
    Primary,
    /// Older API surface used as a fallback
    Legacy,
}

impl fmt::Display for PublishSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishSurface::Primary => write!(f, "primary"),
            PublishSurface::Legacy => write!(f, "legacy"),
        }
    }
}

/// Supported image MIME types for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageMime {
    /// Detect MIME type from file extension, defaulting to JPEG
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "png" => Self::Png,
            "gif" => Self::Gif,
            "webp" => Self::WebP,
            _ => Self::Jpeg,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
