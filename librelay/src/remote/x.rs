//! X (Twitter) API client
//!
//! Reads go through the v2 API with an app bearer token. Media upload uses
//! the v1.1 upload endpoint (simple or INIT/APPEND/FINALIZE), and publishing
//! uses v2 `POST /2/tweets` with v1.1 `statuses/update` as the legacy surface.
//! Writes are signed with the operator's OAuth 1.0a user credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ConfigError, RemoteError, RemoteResult};
use crate::remote::oauth::{authorization_header, OAuth1Credentials};
use crate::remote::{SocialApi, Timeline, TimelineMedia, TimelinePost};
use crate::types::{ImageMime, MediaRef, PostId, PublishSurface};

/// Segment size for chunked uploads
const CHUNK_SIZE: usize = 1024 * 1024;

/// `max_results` bounds accepted by the user timeline endpoint
const MIN_RESULTS: u32 = 5;
const MAX_RESULTS: u32 = 100;

/// Longest response body kept in error diagnostics
const BODY_SNIPPET: usize = 500;

/// Credentials for both the app (reads) and the operator account (writes)
#[derive(Clone, Debug)]
pub struct XCredentials {
    pub bearer_token: SecretString,
    pub oauth: OAuth1Credentials,
}

impl XCredentials {
    /// Read credentials from `X_BEARER_TOKEN`, `X_CONSUMER_KEY`,
    /// `X_CONSUMER_SECRET`, `X_ACCESS_TOKEN` and `X_ACCESS_SECRET`
    pub fn from_env() -> crate::error::Result<Self> {
        fn var(name: &str) -> crate::error::Result<String> {
            match std::env::var(name) {
                Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(ConfigError::MissingField(name.to_string()).into()),
            }
        }

        Ok(Self {
            bearer_token: SecretString::from(var("X_BEARER_TOKEN")?),
            oauth: OAuth1Credentials {
                consumer_key: var("X_CONSUMER_KEY")?,
                consumer_secret: SecretString::from(var("X_CONSUMER_SECRET")?),
                access_token: var("X_ACCESS_TOKEN")?,
                access_secret: SecretString::from(var("X_ACCESS_SECRET")?),
            },
        })
    }
}

/// Base URLs, overridable for staging or proxies
#[derive(Debug, Clone)]
pub struct XEndpoints {
    pub api: String,
    pub upload: String,
}

impl Default for XEndpoints {
    fn default() -> Self {
        Self {
            api: "https://api.twitter.com".to_string(),
            upload: "https://upload.twitter.com".to_string(),
        }
    }
}

pub struct XClient {
    http: Client,
    credentials: XCredentials,
    endpoints: XEndpoints,
}

// ----------------------------------------------------------------------------
// Wire formats
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UserLookup {
    data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    data: Vec<TweetData>,
    includes: Option<Includes>,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    created_at: Option<String>,
    attachments: Option<Attachments>,
}

#[derive(Debug, Deserialize)]
struct Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    media: Vec<MediaData>,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    media_key: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    alt_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    media_id_string: String,
}

#[derive(Debug, Deserialize)]
struct CreateTweetResponse {
    data: CreatedTweet,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateResponse {
    id_str: String,
}

/// Convert a v2 timeline payload into the crate's schema
fn parse_timeline(body: &str) -> RemoteResult<Timeline> {
    let response: TimelineResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::Fatal(format!("Unexpected timeline payload: {}", e)))?;

    let posts = response
        .data
        .into_iter()
        .map(|tweet| TimelinePost {
            id: PostId::new(tweet.id),
            created_at: tweet
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            media_keys: tweet.attachments.map(|a| a.media_keys).unwrap_or_default(),
        })
        .collect();

    let media = response
        .includes
        .map(|i| i.media)
        .unwrap_or_default()
        .into_iter()
        .map(|m| TimelineMedia {
            media_key: m.media_key,
            kind: m.kind,
            url: m.url,
            alt_text: m.alt_text,
        })
        .collect();

    Ok(Timeline { posts, media })
}

/// Trim a timeline to its `limit` newest posts and the media they reference
///
/// The API floor on `max_results` can return more posts than were asked for.
fn keep_newest(mut timeline: Timeline, limit: u32) -> Timeline {
    timeline.posts.sort_by(|a, b| b.id.cmp(&a.id));
    timeline.posts.truncate(limit as usize);

    let posts = &timeline.posts;
    timeline
        .media
        .retain(|m| posts.iter().any(|p| p.media_keys.contains(&m.media_key)));
    timeline
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Classify a non-success HTTP response
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> RemoteError {
    match status.as_u16() {
        429 => {
            let reset_at = header_value(headers, "x-rate-limit-reset")
                .and_then(|s| s.trim().parse::<i64>().ok());
            let diagnostics = format!(
                "HTTP 429; x-rate-limit-limit={} x-rate-limit-remaining={} x-rate-limit-reset={}; body: {}",
                header_value(headers, "x-rate-limit-limit").unwrap_or_else(|| "-".to_string()),
                header_value(headers, "x-rate-limit-remaining").unwrap_or_else(|| "-".to_string()),
                header_value(headers, "x-rate-limit-reset").unwrap_or_else(|| "-".to_string()),
                snippet(body)
            );
            RemoteError::RateLimited {
                reset_at,
                diagnostics,
            }
        }
        500 | 502 | 503 | 504 => {
            RemoteError::Network(format!("HTTP {}: {}", status.as_u16(), snippet(body)))
        }
        code => RemoteError::Fatal(format!("HTTP {}: {}", code, snippet(body))),
    }
}

/// Classify a transport-level failure
fn classify_transport(error: reqwest::Error) -> RemoteError {
    if error.is_decode() || error.is_builder() {
        RemoteError::Fatal(error.to_string())
    } else {
        RemoteError::Network(error.to_string())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> RemoteResult<T> {
    serde_json::from_str(body)
        .map_err(|e| RemoteError::Fatal(format!("Unexpected {} payload: {}", what, e)))
}

fn pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl XClient {
    pub fn new(credentials: XCredentials, timeout: Duration) -> RemoteResult<Self> {
        Self::with_endpoints(credentials, timeout, XEndpoints::default())
    }

    pub fn with_endpoints(
        credentials: XCredentials,
        timeout: Duration,
        endpoints: XEndpoints,
    ) -> RemoteResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("librelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credentials,
            endpoints,
        })
    }

    /// Send a request and return the body of a successful response
    async fn send(&self, request: RequestBuilder) -> RemoteResult<String> {
        let response: Response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &headers, &body))
        }
    }

    fn bearer(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.credentials.bearer_token.expose_secret())
    }

    fn signed(
        &self,
        request: RequestBuilder,
        method: &str,
        url: &str,
        signed_params: &[(String, String)],
    ) -> RemoteResult<RequestBuilder> {
        let header = authorization_header(&self.credentials.oauth, method, url, signed_params)?;
        Ok(request.header(AUTHORIZATION, header))
    }

    fn upload_url(&self) -> String {
        format!("{}/1.1/media/upload.json", self.endpoints.upload)
    }

    async fn upload_simple(&self, bytes: &[u8], mime: ImageMime) -> RemoteResult<MediaRef> {
        let url = self.upload_url();
        let part = Part::bytes(bytes.to_vec())
            .file_name("media")
            .mime_str(mime.as_str())
            .map_err(classify_transport)?;
        let form = Form::new().part("media", part);

        let request = self.signed(self.http.post(&url).multipart(form), "POST", &url, &[])?;
        let body = self.send(request).await?;
        let uploaded: UploadResponse = parse_json(&body, "upload")?;

        Ok(MediaRef {
            media_id: uploaded.media_id_string,
        })
    }

    async fn upload_chunked(&self, bytes: &[u8], mime: ImageMime) -> RemoteResult<MediaRef> {
        let url = self.upload_url();

        let init = [
            ("command", "INIT".to_string()),
            ("total_bytes", bytes.len().to_string()),
            ("media_type", mime.as_str().to_string()),
            ("media_category", "tweet_image".to_string()),
        ];
        let init_params = pairs(&init);
        let request = self.signed(
            self.http.post(&url).form(&init_params),
            "POST",
            &url,
            &init_params,
        )?;
        let body = self.send(request).await?;
        let media_id = parse_json::<UploadResponse>(&body, "upload INIT")?.media_id_string;
        tracing::debug!("Chunked upload initialized: {}", media_id);

        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", index.to_string())
                .part("media", Part::bytes(chunk.to_vec()).file_name("media"));
            let request = self.signed(self.http.post(&url).multipart(form), "POST", &url, &[])?;
            self.send(request).await?;
        }

        let finalize = [
            ("command", "FINALIZE".to_string()),
            ("media_id", media_id.clone()),
        ];
        let finalize_params = pairs(&finalize);
        let request = self.signed(
            self.http.post(&url).form(&finalize_params),
            "POST",
            &url,
            &finalize_params,
        )?;
        let body = self.send(request).await?;
        let finalized: UploadResponse = parse_json(&body, "upload FINALIZE")?;

        Ok(MediaRef {
            media_id: finalized.media_id_string,
        })
    }

    async fn publish_primary(&self, text: &str, media: &MediaRef) -> RemoteResult<String> {
        let url = format!("{}/2/tweets", self.endpoints.api);
        let payload = serde_json::json!({
            "text": text,
            "media": { "media_ids": [media.media_id] },
        });

        let request = self.signed(self.http.post(&url).json(&payload), "POST", &url, &[])?;
        let body = self.send(request).await?;
        let created: CreateTweetResponse = parse_json(&body, "create tweet")?;
        Ok(created.data.id)
    }

    async fn publish_legacy(&self, text: &str, media: &MediaRef) -> RemoteResult<String> {
        let url = format!("{}/1.1/statuses/update.json", self.endpoints.api);
        let params = pairs(&[
            ("status", text.to_string()),
            ("media_ids", media.media_id.clone()),
        ]);

        let request = self.signed(self.http.post(&url).form(&params), "POST", &url, &params)?;
        let body = self.send(request).await?;
        let updated: StatusUpdateResponse = parse_json(&body, "status update")?;
        Ok(updated.id_str)
    }
}

#[async_trait]
impl SocialApi for XClient {
    async fn resolve_user_id(&self, handle: &str) -> RemoteResult<Option<String>> {
        let url = format!(
            "{}/2/users/by/username/{}",
            self.endpoints.api,
            urlencoding::encode(handle)
        );

        let body = match self.send(self.bearer(self.http.get(&url))).await {
            Ok(body) => body,
            Err(RemoteError::Fatal(msg)) if msg.starts_with("HTTP 404") => return Ok(None),
            Err(e) => return Err(e),
        };

        let lookup: UserLookup = parse_json(&body, "user lookup")?;
        Ok(lookup.data.map(|d| d.id))
    }

    async fn list_recent_posts(
        &self,
        user_id: &str,
        limit: u32,
        since: Option<&PostId>,
    ) -> RemoteResult<Timeline> {
        let url = format!("{}/2/users/{}/tweets", self.endpoints.api, user_id);
        let mut query = vec![
            (
                "max_results",
                limit.clamp(MIN_RESULTS, MAX_RESULTS).to_string(),
            ),
            ("expansions", "attachments.media_keys,author_id".to_string()),
            ("media.fields", "url,type,alt_text".to_string()),
            ("tweet.fields", "created_at,attachments".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since_id", since.to_string()));
        }

        let body = self.send(self.bearer(self.http.get(&url).query(&query))).await?;
        Ok(keep_newest(parse_timeline(&body)?, limit))
    }

    async fn upload_media(
        &self,
        bytes: &[u8],
        mime: ImageMime,
        chunked: bool,
    ) -> RemoteResult<MediaRef> {
        if chunked {
            self.upload_chunked(bytes, mime).await
        } else {
            self.upload_simple(bytes, mime).await
        }
    }

    async fn publish(
        &self,
        surface: PublishSurface,
        text: &str,
        media: &MediaRef,
    ) -> RemoteResult<String> {
        match surface {
            PublishSurface::Primary => self.publish_primary(text, media).await,
            PublishSurface::Legacy => self.publish_legacy(text, media).await,
        }
    }

    fn name(&self) -> &str {
        "x"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_timeline_cross_references_media() {
        let body = r#"{
            "data": [
                {"id": "103", "created_at": "2025-01-02T03:04:05.000Z",
                 "attachments": {"media_keys": ["3_1"]}},
                {"id": "102", "text": "no media"},
                {"id": "101", "attachments": {"media_keys": ["7_2", "3_3"]}}
            ],
            "includes": {"media": [
                {"media_key": "3_1", "type": "photo", "url": "https://pbs.twimg.com/media/a.jpg"},
                {"media_key": "7_2", "type": "video"},
                {"media_key": "3_3", "type": "photo", "url": "https://pbs.twimg.com/media/b.png", "alt_text": "cat"}
            ]},
            "meta": {"result_count": 3}
        }"#;

        let timeline = parse_timeline(body).unwrap();
        assert_eq!(timeline.posts.len(), 3);
        assert_eq!(timeline.posts[0].id, PostId::from("103"));
        assert!(timeline.posts[0].created_at.is_some());
        assert!(timeline.posts[1].media_keys.is_empty());
        assert_eq!(timeline.posts[2].media_keys, vec!["7_2", "3_3"]);

        assert_eq!(timeline.media.len(), 3);
        assert_eq!(timeline.media[1].url, None);
        assert_eq!(timeline.media[2].alt_text.as_deref(), Some("cat"));
    }

    #[test]
    fn test_keep_newest_trims_below_result_floor() {
        let body = r#"{
            "data": [
                {"id": "105", "attachments": {"media_keys": ["3_5"]}},
                {"id": "104", "attachments": {"media_keys": ["3_4"]}},
                {"id": "103"},
                {"id": "102", "attachments": {"media_keys": ["3_2"]}},
                {"id": "101", "attachments": {"media_keys": ["3_1"]}}
            ],
            "includes": {"media": [
                {"media_key": "3_5", "type": "photo", "url": "https://pbs.twimg.com/media/e.jpg"},
                {"media_key": "3_4", "type": "photo", "url": "https://pbs.twimg.com/media/d.jpg"},
                {"media_key": "3_2", "type": "photo", "url": "https://pbs.twimg.com/media/b.jpg"},
                {"media_key": "3_1", "type": "photo", "url": "https://pbs.twimg.com/media/a.jpg"}
            ]}
        }"#;

        let timeline = keep_newest(parse_timeline(body).unwrap(), 3);
        let ids: Vec<&str> = timeline.posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["105", "104", "103"]);

        let keys: Vec<&str> = timeline.media.iter().map(|m| m.media_key.as_str()).collect();
        assert_eq!(keys, vec!["3_5", "3_4"]);
    }

    #[test]
    fn test_keep_newest_within_limit_is_unchanged() {
        let body = r#"{
            "data": [
                {"id": "9", "attachments": {"media_keys": ["3_9"]}},
                {"id": "10", "attachments": {"media_keys": ["3_10"]}}
            ],
            "includes": {"media": [
                {"media_key": "3_9", "type": "photo", "url": "https://pbs.twimg.com/media/a.jpg"},
                {"media_key": "3_10", "type": "photo", "url": "https://pbs.twimg.com/media/b.jpg"}
            ]}
        }"#;

        let timeline = keep_newest(parse_timeline(body).unwrap(), 5);
        assert_eq!(timeline.posts.len(), 2);
        assert_eq!(timeline.posts[0].id, PostId::from("10"));
        assert_eq!(timeline.media.len(), 2);
    }

    #[test]
    fn test_parse_timeline_without_data() {
        let timeline = parse_timeline(r#"{"meta": {"result_count": 0}}"#).unwrap();
        assert!(timeline.posts.is_empty());
        assert!(timeline.media.is_empty());
    }

    #[test]
    fn test_parse_timeline_garbage_is_fatal() {
        assert!(matches!(parse_timeline("<html>"), Err(RemoteError::Fatal(_))));
    }

    #[test]
    fn test_classify_429_with_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-reset", HeaderValue::from_static("1700000900"));
        headers.insert("x-rate-limit-remaining", HeaderValue::from_static("0"));

        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "{\"title\":\"Too Many Requests\"}");
        match error {
            RemoteError::RateLimited {
                reset_at,
                diagnostics,
            } => {
                assert_eq!(reset_at, Some(1_700_000_900));
                assert!(diagnostics.contains("x-rate-limit-remaining=0"));
                assert!(diagnostics.contains("Too Many Requests"));
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_429_without_reset() {
        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "");
        assert!(matches!(error, RemoteError::RateLimited { reset_at: None, .. }));
    }

    #[test]
    fn test_classify_server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert!(matches!(
                classify_status(status, &HeaderMap::new(), "over capacity"),
                RemoteError::Network(_)
            ));
        }
    }

    #[test]
    fn test_classify_client_errors_are_fatal() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN, StatusCode::BAD_REQUEST] {
            assert!(matches!(
                classify_status(status, &HeaderMap::new(), ""),
                RemoteError::Fatal(_)
            ));
        }
        let not_found = classify_status(StatusCode::NOT_FOUND, &HeaderMap::new(), "");
        assert!(not_found.to_string().contains("HTTP 404"));
    }

    #[test]
    fn test_snippet_truncates_long_bodies() {
        let body = "é".repeat(BODY_SNIPPET + 50);
        assert_eq!(snippet(&body).chars().count(), BODY_SNIPPET);
        assert_eq!(snippet("short"), "short");
    }
}
