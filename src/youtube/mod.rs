use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header::RETRY_AFTER, Client, StatusCode, Url};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{EntityKind, Fields, OperationKind, RawRecord};
use crate::youtube::model::{ErrorEnvelope, ListResponse};

pub mod model;

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3/";

const VIDEO_PAGE_SIZE: &str = "50";
const COMMENT_PAGE_SIZE: &str = "100";

static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("valid numeric regex"));

/// Machine-readable failure category consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchCategory {
    RateLimited,
    QuotaExhausted,
    Auth,
    Malformed,
    Network,
    /// Permanent 4xx other than auth.
    Rejected,
}

impl FetchCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchCategory::RateLimited => "rate_limited",
            FetchCategory::QuotaExhausted => "quota_exhausted",
            FetchCategory::Auth => "auth",
            FetchCategory::Malformed => "malformed",
            FetchCategory::Network => "network",
            FetchCategory::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FetchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{category}: {message}")]
pub struct FetchError {
    pub category: FetchCategory,
    pub message: String,
    /// Server-provided wait before retrying.
    pub retry_after: Option<Duration>,
    /// API error reason, e.g. `quotaExceeded`.
    pub reason: Option<String>,
}

impl FetchError {
    pub fn new(category: FetchCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retry_after: None,
            reason: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FetchCategory::Network,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }
}

/// One page of records plus the cursor of the next page, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

/// The single logical call the collector needs from the external API.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch_page(
        &self,
        parent_id: &str,
        operation: OperationKind,
        cursor: Option<String>,
    ) -> Result<Page, FetchError>;
}

#[derive(Clone)]
pub struct YoutubeClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for YoutubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YoutubeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl YoutubeClient {
    pub fn new(api_key: String) -> Result<Self> {
        let base_url = Url::parse(YOUTUBE_API_BASE).context("invalid default YouTube URL")?;
        Self::with_base_url(api_key, base_url)
    }

    pub fn with_base_url(api_key: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("yt-watch/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn build_request(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid YouTube base URL")?;
        self.http
            .get(endpoint)
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .header("Accept", "application/json")
            .build()
            .context("failed to build YouTube request")
    }

    async fn get_list(&self, path: &str, query: &[(&str, &str)]) -> Result<ListResponse, FetchError> {
        let request = self
            .build_request(path, query)
            .map_err(|e| FetchError::new(FetchCategory::Malformed, e.to_string()))?;
        debug!(path, "youtube request");

        let res = self.http.execute(request).await.map_err(transport_error)?;
        let status = res.status();
        if !status.is_success() {
            let retry_after = res
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = res.text().await.unwrap_or_default();
            let err = classify_status(status, retry_after, &body);
            warn!(path, %status, category = err.category.as_str(), "youtube API error");
            return Err(err);
        }

        let body = res.text().await.map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|e| {
            FetchError::new(FetchCategory::Malformed, format!("invalid response JSON: {e}"))
        })
    }

    pub async fn fetch_channel(&self, channel_id: &str) -> Result<Page, FetchError> {
        let list = self
            .get_list(
                "channels",
                &[
                    ("part", "snippet,statistics,brandingSettings,contentDetails"),
                    ("id", channel_id),
                ],
            )
            .await?;
        let records = list
            .items
            .into_iter()
            .map(|item| item_record(item, EntityKind::Channel, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            records,
            next_cursor: None,
        })
    }

    /// One page of a channel's uploads, hydrated with per-video details.
    pub async fn fetch_videos_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page, FetchError> {
        let playlist = uploads_playlist_id(channel_id)?;
        let mut query = vec![
            ("part", "contentDetails"),
            ("playlistId", playlist.as_str()),
            ("maxResults", VIDEO_PAGE_SIZE),
        ];
        if let Some(token) = cursor {
            query.push(("pageToken", token));
        }
        let listing = self.get_list("playlistItems", &query).await?;
        let video_ids: Vec<String> = listing
            .items
            .iter()
            .filter_map(|item| item.pointer("/contentDetails/videoId"))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if video_ids.is_empty() {
            return Ok(Page {
                records: Vec::new(),
                next_cursor: listing.next_page_token,
            });
        }

        let joined = video_ids.join(",");
        let details = self
            .get_list(
                "videos",
                &[
                    ("part", "snippet,statistics,contentDetails,status"),
                    ("id", joined.as_str()),
                ],
            )
            .await?;
        let mut by_id: HashMap<String, RawRecord> = HashMap::new();
        for item in details.items {
            let record = item_record(item, EntityKind::Video, Some(channel_id))?;
            by_id.insert(record.id.clone(), record);
        }
        // videos.list does not promise playlist order; deleted videos are absent.
        let records = video_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        Ok(Page {
            records,
            next_cursor: listing.next_page_token,
        })
    }

    pub async fn fetch_comments_page(
        &self,
        video_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page, FetchError> {
        let mut query = vec![
            ("part", "snippet,replies"),
            ("videoId", video_id),
            ("maxResults", COMMENT_PAGE_SIZE),
            ("textFormat", "plainText"),
        ];
        if let Some(token) = cursor {
            query.push(("pageToken", token));
        }
        let list = match self.get_list("commentThreads", &query).await {
            Ok(list) => list,
            Err(err) if err.reason.as_deref() == Some("commentsDisabled") => {
                debug!(video_id, "comments disabled");
                return Ok(Page::default());
            }
            Err(err) => return Err(err),
        };
        let mut records = Vec::new();
        for thread in list.items {
            records.extend(flatten_comment_thread(&thread, video_id)?);
        }
        Ok(Page {
            records,
            next_cursor: list.next_page_token,
        })
    }
}

#[async_trait]
impl FetchClient for YoutubeClient {
    async fn fetch_page(
        &self,
        parent_id: &str,
        operation: OperationKind,
        cursor: Option<String>,
    ) -> Result<Page, FetchError> {
        match operation {
            OperationKind::FetchEntity => self.fetch_channel(parent_id).await,
            OperationKind::FetchChildPage => {
                self.fetch_videos_page(parent_id, cursor.as_deref()).await
            }
            OperationKind::FetchGrandchildPage => {
                self.fetch_comments_page(parent_id, cursor.as_deref()).await
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::new(FetchCategory::Malformed, err.to_string())
    } else {
        FetchError::new(FetchCategory::Network, err.to_string())
    }
}

/// Map a non-success HTTP response to a fetch error category.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let reason = envelope
        .as_ref()
        .and_then(|e| e.error.errors.first())
        .map(|d| d.reason.clone())
        .filter(|r| !r.is_empty());
    let message = envelope
        .as_ref()
        .map(|e| e.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"));

    let category = match (status, reason.as_deref()) {
        (StatusCode::TOO_MANY_REQUESTS, _) => FetchCategory::RateLimited,
        (_, Some("quotaExceeded" | "dailyLimitExceeded")) => FetchCategory::QuotaExhausted,
        (_, Some("rateLimitExceeded" | "userRateLimitExceeded")) => FetchCategory::RateLimited,
        (_, Some("keyInvalid" | "keyExpired" | "accessNotConfigured")) => FetchCategory::Auth,
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Some("commentsDisabled")) => {
            FetchCategory::Rejected
        }
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => FetchCategory::Auth,
        (StatusCode::REQUEST_TIMEOUT, _) => FetchCategory::Network,
        (s, _) if s.is_server_error() => FetchCategory::Network,
        _ => FetchCategory::Rejected,
    };

    FetchError {
        category,
        message,
        retry_after,
        reason,
    }
}

/// Uploads playlist of a channel: `UC…` ids map to `UU…`.
pub fn uploads_playlist_id(channel_id: &str) -> Result<String, FetchError> {
    match channel_id.strip_prefix("UC") {
        Some(rest) if !rest.is_empty() => Ok(format!("UU{rest}")),
        _ => Err(FetchError::new(
            FetchCategory::Rejected,
            format!("not a channel id: {channel_id}"),
        )),
    }
}

fn item_record(
    item: Value,
    kind: EntityKind,
    parent_id: Option<&str>,
) -> Result<RawRecord, FetchError> {
    let Value::Object(mut obj) = item else {
        return Err(FetchError::new(
            FetchCategory::Malformed,
            format!("{} item is not an object", kind.as_str()),
        ));
    };
    let id = match obj.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => {
            return Err(FetchError::new(
                FetchCategory::Malformed,
                format!("{} item without id", kind.as_str()),
            ))
        }
    };
    obj.remove("etag");
    obj.remove("kind");
    Ok(RawRecord {
        id,
        kind,
        parent_id: parent_id.map(str::to_string),
        fields: normalize_fields(obj),
    })
}

/// The API reports counters as decimal strings; store them as integers so
/// numeric comparisons work.
pub fn normalize_fields(mut fields: Fields) -> Fields {
    if let Some(Value::Object(stats)) = fields.get_mut("statistics") {
        for value in stats.values_mut() {
            let parsed = value
                .as_str()
                .filter(|s| NUMERIC.is_match(s))
                .and_then(|s| s.parse::<i64>().ok());
            if let Some(n) = parsed {
                *value = Value::from(n);
            }
        }
    }
    fields
}

/// A comment thread becomes its top-level comment (child of the video) and
/// its replies (children of the top-level comment).
pub fn flatten_comment_thread(thread: &Value, video_id: &str) -> Result<Vec<RawRecord>, FetchError> {
    let top = thread
        .pointer("/snippet/topLevelComment")
        .ok_or_else(|| FetchError::new(FetchCategory::Malformed, "thread without topLevelComment"))?;
    let top_id = top
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::new(FetchCategory::Malformed, "comment without id"))?
        .to_string();

    let mut fields = comment_fields(top);
    if let Some(count) = thread.pointer("/snippet/totalReplyCount") {
        fields.insert("totalReplyCount".into(), count.clone());
    }
    let mut out = vec![RawRecord {
        id: top_id.clone(),
        kind: EntityKind::Comment,
        parent_id: Some(video_id.to_string()),
        fields,
    }];

    let replies = thread
        .pointer("/replies/comments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for reply in replies {
        let Some(id) = reply.get("id").and_then(Value::as_str) else {
            continue;
        };
        let parent = reply
            .pointer("/snippet/parentId")
            .and_then(Value::as_str)
            .unwrap_or(&top_id);
        out.push(RawRecord {
            id: id.to_string(),
            kind: EntityKind::Comment,
            parent_id: Some(parent.to_string()),
            fields: comment_fields(reply),
        });
    }
    Ok(out)
}

fn comment_fields(comment: &Value) -> Fields {
    comment
        .get("snippet")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_request_sets_key_and_query() {
        let client = YoutubeClient::new("secret".into()).unwrap();
        let request = client
            .build_request("channels", &[("part", "snippet"), ("id", "UC1")])
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/youtube/v3/channels");
        let query: HashMap<_, _> = request.url().query_pairs().into_owned().collect();
        assert_eq!(query.get("key").map(String::as_str), Some("secret"));
        assert_eq!(query.get("id").map(String::as_str), Some("UC1"));
        assert!(!format!("{client:?}").contains("secret"));
    }

    #[test]
    fn quota_and_rate_reasons_are_distinguished() {
        let quota = json!({"error": {"message": "out", "errors": [{"reason": "quotaExceeded"}]}});
        let err = classify_status(StatusCode::FORBIDDEN, None, &quota.to_string());
        assert_eq!(err.category, FetchCategory::QuotaExhausted);
        assert_eq!(err.message, "out");

        let rate = json!({"error": {"errors": [{"reason": "userRateLimitExceeded"}]}});
        let err = classify_status(StatusCode::FORBIDDEN, None, &rate.to_string());
        assert_eq!(err.category, FetchCategory::RateLimited);
    }

    #[test]
    fn status_codes_without_reason() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "");
        assert_eq!(err.category, FetchCategory::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, None, "").category,
            FetchCategory::Auth
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None, "<html>").category,
            FetchCategory::Network
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None, "").category,
            FetchCategory::Rejected
        );
    }

    #[test]
    fn comments_disabled_keeps_reason() {
        let body = json!({"error": {"errors": [{"reason": "commentsDisabled"}]}});
        let err = classify_status(StatusCode::FORBIDDEN, None, &body.to_string());
        assert_eq!(err.category, FetchCategory::Rejected);
        assert_eq!(err.reason.as_deref(), Some("commentsDisabled"));
    }

    #[test]
    fn uploads_playlist_from_channel_id() {
        assert_eq!(uploads_playlist_id("UCabc").unwrap(), "UUabc");
        assert!(uploads_playlist_id("abc").is_err());
    }

    #[test]
    fn item_record_strips_envelope_and_normalizes_counts() {
        let item = json!({
            "kind": "youtube#channel",
            "etag": "xyz",
            "id": "UC1",
            "snippet": {"title": "Chan"},
            "statistics": {"viewCount": "100", "hiddenSubscriberCount": false}
        });
        let record = item_record(item, EntityKind::Channel, None).unwrap();
        assert_eq!(record.id, "UC1");
        assert!(record.fields.get("etag").is_none());
        assert_eq!(record.fields["statistics"]["viewCount"], json!(100));
        assert_eq!(record.fields["statistics"]["hiddenSubscriberCount"], json!(false));
    }

    #[test]
    fn item_without_id_is_malformed() {
        let err = item_record(json!({"snippet": {}}), EntityKind::Video, None).unwrap_err();
        assert_eq!(err.category, FetchCategory::Malformed);
    }

    #[test]
    fn thread_flattens_into_comment_and_replies() {
        let thread = json!({
            "id": "t1",
            "snippet": {
                "totalReplyCount": 1,
                "topLevelComment": {"id": "c1", "snippet": {"textDisplay": "hi", "likeCount": 2}}
            },
            "replies": {"comments": [
                {"id": "c1.r1", "snippet": {"parentId": "c1", "textDisplay": "yo"}}
            ]}
        });
        let records = flatten_comment_thread(&thread, "v1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "c1");
        assert_eq!(records[0].parent_id.as_deref(), Some("v1"));
        assert_eq!(records[0].fields["totalReplyCount"], json!(1));
        assert_eq!(records[1].parent_id.as_deref(), Some("c1"));
        assert_eq!(records[1].fields["textDisplay"], json!("yo"));
    }
}
