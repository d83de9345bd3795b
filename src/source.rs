//! Feed sources: where raw review events come from.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// An error while fetching from the review feed.
///
/// All variants are transient from the pipeline's point of view: the poll is
/// abandoned without advancing the feed position and retried after the
/// polling delay.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("could not communicate with the review server: {0}")]
    Communication(#[source] reqwest::Error),
    #[error("review server returned status {status}, full response: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("review server returned an error: {code} {info}")]
    Api { code: String, info: String },
    #[error("review server returned malformed JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// One page of the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPage {
    pub data: FeedData,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedData {
    pub events: Vec<Value>,
    #[serde(default)]
    pub story_errors: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cursor {
    pub after: i64,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// The key of the newest story in the feed.
    async fn fetch_feed_end(&self) -> Result<i64, FeedError>;

    /// The next page of events strictly after `after`.
    async fn fetch_next(&self, after: i64) -> Result<FeedPage, FeedError>;
}

/// Fetches feed pages from the review server's HTTP API.
#[derive(Clone)]
pub struct HttpFeedSource {
    http: Client,
    base_url: String,
    token: String,
    story_limit: u32,
}

impl fmt::Debug for HttpFeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedSource")
            .field("base_url", &self.base_url)
            .field("story_limit", &self.story_limit)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    result: Option<Value>,
    error_code: Option<String>,
    error_info: Option<String>,
}

impl HttpFeedSource {
    pub fn new(host: &str, token: String, story_limit: u32) -> Self {
        let http = Client::builder()
            .user_agent("review-emails/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: format!("{}/api", host.trim_end_matches('/')),
            token,
            story_limit,
        }
    }

    /// POST to a feed endpoint. The token travels in the body so it never
    /// appears in a URL.
    async fn request(&self, endpoint: &str, mut params: Value) -> Result<Value, FeedError> {
        params["__conduit__"] = json!({ "token": self.token });
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(%url, "requesting feed page");

        let res = self
            .http
            .post(&url)
            .form(&[("params", params.to_string())])
            .send()
            .await
            .map_err(FeedError::Communication)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        let envelope: ApiEnvelope = res
            .json()
            .await
            .map_err(FeedError::Communication)?;
        if let Some(code) = envelope.error_code {
            return Err(FeedError::Api {
                code,
                info: envelope.error_info.unwrap_or_default(),
            });
        }
        envelope.result.ok_or(FeedError::Api {
            code: "missing-result".to_string(),
            info: "response carried neither a result nor an error".to_string(),
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed_end(&self) -> Result<i64, FeedError> {
        let result = self.request("feed.for_email.status", json!({})).await?;
        serde_json::from_value(result).map_err(FeedError::Json)
    }

    async fn fetch_next(&self, after: i64) -> Result<FeedPage, FeedError> {
        let mut params = json!({ "storyLimit": self.story_limit });
        if after != 0 {
            params["after"] = json!(after);
        }
        let result = self.request("feed.for_email.query", params).await?;

        // The result is itself a JSON document encoded as a string.
        match result {
            Value::String(raw) => serde_json::from_str(&raw).map_err(FeedError::Json),
            other => serde_json::from_value(other).map_err(FeedError::Json),
        }
    }
}

/// Replays a static feed page from a local JSON file. Used for local
/// development against captured feed data.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl FeedSource for FileSource {
    async fn fetch_feed_end(&self) -> Result<i64, FeedError> {
        Ok(0)
    }

    async fn fetch_next(&self, _after: i64) -> Result<FeedPage, FeedError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FeedError::Api {
                code: "file".to_string(),
                info: e.to_string(),
            }
        })?;
        serde_json::from_str(&raw).map_err(FeedError::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_page_parses_cursor_and_story_errors() {
        let page: FeedPage = serde_json::from_str(
            r#"{
                "data": { "events": [{"timestamp": 1}], "storyErrors": 2 },
                "cursor": { "after": 42 }
            }"#,
        )
        .unwrap();
        assert_eq!(page.data.events.len(), 1);
        assert_eq!(page.data.story_errors, 2);
        assert_eq!(page.cursor.after, 42);
    }

    #[test]
    fn story_errors_default_to_zero() {
        let page: FeedPage = serde_json::from_str(
            r#"{ "data": { "events": [] }, "cursor": { "after": 0 } }"#,
        )
        .unwrap();
        assert_eq!(page.data.story_errors, 0);
    }

    #[tokio::test]
    async fn file_source_replays_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"{ "data": { "events": [], "storyErrors": 0 }, "cursor": { "after": 7 } }"#,
        )
        .unwrap();

        let source = FileSource::new(path);
        assert_eq!(source.fetch_feed_end().await.unwrap(), 0);
        let page = source.fetch_next(0).await.unwrap();
        assert_eq!(page.cursor.after, 7);
    }
}
