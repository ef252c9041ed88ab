//! Slack Web API client

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{ChatClient, HistoryPage, NotificationRecord};
use crate::error::{PipelineError, PipelineResult};

/// Default Slack Web API base URL.
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";

const HISTORY_PAGE_LIMIT: u32 = 200;

pub struct SlackClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct SlackMessage {
    #[serde(default)]
    text: String,
    ts: String,
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

impl SlackClient {
    pub fn new(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }
}

/// Slack timestamps are "<seconds>.<microseconds>" strings.
pub fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn format_slack_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

#[async_trait]
impl ChatClient for SlackClient {
    #[instrument(skip(self, text))]
    async fn post_message(&self, channel: &str, text: &str) -> PipelineResult<()> {
        let response: PostMessageResponse = self
            .client
            .post(self.url("chat.postMessage"))
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            return Err(PipelineError::Notification(
                response.error.unwrap_or_else(|| "chat.postMessage failed".to_string()),
            ));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn history_page(
        &self,
        channel: &str,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> PipelineResult<HistoryPage> {
        let mut query = vec![
            ("channel", channel.to_string()),
            ("oldest", format_slack_ts(oldest)),
            ("latest", format_slack_ts(latest)),
            ("inclusive", "true".to_string()),
            ("limit", HISTORY_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response: HistoryResponse = self
            .client
            .get(self.url("conversations.history"))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.ok {
            return Err(PipelineError::Notification(
                response
                    .error
                    .unwrap_or_else(|| "conversations.history failed".to_string()),
            ));
        }

        let messages: Vec<NotificationRecord> = response
            .messages
            .into_iter()
            .filter_map(|m| parse_slack_ts(&m.ts).map(|at| NotificationRecord::new(m.text, at)))
            .collect();

        let next_cursor = response
            .response_metadata
            .map(|m| m.next_cursor)
            .filter(|c| response.has_more && !c.is_empty());

        debug!(count = messages.len(), more = next_cursor.is_some(), "Fetched history page");

        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }
}
