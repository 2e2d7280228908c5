//! Slack Web API calls used by the catalog and import.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const LIST_TIMEOUT: Duration = Duration::from_secs(20);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(25);
const PAGE_SIZE: &str = "200";
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const MAX_SERVER_ERROR_RETRIES: u32 = 3;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub is_private: bool,
    pub is_archived: bool,
    pub is_member: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub num_members: u64,
    pub selected: bool,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryMessage {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub ts: String,
}

impl HistoryMessage {
    pub fn is_bot(&self) -> bool {
        self.subtype == "bot_message" || !self.bot_id.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SlackApi {
    http_client: reqwest::Client,
    api_base: String,
}

impl SlackApi {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    /// All public and private channels the bot can see, sorted by name.
    pub async fn list_channels(&self, access_token: &str) -> Result<Vec<ChannelSummary>> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        let url = self.endpoint("conversations.list");

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("limit", PAGE_SIZE.to_string()),
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "true".to_string()),
                ("include_num_members", "true".to_string()),
            ];
            if let Some(next) = cursor.as_ref() {
                params.push(("cursor", next.clone()));
            }

            let response = call_with_backoff("conversations.list", || {
                self.http_client
                    .get(&url)
                    .bearer_auth(access_token)
                    .timeout(LIST_TIMEOUT)
                    .query(&params)
            })
            .await?;

            let payload: ChannelsResponse = response
                .json()
                .await
                .context("failed to decode conversations.list response")?;
            if !payload.ok {
                return Err(anyhow!(
                    "slack conversations.list error: {}",
                    payload.error.unwrap_or_else(|| "unknown".to_string())
                ));
            }

            channels.extend(
                payload
                    .channels
                    .into_iter()
                    .filter(|c| !c.id.trim().is_empty() && !c.name.trim().is_empty())
                    .map(|c| ChannelSummary {
                        id: c.id,
                        name: c.name,
                        is_private: c.is_private,
                        is_archived: c.is_archived,
                        is_member: c.is_member,
                        num_members: c.num_members,
                        selected: false,
                    }),
            );

            cursor = payload
                .response_metadata
                .and_then(|meta| meta.next_cursor)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());

            if cursor.is_none() {
                break;
            }
        }

        channels.sort_by_key(|c| c.name.to_lowercase());
        Ok(channels)
    }

    /// Every message in a channel's history, following cursors to the end.
    pub async fn channel_history(
        &self,
        access_token: &str,
        channel_id: &str,
    ) -> Result<Vec<HistoryMessage>> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let url = self.endpoint("conversations.history");

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("channel", channel_id.to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if let Some(next) = cursor.as_ref() {
                params.push(("cursor", next.clone()));
            }

            let response = call_with_backoff("conversations.history", || {
                self.http_client
                    .get(&url)
                    .bearer_auth(access_token)
                    .timeout(HISTORY_TIMEOUT)
                    .query(&params)
            })
            .await?;

            let payload: HistoryResponse = response
                .json()
                .await
                .context("failed to decode conversations.history response")?;
            if !payload.ok {
                return Err(anyhow!(
                    "slack conversations.history error for channel {}: {}",
                    channel_id,
                    payload.error.unwrap_or_else(|| "unknown".to_string())
                ));
            }

            messages.extend(payload.messages);

            cursor = payload
                .response_metadata
                .and_then(|m| m.next_cursor)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());

            if cursor.is_none() {
                break;
            }
        }

        Ok(messages)
    }
}

async fn call_with_backoff(
    api: &str,
    mut builder_fn: impl FnMut() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let mut rate_limited = 0;
    let mut server_errors = 0;
    let mut delay = Duration::from_secs(1);

    loop {
        let response = builder_fn()
            .send()
            .await
            .with_context(|| format!("slack {} request failed", api))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 && rate_limited < MAX_RATE_LIMIT_RETRIES {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(delay)
                .min(MAX_RETRY_AFTER);

            warn!(
                api,
                retry_in = ?retry_after,
                attempt = rate_limited + 1,
                "slack rate limited, retrying"
            );
            tokio::time::sleep(retry_after).await;
            rate_limited += 1;
            delay *= 2;
            continue;
        }

        if status.is_server_error() && server_errors < MAX_SERVER_ERROR_RETRIES {
            warn!(api, %status, "slack server error, retrying");
            tokio::time::sleep(delay).await;
            server_errors += 1;
            delay *= 2;
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        warn!(api, %status, %body, "slack API call failed");
        return Err(anyhow!("slack {} status {} - {}", api, status.as_u16(), body));
    }
}

/// Parse Slack's `seconds.fraction` timestamps. The fraction is padded or cut to
/// nanosecond precision.
pub fn parse_slack_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    let (secs, fraction) = match ts.split_once('.') {
        Some((secs, fraction)) => (secs, fraction),
        None => (ts, ""),
    };
    let secs = secs.parse::<i64>().ok()?;

    let nanos = if fraction.is_empty() {
        0
    } else {
        let mut digits: String = fraction.chars().take(9).collect();
        while digits.len() < 9 {
            digits.push('0');
        }
        digits.parse::<u32>().ok()?
    };

    Utc.timestamp_opt(secs, nanos).single()
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    ok: bool,
    #[serde(default)]
    channels: Vec<RawChannel>,
    error: Option<String>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    is_member: bool,
    #[serde(default)]
    num_members: u64,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
    error: Option<String>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}
