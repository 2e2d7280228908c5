use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use relay_auth::Provider;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Normalized unit of workspace activity handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Idempotency key; a later write with the same id replaces the earlier one
    pub id: String,
    pub source: String,
    pub title: String,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processed,
    Ignored,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Ignored => "ignored",
            EventStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

/// Audit entry for an accepted webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventRecord {
    pub event_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub event_type: String,
    /// Platform `event_time`, seconds since epoch
    #[serde(default)]
    pub event_time: i64,
    /// Request body exactly as received
    pub payload: Box<RawValue>,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input to [`crate::IntegrationStore::record_event`].
#[derive(Debug, Clone)]
pub struct NewRawEvent {
    pub event_id: String,
    pub team_id: String,
    pub event_type: String,
    pub event_time: i64,
    pub payload: Box<RawValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub team_id: String,
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub bot_user_id: String,
    #[serde(default)]
    pub scope: String,
    /// Bot token sealed with the token cipher
    pub access_token_enc: String,
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetupConfig {
    pub client_id: String,
    pub redirect_url: String,
    pub bot_scopes: String,
    pub app_ui_base_url: String,
    pub client_secret_enc: String,
    pub signing_secret_enc: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTicket {
    pub provider: Provider,
    pub expires_at: DateTime<Utc>,
}

/// Everything the store persists, written as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSnapshot {
    pub connection: Option<ConnectionRecord>,
    pub setup: Option<SetupConfig>,
    pub oauth_states: BTreeMap<String, OAuthTicket>,
    /// Replay ledger: event id to first-seen time
    pub seen_events: BTreeMap<String, DateTime<Utc>>,
    pub raw_events: Vec<RawEventRecord>,
    pub selected_channels: Vec<String>,
    pub signals: Vec<Signal>,
}
