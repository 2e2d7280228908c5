//! Remote signal backend speaking the PostgREST row API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Signal;
use crate::signals::{SignalStore, SignalStoreError};
use crate::state::normalize_limit;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const REST_SUFFIX: &str = "/rest/v1";
const UNKNOWN_SOURCE: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mirror returned HTTP {status} - {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode mirror response: {0}")]
    Decode(String),
    #[error("signal rejected: {0}")]
    InvalidSignal(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct SignalRow {
    id: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

impl SignalRow {
    fn from_signal(signal: &Signal) -> Result<Self, MirrorError> {
        let id = signal.id.trim();
        if id.is_empty() {
            return Err(MirrorError::InvalidSignal("signal id is required".to_string()));
        }
        let source = match signal.source.trim() {
            "" => UNKNOWN_SOURCE,
            s => s,
        };
        Ok(Self {
            id: id.to_string(),
            source: Some(source.to_string()),
            title: Some(signal.title.clone()),
            summary: Some(signal.summary.clone()),
            occurred_at: signal.occurred_at,
            meta: Some(signal.meta.clone()),
        })
    }

    fn into_signal(self) -> Signal {
        Signal {
            id: self.id,
            source: self
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            title: self.title.unwrap_or_default(),
            summary: self.summary.unwrap_or_default(),
            occurred_at: self.occurred_at,
            meta: self.meta.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSignalMirror {
    http_client: Client,
    rest_url: String,
    table: String,
    service_key: String,
}

impl RemoteSignalMirror {
    pub fn new(base_url: &str, service_key: &str, table: &str) -> Self {
        let trimmed = base_url.trim().trim_end_matches('/');
        let rest_url = if trimmed.ends_with(REST_SUFFIX) {
            trimmed.to_string()
        } else {
            format!("{}{}", trimmed, REST_SUFFIX)
        };
        let table = match table.trim() {
            "" => "signals",
            t => t,
        };
        Self {
            http_client: Client::new(),
            rest_url,
            table: table.to_string(),
            service_key: service_key.trim().to_string(),
        }
    }

    /// Build the mirror only when both the URL and the service key are set.
    pub fn from_settings(base_url: &str, service_key: &str, table: &str) -> Option<Self> {
        match (base_url.trim().is_empty(), service_key.trim().is_empty()) {
            (false, false) => Some(Self::new(base_url, service_key, table)),
            (true, true) => None,
            _ => {
                warn!("remote signal mirror needs both a URL and a service key; mirror disabled");
                None
            }
        }
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.rest_url, self.table)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .timeout(REQUEST_TIMEOUT)
    }

    pub async fn upsert_signal(&self, signal: &Signal) -> Result<(), MirrorError> {
        let row = SignalRow::from_signal(signal)?;
        let resp = self
            .authorized(self.http_client.post(self.table_url()))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        check_status(resp).await?;
        debug!(signal_id = %signal.id, "signal mirrored");
        Ok(())
    }

    pub async fn list_signals(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Signal>, MirrorError> {
        let limit = normalize_limit(limit).to_string();
        let mut query = vec![
            ("select", "id,source,title,summary,occurred_at,meta".to_string()),
            ("order", "occurred_at.desc".to_string()),
            ("limit", limit),
        ];
        if let Some(source) = source.map(str::trim).filter(|s| !s.is_empty()) {
            query.push(("source", format!("eq.{}", source)));
        }

        let resp = self
            .authorized(self.http_client.get(self.table_url()))
            .query(&query)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        let rows: Vec<SignalRow> =
            serde_json::from_str(&body).map_err(|e| MirrorError::Decode(e.to_string()))?;
        Ok(rows.into_iter().map(SignalRow::into_signal).collect())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, MirrorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(MirrorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SignalStore for RemoteSignalMirror {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn upsert(&self, signal: &Signal) -> Result<(), SignalStoreError> {
        Ok(self.upsert_signal(signal).await?)
    }

    async fn list(&self, source: Option<&str>, limit: usize) -> Result<Vec<Signal>, SignalStoreError> {
        Ok(self.list_signals(source, limit).await?)
    }
}
