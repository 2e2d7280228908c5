//! Channel listing, ingestion selection and history import.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use relay_ingest::{IntegrationStore, Signal, SignalStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::pipeline::SIGNAL_SOURCE;
use crate::slack::{parse_slack_timestamp, ChannelSummary, SlackApi};

/// Imported message text is cut to this many characters.
pub const IMPORT_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelListing {
    pub channels: Vec<ChannelSummary>,
    pub total: usize,
    pub selected_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionUpdate {
    pub status: &'static str,
    pub selected_count: usize,
    pub channel_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub status: &'static str,
    pub total_channels: usize,
    pub imported_signals: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ChannelCatalog {
    slack: SlackApi,
    store: Arc<IntegrationStore>,
    signals: Arc<dyn SignalStore>,
}

impl ChannelCatalog {
    pub fn new(slack: SlackApi, store: Arc<IntegrationStore>, signals: Arc<dyn SignalStore>) -> Self {
        Self {
            slack,
            store,
            signals,
        }
    }

    async fn fetch_channels(&self, token: &str) -> Result<Vec<ChannelSummary>, RelayError> {
        self.slack.list_channels(token).await.map_err(|e| {
            warn!("failed to list slack channels: {:#}", e);
            RelayError::Upstream(format!("{:#}", e))
        })
    }

    /// Visible channels with the current selection marked.
    pub async fn list_channels(&self, token: &str) -> Result<ChannelListing, RelayError> {
        let mut channels = self.fetch_channels(token).await?;
        let selected: HashSet<String> = self.store.get_selected_channels()?.into_iter().collect();

        for channel in channels.iter_mut() {
            channel.selected = selected.contains(&channel.id);
        }
        let selected_count = channels.iter().filter(|c| c.selected).count();

        Ok(ChannelListing {
            total: channels.len(),
            selected_count,
            channels,
        })
    }

    /// Replace the selection with the requested ids that still exist upstream.
    pub async fn update_selection(
        &self,
        token: &str,
        requested: &[String],
    ) -> Result<SelectionUpdate, RelayError> {
        let available: HashSet<String> = self
            .fetch_channels(token)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut seen = HashSet::new();
        let selected: Vec<String> = requested
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && available.contains(*id))
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect();

        self.store.set_selected_channels(selected.clone())?;
        info!(count = selected.len(), "updated slack channel selection");

        Ok(SelectionUpdate {
            status: "ok",
            selected_count: selected.len(),
            channel_ids: selected,
        })
    }

    /// Pull each channel's history into signals. Failures are collected per
    /// channel and do not stop the rest.
    pub async fn import_history(
        &self,
        token: &str,
        channel_ids: &[String],
    ) -> Result<ImportReport, RelayError> {
        let channel_ids = if channel_ids.is_empty() {
            self.store.get_selected_channels()?
        } else {
            channel_ids.to_vec()
        };
        if channel_ids.is_empty() {
            return Err(RelayError::Validation("no channels selected".to_string()));
        }

        let (names, metadata_error): (HashMap<String, String>, _) =
            match self.slack.list_channels(token).await {
                Ok(channels) => (channels.into_iter().map(|c| (c.id, c.name)).collect(), None),
                Err(e) => (HashMap::new(), Some(format!("{:#}", e))),
            };

        let mut imported = 0;
        let mut errors = Vec::new();

        for channel_id in channel_ids.iter().map(|id| id.trim()) {
            if channel_id.is_empty() {
                continue;
            }

            let messages = match self.slack.channel_history(token, channel_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(channel = channel_id, "history fetch failed: {:#}", e);
                    errors.push(format!("{}: {:#}", channel_id, e));
                    continue;
                }
            };

            let channel_name = names
                .get(channel_id)
                .filter(|name| !name.is_empty())
                .map(String::as_str)
                .unwrap_or(channel_id);

            let mut skipped_bots = 0;
            for message in &messages {
                let ts = message.ts.trim();
                let text = message.text.trim();
                if ts.is_empty() || text.is_empty() {
                    if message.is_bot() {
                        skipped_bots += 1;
                    }
                    continue;
                }

                let signal = Signal {
                    id: format!("slack:{}:{}", channel_id, ts),
                    source: SIGNAL_SOURCE.to_string(),
                    title: format!("#{} message", channel_name),
                    summary: truncate_chars(text, IMPORT_SUMMARY_CHARS),
                    occurred_at: parse_slack_timestamp(ts).unwrap_or_else(Utc::now),
                    meta: BTreeMap::from([
                        ("eventType".to_string(), "message".to_string()),
                        ("channel".to_string(), channel_id.to_string()),
                        ("channelName".to_string(), channel_name.to_string()),
                        ("user".to_string(), message.user.clone()),
                        ("imported".to_string(), "true".to_string()),
                    ]),
                };

                match self.signals.upsert(&signal).await {
                    Ok(()) => imported += 1,
                    Err(e) => {
                        warn!(signal_id = %signal.id, "failed to store imported message: {}", e);
                        errors.push(format!("{}: failed to store message {}", channel_id, ts));
                    }
                }
            }
            debug!(
                channel = channel_id,
                messages = messages.len(),
                skipped_bots,
                "imported channel history"
            );
        }

        if let Some(e) = metadata_error {
            errors.push(format!("channel metadata refresh failed: {}", e));
        }

        info!(
            channels = channel_ids.len(),
            imported,
            errors = errors.len(),
            "slack history import finished"
        );

        Ok(ImportReport {
            status: "ok",
            total_channels: channel_ids.len(),
            imported_signals: imported,
            errors,
        })
    }
}

/// Keep at most `max` characters, marking a cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
