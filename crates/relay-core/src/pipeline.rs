//! Turns accepted webhook events into signals.
//!
//! The HTTP handler only records and enqueues; a small pool of workers drains
//! the bounded queue and drives each event to a terminal status.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use relay_ingest::{EventStatus, IntegrationStore, Signal, SignalStore, StoreError};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueSettings;
use crate::slack::parse_slack_timestamp;
use crate::webhook::WebhookEnvelope;

pub const SIGNAL_SOURCE: &str = "Slack";

const QUEUE_CLOSED: &str = "processing queue closed";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InnerEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: String,
    text: String,
    user: String,
    bot_id: String,
    channel: String,
    ts: String,
}

impl InnerEvent {
    fn is_bot(&self) -> bool {
        self.subtype == "bot_message" || !self.bot_id.trim().is_empty()
    }
}

/// Title shown for an event type.
pub fn signal_title(event_type: &str) -> &'static str {
    match event_type {
        "app_mention" => "Slack app mention",
        "message" => "Slack channel message",
        _ => "Slack activity",
    }
}

#[derive(Clone)]
pub struct EventPipeline {
    store: Arc<IntegrationStore>,
    signals: Arc<dyn SignalStore>,
}

impl EventPipeline {
    pub fn new(store: Arc<IntegrationStore>, signals: Arc<dyn SignalStore>) -> Self {
        Self { store, signals }
    }

    /// Run one event to a terminal status and record it in the audit trail.
    pub async fn process(&self, envelope: &WebhookEnvelope) -> EventStatus {
        let (status, reason) = self.evaluate(envelope).await;
        match status {
            EventStatus::Processed => {
                debug!(event_id = %envelope.event_id, "slack event processed")
            }
            EventStatus::Failed => {
                warn!(event_id = %envelope.event_id, reason = reason.unwrap_or_default(), "slack event failed")
            }
            _ => {
                info!(event_id = %envelope.event_id, reason = reason.unwrap_or_default(), "slack event ignored")
            }
        }
        self.mark(&envelope.event_id, status, reason).await;
        status
    }

    async fn evaluate(&self, envelope: &WebhookEnvelope) -> (EventStatus, Option<&'static str>) {
        let ignored = |reason| (EventStatus::Ignored, Some(reason));
        let failed = |reason| (EventStatus::Failed, Some(reason));

        let Some(event) = envelope
            .event
            .as_ref()
            .and_then(|raw| serde_json::from_str::<InnerEvent>(raw.get()).ok())
        else {
            return failed("unable to decode inner event");
        };

        if event.kind.trim().is_empty() {
            return ignored("unknown event type");
        }
        if event.is_bot() {
            return ignored("bot message");
        }

        let selected = match self.store.get_selected_channels() {
            Ok(selected) => selected,
            Err(e) => {
                warn!("failed to read selected channels: {}", e);
                return failed("unable to read selected channels");
            }
        };
        if selected.is_empty() {
            return ignored("no channels selected");
        }
        if !selected.iter().any(|id| *id == event.channel) {
            return ignored("channel not selected");
        }

        let signal = build_signal(envelope, &event, Utc::now());
        if let Err(e) = self.signals.upsert(&signal).await {
            warn!(signal_id = %signal.id, "failed to persist signal: {}", e);
            return failed("unable to persist signal");
        }
        (EventStatus::Processed, None)
    }

    async fn mark(&self, event_id: &str, status: EventStatus, reason: Option<&str>) {
        match record_status(&self.store, event_id, status, reason).await {
            Ok(true) => {}
            Ok(false) => debug!(event_id, "event no longer in audit trail"),
            Err(e) => warn!(event_id, "failed to record event status: {}", e),
        }
    }
}

async fn record_status(
    store: &Arc<IntegrationStore>,
    event_id: &str,
    status: EventStatus,
    reason: Option<&str>,
) -> Result<bool, StoreError> {
    let event_id = event_id.to_string();
    let reason = reason.map(str::to_string);
    store
        .blocking(move |store| store.update_event_status(&event_id, status, reason))
        .await
}

fn build_signal(envelope: &WebhookEnvelope, event: &InnerEvent, now: DateTime<Utc>) -> Signal {
    let summary = match event.text.trim() {
        "" => format!("Slack {} event received", event.kind),
        text => text.to_string(),
    };
    let occurred_at = parse_slack_timestamp(&event.ts)
        .or_else(|| {
            (envelope.event_time > 0)
                .then(|| DateTime::from_timestamp(envelope.event_time, 0))
                .flatten()
        })
        .unwrap_or(now);

    let meta = BTreeMap::from([
        ("eventType".to_string(), event.kind.clone()),
        ("channel".to_string(), event.channel.clone()),
        ("user".to_string(), event.user.clone()),
        ("teamId".to_string(), envelope.team_id.clone()),
    ]);

    Signal {
        id: envelope.event_id.clone(),
        source: SIGNAL_SOURCE.to_string(),
        title: signal_title(&event.kind).to_string(),
        summary,
        occurred_at,
        meta,
    }
}

/// Bounded hand-off between webhook handlers and pipeline workers.
pub struct EventQueue {
    sender: Mutex<Option<mpsc::Sender<WebhookEnvelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<IntegrationStore>,
}

impl EventQueue {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(pipeline: EventPipeline, settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let store = pipeline.store.clone();

        let workers = (0..settings.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(envelope) = next else { break };
                        pipeline.process(&envelope).await;
                    }
                    debug!(worker, "pipeline worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            store,
        }
    }

    /// Hand an event to the workers, waiting for room when the queue is full.
    pub async fn enqueue(&self, envelope: WebhookEnvelope) {
        let sender = self.sender.lock().ok().and_then(|guard| guard.clone());
        let Some(sender) = sender else {
            self.reject(&envelope.event_id).await;
            return;
        };
        if let Err(mpsc::error::SendError(envelope)) = sender.send(envelope).await {
            self.reject(&envelope.event_id).await;
        }
    }

    async fn reject(&self, event_id: &str) {
        warn!(event_id, "pipeline queue closed, event not processed");
        if let Err(e) =
            record_status(&self.store, event_id, EventStatus::Failed, Some(QUEUE_CLOSED)).await
        {
            warn!(event_id, "failed to record event status: {}", e);
        }
    }

    /// Stop accepting events and wait for queued ones to finish.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("pipeline worker panicked: {}", e);
            }
        }
        info!("event pipeline drained");
    }
}
