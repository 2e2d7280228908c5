//! Inbound Events API deliveries: signature check, envelope parsing and dedup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use relay_ingest::{IntegrationStore, NewRawEvent};
use serde::Deserialize;
use serde_json::value::RawValue;
use sha2::Sha256;
use tracing::{debug, info};

use crate::error::WebhookError;
use crate::pipeline::EventQueue;

pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

const SIGNATURE_VERSION: &str = "v0";
const MAX_TIMESTAMP_SKEW_SECS: u64 = 5 * 60;

type HmacSha256 = Hmac<Sha256>;

/// Check a delivery against the signing secret. The timestamp must be within
/// five minutes of `now` in either direction.
pub fn verify_signature(
    signing_secret: &str,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let auth = |msg: &str| WebhookError::AuthFailed(msg.to_string());

    if signing_secret.trim().is_empty() {
        return Err(auth("slack signing secret is not configured"));
    }

    let timestamp = timestamp.map(str::trim).filter(|t| !t.is_empty());
    let signature = signature.map(str::trim).filter(|s| !s.is_empty());
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return Err(auth("missing Slack signature headers"));
    };

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| auth("invalid Slack timestamp header"))?;
    if now.timestamp().abs_diff(ts) > MAX_TIMESTAMP_SKEW_SECS {
        return Err(auth("stale Slack request timestamp"));
    }

    let provided = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or_else(|| auth("invalid Slack signature"))?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|_| auth("invalid Slack signing secret"))?;
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| auth("invalid Slack signature"))
}

/// Hex signature Slack would send for `body` at `timestamp`.
pub fn sign(signing_secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(signing_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}:{}:", SIGNATURE_VERSION, timestamp).as_bytes());
    mac.update(body);
    format!("{}={}", SIGNATURE_VERSION, hex::encode(mac.finalize().into_bytes()))
}

/// Outer Events API envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub challenge: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_time: i64,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub event: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct EventTypeProbe {
    #[serde(default, rename = "type")]
    kind: String,
}

impl WebhookEnvelope {
    /// Inner event type, falling back to the envelope type.
    pub fn event_type(&self) -> String {
        self.event
            .as_ref()
            .and_then(|raw| serde_json::from_str::<EventTypeProbe>(raw.get()).ok())
            .map(|probe| probe.kind)
            .filter(|kind| !kind.trim().is_empty())
            .unwrap_or_else(|| self.kind.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    /// `url_verification` handshake; echo the value back.
    Challenge(String),
    Accepted,
    Duplicate,
    Ignored,
}

impl WebhookAck {
    pub fn status(&self) -> &'static str {
        match self {
            WebhookAck::Challenge(_) => "challenge",
            WebhookAck::Accepted => "ok",
            WebhookAck::Duplicate => "duplicate",
            WebhookAck::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<IntegrationStore>,
    queue: Arc<EventQueue>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<IntegrationStore>, queue: Arc<EventQueue>) -> Self {
        Self { store, queue }
    }

    /// Route an authenticated body. New events are recorded and queued; the
    /// caller is answered without waiting for processing.
    pub async fn dispatch(&self, body: &[u8]) -> Result<WebhookAck, WebhookError> {
        let text = std::str::from_utf8(body).map_err(|_| WebhookError::InvalidPayload)?;
        let envelope: WebhookEnvelope =
            serde_json::from_str(text).map_err(|_| WebhookError::InvalidPayload)?;

        match envelope.kind.as_str() {
            "url_verification" => return Ok(WebhookAck::Challenge(envelope.challenge)),
            "event_callback" => {}
            other => {
                debug!(kind = other, "ignoring webhook envelope");
                return Ok(WebhookAck::Ignored);
            }
        }

        if envelope.event_id.trim().is_empty() {
            return Err(WebhookError::MissingEventId);
        }

        let payload =
            RawValue::from_string(text.to_string()).map_err(|_| WebhookError::InvalidPayload)?;
        let record = NewRawEvent {
            event_id: envelope.event_id.clone(),
            team_id: envelope.team_id.clone(),
            event_type: envelope.event_type(),
            event_time: envelope.event_time,
            payload,
        };
        let is_new = self
            .store
            .blocking(move |store| store.record_event(record))
            .await
            .map_err(WebhookError::Persist)?;

        if !is_new {
            info!(event_id = %envelope.event_id, "duplicate slack event");
            return Ok(WebhookAck::Duplicate);
        }

        self.queue.enqueue(envelope).await;
        Ok(WebhookAck::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_531_420_618, 0).unwrap()
    }

    #[test]
    fn test_valid_signature_passes() {
        let body = br#"{"type":"event_callback"}"#;
        let ts = now().timestamp().to_string();
        let sig = sign(SECRET, &ts, body);
        assert!(sig.starts_with("v0="));
        verify_signature(SECRET, Some(&ts), Some(&sig), body, now()).unwrap();
    }

    #[test]
    fn test_tampered_body_fails() {
        let ts = now().timestamp().to_string();
        let sig = sign(SECRET, &ts, b"original");
        let err = verify_signature(SECRET, Some(&ts), Some(&sig), b"tampered", now()).unwrap_err();
        assert_eq!(err.to_string(), "invalid Slack signature");
    }

    #[test]
    fn test_stale_timestamp_fails_even_with_valid_signature() {
        let body = b"{}";
        for offset in [Duration::seconds(301), Duration::seconds(-301)] {
            let ts = (now() + offset).timestamp().to_string();
            let sig = sign(SECRET, &ts, body);
            let err = verify_signature(SECRET, Some(&ts), Some(&sig), body, now()).unwrap_err();
            assert_eq!(err.to_string(), "stale Slack request timestamp");
        }

        let ts = (now() - Duration::seconds(299)).timestamp().to_string();
        let sig = sign(SECRET, &ts, body);
        verify_signature(SECRET, Some(&ts), Some(&sig), body, now()).unwrap();
    }

    #[test]
    fn test_extreme_timestamps_are_stale() {
        for ts in [i64::MIN.to_string(), i64::MAX.to_string()] {
            let err = verify_signature(SECRET, Some(&ts), Some("v0=00"), b"{}", now()).unwrap_err();
            assert_eq!(err.to_string(), "stale Slack request timestamp");
        }
    }

    #[test]
    fn test_missing_or_malformed_headers_fail() {
        let body = b"{}";
        let ts = now().timestamp().to_string();
        let sig = sign(SECRET, &ts, body);

        for (t, s) in [(None, Some(sig.as_str())), (Some(ts.as_str()), None), (Some(""), Some(sig.as_str()))] {
            assert!(matches!(
                verify_signature(SECRET, t, s, body, now()),
                Err(WebhookError::AuthFailed(_))
            ));
        }
        assert!(verify_signature(SECRET, Some("yesterday"), Some(&sig), body, now()).is_err());
        assert!(verify_signature(SECRET, Some(&ts), Some("v1=abc"), body, now()).is_err());
        assert!(verify_signature(SECRET, Some(&ts), Some("v0=zz"), body, now()).is_err());
        assert!(verify_signature("", Some(&ts), Some(&sig), body, now()).is_err());
    }

    fn dispatcher(dir: &tempfile::TempDir) -> (WebhookDispatcher, Arc<EventQueue>, Arc<IntegrationStore>) {
        use crate::config::QueueSettings;
        use crate::pipeline::EventPipeline;
        use relay_ingest::LocalSignalStore;

        let store = Arc::new(IntegrationStore::open(&dir.path().join("state.json")).unwrap());
        let pipeline = EventPipeline::new(store.clone(), Arc::new(LocalSignalStore::new(store.clone())));
        let queue = Arc::new(EventQueue::start(pipeline, QueueSettings::default()));
        (WebhookDispatcher::new(store.clone(), queue.clone()), queue, store)
    }

    #[tokio::test]
    async fn test_dispatch_challenge_and_ignored_kinds() {
        let dir = tempfile::TempDir::new().unwrap();
        let (dispatcher, queue, store) = dispatcher(&dir);

        let ack = dispatcher
            .dispatch(br#"{"type":"url_verification","challenge":"abc123"}"#)
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Challenge("abc123".to_string()));

        let ack = dispatcher.dispatch(br#"{"type":"app_rate_limited"}"#).await.unwrap();
        assert_eq!(ack, WebhookAck::Ignored);

        assert!(matches!(
            dispatcher.dispatch(b"not json").await,
            Err(WebhookError::InvalidPayload)
        ));
        assert!(matches!(
            dispatcher.dispatch(br#"{"type":"event_callback","event":{"type":"message"}}"#).await,
            Err(WebhookError::MissingEventId)
        ));

        queue.shutdown().await;
        assert_eq!(store.raw_event_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let (dispatcher, queue, store) = dispatcher(&dir);
        store.set_selected_channels(vec!["C1".to_string()]).unwrap();

        let body = br#"{"type":"event_callback","event_id":"E1","team_id":"T1","event_time":1704067200,"event":{"type":"message","text":"ship it","channel":"C1","ts":"1704067200.000100"}}"#;
        assert_eq!(dispatcher.dispatch(body).await.unwrap(), WebhookAck::Accepted);
        assert_eq!(dispatcher.dispatch(body).await.unwrap(), WebhookAck::Duplicate);
        queue.shutdown().await;

        let events = store.recent_raw_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message");
        assert_eq!(events[0].payload.get(), std::str::from_utf8(body).unwrap());

        let signals = store.list_signals(None, 10).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].summary, "ship it");
    }

    #[test]
    fn test_envelope_event_type() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{"type":"event_callback","event_id":"E1","event":{"type":"app_mention","text":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event_type(), "app_mention");

        let envelope: WebhookEnvelope =
            serde_json::from_str(r#"{"type":"event_callback","event_id":"E1"}"#).unwrap();
        assert_eq!(envelope.event_type(), "event_callback");
    }
}
