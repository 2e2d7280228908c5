use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_auth::{resolve_encryption_secret, Provider, SlackOAuthClient, TokenCipher};
use relay_ingest::{
    EventStatus, IntegrationStore, LocalSignalStore, MirroredSignalStore, RawEventRecord,
    RemoteSignalMirror, Signal, SignalStore,
};
use serde::Serialize;
use tracing::{info, warn};

pub mod catalog;
pub mod config;
pub mod error;
pub mod oauth_flow;
pub mod pipeline;
pub mod setup;
pub mod slack;
pub mod webhook;

pub use catalog::{ChannelCatalog, ChannelListing, ImportReport, SelectionUpdate};
pub use config::{MirrorSettings, QueueSettings, RelayConfig, SlackSettings};
pub use error::{CallbackError, RelayError, WebhookError};
pub use oauth_flow::{integration_redirect_url, CallbackParams, ConnectionFlow};
pub use pipeline::{EventPipeline, EventQueue};
pub use setup::{
    RequestOrigin, RuntimeSlackConfig, SetupUpdate, SetupView, ValidationReport,
    DEFAULT_BOT_SCOPES,
};
pub use slack::{ChannelSummary, SlackApi};
pub use webhook::{verify_signature, WebhookAck, WebhookDispatcher, WebhookEnvelope};

pub const DEFAULT_EVENTS_LIMIT: usize = 50;
pub const MAX_EVENTS_LIMIT: usize = 200;

const DISCONNECTED_DETAIL: &str = "Connect for real-time alerts";

/// Row in the integrations overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSummary {
    pub provider: &'static str,
    pub name: &'static str,
    pub status: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Audit record without its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAudit {
    pub event_id: String,
    pub team_id: String,
    pub event_type: String,
    pub event_time: i64,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<RawEventRecord> for EventAudit {
    fn from(record: RawEventRecord) -> Self {
        Self {
            event_id: record.event_id,
            team_id: record.team_id,
            event_type: record.event_type,
            event_time: record.event_time,
            received_at: record.received_at,
            status: record.status,
            error: record.error,
        }
    }
}

/// Every long-lived component, built once at startup and shared by handlers.
pub struct Relay {
    pub config: RelayConfig,
    pub store: Arc<IntegrationStore>,
    pub cipher: Arc<TokenCipher>,
    pub signals: Arc<dyn SignalStore>,
    flow: ConnectionFlow,
    catalog: ChannelCatalog,
    queue: Arc<EventQueue>,
    webhooks: WebhookDispatcher,
}

impl Relay {
    /// Open state, resolve the cipher key and start the pipeline workers.
    pub async fn init(config: RelayConfig) -> Result<Self> {
        info!("Initializing relay...");
        let secret = resolve_encryption_secret(config.encryption_key.as_deref(), &config.key_path())?;
        let cipher = Arc::new(TokenCipher::new(&secret).context("invalid token encryption key")?);

        let state_path = config.state_path();
        let store = Arc::new(
            IntegrationStore::open(&state_path)
                .with_context(|| format!("failed to open state file {}", state_path.display()))?,
        );

        let local: Arc<dyn SignalStore> = Arc::new(LocalSignalStore::new(store.clone()));
        let remote = RemoteSignalMirror::from_settings(
            &config.mirror.url,
            &config.mirror.service_key,
            &config.mirror.table,
        )
        .map(|mirror| Arc::new(mirror) as Arc<dyn SignalStore>);
        if remote.is_some() {
            info!(table = %config.mirror.table, "remote signal mirror enabled");
        }
        let signals: Arc<dyn SignalStore> = Arc::new(MirroredSignalStore::new(local, remote));

        let slack = SlackApi::new(&config.slack.api_base_url);
        let flow = ConnectionFlow::new(
            store.clone(),
            cipher.clone(),
            SlackOAuthClient::new(&config.slack.api_base_url),
            &config.slack.authorize_url,
        );
        let catalog = ChannelCatalog::new(slack, store.clone(), signals.clone());
        let pipeline = EventPipeline::new(store.clone(), signals.clone());
        let queue = Arc::new(EventQueue::start(pipeline, config.queue));
        let webhooks = WebhookDispatcher::new(store.clone(), queue.clone());

        Ok(Self {
            config,
            store,
            cipher,
            signals,
            flow,
            catalog,
            queue,
            webhooks,
        })
    }

    /// Effective Slack configuration from settings plus persisted setup.
    pub fn runtime_config(&self) -> Result<RuntimeSlackConfig, RelayError> {
        let setup = self.store.get_setup()?;
        RuntimeSlackConfig::resolve(&self.config.slack, setup.as_ref(), &self.cipher)
    }

    /// Decrypted bot token of the current connection.
    pub fn bot_token(&self) -> Result<String, RelayError> {
        let connection = self.store.get_connection()?.ok_or(RelayError::NotConnected)?;
        let token = self.cipher.decrypt(&connection.access_token_enc)?;
        match token.trim() {
            "" => Err(RelayError::NotConnected),
            token => Ok(token.to_string()),
        }
    }

    pub fn integrations(&self) -> Result<Vec<IntegrationSummary>, RelayError> {
        let mut summary = IntegrationSummary {
            provider: Provider::Slack.as_str(),
            name: Provider::Slack.display_name(),
            status: "Disconnected",
            detail: DISCONNECTED_DETAIL.to_string(),
            connected_at: None,
        };

        if let Some(connection) = self.store.get_connection()? {
            let selected = self.store.get_selected_channels()?.len();
            let events = self.store.raw_event_count()?;
            summary.status = "Connected";
            summary.connected_at = Some(connection.connected_at);
            summary.detail = format!(
                "{} workspace connected ({} selected channels, {} events received)",
                connection.team_name, selected, events
            );
        }

        Ok(vec![summary])
    }

    pub fn setup_view(&self, origin: &RequestOrigin) -> Result<SetupView, RelayError> {
        let cfg = self.runtime_config()?;
        let setup = self.store.get_setup()?;
        let workspace = self.store.get_connection()?.map(|c| c.team_name);
        Ok(SetupView::build(&cfg, origin, setup.as_ref(), workspace))
    }

    pub fn save_setup(
        &self,
        origin: &RequestOrigin,
        update: SetupUpdate,
    ) -> Result<SetupView, RelayError> {
        let existing = self.store.get_setup()?;
        let setup = update.merge(existing.as_ref(), origin, &self.cipher, Utc::now())?;
        self.store.upsert_setup(setup)?;
        info!("slack setup saved");
        self.setup_view(origin)
    }

    pub fn validate_setup(&self, origin: &RequestOrigin) -> Result<ValidationReport, RelayError> {
        let cfg = self.runtime_config()?.with_origin(origin);
        Ok(ValidationReport::for_config(&cfg))
    }

    pub fn connect_url(&self, origin: &RequestOrigin, force_full: bool) -> Result<String, RelayError> {
        let cfg = self.runtime_config()?.with_origin(origin);
        self.flow.build_authorization_url(&cfg, force_full)
    }

    /// Finish the browser round trip; always yields a redirect target.
    pub async fn handle_callback(&self, origin: &RequestOrigin, params: &CallbackParams) -> String {
        match self.runtime_config() {
            Ok(cfg) => self.flow.handle_callback(&cfg.with_origin(origin), params).await,
            Err(e) => {
                warn!("failed to resolve slack setup for callback: {}", e);
                integration_redirect_url(
                    &origin.app_ui_base_url,
                    "error",
                    "Failed to resolve Slack setup",
                )
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), RelayError> {
        self.flow.disconnect().await
    }

    /// Authenticate and dispatch an Events API delivery.
    pub async fn receive_webhook(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookAck, WebhookError> {
        let cfg = self.runtime_config().map_err(|e| {
            warn!("failed to resolve slack signing secret: {}", e);
            WebhookError::AuthFailed("failed to resolve Slack signing secret".to_string())
        })?;
        verify_signature(&cfg.signing_secret, timestamp, signature, body, Utc::now())?;
        self.webhooks.dispatch(body).await
    }

    pub async fn list_channels(&self) -> Result<ChannelListing, RelayError> {
        let token = self.bot_token()?;
        self.catalog.list_channels(&token).await
    }

    pub async fn update_selection(&self, channel_ids: &[String]) -> Result<SelectionUpdate, RelayError> {
        let token = self.bot_token()?;
        self.catalog.update_selection(&token, channel_ids).await
    }

    pub async fn import_history(&self, channel_ids: &[String]) -> Result<ImportReport, RelayError> {
        let token = self.bot_token()?;
        self.catalog.import_history(&token, channel_ids).await
    }

    /// Newest audit records first; `0` means the default page size.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventAudit>, RelayError> {
        let limit = match limit {
            0 => DEFAULT_EVENTS_LIMIT,
            n => n.min(MAX_EVENTS_LIMIT),
        };
        Ok(self
            .store
            .recent_raw_events(limit)?
            .into_iter()
            .map(EventAudit::from)
            .collect())
    }

    pub async fn list_signals(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Signal>, RelayError> {
        let limit = relay_ingest::normalize_limit(limit);
        Ok(self.signals.list(source, limit).await?)
    }

    /// Stop accepting events and drain the pipeline.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use httpmock::prelude::*;
    use relay_ingest::ConnectionRecord;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir, api_base: &str) -> RelayConfig {
        let mut config = RelayConfig {
            data_dir: dir.path().to_path_buf(),
            ..RelayConfig::default()
        };
        config.slack.client_id = "123.456".to_string();
        config.slack.client_secret = "client-secret".to_string();
        config.slack.signing_secret = "signing-secret".to_string();
        config.slack.api_base_url = api_base.to_string();
        config
    }

    fn connect(relay: &Relay, token: &str) {
        let now = Utc::now();
        relay
            .store
            .upsert_connection(ConnectionRecord {
                team_id: "T1".to_string(),
                team_name: "Acme".to_string(),
                bot_user_id: "UBOT".to_string(),
                scope: "channels:read".to_string(),
                access_token_enc: relay.cipher.encrypt(token).unwrap(),
                connected_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_creates_key_and_state() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::init(config(&dir, "http://127.0.0.1:9")).await.unwrap();
        assert!(dir.path().join("integrations.key").exists());
        assert!(dir.path().join("integrations_state.json").exists());
        assert!(matches!(relay.bot_token(), Err(RelayError::NotConnected)));

        let summary = relay.integrations().unwrap();
        assert_eq!(summary[0].status, "Disconnected");
        assert_eq!(summary[0].detail, "Connect for real-time alerts");
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_integrations_detail_when_connected() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::init(config(&dir, "http://127.0.0.1:9")).await.unwrap();
        connect(&relay, "xoxb-1");
        relay
            .store
            .set_selected_channels(vec!["C1".to_string(), "C2".to_string()])
            .unwrap();

        assert_eq!(relay.bot_token().unwrap(), "xoxb-1");
        let summary = relay.integrations().unwrap();
        assert_eq!(summary[0].status, "Connected");
        assert_eq!(
            summary[0].detail,
            "Acme workspace connected (2 selected channels, 0 events received)"
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_signed_webhook_produces_signal() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::init(config(&dir, "http://127.0.0.1:9")).await.unwrap();
        relay.store.set_selected_channels(vec!["C1".to_string()]).unwrap();

        let body = br#"{"type":"event_callback","event_id":"E1","team_id":"T1","event":{"type":"message","text":"ship it","channel":"C1","ts":"1704067200.000100"}}"#;
        let ts = Utc::now().timestamp().to_string();
        let sig = webhook::sign("signing-secret", &ts, body);

        let ack = relay.receive_webhook(Some(&ts), Some(&sig), body).await.unwrap();
        assert_eq!(ack, WebhookAck::Accepted);
        let stale = (Utc::now() - Duration::minutes(10)).timestamp().to_string();
        let stale_sig = webhook::sign("signing-secret", &stale, body);
        assert!(matches!(
            relay.receive_webhook(Some(&stale), Some(&stale_sig), body).await,
            Err(WebhookError::AuthFailed(_))
        ));
        relay.shutdown().await;

        let signals = relay.list_signals(None, 0).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].id, "E1");
        assert_eq!(signals[0].title, "Slack channel message");

        let events = relay.recent_events(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Processed);
    }

    #[tokio::test]
    async fn test_channels_require_connection_then_use_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/conversations.list")
                    .header("authorization", "Bearer xoxb-live");
                then.status(200).json_body(json!({
                    "ok": true,
                    "channels": [{"id": "C1", "name": "general"}]
                }));
            })
            .await;

        let dir = TempDir::new().unwrap();
        let relay = Relay::init(config(&dir, &server.base_url())).await.unwrap();
        assert!(matches!(relay.list_channels().await, Err(RelayError::NotConnected)));

        connect(&relay, "xoxb-live");
        let listing = relay.list_channels().await.unwrap();
        mock.assert_async().await;
        assert_eq!(listing.total, 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_saved_setup_feeds_connect_url() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, "http://127.0.0.1:9");
        cfg.slack.client_secret.clear();
        let relay = Relay::init(cfg).await.unwrap();
        let origin = RequestOrigin::default();

        assert!(matches!(
            relay.connect_url(&origin, false),
            Err(RelayError::Validation(_))
        ));
        assert!(!relay.validate_setup(&origin).unwrap().ready_for_connect);

        let update: SetupUpdate =
            serde_json::from_value(json!({"clientSecret": "stored-secret"})).unwrap();
        let view = relay.save_setup(&origin, update).unwrap();
        assert!(view.config.has_client_secret);
        assert!(view.status.ready_for_connect);

        let url = relay.connect_url(&origin, false).unwrap();
        assert!(url.starts_with("https://slack.com/oauth/v2/authorize?"));
        assert!(url.contains("client_id=123.456"));
        relay.shutdown().await;
    }
}
