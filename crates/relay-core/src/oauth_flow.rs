//! Slack install flow: authorize URL, callback completion and disconnect.

use std::sync::Arc;

use chrono::{Duration, Utc};
use relay_auth::{authorize_url, Provider, SlackOAuthClient, TokenCipher};
use relay_ingest::{ConnectionRecord, IntegrationStore};
use serde::Deserialize;
use tracing::{error, info, warn};
use url::Url;

use crate::error::{CallbackError, RelayError};
use crate::setup::{RuntimeSlackConfig, DEFAULT_BOT_SCOPES};

pub const OAUTH_TICKET_TTL_MINUTES: i64 = 10;
pub const CONNECTED_MESSAGE: &str = "Slack workspace connected";

const FALLBACK_APP_URL: &str = "http://localhost:4200/app";

/// Query string Slack appends to the redirect URL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CallbackParams {
    pub state: String,
    pub code: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ConnectionFlow {
    store: Arc<IntegrationStore>,
    cipher: Arc<TokenCipher>,
    oauth: SlackOAuthClient,
    authorize_endpoint: String,
}

impl ConnectionFlow {
    pub fn new(
        store: Arc<IntegrationStore>,
        cipher: Arc<TokenCipher>,
        oauth: SlackOAuthClient,
        authorize_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cipher,
            oauth,
            authorize_endpoint: authorize_endpoint.into(),
        }
    }

    /// Issue a state ticket and build the Slack authorize URL. `force_full`
    /// requests the default scope list regardless of configuration.
    pub fn build_authorization_url(
        &self,
        cfg: &RuntimeSlackConfig,
        force_full: bool,
    ) -> Result<String, RelayError> {
        let missing = cfg.missing_connect_fields();
        if !missing.is_empty() {
            return Err(RelayError::Validation(format!(
                "missing required Slack setup fields: {}",
                missing.join(", ")
            )));
        }

        let scopes = match cfg.bot_scopes.trim() {
            _ if force_full => DEFAULT_BOT_SCOPES,
            "" => DEFAULT_BOT_SCOPES,
            configured => configured,
        };

        let state = self
            .store
            .create_oauth_ticket(Provider::Slack, Duration::minutes(OAUTH_TICKET_TTL_MINUTES))?;

        authorize_url(
            &self.authorize_endpoint,
            &cfg.client_id,
            &cfg.redirect_url,
            scopes,
            &state,
        )
        .map_err(|e| RelayError::Validation(e.to_string()))
    }

    /// Consume the ticket, exchange the code and persist the new connection.
    pub async fn complete_from_callback(
        &self,
        cfg: &RuntimeSlackConfig,
        state: &str,
        code: &str,
    ) -> Result<ConnectionRecord, CallbackError> {
        match self.store.consume_oauth_ticket(state, Provider::Slack) {
            Ok(true) => {}
            Ok(false) => return Err(CallbackError::StateInvalid),
            Err(err) => {
                error!(error = %err, "failed to consume oauth ticket");
                return Err(CallbackError::StateInvalid);
            }
        }

        let access = self
            .oauth
            .exchange_code(&cfg.client_id, &cfg.client_secret, code, &cfg.redirect_url)
            .await
            .map_err(|err| {
                warn!(error = %err, "slack oauth exchange failed");
                CallbackError::ExchangeFailed
            })?;

        if access.access_token.trim().is_empty() || access.team.id.trim().is_empty() {
            return Err(CallbackError::IncompleteUpstreamData);
        }

        let access_token_enc = self.cipher.encrypt(&access.access_token).map_err(|err| {
            error!(error = %err, "slack token encryption failed");
            CallbackError::EncryptionFailed
        })?;

        let now = Utc::now();
        let connection = ConnectionRecord {
            team_id: access.team.id,
            team_name: access.team.name,
            bot_user_id: access.bot_user_id,
            scope: access.scope,
            access_token_enc,
            connected_at: now,
            updated_at: now,
        };
        self.store
            .upsert_connection(connection.clone())
            .map_err(|err| {
                error!(error = %err, "failed to save slack connection");
                CallbackError::PersistFailed
            })?;

        info!(team = %connection.team_id, "slack workspace connected");
        Ok(connection)
    }

    /// Run the whole callback and return the browser redirect target.
    pub async fn handle_callback(&self, cfg: &RuntimeSlackConfig, params: &CallbackParams) -> String {
        let redirect = |status: &str, message: &str| {
            integration_redirect_url(&cfg.app_ui_base_url, status, message)
        };

        let denied = params.error.trim();
        if !denied.is_empty() {
            return redirect("error", &format!("Slack auth was denied: {}", denied));
        }

        let state = params.state.trim();
        let code = params.code.trim();
        if state.is_empty() || code.is_empty() {
            return redirect("error", "Missing OAuth state or code");
        }

        match self.complete_from_callback(cfg, state, code).await {
            Ok(_) => redirect("connected", CONNECTED_MESSAGE),
            Err(err) => redirect("error", &err.to_string()),
        }
    }

    /// Revoke upstream when possible, then forget the connection.
    pub async fn disconnect(&self) -> Result<(), RelayError> {
        if let Some(connection) = self.store.get_connection()? {
            match self.cipher.decrypt(&connection.access_token_enc) {
                Ok(token) if !token.trim().is_empty() => {
                    if let Err(err) = self.oauth.revoke(token.trim()).await {
                        warn!(error = %err, "slack revoke token failed");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stored slack token is unreadable; skipping revoke"),
            }
        }

        self.store.disconnect_connection()?;
        info!("slack workspace disconnected");
        Ok(())
    }
}

const REDIRECT_KEYS: [&str; 3] = ["integration", "status", "message"];

/// UI redirect carrying `integration`, `status` and `message`.
pub fn integration_redirect_url(app_ui_base_url: &str, status: &str, message: &str) -> String {
    let mut target = Url::parse(app_ui_base_url.trim())
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| Url::parse(FALLBACK_APP_URL).ok());

    match target.as_mut() {
        Some(url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| !REDIRECT_KEYS.contains(&key.as_ref()))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            url.set_query(None);
            {
                let mut pairs = url.query_pairs_mut();
                pairs.extend_pairs(&kept);
                pairs.append_pair("integration", Provider::Slack.as_str());
                pairs.append_pair("status", status);
                if !message.is_empty() {
                    pairs.append_pair("message", message);
                }
            }
            url.to_string()
        }
        None => FALLBACK_APP_URL.to_string(),
    }
}
