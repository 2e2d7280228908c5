//! Slack app setup: runtime resolution, operator updates and the setup view.

use chrono::{DateTime, Utc};
use relay_auth::TokenCipher;
use relay_ingest::SetupConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::SlackSettings;
use crate::error::RelayError;

pub const DEFAULT_BOT_SCOPES: &str = "app_mentions:read,channels:history,channels:read,chat:write,groups:history,groups:read,im:history,im:read,mpim:history,mpim:read,reactions:read,team:read,users:read,users:read.email,files:read";

pub const CALLBACK_PATH: &str = "/api/integrations/slack/callback";
pub const WEBHOOK_PATH: &str = "/api/integrations/slack/webhook";
pub const APP_UI_PATH: &str = "/app/integration/slack";

const DEFAULT_HOST: &str = "localhost:8080";
const DEFAULT_APP_UI_BASE_URL: &str = "http://localhost:4200/app/integration/slack";

const READY_MESSAGE: &str = "Slack setup is ready. You can connect a workspace from Integrations.";
const INCOMPLETE_MESSAGE: &str = "Slack setup is incomplete. Fill missing fields in the setup form.";

/// URLs inferred from the incoming request, used when nothing is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub base_url: String,
    pub app_ui_base_url: String,
}

impl Default for RequestOrigin {
    fn default() -> Self {
        Self {
            base_url: format!("http://{}", DEFAULT_HOST),
            app_ui_base_url: DEFAULT_APP_UI_BASE_URL.to_string(),
        }
    }
}

impl RequestOrigin {
    /// Build from request headers. Forwarded headers win over `Host`; only the
    /// first comma-separated forwarded value is used.
    pub fn infer(
        forwarded_proto: Option<&str>,
        forwarded_host: Option<&str>,
        host: Option<&str>,
        origin: Option<&str>,
    ) -> Self {
        let first = |value: Option<&str>| {
            value
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let scheme = first(forwarded_proto).unwrap_or_else(|| "http".to_string());
        let host = first(forwarded_host)
            .or_else(|| host.map(str::trim).filter(|h| !h.is_empty()).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let app_ui_base_url = origin
            .map(str::trim)
            .and_then(|o| Url::parse(o).ok())
            .filter(|u| u.has_host())
            .map(|mut u| {
                u.set_path(APP_UI_PATH);
                u.set_query(None);
                u.set_fragment(None);
                u.to_string()
            })
            .unwrap_or_else(|| DEFAULT_APP_UI_BASE_URL.to_string());

        Self {
            base_url: format!("{}://{}", scheme, host),
            app_ui_base_url,
        }
    }

    pub fn redirect_url(&self) -> String {
        format!("{}{}", self.base_url, CALLBACK_PATH)
    }

    pub fn webhook_url(&self) -> String {
        format!("{}{}", self.base_url, WEBHOOK_PATH)
    }
}

/// Effective Slack app configuration with secrets in plaintext.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RuntimeSlackConfig {
    pub client_id: String,
    pub client_secret: String,
    pub signing_secret: String,
    pub redirect_url: String,
    pub bot_scopes: String,
    pub app_ui_base_url: String,
}

impl std::fmt::Debug for RuntimeSlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSlackConfig")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("bot_scopes", &self.bot_scopes)
            .field("app_ui_base_url", &self.app_ui_base_url)
            .finish_non_exhaustive()
    }
}

impl RuntimeSlackConfig {
    /// Merge process settings with the persisted setup. Stored client id and
    /// scopes win; stored URLs only fill gaps; stored secrets are decrypted.
    pub fn resolve(
        settings: &SlackSettings,
        setup: Option<&SetupConfig>,
        cipher: &TokenCipher,
    ) -> Result<Self, RelayError> {
        let mut cfg = Self {
            client_id: settings.client_id.trim().to_string(),
            client_secret: settings.client_secret.trim().to_string(),
            signing_secret: settings.signing_secret.trim().to_string(),
            redirect_url: settings.redirect_url.trim().to_string(),
            bot_scopes: settings.bot_scopes.trim().to_string(),
            app_ui_base_url: settings.app_ui_base_url.trim().to_string(),
        };
        if cfg.bot_scopes.is_empty() {
            cfg.bot_scopes = DEFAULT_BOT_SCOPES.to_string();
        }

        let Some(setup) = setup else {
            return Ok(cfg);
        };

        if !setup.client_id.trim().is_empty() {
            cfg.client_id = setup.client_id.trim().to_string();
        }
        if cfg.redirect_url.is_empty() {
            cfg.redirect_url = setup.redirect_url.trim().to_string();
        }
        if !setup.bot_scopes.trim().is_empty() {
            cfg.bot_scopes = setup.bot_scopes.trim().to_string();
        }
        if cfg.app_ui_base_url.is_empty() {
            cfg.app_ui_base_url = setup.app_ui_base_url.trim().to_string();
        }
        if !setup.client_secret_enc.trim().is_empty() {
            let secret = cipher
                .decrypt(&setup.client_secret_enc)
                .map_err(|e| RelayError::Encryption(format!("decrypt slack client secret: {}", e)))?;
            cfg.client_secret = secret.trim().to_string();
        }
        if !setup.signing_secret_enc.trim().is_empty() {
            let secret = cipher
                .decrypt(&setup.signing_secret_enc)
                .map_err(|e| RelayError::Encryption(format!("decrypt slack signing secret: {}", e)))?;
            cfg.signing_secret = secret.trim().to_string();
        }
        Ok(cfg)
    }

    /// Fill blank redirect and UI URLs from the request.
    pub fn with_origin(mut self, origin: &RequestOrigin) -> Self {
        if self.redirect_url.trim().is_empty() {
            self.redirect_url = origin.redirect_url();
        }
        if self.app_ui_base_url.trim().is_empty() {
            self.app_ui_base_url = origin.app_ui_base_url.clone();
        }
        if self.bot_scopes.trim().is_empty() {
            self.bot_scopes = DEFAULT_BOT_SCOPES.to_string();
        }
        self
    }

    /// Fields an operator still has to provide before a workspace can connect.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.client_id.trim().is_empty() {
            missing.push("clientId");
        }
        if self.client_secret.trim().is_empty() {
            missing.push("clientSecret");
        }
        if self.signing_secret.trim().is_empty() {
            missing.push("signingSecret");
        }
        missing
    }

    /// Connect additionally needs a redirect URL.
    pub fn missing_connect_fields(&self) -> Vec<&'static str> {
        let mut missing = self.missing_fields();
        if self.redirect_url.trim().is_empty() {
            missing.push("redirectUrl");
        }
        missing
    }

    /// Webhook URL to paste into the Slack app: the redirect URL's origin when
    /// it is absolute, otherwise the request-inferred one.
    pub fn suggested_webhook_url(&self, origin: &RequestOrigin) -> String {
        Url::parse(self.redirect_url.trim())
            .ok()
            .filter(|u| u.has_host())
            .map(|mut u| {
                u.set_path(WEBHOOK_PATH);
                u.set_query(None);
                u.set_fragment(None);
                u.to_string()
            })
            .unwrap_or_else(|| origin.webhook_url())
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetupUpdate {
    pub client_id: String,
    pub client_secret: String,
    pub signing_secret: String,
    pub redirect_url: String,
    pub bot_scopes: String,
    #[serde(rename = "appUIBaseURL", alias = "appUiBaseUrl")]
    pub app_ui_base_url: String,
}

impl std::fmt::Debug for SetupUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupUpdate")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("bot_scopes", &self.bot_scopes)
            .field("app_ui_base_url", &self.app_ui_base_url)
            .finish_non_exhaustive()
    }
}

impl SetupUpdate {
    /// Produce the setup record to persist. Blank secrets keep the stored ciphertext.
    pub fn merge(
        self,
        existing: Option<&SetupConfig>,
        origin: &RequestOrigin,
        cipher: &TokenCipher,
        now: DateTime<Utc>,
    ) -> Result<SetupConfig, RelayError> {
        let blank = SetupConfig::default();
        let existing = existing.unwrap_or(&blank);

        let mut redirect_url = self.redirect_url.trim().to_string();
        if redirect_url.is_empty() {
            redirect_url = match existing.redirect_url.trim() {
                "" => origin.redirect_url(),
                stored => stored.to_string(),
            };
        }

        let mut bot_scopes = self.bot_scopes.trim().to_string();
        if bot_scopes.is_empty() {
            bot_scopes = match existing.bot_scopes.trim() {
                "" => DEFAULT_BOT_SCOPES.to_string(),
                stored => stored.to_string(),
            };
        }

        let mut app_ui_base_url = self.app_ui_base_url.trim().to_string();
        if app_ui_base_url.is_empty() {
            app_ui_base_url = match existing.app_ui_base_url.trim() {
                "" => origin.app_ui_base_url.clone(),
                stored => stored.to_string(),
            };
        }

        if !is_absolute_url(&redirect_url) {
            return Err(RelayError::Validation(
                "redirectUrl must be a valid absolute URL".to_string(),
            ));
        }
        if !is_absolute_url(&app_ui_base_url) {
            return Err(RelayError::Validation(
                "appUIBaseURL must be a valid absolute URL".to_string(),
            ));
        }

        let client_secret_enc = match self.client_secret.trim() {
            "" => existing.client_secret_enc.clone(),
            secret => cipher
                .encrypt(secret)
                .map_err(|_| RelayError::Encryption("failed to encrypt client secret".to_string()))?,
        };
        let signing_secret_enc = match self.signing_secret.trim() {
            "" => existing.signing_secret_enc.clone(),
            secret => cipher
                .encrypt(secret)
                .map_err(|_| RelayError::Encryption("failed to encrypt signing secret".to_string()))?,
        };

        Ok(SetupConfig {
            client_id: self.client_id.trim().to_string(),
            redirect_url,
            bot_scopes,
            app_ui_base_url,
            client_secret_enc,
            signing_secret_enc,
            updated_at: Some(now),
        })
    }
}

fn is_absolute_url(value: &str) -> bool {
    Url::parse(value).map(|u| u.has_host()).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfigView {
    pub client_id: String,
    pub redirect_url: String,
    pub bot_scopes: String,
    #[serde(rename = "appUIBaseURL")]
    pub app_ui_base_url: String,
    pub has_client_secret: bool,
    pub has_signing_secret: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub suggested_webhook_url: String,
    pub suggested_redirect_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatusView {
    pub ready_for_connect: bool,
    pub missing_fields: Vec<&'static str>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupView {
    pub config: SetupConfigView,
    pub status: SetupStatusView,
}

impl SetupView {
    pub fn build(
        cfg: &RuntimeSlackConfig,
        origin: &RequestOrigin,
        setup: Option<&SetupConfig>,
        workspace: Option<String>,
    ) -> Self {
        let cfg = cfg.clone().with_origin(origin);
        let missing = cfg.missing_fields();
        Self {
            config: SetupConfigView {
                client_id: cfg.client_id.clone(),
                redirect_url: cfg.redirect_url.clone(),
                bot_scopes: cfg.bot_scopes.clone(),
                app_ui_base_url: cfg.app_ui_base_url.clone(),
                has_client_secret: !cfg.client_secret.trim().is_empty(),
                has_signing_secret: !cfg.signing_secret.trim().is_empty(),
                updated_at: setup.and_then(|s| s.updated_at),
                suggested_webhook_url: cfg.suggested_webhook_url(origin),
                suggested_redirect_url: cfg.redirect_url.clone(),
            },
            status: SetupStatusView {
                ready_for_connect: missing.is_empty(),
                missing_fields: missing,
                connected: workspace.is_some(),
                workspace,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ready_for_connect: bool,
    pub missing_fields: Vec<&'static str>,
    pub message: &'static str,
}

impl ValidationReport {
    pub fn for_config(cfg: &RuntimeSlackConfig) -> Self {
        let missing = cfg.missing_fields();
        let ready = missing.is_empty();
        Self {
            ready_for_connect: ready,
            missing_fields: missing,
            message: if ready { READY_MESSAGE } else { INCOMPLETE_MESSAGE },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new("test-key").unwrap()
    }

    #[test]
    fn test_origin_prefers_forwarded_headers() {
        let origin = RequestOrigin::infer(
            Some("https, http"),
            Some("relay.example.com, proxy.internal"),
            Some("10.0.0.1:8080"),
            Some("https://app.example.com/some/page?x=1"),
        );
        assert_eq!(origin.base_url, "https://relay.example.com");
        assert_eq!(
            origin.redirect_url(),
            "https://relay.example.com/api/integrations/slack/callback"
        );
        assert_eq!(
            origin.app_ui_base_url,
            "https://app.example.com/app/integration/slack"
        );
    }

    #[test]
    fn test_origin_defaults() {
        let origin = RequestOrigin::infer(None, None, None, Some("not a url"));
        assert_eq!(origin, RequestOrigin::default());
        let origin = RequestOrigin::infer(None, None, Some("api.local:3000"), None);
        assert_eq!(origin.base_url, "http://api.local:3000");
    }

    #[test]
    fn test_resolve_merges_setup() {
        let cipher = cipher();
        let settings = SlackSettings {
            client_id: "env-id".into(),
            redirect_url: "https://env.example.com/cb".into(),
            bot_scopes: "".into(),
            ..SlackSettings::default()
        };
        let setup = SetupConfig {
            client_id: "stored-id".into(),
            redirect_url: "https://stored.example.com/cb".into(),
            bot_scopes: "channels:read".into(),
            app_ui_base_url: "https://ui.example.com/app".into(),
            client_secret_enc: cipher.encrypt("shh").unwrap(),
            signing_secret_enc: cipher.encrypt("sign").unwrap(),
            updated_at: None,
        };

        let cfg = RuntimeSlackConfig::resolve(&settings, Some(&setup), &cipher).unwrap();
        assert_eq!(cfg.client_id, "stored-id");
        assert_eq!(cfg.redirect_url, "https://env.example.com/cb");
        assert_eq!(cfg.bot_scopes, "channels:read");
        assert_eq!(cfg.app_ui_base_url, "https://ui.example.com/app");
        assert_eq!(cfg.client_secret, "shh");
        assert_eq!(cfg.signing_secret, "sign");
        assert!(cfg.missing_fields().is_empty());
    }

    #[test]
    fn test_resolve_fails_on_undecryptable_secret() {
        let setup = SetupConfig {
            client_secret_enc: TokenCipher::new("other").unwrap().encrypt("x").unwrap(),
            ..SetupConfig::default()
        };
        let err = RuntimeSlackConfig::resolve(&SlackSettings::default(), Some(&setup), &cipher())
            .unwrap_err();
        assert!(matches!(err, RelayError::Encryption(_)));
    }

    #[test]
    fn test_missing_fields() {
        let cfg = RuntimeSlackConfig {
            client_id: "id".into(),
            ..RuntimeSlackConfig::default()
        };
        assert_eq!(cfg.missing_fields(), vec!["clientSecret", "signingSecret"]);
        assert_eq!(
            cfg.missing_connect_fields(),
            vec!["clientSecret", "signingSecret", "redirectUrl"]
        );
    }

    #[test]
    fn test_merge_keeps_stored_values_for_blanks() {
        let cipher = cipher();
        let existing = SetupConfig {
            client_id: "old".into(),
            redirect_url: "https://stored.example.com/cb".into(),
            bot_scopes: "chat:write".into(),
            app_ui_base_url: "https://ui.example.com".into(),
            client_secret_enc: "sealed-secret".into(),
            signing_secret_enc: "sealed-signing".into(),
            updated_at: None,
        };
        let update = SetupUpdate {
            client_id: " new ".into(),
            signing_secret: "fresh".into(),
            ..SetupUpdate::default()
        };

        let now = Utc::now();
        let merged = update
            .merge(Some(&existing), &RequestOrigin::default(), &cipher, now)
            .unwrap();
        assert_eq!(merged.client_id, "new");
        assert_eq!(merged.redirect_url, "https://stored.example.com/cb");
        assert_eq!(merged.bot_scopes, "chat:write");
        assert_eq!(merged.app_ui_base_url, "https://ui.example.com");
        assert_eq!(merged.client_secret_enc, "sealed-secret");
        assert_eq!(cipher.decrypt(&merged.signing_secret_enc).unwrap(), "fresh");
        assert_eq!(merged.updated_at, Some(now));
    }

    #[test]
    fn test_merge_defaults_without_existing() {
        let merged = SetupUpdate::default()
            .merge(None, &RequestOrigin::default(), &cipher(), Utc::now())
            .unwrap();
        assert_eq!(
            merged.redirect_url,
            "http://localhost:8080/api/integrations/slack/callback"
        );
        assert_eq!(merged.bot_scopes, DEFAULT_BOT_SCOPES);
        assert!(merged.client_secret_enc.is_empty());
    }

    #[test]
    fn test_merge_rejects_relative_urls() {
        let update = SetupUpdate {
            redirect_url: "/callback".into(),
            ..SetupUpdate::default()
        };
        let err = update
            .merge(None, &RequestOrigin::default(), &cipher(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(msg) if msg.contains("redirectUrl")));

        let update = SetupUpdate {
            app_ui_base_url: "nope".into(),
            ..SetupUpdate::default()
        };
        let err = update
            .merge(None, &RequestOrigin::default(), &cipher(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(msg) if msg.contains("appUIBaseURL")));
    }

    #[test]
    fn test_suggested_webhook_uses_redirect_origin() {
        let cfg = RuntimeSlackConfig {
            redirect_url: "https://relay.example.com/custom/cb?x=1".into(),
            ..RuntimeSlackConfig::default()
        };
        assert_eq!(
            cfg.suggested_webhook_url(&RequestOrigin::default()),
            "https://relay.example.com/api/integrations/slack/webhook"
        );

        let cfg = RuntimeSlackConfig::default();
        assert_eq!(
            cfg.suggested_webhook_url(&RequestOrigin::default()),
            "http://localhost:8080/api/integrations/slack/webhook"
        );
    }

    #[test]
    fn test_setup_update_accepts_wire_names() {
        let update: SetupUpdate = serde_json::from_str(
            r#"{"clientId":"a","clientSecret":"b","appUIBaseURL":"https://ui.example.com"}"#,
        )
        .unwrap();
        assert_eq!(update.client_id, "a");
        assert_eq!(update.client_secret, "b");
        assert_eq!(update.app_ui_base_url, "https://ui.example.com");
    }

    #[test]
    fn test_validation_report_messages() {
        let ready = RuntimeSlackConfig {
            client_id: "a".into(),
            client_secret: "b".into(),
            signing_secret: "c".into(),
            ..RuntimeSlackConfig::default()
        };
        assert_eq!(ValidationReport::for_config(&ready).message, READY_MESSAGE);
        let report = ValidationReport::for_config(&RuntimeSlackConfig::default());
        assert!(!report.ready_for_connect);
        assert_eq!(report.message, INCOMPLETE_MESSAGE);
    }
}
