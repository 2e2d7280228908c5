pub mod cipher;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use oauth2::{basic::BasicClient, AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use cipher::{ensure_key_file, random_hex, resolve_encryption_secret, CipherError, TokenCipher};

pub const SLACK_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
pub const SLACK_API_BASE_URL: &str = "https://slack.com/api";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(12);
const REVOKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Slack,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Slack => "slack",
        }
    }

    /// Name used for signal sources and user-facing labels.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Slack => "Slack",
        }
    }
}

/// Build the browser URL that starts the install flow.
///
/// `scopes` is the comma separated list Slack expects; it is passed through as a
/// single scope value so the separator survives.
pub fn authorize_url(
    endpoint: &str,
    client_id: &str,
    redirect_url: &str,
    scopes: &str,
    state: &str,
) -> Result<String> {
    let auth_url = AuthUrl::new(endpoint.to_string()).map_err(|_| anyhow!("invalid auth_url"))?;
    let mut client = BasicClient::new(ClientId::new(client_id.to_string())).set_auth_uri(auth_url);
    if !redirect_url.trim().is_empty() {
        client = client.set_redirect_uri(
            RedirectUrl::new(redirect_url.to_string()).map_err(|_| anyhow!("invalid redirect_url"))?,
        );
    }

    let state = state.to_string();
    let mut req = client.authorize_url(move || CsrfToken::new(state));
    if !scopes.trim().is_empty() {
        req = req.add_scope(Scope::new(scopes.to_string()));
    }
    let (url, _csrf) = req.url();
    Ok(url.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthTeam {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Body of `oauth.v2.access`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthAccess {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub bot_user_id: String,
    #[serde(default)]
    pub team: OAuthTeam,
}

#[derive(Debug, Deserialize)]
struct RevokeResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackOAuthClient {
    http_client: Client,
    api_base: String,
}

impl SlackOAuthClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http_client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_url: &str,
    ) -> Result<OAuthAccess> {
        let url = format!("{}/oauth.v2.access", self.api_base);
        let mut form = vec![
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
        ];
        if !redirect_url.trim().is_empty() {
            form.push(("redirect_uri", redirect_url));
        }

        let resp = self
            .http_client
            .post(&url)
            .timeout(EXCHANGE_TIMEOUT)
            .form(&form)
            .send()
            .await
            .context("oauth.v2.access request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("oauth.v2.access HTTP {} - {}", status, body));
        }

        let access: OAuthAccess = resp
            .json()
            .await
            .context("failed to decode oauth.v2.access response")?;
        if !access.ok {
            return Err(anyhow!(
                "oauth.v2.access error: {}",
                access.error.as_deref().unwrap_or("unknown_error")
            ));
        }

        info!(team = %access.team.id, "exchanged OAuth code for slack token");
        Ok(access)
    }

    pub async fn revoke(&self, token: &str) -> Result<()> {
        let url = format!("{}/auth.revoke", self.api_base);
        let resp = self
            .http_client
            .post(&url)
            .timeout(REVOKE_TIMEOUT)
            .form(&[("token", token)])
            .send()
            .await
            .context("auth.revoke request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("auth.revoke HTTP {} - {}", status, body));
        }

        let body: RevokeResponse = resp.json().await.context("failed to decode auth.revoke response")?;
        if !body.ok {
            let reason = body.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(%reason, "slack token revoke rejected");
            return Err(anyhow!("auth.revoke error: {}", reason));
        }
        Ok(())
    }
}
