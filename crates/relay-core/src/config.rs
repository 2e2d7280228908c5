//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional `relay.toml`, then
//! environment variables. A missing file means defaults; a malformed one is an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relay_auth::{SLACK_API_BASE_URL, SLACK_AUTHORIZE_URL};
use serde::Deserialize;

use crate::setup::DEFAULT_BOT_SCOPES;

pub const CONFIG_FILE_NAME: &str = "relay.toml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_SIGNALS_TABLE: &str = "signals";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Socket address the HTTP server listens on.
    pub bind: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/integrations_state.json`.
    pub state_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/integrations.key`.
    pub key_path: Option<PathBuf>,
    /// Operator secret for the token cipher; the key file is used when unset.
    pub encryption_key: Option<String>,
    pub slack: SlackSettings,
    pub mirror: MirrorSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    pub client_id: String,
    pub client_secret: String,
    pub signing_secret: String,
    pub redirect_url: String,
    pub bot_scopes: String,
    pub app_ui_base_url: String,
    pub api_base_url: String,
    pub authorize_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    pub url: String,
    pub service_key: String,
    pub table: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub workers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            state_path: None,
            key_path: None,
            encryption_key: None,
            slack: SlackSettings::default(),
            mirror: MirrorSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            signing_secret: String::new(),
            redirect_url: String::new(),
            bot_scopes: DEFAULT_BOT_SCOPES.to_string(),
            app_ui_base_url: String::new(),
            api_base_url: SLACK_API_BASE_URL.to_string(),
            authorize_url: SLACK_AUTHORIZE_URL.to_string(),
        }
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            table: DEFAULT_SIGNALS_TABLE.to_string(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            workers: 2,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolve the config file location (`RELAY_CONFIG`, else `relay.toml` in the
    /// data dir), load it and apply the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(None, |key| std::env::var(key).ok())
    }

    /// Same as [`RelayConfig::from_env`] with an explicit config path and a
    /// pluggable variable lookup.
    pub fn from_lookup(
        config_path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => match non_blank(lookup("RELAY_CONFIG")) {
                Some(path) => PathBuf::from(path),
                None => {
                    let data_dir = non_blank(lookup("RELAY_DATA_DIR"))
                        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
                    PathBuf::from(data_dir).join(CONFIG_FILE_NAME)
                }
            },
        };

        let mut config = Self::load(&path)?;
        config.apply_env(lookup);
        Ok(config)
    }

    /// Environment values override whatever the file set, when non-blank.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| non_blank(lookup(key));

        if let Some(dir) = get("RELAY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = get("PORT") {
            self.bind = format!("0.0.0.0:{}", port);
        }
        if let Some(path) = get("INTEGRATIONS_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get("INTEGRATIONS_KEY_PATH") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(key) = get("INTEGRATIONS_ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }

        let slack = &mut self.slack;
        for (key, field) in [
            ("SLACK_CLIENT_ID", &mut slack.client_id),
            ("SLACK_CLIENT_SECRET", &mut slack.client_secret),
            ("SLACK_SIGNING_SECRET", &mut slack.signing_secret),
            ("SLACK_REDIRECT_URL", &mut slack.redirect_url),
            ("SLACK_BOT_SCOPES", &mut slack.bot_scopes),
            ("APP_UI_BASE_URL", &mut slack.app_ui_base_url),
        ] {
            if let Some(value) = get(key) {
                *field = value;
            }
        }

        if let Some(url) = get("SUPABASE_URL") {
            self.mirror.url = url;
        }
        if let Some(key) = get("SUPABASE_SERVICE_ROLE_KEY") {
            self.mirror.service_key = key;
        }
        if let Some(table) = get("SUPABASE_SIGNALS_TABLE") {
            self.mirror.table = table;
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("integrations_state.json"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("integrations.key"))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig::from_lookup(Some(&dir.path().join("missing.toml")), lookup(&[])).unwrap();
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.state_path(), PathBuf::from("data/integrations_state.json"));
        assert_eq!(config.key_path(), PathBuf::from("data/integrations.key"));
        assert_eq!(config.mirror.table, "signals");
        assert_eq!(config.slack.bot_scopes, DEFAULT_BOT_SCOPES);
        assert_eq!(config.queue.capacity, 256);
    }

    #[test]
    fn test_file_then_env_layering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
bind = "127.0.0.1:9000"
data_dir = "/var/lib/relay"

[slack]
client_id = "from-file"
redirect_url = "https://relay.example.com/api/integrations/slack/callback"

[queue]
workers = 4
"#,
        )
        .unwrap();

        let config = RelayConfig::from_lookup(
            Some(&path),
            lookup(&[
                ("SLACK_CLIENT_ID", "from-env"),
                ("SLACK_SIGNING_SECRET", "  "),
                ("SUPABASE_URL", "https://x.supabase.co"),
                ("PORT", "7000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.slack.client_id, "from-env");
        assert_eq!(config.slack.signing_secret, "");
        assert_eq!(
            config.slack.redirect_url,
            "https://relay.example.com/api/integrations/slack/callback"
        );
        assert_eq!(config.bind, "0.0.0.0:7000");
        assert_eq!(config.mirror.url, "https://x.supabase.co");
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.queue.capacity, 256);
        assert_eq!(
            config.state_path(),
            PathBuf::from("/var/lib/relay/integrations_state.json")
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "bind = [").unwrap();
        assert!(RelayConfig::load(&path).is_err());
    }
}
