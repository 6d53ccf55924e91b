//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::auth::{StoredToken, TokenStore};
use crate::calling::relay::RetryPolicy;
use crate::calling::transport::{default_ice_servers, IceServer, RtcConfig};
use crate::calling::CallSettings;

/// Hosted backend project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Project base URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Public anon key sent as `apikey`
    pub anon_key: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:54321".to_string(),
            anon_key: String::new(),
        }
    }
}

/// Calling behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallingSettings {
    /// NAT-traversal servers handed to the peer transport
    pub ice_servers: Vec<IceServer>,
    /// Backoff for signal writes
    pub signal_retry: RetryPolicy,
    /// How long an outgoing call rings before it is marked missed
    pub ring_timeout_secs: u64,
    /// How long a failed call stays on screen before closing
    pub failure_close_delay_secs: u64,
}

impl Default for CallingSettings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            signal_retry: RetryPolicy::default(),
            ring_timeout_secs: 45,
            failure_close_delay_secs: 3,
        }
    }
}

impl CallingSettings {
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            rtc: RtcConfig {
                ice_servers: self.ice_servers.clone(),
            },
            signal_retry: self.signal_retry,
        }
    }
}

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signed-in user id (auth `sub`)
    pub user_id: Option<String>,
    /// Signed-in user email (display only)
    pub email: Option<String>,
    /// Stored refresh token
    pub refresh_token: Option<String>,
    /// Stored access token (JWT)
    pub access_token: Option<StoredToken>,
    pub backend: BackendSettings,
    pub calling: CallingSettings,
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "callrelay", "callrelay")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config file")?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("CALLRELAY_URL") {
            config.backend.url = url;
        }
        if let Ok(key) = std::env::var("CALLRELAY_ANON_KEY") {
            config.backend.anon_key = key;
        }

        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Signed-in user id, or an error telling the user to log in.
    pub fn require_user_id(&self) -> Result<String> {
        self.user_id
            .clone()
            .context("Not signed in. Run 'callrelay login' first.")
    }
}

impl TokenStore for Config {
    fn get_access_token(&self) -> Option<StoredToken> {
        self.access_token.clone()
    }

    fn set_access_token(&mut self, token: String, expires_in: Option<u64>) {
        self.access_token = Some(StoredToken::new(token, expires_in));
    }

    fn get_refresh_token(&self) -> Option<String> {
        self.refresh_token.clone()
    }

    fn set_refresh_token(&mut self, token: String) {
        self.refresh_token = Some(token);
    }

    fn clear_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.user_id = None;
        self.email = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.user_id.is_none());
        assert_eq!(config.calling.ring_timeout_secs, 45);
        assert_eq!(config.calling.signal_retry, RetryPolicy::default());
        assert!(!config.calling.ice_servers.is_empty());
    }

    #[test]
    fn test_partial_calling_section() {
        let config = Config::parse(
            r#"
user_id = "u-1"

[backend]
url = "https://proj.example.co"
anon_key = "anon"

[calling]
ring_timeout_secs = 10

[[calling.ice_servers]]
urls = ["stun:stun.example.org:3478"]
"#,
        )
        .unwrap();
        assert_eq!(config.require_user_id().unwrap(), "u-1");
        assert_eq!(config.backend.url, "https://proj.example.co");
        assert_eq!(config.calling.ring_timeout_secs, 10);
        assert_eq!(config.calling.failure_close_delay_secs, 3);
        assert_eq!(config.calling.ice_servers.len(), 1);
        assert_eq!(
            config.calling.call_settings().rtc.ice_servers[0].urls[0],
            "stun:stun.example.org:3478"
        );
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let mut config = Config::default();
        config.user_id = Some("u-2".into());
        config.set_access_token("jwt".into(), Some(3600));
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.user_id.as_deref(), Some("u-2"));
        assert_eq!(parsed.get_access_token().unwrap().token, "jwt");
    }

    #[test]
    fn test_clear_tokens_signs_out() {
        let mut config = Config::default();
        config.user_id = Some("u".into());
        config.set_refresh_token("r".into());
        config.clear_tokens();
        assert!(config.require_user_id().is_err());
        assert!(config.get_refresh_token().is_none());
    }
}
