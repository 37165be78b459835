use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::chat::OrderingPolicy;
use crate::error::{ChatError, Result};

const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Settings from `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local user id, as issued by the backend.
    pub user: Option<String>,
    /// Who to open a conversation with on startup.
    pub peer: Option<String>,
    pub api_url: Option<String>,
    /// Defaults to `<api_url>/chathub`.
    pub hub_url: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub ordering: OrderingPolicy,
    pub skip_negotiation: bool,
}

impl Config {
    /// `<config dir>/bridgeit/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bridgeit")
            .join("config.toml")
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn api_url(&self) -> Result<Url> {
        let raw = self.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        Ok(Url::parse(raw)?)
    }

    pub fn hub_url(&self) -> Result<Url> {
        match &self.hub_url {
            Some(raw) => Ok(Url::parse(raw)?),
            None => {
                let mut url = self.api_url()?;
                let base = url.to_string();
                url.path_segments_mut()
                    .map_err(|_| ChatError::Config(format!("api url {} cannot be a base", base)))?
                    .pop_if_empty()
                    .push("chathub");
                Ok(url)
            }
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(15))
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.http_timeout())
            .build()?)
    }

    pub fn require_user(&self) -> Result<&str> {
        self.user
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ChatError::Config("no local user id (set `user` or pass --user)".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_url().unwrap().as_str(), "http://localhost:5000/");
        assert_eq!(config.hub_url().unwrap().as_str(), "http://localhost:5000/chathub");
        assert_eq!(config.http_timeout(), Duration::from_secs(15));
        assert_eq!(config.ordering, OrderingPolicy::Arrival);
    }

    #[test]
    fn reads_all_keys() {
        let config = Config::parse(
            r#"
            user = "S1"
            peer = "E1"
            api_url = "https://api.bridgeit.example"
            hub_url = "https://rt.bridgeit.example/chathub"
            http_timeout_secs = 5
            ordering = "time-sent"
            skip_negotiation = true
            "#,
        )
        .unwrap();

        assert_eq!(config.require_user().unwrap(), "S1");
        assert_eq!(config.peer.as_deref(), Some("E1"));
        assert_eq!(config.hub_url().unwrap().host_str(), Some("rt.bridgeit.example"));
        assert_eq!(config.ordering, OrderingPolicy::TimeSent);
        assert!(config.skip_negotiation);
    }

    #[test]
    fn hub_url_derives_from_api_path() {
        let config = Config {
            api_url: Some("https://host.example/backend/".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.hub_url().unwrap().as_str(),
            "https://host.example/backend/chathub"
        );

        let opaque = Config {
            api_url: Some("mailto:chat@bridgeit.example".to_string()),
            ..Config::default()
        };
        assert!(matches!(opaque.hub_url(), Err(ChatError::Config(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("colour = \"red\"").is_err());
    }

    #[test]
    fn missing_user_is_a_config_error() {
        let config = Config {
            user: Some("  ".to_string()),
            ..Config::default()
        };
        assert!(matches!(config.require_user(), Err(ChatError::Config(_))));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("bridgeit_no_such_config.toml");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
