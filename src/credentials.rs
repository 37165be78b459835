use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ChatError, Result};

/// Bearer token the backend issued at login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(ChatError::AuthMissing);
        }
        Ok(Self(token))
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(rename = "jwtToken", default, skip_serializing_if = "Option::is_none")]
    jwt_token: Option<String>,
}

/// Where the bearer token survives between runs.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/bridgeit/credentials.toml`
    pub fn default_location() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(data_dir.join("bridgeit").join("credentials.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token. A missing file, key or blank value all mean signed out.
    pub async fn load(&self) -> Result<Credential> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no credential file at {}", self.path.display());
                return Err(ChatError::AuthMissing);
            }
            Err(e) => return Err(e.into()),
        };

        let file: CredentialFile = toml::from_str(&content)
            .map_err(|e| ChatError::Config(format!("{}: {}", self.path.display(), e)))?;
        Credential::new(file.jwt_token.unwrap_or_default())
    }

    pub async fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = CredentialFile {
            jwt_token: Some(credential.token().to_string()),
        };
        let content = toml::to_string(&file).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(&self.path, content).await?;
        info!("stored credential at {}", self.path.display());
        Ok(())
    }

    /// Forget the token. Succeeds when there was nothing to forget.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("removed credential at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
