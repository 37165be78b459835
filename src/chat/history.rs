use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::Message;
use crate::credentials::Credential;
use crate::error::{ChatError, Result};

/// Prior messages between two users, oldest first as the backend orders them.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load_history(
        &self,
        local_user_id: &str,
        remote_user_id: &str,
        credential: &Credential,
    ) -> Result<Vec<Message>>;
}

/// `GET /api/chats/message-history/{local}/{remote}`
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    client: reqwest::Client,
    api_url: Url,
}

impl HttpHistoryLoader {
    pub fn new(client: reqwest::Client, api_url: Url) -> Self {
        Self { client, api_url }
    }

    pub fn history_url(&self, local_user_id: &str, remote_user_id: &str) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("api url {} cannot be a base", self.api_url)))?
            .pop_if_empty()
            .extend(["api", "chats", "message-history", local_user_id, remote_user_id]);
        Ok(url)
    }
}

#[async_trait]
impl HistorySource for HttpHistoryLoader {
    async fn load_history(
        &self,
        local_user_id: &str,
        remote_user_id: &str,
        credential: &Credential,
    ) -> Result<Vec<Message>> {
        let url = self.history_url(local_user_id, remote_user_id)?;
        debug!("fetching history from {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(credential.token())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::History(format!("server answered {}", status)));
        }

        let messages: Vec<Message> = response
            .json()
            .await
            .map_err(|e| ChatError::History(format!("unreadable history: {}", e)))?;
        debug!("loaded {} history messages", messages.len());
        Ok(messages)
    }
}
