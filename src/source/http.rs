//! HTTP bridge source — talks JSON to a messaging bridge service.
//!
//! The bridge owns the platform session. Endpoints (relative to the base URL):
//!
//! - `GET  /health`
//! - `GET  /threads/pending` → `[{"id", "username"?}]`
//! - `GET  /threads/inbox` → `[{"id", "username"?}]`
//! - `GET  /threads/{id}/messages` → `[{"id", "text"?, "from_self", "timestamp"}]`
//! - `POST /threads/{id}/approve`
//! - `POST /threads/{id}/messages` with `{"text"}`
//!
//! Messages without text (media) are dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use super::MessageSource;
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::model::{Author, Message, Thread, ThreadStatus};

#[derive(Debug, Deserialize)]
struct ThreadDto {
    id: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDto {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    from_self: bool,
    timestamp: DateTime<Utc>,
}

/// MessageSource backed by an HTTP bridge.
pub struct HttpSource {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    /// Startup check: the bridge is reachable and accepts our credentials.
    pub async fn verify(&self) -> Result<(), SourceError> {
        let resp = self
            .authorize(self.client.get(self.url("/health")))
            .send()
            .await
            .map_err(|e| request_failed("health", e))?;
        check_status("health", resp).await?;
        info!(base_url = %self.base_url, "Message source reachable");
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, SourceError> {
        let resp = self
            .authorize(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(|e| request_failed(operation, e))?;
        let resp = check_status(operation, resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SourceError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }

    async fn post(
        &self,
        operation: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), SourceError> {
        let resp = self
            .authorize(self.client.post(self.url(path)))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failed(operation, e))?;
        check_status(operation, resp).await?;
        Ok(())
    }

    async fn list_threads(
        &self,
        operation: &str,
        path: &str,
        status: ThreadStatus,
    ) -> Result<Vec<Thread>, SourceError> {
        let threads: Vec<ThreadDto> = self.get_json(operation, path).await?;
        Ok(threads
            .into_iter()
            .map(|t| Thread {
                id: t.id,
                username: t.username,
                last_synced_at: None,
                status,
            })
            .collect())
    }
}

fn request_failed(operation: &str, err: reqwest::Error) -> SourceError {
    SourceError::RequestFailed {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
}

async fn check_status(
    operation: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SourceError::AuthFailed(format!("{operation}: {status} {body}")));
    }
    Err(SourceError::RequestFailed {
        operation: operation.to_string(),
        reason: format!("{status}: {body}"),
    })
}

#[async_trait]
impl MessageSource for HttpSource {
    async fn list_pending_threads(&self) -> Result<Vec<Thread>, SourceError> {
        self.list_threads("list_pending_threads", "/threads/pending", ThreadStatus::PendingApproval)
            .await
    }

    async fn list_inbox_threads(&self) -> Result<Vec<Thread>, SourceError> {
        self.list_threads("list_inbox_threads", "/threads/inbox", ThreadStatus::Active)
            .await
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>, SourceError> {
        let raw: Vec<MessageDto> = self
            .get_json("fetch_messages", &format!("/threads/{thread_id}/messages"))
            .await?;
        let total = raw.len();
        let messages: Vec<Message> = raw
            .into_iter()
            .filter_map(|m| {
                let text = m.text.filter(|t| !t.trim().is_empty())?;
                Some(Message {
                    id: m.id,
                    thread_id: thread_id.to_string(),
                    author: if m.from_self { Author::Bot } else { Author::Customer },
                    body: text,
                    created_at: m.timestamp,
                    overridden: false,
                    // Anything already on the source was delivered.
                    sent: m.from_self,
                })
            })
            .collect();
        if messages.len() < total {
            debug!(thread_id, skipped = total - messages.len(), "Dropped non-text messages");
        }
        Ok(messages)
    }

    async fn approve_thread_request(&self, thread_id: &str) -> Result<(), SourceError> {
        self.post(
            "approve_thread_request",
            &format!("/threads/{thread_id}/approve"),
            serde_json::json!({}),
        )
        .await
    }

    async fn send_message(&self, thread_id: &str, body: &str) -> Result<(), SourceError> {
        self.post(
            "send_message",
            &format!("/threads/{thread_id}/messages"),
            serde_json::json!({ "text": body }),
        )
        .await
    }

    async fn mark_thread_seen(&self, thread_id: &str) -> Result<(), SourceError> {
        self.post(
            "mark_thread_seen",
            &format!("/threads/{thread_id}/seen"),
            serde_json::json!({}),
        )
        .await
    }
}
