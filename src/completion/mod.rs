//! Completion capability: turns a prompt plus history into reply text.

pub mod openai;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CompletionError;

pub use openai::{RigCompletion, create_openai_service};

/// Speaker of a context turn, from the model's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior message handed to the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Reply generation service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Provider name for logs and API-call stats.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        system_prompt: &str,
        context: &[ChatTurn],
        new_input: &str,
    ) -> Result<String, CompletionError>;
}

/// Run a completion call under the per-call timeout and the stop signal.
pub async fn bounded(
    timeout: Duration,
    cancel: &CancellationToken,
    call: impl Future<Output = Result<String, CompletionError>>,
) -> Result<String, CompletionError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CompletionError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner,
            Err(_) => Err(CompletionError::Timeout { timeout }),
        },
    }
}
