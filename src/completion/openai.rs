//! rig-core backed completion service.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::client::CompletionClient;
use rig::completion::{Chat, CompletionModel};
use rig::message::Message as RigMessage;
use secrecy::ExposeSecret;
use tracing::debug;

use super::{ChatTurn, CompletionService, Role};
use crate::config::CompletionConfig;
use crate::error::CompletionError;

/// Sampling temperature for replies.
const REPLY_TEMPERATURE: f64 = 0.7;

/// Adapts any rig `CompletionModel` to `CompletionService`.
pub struct RigCompletion<M: CompletionModel> {
    model: M,
    provider: String,
    model_name: String,
}

impl<M: CompletionModel> RigCompletion<M> {
    pub fn new(model: M, provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            provider: provider.into(),
            model_name: model_name.into(),
        }
    }
}

fn to_rig_history(context: &[ChatTurn]) -> Vec<RigMessage> {
    context
        .iter()
        .map(|turn| match turn.role {
            Role::User => RigMessage::user(turn.content.clone()),
            Role::Assistant => RigMessage::assistant(turn.content.clone()),
        })
        .collect()
}

#[async_trait]
impl<M> CompletionService for RigCompletion<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.provider
    }

    async fn generate(
        &self,
        system_prompt: &str,
        context: &[ChatTurn],
        new_input: &str,
    ) -> Result<String, CompletionError> {
        let agent = AgentBuilder::new(self.model.clone())
            .preamble(system_prompt)
            .temperature(REPLY_TEMPERATURE)
            .build();

        debug!(
            model = %self.model_name,
            history = context.len(),
            input_len = new_input.len(),
            "Requesting completion"
        );

        let reply = agent
            .chat(new_input.to_string(), to_rig_history(context))
            .await
            .map_err(|e| CompletionError::RequestFailed {
                provider: self.provider.clone(),
                reason: e.to_string(),
            })?;

        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(CompletionError::EmptyReply {
                provider: self.provider.clone(),
            });
        }
        Ok(reply)
    }
}

/// Build the OpenAI-backed completion service.
pub fn create_openai_service(
    config: &CompletionConfig,
) -> Result<std::sync::Arc<dyn CompletionService>, CompletionError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            CompletionError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(std::sync::Arc::new(RigCompletion::new(
        model,
        "openai",
        &config.model,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_preserves_order_and_roles() {
        let history = to_rig_history(&[ChatTurn::user("hi"), ChatTurn::assistant("hello")]);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], RigMessage::User { .. }));
        assert!(matches!(history[1], RigMessage::Assistant { .. }));
    }

    #[test]
    fn openai_service_constructs_without_network() {
        let config = CompletionConfig {
            api_key: secrecy::SecretString::from("sk-test"),
            model: "gpt-4.1-nano".to_string(),
        };
        let service = create_openai_service(&config).unwrap();
        assert_eq!(service.name(), "openai");
    }
}
