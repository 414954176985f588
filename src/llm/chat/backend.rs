use async_trait::async_trait;
use log::info;
use rllm::builder::{ LLMBackend, LLMBuilder };
use rllm::chat::{ ChatMessage as BackendMessage, ChatRole, MessageType };

use super::{ full_response_as_stream, ChatClient, ChatError, FragmentStream };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ChatMessage, Role };
use crate::models::generation::GenerationParameters;

/// Providers without a native streaming adapter here. The request goes through
/// the `rllm` backend and the whole answer arrives as one fragment.
pub struct BackendChatClient {
    provider: LlmType,
    backend: LLMBackend,
    api_key: String,
    model: String,
    base_url: Option<String>,
}

impl BackendChatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let (backend, default_model) = match config.llm_type {
            LlmType::Anthropic => (LLMBackend::Anthropic, "claude-3-5-haiku-latest"),
            LlmType::Gemini => (LLMBackend::Google, "gemini-1.5-flash-latest"),
            other => {
                return Err(ChatError::Config(format!("{} is not served by the rllm backend", other)));
            }
        };
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| ChatError::Config(format!("{} API key is required", config.llm_type)))?;

        Ok(Self {
            provider: config.llm_type,
            backend,
            api_key,
            model: config.completion_model.clone().unwrap_or_else(|| default_model.to_string()),
            base_url: config.base_url.clone(),
        })
    }
}

/// Splits off the system prompt, which the backend takes through its builder.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<BackendMessage>) {
    let mut system = None;
    let mut rest = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::System => {
                system = Some(message.content.clone());
                continue;
            }
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        rest.push(BackendMessage {
            role,
            content: message.content.clone(),
            message_type: MessageType::Text,
        });
    }
    (system, rest)
}

#[async_trait]
impl ChatClient for BackendChatClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError> {
        let (system, backend_messages) = split_system(messages);
        let backend = self.backend.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let base_url = self.base_url.clone();
        let parameters = *parameters;

        info!("{} chat via rllm backend, model={}", self.provider, self.model);

        full_response_as_stream(move || async move {
            let mut builder = LLMBuilder::new()
                .backend(backend)
                .api_key(api_key)
                .model(&model)
                .max_tokens(parameters.max_tokens)
                .temperature(parameters.temperature)
                .top_p(parameters.top_p);

            if let Some(prompt) = system {
                builder = builder.system(prompt);
            }
            if let Some(url) = base_url {
                builder = builder.base_url(url);
            }

            let provider = builder.build().map_err(|e| ChatError::Backend(e.to_string()))?;
            let resp = provider
                .chat(&backend_messages).await
                .map_err(|e| ChatError::Backend(e.to_string()))?;

            Ok(
                resp
                    .text()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| resp.to_string())
            )
        })
    }

    fn provider(&self) -> LlmType {
        self.provider
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_is_split_off() {
        let messages = vec![
            ChatMessage::system("sensei"),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
            ChatMessage::user("Bye")
        ];
        let (system, rest) = split_system(&messages);

        assert_eq!(system.as_deref(), Some("sensei"));
        assert_eq!(rest.len(), 3);
        assert!(matches!(rest[1].role, ChatRole::Assistant));
        assert_eq!(rest[2].content, "Bye");
    }

    #[test]
    fn rejects_providers_it_cannot_serve() {
        let config = LlmConfig { llm_type: LlmType::Ollama, ..LlmConfig::default() };
        assert!(matches!(BackendChatClient::from_config(&config), Err(ChatError::Config(_))));
    }

    #[test]
    fn requires_api_key() {
        let config = LlmConfig { llm_type: LlmType::Anthropic, ..LlmConfig::default() };
        assert!(BackendChatClient::from_config(&config).is_err());
    }
}
