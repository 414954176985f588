use async_trait::async_trait;
use log::{ info, warn };
use reqwest::Client as HttpClient;

use super::openai::{ chat_completions_url, parse_sse_line, OpenAIChatRequest };
use super::{ bearer_headers, http_stream_generate, ChatClient, ChatError, FragmentStream };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::ChatMessage;
use crate::models::generation::GenerationParameters;

pub const DEFAULT_MODEL: &str = "HuggingFaceH4/zephyr-7b-beta";
pub const DEFAULT_BASE_URL: &str = "https://router.huggingface.co/hf-inference/models";

/// Hugging Face serverless inference, which speaks the chat completions
/// protocol under a per-model route.
pub struct HuggingFaceChatClient {
    http: HttpClient,
    model: String,
    endpoint: String,
}

impl HuggingFaceChatClient {
    pub fn new(
        api_key: Option<String>,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, ChatError> {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let endpoint = model_endpoint(base_url.as_deref().unwrap_or(DEFAULT_BASE_URL), &model);

        let api_key = api_key.unwrap_or_default();
        if api_key.is_empty() {
            warn!("No Hugging Face token configured; anonymous requests are heavily rate limited");
        }
        let http = HttpClient::builder().default_headers(bearer_headers(&api_key)?).build()?;

        info!("Hugging Face chat client targeting {}", endpoint);
        Ok(Self { http, model, endpoint })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        if config.llm_type != LlmType::HuggingFace {
            return Err(ChatError::Config("Invalid config type for HuggingFaceChatClient".into()));
        }
        Self::new(config.api_key.clone(), config.completion_model.clone(), config.base_url.clone())
    }
}

/// A base URL that already names a chat completions route (e.g. a dedicated
/// endpoint) is used as is; otherwise the model id is appended.
fn model_endpoint(base_url: &str, model: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") || trimmed.ends_with("/v1") {
        chat_completions_url(trimmed)
    } else {
        format!("{}/{}/v1/chat/completions", trimmed, model)
    }
}

#[async_trait]
impl ChatClient for HuggingFaceChatClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError> {
        let req = OpenAIChatRequest::streaming(&self.model, messages, parameters);
        http_stream_generate(self.http.post(&self.endpoint).json(&req), parse_sse_line).await
    }

    fn provider(&self) -> LlmType {
        LlmType::HuggingFace
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}
