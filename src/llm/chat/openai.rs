use async_trait::async_trait;
use log::{ debug, info };
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;

use super::{ bearer_headers, http_stream_generate, ChatClient, ChatError, FragmentStream, StreamLine };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::ChatMessage;
use crate::models::generation::GenerationParameters;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Request body shared by every OpenAI-style chat completions endpoint.
#[derive(Serialize, Debug)]
pub(crate) struct OpenAIChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
}

impl<'a> OpenAIChatRequest<'a> {
    pub fn streaming(
        model: &'a str,
        messages: &'a [ChatMessage],
        parameters: &GenerationParameters
    ) -> Self {
        Self {
            model,
            messages,
            max_tokens: parameters.max_tokens,
            temperature: parameters.temperature,
            top_p: parameters.top_p,
            stream: true,
        }
    }
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

fn describe_error(error: &JsonValue) -> String {
    match error {
        JsonValue::String(message) => message.clone(),
        JsonValue::Object(fields) =>
            fields
                .get("message")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// Parses one Server-Sent Events line of a chat completions stream.
pub fn parse_sse_line(line: &str) -> Result<StreamLine, ChatError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(StreamLine::Ignore);
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Ignore);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let event: OpenAIStreamResponse = serde_json::from_str(data).map_err(|e| {
        debug!("JSON parse error: {} for data: {}", e, data);
        ChatError::Malformed(format!("{}: {}", e, data))
    })?;

    if let Some(error) = event.error {
        return Err(ChatError::Upstream(describe_error(&error)));
    }

    let content = event.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default();
    Ok(StreamLine::Delta(content))
}

/// Client for OpenAI and OpenAI-compatible chat completions APIs (Groq included).
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    endpoint: String,
    provider: LlmType,
}

impl OpenAIChatClient {
    pub fn new(
        provider: LlmType,
        api_key: &str,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, ChatError> {
        let (default_model, default_url) = match provider {
            LlmType::Groq => ("llama-3.1-8b-instant", GROQ_CHAT_URL),
            _ => ("gpt-4o-mini", OPENAI_CHAT_URL),
        };
        let model = model.unwrap_or_else(|| default_model.to_string());
        let endpoint = base_url
            .map(|url| chat_completions_url(&url))
            .unwrap_or_else(|| default_url.to_string());

        let http = HttpClient::builder().default_headers(bearer_headers(api_key)?).build()?;

        info!("{} chat client targeting {} with model {}", provider, endpoint, model);
        Ok(Self { http, model, endpoint, provider })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| ChatError::Config(format!("{} API key is required", config.llm_type)))?;
        Self::new(
            config.llm_type,
            &api_key,
            config.completion_model.clone(),
            config.base_url.clone()
        )
    }
}

/// Accepts either a full endpoint or an API root such as `http://host:8080/v1`.
pub(crate) fn chat_completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else if trimmed.ends_with("/v1") {
        format!("{}/chat/completions", trimmed)
    } else {
        format!("{}/v1/chat/completions", trimmed)
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError> {
        let req = OpenAIChatRequest::streaming(&self.model, messages, parameters);
        http_stream_generate(self.http.post(&self.endpoint).json(&req), parse_sse_line).await
    }

    fn provider(&self) -> LlmType {
        self.provider
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}
