use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };

use super::{ http_stream_generate, ChatClient, ChatError, FragmentStream, StreamLine };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::ChatMessage;
use crate::models::generation::GenerationParameters;

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

/// Parses one line of Ollama's newline-delimited JSON chat stream.
pub fn parse_ndjson_line(line: &str) -> Result<StreamLine, ChatError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine::Ignore);
    }
    let resp: StreamResponse = serde_json::from_str(line).map_err(|e| {
        debug!("JSON parse error: {} for line: {}", e, line);
        ChatError::Malformed(format!("{}: {}", e, line))
    })?;

    if let Some(error) = resp.error {
        return Err(ChatError::Upstream(error));
    }
    let content = resp.message.map(|m| m.content).unwrap_or_default();
    if resp.done {
        Ok(StreamLine::Last(content))
    } else {
        Ok(StreamLine::Delta(content))
    }
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Result<Self, ChatError> {
        let model = completion_model.unwrap_or_else(|| "llama3.2".to_string());
        let url = base_url.unwrap_or_else(|| "http://localhost:11434".into());

        Ok(Self {
            http: HttpClient::builder().build()?,
            base_url: url,
            completion_model: model,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        if config.llm_type != LlmType::Ollama {
            return Err(ChatError::Config("Invalid config type for OllamaClient".into()));
        }

        Self::new(config.base_url.clone(), config.completion_model.clone())
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let req = ChatRequest {
            model: &self.completion_model,
            messages,
            stream: true,
            options: ChatOptions {
                num_predict: parameters.max_tokens,
                temperature: parameters.temperature,
                top_p: parameters.top_p,
            },
        };
        http_stream_generate(self.http.post(&url).json(&req), parse_ndjson_line).await
    }

    fn provider(&self) -> LlmType {
        LlmType::Ollama
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
