pub mod backend;
pub mod huggingface;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use log::debug;
use once_cell::sync::OnceCell;
use reqwest::header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE };
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ LlmConfig, LlmType };
use self::backend::BackendChatClient;
use self::huggingface::HuggingFaceChatClient;
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use crate::models::chat::ChatMessage;
use crate::models::generation::GenerationParameters;

/// Failure of the external completion call. The relay treats every variant alike.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed stream event: {0}")]
    Malformed(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Submits the ordered messages with `stream` enabled and returns the
    /// incremental content fragments.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError>;

    fn provider(&self) -> LlmType;
    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

/// What a single line of a streaming response means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Delta(String),
    /// Final content; nothing follows it.
    Last(String),
    Done,
    Ignore,
}

pub type LineParser = fn(&str) -> Result<StreamLine, ChatError>;

/// Reassembles lines from arbitrarily split network chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

pub(crate) fn bearer_headers(api_key: &str) -> Result<HeaderMap, ChatError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !api_key.is_empty() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ChatError::Config(format!("Invalid API key format: {}", e))
            )?
        );
    }
    Ok(headers)
}

/// Sends `request` and relays the parsed lines of the response body.
///
/// Connection and status errors are returned directly. Once streaming has
/// started, errors arrive as the last stream item. The body is dropped as soon
/// as the returned stream is.
pub async fn http_stream_generate(
    request: reqwest::RequestBuilder,
    line_parser: LineParser
) -> Result<FragmentStream, ChatError> {
    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChatError::Status { status: status.as_u16(), body });
    }

    create_streaming_response(move |tx| async move {
        let mut bytes = resp.bytes_stream();
        let mut lines = LineBuffer::default();

        loop {
            let chunk = tokio::select! {
                _ = tx.closed() => {
                    debug!("Fragment consumer dropped, closing upstream response");
                    return;
                }
                chunk = bytes.next() => chunk,
            };

            let finished = chunk.is_none();
            let batch = match chunk {
                Some(Ok(buf)) => lines.push(&buf),
                Some(Err(e)) => {
                    let _ = tx.send(Err(ChatError::Http(e))).await;
                    return;
                }
                None => lines.finish().into_iter().collect(),
            };

            for line in batch {
                match line_parser(&line) {
                    Ok(StreamLine::Delta(text)) => {
                        if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(StreamLine::Last(text)) => {
                        if !text.is_empty() {
                            let _ = tx.send(Ok(text)).await;
                        }
                        return;
                    }
                    Ok(StreamLine::Done) => {
                        return;
                    }
                    Ok(StreamLine::Ignore) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            if finished {
                return;
            }
        }
    })
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> Result<FragmentStream, ChatError>
    where
        F: FnOnce(mpsc::Sender<Result<String, ChatError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Wraps a one-shot completion as a stream carrying a single fragment.
pub fn full_response_as_stream<F, Fut>(response_fn: F) -> Result<FragmentStream, ChatError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, ChatError>> + Send + 'static
{
    create_streaming_response(move |tx| async move {
        match response_fn().await {
            Ok(response) => {
                let _ = tx.send(Ok(response)).await;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    })
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ChatError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::HuggingFace => Arc::new(HuggingFaceChatClient::from_config(config)?),
        LlmType::OpenAI | LlmType::Groq => Arc::new(OpenAIChatClient::from_config(config)?),
        LlmType::Ollama => Arc::new(OllamaClient::from_config(config)?),
        LlmType::Anthropic | LlmType::Gemini => Arc::new(BackendChatClient::from_config(config)?),
    };
    Ok(client)
}

static CHAT_CLIENT: OnceCell<Arc<dyn ChatClient>> = OnceCell::new();

/// Process-wide client handle, built from `config` on first use. Later calls
/// return the same handle and ignore their argument.
pub fn shared_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ChatError> {
    CHAT_CLIENT.get_or_try_init(|| new_client(config)).map(Arc::clone)
}
