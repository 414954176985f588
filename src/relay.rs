use crate::config::prompt::{ PromptBook, PromptStore };
use crate::llm::chat::ChatClient;
use crate::models::chat::{ build_messages, ChatMessage, History };
use crate::models::generation::{ GenerationParameters, ParameterError };
use crate::models::websocket::ChatPayload;

use futures::{ Stream, StreamExt };
use log::{ debug, info, warn };
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const RELAY_BUFFER: usize = 32;

/// Progressive answers: every item is the whole reply received so far.
pub type ResponseStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Where the system message of a request comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Level(String),
    Text(String),
    Default,
}

impl PromptSource {
    /// A level, when given, takes precedence over literal text.
    pub fn from_parts(level: Option<String>, system_message: Option<String>) -> Self {
        match (level, system_message) {
            (Some(level), _) => PromptSource::Level(level),
            (None, Some(text)) => PromptSource::Text(text),
            (None, None) => PromptSource::Default,
        }
    }

    pub fn resolve(&self, prompts: &PromptBook) -> String {
        match self {
            PromptSource::Level(level) => prompts.select(Some(level)).to_string(),
            PromptSource::Text(text) => text.clone(),
            PromptSource::Default => prompts.default_prompt().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub message: String,
    pub history: History,
    pub prompt: PromptSource,
    pub parameters: GenerationParameters,
}

impl RelayRequest {
    /// Builds a request from client input, filling in `defaults` for every
    /// parameter the client left out. Values outside the chat control ranges are rejected.
    pub fn from_payload(
        payload: ChatPayload,
        defaults: GenerationParameters
    ) -> Result<Self, ParameterError> {
        let parameters = payload.parameters.unwrap_or_default().apply(defaults);
        parameters.validate()?;
        Ok(Self {
            message: payload.message,
            history: payload.history,
            prompt: PromptSource::from_parts(payload.level, payload.system_message),
            parameters,
        })
    }
}

pub fn apology(error: impl Display) -> String {
    format!("Sorry, I couldn't finish that reply: {}", error)
}

#[derive(Clone)]
pub struct ChatRelay {
    client: Arc<dyn ChatClient>,
    prompts: Arc<PromptStore>,
}

impl ChatRelay {
    pub fn new(client: Arc<dyn ChatClient>, prompts: Arc<PromptStore>) -> Self {
        Self { client, prompts }
    }

    pub fn client(&self) -> &Arc<dyn ChatClient> {
        &self.client
    }

    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    pub fn prepare(&self, request: &RelayRequest) -> Vec<ChatMessage> {
        let system_prompt = request.prompt.resolve(&self.prompts.snapshot());
        build_messages(&system_prompt, &request.history, &request.message)
    }

    /// Runs one relay invocation.
    ///
    /// The returned stream yields the growing reply after every non-empty
    /// fragment. On failure it yields a single apology and ends. Dropping the
    /// stream abandons the upstream call.
    pub fn respond(&self, request: RelayRequest) -> ResponseStream {
        let messages = self.prepare(&request);
        let client = Arc::clone(&self.client);
        let parameters = request.parameters;
        let (tx, rx) = mpsc::channel::<String>(RELAY_BUFFER);

        tokio::spawn(async move {
            info!(
                "Relaying {} messages to {} ({}), max_tokens={} temperature={} top_p={}",
                messages.len(),
                client.provider(),
                client.get_model(),
                parameters.max_tokens,
                parameters.temperature,
                parameters.top_p
            );

            let mut upstream = match client.stream_chat(&messages, &parameters).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Completion call failed before streaming: {}", e);
                    let _ = tx.send(apology(&e)).await;
                    return;
                }
            };

            let mut response = String::new();
            let mut fragments = 0usize;

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Relay consumer went away after {} fragments", fragments);
                        return;
                    }
                    next = upstream.next() => next,
                };

                match next {
                    Some(Ok(fragment)) => {
                        if fragment.is_empty() {
                            continue;
                        }
                        fragments += 1;
                        response.push_str(&fragment);
                        if tx.send(response.clone()).await.is_err() {
                            debug!("Relay consumer went away after {} fragments", fragments);
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Completion stream failed after {} fragments: {}", fragments, e);
                        let _ = tx.send(apology(&e)).await;
                        return;
                    }
                    None => {
                        info!("Reply complete: {} fragments, {} bytes", fragments, response.len());
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
