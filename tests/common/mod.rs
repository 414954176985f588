#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use std::sync::{ Arc, Mutex };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use jlpt_tutor::config::prompt::PromptStore;
use jlpt_tutor::llm::chat::{ ChatClient, ChatError, FragmentStream };
use jlpt_tutor::llm::LlmType;
use jlpt_tutor::models::chat::ChatMessage;
use jlpt_tutor::models::generation::GenerationParameters;
use jlpt_tutor::relay::ChatRelay;

enum Script {
    /// `Err` entries become `ChatError::Upstream`.
    Fragments(Vec<Result<String, String>>),
    FailOnOpen(String),
    Held(Mutex<Option<mpsc::Receiver<Result<String, ChatError>>>>),
}

/// A completion endpoint that plays back a fixed script and records what it was sent.
pub struct StubClient {
    script: Script,
    pub calls: Mutex<Vec<(Vec<ChatMessage>, GenerationParameters)>>,
}

impl StubClient {
    pub fn fragments(items: &[&str]) -> Self {
        Self::scripted(items.iter().map(|s| Ok(s.to_string())).collect())
    }

    pub fn scripted(items: Vec<Result<String, String>>) -> Self {
        Self { script: Script::Fragments(items), calls: Mutex::new(Vec::new()) }
    }

    pub fn failing(message: &str) -> Self {
        Self { script: Script::FailOnOpen(message.to_string()), calls: Mutex::new(Vec::new()) }
    }

    /// The caller feeds fragments through the returned sender, and can watch it
    /// to see when the relay lets go of the call.
    pub fn held() -> (Self, mpsc::Sender<Result<String, ChatError>>) {
        let (tx, rx) = mpsc::channel(8);
        let client = Self {
            script: Script::Held(Mutex::new(Some(rx))),
            calls: Mutex::new(Vec::new()),
        };
        (client, tx)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.calls.lock().unwrap().last().map(|(m, _)| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for StubClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        parameters: &GenerationParameters
    ) -> Result<FragmentStream, ChatError> {
        self.calls.lock().unwrap().push((messages.to_vec(), *parameters));
        match &self.script {
            Script::Fragments(items) => {
                let items: Vec<Result<String, ChatError>> = items
                    .iter()
                    .cloned()
                    .map(|item| item.map_err(ChatError::Upstream))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Script::FailOnOpen(message) => Err(ChatError::Upstream(message.clone())),
            Script::Held(rx) => {
                let rx = rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| ChatError::Config("held stub used twice".into()))?;
                Ok(Box::pin(ReceiverStream::new(rx)))
            }
        }
    }

    fn provider(&self) -> LlmType {
        LlmType::HuggingFace
    }

    fn get_model(&self) -> String {
        "stub-model".to_string()
    }

    fn get_base_url(&self) -> Option<String> {
        None
    }
}

pub fn relay_with(client: Arc<StubClient>) -> ChatRelay {
    ChatRelay::new(client, Arc::new(PromptStore::builtin()))
}
