use serde::{ Serialize, Deserialize };
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One exchange as a chat front end records it. Either side may be missing,
/// e.g. while the assistant reply is still pending.
///
/// Deserializes from `["hi", "hello"]` as well as `{"user": "hi", "assistant": "hello"}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationTurn {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub assistant: Option<String>,
}

impl ConversationTurn {
    pub fn new(user: Option<&str>, assistant: Option<&str>) -> Self {
        Self {
            user: user.map(str::to_string),
            assistant: assistant.map(str::to_string),
        }
    }
}

/// Prior conversation in either of the shapes clients send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum History {
    Pairs(Vec<ConversationTurn>),
    Messages(Vec<ChatMessage>),
}

impl Default for History {
    fn default() -> Self {
        History::Pairs(Vec::new())
    }
}

impl History {
    pub fn is_empty(&self) -> bool {
        match self {
            History::Pairs(turns) => turns.is_empty(),
            History::Messages(messages) => messages.is_empty(),
        }
    }

    /// Flattens the history into user/assistant messages in chronological order.
    ///
    /// Absent or empty sides are skipped. System records are dropped, the request
    /// carries its own system prompt.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            History::Pairs(turns) => {
                let mut out = Vec::with_capacity(turns.len() * 2);
                for turn in turns {
                    if let Some(user) = turn.user.as_deref().filter(|s| !s.is_empty()) {
                        out.push(ChatMessage::user(user));
                    }
                    if let Some(assistant) = turn.assistant.as_deref().filter(|s| !s.is_empty()) {
                        out.push(ChatMessage::assistant(assistant));
                    }
                }
                out
            }
            History::Messages(messages) =>
                messages
                    .iter()
                    .filter(|m| m.role != Role::System && !m.content.is_empty())
                    .cloned()
                    .collect(),
        }
    }
}

pub fn build_messages(system_prompt: &str, history: &History, message: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    messages.extend(history.to_messages());
    messages.push(ChatMessage::user(message));
    messages
}
