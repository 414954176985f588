use serde::{ Serialize, Deserialize };

use crate::config::prompt::JlptLevel;
use crate::models::chat::History;
use crate::models::generation::ParameterOverrides;

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat(ChatPayload),
    #[serde(rename = "levels")]
    Levels,
}

/// A submitted turn. `level` wins over `system_message` when both are present.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatPayload {
    pub message: String,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub parameters: Option<ParameterOverrides>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LevelInfo {
    pub key: String,
    pub description: String,
}

impl LevelInfo {
    /// Every selectable level, beginner first.
    pub fn catalog() -> Vec<LevelInfo> {
        JlptLevel::ALL
            .iter()
            .map(|level| LevelInfo {
                key: level.as_str().to_string(),
                description: level.description().to_string(),
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "partial")] Partial {
        content: String,
    },
    #[serde(rename = "done")] Done {
        content: String,
        timestamp: i64,
    },
    #[serde(rename = "levels")] Levels {
        levels: Vec<LevelInfo>,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "processing")]
    Processing,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_with_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "chat", "message": "はじめまして"}"#).unwrap();
        match msg {
            ClientMessage::Chat(payload) => {
                assert_eq!(payload.message, "はじめまして");
                assert!(payload.history.is_empty());
                assert!(payload.level.is_none());
                assert!(payload.parameters.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_full_chat() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{
                "type": "chat",
                "message": "Bye",
                "history": [["Hi", "Hello!"]],
                "level": "N3",
                "parameters": {"max_tokens": 64, "temperature": 0.5, "top_p": 0.9}
            }"#
        ).unwrap();
        let ClientMessage::Chat(payload) = msg else {
            panic!("expected chat");
        };
        assert_eq!(payload.level.as_deref(), Some("N3"));
        assert_eq!(payload.parameters.and_then(|p| p.max_tokens), Some(64));
        assert_eq!(payload.history.to_messages().len(), 2);
    }

    #[test]
    fn catalog_lists_five_levels_beginner_first() {
        let levels = LevelInfo::catalog();
        assert_eq!(levels.len(), 5);
        assert_eq!(levels[0].key, "N5");
        assert_eq!(levels[4].key, "N1");
    }

    #[test]
    fn serializes_tagged_server_messages() {
        let json = ServerMessage::Partial { content: "AB".into() }.to_json();
        assert_eq!(json, r#"{"type":"partial","content":"AB"}"#);
        assert_eq!(ServerMessage::Processing.to_json(), r#"{"type":"processing"}"#);
    }
}
