use clap::Parser;

use crate::llm::{ LlmConfig, ParseLlmTypeError };
use crate::models::generation::GenerationParameters;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// Inference provider (huggingface, openai, groq, ollama, anthropic, gemini)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "huggingface")]
    pub chat_llm_type: String,

    /// Base URL for the provider API. Adapters fall back to their public endpoint when unset.
    #[arg(long, env = "CHAT_BASE_URL")]
    pub chat_base_url: Option<String>,

    /// API key or access token for the provider (e.g. a Hugging Face token)
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model id (e.g. HuggingFaceH4/zephyr-7b-beta, gpt-4o-mini, llama3.2)
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    // --- Generation defaults ---
    /// Response length used when a client sends no parameters
    #[arg(long, env = "DEFAULT_MAX_TOKENS", default_value = "512")]
    pub default_max_tokens: u32,

    /// Sampling temperature used when a client sends no parameters
    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value = "0.7")]
    pub default_temperature: f32,

    /// Nucleus sampling value used when a client sends no parameters
    #[arg(long, env = "DEFAULT_TOP_P", default_value = "0.95")]
    pub default_top_p: f32,

    // --- Prompts ---
    /// Optional JSON file overriding the built-in level prompts.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional port for the HTTP API (SSE chat, levels, health).
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn llm_config(&self) -> Result<LlmConfig, ParseLlmTypeError> {
        Ok(LlmConfig {
            llm_type: self.chat_llm_type.parse()?,
            api_key: Some(self.chat_api_key.clone()).filter(|k| !k.is_empty()),
            completion_model: self.chat_model.clone(),
            base_url: self.chat_base_url.clone(),
        })
    }

    pub fn generation_defaults(&self) -> GenerationParameters {
        GenerationParameters {
            max_tokens: self.default_max_tokens,
            temperature: self.default_temperature,
            top_p: self.default_top_p,
        }
    }

    pub fn server_api_key(&self) -> Option<String> {
        self.server_api_key.clone().filter(|k| !k.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmType;

    #[test]
    fn defaults_match_chat_controls() {
        let args = Args::parse_from(["jlpt-tutor"]);
        assert_eq!(args.generation_defaults(), GenerationParameters::default());
        assert_eq!(args.server_addr, "127.0.0.1:4000");
    }

    #[test]
    fn builds_llm_config() {
        let args = Args::parse_from([
            "jlpt-tutor",
            "--chat-llm-type",
            "ollama",
            "--chat-model",
            "qwen2.5",
            "--chat-api-key",
            "",
        ]);
        let config = args.llm_config().unwrap();
        assert_eq!(config.llm_type, LlmType::Ollama);
        assert_eq!(config.completion_model.as_deref(), Some("qwen2.5"));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn blank_server_key_disables_auth() {
        let args = Args::parse_from(["jlpt-tutor", "--server-api-key", "  "]);
        assert!(args.server_api_key().is_none());
    }
}
