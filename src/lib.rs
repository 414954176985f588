pub mod cli;
pub mod config;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;

use cli::Args;
use config::prompt::PromptStore;
use llm::chat::shared_client;
use log::info;
use relay::ChatRelay;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let defaults = args.generation_defaults();
    defaults.validate()?;

    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("(provider default)"));
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or("(provider default)"));
    info!(
        "Default Parameters: max_tokens={} temperature={} top_p={}",
        defaults.max_tokens,
        defaults.temperature,
        defaults.top_p
    );
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("(built-in)"));
    info!("HTTP Port: {}", args.http_port.map(|p| p.to_string()).unwrap_or_else(|| "disabled".into()));
    info!("WebSocket Auth: {}", if args.server_api_key().is_some() { "required" } else { "open" });
    info!("-------------------------");

    let llm_config = args.llm_config()?;
    let client = shared_client(&llm_config)?;

    let prompts = match &args.prompts_path {
        Some(path) => PromptStore::from_path(path)?,
        None => PromptStore::builtin(),
    };

    let relay = Arc::new(ChatRelay::new(client, Arc::new(prompts)));
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, relay, args);
    server.run().await?;

    Ok(())
}
