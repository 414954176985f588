pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::models::generation::GenerationParameters;
use crate::relay::ChatRelay;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    relay: Arc<ChatRelay>,
    defaults: GenerationParameters,
    args: Args,
}

impl Server {
    pub fn new(addr: String, relay: Arc<ChatRelay>, args: Args) -> Self {
        let defaults = args.generation_defaults();
        Self {
            addr,
            relay,
            defaults,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        let state = api::AppState {
            relay: self.relay.clone(),
            defaults: self.defaults,
        };
        api::start_http_server(http_port, state, self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            &self.addr,
            self.relay.clone(),
            self.args.server_api_key(),
            self.defaults,
            self.args.clone()
        ).await
    }
}
