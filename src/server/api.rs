use crate::cli::Args;
use crate::models::generation::{ GenerationParameters, ParameterRanges };
use crate::models::websocket::{ ChatPayload, LevelInfo, ServerMessage };
use crate::relay::{ ChatRelay, RelayRequest, ResponseStream };

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    Json,
    extract::State,
    response::{ IntoResponse, Response, sse::{ Event, KeepAlive, Sse } },
    http::StatusCode,
};
use chrono::Utc;
use futures::{ stream, Stream, StreamExt };
use serde::Serialize;
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error, warn };

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: String,
    model: String,
}

#[derive(Serialize)]
struct DefaultsResponse {
    parameters: GenerationParameters,
    ranges: ParameterRanges,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ChatRelay>,
    pub defaults: GenerationParameters,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/levels", get(levels_handler))
        .route("/api/defaults", get(defaults_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/reload-prompts", get(reload_prompts_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    state: AppState,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(state);

    if let (true, Some(cert_path), Some(key_path)) = (
        args.enable_tls,
        args.tls_cert_path.as_ref(),
        args.tls_key_path.as_ref(),
    ) {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

        tokio::spawn(async move {
            let result = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let client = state.relay.client();
    Json(HealthResponse {
        status: "ok",
        provider: client.provider().to_string(),
        model: client.get_model(),
    })
}

async fn levels_handler() -> impl IntoResponse {
    Json(LevelInfo::catalog())
}

async fn defaults_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(DefaultsResponse {
        parameters: state.defaults,
        ranges: ParameterRanges::current(),
    })
}

fn sse_event(name: &str, message: &ServerMessage) -> Event {
    Event::default().event(name).data(message.to_json())
}

/// `partial` events for every progressive value, then a single `done`.
fn reply_events(replies: ResponseStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some((replies, String::new())), |state| async move {
        let (mut replies, latest) = state?;
        match replies.next().await {
            Some(reply) => {
                let event = sse_event("partial", &ServerMessage::Partial { content: reply.clone() });
                Some((Ok(event), Some((replies, reply))))
            }
            None => {
                let done = ServerMessage::Done {
                    content: latest,
                    timestamp: Utc::now().timestamp(),
                };
                Some((Ok(sse_event("done", &done)), None))
            }
        }
    })
}

async fn chat_handler(State(state): State<AppState>, Json(payload): Json<ChatPayload>) -> Response {
    let request = match RelayRequest::from_payload(payload, state.defaults) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected chat parameters: {}", e);
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorBody { error: e.to_string() })).into_response();
        }
    };

    let replies = state.relay.respond(request);
    Sse::new(reply_events(replies)).keep_alive(KeepAlive::default()).into_response()
}

async fn reload_prompts_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (code, success, message) = match state.relay.prompts().reload_if_changed() {
        Ok(true) => (StatusCode::OK, true, "Prompts reloaded".to_string()),
        Ok(false) => (StatusCode::OK, true, "Prompts unchanged".to_string()),
        Err(e) => (StatusCode::BAD_REQUEST, false, format!("Prompt reload error: {}", e)),
    };
    (code, Json(ReloadResponse { success, message }))
}
