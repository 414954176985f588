use crate::cli::Args;
use crate::models::generation::GenerationParameters;
use crate::models::websocket::{ ClientMessage, LevelInfo, ServerMessage };
use crate::relay::{ ChatRelay, RelayRequest };

use std::collections::{ HashMap, VecDeque };
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };

use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls::ServerConfig;
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;

use chrono::Utc;
use hmac::{ digest::InvalidLength, Hmac, Mac };
use sha2::Sha256;
use url::form_urlencoded;

use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const SIGNATURE_MAX_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

pub(crate) fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

/// Hex HMAC-SHA256 of the timestamp, keyed with the server API key.
pub fn sign_timestamp(secret: &str, ts: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(ts.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Accepts a handshake carrying the key itself (`X-API-Key` header or
/// `api_key` query) or a fresh `ts`/`sig` signature pair.
pub fn check_handshake(req: &Request, secret: &str, now: i64) -> Result<(), &'static str> {
    let qs = req.uri().query().unwrap_or("");
    let params: HashMap<String, String> = form_urlencoded
        ::parse(qs.as_bytes())
        .into_owned()
        .collect();

    let provided_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| params.get("api_key").cloned());
    if let Some(key) = provided_key {
        return if key == secret { Ok(()) } else { Err("bad api key") };
    }

    let ts = params
        .get("ts")
        .or_else(|| params.get("X-Api-Ts"))
        .map(|s| s.as_str());
    let sig = params
        .get("sig")
        .or_else(|| params.get("X-Api-Sign"))
        .map(|s| s.as_str());

    match (ts, sig) {
        (Some(ts), Some(sig)) => {
            let ts_i: i64 = ts.parse().map_err(|_| "bad timestamp")?;
            if (now - ts_i).abs() > SIGNATURE_MAX_SKEW_SECS {
                return Err("timestamp out of range");
            }
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad key")?;
            mac.update(ts.as_bytes());
            let verified = hex
                ::decode(sig)
                .map(|raw| mac.verify_slice(&raw).is_ok())
                .unwrap_or(false);
            if verified {
                debug!("Signature for ts={} accepted", ts);
                Ok(())
            } else {
                Err("bad signature")
            }
        }
        _ => Err("missing credentials"),
    }
}

pub async fn start_ws_server(
    addr: &str,
    relay: Arc<ChatRelay>,
    api_key: Option<String>,
    defaults: GenerationParameters,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let protocol = if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let relay_clone = Arc::clone(&relay);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, relay_clone, required_api_key, defaults).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, relay_clone, required_api_key, defaults).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    relay: Arc<ChatRelay>,
    required_api_key: Option<String>,
    defaults: GenerationParameters
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        match check_handshake(req, secret, Utc::now().timestamp()) {
            Ok(()) => {
                info!("{} authenticated", peer);
                Ok(response)
            }
            Err(reason) => {
                warn!("{}: handshake rejected ({})", peer, reason);
                Err(unauthorized(reason))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, relay, defaults).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

/// Serves one client. Turns are handled one at a time: chat frames that arrive
/// while a reply is streaming wait until it is done. A client that closes or
/// drops mid-reply ends the turn at once.
pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    relay: Arc<ChatRelay>,
    defaults: GenerationParameters
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {}", peer);

    match relay.prompts().reload_if_changed() {
        Ok(true) => info!("Prompts reloaded for {}", peer),
        Ok(false) => {}
        Err(e) => error!("Failed to reload prompts: {}", e),
    }

    let (mut tx, mut rx) = websocket.split();
    let connection_id = Uuid::new_v4().to_string();
    info!("Assigned connection ID {} to {}", connection_id, peer);

    // Frames that arrived while a reply was streaming.
    let mut queued: VecDeque<Message> = VecDeque::new();

    'frames: loop {
        let msg = match queued.pop_front() {
            Some(message) => Ok(message),
            None =>
                match rx.next().await {
                    Some(msg) => msg,
                    None => {
                        break;
                    }
                }
        };
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                        error!("WebSocket capacity error for {}: {}", peer, cap_err);
                        let error_msg = ServerMessage::Error {
                            message: "Server capacity error".to_string(),
                        };
                        let _ = tx.send(Message::Text(error_msg.to_json())).await;
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        };

        if message.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds size limit ({} > {})",
                peer,
                message.len(),
                MAX_MESSAGE_SIZE
            );
            let error_msg = ServerMessage::Error {
                message: "Message too large".to_string(),
            };
            if tx.send(Message::Text(error_msg.to_json())).await.is_err() {
                error!("Failed to send size limit error to {}", peer);
            }
            break;
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Received close frame from {}", peer);
                break;
            }
            Message::Ping(ping_data) => {
                if tx.send(Message::Pong(ping_data)).await.is_err() {
                    error!("Failed to send pong to {}", peer);
                    break;
                }
                continue;
            }
            Message::Binary(_) => {
                warn!("Ignoring binary message from {}", peer);
                continue;
            }
            Message::Pong(_) | Message::Frame(_) => {
                continue;
            }
        };

        let payload = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Levels) => {
                let reply = ServerMessage::Levels { levels: LevelInfo::catalog() };
                if tx.send(Message::Text(reply.to_json())).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(ClientMessage::Chat(payload)) => payload,
            Err(e) => {
                error!("Failed to parse message from {}: {}", peer, e);
                let error_msg = ServerMessage::Error {
                    message: format!("Failed to parse message: {}", e),
                };
                if let Err(e) = tx.send(Message::Text(error_msg.to_json())).await {
                    error!("Error sending parse error to {}: {}", peer, e);
                    break;
                }
                continue;
            }
        };

        let request = match RelayRequest::from_payload(payload, defaults) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected parameters from {}: {}", peer, e);
                let error_msg = ServerMessage::Error { message: e.to_string() };
                if tx.send(Message::Text(error_msg.to_json())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let Err(e) = tx.send(Message::Text(ServerMessage::Processing.to_json())).await {
            error!("Error sending processing status to {}: {}", peer, e);
            break;
        }

        // Leaving 'frames drops `replies`, which abandons the upstream call.
        let mut replies = relay.respond(request);
        let mut latest = String::new();
        loop {
            tokio::select! {
                reply = replies.next() => {
                    let Some(reply) = reply else {
                        break;
                    };
                    let partial = ServerMessage::Partial { content: reply.clone() };
                    if let Err(e) = tx.send(Message::Text(partial.to_json())).await {
                        error!("Error sending partial reply to {}: {}", peer, e);
                        break 'frames;
                    }
                    latest = reply;
                }
                incoming = rx.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => {
                            info!("{} left while a reply was streaming", peer);
                            break 'frames;
                        }
                        Some(Err(e)) => {
                            info!("Connection to {} failed while a reply was streaming: {}", peer, e);
                            break 'frames;
                        }
                        Some(Ok(Message::Ping(ping_data))) => {
                            if tx.send(Message::Pong(ping_data)).await.is_err() {
                                error!("Failed to send pong to {}", peer);
                                break 'frames;
                            }
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(message)) => queued.push_back(message),
                    }
                }
            }
        }

        let done = ServerMessage::Done {
            content: latest,
            timestamp: Utc::now().timestamp(),
        };
        if let Err(e) = tx.send(Message::Text(done.to_json())).await {
            error!("Error sending reply to {}: {}", peer, e);
            break;
        }
    }
    info!("WebSocket connection closed for {} (ID: {})", peer, connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn accepts_matching_key_in_header_or_query() {
        let req = Request::builder().uri("/").header("X-API-Key", "s3cret").body(()).unwrap();
        assert_eq!(check_handshake(&req, "s3cret", 0), Ok(()));
        assert_eq!(check_handshake(&request("/?api_key=s3cret"), "s3cret", 0), Ok(()));
        assert_eq!(check_handshake(&request("/?api_key=nope"), "s3cret", 0), Err("bad api key"));
    }

    #[test]
    fn accepts_fresh_signature() {
        let now = 1_700_000_000;
        let sig = sign_timestamp("s3cret", &now.to_string()).unwrap();
        let req = request(&format!("/?ts={}&sig={}", now, sig));
        assert_eq!(check_handshake(&req, "s3cret", now + 10), Ok(()));
    }

    #[test]
    fn rejects_stale_or_forged_signatures() {
        let now = 1_700_000_000;
        let sig = sign_timestamp("s3cret", &now.to_string()).unwrap();
        let stale = request(&format!("/?ts={}&sig={}", now, sig));
        assert_eq!(check_handshake(&stale, "s3cret", now + 301), Err("timestamp out of range"));

        let forged = request(&format!("/?ts={}&sig={}", now, sign_timestamp("other", &now.to_string()).unwrap()));
        assert_eq!(check_handshake(&forged, "s3cret", now), Err("bad signature"));

        assert_eq!(check_handshake(&request("/"), "s3cret", now), Err("missing credentials"));
    }
}
