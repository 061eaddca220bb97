use crate::history::HistoryError;
use crate::models::chat::ChatSummary;
use crate::session::{ ChatSession, SessionError, SessionServices };
use crate::websocket::handle_connection;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::num::NonZeroU32;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio::net::{ TcpListener, TcpStream };
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::http::StatusCode;
use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };
use url::form_urlencoded;

use log::{ info, warn, error, debug };

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> = RateLimiter::direct(
        Quota::per_second(NonZeroU32::MIN.saturating_add(9))
    );
}

/// Open chats, one session per chat id, shared by every connection to that chat.
pub struct SessionRegistry {
    services: SessionServices,
    sessions: Mutex<HashMap<u32, Arc<Mutex<ChatSession>>>>,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self { services, sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn get_or_open(&self, chat_id: u32) -> Result<Arc<Mutex<ChatSession>>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&chat_id) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Mutex::new(ChatSession::open(chat_id, self.services.clone()).await?));
        sessions.insert(chat_id, Arc::clone(&session));
        Ok(session)
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, HistoryError> {
        self.services.store.list_chats().await
    }
}

/// Connection parameters taken from the handshake query string.
#[derive(Debug, Default, PartialEq, Eq)]
struct HandshakeQuery {
    chat_id: Option<String>,
    api_key: Option<String>,
}

fn parse_query(query: Option<&str>) -> HandshakeQuery {
    let mut parsed = HandshakeQuery::default();
    for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "chat_id" => {
                parsed.chat_id = Some(value.into_owned());
            }
            "api_key" => {
                parsed.api_key = Some(value.into_owned());
            }
            _ => {}
        }
    }
    parsed
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

pub struct Server {
    addr: String,
    registry: Arc<SessionRegistry>,
    api_key: Option<String>,
    default_chat_id: u32,
}

impl Server {
    pub fn new(
        addr: String,
        registry: Arc<SessionRegistry>,
        api_key: Option<String>,
        default_chat_id: u32
    ) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());

        if api_key.is_some() {
            info!("Server configured with API Key authentication.");
        } else {
            warn!("Server configured WITHOUT API Key authentication. Connections are open.");
        }

        Self { addr, registry, api_key, default_chat_id }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("WS server listening on: {}", self.addr);

        loop {
            let (stream, peer) = listener.accept().await?;

            if CONNECTION_LIMITER.check().is_err() {
                warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
                continue;
            }

            info!("Incoming connection from: {}", peer);
            let registry = Arc::clone(&self.registry);
            let required_api_key = self.api_key.clone();
            let default_chat_id = self.default_chat_id;

            tokio::spawn(async move {
                if
                    let Err(e) = Self::process_connection(
                        peer,
                        stream,
                        registry,
                        required_api_key,
                        default_chat_id
                    ).await
                {
                    error!("Failed to process connection for {}: {}", peer, e);
                }
            });
        }
    }

    async fn process_connection(
        peer: SocketAddr,
        stream: TcpStream,
        registry: Arc<SessionRegistry>,
        required_api_key: Option<String>,
        default_chat_id: u32
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut chat_id = default_chat_id;

        let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            info!("Handshake from {}", peer);
            let query = parse_query(req.uri().query());

            let provided = req
                .headers()
                .get("X-API-Key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .or(query.api_key);

            if let Some(ref required) = required_api_key {
                if provided.as_deref() != Some(required.as_str()) {
                    warn!("{}: bad or missing API key", peer);
                    return Err(reject(StatusCode::UNAUTHORIZED, "Unauthorized"));
                }
                info!("{} authenticated", peer);
            }

            if let Some(raw) = query.chat_id {
                match raw.parse::<u32>() {
                    Ok(id) => {
                        chat_id = id;
                    }
                    Err(_) => {
                        warn!("{}: invalid chat_id '{}'", peer, raw);
                        return Err(reject(StatusCode::BAD_REQUEST, "Invalid chat_id"));
                    }
                }
            }
            debug!("{} requested chat {}", peer, chat_id);

            Ok(response)
        };

        let handshake = accept_hdr_async(stream, auth_callback).await;
        match handshake {
            Ok(ws) => {
                handle_connection(peer, ws, registry, chat_id).await;
                Ok(())
            }
            Err(e) => {
                error!("Handshake failed for {}: {}", peer, e);
                Err(Box::new(e) as _)
            }
        }
    }
}
