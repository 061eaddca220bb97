use crate::branch::AppendCommand;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::server::SessionRegistry;
use crate::session::{ AppendOutcome, ChatSession, SessionError };
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{ SinkExt, StreamExt };
use log::{ info, warn, error, debug };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{ mpsc, watch, Mutex };
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::task::{ JoinError, JoinHandle };
use tokio_tungstenite::{ tungstenite::protocol::Message, WebSocketStream };

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

type Generation = JoinHandle<Result<AppendOutcome, SessionError>>;

async fn send_message<S>(
    tx: &mut SplitSink<WebSocketStream<S>, Message>,
    message: &ServerMessage
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin
{
    let json = serde_json::to_string(message)?;
    tx.send(Message::Text(json)).await?;
    Ok(())
}

async fn send_tree<S>(
    tx: &mut SplitSink<WebSocketStream<S>, Message>,
    session: &Mutex<ChatSession>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin
{
    let instructions = session.lock().await.render();
    send_message(tx, &(ServerMessage::Tree { instructions })).await
}

async fn join_running(running: &mut Option<Generation>) -> Result<Result<AppendOutcome, SessionError>, JoinError> {
    match running {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn command_from(message: ClientMessage) -> Option<AppendCommand> {
    match message {
        ClientMessage::Reply { round, sequence_id, content } =>
            Some(AppendCommand::reply(round, sequence_id, content)),
        ClientMessage::Branch { round, sequence_id, content } =>
            Some(AppendCommand::branch(round, sequence_id, content)),
        _ => None,
    }
}

/// Serves one client of one chat. Generation runs in its own task so that a
/// `stop` sent meanwhile is still read.
pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    registry: Arc<SessionRegistry>,
    chat_id: u32
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {} (chat {})", peer, chat_id);
    let (mut tx, mut rx) = websocket.split();

    let session = match registry.get_or_open(chat_id).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open chat {} for {}: {}", chat_id, peer, e);
            let _ = send_message(&mut tx, &(ServerMessage::Error {
                message: format!("Failed to open chat {}: {}", chat_id, e),
            })).await;
            return;
        }
    };
    if let Err(e) = send_tree(&mut tx, &session).await {
        error!("Error sending tree to {}: {}", peer, e);
        return;
    }

    let (stop_tx, _) = watch::channel(false);
    let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
    let mut running: Option<Generation> = None;

    loop {
        tokio::select! {
            msg = rx.next() => {
                let message = match msg {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
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
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break;
                    }
                    None => break,
                };

                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    let _ = send_message(&mut tx, &(ServerMessage::Error {
                        message: "Message too large".to_string(),
                    })).await;
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
                    Message::Pong(_) | Message::Frame(_) => continue,
                };

                let client_message = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_message) => client_message,
                    Err(e) => {
                        error!("Failed to parse message from {}: {}", peer, e);
                        if send_message(&mut tx, &(ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        })).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let sent = match client_message {
                    ClientMessage::Stop => {
                        if running.is_some() {
                            info!("Stop requested by {}", peer);
                            stop_tx.send_replace(true);
                        } else {
                            debug!("Stop from {} with nothing running", peer);
                        }
                        Ok(())
                    }
                    ClientMessage::ListChats => {
                        match registry.list_chats().await {
                            Ok(chats) => send_message(&mut tx, &(ServerMessage::Chats { chats })).await,
                            Err(e) => send_message(&mut tx, &(ServerMessage::Error {
                                message: format!("Failed to list chats: {}", e),
                            })).await,
                        }
                    }
                    _ if running.is_some() => {
                        send_message(&mut tx, &(ServerMessage::Error {
                            message: "A reply is still being generated".to_string(),
                        })).await
                    }
                    ClientMessage::Tree => send_tree(&mut tx, &session).await,
                    other => {
                        match command_from(other) {
                            Some(command) => {
                                stop_tx.send_replace(false);
                                let stop_rx = stop_tx.subscribe();
                                let tokens = token_tx.clone();
                                let session = Arc::clone(&session);
                                running = Some(tokio::spawn(async move {
                                    session.lock().await.submit(&command, Some(tokens), stop_rx).await
                                }));
                                send_message(&mut tx, &ServerMessage::Processing).await
                            }
                            None => Ok(()),
                        }
                    }
                };
                if let Err(e) = sent {
                    error!("Error sending message to {}: {}", peer, e);
                    break;
                }
            }
            Some(token) = token_rx.recv() => {
                if let Err(e) = send_message(&mut tx, &(ServerMessage::Token { content: token })).await {
                    error!("Error sending token to {}: {}", peer, e);
                    break;
                }
            }
            result = join_running(&mut running), if running.is_some() => {
                running = None;
                let mut pending = Vec::new();
                while let Ok(token) = token_rx.try_recv() {
                    pending.push(ServerMessage::Token { content: token });
                }
                let reply = match result {
                    Ok(Ok(outcome)) => ServerMessage::Appended {
                        round: outcome.round,
                        sequence_id: outcome.sequence_id,
                        response: outcome.response,
                        stopped: outcome.stopped,
                        timestamp: Utc::now().timestamp(),
                    },
                    Ok(Err(e)) => {
                        error!("Chat {} rejected input from {}: {}", chat_id, peer, e);
                        ServerMessage::Error { message: format!("Error processing message: {}", e) }
                    }
                    Err(e) => {
                        error!("Generation task for {} failed: {}", peer, e);
                        ServerMessage::Error { message: "Generation task failed".to_string() }
                    }
                };
                let appended = matches!(reply, ServerMessage::Appended { .. });
                pending.push(reply);

                let mut failed = false;
                for message in &pending {
                    if let Err(e) = send_message(&mut tx, message).await {
                        error!("Error sending message to {}: {}", peer, e);
                        failed = true;
                        break;
                    }
                }
                if !failed && appended {
                    failed = send_tree(&mut tx, &session).await.is_err();
                }
                if failed {
                    break;
                }
            }
        }
    }

    if running.is_some() {
        // The running task still commits what it has generated so far.
        stop_tx.send_replace(true);
    }
    info!("WebSocket connection closed for {} (chat {})", peer, chat_id);
}
