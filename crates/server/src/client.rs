//! Client Broker: one axum WebSocket handler per connection, speaking
//! the closed `ClientMessage`/`ServerMessage` vocabulary.
//!
//! A 30s ping / 90s pong-timeout keepalive around a single
//! `tokio::select!` fan-in. The handler fans in one local mpsc channel
//! that the Session Manager's `join_session` attaches to directly, plus
//! one per-terminal forwarder task per open terminal subscription — so
//! `select!` itself only ever has one dynamic-arrival source to poll,
//! not one per terminal.
//!
//! Kicking the previous socket uses a `Notify` each connection owns:
//! `join_session` replaces the session's `attached` sender and, if the
//! slot it replaced belonged to a different connection, wakes that
//! connection's `kicked` notify so its `select!` loop exits on its own
//! instead of lingering on a socket nobody reads from anymore.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use gateway_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::session::SessionManager;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// How many server->client messages may queue for a connection before
/// `route_or_buffer` spills over to persistent offline buffering.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

struct Connection {
    identity: Identity,
    sessions: Arc<SessionManager>,
    out_tx: mpsc::Sender<ServerMessage>,
    kicked: Arc<Notify>,
    joined_session: Option<Uuid>,
    terminal_tasks: HashMap<Uuid, JoinHandle<()>>,
}

pub async fn handle_client_ws(mut socket: WebSocket, identity: Identity, sessions: Arc<SessionManager>) {
    let username = identity.username.clone();
    tracing::info!(%username, "client websocket connected");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(CLIENT_CHANNEL_CAPACITY);
    let kicked = Arc::new(Notify::new());
    let mut conn = Connection {
        identity,
        sessions,
        out_tx: out_tx.clone(),
        kicked: Arc::clone(&kicked),
        joined_session: None,
        terminal_tasks: HashMap::new(),
    };

    let _ = out_tx.try_send(ServerMessage::Connected { username: username.clone() });

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%username, "client websocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }

            _ = kicked.notified() => {
                tracing::debug!(%username, "client websocket kicked by a newer connection attaching to the same session");
                break;
            }

            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!(%username, error = %e, "failed to serialize server message");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => conn.handle_client_message(msg).await,
                            Err(e) => {
                                let _ = out_tx.try_send(ServerMessage::Error {
                                    session_id: conn.joined_session,
                                    message: format!("invalid message: {e}"),
                                    code: Some("bad_request".to_string()),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // No client->server binary frames in this protocol;
                        // terminal input travels as base64 inside TerminalInput.
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%username, error = %e, "client websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for (_, task) in conn.terminal_tasks.drain() {
        task.abort();
    }
    if let Some(session_id) = conn.joined_session {
        conn.sessions.detach(session_id).await;
    }
    tracing::info!(%username, "client websocket disconnected");
}

impl Connection {
    async fn handle_client_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateSession { working_directory, name } => {
                match self.sessions.create_session(&self.identity, working_directory, name).await {
                    Ok(summary) => {
                        let session_id = summary.id;
                        let _ = self.out_tx.try_send(ServerMessage::SessionCreated { session: summary });
                        self.attach(session_id).await;
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::JoinSession { session_id } => {
                self.attach(session_id).await;
            }

            ClientMessage::ListSessions => match self.sessions.list_sessions(&self.identity).await {
                Ok(sessions) => {
                    let _ = self.out_tx.try_send(ServerMessage::SessionsList { sessions });
                }
                Err(e) => self.send_error(e),
            },

            ClientMessage::RenameSession { session_id, name } => {
                match self.sessions.rename_session(session_id, name.clone()).await {
                    Ok(()) => {
                        let _ = self.out_tx.try_send(ServerMessage::SessionRenamed { session_id, name });
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::DeleteSession { session_id } => {
                match self.sessions.delete_session(session_id).await {
                    Ok(()) => {
                        if self.joined_session == Some(session_id) {
                            self.joined_session = None;
                        }
                        let _ = self.out_tx.try_send(ServerMessage::SessionDeleted { session_id });
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::ResetSession { session_id } => {
                match self.sessions.reset_session(&self.identity, session_id).await {
                    Ok(summary) => {
                        let new_id = summary.id;
                        let _ = self.out_tx.try_send(ServerMessage::SessionReset { session: summary });
                        if self.joined_session == Some(session_id) {
                            self.attach(new_id).await;
                        }
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::Message { content } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                if let Err(e) = self.sessions.send_user_message(session_id, content).await {
                    self.send_error(e);
                }
            }

            ClientMessage::Cancel => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                if let Err(e) = self.sessions.interrupt(session_id).await {
                    self.send_error(e);
                }
            }

            ClientMessage::PromptResponse { request_id, answers } => {
                self.sessions.respond_prompt(request_id, answers).await;
            }

            ClientMessage::PermissionResponse { request_id, decision, updated_input } => {
                self.sessions.respond_permission(request_id, decision, updated_input).await;
            }

            ClientMessage::ExitPlanModeResponse { request_id, approved } => {
                self.sessions.respond_exit_plan_mode(request_id, approved).await;
            }

            ClientMessage::SetMode { mode } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                match self.sessions.set_mode(session_id, mode).await {
                    Ok(()) => {
                        let _ = self.out_tx.try_send(ServerMessage::ModeChanged { session_id, mode });
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::SetWebSearch { enabled } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                match self.sessions.set_web_search(session_id, enabled).await {
                    Ok(()) => {
                        let _ = self.out_tx.try_send(ServerMessage::WebSearchChanged { session_id, enabled });
                    }
                    Err(e) => self.send_error(e),
                }
            }

            ClientMessage::ListAgents => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                let agents = self.sessions.list_agents(session_id).await;
                let _ = self.out_tx.try_send(ServerMessage::AgentsList { session_id, agents });
            }

            ClientMessage::TerminalCreate { cwd, name } => self.create_terminal(cwd, name).await,

            ClientMessage::TerminalInput { terminal_id, data } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                if self.sessions.terminals().owner_of(terminal_id).await != Some(session_id) {
                    self.send_error(GatewayError::NotFound);
                    return;
                }
                let Ok(bytes) = BASE64.decode(data.as_bytes()) else {
                    self.send_error(GatewayError::Validation("invalid base64 terminal input".to_string()));
                    return;
                };
                if let Err(e) = self.sessions.terminals().write_input(terminal_id, &bytes).await {
                    self.send_error(e);
                }
            }

            ClientMessage::TerminalResize { terminal_id, cols, rows } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                if self.sessions.terminals().owner_of(terminal_id).await != Some(session_id) {
                    self.send_error(GatewayError::NotFound);
                    return;
                }
                if let Err(e) = self.sessions.terminals().resize(terminal_id, cols, rows).await {
                    self.send_error(e);
                }
            }

            ClientMessage::TerminalClose { terminal_id } => {
                let Some(session_id) = self.joined_session else {
                    self.send_error(GatewayError::Validation("no session joined".to_string()));
                    return;
                };
                if self.sessions.terminals().owner_of(terminal_id).await != Some(session_id) {
                    self.send_error(GatewayError::NotFound);
                    return;
                }
                if let Some(task) = self.terminal_tasks.remove(&terminal_id) {
                    task.abort();
                }
                match self.sessions.terminals().close_terminal(terminal_id).await {
                    Ok(()) => {
                        let _ = self.out_tx.try_send(ServerMessage::TerminalClosed { terminal_id });
                    }
                    Err(e) => self.send_error(e),
                }
            }
        }
    }

    async fn attach(&mut self, session_id: Uuid) {
        if let Some(previous) = self.joined_session.take() {
            if previous != session_id {
                self.sessions.detach(previous).await;
            }
        }
        match self
            .sessions
            .join_session(&self.identity, session_id, self.out_tx.clone(), Arc::clone(&self.kicked))
            .await
        {
            Ok(summary) => {
                self.joined_session = Some(session_id);
                let _ = self.out_tx.try_send(ServerMessage::SessionJoined { session: summary });
            }
            Err(e) => self.send_error(e),
        }
    }

    async fn create_terminal(&mut self, cwd: Option<String>, name: Option<String>) {
        let Some(session_id) = self.joined_session else {
            self.send_error(GatewayError::Validation("no session joined".to_string()));
            return;
        };
        let working_directory = match cwd {
            Some(cwd) => cwd,
            None => match self.sessions.summary(session_id).await {
                Ok(summary) => summary.working_directory,
                Err(e) => {
                    self.send_error(e);
                    return;
                }
            },
        };

        let result = self
            .sessions
            .terminals()
            .create_terminal(session_id, working_directory.clone(), name.clone(), 80, 24)
            .await;

        let (terminal_id, mut output_rx) = match result {
            Ok(pair) => pair,
            Err(e) => {
                self.send_error(e);
                return;
            }
        };

        let out_tx = self.out_tx.clone();
        let forward = tokio::spawn(async move {
            loop {
                match output_rx.recv().await {
                    Ok(bytes) => {
                        let data = BASE64.encode(&bytes);
                        if out_tx.try_send(ServerMessage::TerminalData { terminal_id, data }).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = out_tx.try_send(ServerMessage::TerminalExit { terminal_id, code: None });
                        break;
                    }
                }
            }
        });
        self.terminal_tasks.insert(terminal_id, forward);

        let _ = self.out_tx.try_send(ServerMessage::TerminalCreated {
            terminal_id,
            name: name.unwrap_or_else(|| "shell".to_string()),
            cwd: working_directory,
        });
    }

    fn send_error(&self, e: GatewayError) {
        let _ = self.out_tx.try_send(ServerMessage::Error {
            session_id: self.joined_session,
            message: e.to_string(),
            code: Some(e.kind().to_string()),
        });
    }
}
