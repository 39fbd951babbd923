//! Session Manager: the orchestrator. Creates, recovers, renames,
//! resets and deletes Sessions; owns each Session's Supervisor and
//! Terminal attachments; drives offline buffering.
//!
//! An `RwLock<HashMap<Uuid, _>>` of entries, a TOCTOU-safe
//! check-and-reserve `create_session` (write lock held across the
//! capacity check and the insert), idle-sweep-by-`last_activity`.
//! Offline buffering (attach/detach, draining buffered events on
//! reattach) stores a sequence of structured `PendingEvent` rows so a
//! disconnected session keeps accumulating events a later reattach
//! replays in order.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gateway_protocol::{
    AgentSummary, AgentWireEvent, AssistantContentBlock, ContentBlockKind, ControlRequestPayload,
    ControlResponsePayload, GatewayConfig, PermissionDecision, Question, ServerMessage,
    SessionMode, SessionSummary, TaskStatus,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, RwLock, mpsc};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};
use crate::permission::{PermissionBroker, PermissionReply};
use crate::store::{SessionField, SessionRow, Store};
use crate::supervisor::{AgentEvent, AgentEventPayload, AgentState, AgentSupervisor};
use crate::terminal::TerminalManager;

#[derive(Debug, Clone)]
enum PendingKind {
    Permission { tool_name: String },
    Question,
    ExitPlanMode,
}

/// The client currently attached to a session, plus the token used to
/// kick it off the socket when a newer connection takes its place.
#[derive(Clone)]
struct AttachedClient {
    tx: mpsc::Sender<ServerMessage>,
    kicked: Arc<Notify>,
}

struct SessionEntry {
    row: SessionRow,
    allowed_tools: HashSet<String>,
    supervisor: Option<AgentSupervisor>,
    attached: Option<AttachedClient>,
    assistant_buffer: String,
    block_index: u32,
    pending_control: HashMap<Uuid, (String, PendingKind)>,
    agents: HashMap<String, AgentSummary>,
}

pub struct SessionManager {
    store: Store,
    entries: RwLock<HashMap<Uuid, SessionEntry>>,
    terminals: Arc<TerminalManager>,
    permission_broker: Arc<PermissionBroker>,
    config: GatewayConfig,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl SessionManager {
    pub async fn new(
        store: Store,
        terminals: Arc<TerminalManager>,
        config: GatewayConfig,
    ) -> GatewayResult<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            store,
            entries: RwLock::new(HashMap::new()),
            terminals,
            permission_broker: PermissionBroker::new(),
            config,
            events_tx,
        });

        manager.recover_active_sessions().await?;

        let dispatcher = Arc::clone(&manager);
        tokio::spawn(dispatcher.run_dispatcher(events_rx));

        Ok(manager)
    }

    /// Load `is_active` rows persisted from a previous process lifetime
    /// into memory without spawning their Supervisors — they respawn
    /// lazily on the owner's next `join_session`.
    async fn recover_active_sessions(&self) -> GatewayResult<()> {
        let rows = self.store.list_active_sessions().await?;
        let mut entries = self.entries.write().await;
        for row in rows {
            let allowed_tools = self
                .store
                .allowed_tools_for(row.id)
                .await?
                .into_iter()
                .collect();
            entries.insert(
                row.id,
                SessionEntry {
                    row,
                    allowed_tools,
                    supervisor: None,
                    attached: None,
                    assistant_buffer: String::new(),
                    block_index: 0,
                    pending_control: HashMap::new(),
                    agents: HashMap::new(),
                },
            );
        }
        Ok(())
    }

    // ---- event dispatch ----------------------------------------------

    async fn run_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_agent_event(event).await;
        }
    }

    async fn handle_agent_event(self: &Arc<Self>, event: AgentEvent) {
        match event.payload {
            AgentEventPayload::Gone => {
                self.route_or_buffer(
                    event.session_id,
                    ServerMessage::Error {
                        session_id: Some(event.session_id),
                        message: "agent_exited".to_string(),
                        code: Some("agent_exited".to_string()),
                    },
                )
                .await;
            }
            AgentEventPayload::Wire(wire) => self.handle_wire_event(event.session_id, wire).await,
        }
        self.touch_activity(event.session_id).await;
    }

    async fn handle_wire_event(self: &Arc<Self>, session_id: Uuid, wire: AgentWireEvent) {
        match wire {
            AgentWireEvent::System {
                subtype,
                session_id: agent_sid,
            } => {
                if subtype.as_deref() == Some("init") {
                    if let Some(sid) = agent_sid {
                        let _ = self
                            .store
                            .update_session_field(
                                session_id,
                                SessionField::AgentSessionId(Some(sid.clone())),
                            )
                            .await;
                        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
                            entry.row.agent_session_id = Some(sid);
                        }
                    }
                }
            }
            AgentWireEvent::Assistant { message } => {
                self.route_or_buffer(session_id, ServerMessage::AssistantStart { session_id })
                    .await;
                for block in message.content {
                    match block {
                        AssistantContentBlock::Text { text } => {
                            let block_index = {
                                let mut entries = self.entries.write().await;
                                match entries.get_mut(&session_id) {
                                    Some(entry) => {
                                        entry.assistant_buffer.push_str(&text);
                                        entry.block_index
                                    }
                                    None => continue,
                                }
                            };
                            self.route_or_buffer(
                                session_id,
                                ServerMessage::ContentBlockStart {
                                    session_id,
                                    kind: ContentBlockKind::Text,
                                    name: None,
                                    id: None,
                                },
                            )
                            .await;
                            self.route_or_buffer(
                                session_id,
                                ServerMessage::TextChunk {
                                    session_id,
                                    text,
                                    block_index,
                                },
                            )
                            .await;
                            self.route_or_buffer(session_id, ServerMessage::ContentBlockStop { session_id })
                                .await;
                        }
                        AssistantContentBlock::ToolUse { id, name, input } => {
                            self.route_or_buffer(
                                session_id,
                                ServerMessage::ContentBlockStart {
                                    session_id,
                                    kind: ContentBlockKind::ToolUse,
                                    name: Some(name.clone()),
                                    id: Some(id.clone()),
                                },
                            )
                            .await;
                            self.route_or_buffer(
                                session_id,
                                ServerMessage::ToolUse {
                                    session_id,
                                    id,
                                    name,
                                    input,
                                },
                            )
                            .await;
                            self.route_or_buffer(session_id, ServerMessage::ContentBlockStop { session_id })
                                .await;
                        }
                        AssistantContentBlock::Other => {}
                    }
                }
            }
            AgentWireEvent::ControlRequest { request_id, request } => {
                self.handle_control_request(session_id, request_id, request)
                    .await;
            }
            AgentWireEvent::ToolUse { id, name, input } => {
                self.route_or_buffer(
                    session_id,
                    ServerMessage::ToolUse {
                        session_id,
                        id,
                        name,
                        input,
                    },
                )
                .await;
            }
            AgentWireEvent::AgentStart {
                task_id,
                description,
                agent_type,
                start_time,
            } => {
                if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
                    entry.agents.insert(
                        task_id.clone(),
                        AgentSummary {
                            task_id: task_id.clone(),
                            description: description.clone(),
                            agent_type: agent_type.clone(),
                            status: TaskStatus::Running,
                        },
                    );
                }
                self.route_or_buffer(
                    session_id,
                    ServerMessage::AgentStart {
                        session_id,
                        task_id,
                        description,
                        agent_type,
                        start_time,
                    },
                )
                .await;
            }
            AgentWireEvent::TaskNotification {
                task_id,
                status,
                summary,
            } => {
                if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
                    entry
                        .agents
                        .entry(task_id.clone())
                        .and_modify(|a| a.status = status)
                        .or_insert_with(|| AgentSummary {
                            task_id: task_id.clone(),
                            description: String::new(),
                            agent_type: String::new(),
                            status,
                        });
                }
                self.route_or_buffer(
                    session_id,
                    ServerMessage::TaskNotification {
                        session_id,
                        task_id,
                        status,
                        summary,
                    },
                )
                .await;
            }
            AgentWireEvent::Result {
                subtype: _,
                result,
                is_error,
            } => {
                let final_text = {
                    let mut entries = self.entries.write().await;
                    match entries.get_mut(&session_id) {
                        Some(entry) => {
                            let buffered = std::mem::take(&mut entry.assistant_buffer);
                            entry.block_index = 0;
                            result.unwrap_or(buffered)
                        }
                        None => result.unwrap_or_default(),
                    }
                };

                let is_error = is_error.unwrap_or(false);
                if !is_error && !final_text.is_empty() {
                    let _ = self
                        .store
                        .append_message(session_id, "assistant".to_string(), final_text.clone(), now_ms())
                        .await;
                }

                self.route_or_buffer(
                    session_id,
                    ServerMessage::Result {
                        session_id,
                        final_text,
                    },
                )
                .await;

                if is_error {
                    self.route_or_buffer(
                        session_id,
                        ServerMessage::Error {
                            session_id: Some(session_id),
                            message: "agent_reported_error".to_string(),
                            code: None,
                        },
                    )
                    .await;
                } else {
                    self.route_or_buffer(session_id, ServerMessage::Complete { session_id })
                        .await;
                }
            }
            AgentWireEvent::Unknown => {}
        }
    }

    async fn handle_control_request(
        self: &Arc<Self>,
        session_id: Uuid,
        agent_request_id: String,
        request: ControlRequestPayload,
    ) {
        match request {
            ControlRequestPayload::CanUseTool {
                tool_use_id,
                tool_name,
                input,
            } => {
                let pre_allowed = {
                    let entries = self.entries.read().await;
                    entries
                        .get(&session_id)
                        .map(|e| e.allowed_tools.contains(&tool_name))
                        .unwrap_or(false)
                };
                if pre_allowed {
                    self.send_control_response(
                        session_id,
                        agent_request_id,
                        ControlResponsePayload::Permission {
                            decision: PermissionDecision::Allow,
                            updated_input: None,
                        },
                    )
                    .await;
                    return;
                }

                let client_request_id = Uuid::new_v4();
                self.register_pending_control(
                    session_id,
                    client_request_id,
                    agent_request_id.clone(),
                    PendingKind::Permission {
                        tool_name: tool_name.clone(),
                    },
                )
                .await;
                self.route_or_buffer(
                    session_id,
                    ServerMessage::PermissionRequest {
                        session_id,
                        request_id: client_request_id,
                        tool_name: tool_name.clone(),
                        input,
                        tool_use_id,
                    },
                )
                .await;
                self.spawn_resolve_task(
                    session_id,
                    client_request_id,
                    agent_request_id,
                    self.config.session.permission_timeout_ms,
                    PendingKind::Permission { tool_name },
                );
            }
            ControlRequestPayload::UserQuestion {
                tool_use_id,
                questions,
            } => {
                let client_request_id = Uuid::new_v4();
                self.register_pending_control(
                    session_id,
                    client_request_id,
                    agent_request_id.clone(),
                    PendingKind::Question,
                )
                .await;
                self.route_or_buffer(
                    session_id,
                    ServerMessage::AskUserQuestion {
                        session_id,
                        request_id: client_request_id,
                        tool_use_id,
                        questions: questions as Vec<Question>,
                    },
                )
                .await;
                self.spawn_resolve_task(
                    session_id,
                    client_request_id,
                    agent_request_id,
                    self.config.session.question_timeout_ms,
                    PendingKind::Question,
                );
            }
            ControlRequestPayload::ExitPlanMode => {
                let client_request_id = Uuid::new_v4();
                self.register_pending_control(
                    session_id,
                    client_request_id,
                    agent_request_id.clone(),
                    PendingKind::ExitPlanMode,
                )
                .await;
                self.route_or_buffer(
                    session_id,
                    ServerMessage::ExitPlanModeRequest {
                        session_id,
                        request_id: client_request_id,
                    },
                )
                .await;
                self.spawn_resolve_task(
                    session_id,
                    client_request_id,
                    agent_request_id,
                    self.config.session.permission_timeout_ms,
                    PendingKind::ExitPlanMode,
                );
            }
        }
    }

    async fn register_pending_control(
        &self,
        session_id: Uuid,
        client_request_id: Uuid,
        agent_request_id: String,
        kind: PendingKind,
    ) {
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry
                .pending_control
                .insert(client_request_id, (agent_request_id, kind));
        }
    }

    async fn clear_pending_control(&self, session_id: Uuid, client_request_id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.pending_control.remove(&client_request_id);
        }
    }

    fn spawn_resolve_task(
        self: &Arc<Self>,
        session_id: Uuid,
        client_request_id: Uuid,
        agent_request_id: String,
        timeout_ms: u64,
        kind: PendingKind,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager
                .permission_broker
                .wait_for_reply(client_request_id, Duration::from_millis(timeout_ms))
                .await;
            manager
                .resolve_control(session_id, client_request_id, agent_request_id, kind, result)
                .await;
        });
    }

    async fn resolve_control(
        self: &Arc<Self>,
        session_id: Uuid,
        client_request_id: Uuid,
        agent_request_id: String,
        kind: PendingKind,
        result: GatewayResult<PermissionReply>,
    ) {
        self.clear_pending_control(session_id, client_request_id).await;

        let response = match (result, kind) {
            (
                Ok(PermissionReply::Permission { decision, updated_input }),
                PendingKind::Permission { tool_name },
            ) => {
                if matches!(decision, PermissionDecision::AllowAll) {
                    let _ = self.allow_tool(session_id, tool_name).await;
                }
                ControlResponsePayload::Permission {
                    decision,
                    updated_input,
                }
            }
            (Ok(PermissionReply::Question { answers }), PendingKind::Question) => {
                ControlResponsePayload::Question { answers }
            }
            (Ok(PermissionReply::ExitPlanMode { approved }), PendingKind::ExitPlanMode) => {
                ControlResponsePayload::ExitPlanMode { approved }
            }
            (Err(_), PendingKind::Permission { .. }) => {
                self.route_or_buffer(
                    session_id,
                    ServerMessage::Error {
                        session_id: Some(session_id),
                        message: "permission request timed out".to_string(),
                        code: Some("permission_timeout".to_string()),
                    },
                )
                .await;
                ControlResponsePayload::Permission {
                    decision: PermissionDecision::Deny,
                    updated_input: None,
                }
            }
            (Err(_), PendingKind::Question) => ControlResponsePayload::Question { answers: Vec::new() },
            (Err(_), PendingKind::ExitPlanMode) => ControlResponsePayload::ExitPlanMode { approved: false },
            (Ok(_), kind) => {
                tracing::warn!(%session_id, ?kind_label(&kind), "permission reply did not match the pending request kind");
                ControlResponsePayload::Permission {
                    decision: PermissionDecision::Deny,
                    updated_input: None,
                }
            }
        };

        self.send_control_response(session_id, agent_request_id, response).await;
    }

    async fn send_control_response(
        &self,
        session_id: Uuid,
        agent_request_id: String,
        response: ControlResponsePayload,
    ) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&session_id) {
            if let Some(supervisor) = &entry.supervisor {
                let _ = supervisor.send_control_response(agent_request_id, response);
            }
        }
    }

    /// Deliver `msg` to the attached client, or persist it as a
    /// `PendingEvent` if nobody is attached or the attached client's
    /// queue is full/closed. `stderr` lines are transient and
    /// intentionally excluded by callers.
    async fn route_or_buffer(&self, session_id: Uuid, msg: ServerMessage) {
        let attached = {
            let entries = self.entries.read().await;
            entries.get(&session_id).and_then(|e| e.attached.as_ref().map(|a| a.tx.clone()))
        };

        let msg = if let Some(tx) = attached {
            match tx.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Full(msg)) => msg,
                Err(TrySendError::Closed(msg)) => msg,
            }
        } else {
            msg
        };

        let value = serde_json::to_value(&msg).unwrap_or_default();
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let _ = self
            .store
            .enqueue_event(session_id, event_type, value.to_string())
            .await;
    }

    async fn touch_activity(&self, session_id: Uuid) {
        let now = now_ms();
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.row.last_activity = now;
        }
        let _ = self
            .store
            .update_session_field(session_id, SessionField::LastActivity(now))
            .await;
    }

    // ---- public operations (spec.md §4.E) -----------------------------

    pub async fn create_session(
        self: &Arc<Self>,
        identity: &Identity,
        working_directory: String,
        name: Option<String>,
    ) -> GatewayResult<SessionSummary> {
        let home = PathBuf::from(&identity.home);
        let wd = PathBuf::from(&working_directory);
        if !wd.starts_with(&home) {
            return Err(GatewayError::Validation(
                "working directory must be under the owner's home".to_string(),
            ));
        }
        if !wd.exists() {
            return Err(GatewayError::Validation(
                "working directory does not exist".to_string(),
            ));
        }

        let session_id = Uuid::new_v4();
        let now = now_ms();
        let row = SessionRow {
            id: session_id,
            name: name.unwrap_or_else(|| default_session_name(&working_directory)),
            owner_username: identity.username.clone(),
            owner_uid: identity.uid,
            owner_gid: identity.gid,
            owner_home: identity.home.clone(),
            working_directory: working_directory.clone(),
            mode: SessionMode::default(),
            web_search_enabled: false,
            agent_session_id: None,
            created_at: now,
            last_activity: now,
            is_active: true,
        };

        self.store.upsert_session(row.clone()).await?;

        self.reserve_and_insert(session_id, row.clone()).await?;

        self.spawn_supervisor(session_id, identity.clone(), working_directory, None)
            .await;

        if self.config.session.bootstrap_prompt {
            let _ = self
                .send_user_message(
                    session_id,
                    "Please read this project's README or other top-level markdown files \
                     and summarize what it does."
                        .to_string(),
                )
                .await;
        }

        Ok(summary_of(&row, Vec::new()))
    }

    /// Check capacity, evict idle victims, and insert the new entry
    /// under a single write-lock scope, so two concurrent
    /// `create_session` calls can't both observe room under the cap and
    /// both insert.
    async fn reserve_and_insert(&self, session_id: Uuid, row: SessionRow) -> GatewayResult<()> {
        let max = self.config.session.max_sessions as usize;
        let mut entries = self.entries.write().await;
        while entries.len() >= max {
            let victim = scan_idle_victim(&entries).await.ok_or(GatewayError::CapacityExhausted)?;
            if let Some(victim_entry) = entries.remove(&victim) {
                self.teardown_entry(victim, victim_entry).await;
            }
        }
        entries.insert(
            session_id,
            SessionEntry {
                row,
                allowed_tools: HashSet::new(),
                supervisor: None,
                attached: None,
                assistant_buffer: String::new(),
                block_index: 0,
                pending_control: HashMap::new(),
                agents: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Shut down a removed entry's Supervisor, cancel its outstanding
    /// permission requests, close its Terminals and deactivate its row.
    /// Callers must have already removed the entry from `self.entries`
    /// (this never acquires that lock, so it's safe to call while
    /// already holding a write guard on it).
    async fn teardown_entry(&self, session_id: Uuid, entry: SessionEntry) {
        if let Some(supervisor) = entry.supervisor {
            supervisor.shutdown();
        }
        self.permission_broker
            .cancel_all(&entry.pending_control.keys().copied().collect::<Vec<_>>())
            .await;
        self.terminals.close_all_for_session(session_id).await;
        if let Err(e) = self.store.deactivate(session_id).await {
            tracing::warn!(%session_id, error = %e, "failed to deactivate session row during teardown");
        }
    }

    async fn spawn_supervisor(
        self: &Arc<Self>,
        session_id: Uuid,
        identity: Identity,
        working_directory: String,
        resume_agent_session_id: Option<String>,
    ) {
        let supervisor = AgentSupervisor::spawn(
            session_id,
            identity,
            working_directory,
            resume_agent_session_id,
            self.config.clone(),
            self.events_tx.clone(),
        );
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.supervisor = Some(supervisor);
        }
    }

    pub async fn join_session(
        self: &Arc<Self>,
        identity: &Identity,
        session_id: Uuid,
        attach_tx: mpsc::Sender<ServerMessage>,
        kicked: Arc<Notify>,
    ) -> GatewayResult<SessionSummary> {
        let needs_recovery = {
            let entries = self.entries.read().await;
            match entries.get(&session_id) {
                Some(entry) if entry.row.owner_username != identity.username => {
                    return Err(GatewayError::Unauthorized);
                }
                Some(_) => false,
                None => true,
            }
        };

        if needs_recovery {
            let row = self
                .store
                .get_session(session_id)
                .await?
                .ok_or(GatewayError::NotFound)?;
            if row.owner_username != identity.username {
                return Err(GatewayError::Unauthorized);
            }
            let allowed_tools = self
                .store
                .allowed_tools_for(session_id)
                .await?
                .into_iter()
                .collect();
            self.entries.write().await.insert(
                session_id,
                SessionEntry {
                    row: row.clone(),
                    allowed_tools,
                    supervisor: None,
                    attached: None,
                    assistant_buffer: String::new(),
                    block_index: 0,
                    pending_control: HashMap::new(),
                    agents: HashMap::new(),
                },
            );
            self.spawn_supervisor(
                session_id,
                Identity {
                    username: row.owner_username.clone(),
                    uid: row.owner_uid,
                    gid: row.owner_gid,
                    home: row.owner_home.clone(),
                },
                row.working_directory.clone(),
                row.agent_session_id.clone(),
            )
            .await;
        }

        {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(&session_id).ok_or(GatewayError::NotFound)?;
            if let Some(previous) = entry.attached.replace(AttachedClient {
                tx: attach_tx.clone(),
                kicked: Arc::clone(&kicked),
            }) {
                if !Arc::ptr_eq(&previous.kicked, &kicked) {
                    previous.kicked.notify_one();
                }
            }
        }

        let pending = self.store.drain_events(session_id).await?;
        let mut delivered_up_to: Option<i64> = None;
        for event in &pending {
            if let Ok(msg) = serde_json::from_str::<ServerMessage>(&event.payload) {
                if attach_tx.try_send(msg).is_err() {
                    break;
                }
            }
            delivered_up_to = Some(event.sequence);
        }
        if let Some(sequence) = delivered_up_to {
            self.store.purge_events(session_id, sequence).await?;
        }

        self.summary(session_id).await
    }

    /// Detach whichever client is currently attached, without tearing
    /// down the Supervisor — the session keeps buffering events.
    pub async fn detach(&self, session_id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.attached = None;
        }
    }

    pub async fn list_sessions(&self, identity: &Identity) -> GatewayResult<Vec<SessionSummary>> {
        let rows = self.store.find_by_owner(identity.username.clone()).await?;
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let tools = self.store.allowed_tools_for(row.id).await?;
            summaries.push(summary_of(&row, tools));
        }
        Ok(summaries)
    }

    pub async fn rename_session(&self, session_id: Uuid, name: String) -> GatewayResult<()> {
        self.store
            .update_session_field(session_id, SessionField::Name(name.clone()))
            .await?;
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.row.name = name;
        }
        Ok(())
    }

    pub async fn set_mode(&self, session_id: Uuid, mode: SessionMode) -> GatewayResult<()> {
        self.store
            .update_session_field(session_id, SessionField::Mode(mode))
            .await?;
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.row.mode = mode;
        }
        Ok(())
    }

    pub async fn set_web_search(&self, session_id: Uuid, enabled: bool) -> GatewayResult<()> {
        self.store
            .update_session_field(session_id, SessionField::WebSearchEnabled(enabled))
            .await?;
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.row.web_search_enabled = enabled;
        }
        Ok(())
    }

    async fn allow_tool(&self, session_id: Uuid, name: String) -> GatewayResult<()> {
        self.store.allow_tool(session_id, name.clone()).await?;
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.allowed_tools.insert(name);
        }
        Ok(())
    }

    pub async fn clear_allowed_tools(&self, session_id: Uuid) -> GatewayResult<()> {
        self.store.clear_allowed_tools(session_id).await?;
        if let Some(entry) = self.entries.write().await.get_mut(&session_id) {
            entry.allowed_tools.clear();
        }
        Ok(())
    }

    pub async fn send_user_message(&self, session_id: Uuid, content: String) -> GatewayResult<()> {
        // Persist-then-send: the transcript gains the user turn before
        // the Supervisor ever observes it.
        self.store
            .append_message(session_id, "user".to_string(), content.clone(), now_ms())
            .await?;

        let entries = self.entries.read().await;
        let entry = entries.get(&session_id).ok_or(GatewayError::NotFound)?;
        let supervisor = entry.supervisor.as_ref().ok_or(GatewayError::AgentCrash(
            "no live agent for this session".to_string(),
        ))?;
        supervisor.send_user_message(content)
    }

    pub async fn interrupt(&self, session_id: Uuid) -> GatewayResult<()> {
        let pending_ids: Vec<Uuid> = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(&session_id).ok_or(GatewayError::NotFound)?;
            entry.assistant_buffer.clear();
            entry.block_index = 0;
            entry.pending_control.keys().copied().collect()
        };
        self.permission_broker.cancel_all(&pending_ids).await;

        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&session_id) {
            if let Some(supervisor) = &entry.supervisor {
                supervisor.interrupt()?;
            }
        }
        drop(entries);

        self.route_or_buffer(session_id, ServerMessage::Cancelled { session_id }).await;
        Ok(())
    }

    pub async fn respond_permission(
        &self,
        request_id: Uuid,
        decision: PermissionDecision,
        updated_input: Option<serde_json::Value>,
    ) {
        self.permission_broker
            .reply(
                request_id,
                PermissionReply::Permission {
                    decision,
                    updated_input,
                },
            )
            .await;
    }

    pub async fn respond_prompt(&self, request_id: Uuid, answers: Vec<String>) {
        self.permission_broker
            .reply(request_id, PermissionReply::Question { answers })
            .await;
    }

    pub async fn respond_exit_plan_mode(&self, request_id: Uuid, approved: bool) {
        self.permission_broker
            .reply(request_id, PermissionReply::ExitPlanMode { approved })
            .await;
    }

    pub async fn reset_session(
        self: &Arc<Self>,
        identity: &Identity,
        session_id: Uuid,
    ) -> GatewayResult<SessionSummary> {
        let (name, working_directory) = {
            let entries = self.entries.read().await;
            let entry = entries.get(&session_id).ok_or(GatewayError::NotFound)?;
            (entry.row.name.clone(), entry.row.working_directory.clone())
        };
        self.delete_session(session_id).await?;
        self.create_session(identity, working_directory, Some(name)).await
    }

    /// Kill the Supervisor and Terminals, mark the row inactive.
    /// Transcript is retained.
    pub async fn terminate_session(&self, session_id: Uuid) -> GatewayResult<()> {
        let entry = self.entries.write().await.remove(&session_id);
        if let Some(entry) = entry {
            self.teardown_entry(session_id, entry).await;
        } else {
            self.terminals.close_all_for_session(session_id).await;
            self.store.deactivate(session_id).await?;
        }
        Ok(())
    }

    /// Best-effort interrupt of every live Supervisor, without
    /// terminating sessions or touching the store — rows stay
    /// `is_active` so a future process recovers them. Used on server
    /// shutdown.
    pub async fn interrupt_all(&self) {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            if let Some(supervisor) = &entry.supervisor {
                let _ = supervisor.interrupt();
            }
        }
    }

    /// Take every live Supervisor out of its entry and shut it down,
    /// leaving session rows untouched for reattachment after restart.
    pub async fn shutdown_all_supervisors(&self) {
        let supervisors: Vec<AgentSupervisor> = {
            let mut entries = self.entries.write().await;
            entries.values_mut().filter_map(|e| e.supervisor.take()).collect()
        };
        for supervisor in supervisors {
            supervisor.shutdown();
        }
    }

    /// Terminate + hard-delete all rows.
    pub async fn delete_session(&self, session_id: Uuid) -> GatewayResult<()> {
        self.terminate_session(session_id).await?;
        self.store.delete(session_id).await?;
        Ok(())
    }

    /// Terminate sessions whose `last_activity` exceeds the configured
    /// timeout. Intended to be called on a 1-minute timer.
    pub async fn idle_sweep(&self) -> GatewayResult<Vec<Uuid>> {
        let timeout_ms = self.config.session.session_timeout_ms as i64;
        let cutoff = now_ms() - timeout_ms;
        let expired = self.store.expire_sessions_older_than(cutoff).await?;
        for id in &expired {
            let _ = self.terminate_session(*id).await;
        }
        Ok(expired)
    }

    /// Sub-agent ("Task") activity, tracked from `AgentStart` /
    /// `TaskNotification` events as they arrive. Not a durable table —
    /// a snapshot is only ever as good as the events observed this
    /// process lifetime, and resets on recovery after a restart.
    pub async fn list_agents(&self, session_id: Uuid) -> Vec<AgentSummary> {
        self.entries
            .read()
            .await
            .get(&session_id)
            .map(|e| e.agents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn summary(&self, session_id: Uuid) -> GatewayResult<SessionSummary> {
        let entries = self.entries.read().await;
        let entry = entries.get(&session_id).ok_or(GatewayError::NotFound)?;
        Ok(summary_of(
            &entry.row,
            entry.allowed_tools.iter().cloned().collect(),
        ))
    }

    pub fn terminals(&self) -> Arc<TerminalManager> {
        Arc::clone(&self.terminals)
    }

    pub async fn owner_home(&self, session_id: Uuid) -> Option<PathBuf> {
        self.entries
            .read()
            .await
            .get(&session_id)
            .map(|e| Path::new(&e.row.owner_home).to_path_buf())
    }
}

/// The oldest non-busy entry, a candidate for eviction when capacity is
/// reached. Never evicts a session whose agent is mid-turn.
async fn scan_idle_victim(entries: &HashMap<Uuid, SessionEntry>) -> Option<Uuid> {
    let mut oldest: Option<(Uuid, i64)> = None;
    for (id, entry) in entries.iter() {
        let busy = match &entry.supervisor {
            Some(sup) => matches!(sup.state().await, AgentState::Processing),
            None => false,
        };
        if busy {
            continue;
        }
        if oldest.map(|(_, la)| entry.row.last_activity < la).unwrap_or(true) {
            oldest = Some((*id, entry.row.last_activity));
        }
    }
    oldest.map(|(id, _)| id)
}

fn kind_label(kind: &PendingKind) -> &'static str {
    match kind {
        PendingKind::Permission { .. } => "permission",
        PendingKind::Question => "question",
        PendingKind::ExitPlanMode => "exit_plan_mode",
    }
}

fn summary_of(row: &SessionRow, allowed_tools: Vec<String>) -> SessionSummary {
    SessionSummary {
        id: row.id,
        name: row.name.clone(),
        working_directory: row.working_directory.clone(),
        mode: row.mode,
        web_search_enabled: row.web_search_enabled,
        allowed_tools,
        agent_session_id: row.agent_session_id.clone(),
        created_at: row.created_at,
        last_activity: row.last_activity,
    }
}

fn default_session_name(working_directory: &str) -> String {
    Path::new(working_directory)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "session".to_string())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
