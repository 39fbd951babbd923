use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session permission mode. Variant names keep their literal wire
/// casing (`acceptEdits` is camelCase among otherwise lowercase names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Plan
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionMode::Default => "default",
            SessionMode::AcceptEdits => "acceptEdits",
            SessionMode::Plan => "plan",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(SessionMode::Default),
            "acceptEdits" => Ok(SessionMode::AcceptEdits),
            "plan" => Ok(SessionMode::Plan),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

/// A permission decision for a single tool-use request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowAll,
    Deny,
}

/// Status of a sub-agent ("Task") run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// A single question posed by `askUserQuestion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub question: String,
    pub options: Vec<String>,
    pub multi_select: bool,
}

/// Kind of a streamed content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlockKind {
    Text,
    ToolUse,
}

/// Summary of a session, as returned to clients in `session_created`,
/// `session_joined`, `sessions_list`, `session_reset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    pub working_directory: String,
    pub mode: SessionMode,
    pub web_search_enabled: bool,
    pub allowed_tools: Vec<String>,
    pub agent_session_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
}

/// Summary of a live sub-agent ("Task") for `agents_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub task_id: String,
    pub description: String,
    pub agent_type: String,
    pub status: TaskStatus,
}

/// Messages a client sends to the Client Broker.
///
/// A closed set of client->server commands. Commands that act on "the"
/// session act on the connection's currently joined session; commands
/// that name a `session_id` explicitly (rename/delete/reset) may
/// target any session the connection's identity owns, joined or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateSession {
        working_directory: String,
        #[serde(default)]
        name: Option<String>,
    },
    JoinSession {
        session_id: Uuid,
    },
    ListSessions,
    RenameSession {
        session_id: Uuid,
        name: String,
    },
    DeleteSession {
        session_id: Uuid,
    },
    ResetSession {
        session_id: Uuid,
    },
    Message {
        content: String,
    },
    Cancel,
    PromptResponse {
        request_id: Uuid,
        answers: Vec<String>,
    },
    PermissionResponse {
        request_id: Uuid,
        decision: PermissionDecision,
        #[serde(default)]
        updated_input: Option<Value>,
    },
    ExitPlanModeResponse {
        request_id: Uuid,
        approved: bool,
    },
    SetMode {
        mode: SessionMode,
    },
    SetWebSearch {
        enabled: bool,
    },
    ListAgents,
    TerminalCreate {
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    TerminalInput {
        terminal_id: Uuid,
        /// Base64-encoded raw bytes written to the PTY.
        data: String,
    },
    TerminalResize {
        terminal_id: Uuid,
        cols: u16,
        rows: u16,
    },
    TerminalClose {
        terminal_id: Uuid,
    },
}

/// Messages the Client Broker sends to a client.
///
/// Closed set: the lifecycle/session/terminal types plus the
/// Supervisor's event names from spec section 4.B, each carrying the
/// `session_id` it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        username: String,
    },
    SessionCreated {
        session: SessionSummary,
    },
    SessionJoined {
        session: SessionSummary,
    },
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    SessionRenamed {
        session_id: Uuid,
        name: String,
    },
    SessionDeleted {
        session_id: Uuid,
    },
    SessionReset {
        session: SessionSummary,
    },
    ModeChanged {
        session_id: Uuid,
        mode: SessionMode,
    },
    WebSearchChanged {
        session_id: Uuid,
        enabled: bool,
    },
    AgentsList {
        session_id: Uuid,
        agents: Vec<AgentSummary>,
    },
    TerminalCreated {
        terminal_id: Uuid,
        name: String,
        cwd: String,
    },
    TerminalData {
        terminal_id: Uuid,
        /// Base64-encoded raw bytes read from the PTY.
        data: String,
    },
    TerminalExit {
        terminal_id: Uuid,
        code: Option<i32>,
    },
    TerminalClosed {
        terminal_id: Uuid,
    },
    AssistantStart {
        session_id: Uuid,
    },
    TextChunk {
        session_id: Uuid,
        text: String,
        block_index: u32,
    },
    ContentBlockStart {
        session_id: Uuid,
        kind: ContentBlockKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    ContentBlockStop {
        session_id: Uuid,
    },
    ToolUse {
        session_id: Uuid,
        id: String,
        name: String,
        input: Value,
    },
    PermissionRequest {
        session_id: Uuid,
        request_id: Uuid,
        tool_name: String,
        input: Value,
        tool_use_id: String,
    },
    AskUserQuestion {
        session_id: Uuid,
        request_id: Uuid,
        tool_use_id: String,
        questions: Vec<Question>,
    },
    ExitPlanModeRequest {
        session_id: Uuid,
        request_id: Uuid,
    },
    AgentStart {
        session_id: Uuid,
        task_id: String,
        description: String,
        agent_type: String,
        start_time: i64,
    },
    TaskNotification {
        session_id: Uuid,
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Result {
        session_id: Uuid,
        final_text: String,
    },
    Complete {
        session_id: Uuid,
    },
    Cancelled {
        session_id: Uuid,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Stderr {
        session_id: Uuid,
        text: String,
    },
}

// --- Agent subprocess wire format (stdin/stdout, newline-delimited JSON) ---

/// One line written to the agent's stdin for a user turn.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStdinUser<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: AgentStdinUserMessage<'a>,
    pub parent_tool_use_id: Option<String>,
    pub session_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStdinUserMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> AgentStdinUser<'a> {
    pub fn new(session_id: &'a str, content: &'a str) -> Self {
        Self {
            kind: "user",
            message: AgentStdinUserMessage {
                role: "user",
                content,
            },
            parent_tool_use_id: None,
            session_id,
        }
    }
}

/// A control-response line written to the agent's stdin, answering a
/// `control_request` the agent emitted on stdout (permission, question,
/// exit-plan-mode). Realized as additional tagged objects on the same
/// newline-JSON streams carrying ordinary agent turns.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStdinControl {
    ControlResponse {
        request_id: String,
        response: ControlResponsePayload,
    },
    Interrupt,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponsePayload {
    Permission {
        decision: PermissionDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
    },
    Question {
        answers: Vec<String>,
    },
    ExitPlanMode {
        approved: bool,
    },
}

/// One parsed line of the agent's stdout stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentWireEvent {
    System {
        subtype: Option<String>,
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantWireMessage,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestPayload,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    AgentStart {
        task_id: String,
        description: String,
        agent_type: String,
        start_time: i64,
    },
    TaskNotification {
        task_id: String,
        status: TaskStatus,
        #[serde(default)]
        summary: Option<String>,
    },
    Result {
        subtype: String,
        result: Option<String>,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantWireMessage {
    pub role: String,
    pub content: Vec<AssistantContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlRequestPayload {
    CanUseTool {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    UserQuestion {
        tool_use_id: String,
        questions: Vec<Question>,
    },
    ExitPlanMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_create_session_roundtrip() {
        let msg = ClientMessage::CreateSession {
            working_directory: "/h/u/p".to_string(),
            name: Some("proj".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"create_session""#));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::CreateSession { working_directory, name } => {
                assert_eq!(working_directory, "/h/u/p");
                assert_eq!(name.as_deref(), Some("proj"));
            }
            _ => panic!("expected CreateSession"),
        }
    }

    #[test]
    fn client_message_terminal_resize() {
        let json = r#"{"type":"terminal_resize","terminal_id":"00000000-0000-0000-0000-000000000000","cols":120,"rows":40}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::TerminalResize { cols, rows, .. } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            _ => panic!("expected TerminalResize"),
        }
    }

    #[test]
    fn server_message_permission_request_shape() {
        let msg = ServerMessage::PermissionRequest {
            session_id: Uuid::nil(),
            request_id: Uuid::nil(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            tool_use_id: "tu_1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"permission_request""#));
        assert!(json.contains(r#""tool_name":"Bash""#));
    }

    #[test]
    fn server_message_error_omits_null_fields() {
        let msg = ServerMessage::Error {
            session_id: None,
            message: "boom".to_string(),
            code: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("session_id"));
        assert!(!json.contains("code"));
    }

    #[test]
    fn session_mode_literal_casing() {
        assert_eq!(
            serde_json::to_string(&SessionMode::AcceptEdits).unwrap(),
            r#""acceptEdits""#
        );
        assert_eq!(serde_json::to_string(&SessionMode::Plan).unwrap(), r#""plan""#);
        let parsed: SessionMode = serde_json::from_str(r#""acceptEdits""#).unwrap();
        assert_eq!(parsed, SessionMode::AcceptEdits);
    }

    #[test]
    fn permission_decision_snake_case() {
        assert_eq!(
            serde_json::to_string(&PermissionDecision::AllowAll).unwrap(),
            r#""allow_all""#
        );
    }

    #[test]
    fn agent_wire_event_system_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"agent-sess-1"}"#;
        let parsed: AgentWireEvent = serde_json::from_str(line).unwrap();
        match parsed {
            AgentWireEvent::System { subtype, session_id } => {
                assert_eq!(subtype.as_deref(), Some("init"));
                assert_eq!(session_id.as_deref(), Some("agent-sess-1"));
            }
            _ => panic!("expected System"),
        }
    }

    #[test]
    fn agent_wire_event_result() {
        let line = r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#;
        let parsed: AgentWireEvent = serde_json::from_str(line).unwrap();
        match parsed {
            AgentWireEvent::Result { result, is_error, .. } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert_eq!(is_error, Some(false));
            }
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn agent_wire_event_unknown_does_not_fail() {
        let line = r#"{"type":"some_future_event","foo":"bar"}"#;
        let parsed: AgentWireEvent = serde_json::from_str(line).unwrap();
        assert!(matches!(parsed, AgentWireEvent::Unknown));
    }

    #[test]
    fn agent_stdin_user_shape() {
        let msg = AgentStdinUser::new("sess-1", "ping");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"user""#));
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#""content":"ping""#));
        assert!(json.contains(r#""session_id":"sess-1""#));
    }

    #[test]
    fn control_response_permission_shape() {
        let msg = AgentStdinControl::ControlResponse {
            request_id: "req-1".to_string(),
            response: ControlResponsePayload::Permission {
                decision: PermissionDecision::AllowAll,
                updated_input: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"control_response""#));
        assert!(json.contains(r#""decision":"allow_all""#));
    }
}
