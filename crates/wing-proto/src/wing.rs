use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a wing declares about itself at registration time. Immutable for the
/// lifetime of the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Additional identities the wing answers to when tasks are routed.
    #[serde(default)]
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub wing_id: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub allowed_peers: u32,
}

/// Messages sent from a wing to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WingMessage {
    Register(RegisterPayload),
    Heartbeat,
    /// The wing's owner locked or unlocked it.
    LockState {
        locked: bool,
    },
    SessionStarted {
        session_id: String,
        #[serde(default)]
        agent: String,
        #[serde(default)]
        cwd: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    SessionOutput {
        session_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    SessionExited {
        session_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    ChatEvent {
        session_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    DirResult {
        request_id: String,
        #[serde(default)]
        entries: Vec<DirEntry>,
    },
    SessionsResult {
        request_id: String,
        #[serde(default)]
        sessions: Vec<SessionInfo>,
    },
    HistoryResult {
        request_id: String,
        #[serde(default)]
        entries: Vec<Value>,
    },
    AuditResult {
        request_id: String,
        #[serde(default)]
        entries: Vec<Value>,
    },
    Reclaim {
        session_id: String,
        #[serde(default)]
        agent: String,
        #[serde(default)]
        cwd: String,
    },
    TaskOutput {
        task_id: String,
        chunk: String,
    },
    TaskDone {
        task_id: String,
        #[serde(default)]
        output: String,
    },
    TaskError {
        task_id: String,
        error: String,
    },
}

impl WingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WingMessage::Register(_) => "register",
            WingMessage::Heartbeat => "heartbeat",
            WingMessage::LockState { .. } => "lock_state",
            WingMessage::SessionStarted { .. } => "session_started",
            WingMessage::SessionOutput { .. } => "session_output",
            WingMessage::SessionExited { .. } => "session_exited",
            WingMessage::ChatEvent { .. } => "chat_event",
            WingMessage::DirResult { .. } => "dir_result",
            WingMessage::SessionsResult { .. } => "sessions_result",
            WingMessage::HistoryResult { .. } => "history_result",
            WingMessage::AuditResult { .. } => "audit_result",
            WingMessage::Reclaim { .. } => "reclaim",
            WingMessage::TaskOutput { .. } => "task_output",
            WingMessage::TaskDone { .. } => "task_done",
            WingMessage::TaskError { .. } => "task_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
}

/// A session as reported by the wing itself in reply to `sync_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub cwd: String,
}

/// Payload describing a task handed to a wing for execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub isolation: Option<String>,
}

/// Messages sent from the relay to a wing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Registered {
        connection_id: u64,
        wing_id: String,
    },
    Error {
        message: String,
    },
    SubmitTask {
        task_id: String,
        #[serde(flatten)]
        spec: TaskSpec,
    },
    ListDir {
        request_id: String,
        path: String,
    },
    SyncSessions {
        request_id: String,
    },
    SessionHistory {
        request_id: String,
        session_id: String,
    },
    AuditStream {
        request_id: String,
        #[serde(default)]
        since: Option<i64>,
    },
    ReclaimAccepted {
        session_id: String,
    },
    KillSession {
        session_id: String,
        reason: String,
    },
    OrgChanged {
        user_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn register_defaults_optional_fields() {
        let msg: WingMessage =
            serde_json::from_value(json!({"type": "register", "wing_id": "w-1"})).unwrap();
        match msg {
            WingMessage::Register(payload) => {
                assert_eq!(payload.wing_id, "w-1");
                assert!(payload.org.is_none());
                assert!(payload.capabilities.agents.is_empty());
                assert!(!payload.locked);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn session_frames_keep_opaque_fields() {
        let raw = json!({
            "type": "session_output",
            "session_id": "s-1",
            "data": "aGVsbG8=",
            "seq": 4
        });
        let msg: WingMessage = serde_json::from_value(raw).unwrap();
        let WingMessage::SessionOutput { session_id, extra } = msg else {
            panic!("expected session_output");
        };
        assert_eq!(session_id, "s-1");
        assert_eq!(extra.get("data"), Some(&json!("aGVsbG8=")));
        assert_eq!(extra.get("seq"), Some(&json!(4)));
    }

    #[test_timeout::timeout]
    fn heartbeat_is_distinct_from_commands() {
        let msg: WingMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg.kind(), "heartbeat");
        assert!(serde_json::from_str::<WingMessage>(r#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test_timeout::timeout]
    fn submit_task_flattens_spec() {
        let msg = RelayMessage::SubmitTask {
            task_id: "t-1".into(),
            spec: TaskSpec {
                prompt: "ls".into(),
                skill: Some("shell".into()),
                agent: None,
                isolation: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "submit_task");
        assert_eq!(value["prompt"], "ls");
        assert_eq!(value["skill"], "shell");
    }
}
