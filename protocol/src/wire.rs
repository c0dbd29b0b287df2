//! Request and response shapes for the stdio line protocol.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::config_types::ReasoningEffort;
use crate::model::Usage;

/// Caller-chosen correlation id, echoed back verbatim on every response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// One request line from the front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub action: Action,
}

/// Carried by a repair-retry `send` after a `diff_error`. Rendered into the
/// prompt, never stored in chat history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    pub errors: Vec<String>,
    pub tool_calls: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    // Liveness / bootstrap.
    Init,
    Ping,
    ChatActive,

    // Read-only chat state.
    ChatList,
    ChatGet {
        #[serde(default)]
        chat_id: Option<Uuid>,
    },
    Estimate,

    // Chat CRUD.
    ChatNew {
        #[serde(default)]
        model: Option<String>,
    },
    ChatSelect {
        chat_id: Uuid,
    },
    ChatRename {
        chat_id: Uuid,
        title: String,
    },
    ChatDelete {
        chat_id: Uuid,
    },

    // Context mutation.
    ContextAdd {
        path: String,
        content: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default)]
        external: bool,
    },
    ContextUpdate {
        path: String,
        content: String,
    },
    ContextRemove {
        path: String,
    },
    ContextAddSection {
        path: String,
        content: String,
        start_line: usize,
        end_line: usize,
    },
    ContextRemoveSection {
        path: String,
        start_line: usize,
        end_line: usize,
    },
    ContextSetReadOnly {
        path: String,
        read_only: bool,
    },

    // Pending-output lifecycle.
    OutputApply {
        path: String,
        /// The front-end's current view of the file in the working tree.
        /// Absent means the file no longer exists on disk.
        #[serde(default)]
        disk_content: Option<String>,
    },
    OutputSaveAs {
        path: String,
        new_path: String,
    },
    OutputReject {
        path: String,
    },

    // Per-chat settings.
    DraftSave {
        content: String,
    },
    SettingsSave {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reasoning_effort: Option<ReasoningEffort>,
    },
    PrepareInstructions,
    SystemMessage {
        content: String,
    },

    // The turn engine.
    Send {
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reasoning_effort: Option<ReasoningEffort>,
        #[serde(default)]
        retry_context: Option<RetryContext>,
    },
    Cancel {
        #[serde(default)]
        target_request_id: Option<RequestId>,
    },
    Shutdown,
}

/// Dispatch classification. Decides mutex acquisition and whether the action
/// is rejected while a stream is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    NoState,
    ReadState,
    MutateState,
    Send,
    Cancel,
    Shutdown,
}

impl Action {
    pub fn class(&self) -> ActionClass {
        match self {
            Action::Init | Action::Ping => ActionClass::NoState,
            Action::ChatActive
            | Action::ChatList
            | Action::ChatGet { .. }
            | Action::Estimate
            | Action::PrepareInstructions => ActionClass::ReadState,
            Action::ChatNew { .. }
            | Action::ChatSelect { .. }
            | Action::ChatRename { .. }
            | Action::ChatDelete { .. }
            | Action::ContextAdd { .. }
            | Action::ContextUpdate { .. }
            | Action::ContextRemove { .. }
            | Action::ContextAddSection { .. }
            | Action::ContextRemoveSection { .. }
            | Action::ContextSetReadOnly { .. }
            | Action::OutputApply { .. }
            | Action::OutputSaveAs { .. }
            | Action::OutputReject { .. }
            | Action::DraftSave { .. }
            | Action::SettingsSave { .. }
            | Action::SystemMessage { .. } => ActionClass::MutateState,
            Action::Send { .. } => ActionClass::Send,
            Action::Cancel { .. } => ActionClass::Cancel,
            Action::Shutdown => ActionClass::Shutdown,
        }
    }

    /// Actions refused with a busy conflict while a stream is in flight.
    /// Everything mutating is in the set, plus `prepare_instructions` since
    /// its result feeds the next send.
    pub fn blocked_during_stream(&self) -> bool {
        matches!(self.class(), ActionClass::MutateState)
            || matches!(self, Action::PrepareInstructions)
    }

    /// Whether the handler reads or writes chat state and therefore runs
    /// under the process state mutex.
    pub fn uses_chat_state(&self) -> bool {
        matches!(
            self.class(),
            ActionClass::ReadState | ActionClass::MutateState
        )
    }
}

/// Raw tool call echoed back on `diff_error` so the front-end can build a
/// repair retry. `args` is the decoded argument object, not a double-encoded
/// string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub path: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    Chunk {
        content: String,
    },
    Thinking {
        content: String,
    },
    Done {
        output_files: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        /// Seconds from reservation to completion.
        duration: f64,
    },
    Error {
        message: String,
    },
    DiffError {
        errors: Vec<String>,
        tool_calls: Vec<ToolCallRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        duration: f64,
    },
    /// Asynchronous; may arrive at any time after the first exchange.
    TitleUpdated {
        chat_id: Uuid,
        title: String,
    },
    /// Generic acknowledgment for the CRUD surface.
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Pong,
}

impl ServerResponse {
    pub fn ok() -> Self {
        ServerResponse::Ok { data: None }
    }

    pub fn ok_with(data: serde_json::Value) -> Self {
        ServerResponse::Ok { data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerResponse::Error {
            message: message.into(),
        }
    }
}

/// A fully-addressed response line: the response plus the echoed request id.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub response: ServerResponse,
}
