//! Chat state: messages, message parts, context files, pending outputs.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

use crate::config_types::ReasoningEffort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Token accounting for one completion, echoed to the front-end on `done`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Audit entry recorded in message history whenever chat state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ContextAction {
    UserAddFile,
    UserRemoveFile,
    UserUpdateFile,
    UserAddSection,
    UserRemoveSection,
    UserSetReadOnly,
    AssistantWriteFile,
    UserApplyFile,
    UserSaveAs,
    UserRejectOutput,
    ForkWarningModified,
    ForkWarningDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEvent {
    pub action: ContextAction,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    #[serde(default)]
    pub added: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
}

impl ContextEvent {
    pub fn new(action: ContextAction, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            version: None,
            prev_version: None,
            read_only: None,
            external: None,
            added: false,
            start_line: None,
            end_line: None,
            original_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Natural-language assistant or user text.
    Text { content: String },
    /// Assistant reasoning.
    Thinking { content: String },
    /// Verbatim payload with a language hint.
    Code { lang: String, content: String },
    /// Verbatim payload.
    Raw { content: String },
    ContextEvent(ContextEvent),
}

/// One entry in a chat. A message carries either a flat `content` string
/// (legacy) or an ordered list of `parts`, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<MessagePart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn flat(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            parts: None,
            usage: None,
            model: None,
            reasoning_effort: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parts(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            role,
            content: None,
            parts: Some(parts),
            usage: None,
            model: None,
            reasoning_effort: None,
            created_at: Utc::now(),
        }
    }

    /// Flat content, or the concatenation of this message's text parts.
    pub fn text_content(&self) -> String {
        if let Some(content) = &self.content {
            return content.clone();
        }
        let mut out = String::new();
        if let Some(parts) = &self.parts {
            for part in parts {
                if let MessagePart::Text { content } = part {
                    out.push_str(content);
                }
            }
        }
        out
    }
}

/// A file (or a section of one) the user attached to the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
    pub read_only: bool,
    /// Lives outside the project root.
    pub external: bool,
    /// 1-indexed inclusive section range. Section entries are always
    /// readonly and immutable once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    pub fingerprint: String,
}

impl ContextFile {
    pub fn is_section(&self) -> bool {
        self.start_line.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub model: String,
    pub reasoning_effort: ReasoningEffort,
    #[serde(default)]
    pub draft: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub context_files: Vec<ContextFile>,
    /// Pending assistant-produced content per path, not yet applied to the
    /// user's working tree. At most one pending output per path.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(model: impl Into<String>, reasoning_effort: ReasoningEffort) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: None,
            model: model.into(),
            reasoning_effort,
            draft: String::new(),
            messages: Vec::new(),
            context_files: Vec::new(),
            outputs: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// The whole-file context entry for `path`, if any. A path appears at
    /// most once as a whole-file entry; section entries are separate.
    pub fn whole_file(&self, path: &str) -> Option<&ContextFile> {
        self.context_files
            .iter()
            .find(|f| f.path == path && !f.is_section())
    }

    pub fn whole_file_mut(&mut self, path: &str) -> Option<&mut ContextFile> {
        self.context_files
            .iter_mut()
            .find(|f| f.path == path && !f.is_section())
    }

    pub fn sections_for(&self, path: &str) -> impl Iterator<Item = &ContextFile> {
        self.context_files
            .iter()
            .filter(move |f| f.path == path && f.is_section())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_event_serializes_camel_case() {
        let mut event = ContextEvent::new(ContextAction::UserAddSection, "src/lib.rs");
        event.start_line = Some(3);
        event.end_line = Some(9);
        event.read_only = Some(true);
        let value = serde_json::to_value(&event).expect("serializes");
        assert_eq!(value["action"], "UserAddSection");
        assert_eq!(value["startLine"], 3);
        assert_eq!(value["endLine"], 9);
        assert_eq!(value["readOnly"], true);
        assert!(value.get("prevVersion").is_none());
    }

    #[test]
    fn message_part_tagging_round_trips() {
        let part = MessagePart::Code {
            lang: "rust".to_string(),
            content: "fn main() {}".to_string(),
        };
        let json = serde_json::to_string(&part).expect("serializes");
        assert!(json.contains("\"type\":\"code\""));
        let back: MessagePart = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, part);
    }

    #[test]
    fn whole_file_ignores_sections() {
        let mut chat = Chat::new("test-model", ReasoningEffort::default());
        chat.context_files.push(ContextFile {
            path: "src/main.rs".to_string(),
            content: "fn main() {}".to_string(),
            read_only: true,
            external: false,
            start_line: Some(1),
            end_line: Some(1),
            fingerprint: "sec".to_string(),
        });
        assert!(chat.whole_file("src/main.rs").is_none());
        assert_eq!(chat.sections_for("src/main.rs").count(), 1);
    }
}
