//! Tool declarations sent to the completion service and the parser for the
//! argument payloads that come back.
//!
//! The diff mode decides both sides: mode `off` declares only `write_file`;
//! the other modes additionally declare `edit_file` with that mode's
//! argument schema, and `edit_file` arguments are parsed according to the
//! same mode.

use std::collections::BTreeMap;

use bb7_protocol::DiffMode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub const WRITE_FILE_TOOL: &str = "write_file";
pub const EDIT_FILE_TOOL: &str = "edit_file";

/// Generic JSON-Schema subset needed for our tool definitions.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum JsonSchema {
    Boolean {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    String {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        items: Box<JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Vec<String>>,
        #[serde(
            rename = "additionalProperties",
            skip_serializing_if = "Option::is_none"
        )]
        additional_properties: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub(crate) struct ToolSpec {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) strict: bool,
    pub(crate) parameters: JsonSchema,
}

fn string_prop(description: &str) -> JsonSchema {
    JsonSchema::String {
        description: Some(description.to_string()),
    }
}

fn create_write_file_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert(
        "path".to_string(),
        string_prop("Project-relative path of the file to create or rewrite"),
    );
    properties.insert(
        "content".to_string(),
        string_prop("Complete new file content"),
    );

    ToolSpec {
        name: WRITE_FILE_TOOL.to_string(),
        description: "Create a new file or fully rewrite an existing writable file".to_string(),
        strict: false,
        parameters: JsonSchema::Object {
            properties,
            required: Some(vec!["path".to_string(), "content".to_string()]),
            additional_properties: Some(false),
        },
    }
}

fn search_replace_edit_properties() -> BTreeMap<String, JsonSchema> {
    let mut properties = BTreeMap::new();
    properties.insert("path".to_string(), string_prop("Path of the file to edit"));
    properties.insert(
        "fileId".to_string(),
        string_prop("The id attribute shown on the file's block"),
    );
    properties.insert(
        "old".to_string(),
        string_prop("Exact text to replace, copied verbatim"),
    );
    properties.insert("new".to_string(), string_prop("Replacement text"));
    properties.insert(
        "replaceAll".to_string(),
        JsonSchema::Boolean {
            description: Some("Replace every occurrence instead of exactly one".to_string()),
        },
    );
    properties
}

fn create_edit_file_tool(mode: DiffMode) -> Option<ToolSpec> {
    let parameters = match mode {
        DiffMode::Off => return None,
        DiffMode::SearchReplace => JsonSchema::Object {
            properties: search_replace_edit_properties(),
            required: Some(vec![
                "path".to_string(),
                "old".to_string(),
                "new".to_string(),
            ]),
            additional_properties: Some(false),
        },
        DiffMode::SearchReplaceMulti => {
            let mut properties = BTreeMap::new();
            properties.insert(
                "edits".to_string(),
                JsonSchema::Array {
                    items: Box::new(JsonSchema::Object {
                        properties: search_replace_edit_properties(),
                        required: Some(vec![
                            "path".to_string(),
                            "fileId".to_string(),
                            "old".to_string(),
                            "new".to_string(),
                        ]),
                        additional_properties: Some(false),
                    }),
                    description: Some("Edits applied in order, all-or-nothing".to_string()),
                },
            );
            JsonSchema::Object {
                properties,
                required: Some(vec!["edits".to_string()]),
                additional_properties: Some(false),
            }
        }
        DiffMode::Anchored => {
            let mut change_properties = BTreeMap::new();
            change_properties.insert(
                "start".to_string(),
                JsonSchema::Number {
                    description: Some("First line of the range, 1-indexed".to_string()),
                },
            );
            change_properties.insert(
                "end".to_string(),
                JsonSchema::Number {
                    description: Some(
                        "Last line of the range, inclusive; start - 1 inserts before start"
                            .to_string(),
                    ),
                },
            );
            change_properties.insert(
                "content".to_string(),
                string_prop("Replacement text for the range"),
            );

            let mut properties = BTreeMap::new();
            properties.insert("path".to_string(), string_prop("Path of the file to edit"));
            properties.insert(
                "fileId".to_string(),
                string_prop("The id attribute shown on the file's block"),
            );
            properties.insert(
                "changes".to_string(),
                JsonSchema::Array {
                    items: Box::new(JsonSchema::Object {
                        properties: change_properties,
                        required: Some(vec![
                            "start".to_string(),
                            "end".to_string(),
                            "content".to_string(),
                        ]),
                        additional_properties: Some(false),
                    }),
                    description: Some("Non-overlapping line-range changes".to_string()),
                },
            );
            JsonSchema::Object {
                properties,
                required: Some(vec!["path".to_string(), "changes".to_string()]),
                additional_properties: Some(false),
            }
        }
    };

    Some(ToolSpec {
        name: EDIT_FILE_TOOL.to_string(),
        description: "Apply a partial edit to an existing writable file".to_string(),
        strict: false,
        parameters,
    })
}

/// Tool declarations in Chat Completions function-calling format.
pub fn create_tools_json(mode: DiffMode) -> Vec<serde_json::Value> {
    let mut tools = vec![create_write_file_tool()];
    if let Some(edit) = create_edit_file_tool(mode) {
        tools.push(edit);
    }
    tools
        .into_iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": tool,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReplaceArgs {
    pub path: String,
    #[serde(default)]
    pub file_id: Option<String>,
    pub old: String,
    pub new: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchReplaceMultiArgs {
    pub edits: Vec<SearchReplaceArgs>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnchoredChangeArgs {
    pub start: usize,
    pub end: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchoredArgs {
    pub path: String,
    #[serde(default)]
    pub file_id: Option<String>,
    pub changes: Vec<AnchoredChangeArgs>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedToolCall {
    WriteFile(WriteFileArgs),
    SearchReplace(SearchReplaceArgs),
    SearchReplaceMulti(SearchReplaceMultiArgs),
    Anchored(AnchoredArgs),
}

#[derive(Debug, Error)]
pub enum ToolParseError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("malformed {tool} arguments: {source}")]
    Malformed {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Every edit in a multi batch must carry the base file's id.
    #[error("edit {index} ({path}): file_id missing")]
    FileIdMissing { index: usize, path: String },
}

/// Decode one complete tool-call argument string. `arguments` is the full
/// concatenation of the stream's fragments for this call; unknown fields are
/// ignored.
pub fn parse_tool_call(
    mode: DiffMode,
    name: &str,
    arguments: &str,
) -> Result<ParsedToolCall, ToolParseError> {
    match name {
        WRITE_FILE_TOOL => serde_json::from_str::<WriteFileArgs>(arguments)
            .map(ParsedToolCall::WriteFile)
            .map_err(|source| ToolParseError::Malformed {
                tool: WRITE_FILE_TOOL,
                source,
            }),
        EDIT_FILE_TOOL => match mode {
            DiffMode::Off => Err(ToolParseError::UnknownTool(name.to_string())),
            DiffMode::SearchReplace => serde_json::from_str::<SearchReplaceArgs>(arguments)
                .map(ParsedToolCall::SearchReplace)
                .map_err(|source| ToolParseError::Malformed {
                    tool: EDIT_FILE_TOOL,
                    source,
                }),
            DiffMode::SearchReplaceMulti => {
                let args = serde_json::from_str::<SearchReplaceMultiArgs>(arguments).map_err(
                    |source| ToolParseError::Malformed {
                        tool: EDIT_FILE_TOOL,
                        source,
                    },
                )?;
                for (index, edit) in args.edits.iter().enumerate() {
                    if edit.file_id.is_none() {
                        return Err(ToolParseError::FileIdMissing {
                            index,
                            path: edit.path.clone(),
                        });
                    }
                }
                Ok(ParsedToolCall::SearchReplaceMulti(args))
            }
            DiffMode::Anchored => serde_json::from_str::<AnchoredArgs>(arguments)
                .map(ParsedToolCall::Anchored)
                .map_err(|source| ToolParseError::Malformed {
                    tool: EDIT_FILE_TOOL,
                    source,
                }),
        },
        other => Err(ToolParseError::UnknownTool(other.to_string())),
    }
}
