use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Reasoning effort requested from the completion service.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
    /// Option to disable reasoning.
    None,
}

/// Patch encoding offered to the model. The mode decides which tools are
/// declared on the completion request and how `edit_file` arguments are
/// parsed.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiffMode {
    /// Only `write_file` is declared; the model rewrites whole files.
    Off,
    #[default]
    SearchReplace,
    SearchReplaceMulti,
    Anchored,
}
