//! Daemon configuration: `~/.bb7/config.toml` merged over env-flag defaults.

use std::path::Path;
use std::path::PathBuf;

use bb7_protocol::DiffMode;
use bb7_protocol::ReasoningEffort;
use serde::Deserialize;

use crate::flags::BB7_API_BASE;
use crate::flags::BB7_API_KEY;
use crate::flags::BB7_DEFAULT_MODEL;

pub const CONFIG_FILENAME: &str = "config.toml";

/// On-disk shape of the config file. Every field is optional; anything
/// missing falls back to the env-flag defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    model: Option<String>,
    api_base: Option<String>,
    /// Name of the environment variable holding the API key.
    api_key_env: Option<String>,
    diff_mode: Option<DiffMode>,
    reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub diff_mode: DiffMode,
    pub reasoning_effort: ReasoningEffort,
    /// Directory holding the config file and the optional prompt override.
    pub bb7_home: PathBuf,
}

/// `$HOME/.bb7`, falling back to a relative `.bb7` when the home directory
/// cannot be determined.
pub fn bb7_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".bb7"))
        .unwrap_or_else(|| PathBuf::from(".bb7"))
}

impl Config {
    pub fn load() -> std::io::Result<Self> {
        Self::load_from(bb7_home())
    }

    pub fn load_from(bb7_home: PathBuf) -> std::io::Result<Self> {
        let config_path = bb7_home.join(CONFIG_FILENAME);
        let on_disk = match std::fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<ConfigToml>(&raw)
                .map_err(|e| std::io::Error::other(format!("invalid {CONFIG_FILENAME}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(e) => return Err(e),
        };

        let api_key = match &on_disk.api_key_env {
            Some(var) => std::env::var(var).ok(),
            None => (*BB7_API_KEY).map(str::to_string),
        };

        Ok(Self {
            model: on_disk
                .model
                .unwrap_or_else(|| BB7_DEFAULT_MODEL.to_string()),
            api_base: on_disk
                .api_base
                .unwrap_or_else(|| BB7_API_BASE.to_string()),
            api_key,
            diff_mode: on_disk.diff_mode.unwrap_or_default(),
            reasoning_effort: on_disk.reasoning_effort.unwrap_or_default(),
            bb7_home,
        })
    }
}

/// Effective system prompt: the embedded default, unless the user dropped a
/// `prompt.md` override into the bb7 home directory.
pub fn effective_instructions(bb7_home: &Path) -> String {
    const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");
    match std::fs::read_to_string(bb7_home.join("prompt.md")) {
        Ok(custom) if !custom.trim().is_empty() => custom,
        _ => BASE_INSTRUCTIONS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_config_file_uses_flag_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path().to_path_buf()).expect("loads");
        assert_eq!(config.model, *BB7_DEFAULT_MODEL);
        assert_eq!(config.diff_mode, DiffMode::SearchReplace);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            "model = \"local-model\"\ndiff_mode = \"anchored\"\nreasoning_effort = \"high\"\n",
        )
        .expect("write config");
        let config = Config::load_from(dir.path().to_path_buf()).expect("loads");
        assert_eq!(config.model, "local-model");
        assert_eq!(config.diff_mode, DiffMode::Anchored);
        assert_eq!(config.reasoning_effort, ReasoningEffort::High);
    }

    #[test]
    fn prompt_override_wins_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("prompt.md"), "custom system prompt\n")
            .expect("write override");
        assert_eq!(effective_instructions(dir.path()), "custom system prompt\n");

        let other = tempfile::tempdir().expect("tempdir");
        assert!(!effective_instructions(other.path()).is_empty());
    }
}
