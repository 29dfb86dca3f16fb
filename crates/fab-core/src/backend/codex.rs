//! Codex backend adapter.
//!
//! Codex reports progress as a lifecycle event stream (`thread.started`,
//! `turn.completed`, `item.completed`, ...). [`convert_event`] maps each
//! event to at most one canonical message following a fixed table keyed by
//! event type and item type.
//!
//! Two launch modes exist:
//! - [`CodexMode::Exec`]: one `codex exec --json` process per turn, the
//!   prompt travels in argv and resumption uses `resume <thread_id>`.
//! - [`CodexMode::Proto`]: a long-lived process reading submissions from
//!   stdin.

use std::path::Path;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::BackendError;
use super::hooks::HookSettings;
use super::trait_def::Backend;
use super::types::{
    AGENT_ID_ENV, BackendSettings, CodexSettings, CommandConfig, CommandSpec, InputMode,
    LaunchRequest,
};
use crate::message::{ContentBlock, FlexContent, StreamMessage, Usage};

/// Tool name reported for shell command executions.
pub const SHELL_TOOL_NAME: &str = "Bash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodexMode {
    Exec,
    Proto,
}

/// Adapter for the `codex` CLI.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    binary: String,
    mode: CodexMode,
}

impl CodexAdapter {
    /// Per-turn `exec` mode with `codex` from `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("codex")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
            mode: CodexMode::Exec,
        }
    }

    /// Submission-queue mode: one process, turns written to stdin.
    pub fn proto(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
            mode: CodexMode::Proto,
        }
    }

    pub fn mode(&self) -> CodexMode {
        self.mode
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CodexEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    item: Option<CodexItem>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", alias = "item_type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    aggregated_output: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
}

/// Apply the conversion table to one decoded event.
fn convert_event(event: CodexEvent) -> Option<StreamMessage> {
    match (event.kind.as_str(), event.item) {
        ("thread.started", _) => {
            let mut msg = StreamMessage::system("init");
            msg.session_id = event.thread_id;
            Some(msg)
        }
        ("turn.started", _) => None,
        ("turn.completed", _) => match event.usage {
            Some(usage) => {
                let mut msg = StreamMessage::assistant(Vec::new());
                if let Some(nested) = msg.message.as_mut() {
                    nested.usage = Some(usage);
                }
                Some(msg)
            }
            None => Some(StreamMessage::result("", false)),
        },
        ("item.started", Some(item)) if item.kind == "command_execution" => {
            Some(StreamMessage::assistant(vec![ContentBlock::ToolUse {
                id: item.id,
                name: SHELL_TOOL_NAME.to_string(),
                input: json!({ "command": item.command.unwrap_or_default() }),
            }]))
        }
        ("item.completed", Some(item)) => match item.kind.as_str() {
            "reasoning" | "agent_message" => Some(StreamMessage::assistant(vec![
                ContentBlock::text(item.text.unwrap_or_default()),
            ])),
            "command_execution" => {
                let is_error = item.exit_code.is_some_and(|code| code != 0);
                Some(StreamMessage::user(vec![ContentBlock::ToolResult {
                    tool_use_id: item.id,
                    is_error,
                    content: FlexContent(item.aggregated_output.unwrap_or_default()),
                }]))
            }
            other => {
                debug!(item_type = other, "ignoring codex item");
                None
            }
        },
        ("error", _) => Some(StreamMessage::result(
            event.message.unwrap_or_else(|| "unknown error".to_string()),
            true,
        )),
        ("warning", _) => {
            let text = event.message.unwrap_or_default();
            warn!(warning = %text, "codex warning");
            let mut msg = StreamMessage::system("warning");
            msg.result = Some(text);
            Some(msg)
        }
        (other, _) => {
            debug!(event_type = other, "ignoring codex event");
            None
        }
    }
}

fn codex_settings(config: &CommandConfig) -> Result<Option<&CodexSettings>, BackendError> {
    match &config.settings {
        None => Ok(None),
        Some(BackendSettings::Codex(settings)) => Ok(Some(settings)),
        Some(other) => Err(BackendError::Config(format!(
            "settings for backend {} passed to codex",
            other.backend_name()
        ))),
    }
}

fn push_overrides(spec: &mut CommandSpec, settings: Option<&CodexSettings>) {
    let Some(settings) = settings else {
        return;
    };
    for (key, value) in &settings.config_overrides {
        spec.arg("-c").arg(format!("{key}={value}"));
    }
}

impl Backend for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn input_mode(&self) -> InputMode {
        match self.mode {
            CodexMode::Exec => InputMode::PerTurn,
            CodexMode::Proto => InputMode::Streaming,
        }
    }

    fn supports_resume(&self) -> bool {
        self.mode == CodexMode::Exec
    }

    fn build_command(
        &self,
        config: &CommandConfig,
        launch: &LaunchRequest,
    ) -> Result<CommandSpec, BackendError> {
        config.validate()?;
        let settings = codex_settings(config)?;

        let mut spec = CommandSpec::new(&self.binary, &config.working_dir);
        match self.mode {
            CodexMode::Proto => {
                if launch.resume_session.is_some() {
                    return Err(BackendError::Config(
                        "codex proto mode cannot resume a thread".to_string(),
                    ));
                }
                spec.arg("proto");
                push_overrides(&mut spec, settings);
            }
            CodexMode::Exec => {
                let prompt = launch.prompt.as_deref().ok_or_else(|| {
                    BackendError::Config("codex exec requires a prompt for every turn".to_string())
                })?;

                spec.arg("exec")
                    .arg("--json")
                    .arg("--skip-git-repo-check")
                    .arg("-C")
                    .arg(config.working_dir.display().to_string());
                if let Some(settings) = settings {
                    if let Some(model) = &settings.model {
                        spec.arg("--model").arg(model);
                    }
                    if let Some(sandbox) = &settings.sandbox {
                        spec.arg("--sandbox").arg(sandbox);
                    }
                    if settings.full_auto {
                        spec.arg("--full-auto");
                    }
                }
                push_overrides(&mut spec, settings);

                if let Some(thread) = &launch.resume_session {
                    spec.arg("resume").arg(thread);
                }
                spec.arg(prompt);
            }
        }

        for (key, value) in &config.env {
            spec.env(key, value);
        }
        spec.env(AGENT_ID_ENV, &config.agent_id);

        Ok(spec)
    }

    fn parse_stream_message(&self, line: &str) -> Result<Option<StreamMessage>, BackendError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let event: CodexEvent = serde_json::from_str(line).map_err(BackendError::Parse)?;
        Ok(convert_event(event))
    }

    fn format_input_message(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<u8>, BackendError> {
        if self.mode == CodexMode::Exec {
            return Err(BackendError::StdinNotSupported {
                backend: self.name().to_string(),
            });
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let submission = json!({
            "id": id,
            "op": {
                "type": "user_input",
                "items": [{"type": "text", "text": text}],
            },
        });
        let mut bytes = serde_json::to_vec(&submission).map_err(BackendError::Encode)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn hook_settings(&self, _self_path: &Path) -> Option<HookSettings> {
        None
    }
}
