//! Claude backend adapter.
//!
//! Spawns `claude -p --input-format stream-json --output-format stream-json`
//! and speaks JSON-Lines in both directions. Incoming lines already have the
//! canonical [`StreamMessage`] shape, so parsing is mostly a filter.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::error::BackendError;
use super::hooks::{HookSettings, NOTIFY_HOOK_TIMEOUT, PERMISSION_HOOK_TIMEOUT};
use super::trait_def::Backend;
use super::types::{
    AGENT_ID_ENV, BackendSettings, ClaudeSettings, CommandConfig, CommandSpec, InputMode,
    LaunchRequest,
};
use crate::message::StreamMessage;

/// Session id sent when the conversation has none yet.
const DEFAULT_SESSION: &str = "default";

/// Top-level message types we translate; everything else is ignored.
const KNOWN_TYPES: [&str; 4] = ["system", "assistant", "user", "result"];

/// Adapter for the `claude` CLI in streaming JSON mode.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary: String,
}

impl ClaudeAdapter {
    /// Create an adapter that will look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Create an adapter with a custom binary path.
    ///
    /// Useful for testing or when `claude` is installed in a non-standard
    /// location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn claude_settings(config: &CommandConfig) -> Result<Option<&ClaudeSettings>, BackendError> {
    match &config.settings {
        None => Ok(None),
        Some(BackendSettings::Claude(settings)) => Ok(Some(settings)),
        Some(other) => Err(BackendError::Config(format!(
            "settings for backend {} passed to claude",
            other.backend_name()
        ))),
    }
}

impl Backend for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn input_mode(&self) -> InputMode {
        InputMode::Streaming
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn build_command(
        &self,
        config: &CommandConfig,
        launch: &LaunchRequest,
    ) -> Result<CommandSpec, BackendError> {
        config.validate()?;
        let settings = claude_settings(config)?;

        let mut spec = CommandSpec::new(&self.binary, &config.working_dir);
        spec.arg("-p")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(settings) = settings {
            if let Some(model) = &settings.model {
                spec.arg("--model").arg(model);
            }
            if let Some(mode) = &settings.permission_mode {
                spec.arg("--permission-mode").arg(mode);
            }
            if !settings.allowed_tools.is_empty() {
                spec.arg("--allowedTools")
                    .arg(settings.allowed_tools.join(","));
            }
        }

        if let Some(dir) = &config.plugin_dir {
            spec.arg("--plugin-dir").arg(dir.display().to_string());
        }

        if let Some(hooks) = settings.and_then(|s| s.hooks.as_ref()) {
            let json = serde_json::to_string(hooks).map_err(BackendError::Settings)?;
            spec.arg("--settings").arg(json);
        }

        if let Some(session) = &launch.resume_session {
            spec.arg("--resume").arg(session);
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

        let value: Value = serde_json::from_str(line).map_err(BackendError::Parse)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        if !KNOWN_TYPES.contains(&kind) {
            debug!(event_type = kind, "ignoring unrecognised stream-json event type");
            return Ok(None);
        }

        let message = serde_json::from_value(value).map_err(BackendError::Parse)?;
        Ok(Some(message))
    }

    fn format_input_message(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<u8>, BackendError> {
        let payload = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": text},
            "session_id": session_id.unwrap_or(DEFAULT_SESSION),
            "parent_tool_use_id": null,
        });
        let mut bytes = serde_json::to_vec(&payload).map_err(BackendError::Encode)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn hook_settings(&self, self_path: &Path) -> Option<HookSettings> {
        let mut settings = HookSettings::new();
        settings
            .add(
                "PermissionRequest",
                Some("*"),
                self_path,
                "permission-request",
                PERMISSION_HOOK_TIMEOUT,
            )
            .add("Stop", None, self_path, "stop", NOTIFY_HOOK_TIMEOUT)
            .add(
                "Notification",
                Some("idle_prompt"),
                self_path,
                "notification",
                NOTIFY_HOOK_TIMEOUT,
            );
        Some(settings)
    }
}
