//! Launch inputs and outputs shared by every backend adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::BackendError;
use super::hooks::HookSettings;

/// Environment variable every launched agent receives.
pub const AGENT_ID_ENV: &str = "FAB_AGENT_ID";

/// Immutable description of the agent to launch.
///
/// Adapters read it to build a command and never mutate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub working_dir: PathBuf,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BackendSettings>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandConfig {
    pub fn new(agent_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(dir.into());
        self
    }

    pub fn with_settings(mut self, settings: BackendSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reject configs no backend can launch.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.agent_id.trim().is_empty() {
            return Err(BackendError::Config("agent id must not be empty".to_string()));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(BackendError::Config(
                "working directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backend-specific settings, tagged by backend name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendSettings {
    Claude(ClaudeSettings),
    Codex(CodexSettings),
}

impl BackendSettings {
    pub fn backend_name(&self) -> &'static str {
        match self {
            BackendSettings::Claude(_) => "claude",
            BackendSettings::Codex(_) => "codex",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Serialized into `--settings`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodexSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub full_auto: bool,
    /// Passed through as `-c key=value`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_overrides: BTreeMap<String, String>,
}

/// Per-launch parameters that vary between turns of the same agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Conversation to continue, if any.
    pub resume_session: Option<String>,
    /// The user turn, for backends that take it on the command line.
    pub prompt: Option<String>,
}

impl LaunchRequest {
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn resume(session: impl Into<String>) -> Self {
        Self {
            resume_session: Some(session.into()),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self
    }
}

/// How user turns reach the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Framed messages are written to a long-lived stdin.
    Streaming,
    /// Every turn is a fresh process carrying the prompt in its argv.
    PerTurn,
}

/// A fully built but not yet started invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whether `flag` appears in the argv.
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// The argument right after `flag`, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Convert into a tokio command with piped stdin/stdout.
    ///
    /// The environment is merged into the parent's, not replaced.
    pub fn to_command(&self, pipe_stderr: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if pipe_stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        cmd
    }
}
