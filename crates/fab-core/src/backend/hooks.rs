//! Typed hook configuration, serialized into the agent CLI's settings.
//!
//! ```json
//! {"hooks": {"Stop": [{"hooks": [{"type": "command", "command": "fab hook stop", "timeout": 10}]}]}}
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ceiling for an interactive permission decision.
pub const PERMISSION_HOOK_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for idle/stop notifications.
pub const NOTIFY_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookSettings {
    pub hooks: BTreeMap<String, Vec<HookMatcher>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    /// Seconds.
    pub timeout: u64,
}

impl HookCommand {
    pub fn command(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: "command".to_string(),
            command: command.into(),
            timeout: timeout.as_secs(),
        }
    }
}

impl HookSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `<self_path> hook <subcommand>` for `event`.
    pub fn add(
        &mut self,
        event: &str,
        matcher: Option<&str>,
        self_path: &Path,
        subcommand: &str,
        timeout: Duration,
    ) -> &mut Self {
        let command = format!("{} hook {subcommand}", self_path.display());
        self.hooks
            .entry(event.to_string())
            .or_default()
            .push(HookMatcher {
                matcher: matcher.map(str::to_string),
                hooks: vec![HookCommand::command(command, timeout)],
            });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// All commands registered for `event`.
    pub fn commands_for(&self, event: &str) -> Vec<&HookCommand> {
        self.hooks
            .get(event)
            .map(|matchers| matchers.iter().flat_map(|m| m.hooks.iter()).collect())
            .unwrap_or_default()
    }

    /// Merge another settings object in, appending matchers per event.
    pub fn merge(&mut self, other: HookSettings) {
        for (event, matchers) in other.hooks {
            self.hooks.entry(event).or_default().extend(matchers);
        }
    }
}
