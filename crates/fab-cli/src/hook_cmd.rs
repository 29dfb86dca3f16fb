//! `fab hook <kind>`: entry point for the agent CLI's hook settings.
//!
//! The agent runs this with the hook payload on stdin. The payload is
//! logged and the command exits 0 without writing to stdout, which leaves
//! the agent's default behaviour in place.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use fab_core::backend::AGENT_ID_ENV;

/// Hook kinds the built-in adapters register.
pub const KNOWN_HOOKS: &[&str] = &["permission-request", "stop", "notification"];

pub async fn run_hook(kind: &str) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read hook payload from stdin")?;
    let agent_id = std::env::var(AGENT_ID_ENV).unwrap_or_default();
    record_hook(kind, &agent_id, &input);
    Ok(())
}

fn record_hook(kind: &str, agent_id: &str, input: &str) -> Option<Value> {
    if !KNOWN_HOOKS.contains(&kind) {
        warn!(kind, agent_id, "unrecognized hook kind");
    }
    if input.trim().is_empty() {
        info!(kind, agent_id, "hook fired without payload");
        return None;
    }

    match serde_json::from_str::<Value>(input) {
        Ok(payload) => {
            let event = payload
                .get("hook_event_name")
                .and_then(Value::as_str)
                .unwrap_or(kind);
            let tool = payload.get("tool_name").and_then(Value::as_str);
            info!(kind, agent_id, event, tool, "hook fired");
            Some(payload)
        }
        Err(e) => {
            warn!(kind, agent_id, error = %e, "hook payload is not JSON");
            None
        }
    }
}
