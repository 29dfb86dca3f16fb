//! Commands that talk to a running host over its socket.

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;

use fab_core::backend::{BackendRegistry, InputMode};
use fab_core::ipc::{
    AttachRequest, HostClient, IpcError, PROBE_TIMEOUT, SocketHealth, StopRequest, probe_socket,
};
use fab_core::stream::{AgentInfo, EventPayload, StreamEvent};

use crate::config::FabConfig;

async fn connect(config: &FabConfig, agent_id: &str) -> Result<HostClient> {
    let path = config.socket_path(agent_id)?;
    HostClient::connect(&path)
        .await
        .with_context(|| format!("no host for agent {agent_id} at {}", path.display()))
}

// -----------------------------------------------------------------------
// fab ping / status / list
// -----------------------------------------------------------------------

pub async fn run_ping(config: &FabConfig, agent_id: &str) -> Result<()> {
    let mut client = connect(config, agent_id).await?;
    let pong = client.ping().await.context("ping failed")?;
    println!(
        "{agent_id}: fab {} (protocol {}), up {}s since {}",
        pong.version,
        pong.protocol_version,
        pong.uptime_seconds,
        pong.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

pub async fn run_status(config: &FabConfig, agent_id: &str, json: bool) -> Result<()> {
    let mut client = connect(config, agent_id).await?;
    let status = client.status(Some(agent_id)).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let agent = &status.agent;
    println!("Agent:    {}", agent.id);
    println!("Backend:  {}", agent.backend);
    println!("State:    {}", agent.state);
    if agent.pid != 0 {
        println!("PID:      {}", agent.pid);
    }
    println!("Worktree: {}", agent.worktree.display());
    if let Some(started) = agent.started_at {
        println!("Started:  {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(project) = &agent.project {
        println!("Project:  {project}");
    }
    if let Some(task) = &agent.task {
        println!("Task:     {task}");
    }
    if let Some(description) = &agent.description {
        println!("About:    {description}");
    }
    println!(
        "Host:     pid {} on {} (fab {})",
        status.host.pid,
        status.host.socket_path.display(),
        status.host.version
    );
    Ok(())
}

/// Every `*.sock` file in `dir`, sorted.
pub fn socket_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read socket dir {}", dir.display()));
        }
    };

    let mut sockets = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "sock") {
            sockets.push(path);
        }
    }
    sockets.sort();
    Ok(sockets)
}

/// List every live agent in the socket directory.
pub async fn run_list(config: &FabConfig) -> Result<()> {
    let mut agents = Vec::new();
    let mut stale = 0usize;
    for path in socket_files(&config.socket_dir)? {
        match probe_socket(&path, PROBE_TIMEOUT).await {
            SocketHealth::Live(_) => {
                let mut client = HostClient::connect(&path).await?;
                agents.extend(client.list().await?);
            }
            SocketHealth::Stale => stale += 1,
            SocketHealth::Missing | SocketHealth::Unresponsive(_) => {}
        }
    }

    if agents.is_empty() {
        println!("No agents hosted in {}.", config.socket_dir.display());
    } else {
        println!(
            "{:<20} {:<8} {:<9} {:>8}  PROJECT",
            "AGENT", "BACKEND", "STATE", "PID"
        );
        for agent in &agents {
            println!("{}", format_agent_row(agent));
        }
    }
    if stale > 0 {
        println!("\n{stale} stale socket(s); run `fab probe --clean` to remove them.");
    }
    Ok(())
}

fn format_agent_row(agent: &AgentInfo) -> String {
    format!(
        "{:<20} {:<8} {:<9} {:>8}  {}",
        agent.id,
        agent.backend,
        agent.state.to_string(),
        agent.pid,
        agent.project.as_deref().unwrap_or("-")
    )
}

// -----------------------------------------------------------------------
// fab attach
// -----------------------------------------------------------------------

/// How `fab attach` renders events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachFormat {
    /// State changes, chat entries and errors.
    #[default]
    Chat,
    /// Chat plus every raw output line.
    Raw,
    /// One JSON event per line.
    Json,
}

pub async fn run_attach(
    config: &FabConfig,
    agent_id: &str,
    from: Option<u64>,
    format: AttachFormat,
) -> Result<()> {
    let client = connect(config, agent_id).await?;
    let (attached, events) = client
        .attach(&AttachRequest {
            agent_id: Some(agent_id.to_string()),
            resume_offset: from,
        })
        .await
        .context("attach failed")?;

    if format != AttachFormat::Json {
        eprintln!(
            "Attached to {} at offset {} (Ctrl+C to detach).",
            attached.agent_id, attached.offset
        );
        if attached.truncated {
            eprintln!("Some events after offset {} were already evicted.", from.unwrap_or(0));
        }
    }

    let mut events = pin!(events);
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(IpcError::Lagged { resume_offset }) => bail!(
                "fell behind the host; resume with `fab attach {agent_id} --from {resume_offset}`"
            ),
            Err(e) => return Err(e).context("host stream failed"),
        };
        match format {
            AttachFormat::Json => println!("{}", serde_json::to_string(&event)?),
            AttachFormat::Chat | AttachFormat::Raw => {
                if let Some(line) = format_event(&event, format == AttachFormat::Raw) {
                    println!("{line}");
                }
            }
        }
    }

    if format != AttachFormat::Json {
        eprintln!("Host closed the connection.");
    }
    Ok(())
}

/// Human-readable rendering. `None` hides the event.
pub fn format_event(event: &StreamEvent, raw: bool) -> Option<String> {
    let time = event.timestamp.format("%H:%M:%S");
    let offset = event.offset;
    match &event.payload {
        EventPayload::Output { line } => raw.then(|| format!("[{offset}] {time} > {line}")),
        EventPayload::State { previous, state } => {
            Some(format!("[{offset}] {time} * {previous} -> {state}"))
        }
        EventPayload::ChatEntry(entry) => {
            let who = match &entry.tool_name {
                Some(tool) => format!("{}:{tool}", entry.role),
                None => entry.role.clone(),
            };
            Some(format!("[{offset}] {time} {who}: {}", entry.content))
        }
        EventPayload::Error { message } => Some(format!("[{offset}] {time} ! {message}")),
    }
}

// -----------------------------------------------------------------------
// fab send / stop
// -----------------------------------------------------------------------

pub async fn run_send(config: &FabConfig, agent_id: &str, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        bail!("refusing to send an empty message");
    }
    let mut client = connect(config, agent_id).await?;
    client.send(Some(agent_id), text).await?;
    println!("Sent to {agent_id}.");
    Ok(())
}

pub async fn run_stop(
    config: &FabConfig,
    agent_id: &str,
    force: bool,
    timeout: Option<u64>,
    reason: Option<String>,
) -> Result<()> {
    let mut client = connect(config, agent_id).await?;
    let request = StopRequest {
        agent_id: Some(agent_id.to_string()),
        force,
        timeout_seconds: timeout,
        reason,
    };
    let stopped = client.stop(&request).await?;

    let how = if stopped.graceful { "gracefully" } else { "by force" };
    let code = stopped
        .exit_code
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    println!(
        "Stopped {agent_id} {how} in {:.1}s (exit code {code}).",
        Duration::from_millis(stopped.duration_ms).as_secs_f64()
    );
    Ok(())
}

// -----------------------------------------------------------------------
// fab probe
// -----------------------------------------------------------------------

/// Classify one socket (or all of them); `clean` removes stale files.
pub async fn run_probe(config: &FabConfig, agent_id: Option<&str>, clean: bool) -> Result<()> {
    let paths = match agent_id {
        Some(id) => vec![config.socket_path(id)?],
        None => socket_files(&config.socket_dir)?,
    };
    if paths.is_empty() {
        println!("No sockets in {}.", config.socket_dir.display());
        return Ok(());
    }

    for path in paths {
        let health = probe_socket(&path, PROBE_TIMEOUT).await;
        let verdict = match &health {
            SocketHealth::Missing => "missing".to_string(),
            SocketHealth::Stale if clean => {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                "stale (removed)".to_string()
            }
            SocketHealth::Stale => "stale".to_string(),
            SocketHealth::Unresponsive(why) => format!("unresponsive ({why})"),
            SocketHealth::Live(status) => format!(
                "live: {} {} (host pid {})",
                status.agent.id, status.agent.state, status.host.pid
            ),
        };
        println!("{}: {verdict}", path.display());
    }
    Ok(())
}

// -----------------------------------------------------------------------
// fab backends
// -----------------------------------------------------------------------

pub fn run_backends(registry: &BackendRegistry) -> Result<()> {
    let mut names = registry.list();
    names.sort_unstable();
    for name in names {
        let backend = registry.get(name)?;
        let input = match backend.input_mode() {
            InputMode::Streaming => "streaming stdin",
            InputMode::PerTurn => "process per turn",
        };
        let resume = if backend.supports_resume() {
            "resumable"
        } else {
            "no resume"
        };
        println!("{name:<8} {input}, {resume}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fab_core::message::ChatEntry;
    use fab_core::supervisor::ProcessState;

    fn event(offset: u64, payload: EventPayload) -> StreamEvent {
        StreamEvent {
            agent_id: "a1".into(),
            offset,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            payload,
        }
    }

    #[test]
    fn output_lines_only_show_in_raw_mode() {
        let e = event(
            1,
            EventPayload::Output {
                line: "{\"type\":\"x\"}".into(),
            },
        );
        assert_eq!(format_event(&e, false), None);
        assert_eq!(
            format_event(&e, true).as_deref(),
            Some("[1] 03:04:05 > {\"type\":\"x\"}")
        );
    }

    #[test]
    fn chat_and_state_render() {
        let state = event(
            2,
            EventPayload::State {
                previous: ProcessState::Starting,
                state: ProcessState::Running,
            },
        );
        assert_eq!(
            format_event(&state, false).as_deref(),
            Some("[2] 03:04:05 * starting -> running")
        );

        let mut entry = ChatEntry::new("assistant", "ls -la", Utc::now());
        entry.tool_name = Some("Bash".into());
        let chat = event(3, EventPayload::ChatEntry(entry));
        let line = format_event(&chat, false).unwrap();
        assert!(line.ends_with("assistant:Bash: ls -la"), "{line}");

        let err = event(
            4,
            EventPayload::Error {
                message: "bad line".into(),
            },
        );
        assert!(format_event(&err, false).unwrap().ends_with("! bad line"));
    }

    #[test]
    fn socket_files_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b.sock", "a.sock", "notes.txt"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let found = socket_files(tmp.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.sock", "b.sock"]);

        assert!(socket_files(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn agent_rows_fill_missing_project() {
        let agent = AgentInfo {
            id: "a1".into(),
            project: None,
            state: ProcessState::Stopped,
            pid: 0,
            worktree: PathBuf::from("/w"),
            started_at: None,
            task: None,
            description: None,
            backend: "codex".into(),
        };
        let row = format_agent_row(&agent);
        assert!(row.starts_with("a1"));
        assert!(row.contains("codex"));
        assert!(row.contains("stopped"));
        assert!(row.ends_with("  -"));
    }
}
