//! `fab host` command: supervise one agent and serve its socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fab_core::backend::{
    Backend, BackendSettings, ClaudeSettings, CodexSettings, CommandConfig, InputMode,
};
use fab_core::ipc::{HostConfig, HostServer, PROBE_TIMEOUT, SocketHealth, probe_socket};
use fab_core::stream::{AgentMetadata, AgentStream};
use fab_core::supervisor::{ProcessState, Supervisor};

use crate::config::FabConfig;

/// Everything `fab host` needs to launch an agent.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub agent_id: String,
    pub backend: String,
    pub working_dir: Option<PathBuf>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub plugin_dir: Option<PathBuf>,
    pub project: Option<String>,
    pub task: Option<String>,
    pub description: Option<String>,
    /// Install the backend's hook settings, pointing back at this binary.
    pub hooks: bool,
}

/// Run the host until Ctrl-C or a remote `stop` leaves the agent stopped.
pub async fn run_host(config: &FabConfig, options: HostOptions) -> Result<()> {
    let registry = config.registry();
    let backend = registry
        .get(&options.backend)
        .map_err(|e| anyhow!("{e} (available: {})", registry.list().join(", ")))?;

    if backend.input_mode() == InputMode::PerTurn && options.prompt.is_none() {
        bail!(
            "backend {} runs one process per turn; pass --prompt for the first turn",
            backend.name()
        );
    }

    let working_dir = match options.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let self_path = std::env::current_exe().context("failed to locate the fab binary")?;
    let command = command_config(backend.as_ref(), &options, working_dir, &self_path);

    let socket_path = config.socket_path(&options.agent_id)?;
    if let SocketHealth::Live(status) = probe_socket(&socket_path, PROBE_TIMEOUT).await {
        bail!(
            "agent {} is already hosted by pid {} at {}",
            status.agent.id,
            status.host.pid,
            socket_path.display()
        );
    }

    let supervisor = Supervisor::new(backend, command, config.supervisor.clone());
    let stream = AgentStream::new(
        supervisor,
        AgentMetadata {
            project: options.project.clone(),
            worktree: None,
            task: options.task.clone(),
            description: options.description.clone(),
        },
        config.stream.clone(),
    );

    let mut host_config = HostConfig::new(&socket_path);
    host_config.stop_timeout = config.supervisor.stop_timeout;
    host_config.shutdown_on_stop = true;
    let server = HostServer::new(host_config, vec![stream.clone()]);
    let listener = server
        .bind()
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    if let Err(e) = stream.start().await {
        drop(listener);
        remove_socket(&socket_path);
        return Err(e).with_context(|| format!("failed to start agent {}", options.agent_id));
    }

    let pid = stream.supervisor().pid().unwrap_or(0);
    info!(agent_id = %options.agent_id, pid, socket = %socket_path.display(), "agent hosted");
    println!(
        "Hosting {} ({}, pid {pid}) on {}",
        options.agent_id,
        stream.supervisor().backend_name(),
        socket_path.display()
    );
    println!("Attach with: fab attach {}", options.agent_id);

    install_signal_handler(server.shutdown_token());
    let served = server.serve(listener).await;

    if stream.state() != ProcessState::Stopped {
        match stream.stop().await {
            Ok(outcome) => info!(
                agent_id = %options.agent_id,
                graceful = outcome.graceful,
                exit_code = ?outcome.exit_code,
                "agent stopped"
            ),
            Err(e) => warn!(agent_id = %options.agent_id, error = %e, "failed to stop agent"),
        }
    }

    served.context("host socket failed")?;
    println!("Host for {} exited.", options.agent_id);
    Ok(())
}

/// Assemble the launch configuration for `backend`.
fn command_config(
    backend: &dyn Backend,
    options: &HostOptions,
    working_dir: PathBuf,
    self_path: &Path,
) -> CommandConfig {
    let mut command = CommandConfig::new(&options.agent_id, working_dir);
    if let Some(prompt) = &options.prompt {
        command = command.with_initial_prompt(prompt);
    }
    if let Some(dir) = &options.plugin_dir {
        command = command.with_plugin_dir(dir);
    }

    let hooks = if options.hooks {
        backend.hook_settings(self_path)
    } else {
        None
    };
    let settings = match backend.name() {
        "claude" => Some(BackendSettings::Claude(ClaudeSettings {
            model: options.model.clone(),
            hooks,
            ..ClaudeSettings::default()
        })),
        "codex" => Some(BackendSettings::Codex(CodexSettings {
            model: options.model.clone(),
            ..CodexSettings::default()
        })),
        _ => None,
    };
    if let Some(settings) = settings {
        command = command.with_settings(settings);
    }
    command
}

/// Remove the socket file of a host that never started serving.
fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(socket = %path.display(), error = %e, "failed to remove socket file");
    }
}

/// First Ctrl-C shuts the host down gracefully, a second one exits at once.
fn install_signal_handler(shutdown: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping agent (Ctrl+C again to force)...");
            shutdown.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_core::backend::{ClaudeAdapter, CodexAdapter, LaunchRequest};

    fn options(backend: &str) -> HostOptions {
        HostOptions {
            agent_id: "a1".into(),
            backend: backend.into(),
            prompt: Some("hello".into()),
            model: Some("opus".into()),
            hooks: true,
            ..HostOptions::default()
        }
    }

    #[test]
    fn claude_config_carries_model_and_hooks() {
        let adapter = ClaudeAdapter::with_binary("claude");
        let command = command_config(
            &adapter,
            &options("claude"),
            PathBuf::from("/work"),
            Path::new("/usr/bin/fab"),
        );
        assert_eq!(command.agent_id, "a1");
        assert_eq!(command.initial_prompt.as_deref(), Some("hello"));

        let spec = adapter
            .build_command(&command, &LaunchRequest::fresh())
            .unwrap();
        assert_eq!(spec.arg_value("--model"), Some("opus"));
        let settings = spec.arg_value("--settings").unwrap();
        assert!(settings.contains("/usr/bin/fab hook stop"), "{settings}");
    }

    #[test]
    fn hooks_can_be_disabled() {
        let adapter = ClaudeAdapter::with_binary("claude");
        let mut opts = options("claude");
        opts.hooks = false;
        let command = command_config(&adapter, &opts, PathBuf::from("/work"), Path::new("fab"));
        let spec = adapter
            .build_command(&command, &LaunchRequest::fresh())
            .unwrap();
        assert!(!spec.has_arg("--settings"));
    }

    #[test]
    fn remove_socket_tolerates_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.sock");
        std::fs::write(&path, b"").unwrap();

        remove_socket(&path);
        assert!(!path.exists());
        remove_socket(&path);
    }

    #[test]
    fn codex_config_has_no_hooks() {
        let adapter = CodexAdapter::with_binary("codex");
        let command = command_config(
            &adapter,
            &options("codex"),
            PathBuf::from("/work"),
            Path::new("fab"),
        );
        match command.settings {
            Some(BackendSettings::Codex(settings)) => {
                assert_eq!(settings.model.as_deref(), Some("opus"));
            }
            other => panic!("expected codex settings, got {other:?}"),
        }
    }
}
