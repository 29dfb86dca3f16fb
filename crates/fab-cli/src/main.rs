mod client_cmds;
mod config;
mod hook_cmd;
mod host_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use client_cmds::AttachFormat;
use config::FabConfig;
use host_cmd::HostOptions;

#[derive(Parser)]
#[command(
    name = "fab",
    about = "Supervise coding-agent CLIs behind a reattachable socket"
)]
struct Cli {
    /// Socket directory (overrides FAB_SOCKET_DIR env var)
    #[arg(long, global = true)]
    socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fab config file with every default spelled out
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start an agent and serve its socket until Ctrl-C or a remote stop
    Host {
        /// Agent ID; also names the socket file
        agent_id: String,
        /// Backend to run (see `fab backends`)
        #[arg(long, default_value = "claude")]
        backend: String,
        /// Working directory for the agent (defaults to the current one)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// First user turn
        #[arg(long)]
        prompt: Option<String>,
        /// Model override passed to the backend
        #[arg(long)]
        model: Option<String>,
        /// Plugin directory passed to the backend
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
        /// Project label shown in status and list
        #[arg(long)]
        project: Option<String>,
        /// Task label shown in status and list
        #[arg(long)]
        task: Option<String>,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
        /// Do not install hook settings pointing back at fab
        #[arg(long)]
        no_hooks: bool,
    },
    /// Check that a host answers and speaks our protocol
    Ping {
        agent_id: String,
    },
    /// Show one agent's status
    Status {
        agent_id: String,
        /// Print the raw status JSON
        #[arg(long)]
        json: bool,
    },
    /// List agents hosted in the socket directory
    List,
    /// Stream an agent's events, replaying from an offset first
    Attach {
        agent_id: String,
        /// Replay events after this offset (default: the whole buffer)
        #[arg(long)]
        from: Option<u64>,
        /// Also print raw subprocess output lines
        #[arg(long, conflicts_with = "json")]
        raw: bool,
        /// Print one JSON event per line
        #[arg(long)]
        json: bool,
    },
    /// Send a user turn to an agent
    Send {
        agent_id: String,
        /// Message text
        text: String,
    },
    /// Stop an agent
    Stop {
        agent_id: String,
        /// Kill immediately instead of waiting for a graceful exit
        #[arg(long)]
        force: bool,
        /// Seconds to wait before killing (default: host setting)
        #[arg(long, conflicts_with = "force")]
        timeout: Option<u64>,
        /// Reason recorded in the host log
        #[arg(long)]
        reason: Option<String>,
    },
    /// Classify sockets as live, unresponsive or stale
    Probe {
        /// Probe only this agent's socket
        agent_id: Option<String>,
        /// Remove stale socket files
        #[arg(long)]
        clean: bool,
    },
    /// List available backends
    Backends,
    /// Hook entry point invoked by the agent CLI (reads the payload from stdin)
    Hook {
        /// Hook kind, e.g. permission-request, stop, notification
        kind: String,
    },
}

/// Execute the `fab init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::with_defaults();
    config::save_config(&cfg, &path)?;

    println!("Config written to {}", path.display());
    if let Some(dir) = &cfg.host.socket_dir {
        println!("  host.socket_dir = {}", dir.display());
    }
    println!();
    println!("Next: run `fab host <agent-id>` in a project directory.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Hook { kind } => {
            hook_cmd::run_hook(&kind).await?;
        }
        Commands::Backends => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_backends(&resolved.registry())?;
        }
        Commands::Host {
            agent_id,
            backend,
            dir,
            prompt,
            model,
            plugin_dir,
            project,
            task,
            description,
            no_hooks,
        } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            let options = HostOptions {
                agent_id,
                backend,
                working_dir: dir,
                prompt,
                model,
                plugin_dir,
                project,
                task,
                description,
                hooks: !no_hooks,
            };
            host_cmd::run_host(&resolved, options).await?;
        }
        Commands::Ping { agent_id } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_ping(&resolved, &agent_id).await?;
        }
        Commands::Status { agent_id, json } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_status(&resolved, &agent_id, json).await?;
        }
        Commands::List => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_list(&resolved).await?;
        }
        Commands::Attach {
            agent_id,
            from,
            raw,
            json,
        } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            let format = if json {
                AttachFormat::Json
            } else if raw {
                AttachFormat::Raw
            } else {
                AttachFormat::Chat
            };
            client_cmds::run_attach(&resolved, &agent_id, from, format).await?;
        }
        Commands::Send { agent_id, text } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_send(&resolved, &agent_id, &text).await?;
        }
        Commands::Stop {
            agent_id,
            force,
            timeout,
            reason,
        } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_stop(&resolved, &agent_id, force, timeout, reason).await?;
        }
        Commands::Probe { agent_id, clean } => {
            let resolved = FabConfig::resolve(cli.socket_dir.as_deref())?;
            client_cmds::run_probe(&resolved, agent_id.as_deref(), clean).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn stop_flags_parse() {
        let cli = Cli::try_parse_from([
            "fab", "stop", "a1", "--timeout", "5", "--reason", "done",
        ])
        .unwrap();
        match cli.command {
            Commands::Stop {
                agent_id,
                force,
                timeout,
                reason,
            } => {
                assert_eq!(agent_id, "a1");
                assert!(!force);
                assert_eq!(timeout, Some(5));
                assert_eq!(reason.as_deref(), Some("done"));
            }
            _ => panic!("expected stop"),
        }
        assert!(Cli::try_parse_from(["fab", "stop", "a1", "--force", "--timeout", "5"]).is_err());
    }

    #[test]
    fn global_socket_dir_applies_after_subcommand() {
        let cli = Cli::try_parse_from(["fab", "attach", "a1", "--from", "7", "--socket-dir", "/s"])
            .unwrap();
        assert_eq!(cli.socket_dir, Some(PathBuf::from("/s")));
        assert!(matches!(
            cli.command,
            Commands::Attach { from: Some(7), .. }
        ));
    }
}
