//! Configuration file management for fab.
//!
//! Provides a TOML-based config file at `~/.config/fab/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use fab_core::backend::{BackendRegistry, ClaudeAdapter, CodexAdapter};
use fab_core::stream::StreamConfig;
use fab_core::supervisor::SupervisorConfig;

pub const SOCKET_DIR_ENV: &str = "FAB_SOCKET_DIR";
pub const CLAUDE_BINARY_ENV: &str = "FAB_CLAUDE_BINARY";
pub const CODEX_BINARY_ENV: &str = "FAB_CODEX_BINARY";

/// `sun_path` is 108 bytes on Linux, including the trailing NUL.
const MAX_SOCKET_PATH: usize = 107;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub host: HostSection,
    pub backends: BackendsSection,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    /// Seconds between SIGTERM and SIGKILL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_capacity: Option<usize>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_binary: Option<String>,
    /// `exec` (one process per turn) or `proto` (stdin submissions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_mode: Option<String>,
}

impl ConfigFile {
    /// A file with every setting spelled out at its default.
    pub fn with_defaults() -> Self {
        Self {
            host: HostSection {
                socket_dir: Some(default_socket_dir()),
                stop_timeout_secs: Some(SupervisorConfig::DEFAULT_STOP_TIMEOUT.as_secs()),
                history_limit: Some(SupervisorConfig::DEFAULT_HISTORY_LIMIT),
                ring_capacity: Some(StreamConfig::DEFAULT_RING_CAPACITY),
            },
            backends: BackendsSection {
                claude_binary: Some("claude".to_string()),
                codex_binary: Some("codex".to_string()),
                codex_mode: Some("exec".to_string()),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the fab config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/fab` or `~/.config/fab`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fab");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fab")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// `$XDG_RUNTIME_DIR/fab`, else `~/.local/state/fab/sockets`.
pub fn default_socket_dir() -> PathBuf {
    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join("fab");
    }
    dirs::state_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("state")
        })
        .join("fab")
        .join("sockets")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct FabConfig {
    pub socket_dir: PathBuf,
    pub claude_binary: String,
    pub codex_binary: String,
    pub codex_proto: bool,
    pub supervisor: SupervisorConfig,
    pub stream: StreamConfig,
}

impl FabConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// A missing config file is not an error; a malformed one is.
    pub fn resolve(cli_socket_dir: Option<&Path>) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config_from(&path)?)
        } else {
            None
        };
        Self::resolve_with(cli_socket_dir, file, |key| std::env::var(key).ok())
    }

    /// [`FabConfig::resolve`] with the file and environment supplied by the caller.
    pub fn resolve_with(
        cli_socket_dir: Option<&Path>,
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();

        let socket_dir = if let Some(dir) = cli_socket_dir {
            dir.to_path_buf()
        } else if let Some(dir) = env(SOCKET_DIR_ENV).filter(|d| !d.is_empty()) {
            PathBuf::from(dir)
        } else if let Some(dir) = file.host.socket_dir {
            dir
        } else {
            default_socket_dir()
        };

        let claude_binary = env(CLAUDE_BINARY_ENV)
            .filter(|b| !b.is_empty())
            .or(file.backends.claude_binary)
            .unwrap_or_else(|| "claude".to_string());
        let codex_binary = env(CODEX_BINARY_ENV)
            .filter(|b| !b.is_empty())
            .or(file.backends.codex_binary)
            .unwrap_or_else(|| "codex".to_string());

        let codex_proto = match file.backends.codex_mode.as_deref() {
            None | Some("exec") => false,
            Some("proto") => true,
            Some(other) => bail!("invalid backends.codex_mode {other:?}; expected \"exec\" or \"proto\""),
        };

        let mut supervisor = SupervisorConfig::default();
        if let Some(secs) = file.host.stop_timeout_secs {
            supervisor.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = file.host.history_limit {
            supervisor.history_limit = limit;
        }

        let mut stream = StreamConfig::default();
        if let Some(capacity) = file.host.ring_capacity {
            if capacity == 0 {
                bail!("host.ring_capacity must be at least 1");
            }
            stream.ring_capacity = capacity;
        }

        Ok(Self {
            socket_dir,
            claude_binary,
            codex_binary,
            codex_proto,
            supervisor,
            stream,
        })
    }

    /// Socket path for `agent_id`: `<socket_dir>/<agent_id>.sock`.
    pub fn socket_path(&self, agent_id: &str) -> Result<PathBuf> {
        if agent_id.is_empty()
            || agent_id.starts_with('.')
            || agent_id.contains(['/', '\\', '\0'])
        {
            bail!("invalid agent id {agent_id:?}: must be a plain file name");
        }
        let path = self.socket_dir.join(format!("{agent_id}.sock"));
        if path.as_os_str().len() > MAX_SOCKET_PATH {
            bail!(
                "socket path {} is too long for a Unix socket; set {SOCKET_DIR_ENV} to a shorter directory",
                path.display()
            );
        }
        Ok(path)
    }

    /// The built-in adapters, pointed at the configured binaries.
    pub fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register(ClaudeAdapter::with_binary(&self.claude_binary));
        if self.codex_proto {
            registry.register(CodexAdapter::proto(&self.codex_binary));
        } else {
            registry.register(CodexAdapter::with_binary(&self.codex_binary));
        }
        registry
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
