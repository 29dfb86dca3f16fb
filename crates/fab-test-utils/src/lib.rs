//! Shared test utilities for fab integration tests.
//!
//! Agent CLIs are stood in for by small POSIX shell scripts written into a
//! temporary directory. Each script speaks just enough of a backend's wire
//! format to drive the supervisor through a scenario.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use fab_core::backend::CommandConfig;

/// Claude-style agent: announces session `sess-echo`, then answers every
/// stdin turn with `echo: <content>`.
pub const CLAUDE_ECHO: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-echo"}'
while IFS= read -r line; do
  text=$(printf '%s\n' "$line" | sed -n 's/.*"content":"\([^"]*\)".*/\1/p')
  printf '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"echo: %s"}]},"session_id":"sess-echo"}\n' "$text"
done
"#;

/// Ignores SIGTERM and never exits on its own.
pub const IGNORES_SIGTERM: &str = r#"
trap '' TERM
echo '{"type":"system","subtype":"init","session_id":"sess-stubborn"}'
while true; do sleep 1; done
"#;

/// Emits a short conversation and exits with status 3.
pub const EXITS_AFTER_OUTPUT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-short"}'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"done here"}]}}'
echo '{"type":"result","subtype":"success","result":"done here"}'
exit 3
"#;

/// Mixes malformed lines into valid output, then waits on stdin.
pub const MALFORMED_LINES: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-noisy"}'
echo 'this is not json'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"still here"}]}}'
echo '{"type":'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"and here"}]}}'
cat > /dev/null
"#;

/// Codex `exec`-style agent: one process per turn. Reports thread `th-1`
/// and answers with `fresh: <prompt>` or `resumed: <prompt>`.
pub const CODEX_EXEC: &str = r#"
mode=fresh
for arg in "$@"; do
  if [ "$arg" = "resume" ]; then mode=resumed; fi
  last="$arg"
done
echo '{"type":"thread.started","thread_id":"th-1"}'
echo '{"type":"turn.started"}'
printf '{"type":"item.completed","item":{"id":"item_0","type":"agent_message","text":"%s: %s"}}\n' "$mode" "$last"
echo '{"type":"turn.completed","usage":{"input_tokens":10,"cached_input_tokens":2,"output_tokens":5}}'
"#;

/// Announces itself, closes stdout and keeps running, deaf to SIGTERM.
pub const CLOSES_STDOUT: &str = r#"
trap '' TERM
echo '{"type":"system","subtype":"init","session_id":"sess-detached"}'
exec 1>&-
exec sleep 30
"#;

/// Answers every stdin turn with 400 output lines of 8 KiB each.
pub const FLOODS_ON_INPUT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-flood"}'
pad=$(printf '%8192s' '' | tr ' ' x)
while IFS= read -r line; do
  i=0
  while [ $i -lt 400 ]; do
    printf '{"type":"system","subtype":"noise","data":"%s"}\n' "$pad"
    i=$((i + 1))
  done
done
"#;

/// Write an executable `#!/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))
        .unwrap_or_else(|e| panic!("failed to write script {}: {e}", path.display()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }
    path
}

/// A fake agent binary plus a scratch working directory.
pub struct FakeAgent {
    /// Held to keep the directory alive.
    dir: TempDir,
    script: PathBuf,
}

impl FakeAgent {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let script = write_script(dir.path(), "agent.sh", body);
        Self { dir, script }
    }

    /// Path to pass as the backend binary.
    pub fn binary(&self) -> String {
        self.script.to_string_lossy().into_owned()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Working directory handed to the agent. Created on first launch.
    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    /// Socket path inside the temp directory.
    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("host.sock")
    }

    pub fn config(&self, agent_id: &str) -> CommandConfig {
        CommandConfig::new(agent_id, self.work_dir())
    }
}

/// Whether `pid` names a process that has not been reaped.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the pid exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Pids of live (non-zombie) processes with `path` among their arguments.
#[cfg(target_os = "linux")]
pub fn processes_running(path: &Path) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let needle = path.as_os_str().as_encoded_bytes();
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
                return false;
            };
            if !cmdline.split(|b| *b == 0).any(|arg| arg == needle) {
                return false;
            }
            // The state letter follows the parenthesized command name.
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| {
                    let (_, rest) = stat.rsplit_once(')')?;
                    rest.trim_start().chars().next()
                })
                .is_some_and(|state| state != 'Z')
        })
        .collect()
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut`, panicking with `what` if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out after {timeout:?} waiting for {what}"))
}
