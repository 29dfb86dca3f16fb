//! Process supervisor: owns one agent subprocess, its pipes, its read loop
//! and its four-state lifecycle.
//!
//! All protocol work is delegated to an injected [`Backend`], so the
//! supervisor itself is backend-agnostic.
//!
//! # Locking
//!
//! Lifecycle state, the child handle, chat history and the registered
//! callbacks live behind a single mutex. Callbacks are never invoked while
//! it is held: every path snapshots the callback under the lock, releases
//! the lock, then invokes it. A callback may therefore call back into the
//! supervisor (e.g. to read the current state) without deadlocking.
//!
//! Stdin sits behind its own async mutex because writes await on the pipe.

mod state;

pub use state::{ExitInfo, ProcessState, StopOutcome, SupervisorError};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, CommandConfig, InputMode, LaunchRequest};
use crate::message::{ChatEntry, StreamMessage, chat_entries};
use crate::ring::RingBuffer;

/// How often a run whose stdout closed is checked for process exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invoked with `(previous, current)` after every state change.
pub type StateCallback = Arc<dyn Fn(ProcessState, ProcessState) + Send + Sync>;
/// Invoked for every chat entry appended to history.
pub type EntryCallback = Arc<dyn Fn(&ChatEntry) + Send + Sync>;
/// Invoked with every non-empty raw stdout line.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked with read-loop errors (malformed lines, read failures).
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Consulted for every parsed message; may end the read loop.
pub type MessageHook = Arc<dyn Fn(&StreamMessage) -> HookDecision + Send + Sync>;

/// Bounded chat history; the oldest entries are evicted first.
pub type ChatHistory = RingBuffer<ChatEntry>;

/// Verdict of a [`MessageHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    /// Stop reading stdout. The process itself keeps running.
    Stop,
}

/// Tunables for a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Grace period between the termination signal and a forced kill.
    pub stop_timeout: Duration,
    /// Pipe stderr and log its lines at debug level.
    pub log_stderr: bool,
    /// Maximum number of chat entries retained.
    pub history_limit: usize,
}

impl SupervisorConfig {
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
            log_stderr: true,
            history_limit: Self::DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorInfo {
    pub agent_id: String,
    pub backend: String,
    pub state: ProcessState,
    /// 0 when no process is running.
    pub pid: u32,
    pub working_dir: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub thread_id: Option<String>,
    pub history_len: usize,
    pub last_exit: Option<ExitInfo>,
}

#[derive(Default, Clone)]
struct Callbacks {
    state: Option<StateCallback>,
    entry: Option<EntryCallback>,
    output: Option<OutputCallback>,
    error: Option<ErrorCallback>,
    message_hook: Option<MessageHook>,
}

/// Everything guarded by the supervisor lock.
struct Shared {
    state: ProcessState,
    /// Bumped on every launch so a stale read loop cannot touch a newer run.
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    thread_id: Option<String>,
    pid: Option<u32>,
    child: Option<Child>,
    cancel: Option<CancellationToken>,
    history: ChatHistory,
    last_exit: Option<ExitInfo>,
    callbacks: Callbacks,
}

impl Shared {
    /// Apply a transition and return the notification to fire once unlocked.
    fn transition(&mut self, to: ProcessState) -> StateChange {
        let from = self.state;
        debug_assert!(
            ProcessState::is_valid_transition(from, to),
            "invalid transition {from} -> {to}"
        );
        self.state = to;
        StateChange {
            callback: self.callbacks.state.clone(),
            from,
            to,
        }
    }
}

/// A state change captured under the lock, fired after release.
#[must_use]
struct StateChange {
    callback: Option<StateCallback>,
    from: ProcessState,
    to: ProcessState,
}

impl StateChange {
    fn none() -> Self {
        Self {
            callback: None,
            from: ProcessState::Stopped,
            to: ProcessState::Stopped,
        }
    }

    fn fire(self) {
        if self.from == self.to {
            return;
        }
        if let Some(callback) = self.callback {
            callback(self.from, self.to);
        }
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: CommandConfig,
    options: SupervisorConfig,
    shared: Mutex<Shared>,
    /// Tagged with the generation of the run that owns it.
    stdin: tokio::sync::Mutex<Option<(u64, ChildStdin)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    Start,
    Resume,
}

struct Spawned {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

#[derive(Debug, PartialEq, Eq)]
enum LoopEnd {
    Cancelled,
    Eof,
    HookStop,
    Dropped,
}

/// Supervises one logical agent across any number of process runs.
///
/// Cloning is cheap and yields another handle to the same agent.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("agent_id", &self.inner.config.agent_id)
            .field("backend", &self.inner.backend.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Supervisor {
    pub fn new(backend: Arc<dyn Backend>, config: CommandConfig, options: SupervisorConfig) -> Self {
        let history = ChatHistory::new(options.history_limit);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                options,
                shared: Mutex::new(Shared {
                    state: ProcessState::Stopped,
                    generation: 0,
                    started_at: None,
                    thread_id: None,
                    pid: None,
                    child: None,
                    cancel: None,
                    history,
                    last_exit: None,
                    callbacks: Callbacks::default(),
                }),
                stdin: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub fn config(&self) -> &CommandConfig {
        &self.inner.config
    }

    pub fn options(&self) -> &SupervisorConfig {
        &self.inner.options
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn thread_id(&self) -> Option<String> {
        self.lock().thread_id.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.lock().last_exit.clone()
    }

    /// Copy of the retained chat history, oldest first.
    pub fn history(&self) -> Vec<ChatEntry> {
        self.lock().history.to_vec()
    }

    pub fn info(&self) -> SupervisorInfo {
        let shared = self.lock();
        SupervisorInfo {
            agent_id: self.inner.config.agent_id.clone(),
            backend: self.inner.backend.name().to_string(),
            state: shared.state,
            pid: shared.pid.unwrap_or(0),
            working_dir: self.inner.config.working_dir.clone(),
            started_at: shared.started_at,
            thread_id: shared.thread_id.clone(),
            history_len: shared.history.len(),
            last_exit: shared.last_exit.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Callback registration
    // -----------------------------------------------------------------------

    pub fn on_state_change(&self, callback: impl Fn(ProcessState, ProcessState) + Send + Sync + 'static) {
        self.lock().callbacks.state = Some(Arc::new(callback));
    }

    pub fn on_chat_entry(&self, callback: impl Fn(&ChatEntry) + Send + Sync + 'static) {
        self.lock().callbacks.entry = Some(Arc::new(callback));
    }

    pub fn on_output(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().callbacks.output = Some(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().callbacks.error = Some(Arc::new(callback));
    }

    pub fn set_message_hook(
        &self,
        hook: impl Fn(&StreamMessage) -> HookDecision + Send + Sync + 'static,
    ) {
        self.lock().callbacks.message_hook = Some(Arc::new(hook));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Launch a fresh subprocess, clearing history and the conversation id.
    ///
    /// Returns once the process is spawned, not once it produces output.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.launch(LaunchKind::Start, None).await
    }

    /// Launch a new subprocess for a stopped agent, keeping history, start
    /// time and conversation id.
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        self.launch(LaunchKind::Resume, None).await
    }

    async fn launch(&self, kind: LaunchKind, turn: Option<String>) -> Result<(), SupervisorError> {
        let (generation, resume_session, change) = {
            let mut shared = self.lock();
            if shared.state != ProcessState::Stopped {
                return Err(SupervisorError::AlreadyRunning);
            }
            shared.generation += 1;
            if kind == LaunchKind::Start {
                shared.history.clear();
                shared.thread_id = None;
                shared.started_at = None;
                shared.last_exit = None;
            }
            let resume_session = match kind {
                LaunchKind::Start => None,
                LaunchKind::Resume => shared.thread_id.clone(),
            };
            let change = shared.transition(ProcessState::Starting);
            (shared.generation, resume_session, change)
        };
        change.fire();

        let prompt = match kind {
            LaunchKind::Start => self.inner.config.initial_prompt.clone(),
            LaunchKind::Resume => turn,
        };
        let per_turn = self.inner.backend.input_mode() == InputMode::PerTurn;
        let launch = LaunchRequest {
            resume_session,
            prompt: if per_turn { prompt.clone() } else { None },
        };

        let spawned = match self.spawn_process(&launch).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(agent_id = %self.agent_id(), error = %e, "failed to launch agent");
                self.abort_launch(generation).await;
                return Err(e);
            }
        };
        let Spawned {
            child,
            stdin,
            stdout,
            stderr,
        } = spawned;
        let pid = child.id();
        let cancel = CancellationToken::new();

        // Stdin and child are installed together, and only while this run
        // still owns the supervisor.
        let orphan = {
            let mut stdin_slot = self.inner.stdin.lock().await;
            let mut shared = self.lock();
            if shared.generation != generation || shared.state != ProcessState::Starting {
                Some(child)
            } else {
                *stdin_slot = Some((generation, stdin));
                shared.child = Some(child);
                shared.pid = pid;
                shared.cancel = Some(cancel.clone());
                if shared.started_at.is_none() {
                    shared.started_at = Some(Utc::now());
                }
                None
            }
        };
        if let Some(mut child) = orphan {
            debug!(agent_id = %self.agent_id(), pid = pid.unwrap_or(0), "stop raced launch, killing new process");
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill superseded agent process");
            }
            return Err(SupervisorError::ShuttingDown);
        }

        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(self.agent_id().to_string(), stderr));
        }

        if let Some(text) = prompt {
            if !per_turn {
                if let Err(e) = self.write_input(&text).await {
                    warn!(agent_id = %self.agent_id(), error = %e, "failed to deliver prompt");
                    self.abort_launch(generation).await;
                    return Err(e);
                }
            }
            self.record_user_entry(&text);
        }

        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            stdout,
            cancel,
            generation,
        ));

        let change = {
            let mut shared = self.lock();
            if shared.generation == generation && shared.state == ProcessState::Starting {
                shared.transition(ProcessState::Running)
            } else {
                StateChange::none()
            }
        };
        change.fire();

        info!(
            agent_id = %self.agent_id(),
            backend = self.backend_name(),
            pid = pid.unwrap_or(0),
            resumed = kind == LaunchKind::Resume,
            "agent process launched"
        );
        Ok(())
    }

    async fn spawn_process(&self, launch: &LaunchRequest) -> Result<Spawned, SupervisorError> {
        let config = &self.inner.config;
        let spec = self.inner.backend.build_command(config, launch)?;

        tokio::fs::create_dir_all(&config.working_dir)
            .await
            .map_err(|source| SupervisorError::WorkingDir {
                path: config.working_dir.clone(),
                source,
            })?;

        let mut child = spec
            .to_command(self.inner.options.log_stderr)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        // Any early return drops `child`, which kills it and closes the
        // pipes already taken.
        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        debug!(
            agent_id = %config.agent_id,
            program = %spec.program,
            args = ?spec.args,
            "spawned agent subprocess"
        );

        Ok(Spawned {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Roll a failed launch back to `stopped`.
    async fn abort_launch(&self, generation: u64) {
        let (child, cancel, change) = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state != ProcessState::Starting {
                return;
            }
            shared.pid = None;
            let change = shared.transition(ProcessState::Stopped);
            (shared.child.take(), shared.cancel.take(), change)
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.close_stdin(generation).await;
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill aborted agent process");
            }
        }
        change.fire();
    }

    /// Stop with the configured timeout. See [`Self::stop_with_timeout`].
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        self.stop_with_timeout(self.inner.options.stop_timeout).await
    }

    /// Stop the subprocess: end the read loop, close stdin, send a
    /// termination signal and wait up to `timeout` before force-killing.
    ///
    /// Graceful exit, forced kill and "no process to signal" all end in
    /// `stopped` and return `Ok`.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<StopOutcome, SupervisorError> {
        self.stop_run(None, timeout).await
    }

    /// Stop the current run, or only run `expected` when one is named.
    async fn stop_run(
        &self,
        expected: Option<u64>,
        timeout: Duration,
    ) -> Result<StopOutcome, SupervisorError> {
        let begun = Instant::now();
        let (generation, child, cancel, change) = {
            let mut shared = self.lock();
            if expected.is_some_and(|generation| generation != shared.generation) {
                return Err(SupervisorError::NotRunning);
            }
            match shared.state {
                ProcessState::Stopped => return Err(SupervisorError::NotRunning),
                ProcessState::Stopping => return Err(SupervisorError::ShuttingDown),
                ProcessState::Starting | ProcessState::Running => {}
            }
            let change = shared.transition(ProcessState::Stopping);
            (
                shared.generation,
                shared.child.take(),
                shared.cancel.take(),
                change,
            )
        };
        change.fire();

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.close_stdin(generation).await;

        let had_process = child.is_some();
        let exit = match child {
            Some(mut child) => Some(terminate(&mut child, timeout).await),
            None => None,
        };

        let change = {
            let mut shared = self.lock();
            shared.pid = None;
            if exit.is_some() {
                shared.last_exit = exit.clone();
            }
            shared.transition(ProcessState::Stopped)
        };
        change.fire();

        let outcome = StopOutcome {
            had_process,
            graceful: exit.as_ref().is_some_and(|e| !e.forced),
            forced: exit.as_ref().is_some_and(|e| e.forced),
            exit_code: exit.and_then(|e| e.code),
            duration: begun.elapsed(),
        };
        info!(
            agent_id = %self.agent_id(),
            graceful = outcome.graceful,
            forced = outcome.forced,
            "agent stopped"
        );
        Ok(outcome)
    }

    /// Send a user turn.
    ///
    /// A live process gets the framed message on stdin. A stopped agent
    /// whose backend can resume and whose conversation id is known gets a
    /// fresh resume process carrying the turn instead.
    pub async fn send_message(&self, text: &str) -> Result<(), SupervisorError> {
        let (state, has_thread) = {
            let shared = self.lock();
            (shared.state, shared.thread_id.is_some())
        };

        match state {
            ProcessState::Running | ProcessState::Starting => {
                self.write_input(text).await?;
                self.record_user_entry(text);
                Ok(())
            }
            ProcessState::Stopped if has_thread && self.inner.backend.supports_resume() => {
                debug!(agent_id = %self.agent_id(), "resuming conversation for new turn");
                self.launch(LaunchKind::Resume, Some(text.to_string())).await
            }
            ProcessState::Stopped | ProcessState::Stopping => Err(SupervisorError::NotRunning),
        }
    }

    /// Drop the stdin pipe if it still belongs to run `generation`.
    async fn close_stdin(&self, generation: u64) {
        let mut guard = self.inner.stdin.lock().await;
        if guard.as_ref().is_some_and(|(owner, _)| *owner == generation) {
            guard.take();
        }
    }

    async fn write_input(&self, text: &str) -> Result<(), SupervisorError> {
        let thread_id = self.thread_id();
        let bytes = self
            .inner
            .backend
            .format_input_message(text, thread_id.as_deref())?;

        let mut guard = self.inner.stdin.lock().await;
        let (_, stdin) = guard.as_mut().ok_or(SupervisorError::NotRunning)?;
        stdin.write_all(&bytes).await.map_err(SupervisorError::Stdin)?;
        stdin.flush().await.map_err(SupervisorError::Stdin)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read-loop side
    // -----------------------------------------------------------------------

    fn record_user_entry(&self, text: &str) {
        let entry = ChatEntry::new("user", text, Utc::now());
        let callback = {
            let mut shared = self.lock();
            shared.history.push(entry.clone());
            shared.callbacks.entry.clone()
        };
        if let Some(callback) = callback {
            callback(&entry);
        }
    }

    fn emit_output(&self, line: &str) {
        let callback = self.lock().callbacks.output.clone();
        if let Some(callback) = callback {
            callback(line);
        }
    }

    fn emit_error(&self, message: &str) {
        let callback = self.lock().callbacks.error.clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }

    /// Process one stdout line.
    pub(crate) fn handle_line(&self, line: &str) -> HookDecision {
        if line.trim().is_empty() {
            return HookDecision::Continue;
        }
        self.emit_output(line);

        let message = match self.inner.backend.parse_stream_message(line) {
            Ok(Some(message)) => message,
            Ok(None) => return HookDecision::Continue,
            Err(e) => {
                warn!(agent_id = %self.agent_id(), error = %e, "skipping malformed stream line");
                self.emit_error(&e.to_string());
                return HookDecision::Continue;
            }
        };

        let entries = chat_entries(&message, Utc::now());
        let (entry_callback, hook) = {
            let mut shared = self.lock();
            if let Some(session) = &message.session_id {
                if shared.thread_id.as_deref() != Some(session.as_str()) {
                    debug!(agent_id = %self.agent_id(), thread_id = %session, "captured conversation id");
                    shared.thread_id = Some(session.clone());
                }
            }
            shared.history.extend(entries.iter().cloned());
            (
                shared.callbacks.entry.clone(),
                shared.callbacks.message_hook.clone(),
            )
        };

        if let Some(callback) = entry_callback {
            for entry in &entries {
                callback(entry);
            }
        }

        match hook {
            Some(hook) => hook(&message),
            None => HookDecision::Continue,
        }
    }

    /// The subprocess closed stdout: reap it and settle on `stopped`.
    ///
    /// The child stays in the shared state while it is polled, so a
    /// concurrent stop can still signal it. A process that outlives its
    /// stdout by more than the stop timeout is stopped like any other.
    async fn finish_run(&self, generation: u64) {
        self.close_stdin(generation).await;
        let deadline = Instant::now() + self.inner.options.stop_timeout;

        loop {
            let settled = {
                let mut shared = self.lock();
                if shared.generation != generation || !shared.state.is_active() {
                    return;
                }
                let exit = match shared.child.as_mut().map(|child| child.try_wait()) {
                    Some(Ok(None)) => None,
                    Some(Ok(Some(status))) => Some(ExitInfo {
                        code: status.code(),
                        forced: false,
                    }),
                    Some(Err(e)) => {
                        warn!(agent_id = %self.agent_id(), error = %e, "failed to reap agent process");
                        Some(ExitInfo::default())
                    }
                    None => Some(ExitInfo::default()),
                };
                exit.map(|exit| {
                    let code = exit.code;
                    shared.child = None;
                    shared.pid = None;
                    shared.cancel = None;
                    shared.last_exit = Some(exit);
                    (code, shared.transition(ProcessState::Stopped))
                })
            };

            if let Some((code, change)) = settled {
                info!(agent_id = %self.agent_id(), code = ?code, "agent process exited");
                change.fire();
                return;
            }

            if Instant::now() >= deadline {
                info!(agent_id = %self.agent_id(), "agent closed stdout but kept running, stopping it");
                if let Err(e) = self
                    .stop_run(Some(generation), self.inner.options.stop_timeout)
                    .await
                {
                    debug!(agent_id = %self.agent_id(), error = %e, "run settled before it could be stopped");
                }
                return;
            }
            tokio::time::sleep(REAP_POLL_INTERVAL).await;
        }
    }
}

/// Single reader per run. Cancellation is observed before every line.
async fn read_loop(
    inner: Weak<Inner>,
    stdout: ChildStdout,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut lines = BufReader::new(stdout).lines();

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoopEnd::Cancelled,
            next = lines.next_line() => next,
        };
        let Some(inner) = inner.upgrade() else {
            break LoopEnd::Dropped;
        };
        let supervisor = Supervisor { inner };

        match next {
            Ok(Some(line)) => {
                if supervisor.handle_line(&line) == HookDecision::Stop {
                    debug!(agent_id = %supervisor.agent_id(), "message hook stopped the read loop");
                    break LoopEnd::HookStop;
                }
            }
            Ok(None) => break LoopEnd::Eof,
            Err(e) => {
                warn!(agent_id = %supervisor.agent_id(), error = %e, "error reading agent stdout");
                supervisor.emit_error(&format!("stdout read error: {e}"));
                break LoopEnd::Eof;
            }
        }
    };

    debug!(generation, end = ?end, "read loop finished");
    if end == LoopEnd::Eof {
        if let Some(inner) = inner.upgrade() {
            Supervisor { inner }.finish_run(generation).await;
        }
    }
}

async fn log_stderr(agent_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(agent_id = %agent_id, line = %line, "agent stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "stopped reading agent stderr");
                break;
            }
        }
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
async fn terminate(child: &mut Child, timeout: Duration) -> ExitInfo {
    if let Some(pid) = child.id() {
        send_sigterm(pid);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            return ExitInfo {
                code: status.code(),
                forced: false,
            };
        }
        Ok(Err(e)) => warn!(error = %e, "error waiting for agent exit, killing"),
        Err(_elapsed) => debug!("agent did not exit after SIGTERM, sending SIGKILL"),
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill agent process");
    }
    let code = child.try_wait().ok().flatten().and_then(|s| s.code());
    ExitInfo { code, forced: true }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: pid belongs to a child we spawned and have not reaped yet.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        debug!(pid, "SIGTERM failed, will fall back to SIGKILL");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClaudeAdapter;

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        Supervisor::new(
            Arc::new(ClaudeAdapter::with_binary("/nonexistent/claude")),
            CommandConfig::new("unit", dir),
            SupervisorConfig::default(),
        )
    }

    #[test]
    fn new_supervisor_is_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        assert_eq!(sup.state(), ProcessState::Stopped);
        let info = sup.info();
        assert_eq!(info.pid, 0);
        assert_eq!(info.backend, "claude");
        assert_eq!(info.agent_id, "unit");
        assert!(info.started_at.is_none());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn send_when_stopped_without_thread_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        assert!(matches!(
            sup.send_message("hi").await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn failed_spawn_rolls_back_to_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sup.on_state_change(move |from, to| sink.lock().unwrap().push((from, to)));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }), "got {err}");
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ProcessState::Stopped, ProcessState::Starting),
                (ProcessState::Starting, ProcessState::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn config_error_surfaces_as_backend_error() {
        let sup = Supervisor::new(
            Arc::new(ClaudeAdapter::new()),
            CommandConfig::new("", "/tmp"),
            SupervisorConfig::default(),
        );
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Backend(_)), "got {err}");
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[test]
    fn handle_line_records_history_and_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let outputs = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&outputs);
        sup.on_output(move |_| *counter.lock().unwrap() += 1);

        sup.handle_line(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#);
        sup.handle_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#,
        );
        sup.handle_line("");
        sup.handle_line("garbage");

        assert_eq!(sup.thread_id().as_deref(), Some("s-1"));
        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
        assert_eq!(*outputs.lock().unwrap(), 3);
    }

    #[test]
    fn message_hook_can_stop_reading() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.set_message_hook(|msg| {
            if msg.kind == crate::message::MessageType::Result {
                HookDecision::Stop
            } else {
                HookDecision::Continue
            }
        });
        assert_eq!(
            sup.handle_line(r#"{"type":"system","subtype":"init"}"#),
            HookDecision::Continue
        );
        assert_eq!(
            sup.handle_line(r#"{"type":"result","result":"done"}"#),
            HookDecision::Stop
        );
    }

    #[test]
    fn callback_may_reenter_supervisor() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let handle = sup.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        sup.on_chat_entry(move |_| sink.lock().unwrap().push(handle.history().len()));

        sup.handle_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}"#,
        );
        // Both entries are appended before any callback fires.
        assert_eq!(*observed.lock().unwrap(), vec![2, 2]);
    }
}
