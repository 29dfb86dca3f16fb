//! Integration tests for the process supervisor.
//!
//! Each test drives a real subprocess: a shell script from
//! `fab-test-utils` that imitates one of the agent CLIs.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fab_core::backend::{
    Backend, BackendError, ClaudeAdapter, CodexAdapter, CommandConfig, CommandSpec, HookSettings,
    InputMode, LaunchRequest,
};
use fab_core::message::{ChatEntry, StreamMessage};
use fab_core::supervisor::{
    HookDecision, ProcessState, Supervisor, SupervisorConfig, SupervisorError,
};
use fab_test_utils::{
    CLAUDE_ECHO, CLOSES_STDOUT, CODEX_EXEC, EXITS_AFTER_OUTPUT, FakeAgent, IGNORES_SIGTERM,
    MALFORMED_LINES, pid_alive, wait_for, within, write_script,
};

const WAIT: Duration = Duration::from_secs(10);

/// Reports its own argv in an assistant message, then exits.
const ARGS_REPORTER: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-args"}'
printf '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"args: %s"}]}}\n' "$*"
"#;

// ===========================================================================
// Helpers
// ===========================================================================

fn claude(agent: &FakeAgent, id: &str) -> Supervisor {
    supervisor_with(Arc::new(ClaudeAdapter::with_binary(agent.binary())), agent, id)
}

fn supervisor_with(backend: Arc<dyn Backend>, agent: &FakeAgent, id: &str) -> Supervisor {
    Supervisor::new(backend, agent.config(id), SupervisorConfig::default())
}

fn has_entry(sup: &Supervisor, role: &str, content: &str) -> bool {
    sup.history()
        .iter()
        .any(|e: &ChatEntry| e.role == role && e.content == content)
}

/// Claude adapter whose first launch blocks in `build_command` until
/// released, and runs `first_binary` instead of the regular agent.
struct GatedBackend {
    inner: ClaudeAdapter,
    first_binary: PathBuf,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedBackend {
    fn new(agent: &FakeAgent, first_binary: PathBuf) -> (Self, mpsc::Sender<()>) {
        let (release, gate) = mpsc::channel();
        let backend = Self {
            inner: ClaudeAdapter::with_binary(agent.binary()),
            first_binary,
            gate: Mutex::new(Some(gate)),
        };
        (backend, release)
    }

    /// The first launch has taken the gate and is blocked on it.
    fn is_holding(&self) -> bool {
        self.gate.lock().unwrap().is_none()
    }
}

impl Backend for GatedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_mode(&self) -> InputMode {
        self.inner.input_mode()
    }

    fn supports_resume(&self) -> bool {
        self.inner.supports_resume()
    }

    fn build_command(
        &self,
        config: &CommandConfig,
        launch: &LaunchRequest,
    ) -> Result<CommandSpec, BackendError> {
        let mut spec = self.inner.build_command(config, launch)?;
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
            spec.program = self.first_binary.to_string_lossy().into_owned();
        }
        Ok(spec)
    }

    fn parse_stream_message(&self, line: &str) -> Result<Option<StreamMessage>, BackendError> {
        self.inner.parse_stream_message(line)
    }

    fn format_input_message(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<u8>, BackendError> {
        self.inner.format_input_message(text, session_id)
    }

    fn hook_settings(&self, self_path: &Path) -> Option<HookSettings> {
        self.inner.hook_settings(self_path)
    }
}

fn record_states(sup: &Supervisor) -> Arc<Mutex<Vec<(ProcessState, ProcessState)>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    sup.on_state_change(move |from, to| sink.lock().unwrap().push((from, to)));
    states
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn start_send_stop_round_trip() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = claude(&agent, "echo-1");
    let states = record_states(&sup);

    sup.start().await.unwrap();
    assert_eq!(sup.state(), ProcessState::Running);
    assert!(sup.pid().is_some());
    assert!(sup.started_at().is_some());
    assert!(agent.work_dir().is_dir(), "working directory is created");

    assert!(wait_for(WAIT, || sup.thread_id().as_deref() == Some("sess-echo")).await);

    sup.send_message("hello").await.unwrap();
    assert!(wait_for(WAIT, || has_entry(&sup, "assistant", "echo: hello")).await);
    assert!(has_entry(&sup, "user", "hello"));

    let outcome = sup.stop().await.unwrap();
    assert!(outcome.had_process);
    assert!(!outcome.forced);
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert_eq!(sup.pid(), None);
    assert_eq!(sup.info().pid, 0);

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            (ProcessState::Stopped, ProcessState::Starting),
            (ProcessState::Starting, ProcessState::Running),
            (ProcessState::Running, ProcessState::Stopping),
            (ProcessState::Stopping, ProcessState::Stopped),
        ]
    );
}

#[tokio::test]
async fn lifecycle_misuse_returns_sentinel_errors() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = claude(&agent, "misuse");

    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
    assert!(matches!(
        sup.send_message("too early").await,
        Err(SupervisorError::NotRunning)
    ));

    sup.start().await.unwrap();
    assert!(matches!(sup.start().await, Err(SupervisorError::AlreadyRunning)));
    assert!(matches!(sup.resume().await, Err(SupervisorError::AlreadyRunning)));
    assert_eq!(sup.state(), ProcessState::Running);

    sup.stop().await.unwrap();
    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
    assert_eq!(sup.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn concurrent_stop_reports_shutting_down() {
    let agent = FakeAgent::new(IGNORES_SIGTERM);
    let sup = claude(&agent, "double-stop");
    sup.start().await.unwrap();
    // The init line is printed after the TERM trap is installed.
    assert!(wait_for(WAIT, || sup.thread_id().is_some()).await);

    let first = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.stop_with_timeout(Duration::from_millis(500)).await })
    };
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopping).await);
    assert!(matches!(
        sup.stop().await,
        Err(SupervisorError::ShuttingDown)
    ));

    let outcome = within(WAIT, "first stop", first).await.unwrap().unwrap();
    assert!(outcome.forced);
    assert_eq!(sup.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn sigterm_ignoring_agent_is_force_killed() {
    let agent = FakeAgent::new(IGNORES_SIGTERM);
    let sup = claude(&agent, "stubborn");
    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.thread_id().is_some()).await);

    let timeout = Duration::from_millis(300);
    let began = Instant::now();
    let outcome = sup.stop_with_timeout(timeout).await.unwrap();

    assert!(outcome.forced);
    assert!(!outcome.graceful);
    assert!(began.elapsed() >= timeout);
    assert!(began.elapsed() < timeout + Duration::from_secs(5));
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert!(sup.last_exit().is_some_and(|exit| exit.forced));
}

// The gated launch blocks a runtime worker, so these need a second one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_launch_kills_the_late_process() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let first = write_script(agent.dir(), "first-launch.sh", CLAUDE_ECHO);
    let (backend, release) = GatedBackend::new(&agent, first.clone());
    let backend = Arc::new(backend);
    let sup = supervisor_with(backend.clone(), &agent, "raced");

    let launching = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start().await })
    };
    assert!(wait_for(WAIT, || backend.is_holding()).await);
    assert_eq!(sup.state(), ProcessState::Starting);

    let outcome = sup.stop().await.unwrap();
    assert!(!outcome.had_process);
    assert_eq!(sup.state(), ProcessState::Stopped);

    // A second run starts while the first launch is still in flight.
    sup.start().await.unwrap();
    assert_eq!(sup.state(), ProcessState::Running);
    let pid = sup.pid();

    release.send(()).unwrap();
    let err = within(WAIT, "superseded launch", launching)
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ShuttingDown), "got {err}");

    #[cfg(target_os = "linux")]
    assert!(
        fab_test_utils::processes_running(&first).is_empty(),
        "late process was killed"
    );

    // The second run kept its process and its stdin.
    assert_eq!(sup.state(), ProcessState::Running);
    assert_eq!(sup.pid(), pid);
    sup.send_message("after the race").await.unwrap();
    assert!(wait_for(WAIT, || has_entry(&sup, "assistant", "echo: after the race")).await);

    let outcome = sup.stop().await.unwrap();
    assert!(outcome.had_process);
    assert!(!outcome.forced);
}

#[tokio::test]
async fn stop_reaches_process_that_closed_stdout() {
    let agent = FakeAgent::new(CLOSES_STDOUT);
    let sup = claude(&agent, "detached");
    sup.start().await.unwrap();
    let pid = sup.pid().expect("running process has a pid");
    assert!(wait_for(WAIT, || sup.thread_id().is_some()).await);

    // Give the read loop time to see stdout close.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sup.state(), ProcessState::Running);

    let outcome = sup.stop_with_timeout(Duration::from_millis(200)).await.unwrap();
    assert!(outcome.had_process);
    assert!(outcome.forced);
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn process_outliving_its_stdout_is_stopped() {
    let agent = FakeAgent::new(CLOSES_STDOUT);
    let sup = Supervisor::new(
        Arc::new(ClaudeAdapter::with_binary(agent.binary())),
        agent.config("lingering"),
        SupervisorConfig {
            stop_timeout: Duration::from_millis(300),
            ..SupervisorConfig::default()
        },
    );
    let states = record_states(&sup);

    sup.start().await.unwrap();
    let pid = sup.pid().expect("running process has a pid");
    assert!(wait_for(WAIT, || sup.thread_id().is_some()).await);

    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);
    assert!(sup.last_exit().is_some_and(|exit| exit.forced));
    assert!(!pid_alive(pid));
    assert_eq!(
        states.lock().unwrap().last(),
        Some(&(ProcessState::Stopping, ProcessState::Stopped))
    );
}

#[tokio::test]
async fn agent_exit_transitions_to_stopped() {
    let agent = FakeAgent::new(EXITS_AFTER_OUTPUT);
    let sup = claude(&agent, "short-lived");
    let states = record_states(&sup);

    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);

    assert_eq!(sup.thread_id().as_deref(), Some("sess-short"));
    assert!(has_entry(&sup, "assistant", "done here"));
    let exit = sup.last_exit().expect("exit recorded");
    assert_eq!(exit.code, Some(3));
    assert!(!exit.forced);

    let states = states.lock().unwrap();
    assert_eq!(
        states.first(),
        Some(&(ProcessState::Stopped, ProcessState::Starting))
    );
    assert_eq!(states.last().map(|(_, to)| *to), Some(ProcessState::Stopped));
    for (from, to) in states.iter() {
        assert!(ProcessState::is_valid_transition(*from, *to), "{from} -> {to}");
    }
}

#[tokio::test]
async fn missing_binary_rolls_back_to_stopped() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = Supervisor::new(
        Arc::new(ClaudeAdapter::with_binary(
            agent.dir().join("no-such-agent").to_string_lossy().into_owned(),
        )),
        agent.config("ghost"),
        SupervisorConfig::default(),
    );

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn { .. }), "got {err}");
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert_eq!(sup.pid(), None);
}

// ===========================================================================
// Resume and history
// ===========================================================================

#[tokio::test]
async fn resume_keeps_history_and_passes_thread_id() {
    let agent = FakeAgent::new(ARGS_REPORTER);
    let sup = claude(&agent, "resumable");

    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);
    let started_at = sup.started_at();
    assert_eq!(sup.thread_id().as_deref(), Some("sess-args"));
    assert_eq!(sup.history().len(), 1);
    assert!(!sup.history()[0].content.contains("--resume"));

    sup.resume().await.unwrap();
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped && sup.history().len() == 2).await);
    let history = sup.history();
    assert!(
        history[1].content.contains("--resume sess-args"),
        "resume argv: {}",
        history[1].content
    );
    assert_eq!(sup.started_at(), started_at);

    // A fresh start forgets the conversation.
    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);
    assert_eq!(sup.history().len(), 1);
    assert!(!sup.history()[0].content.contains("--resume"));
}

#[tokio::test]
async fn initial_prompt_is_delivered_and_recorded() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = Supervisor::new(
        Arc::new(ClaudeAdapter::with_binary(agent.binary())),
        agent.config("prompted").with_initial_prompt("first task"),
        SupervisorConfig::default(),
    );

    sup.start().await.unwrap();
    assert!(has_entry(&sup, "user", "first task"));
    assert!(wait_for(WAIT, || has_entry(&sup, "assistant", "echo: first task")).await);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let agent = FakeAgent::new(MALFORMED_LINES);
    let sup = claude(&agent, "noisy");
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&errors);
    sup.on_error(move |message| sink.lock().unwrap().push(message.to_string()));

    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.history().len() == 2).await);
    assert!(has_entry(&sup, "assistant", "still here"));
    assert!(has_entry(&sup, "assistant", "and here"));
    assert_eq!(errors.lock().unwrap().len(), 2);
    assert_eq!(sup.state(), ProcessState::Running);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn message_hook_can_end_the_read_loop() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = claude(&agent, "hooked");
    sup.set_message_hook(|msg| {
        if msg.message.is_some() {
            HookDecision::Stop
        } else {
            HookDecision::Continue
        }
    });

    sup.start().await.unwrap();
    sup.send_message("one").await.unwrap();
    assert!(wait_for(WAIT, || has_entry(&sup, "assistant", "echo: one")).await);

    // The vetoing message was recorded; nothing after it is read.
    sup.send_message("two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!has_entry(&sup, "assistant", "echo: two"));
    assert_eq!(sup.state(), ProcessState::Running);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn callbacks_may_query_the_supervisor() {
    let agent = FakeAgent::new(CLAUDE_ECHO);
    let sup = claude(&agent, "reentrant");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = sup.clone();
    sup.on_state_change(move |_, to| {
        // Would deadlock if invoked under the supervisor lock.
        sink.lock().unwrap().push((to, handle.state()));
    });

    within(WAIT, "start", sup.start()).await.unwrap();
    within(WAIT, "stop", sup.stop()).await.unwrap();

    for (notified, observed) in seen.lock().unwrap().iter() {
        assert_eq!(notified, observed);
    }
}

// ===========================================================================
// Per-turn (codex exec) backend
// ===========================================================================

#[tokio::test]
async fn per_turn_backend_resumes_on_send() {
    let agent = FakeAgent::new(CODEX_EXEC);
    let sup = Supervisor::new(
        Arc::new(CodexAdapter::with_binary(agent.binary())),
        agent.config("codex-1").with_initial_prompt("first"),
        SupervisorConfig::default(),
    );

    sup.start().await.unwrap();
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);
    assert_eq!(sup.thread_id().as_deref(), Some("th-1"));
    assert!(has_entry(&sup, "user", "first"));
    assert!(has_entry(&sup, "assistant", "fresh: first"));

    sup.send_message("second").await.unwrap();
    assert!(wait_for(WAIT, || has_entry(&sup, "assistant", "resumed: second")).await);
    assert!(wait_for(WAIT, || sup.state() == ProcessState::Stopped).await);
    assert!(has_entry(&sup, "user", "second"));
    assert!(has_entry(&sup, "assistant", "fresh: first"));
}

#[tokio::test]
async fn per_turn_backend_requires_a_prompt() {
    let agent = FakeAgent::new(CODEX_EXEC);
    let sup = supervisor_with(
        Arc::new(CodexAdapter::with_binary(agent.binary())),
        &agent,
        "codex-empty",
    );

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Backend(_)), "got {err}");
    assert_eq!(sup.state(), ProcessState::Stopped);
}
