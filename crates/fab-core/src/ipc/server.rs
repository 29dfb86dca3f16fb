//! Host side of the socket: accepts connections and dispatches requests to
//! the hosted [`AgentStream`]s.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::IpcError;
use super::protocol::{
    AgentSelector, AttachRequest, AttachResponse, ERROR_TYPE, HostInfo, ListResponse,
    PROTOCOL_VERSION, PingRequest, PingResponse, Request, RequestType, Response, SendRequest,
    StatusResponse, StopRequest, StopResponse, check_protocol_compatible,
};
use crate::stream::{AgentStream, StreamEvent, SubscriptionId};
use crate::supervisor::{ProcessState, SupervisorConfig};

/// How long open connections get to flush after shutdown.
const CONNECTION_DRAIN: Duration = Duration::from_secs(2);

/// Host settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub socket_path: PathBuf,
    /// Grace period for `stop` requests that name no timeout.
    pub stop_timeout: Duration,
    /// Shut the host down once a `stop` request leaves every agent stopped.
    pub shutdown_on_stop: bool,
    /// Bound on the responses queued for one connection, and separately on
    /// the live events queued for its attachment. An attached client that
    /// falls this far behind is dropped and told where to reattach.
    pub client_queue: usize,
}

impl HostConfig {
    pub const DEFAULT_CLIENT_QUEUE: usize = 256;

    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stop_timeout: SupervisorConfig::DEFAULT_STOP_TIMEOUT,
            shutdown_on_stop: false,
            client_queue: Self::DEFAULT_CLIENT_QUEUE,
        }
    }
}

struct HostState {
    config: HostConfig,
    agents: Vec<AgentStream>,
    started_at: DateTime<Utc>,
    started: Instant,
    shutdown: CancellationToken,
}

/// Serves one or more agents on a Unix socket.
pub struct HostServer {
    state: Arc<HostState>,
}

impl HostServer {
    pub fn new(config: HostConfig, agents: Vec<AgentStream>) -> Self {
        Self {
            state: Arc::new(HostState {
                config,
                agents,
                started_at: Utc::now(),
                started: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.state.config.socket_path
    }

    pub fn agents(&self) -> &[AgentStream] {
        &self.state.agents
    }

    /// Cancelled when the host stops serving.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Bind the socket, replacing a stale socket file.
    ///
    /// Refuses a symlink at the socket path and a socket another host is
    /// still listening on. The socket is made owner-only.
    pub fn bind(&self) -> Result<UnixListener, IpcError> {
        let path = self.socket_path();
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(IpcError::SymlinkSocket(path.to_path_buf()));
            }
            Ok(_) => {
                if std::os::unix::net::UnixStream::connect(path).is_ok() {
                    return Err(IpcError::Io(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another host is listening on {}", path.display()),
                    )));
                }
                debug!(socket = %path.display(), "removing stale socket file");
                std::fs::remove_file(path)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %path.display(), "host listening");
        Ok(listener)
    }

    /// Accept connections until shutdown, then remove the socket file.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), IpcError> {
        let shutdown = self.state.shutdown.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("accepted connection");
                        connections.spawn(handle_connection(stream, Arc::clone(&self.state)));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(CONNECTION_DRAIN, drain).await.is_err() {
            debug!("connections did not close in time, aborting them");
            connections.abort_all();
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(self.socket_path()) {
            debug!(error = %e, "failed to remove socket file");
        }
        info!(socket = %self.socket_path().display(), "host stopped serving");
        Ok(())
    }

    pub async fn run(&self) -> Result<(), IpcError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }
}

struct Attachment {
    agent: AgentStream,
    subscription: SubscriptionId,
    forwarder: JoinHandle<()>,
}

/// Per-connection state.
struct Connection {
    state: Arc<HostState>,
    tx: mpsc::Sender<Response>,
    attachment: Option<Attachment>,
}

async fn handle_connection(stream: UnixStream, state: Arc<HostState>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(state.config.client_queue.max(1));
    let writer = tokio::spawn(write_responses(write_half, rx));
    let shutdown = state.shutdown.clone();

    let mut conn = Connection {
        state,
        tx,
        attachment: None,
    };
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    conn.handle_line(&line).await;
                }
            }
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        }
    }

    conn.detach();
    drop(conn);
    if let Err(e) = writer.await {
        debug!(error = %e, "connection writer task failed");
    }
}

async fn write_responses(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>) {
    while let Some(response) = rx.recv().await {
        let mut line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "client went away");
            break;
        }
    }
}

impl Connection {
    async fn reply(&self, response: Response) {
        if self.tx.send(response).await.is_err() {
            debug!("dropping response, client went away");
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "malformed request");
                self.reply(Response::error(
                    ERROR_TYPE,
                    None,
                    format!("invalid request: {e}"),
                ))
                .await;
                return;
            }
        };

        let Some(kind) = request.request_type() else {
            self.reply(Response::error(
                request.kind.clone(),
                request.id.clone(),
                format!("unknown request type: {}", request.kind),
            ))
            .await;
            return;
        };

        debug!(kind = %kind, id = ?request.id, "handling request");
        match self.dispatch(kind, &request).await {
            Ok(Some(response)) => self.reply(response).await,
            Ok(None) => {}
            Err(e) => {
                self.reply(Response::error(
                    request.kind.clone(),
                    request.id.clone(),
                    format!("{e:#}"),
                ))
                .await;
            }
        }
    }

    /// `Ok(None)` means the handler already queued its own responses.
    async fn dispatch(
        &mut self,
        kind: RequestType,
        request: &Request,
    ) -> anyhow::Result<Option<Response>> {
        let id = request.id.clone();
        match kind {
            RequestType::Ping => self.ping(request).map(Some),
            RequestType::Status => {
                let selector: AgentSelector = request.payload_or_default()?;
                let agent = self.agent(selector.agent_id.as_deref())?;
                let status = StatusResponse {
                    host: HostInfo {
                        pid: std::process::id(),
                        socket_path: self.state.config.socket_path.clone(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    agent: agent.info(),
                };
                Ok(Some(Response::ok_with(kind.as_str(), id, &status)?))
            }
            RequestType::List => {
                let list = ListResponse {
                    agents: self.state.agents.iter().map(AgentStream::info).collect(),
                };
                Ok(Some(Response::ok_with(kind.as_str(), id, &list)?))
            }
            RequestType::Attach => {
                self.attach(request).await?;
                Ok(None)
            }
            RequestType::Detach => {
                self.detach();
                Ok(Some(Response::ok(kind.as_str(), id)))
            }
            RequestType::Send => {
                let send: SendRequest = request.payload_or_default()?;
                anyhow::ensure!(!send.input.is_empty(), "send requires non-empty input");
                let agent = self.agent(send.agent_id.as_deref())?;
                agent
                    .send_message(&send.input)
                    .await
                    .with_context(|| format!("failed to send to agent {}", agent.agent_id()))?;
                Ok(Some(Response::ok(kind.as_str(), id)))
            }
            RequestType::Stop => {
                self.stop(request).await?;
                Ok(None)
            }
        }
    }

    fn ping(&self, request: &Request) -> anyhow::Result<Response> {
        let ping: PingRequest = request.payload_or_default()?;
        if let Some(version) = &ping.protocol_version {
            check_protocol_compatible(version)?;
        }
        let pong = PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            uptime_seconds: self.state.started.elapsed().as_secs(),
            started_at: self.state.started_at,
        };
        Ok(Response::ok_with(
            RequestType::Ping.as_str(),
            request.id.clone(),
            &pong,
        )?)
    }

    fn agent(&self, id: Option<&str>) -> anyhow::Result<AgentStream> {
        let found = match id {
            Some(id) => self
                .state
                .agents
                .iter()
                .find(|agent| agent.agent_id() == id)
                .ok_or_else(|| anyhow!("unknown agent: {id}"))?,
            None => self
                .state
                .agents
                .first()
                .ok_or_else(|| anyhow!("host has no agents"))?,
        };
        Ok(found.clone())
    }

    /// Queue the attach response and the replay, then forward live events.
    ///
    /// Live events reach the forwarder through a bounded queue filled from
    /// the emitting thread without blocking. When it overflows the
    /// subscription is dropped and the client gets a lagged notice naming
    /// the last offset it was sent.
    async fn attach(&mut self, request: &Request) -> anyhow::Result<()> {
        let attach: AttachRequest = request.payload_or_default()?;
        let agent = self.agent(attach.agent_id.as_deref())?;
        let from = attach.resume_offset.unwrap_or(0);
        self.detach();

        let (live_tx, mut live_rx) =
            mpsc::channel::<StreamEvent>(self.state.config.client_queue.max(1));
        let live_tx = Mutex::new(Some(live_tx));
        let lagged = Arc::new(AtomicBool::new(false));
        let overflowed = Arc::clone(&lagged);
        let (replay, subscription) = agent.attach(from, move |event| {
            let mut slot = live_tx.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = slot.as_ref() else {
                return;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    overflowed.store(true, Ordering::SeqCst);
                    slot.take();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slot.take();
                }
            }
        });

        self.reply(Response::ok_with(
            RequestType::Attach.as_str(),
            request.id.clone(),
            &AttachResponse {
                agent_id: agent.agent_id().to_string(),
                offset: replay.head,
                truncated: replay.truncated,
            },
        )?)
        .await;
        for event in &replay.events {
            self.reply(Response::event(event)?).await;
        }

        let tx = self.tx.clone();
        let forwarded_agent = agent.clone();
        let mut last_sent = replay.head.max(from);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = live_rx.recv().await {
                match Response::event(&event) {
                    Ok(response) => {
                        if tx.send(response).await.is_err() {
                            return;
                        }
                        last_sent = event.offset;
                    }
                    Err(e) => warn!(error = %e, "failed to encode stream event"),
                }
            }
            if lagged.load(Ordering::SeqCst) {
                forwarded_agent.unsubscribe(subscription);
                warn!(
                    agent_id = %forwarded_agent.agent_id(),
                    resume_offset = last_sent,
                    "attached client fell behind, dropping its subscription"
                );
                if tx.send(Response::lagged(last_sent)).await.is_err() {
                    debug!("client went away before the lagged notice");
                }
            }
        });

        info!(
            agent_id = %agent.agent_id(),
            from,
            replayed = replay.events.len(),
            truncated = replay.truncated,
            "client attached"
        );
        self.attachment = Some(Attachment {
            agent,
            subscription,
            forwarder,
        });
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.agent.unsubscribe(attachment.subscription);
            attachment.forwarder.abort();
            debug!(agent_id = %attachment.agent.agent_id(), "client detached");
        }
    }

    async fn stop(&mut self, request: &Request) -> anyhow::Result<()> {
        let stop: StopRequest = request.payload_or_default()?;
        let agent = self.agent(stop.agent_id.as_deref())?;
        let timeout = if stop.force {
            Duration::ZERO
        } else {
            stop.timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.state.config.stop_timeout)
        };

        info!(
            agent_id = %agent.agent_id(),
            force = stop.force,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            reason = stop.reason.as_deref().unwrap_or("none"),
            "stop requested"
        );
        let outcome = agent
            .stop_with_timeout(timeout)
            .await
            .with_context(|| format!("failed to stop agent {}", agent.agent_id()))?;

        let response = StopResponse {
            stopped: true,
            exit_code: outcome.exit_code,
            graceful: outcome.graceful,
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            state: agent.state(),
        };
        self.reply(Response::ok_with(
            RequestType::Stop.as_str(),
            request.id.clone(),
            &response,
        )?)
        .await;

        if self.state.config.shutdown_on_stop
            && self
                .state
                .agents
                .iter()
                .all(|agent| agent.state() == ProcessState::Stopped)
        {
            info!("all agents stopped, shutting down host");
            self.state.shutdown.cancel();
        }
        Ok(())
    }
}
