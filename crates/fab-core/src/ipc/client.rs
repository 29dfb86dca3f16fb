//! Client side of the socket plus socket health probing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;
use uuid::Uuid;

use super::IpcError;
use super::protocol::{
    AgentSelector, AttachRequest, AttachResponse, ListResponse, PROTOCOL_VERSION, PingRequest,
    PingResponse, Request, RequestType, Response, SendRequest, StatusResponse, StopRequest,
    StopResponse, check_protocol_compatible,
};
use crate::stream::{AgentInfo, StreamEvent};

/// Default bound on a health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection to one host.
///
/// Requests are sent with a fresh id and the client waits for the response
/// carrying that id; pushed events seen meanwhile are dropped.
pub struct HostClient {
    socket_path: PathBuf,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl HostClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            socket_path,
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &mut self,
        kind: RequestType,
        payload: Option<Value>,
    ) -> Result<Response, IpcError> {
        let id = Uuid::new_v4().to_string();
        let mut request = Request::new(kind, Some(id.clone()));
        request.payload = payload;
        self.send_raw(&request).await?;

        loop {
            let response = self.read_response().await?;
            if response.id.as_deref() == Some(id.as_str()) {
                return Ok(response);
            }
            if !response.is_event() {
                debug!(kind = %response.kind, id = ?response.id, "ignoring uncorrelated response");
            }
        }
    }

    async fn call(
        &mut self,
        kind: RequestType,
        payload: &impl Serialize,
    ) -> Result<Response, IpcError> {
        let value = serde_json::to_value(payload)?;
        self.request(kind, Some(value)).await
    }

    async fn send_raw(&mut self, request: &Request) -> Result<(), IpcError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, IpcError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(IpcError::ConnectionClosed);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    /// Health check; rejects a host with a different major version.
    pub async fn ping(&mut self) -> Result<PingResponse, IpcError> {
        let payload = PingRequest {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
        };
        let pong: PingResponse = self
            .call(RequestType::Ping, &payload)
            .await?
            .into_payload()?;
        check_protocol_compatible(&pong.protocol_version)?;
        Ok(pong)
    }

    pub async fn status(&mut self, agent_id: Option<&str>) -> Result<StatusResponse, IpcError> {
        let payload = AgentSelector {
            agent_id: agent_id.map(str::to_string),
        };
        self.call(RequestType::Status, &payload)
            .await?
            .into_payload()
    }

    pub async fn list(&mut self) -> Result<Vec<AgentInfo>, IpcError> {
        let list: ListResponse = self.request(RequestType::List, None).await?.into_payload()?;
        Ok(list.agents)
    }

    pub async fn send(&mut self, agent_id: Option<&str>, input: &str) -> Result<(), IpcError> {
        let payload = SendRequest {
            agent_id: agent_id.map(str::to_string),
            input: input.to_string(),
        };
        self.call(RequestType::Send, &payload)
            .await?
            .into_result()
    }

    pub async fn stop(&mut self, request: &StopRequest) -> Result<StopResponse, IpcError> {
        self.call(RequestType::Stop, request)
            .await?
            .into_payload()
    }

    pub async fn detach(&mut self) -> Result<(), IpcError> {
        self.request(RequestType::Detach, None).await?.into_result()
    }

    /// Attach to an agent's stream, consuming the connection.
    ///
    /// Yields the replay after `request.resume_offset` followed by live
    /// events until the host closes the connection. A client that falls too
    /// far behind gets a final [`IpcError::Lagged`] naming where to resume.
    pub async fn attach(
        mut self,
        request: &AttachRequest,
    ) -> Result<
        (
            AttachResponse,
            impl Stream<Item = Result<StreamEvent, IpcError>> + Send + 'static,
        ),
        IpcError,
    > {
        let attached: AttachResponse = self
            .call(RequestType::Attach, request)
            .await?
            .into_payload()?;

        let HostClient { lines, writer, .. } = self;
        let events = async_stream::stream! {
            // Dropping the write half would look like a disconnect to the host.
            let _writer = writer;
            let mut lines = lines;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(IpcError::Io(e));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response: Response = match serde_json::from_str(&line) {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(IpcError::Json(e));
                        continue;
                    }
                };
                if response.is_event() {
                    yield response.into_payload::<StreamEvent>();
                } else if let Some(resume_offset) = response.lagged_offset() {
                    yield Err(IpcError::Lagged { resume_offset });
                    break;
                }
            }
        };
        Ok((attached, events))
    }
}

/// Result of [`probe_socket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketHealth {
    /// No file at the path.
    Missing,
    /// The file exists but nothing accepts connections on it.
    Stale,
    /// Something accepted the connection but did not answer `status`.
    Unresponsive(String),
    Live(Box<StatusResponse>),
}

impl SocketHealth {
    /// Whether the socket file can safely be removed.
    pub fn is_stale(&self) -> bool {
        matches!(self, SocketHealth::Stale)
    }
}

/// Classify the socket at `path`, bounding the status call by `timeout`.
pub async fn probe_socket(path: impl AsRef<Path>, timeout: Duration) -> SocketHealth {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SocketHealth::Missing,
        Err(e) => return SocketHealth::Unresponsive(e.to_string()),
    }

    let mut client = match HostClient::connect(path).await {
        Ok(client) => client,
        Err(IpcError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return SocketHealth::Stale;
        }
        Err(e) => return SocketHealth::Unresponsive(e.to_string()),
    };

    match tokio::time::timeout(timeout, client.status(None)).await {
        Ok(Ok(status)) => SocketHealth::Live(Box::new(status)),
        Ok(Err(e)) => SocketHealth::Unresponsive(e.to_string()),
        Err(_) => SocketHealth::Unresponsive(IpcError::Timeout.to_string()),
    }
}
