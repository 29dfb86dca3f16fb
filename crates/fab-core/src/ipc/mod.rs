//! Local-socket control channel for hosted agents.
//!
//! A host process exposes its agents through one Unix-domain socket.
//! Clients speak newline-delimited JSON: one request object per line, one
//! response object per line, plus pushed `event` responses while attached.
//!
//! ```text
//! HostClient --request--> socket --> HostServer --> AgentStream --> Supervisor
//!            <-response--        <--             <-- events
//! ```

pub mod client;
pub mod protocol;
pub mod server;

use std::path::PathBuf;

pub use client::{HostClient, PROBE_TIMEOUT, SocketHealth, probe_socket};
pub use protocol::{
    AgentSelector, AttachRequest, AttachResponse, EVENT_TYPE, HostInfo, LAGGED_TYPE,
    LaggedNotice, ListResponse, PROTOCOL_VERSION, PingRequest, PingResponse, Request, RequestType, Response, SendRequest,
    StatusResponse, StopRequest, StopResponse, check_protocol_compatible,
};
pub use server::{HostConfig, HostServer};

/// Errors raised on either side of the socket.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("incompatible protocol version: host speaks {remote}, we speak {local}")]
    IncompatibleVersion { local: String, remote: String },

    /// The host answered with `success: false`.
    #[error("{0}")]
    Remote(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The host dropped an attachment that stopped keeping up.
    #[error("fell behind the host; reattach from offset {resume_offset}")]
    Lagged { resume_offset: u64 },

    #[error("refusing to use socket path {}: it is a symlink", .0.display())]
    SymlinkSocket(PathBuf),

    #[error("timed out waiting for the host")]
    Timeout,
}
