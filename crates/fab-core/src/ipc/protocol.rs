//! Wire types for the host socket.
//!
//! Every message is one JSON object on its own line. Requests carry a
//! `type`, an optional correlation `id` and an optional `payload`;
//! responses echo both and add `success` and `error`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::IpcError;
use crate::stream::{AgentInfo, StreamEvent};
use crate::supervisor::ProcessState;

/// Version spoken by this build. Peers must share the major component.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Envelope `type` of pushed attach events.
pub const EVENT_TYPE: &str = "event";
/// Envelope `type` of responses to unparseable requests.
pub const ERROR_TYPE: &str = "error";
/// Envelope `type` of the notice pushed to an attached client that fell
/// behind. Its subscription is gone; the payload is a [`LaggedNotice`].
pub const LAGGED_TYPE: &str = "lagged";

/// Request kinds understood by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Ping,
    Status,
    List,
    Attach,
    Detach,
    Send,
    Stop,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Ping => "ping",
            RequestType::Status => "status",
            RequestType::List => "list",
            RequestType::Attach => "attach",
            RequestType::Detach => "detach",
            RequestType::Send => "send",
            RequestType::Stop => "stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ping" => RequestType::Ping,
            "status" => RequestType::Status,
            "list" => RequestType::List,
            "attach" => RequestType::Attach,
            "detach" => RequestType::Detach,
            "send" => RequestType::Send,
            "stop" => RequestType::Stop,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail unless `remote` has the same major version as [`PROTOCOL_VERSION`].
pub fn check_protocol_compatible(remote: &str) -> Result<(), IpcError> {
    let incompatible = || IpcError::IncompatibleVersion {
        local: PROTOCOL_VERSION.to_string(),
        remote: remote.to_string(),
    };
    let major = |v: &str| v.trim().split('.').next().and_then(|m| m.parse::<u32>().ok());
    match (major(PROTOCOL_VERSION), major(remote)) {
        (Some(local), Some(remote)) if local == remote => Ok(()),
        _ => Err(incompatible()),
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(kind: RequestType, id: Option<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            id,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: &impl Serialize) -> Result<Self, IpcError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::parse(&self.kind)
    }

    /// Decode the payload, treating an absent or null payload as the
    /// default value.
    pub fn payload_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, IpcError> {
        match &self.payload {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => Ok(T::deserialize(value)?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok(kind: impl Into<String>, id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            id,
            success: true,
            error: None,
            payload: None,
        }
    }

    pub fn ok_with(
        kind: impl Into<String>,
        id: Option<String>,
        payload: &impl Serialize,
    ) -> Result<Self, IpcError> {
        let mut response = Self::ok(kind, id);
        response.payload = Some(serde_json::to_value(payload)?);
        Ok(response)
    }

    pub fn error(kind: impl Into<String>, id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id,
            success: false,
            error: Some(message.into()),
            payload: None,
        }
    }

    /// A pushed attach event.
    pub fn event(event: &StreamEvent) -> Result<Self, IpcError> {
        Self::ok_with(EVENT_TYPE, None, event)
    }

    pub fn is_event(&self) -> bool {
        self.kind == EVENT_TYPE
    }

    /// Pushed in place of further events once a client's queue overflows.
    pub fn lagged(resume_offset: u64) -> Self {
        let mut response = Self::error(
            LAGGED_TYPE,
            None,
            format!("client fell behind; reattach from offset {resume_offset}"),
        );
        response.payload = serde_json::to_value(LaggedNotice { resume_offset }).ok();
        response
    }

    /// The resume offset carried by a lagged notice.
    pub fn lagged_offset(&self) -> Option<u64> {
        if self.kind != LAGGED_TYPE {
            return None;
        }
        let notice = LaggedNotice::deserialize(self.payload.as_ref()?).ok()?;
        Some(notice.resume_offset)
    }

    /// Turn an error response into [`IpcError::Remote`] and decode the
    /// payload of a successful one.
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, IpcError> {
        if !self.success {
            return Err(IpcError::Remote(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        let value = self.payload.unwrap_or(Value::Null);
        Ok(T::deserialize(value)?)
    }

    /// Like [`Self::into_payload`] for responses that carry no payload.
    pub fn into_result(self) -> Result<(), IpcError> {
        if self.success {
            Ok(())
        } else {
            Err(IpcError::Remote(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Host build version.
    pub version: String,
    pub protocol_version: String,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
}

/// Targets a specific agent; the host's first agent when `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub host: HostInfo,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Last offset the client saw; replay starts after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachResponse {
    pub agent_id: String,
    /// Newest offset at attach time.
    pub offset: u64,
    /// Events after `resume_offset` were evicted before the replay.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaggedNotice {
    /// Last offset queued to the client before its subscription was dropped.
    pub resume_offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub input: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Skip the graceful wait.
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub exit_code: Option<i32>,
    pub graceful: bool,
    pub duration_ms: u64,
    pub state: ProcessState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_type_names_round_trip() {
        for kind in [
            RequestType::Ping,
            RequestType::Status,
            RequestType::List,
            RequestType::Attach,
            RequestType::Detach,
            RequestType::Send,
            RequestType::Stop,
        ] {
            assert_eq!(RequestType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RequestType::parse("reboot"), None);
    }

    #[test]
    fn major_version_must_match() {
        assert!(check_protocol_compatible("1.0").is_ok());
        assert!(check_protocol_compatible("1.7").is_ok());
        assert!(matches!(
            check_protocol_compatible("2.0"),
            Err(IpcError::IncompatibleVersion { .. })
        ));
        assert!(check_protocol_compatible("").is_err());
        assert!(check_protocol_compatible("x.1").is_err());
    }

    #[test]
    fn request_envelope_omits_absent_fields() {
        let req = Request::new(RequestType::Status, None);
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"type": "status"}));

        let req = Request::new(RequestType::Send, Some("r1".into()))
            .with_payload(&SendRequest {
                agent_id: None,
                input: "hi".into(),
            })
            .unwrap();
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "send", "id": "r1", "payload": {"input": "hi"}})
        );
    }

    #[test]
    fn lagged_notice_carries_resume_offset() {
        let notice = Response::lagged(41);
        let wire = serde_json::to_value(&notice).unwrap();
        assert_eq!(wire["type"], "lagged");
        assert_eq!(wire["success"], false);
        assert_eq!(wire["payload"], json!({"resume_offset": 41}));

        let decoded: Response = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.lagged_offset(), Some(41));
        assert!(!decoded.is_event());
        assert_eq!(Response::ok("attach", None).lagged_offset(), None);
    }

    #[test]
    fn missing_payload_decodes_to_default() {
        let req: Request = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        let stop: StopRequest = req.payload_or_default().unwrap();
        assert!(!stop.force);
        assert!(stop.timeout_seconds.is_none());

        let req: Request =
            serde_json::from_str(r#"{"type":"attach","payload":{"resume_offset":12}}"#).unwrap();
        let attach: AttachRequest = req.payload_or_default().unwrap();
        assert_eq!(attach.resume_offset, Some(12));
    }

    #[test]
    fn error_response_becomes_remote_error() {
        let resp = Response::error("send", Some("9".into()), "agent is not running");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["id"], "9");

        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, IpcError::Remote(ref m) if m == "agent is not running"));
    }

    #[test]
    fn payload_decodes_on_success() {
        let resp = Response::ok_with(
            "attach",
            None,
            &AttachResponse {
                agent_id: "a".into(),
                offset: 4,
                truncated: false,
            },
        )
        .unwrap();
        let attach: AttachResponse = resp.into_payload().unwrap();
        assert_eq!(attach.offset, 4);
    }
}
