//! Per-agent multiplexer: numbers every observable supervisor event, keeps
//! a bounded replay buffer and fans events out to live subscribers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bus::{EventBus, SubscriptionId};
use super::event::{EventPayload, StreamEvent};
use crate::ring::RingBuffer;
use crate::supervisor::{ProcessState, StopOutcome, Supervisor, SupervisorError};

/// Multiplexer tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Number of events retained for replay.
    pub ring_capacity: usize,
}

impl StreamConfig {
    pub const DEFAULT_RING_CAPACITY: usize = 1000;
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_capacity: Self::DEFAULT_RING_CAPACITY,
        }
    }
}

/// Free-form descriptive fields supplied by whoever hosts the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub project: Option<String>,
    /// Defaults to the supervisor's working directory when unset.
    pub worktree: Option<PathBuf>,
    pub task: Option<String>,
    pub description: Option<String>,
}

/// Snapshot of one agent, computed on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub project: Option<String>,
    pub state: ProcessState,
    /// 0 when not running.
    pub pid: u32,
    pub worktree: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub task: Option<String>,
    pub description: Option<String>,
    pub backend: String,
}

/// Result of a replay query.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Buffered events after the requested offset, oldest first.
    pub events: Vec<StreamEvent>,
    /// Some events after the requested offset were already evicted.
    pub truncated: bool,
    /// Newest assigned offset when the replay was taken.
    pub head: u64,
}

struct Buffer {
    next_offset: u64,
    ring: RingBuffer<StreamEvent>,
    /// Offset of the newest evicted event, 0 if nothing was evicted.
    evicted_through: u64,
}

impl Buffer {
    fn after(&self, from: u64) -> Vec<StreamEvent> {
        self.ring
            .iter()
            .filter(|event| event.offset > from)
            .cloned()
            .collect()
    }

    fn replay(&self, from: u64) -> Replay {
        Replay {
            events: self.after(from),
            truncated: self.evicted_through > from,
            head: self.next_offset - 1,
        }
    }
}

struct StreamInner {
    agent_id: String,
    /// Serializes numbering and delivery so subscribers see offset order.
    emit_lock: Mutex<()>,
    buffer: Mutex<Buffer>,
    bus: EventBus<StreamEvent>,
    metadata: RwLock<AgentMetadata>,
}

impl StreamInner {
    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_guard(&self) -> MutexGuard<'_, ()> {
        self.emit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, payload: EventPayload) {
        let _emit = self.emit_guard();
        let event = {
            let mut buffer = self.buffer();
            let event = StreamEvent {
                agent_id: self.agent_id.clone(),
                offset: buffer.next_offset,
                timestamp: Utc::now(),
                payload,
            };
            buffer.next_offset += 1;
            if let Some(evicted) = buffer.ring.push(event.clone()) {
                buffer.evicted_through = evicted.offset;
            }
            event
        };
        self.bus.emit(&event);
    }
}

/// One supervised agent plus its event stream.
///
/// Handlers registered through [`AgentStream::subscribe`] and
/// [`AgentStream::attach`] run while event numbering is held, so they must
/// not block and must not call back into the stream.
#[derive(Clone)]
pub struct AgentStream {
    supervisor: Supervisor,
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for AgentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStream")
            .field("agent_id", &self.inner.agent_id)
            .field("offset", &self.current_offset())
            .finish()
    }
}

impl AgentStream {
    /// Wrap `supervisor`, taking over its state, chat-entry, output and
    /// error callbacks.
    pub fn new(supervisor: Supervisor, metadata: AgentMetadata, config: StreamConfig) -> Self {
        let inner = Arc::new(StreamInner {
            agent_id: supervisor.agent_id().to_string(),
            emit_lock: Mutex::new(()),
            buffer: Mutex::new(Buffer {
                next_offset: 1,
                ring: RingBuffer::new(config.ring_capacity),
                evicted_through: 0,
            }),
            bus: EventBus::new(),
            metadata: RwLock::new(metadata),
        });

        let sink = Arc::clone(&inner);
        supervisor.on_state_change(move |previous, state| {
            sink.record(EventPayload::State { previous, state });
        });
        let sink = Arc::clone(&inner);
        supervisor.on_chat_entry(move |entry| sink.record(EventPayload::ChatEntry(entry.clone())));
        let sink = Arc::clone(&inner);
        supervisor.on_output(move |line| {
            sink.record(EventPayload::Output {
                line: line.to_string(),
            });
        });
        let sink = Arc::clone(&inner);
        supervisor.on_error(move |message| {
            sink.record(EventPayload::Error {
                message: message.to_string(),
            });
        });

        Self { supervisor, inner }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    pub fn metadata(&self) -> AgentMetadata {
        self.inner
            .metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_metadata(&self, metadata: AgentMetadata) {
        *self
            .inner
            .metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner) = metadata;
    }

    pub fn info(&self) -> AgentInfo {
        let metadata = self.metadata();
        let sup = self.supervisor.info();
        AgentInfo {
            id: sup.agent_id,
            project: metadata.project,
            state: sup.state,
            pid: sup.pid,
            worktree: metadata.worktree.unwrap_or(sup.working_dir),
            started_at: sup.started_at,
            task: metadata.task,
            description: metadata.description,
            backend: sup.backend,
        }
    }

    // -----------------------------------------------------------------------
    // Replay and subscription
    // -----------------------------------------------------------------------

    /// Offset of the newest event, 0 before any event.
    pub fn current_offset(&self) -> u64 {
        self.inner.buffer().next_offset - 1
    }

    /// Buffered events with offset strictly greater than `from`.
    ///
    /// When `from` predates the oldest retained event this is simply the
    /// whole buffer; see [`Self::replay`] to detect the gap.
    pub fn get_buffered_events(&self, from: u64) -> Vec<StreamEvent> {
        self.inner.buffer().after(from)
    }

    pub fn replay(&self, from: u64) -> Replay {
        self.inner.buffer().replay(from)
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Take the replay after `from` and register `handler` for everything
    /// newer, with no event lost or duplicated between the two.
    pub fn attach(
        &self,
        from: u64,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> (Replay, SubscriptionId) {
        let _emit = self.inner.emit_guard();
        let replay = self.inner.buffer().replay(from);
        let id = self.inner.bus.subscribe(handler);
        (replay, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.bus.len()
    }

    // -----------------------------------------------------------------------
    // Forwarded lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    pub async fn resume(&self) -> Result<(), SupervisorError> {
        self.supervisor.resume().await
    }

    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        self.supervisor.stop().await
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<StopOutcome, SupervisorError> {
        self.supervisor.stop_with_timeout(timeout).await
    }

    pub async fn send_message(&self, text: &str) -> Result<(), SupervisorError> {
        self.supervisor.send_message(text).await
    }
}
