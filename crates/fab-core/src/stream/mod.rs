//! Stream multiplexing and reattach buffering.
//!
//! ```text
//! Supervisor --state/chat/output/error callbacks--> AgentStream
//!                                                     | assign offset
//!                                                     v
//!                                            RingBuffer<StreamEvent>
//!                                                     |
//!                         replay(from) <--------------+--------> EventBus
//!                                                               (live subscribers)
//! ```
//!
//! A client that disconnects reattaches with the last offset it saw and
//! receives every retained event after it, then live events, without a
//! gap or duplicate between the two.

pub mod bus;
pub mod event;
pub mod multiplexer;

pub use crate::ring::RingBuffer;
pub use bus::{EventBus, SubscriptionId};
pub use event::{EventPayload, StreamEvent, StreamEventType};
pub use multiplexer::{AgentInfo, AgentMetadata, AgentStream, Replay, StreamConfig};
