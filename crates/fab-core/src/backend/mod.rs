//! Backend adapter interface for agent CLIs.
//!
//! This module defines the [`Backend`] trait that all adapters implement,
//! the launch types ([`CommandConfig`], [`LaunchRequest`], [`CommandSpec`]),
//! typed settings and hook configuration, and the [`BackendRegistry`] for
//! runtime lookup.
//!
//! # Architecture
//!
//! ```text
//! BackendRegistry --get("claude")--> Arc<dyn Backend>
//!                                         |
//! Supervisor ----- build_command(config, launch) --> CommandSpec --> spawn
//!     |
//!     |  stdout line --parse_stream_message--> StreamMessage
//!     |  user text  --format_input_message--> stdin bytes
//! ```

pub mod claude;
pub mod codex;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod trait_def;
pub mod types;

// Re-export the primary public API at the module level.
pub use claude::ClaudeAdapter;
pub use codex::{CodexAdapter, CodexMode};
pub use error::BackendError;
pub use hooks::{HookCommand, HookMatcher, HookSettings};
pub use registry::{BackendRegistry, default_registry};
pub use trait_def::Backend;
pub use types::{
    AGENT_ID_ENV, BackendSettings, ClaudeSettings, CodexSettings, CommandConfig, CommandSpec,
    InputMode, LaunchRequest,
};
