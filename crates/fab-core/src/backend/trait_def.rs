//! The `Backend` trait -- the adapter interface for agent CLIs.
//!
//! Each concrete backend (Claude, Codex, ...) implements this trait. The
//! trait is object-safe so it can be stored as `Arc<dyn Backend>` in the
//! [`super::BackendRegistry`] and shared with supervisors.

use std::path::Path;

use super::error::BackendError;
use super::hooks::HookSettings;
use super::types::{CommandConfig, CommandSpec, InputMode, LaunchRequest};
use crate::message::StreamMessage;

/// Translation layer for one agent CLI's wire protocol.
///
/// Adapters are pure: they build commands and encode/decode bytes but never
/// start or own processes. The supervisor owns all process state.
pub trait Backend: Send + Sync {
    /// Registry name for this backend (e.g. "claude").
    fn name(&self) -> &str;

    /// How user turns reach the subprocess.
    fn input_mode(&self) -> InputMode;

    /// Whether a stopped conversation can be continued by a fresh process.
    fn supports_resume(&self) -> bool;

    /// Build the invocation for a fresh subprocess. Does not start it.
    ///
    /// Fails only on configuration errors; never drops required flags.
    fn build_command(
        &self,
        config: &CommandConfig,
        launch: &LaunchRequest,
    ) -> Result<CommandSpec, BackendError>;

    /// Parse one stdout line.
    ///
    /// - empty line: `Ok(None)`
    /// - valid but irrelevant event: `Ok(None)`
    /// - malformed line: `Err`, which callers log and skip
    fn parse_stream_message(&self, line: &str) -> Result<Option<StreamMessage>, BackendError>;

    /// Serialize a user turn for stdin, newline-terminated.
    ///
    /// Per-turn backends return [`BackendError::StdinNotSupported`].
    fn format_input_message(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<u8>, BackendError>;

    /// Permission/approval hook configuration invoking `self_path`.
    /// `None` means the backend has no hook mechanism.
    fn hook_settings(&self, self_path: &Path) -> Option<HookSettings>;
}

// Compile-time assertion: Backend must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Backend) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    /// A trivial backend used only to prove the trait works as `dyn Backend`.
    struct NoopBackend;

    impl Backend for NoopBackend {
        fn name(&self) -> &str {
            "noop"
        }

        fn input_mode(&self) -> InputMode {
            InputMode::Streaming
        }

        fn supports_resume(&self) -> bool {
            false
        }

        fn build_command(
            &self,
            config: &CommandConfig,
            _launch: &LaunchRequest,
        ) -> Result<CommandSpec, BackendError> {
            config.validate()?;
            Ok(CommandSpec::new("true", &config.working_dir))
        }

        fn parse_stream_message(
            &self,
            _line: &str,
        ) -> Result<Option<StreamMessage>, BackendError> {
            Ok(None)
        }

        fn format_input_message(
            &self,
            text: &str,
            _session_id: Option<&str>,
        ) -> Result<Vec<u8>, BackendError> {
            Ok(format!("{text}\n").into_bytes())
        }

        fn hook_settings(&self, _self_path: &Path) -> Option<HookSettings> {
            None
        }
    }

    #[test]
    fn backend_is_object_safe() {
        let backend: Box<dyn Backend> = Box::new(NoopBackend);
        assert_eq!(backend.name(), "noop");
        assert!(backend.hook_settings(Path::new("fab")).is_none());
    }

    #[test]
    fn noop_backend_builds_and_formats() {
        let backend: &dyn Backend = &NoopBackend;
        let spec = backend
            .build_command(&CommandConfig::new("a", "/tmp"), &LaunchRequest::fresh())
            .unwrap();
        assert_eq!(spec.program, "true");
        assert_eq!(backend.format_input_message("hi", None).unwrap(), b"hi\n");
        assert!(backend.parse_stream_message("{}").unwrap().is_none());
    }
}
