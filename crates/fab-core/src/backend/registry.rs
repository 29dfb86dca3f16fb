//! Backend registry -- a named collection of available adapters.
//!
//! The registry is an explicit value handed to whatever constructs
//! supervisors. [`default_registry`] offers a process-wide instance with the
//! built-in adapters, initialized once on first use.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::claude::ClaudeAdapter;
use super::codex::CodexAdapter;
use super::error::BackendError;
use super::trait_def::Backend;

/// A collection of registered [`Backend`] implementations, keyed by name.
///
/// # Example
///
/// ```ignore
/// let mut registry = BackendRegistry::new();
/// registry.register(ClaudeAdapter::new());
/// let backend = registry.get("claude")?;
/// ```
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `claude` and `codex` adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeAdapter::new());
        registry.register(CodexAdapter::new());
        registry
    }

    /// Register an adapter under [`Backend::name`].
    ///
    /// An adapter already registered under that name is replaced and
    /// returned.
    pub fn register(&mut self, backend: impl Backend + 'static) -> Option<Arc<dyn Backend>> {
        self.register_shared(Arc::new(backend))
    }

    /// Register an already shared adapter.
    pub fn register_shared(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        let name = backend.name().to_string();
        self.backends.insert(name, backend)
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    /// Names of all registered adapters, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list())
            .finish()
    }
}

/// The default instance: built-in adapters with their default binaries.
///
/// Initialized on first call and immutable afterwards. Embedders that need
/// custom binaries or extra adapters should build their own
/// [`BackendRegistry`] instead.
pub fn default_registry() -> &'static BackendRegistry {
    static DEFAULT: OnceLock<BackendRegistry> = OnceLock::new();
    DEFAULT.get_or_init(BackendRegistry::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = BackendRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = BackendRegistry::new();
        assert!(registry.register(ClaudeAdapter::new()).is_none());
        assert_eq!(registry.get("claude").unwrap().name(), "claude");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = BackendRegistry::new();
        registry.register(ClaudeAdapter::new());
        let old = registry.register(ClaudeAdapter::with_binary("/opt/claude"));
        assert_eq!(old.unwrap().name(), "claude");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_backend_is_a_distinct_error() {
        let registry = BackendRegistry::new();
        match registry.get("nonexistent") {
            Err(BackendError::UnknownBackend(name)) => assert_eq!(name, "nonexistent"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("lookup should fail"),
        }
    }

    #[test]
    fn defaults_hold_builtin_adapters() {
        let registry = default_registry();
        assert_eq!(registry.list(), vec!["claude", "codex"]);
    }

    #[test]
    fn registry_debug_shows_names() {
        let debug = format!("{:?}", BackendRegistry::with_defaults());
        assert!(debug.contains("claude"));
        assert!(debug.contains("codex"));
    }
}
