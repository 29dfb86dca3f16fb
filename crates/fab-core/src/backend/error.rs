/// Errors raised by backend adapters and the registry.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Missing or inconsistent launch configuration.
    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("failed to serialize backend settings: {0}")]
    Settings(#[source] serde_json::Error),

    /// One stdout line that could not be decoded. The stream continues.
    #[error("malformed stream line: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to encode input message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The backend takes user turns through fresh processes, not stdin.
    #[error("backend {backend} does not accept input via stdin")]
    StdinNotSupported { backend: String },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}
