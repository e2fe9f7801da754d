use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to the caller of the engine.
///
/// Execution failures are not errors: a fault inside the context, a timeout or
/// a cancellation all resolve as an [`crate::ExecutionResult`] with `ok == false`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a run is already in progress")]
    Busy,
    #[error("a credential request for {origin} is still pending")]
    CredentialPending { origin: String },
    #[error("failed to launch execution context: {0}")]
    Launch(String),
    #[error("execution context channel error: {0}")]
    Channel(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
