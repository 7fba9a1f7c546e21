use thiserror::Error;

/// Error kinds the dispatch and execution pipeline distinguishes.  The
/// executor's top level is the only place these are translated into
/// ack/nack decisions and queue back-offs.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("insufficient {dimension}: requested {requested}, free {free}")]
    InsufficientResources {
        dimension: &'static str,
        requested: u64,
        free: u64,
    },

    #[error("poison message: {0}")]
    PoisonMessage(String),

    #[error("user script terminated with exit code {0}")]
    UserScriptFailure(i32),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error("error: {0}")]
    Generic(String),
}

impl RunnerError {
    /// True when the queue framework should redeliver the message.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::TransientBackend(_)
                | RunnerError::InsufficientResources { .. }
                | RunnerError::Io(_)
                | RunnerError::Storage(crate::storage::StorageError::Transient(_))
        )
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<String> for RunnerError {
    fn from(e: String) -> Self {
        Self::Generic(e)
    }
}

impl From<&str> for RunnerError {
    fn from(e: &str) -> Self {
        Self::Generic(e.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(RunnerError::Generic(message))
}
