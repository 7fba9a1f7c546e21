pub mod dir;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::resources::ResourceAsk;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue authentication failed: {0}")]
    Auth(String),
    #[error("transient queue failure: {0}")]
    Transient(String),
    #[error("fatal queue failure: {0}")]
    Fatal(String),
}

impl From<QueueError> for crate::RunnerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Transient(msg) => crate::RunnerError::TransientBackend(msg),
            QueueError::Auth(msg) => crate::RunnerError::Credential(msg),
            QueueError::Fatal(msg) => crate::RunnerError::Generic(msg),
        }
    }
}

/// Outcome of one `work` long-poll.
#[derive(Debug, Default)]
pub struct WorkOutcome {
    /// Messages handed to the handler during this poll.
    pub messages: u64,
    /// Resource profile observed on the most recently handled message.
    pub profile: Option<ResourceAsk>,
}

/// Verdict returned by a message handler: the resource profile the message
/// asked for (when one could be decoded) and whether to acknowledge it.
#[derive(Debug)]
pub struct HandlerVerdict {
    pub profile: Option<ResourceAsk>,
    pub ack: bool,
}

/// Processes a single delivered message.  Implemented by the executor glue;
/// fakes stand in for it in scheduler tests.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        project: &str,
        queue: &str,
        payload: Vec<u8>,
    ) -> HandlerVerdict;
}

/// Narrow contract the dispatch pipeline consumes from queue backends
/// (cloud pub/sub, SQS-style queues, AMQP brokers).  Implementations must
/// keep a delivered message invisible to other consumers while the handler
/// runs, for up to the configured experiment timeout.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Names of the queues currently advertised that match `matcher`.
    async fn refresh(
        &self,
        matcher: &Regex,
        timeout: Duration,
    ) -> Result<HashSet<String>, QueueError>;

    /// Whether the named queue still exists on the backend.
    async fn exists(&self, name: &str, timeout: Duration) -> Result<bool, QueueError>;

    /// Long-polls `name` and feeds each delivered message through the
    /// handler, acking or nacking per its verdict.
    async fn work(
        &self,
        cancel: &CancellationToken,
        poll_timeout: Duration,
        name: &str,
        handler: &dyn MessageHandler,
    ) -> Result<WorkOutcome, QueueError>;
}

/// Builds a queue adapter for one project from its credentials.
pub trait QueueFactory: Send + Sync {
    fn open(
        &self,
        project: &str,
        creds: &std::path::Path,
    ) -> crate::Result<std::sync::Arc<dyn QueueAdapter>>;
}
