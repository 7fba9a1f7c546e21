use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::queue::{MessageHandler, QueueAdapter, QueueError, WorkOutcome};

const CLAIM_SUFFIX: &str = ".claimed";
const POLL_PAUSE: Duration = Duration::from_millis(200);

/// Spool-directory queue backend: every subdirectory of the root is a queue
/// and every file in it is one message.  A claimed message is renamed aside
/// while its handler runs, which keeps it invisible to other consumers; an
/// ack deletes it and a nack restores the original name for redelivery.
///
/// This is the development transport behind `--amqp-url file:///...` and the
/// queue double used by the test suite.
pub struct DirQueue {
    root: PathBuf,
    project: String,
}

impl DirQueue {
    pub fn new(root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        DirQueue {
            root: root.into(),
            project: project.into(),
        }
    }

    fn queue_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Oldest unclaimed message file, claimed by renaming.
    fn claim_next(&self, name: &str) -> Result<Option<(PathBuf, Vec<u8>)>, QueueError> {
        let dir = self.queue_path(name);
        let mut pending: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let entries =
            std::fs::read_dir(&dir).map_err(|e| QueueError::Transient(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| QueueError::Transient(e.to_string()))?;
            let path = entry.path();
            let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            if !path.is_file() || name.ends_with(CLAIM_SUFFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            pending.push((modified, path));
        }
        pending.sort();

        for (_, path) in pending {
            let claimed = path.with_file_name(format!(
                "{}{CLAIM_SUFFIX}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ));
            // A concurrent consumer may win the rename; move on when it does.
            if std::fs::rename(&path, &claimed).is_ok() {
                let payload =
                    std::fs::read(&claimed).map_err(|e| QueueError::Transient(e.to_string()))?;
                return Ok(Some((claimed, payload)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl QueueAdapter for DirQueue {
    async fn refresh(
        &self,
        matcher: &Regex,
        _timeout: Duration,
    ) -> Result<HashSet<String>, QueueError> {
        let mut known = HashSet::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| QueueError::Transient(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| QueueError::Transient(e.to_string()))?;
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if matcher.is_match(&name) {
                    known.insert(name);
                }
            }
        }
        Ok(known)
    }

    async fn exists(&self, name: &str, _timeout: Duration) -> Result<bool, QueueError> {
        Ok(self.queue_path(name).is_dir())
    }

    async fn work(
        &self,
        cancel: &CancellationToken,
        poll_timeout: Duration,
        name: &str,
        handler: &dyn MessageHandler,
    ) -> Result<WorkOutcome, QueueError> {
        let deadline = Instant::now() + poll_timeout;
        let mut outcome = WorkOutcome::default();

        loop {
            if cancel.is_cancelled() {
                return Ok(outcome);
            }
            match self.claim_next(name)? {
                Some((claimed, payload)) => {
                    let verdict = handler
                        .handle(cancel, &self.project, name, payload)
                        .await;
                    outcome.messages += 1;
                    if verdict.profile.is_some() {
                        outcome.profile = verdict.profile;
                    }
                    if verdict.ack {
                        std::fs::remove_file(&claimed)
                            .map_err(|e| QueueError::Transient(e.to_string()))?;
                    } else {
                        let original = claimed.with_file_name(
                            claimed
                                .file_name()
                                .unwrap_or_default()
                                .to_string_lossy()
                                .trim_end_matches(CLAIM_SUFFIX)
                                .to_string(),
                        );
                        std::fs::rename(&claimed, original)
                            .map_err(|e| QueueError::Transient(e.to_string()))?;
                        // Redelivery would hot-loop inside a single poll
                        return Ok(outcome);
                    }
                }
                None if outcome.messages == 0 && Instant::now() < deadline => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(outcome),
                        _ = tokio::time::sleep(POLL_PAUSE) => {}
                    }
                }
                None => return Ok(outcome),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::HandlerVerdict;
    use crate::resources::ResourceAsk;
    use std::sync::Mutex;

    struct Recorder {
        ack: bool,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(
            &self,
            _cancel: &CancellationToken,
            _project: &str,
            _queue: &str,
            payload: Vec<u8>,
        ) -> HandlerVerdict {
            self.seen.lock().unwrap().push(payload);
            HandlerVerdict {
                profile: Some(ResourceAsk { cpus: 2, ..Default::default() }),
                ack: self.ack,
            }
        }
    }

    fn spool() -> (tempfile::TempDir, DirQueue) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("rmq_train")).unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();
        let queue = DirQueue::new(dir.path(), "demo");
        (dir, queue)
    }

    #[tokio::test]
    async fn test_refresh_applies_matcher() {
        let (_dir, queue) = spool();
        let matcher = Regex::new("^(rmq|sqs)_.*$").unwrap();
        let known = queue.refresh(&matcher, Duration::from_secs(1)).await.unwrap();
        assert_eq!(known, HashSet::from(["rmq_train".to_string()]));
        assert!(queue.exists("rmq_train", Duration::from_secs(1)).await.unwrap());
        assert!(!queue.exists("absent", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_ack_consumes_message() {
        let (dir, queue) = spool();
        std::fs::write(dir.path().join("rmq_train/m1"), b"payload-1").unwrap();
        let handler = Recorder { ack: true, seen: Mutex::new(Vec::new()) };

        let outcome = queue
            .work(
                &CancellationToken::new(),
                Duration::from_millis(50),
                "rmq_train",
                &handler,
            )
            .await
            .unwrap();

        assert_eq!(outcome.messages, 1);
        assert_eq!(outcome.profile.unwrap().cpus, 2);
        assert_eq!(*handler.seen.lock().unwrap(), vec![b"payload-1".to_vec()]);
        assert_eq!(std::fs::read_dir(dir.path().join("rmq_train")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_nack_restores_message() {
        let (dir, queue) = spool();
        std::fs::write(dir.path().join("rmq_train/m1"), b"payload-1").unwrap();
        let handler = Recorder { ack: false, seen: Mutex::new(Vec::new()) };

        let outcome = queue
            .work(
                &CancellationToken::new(),
                Duration::from_millis(50),
                "rmq_train",
                &handler,
            )
            .await
            .unwrap();

        assert_eq!(outcome.messages, 1);
        assert!(dir.path().join("rmq_train/m1").exists());
    }

    #[tokio::test]
    async fn test_empty_poll_respects_timeout() {
        let (_dir, queue) = spool();
        let handler = Recorder { ack: true, seen: Mutex::new(Vec::new()) };
        let started = Instant::now();
        let outcome = queue
            .work(
                &CancellationToken::new(),
                Duration::from_millis(300),
                "rmq_train",
                &handler,
            )
            .await
            .unwrap();
        assert_eq!(outcome.messages, 0);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
