//! The per-message state machine: PARSE, ALLOCATE, STAGE, RUN, RETURN.
//! One instance handles one delivered message end to end and reports an
//! ack/nack verdict plus the queue back-off to install.

pub mod request;
pub mod script;
pub mod workdir;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::ArtifactCache;
use crate::common::error::RunnerError;
use crate::dispatch::backoff::{queue_key, BackoffTable};
use crate::executor::request::Request;
use crate::notify::Notifier;
use crate::queue::{HandlerVerdict, MessageHandler};
use crate::resources::{Allocation, ResourceAsk, ResourceLedger};
use crate::storage::{StorageError, StorageFactory};

/// Back-off after a payload that cannot be decoded, short enough that the
/// queue's healthy neighbours keep flowing.
pub const POISON_BACKOFF: Duration = Duration::from_secs(10);
/// Back-off after a reservation failed; waiting out a running experiment is
/// the only cure.
pub const ALLOC_BACKOFF: Duration = Duration::from_secs(300);
/// Floor applied to every back-off the executor hands out.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
/// Back-off after a retryable stage or run failure.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(60);

const OUTPUT_CHANNEL_DEPTH: usize = 128;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Scratch root; experiments run under `<root>/experiments/`.
    pub root_dir: PathBuf,
    /// Keep working directories around for diagnosis.
    pub debug: bool,
    pub deposit_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        ExecutorConfig {
            root_dir: root_dir.into(),
            debug: false,
            deposit_timeout: Duration::from_secs(300),
        }
    }
}

/// What the executor decided about one message.
#[derive(Debug)]
pub struct Verdict {
    pub ack: bool,
    pub backoff: Option<Duration>,
    pub profile: Option<ResourceAsk>,
}

#[derive(Debug, PartialEq, Eq)]
enum ScriptOutcome {
    Finished,
    Failed(i32),
    Cancelled,
}

pub struct Executor {
    pub config: ExecutorConfig,
    pub ledger: Arc<ResourceLedger>,
    pub cache: Arc<ArtifactCache>,
    pub storage: Arc<dyn StorageFactory>,
    pub notifier: Arc<dyn Notifier>,
}

impl Executor {
    /// Drives the whole state machine for one message.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        project: &str,
        queue: &str,
        payload: &[u8],
    ) -> Verdict {
        // PARSE
        let request = match Request::unmarshal(payload) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("unable to process msg from {project}:{queue} due to {err}");
                return Verdict { ack: true, backoff: Some(POISON_BACKOFF), profile: None };
            }
        };
        let profile = match request.resource_ask() {
            Ok(profile) => profile,
            Err(err) => {
                log::warn!(
                    "rejecting {project}:{queue} experiment {}: {err}",
                    request.experiment.key
                );
                return Verdict { ack: true, backoff: Some(POISON_BACKOFF), profile: None };
            }
        };

        let dest = request.config.runner.slack_dest.clone();
        let header = format!(
            "{project}:{queue} project {} experiment {}",
            request.config.database.project_id, request.experiment.key
        );
        log::info!("started {header}");
        self.notifier.info(&dest, &format!("started {header}"));

        // ALLOCATE
        let alloc = match self.ledger.reserve(&profile) {
            Ok(alloc) => alloc,
            Err(err @ RunnerError::InsufficientResources { .. }) => {
                log::info!("alloc failed backing off due to {err}");
                return Verdict {
                    ack: false,
                    backoff: Some(ALLOC_BACKOFF),
                    profile: Some(profile),
                };
            }
            Err(err) => {
                log::warn!("alloc for {header} rejected due to {err}");
                return Verdict {
                    ack: true,
                    backoff: Some(POISON_BACKOFF),
                    profile: Some(profile),
                };
            }
        };

        // STAGE, RUN and RETURN happen with the allocation held
        let outcome = self.run(cancel, &request, &alloc).await;
        self.ledger.release(alloc);

        match outcome {
            Ok(()) => {
                log::info!("{header} stopped");
                self.notifier.info(&dest, &format!("{header} stopped"));
                Verdict { ack: true, backoff: None, profile: Some(profile) }
            }
            Err(err @ RunnerError::UserScriptFailure(_)) => {
                // The script is terminal for this message; its artifacts
                // were returned so the user can inspect the logs
                let msg = format!("{header} dumped due to {err}");
                log::warn!("{msg}");
                self.notifier.warning(&dest, &msg);
                Verdict {
                    ack: true,
                    backoff: Some(MIN_BACKOFF),
                    profile: Some(profile),
                }
            }
            Err(err) if err.is_retryable() => {
                let msg = format!("{header} retry due to {err}");
                log::info!("{msg}");
                self.notifier.info(&dest, &msg);
                Verdict {
                    ack: false,
                    backoff: Some(RETRY_BACKOFF),
                    profile: Some(profile),
                }
            }
            Err(err) => {
                let msg = format!("{header} dumped due to {err}");
                log::warn!("{msg}");
                self.notifier.warning(&dest, &msg);
                Verdict {
                    ack: true,
                    backoff: Some(POISON_BACKOFF),
                    profile: Some(profile),
                }
            }
        }
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        alloc: &Allocation,
    ) -> crate::Result<()> {
        let (expr_dir, expr_sub) =
            workdir::make_unique_dir(&self.config.root_dir, &request.experiment.key).await?;

        let result = self.run_in_dir(cancel, request, alloc, &expr_dir, &expr_sub).await;

        if self.config.debug {
            log::debug!("leaving {} in place", expr_dir.display());
        } else if let Err(err) = std::fs::remove_dir_all(&expr_dir) {
            log::warn!("could not remove {}: {err}", expr_dir.display());
        }
        result
    }

    async fn run_in_dir(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        alloc: &Allocation,
        expr_dir: &Path,
        expr_sub: &str,
    ) -> crate::Result<()> {
        let process_env: HashMap<String, String> = std::env::vars().collect();
        let envs = script::merge_env(&process_env, request, &alloc.env());
        let env_map: HashMap<String, String> = envs.clone().into_iter().collect();

        std::fs::create_dir_all(expr_dir.join("workspace"))?;
        std::fs::create_dir_all(expr_dir.join("output"))?;

        // STAGE
        self.stage(request, &env_map, expr_dir).await?;

        let script_path = expr_dir
            .join("workspace")
            .join(format!("{expr_sub}.sh"));
        let content =
            script::make_script(request, &self.config.root_dir, expr_dir, expr_sub, &envs);
        script::write_script(&script_path, &content)?;

        // RUN
        let outcome = self
            .run_script(cancel, request, &script_path, expr_dir, &env_map)
            .await?;

        // RETURN: mutable artifacts go back regardless of the script status
        return_mutable(
            &self.storage,
            request,
            &env_map,
            expr_dir,
            self.config.deposit_timeout,
        )
        .await;

        match outcome {
            ScriptOutcome::Finished => Ok(()),
            ScriptOutcome::Failed(code) => Err(RunnerError::UserScriptFailure(code)),
            ScriptOutcome::Cancelled => Err(RunnerError::TransientBackend(
                "experiment cancelled".to_string(),
            )),
        }
    }

    /// Brings every input artifact into `<work>/<group>/`.  A missing
    /// artifact is a warning; the experiment may not need it.
    async fn stage(
        &self,
        request: &Request,
        env: &HashMap<String, String>,
        expr_dir: &Path,
    ) -> crate::Result<()> {
        for (group, artifact) in &request.experiment.artifacts {
            let dest = expr_dir.join(group);
            std::fs::create_dir_all(&dest)?;

            let adapter = self.storage.open(artifact, env)?;
            let fetched = self.cache.fetch(artifact, adapter.as_ref(), env, &dest).await;
            adapter.close().await;

            match fetched {
                Ok(warnings) => {
                    for warning in warnings {
                        log::warn!("{warning}");
                    }
                    log::debug!("staged {} to {}", artifact.qualified, dest.display());
                }
                Err(RunnerError::Storage(StorageError::NotFound(key))) => {
                    log::info!("data not found for artifact {group} using {key}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Launches the synthesized script and shepherds it to completion: two
    /// reader tasks interleave stdout and stderr line-wise through one
    /// writer into `output/output`, while a ticker checkpoints mutable
    /// artifacts at the requested interval.
    async fn run_script(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        script_path: &Path,
        expr_dir: &Path,
        env: &HashMap<String, String>,
    ) -> crate::Result<ScriptOutcome> {
        let output_path = expr_dir.join("output").join("output");
        let output = tokio::fs::File::create(&output_path).await?;
        log::debug!(
            "logging {} to {}",
            script_path.display(),
            output_path.display()
        );

        let mut child = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(script_path)
            .current_dir(script_path.parent().unwrap_or(expr_dir))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (line_tx, mut line_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_DEPTH);
        let stdout_task = tokio::spawn(relay_lines(child.stdout.take(), line_tx.clone()));
        let stderr_task = tokio::spawn(relay_lines(child.stderr.take(), line_tx));
        let writer_task = tokio::spawn(async move {
            let mut file = tokio::io::BufWriter::new(output);
            while let Some(line) = line_rx.recv().await {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            let _ = file.flush().await;
        });

        let ticker_cancel = CancellationToken::new();
        let checkpoint_task = checkpoint_interval(request.config.save_workspace_frequency).map(
            |period| {
                let storage = self.storage.clone();
                let request = request.clone();
                let env = env.clone();
                let expr_dir = expr_dir.to_path_buf();
                let timeout = self.config.deposit_timeout;
                let stop = ticker_cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = ticker.tick() => {
                                return_mutable(&storage, &request, &env, &expr_dir, timeout).await;
                            }
                        }
                    }
                })
            },
        );

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("cancelling {}", script_path.display());
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
            status = child.wait() => Some(status?),
        };

        ticker_cancel.cancel();
        if let Some(task) = checkpoint_task {
            let _ = task.await;
        }
        if status.is_none() {
            // Orphaned grandchildren may keep the stdio pipes open forever
            stdout_task.abort();
            stderr_task.abort();
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let _ = writer_task.await;

        Ok(match status {
            None => ScriptOutcome::Cancelled,
            Some(status) if status.success() => ScriptOutcome::Finished,
            Some(status) => ScriptOutcome::Failed(status.code().unwrap_or(-1)),
        })
    }
}

/// Checkpointing is disabled when the requested interval falls outside the
/// sane range of one minute to one month of minutes.
fn checkpoint_interval(minutes: i64) -> Option<Duration> {
    if (1..43800).contains(&minutes) {
        Some(Duration::from_secs(minutes as u64 * 60))
    } else {
        None
    }
}

async fn relay_lines(
    stdio: Option<impl tokio::io::AsyncRead + Unpin>,
    lines: mpsc::Sender<String>,
) {
    if let Some(stdio) = stdio {
        let mut reader = BufReader::new(stdio).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).await.is_err() {
                return;
            }
        }
    }
}

/// Uploads every mutable artifact group.  Failures are logged; the overall
/// experiment result stays the script's exit status.
async fn return_mutable(
    storage: &Arc<dyn StorageFactory>,
    request: &Request,
    env: &HashMap<String, String>,
    expr_dir: &Path,
    timeout: Duration,
) {
    for (group, artifact) in request.mutable_artifacts() {
        let source = expr_dir.join(group);
        if !source.exists() {
            continue;
        }
        log::debug!("returning {} to {}", source.display(), artifact.key);
        match storage.open(artifact, env) {
            Ok(adapter) => {
                if let Err(err) = adapter.deposit(&source, &artifact.key, timeout).await {
                    log::warn!("{group} data not uploaded due to {err}");
                }
                adapter.close().await;
            }
            Err(err) => log::warn!("{group} data not uploaded due to {err}"),
        }
    }
}

/// Glue between the queue adapters and the executor: checks the back-off
/// before doing any work and installs the back-off the verdict asks for.
pub struct ExecutorHandler {
    pub executor: Arc<Executor>,
    pub backoffs: Arc<BackoffTable>,
}

#[async_trait]
impl MessageHandler for ExecutorHandler {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        project: &str,
        queue: &str,
        payload: Vec<u8>,
    ) -> HandlerVerdict {
        let key = queue_key(project, queue);
        if self.backoffs.active(&key) {
            log::debug!("stopping checking {key} backing off");
            return HandlerVerdict { profile: None, ack: false };
        }

        let processed = AssertUnwindSafe(self.executor.process(cancel, project, queue, &payload))
            .catch_unwind()
            .await;
        match processed {
            Ok(verdict) => {
                if let Some(backoff) = verdict.backoff {
                    self.backoffs.set(&key, backoff.max(MIN_BACKOFF));
                }
                HandlerVerdict { profile: verdict.profile, ack: verdict.ack }
            }
            Err(panic) => {
                log::warn!("panic processing msg on {key}: {panic:?}");
                self.backoffs.set(&key, MIN_BACKOFF);
                HandlerVerdict { profile: None, ack: false }
            }
        }
    }
}
