use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use runner::cache::{ArtifactCache, CacheConfig};
use runner::common::error::RunnerError;
use runner::common::format::{human_size, parse_bytes};
use runner::common::fsutils::absolute_path;
use runner::common::lock::ExclusiveLock;
use runner::common::setup::setup_logging;
use runner::creds::{self, JsonValidator, ProjectRegistry, ProjectSpawner};
use runner::dispatch::backoff::{self, BackoffTable};
use runner::dispatch::inventory::{Inventory, REFRESH_INTERVAL};
use runner::dispatch::scheduler::{ProjectPipeline, QUEUE_OP_TIMEOUT};
use runner::dispatch::{spawn_guarded, start_project};
use runner::executor::{Executor, ExecutorConfig, ExecutorHandler};
use runner::metrics::MetricsRegistry;
use runner::notify::{LogNotifier, Notifier};
use runner::queue::dir::DirQueue;
use runner::queue::{QueueAdapter, QueueFactory};
use runner::resources::{Capacity, ResourceLedger};
use runner::storage::fs::FsStorage;
use runner::storage::{ArtifactRef, StorageAdapter, StorageFactory};

/// Worker-node agent for studioml experiment queues.  Every option can also
/// be supplied through the matching upper-cased environment variable.
#[derive(Debug, Parser)]
#[command(name = "runner", version = runner::RUNNER_VERSION)]
struct Opts {
    /// URI for an amqp message exchange through which work is being sent;
    /// a file:// URL serves a local spool directory instead
    #[arg(long, env = "AMQP_URL", default_value = "")]
    amqp_url: String,

    /// Regular expression a queue name needs to match to be considered
    #[arg(long, env = "QUEUE_MATCH", default_value = "^(rmq|sqs)_.*$")]
    queue_match: String,

    /// Directory containing certificate files used to access studioml
    /// projects on the cloud pub/sub bus.  Does not descend.
    #[arg(long, env = "GOOGLE_CERTS", default_value = "/opt/studioml/google-certs")]
    google_certs: PathBuf,

    /// Directory containing credential files for SQS style queues
    #[arg(long, env = "SQS_CERTS")]
    sqs_certs: Option<PathBuf>,

    /// Local working directory used for runner storage, defaults to
    /// $TMPDIR, or /tmp
    #[arg(long, env = "WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Leave debugging artifacts in place, can take a large amount of disk
    /// space (intended for developers only)
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// In the event no gpus are found continue with only CPU support
    #[arg(long, env = "CPU_ONLY")]
    cpu_only: bool,

    /// Maximum number of cores to be used (default 0, all cores)
    #[arg(long, env = "MAX_CORES", default_value_t = 0)]
    max_cores: u32,

    /// Maximum amount of memory for tasks using SI, ICE units, for example
    /// 512gb, 16gib (default 0, all available RAM)
    #[arg(long, env = "MAX_MEM", default_value = "0gb")]
    max_mem: String,

    /// Maximum amount of local disk storage for tasks using SI, ICE units
    /// (default 0, 85% of available disk)
    #[arg(long, env = "MAX_DISK", default_value = "0gb")]
    max_disk: String,

    /// Disk budget for the artifact cache
    #[arg(long, env = "CACHE_SIZE", default_value = "10gb")]
    cache_size: String,

    /// Port the Prometheus metrics exposition listens on
    #[arg(long, env = "PROMETHEUS_PORT", default_value_t = 9090)]
    prometheus_port: u16,

    /// Default destination for operator notifications
    #[arg(long, env = "SLACK_DEST", default_value = "")]
    slack_dest: String,
}

fn default_working_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TMPDIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/tmp")
}

/// Storage wiring for artifacts.  `file://` URIs are served directly; the
/// cloud adapters are linked at deployment time and report their absence.
struct SchemeStorageFactory;

impl StorageFactory for SchemeStorageFactory {
    fn open(
        &self,
        artifact: &ArtifactRef,
        _env: &std::collections::HashMap<String, String>,
    ) -> runner::Result<Box<dyn StorageAdapter>> {
        match artifact.scheme() {
            "file" => {
                let rest = artifact.qualified.trim_start_matches("file://");
                let root = rest
                    .strip_suffix(artifact.key.trim_start_matches('/'))
                    .unwrap_or(rest)
                    .trim_end_matches('/');
                let root = if root.is_empty() { "/" } else { root };
                Ok(Box::new(FsStorage::new(root)))
            }
            scheme => Err(RunnerError::Config(format!(
                "no storage adapter is linked into this build for {scheme}:// artifacts"
            ))),
        }
    }
}

/// Queue backends for credential-driven projects.  The cloud SDK adapters
/// live outside this crate; this factory names the gap when one is missing.
struct UnlinkedQueueFactory {
    kind: &'static str,
}

impl QueueFactory for UnlinkedQueueFactory {
    fn open(&self, _project: &str, _creds: &Path) -> runner::Result<Arc<dyn QueueAdapter>> {
        Err(RunnerError::Config(format!(
            "no {} queue adapter is linked into this build",
            self.kind
        )))
    }
}

/// Starts a project's inventory, producer and consumer when its credential
/// file validates; projects whose backend cannot be opened are logged and
/// left idle until the credential disappears again.
struct PipelineSpawner {
    factory: Arc<dyn QueueFactory>,
    matcher: Regex,
    ledger: Arc<ResourceLedger>,
    backoffs: Arc<BackoffTable>,
    handler: Arc<ExecutorHandler>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsRegistry>,
}

impl ProjectSpawner for PipelineSpawner {
    fn spawn(&self, project: &str, creds: &Path, cancel: CancellationToken) {
        let adapter = match self.factory.open(project, creds) {
            Ok(adapter) => adapter,
            Err(err) => {
                log::warn!("project {project} cannot serve queues: {err}");
                return;
            }
        };
        let pipeline = Arc::new(ProjectPipeline {
            project: project.to_string(),
            adapter,
            inventory: Arc::new(Inventory::new()),
            ledger: self.ledger.clone(),
            backoffs: self.backoffs.clone(),
            handler: self.handler.clone(),
            notifier: self.notifier.clone(),
            busy: Mutex::new(HashSet::new()),
            poll_timeout: QUEUE_OP_TIMEOUT,
        });
        start_project(
            pipeline,
            self.matcher.clone(),
            REFRESH_INTERVAL,
            self.metrics.clone(),
            self.notifier.clone(),
            cancel,
        );
    }
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    setup_logging(opts.debug);

    // One agent per host; a second instance exits immediately
    let _lock = match ExclusiveLock::acquire("studioml-runner") {
        Ok(lock) => lock,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };

    log::info!("runner version {}", runner::RUNNER_VERSION);

    match run(opts).await {
        Ok(()) => {}
        Err(errs) => {
            for err in errs {
                log::error!("{err}");
            }
            std::process::exit(1);
        }
    }
}

/// Gathers every startup validation failure before giving up, so operators
/// get one pass at fixing their options rather than a failure at a time.
async fn run(opts: Opts) -> Result<(), Vec<RunnerError>> {
    let mut errs: Vec<RunnerError> = Vec::new();

    let working_dir = absolute_path(opts.working_dir.clone().unwrap_or_else(default_working_dir));
    if let Err(err) = std::fs::create_dir_all(&working_dir) {
        errs.push(RunnerError::Config(format!(
            "the working-dir option must name a usable directory: {err}"
        )));
    }

    let matcher = match Regex::new(&opts.queue_match) {
        Ok(matcher) => Some(matcher),
        Err(err) => {
            errs.push(RunnerError::Config(format!("invalid queue-match: {err}")));
            None
        }
    };

    let max_mem = parse_bytes(&opts.max_mem).unwrap_or_else(|err| {
        errs.push(err);
        0
    });
    let max_disk = parse_bytes(&opts.max_disk).unwrap_or_else(|err| {
        errs.push(err);
        0
    });
    let cache_size = parse_bytes(&opts.cache_size).unwrap_or_else(|err| {
        errs.push(err);
        0
    });

    let capacity = match Capacity::detect(
        &working_dir,
        opts.max_cores,
        max_mem,
        max_disk,
        opts.cpu_only,
    ) {
        Ok(capacity) => Some(capacity),
        Err(err) => {
            errs.push(err);
            None
        }
    };

    let amqp_spool = match parse_amqp_url(&opts.amqp_url) {
        Ok(spool) => spool,
        Err(err) => {
            errs.push(err);
            None
        }
    };

    let google_usable = opts.google_certs.is_dir();
    let sqs_usable = opts.sqs_certs.as_deref().map(Path::is_dir).unwrap_or(false);
    if !google_usable && !sqs_usable && amqp_spool.is_none() {
        errs.push(RunnerError::Config(format!(
            "one of the sqs-certs, or google-certs options must be set to an existing directory, or a usable amqp-url specified, for the runner to perform any useful work ({}, {})",
            opts.google_certs.display(),
            opts.sqs_certs
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        )));
    }

    if !errs.is_empty() {
        return Err(errs);
    }
    let capacity = capacity.expect("validated above");
    let matcher = matcher.expect("validated above");

    let ledger = Arc::new(ResourceLedger::new(capacity));
    log::info!(
        "managing {} cores, {} ram, {} disk, {} gpu boards",
        ledger.capacity().cpus,
        human_size(ledger.capacity().ram),
        human_size(ledger.capacity().disk),
        ledger.capacity().boards.len(),
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    if !opts.slack_dest.is_empty() {
        log::info!(
            "operator notifications default to {}, delivery is handled by the deployed notifier",
            opts.slack_dest
        );
    }
    let cache = ArtifactCache::open(
        CacheConfig::new(working_dir.join("blob-cache"), cache_size),
        metrics.clone(),
    )
    .map_err(|err| vec![err])?;

    let executor = Arc::new(Executor {
        config: {
            let mut config = ExecutorConfig::new(&working_dir);
            config.debug = opts.debug;
            config
        },
        ledger: ledger.clone(),
        cache: Arc::new(cache),
        storage: Arc::new(SchemeStorageFactory),
        notifier: notifier.clone(),
    });
    let backoffs = Arc::new(BackoffTable::new());
    let handler = Arc::new(ExecutorHandler {
        executor,
        backoffs: backoffs.clone(),
    });

    let root = CancellationToken::new();

    spawn_guarded(
        "metrics exposition".to_string(),
        serve_metrics(metrics.clone(), opts.prometheus_port, root.clone()),
    );
    spawn_guarded(
        "resource usage log".to_string(),
        runner::resources::log_usage_loop(ledger.clone(), Duration::from_secs(300), root.clone()),
    );
    spawn_guarded(
        "backoff janitor".to_string(),
        backoff::run_purge(backoffs.clone(), backoff::PURGE_INTERVAL, root.clone()),
    );

    // Credential driven backends: a watcher per directory keeps the
    // project pipelines in step with the files on disk
    for (kind, dir) in [
        ("pub/sub", Some(opts.google_certs.clone())),
        ("sqs", opts.sqs_certs.clone()),
    ] {
        let Some(dir) = dir else { continue };
        let spawner = Arc::new(PipelineSpawner {
            factory: Arc::new(UnlinkedQueueFactory { kind }),
            matcher: matcher.clone(),
            ledger: ledger.clone(),
            backoffs: backoffs.clone(),
            handler: handler.clone(),
            notifier: notifier.clone(),
            metrics: metrics.clone(),
        });
        spawn_guarded(
            format!("{kind} credential watcher"),
            creds::watch(
                dir,
                creds::SCAN_INTERVAL,
                Arc::new(JsonValidator),
                Arc::new(ProjectRegistry::new(root.clone())),
                spawner,
                root.clone(),
            ),
        );
    }

    // The amqp exchange needs no per-project credentials; a file:// URL is
    // served through the spool transport
    if let Some(spool) = amqp_spool {
        let project = "rmq".to_string();
        let pipeline = Arc::new(ProjectPipeline {
            project: project.clone(),
            adapter: Arc::new(DirQueue::new(spool, project)),
            inventory: Arc::new(Inventory::new()),
            ledger: ledger.clone(),
            backoffs: backoffs.clone(),
            handler: handler.clone(),
            notifier: notifier.clone(),
            busy: Mutex::new(HashSet::new()),
            poll_timeout: QUEUE_OP_TIMEOUT,
        });
        start_project(
            pipeline,
            matcher.clone(),
            REFRESH_INTERVAL,
            metrics.clone(),
            notifier.clone(),
            root.clone(),
        );
    }

    wait_for_shutdown().await;
    log::warn!("interrupt seen, shutting down");
    root.cancel();

    // Give in-flight nacks a moment to reach the brokers before exiting
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

fn parse_amqp_url(url: &str) -> runner::Result<Option<PathBuf>> {
    if url.is_empty() {
        return Ok(None);
    }
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(RunnerError::Config(format!("empty spool path in {url}")));
        }
        return Ok(Some(PathBuf::from(path)));
    }
    match url.split_once("://") {
        Some(("amqp" | "amqps", _)) => Err(RunnerError::Config(format!(
            "no amqp transport is linked into this build for {url}; use a file:// spool url or deploy an adapter"
        ))),
        _ => Err(RunnerError::Config(format!("unrecognized amqp-url {url}"))),
    }
}

async fn serve_metrics(metrics: Arc<MetricsRegistry>, port: u16, cancel: CancellationToken) {
    if let Err(err) = runner::metrics::serve(metrics, port, cancel).await {
        log::warn!("metrics exposition stopped: {err}");
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            log::warn!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
