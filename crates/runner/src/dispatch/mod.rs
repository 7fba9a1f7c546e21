//! Queue discovery and work dispatch: per project, an inventory refresher
//! plus a producer/consumer scheduling pair.  The pieces only meet through
//! shared state (inventory, back-off table, ledger) and the offer channel.

pub mod backoff;
pub mod inventory;
pub mod scheduler;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::scheduler::ProjectPipeline;
use crate::metrics::MetricsRegistry;
use crate::notify::Notifier;

/// Spawns a task with a recovery boundary: a panic terminates only that
/// task and leaves a trace in the log.
pub fn spawn_guarded<F>(name: String, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            log::warn!("panic in {name}: {panic:?}");
        }
    })
}

/// Wires up and starts one project's pipeline.  The returned handles finish
/// once `cancel` fires.
pub fn start_project(
    pipeline: Arc<ProjectPipeline>,
    matcher: Regex,
    refresh_interval: Duration,
    metrics: Arc<MetricsRegistry>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    // A single unbuffered worker triggered through the two-phase handshake
    let (offer_tx, offer_rx) = mpsc::channel(1);
    let project = &pipeline.project;

    vec![
        spawn_guarded(
            format!("{project} inventory refresh"),
            inventory::run_refresh(
                pipeline.project.clone(),
                pipeline.adapter.clone(),
                matcher,
                pipeline.inventory.clone(),
                refresh_interval,
                metrics,
                notifier,
                cancel.clone(),
            ),
        ),
        spawn_guarded(
            format!("{project} producer"),
            scheduler::run_producer(pipeline.clone(), offer_tx, cancel.clone()),
        ),
        spawn_guarded(
            format!("{project} consumer"),
            scheduler::run_consumer(pipeline, offer_rx, cancel),
        ),
    ]
}
