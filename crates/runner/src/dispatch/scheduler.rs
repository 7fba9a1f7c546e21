use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::backoff::{queue_key, BackoffTable};
use crate::dispatch::inventory::{Inventory, QueueRecord};
use crate::notify::Notifier;
use crate::queue::{MessageHandler, QueueAdapter};
use crate::resources::{ResourceAsk, ResourceLedger};

pub const PRODUCER_TICK: Duration = Duration::from_secs(5);
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(2);
/// Back-off installed when a `work` call fails.
pub const WORK_ERROR_BACKOFF: Duration = Duration::from_secs(120);
/// Back-off installed when the offer handshake finds the consumer busy.
pub const CHECK_BACKOFF: Duration = Duration::from_secs(60);
pub const EXISTS_CHECK_INTERVAL: Duration = Duration::from_secs(300);
pub const QUEUE_OP_TIMEOUT: Duration = Duration::from_secs(15);
pub const STARVATION_AFTER: Duration = Duration::from_secs(3600);
pub const STARVATION_REPEAT: Duration = Duration::from_secs(600);

/// Everything one project's scheduling pair shares.
pub struct ProjectPipeline {
    pub project: String,
    pub adapter: Arc<dyn QueueAdapter>,
    pub inventory: Arc<Inventory>,
    pub ledger: Arc<ResourceLedger>,
    pub backoffs: Arc<BackoffTable>,
    pub handler: Arc<dyn MessageHandler>,
    pub notifier: Arc<dyn Notifier>,
    /// Queues with a `work` call currently running, at most one each.
    pub busy: Mutex<HashSet<String>>,
    pub poll_timeout: Duration,
}

/// Scheduling handshake: a zero-valued probe goes first, the actual queue
/// check follows only when the probe was consumed.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    Probe,
    Check(String),
}

/// Idle queues eligible for a check this tick: no in-flight work, not in
/// back-off, and the remembered profile (when there is one) still fits the
/// host headroom.
pub fn eligible_queues(
    project: &str,
    inventory: &Inventory,
    backoffs: &BackoffTable,
    headroom: &ResourceAsk,
) -> Vec<QueueRecord> {
    inventory
        .ranked()
        .into_iter()
        .filter(|record| record.inflight == 0)
        .filter(|record| !backoffs.active(&queue_key(project, &record.name)))
        .filter(|record| match &record.profile {
            Some(profile) => profile.fits(headroom),
            None => true,
        })
        .collect()
}

/// Examines the subscriptions on a regular tick and offers one idle queue to
/// the consumer.  Randomizing the pick avoids starving queues when several
/// are viable.
pub async fn run_producer(
    pipeline: Arc<ProjectPipeline>,
    offers: mpsc::Sender<Offer>,
    cancel: CancellationToken,
) {
    log::debug!("started the queue checking producer for {}", pipeline.project);
    let mut ticker = tokio::time::interval(PRODUCER_TICK);
    let mut last_ready = Instant::now();
    let mut last_ready_abs = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("stopped the queue checking producer for {}", pipeline.project);
                return;
            }
            _ = ticker.tick() => {}
        }

        let headroom = pipeline.ledger.headroom();
        let mut idle = eligible_queues(
            &pipeline.project,
            &pipeline.inventory,
            &pipeline.backoffs,
            &headroom,
        );

        if !idle.is_empty() {
            idle.shuffle(&mut rand::thread_rng());
            let pick = &idle[0].name;
            match offer(&offers, pick).await {
                Ok(()) => {
                    last_ready = Instant::now();
                    last_ready_abs = Instant::now();
                }
                Err(reason) => {
                    let key = queue_key(&pipeline.project, pick);
                    pipeline.backoffs.set(&key, CHECK_BACKOFF);
                    log::warn!(
                        "checking {key} for work failed due to {reason}, backoff {}",
                        humantime::format_duration(CHECK_BACKOFF)
                    );
                }
            }
        }

        // A long stretch without accepted work is worth an operator look
        if last_ready.elapsed() > STARVATION_AFTER {
            last_ready += STARVATION_REPEAT;
            let msg = format!(
                "no work has been requested by this system for {}, please check for disk space etc resource availability",
                humantime::format_duration(Duration::from_secs(last_ready_abs.elapsed().as_secs()))
            );
            log::warn!("{msg}");
            pipeline.notifier.warning("", &msg);
        }
    }
}

async fn offer(offers: &mpsc::Sender<Offer>, queue: &str) -> Result<(), &'static str> {
    if offers.try_send(Offer::Probe).is_err() {
        return Err("busy checking consumer, at the first stage");
    }
    match tokio::time::timeout(OFFER_TIMEOUT, offers.send(Offer::Check(queue.to_string()))).await
    {
        Ok(Ok(())) => Ok(()),
        _ => Err("busy checking consumer, at the second stage"),
    }
}

/// Receives offers and hands each accepted queue to a worker task.
pub async fn run_consumer(
    pipeline: Arc<ProjectPipeline>,
    mut offers: mpsc::Receiver<Offer>,
    cancel: CancellationToken,
) {
    log::debug!("started {} checking consumer", pipeline.project);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = offers.recv() => match received {
                // Probes only establish that this consumer is listening
                Some(Offer::Probe) => continue,
                Some(Offer::Check(queue)) => {
                    let pipeline = pipeline.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        check_queue(pipeline, queue, cancel).await;
                    });
                }
                None => break,
            }
        }
    }
    log::debug!("stopped {} checking consumer", pipeline.project);
}

/// Runs one `work` call against a queue, maintaining the busy flag, the
/// in-flight count, the back-off table and the remembered profile.
async fn check_queue(pipeline: Arc<ProjectPipeline>, queue: String, cancel: CancellationToken) {
    let key = queue_key(&pipeline.project, &queue);
    if pipeline.backoffs.active(&key) {
        log::trace!("{key} backed off");
        return;
    }

    {
        let mut busy = pipeline.busy.lock().unwrap();
        if !busy.insert(queue.clone()) {
            log::trace!("{key} busy");
            return;
        }
    }
    pipeline.inventory.adjust_inflight(&queue, 1);

    let work_cancel = cancel.child_token();
    let watchdog = tokio::spawn(existence_watchdog(
        pipeline.clone(),
        queue.clone(),
        work_cancel.clone(),
    ));

    let result = pipeline
        .adapter
        .work(
            &work_cancel,
            pipeline.poll_timeout,
            &queue,
            pipeline.handler.as_ref(),
        )
        .await;
    work_cancel.cancel();
    let _ = watchdog.await;

    match result {
        Err(err) => {
            log::warn!(
                "backing off {}, {key} msg receive failed due to {err}",
                humantime::format_duration(WORK_ERROR_BACKOFF)
            );
            pipeline.backoffs.set(&key, WORK_ERROR_BACKOFF);
        }
        Ok(outcome) => {
            if let Some(profile) = outcome.profile {
                if let Err(err) = pipeline.inventory.set_profile(&queue, profile) {
                    log::info!("{key} resources not updated due to {err}");
                }
            } else if outcome.messages > 0 {
                log::warn!("{key} handled a msg that lacked a resource spec, backing off");
                pipeline.backoffs.set(&key, WORK_ERROR_BACKOFF);
            }
        }
    }

    pipeline.inventory.adjust_inflight(&queue, -1);
    pipeline.busy.lock().unwrap().remove(&queue);
}

/// While a `work` call runs, periodically confirm the queue still exists;
/// a deleted queue is the signal that its work should stop in short order.
async fn existence_watchdog(
    pipeline: Arc<ProjectPipeline>,
    queue: String,
    work_cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(EXISTS_CHECK_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = work_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match pipeline.adapter.exists(&queue, QUEUE_OP_TIMEOUT).await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "{}:{queue} no longer found cancelling running tasks",
                    pipeline.project
                );
                work_cancel.cancel();
                return;
            }
            Err(err) => {
                log::info!("{}:{queue} could not be validated due to {err}", pipeline.project);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn inventory_with(queues: &[&str]) -> Inventory {
        let inventory = Inventory::new();
        let known: HashSet<String> = queues.iter().map(|q| q.to_string()).collect();
        inventory.align(&known);
        inventory
    }

    fn big_headroom() -> ResourceAsk {
        ResourceAsk {
            cpus: 64,
            ram: u64::MAX,
            disk: u64::MAX,
            gpus: 8,
            gpu_mem: u64::MAX,
        }
    }

    #[test]
    fn test_fairness_under_backoff() {
        let inventory = inventory_with(&["q1", "q2"]);
        let backoffs = BackoffTable::new();
        let headroom = big_headroom();

        // While q1 backs off every dispatch goes to q2
        backoffs.set(&queue_key("proj", "q1"), Duration::from_millis(150));
        for _ in 0..50 {
            let mut idle = eligible_queues("proj", &inventory, &backoffs, &headroom);
            idle.shuffle(&mut rand::thread_rng());
            assert_eq!(idle.len(), 1);
            assert_eq!(idle[0].name, "q2");
        }

        std::thread::sleep(Duration::from_millis(200));

        // Once the back-off expires the shuffled pick is near uniform
        let trials = 400;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..trials {
            let mut idle = eligible_queues("proj", &inventory, &backoffs, &headroom);
            idle.shuffle(&mut rand::thread_rng());
            *counts.entry(idle[0].name.clone()).or_default() += 1;
        }
        let minimum = trials / 4;
        assert!(counts["q1"] >= minimum, "q1 starved: {counts:?}");
        assert!(counts["q2"] >= minimum, "q2 starved: {counts:?}");
    }

    #[test]
    fn test_capacity_filter() {
        let inventory = inventory_with(&["fits", "too_big", "unknown"]);
        inventory
            .set_profile("fits", ResourceAsk { cpus: 2, ..Default::default() })
            .unwrap();
        inventory
            .set_profile("too_big", ResourceAsk { cpus: 128, ..Default::default() })
            .unwrap();
        let backoffs = BackoffTable::new();
        let headroom = ResourceAsk { cpus: 4, ..Default::default() };

        let idle = eligible_queues("proj", &inventory, &backoffs, &headroom);
        let names: HashSet<String> = idle.into_iter().map(|r| r.name).collect();
        // A queue with no remembered profile skips the capacity check
        assert_eq!(
            names,
            HashSet::from(["fits".to_string(), "unknown".to_string()])
        );
    }

    #[test]
    fn test_inflight_queues_are_not_idle() {
        let inventory = inventory_with(&["q"]);
        inventory.adjust_inflight("q", 1);
        let backoffs = BackoffTable::new();
        assert!(eligible_queues("proj", &inventory, &backoffs, &big_headroom()).is_empty());
    }
}
