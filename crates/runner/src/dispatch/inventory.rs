use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::common::error::RunnerError;
use crate::common::hostname;
use crate::metrics::{MetricsRegistry, REFRESH_FAIL, REFRESH_SUCCESS};
use crate::notify::Notifier;
use crate::queue::QueueAdapter;
use crate::resources::ResourceAsk;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// One queue as the scheduler sees it: the resource profile learned from the
/// most recently handled message and how many experiments this agent is
/// running from it.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub name: String,
    pub profile: Option<ResourceAsk>,
    pub inflight: u32,
}

/// The catalog of known queues within one project.  Snapshotted for
/// iteration; the lock is never held across network calls.
#[derive(Default)]
pub struct Inventory {
    records: Mutex<HashMap<String, QueueRecord>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings the records in line with what the backend advertises and
    /// reports what appeared and what went away.
    pub fn align(&self, known: &HashSet<String>) -> (Vec<String>, Vec<String>) {
        let mut records = self.records.lock().unwrap();

        let mut added = Vec::new();
        for name in known {
            if !records.contains_key(name) {
                records.insert(
                    name.clone(),
                    QueueRecord { name: name.clone(), profile: None, inflight: 0 },
                );
                added.push(name.clone());
            }
        }

        let mut removed = Vec::new();
        records.retain(|name, _| {
            if known.contains(name) {
                true
            } else {
                removed.push(name.clone());
                false
            }
        });

        added.sort();
        removed.sort();
        (added, removed)
    }

    /// Queues sorted ascending by in-flight count, least loaded first.
    pub fn ranked(&self) -> Vec<QueueRecord> {
        let records = self.records.lock().unwrap();
        let mut ranked: Vec<QueueRecord> = records.values().cloned().collect();
        ranked.sort_by_key(|record| record.inflight);
        ranked
    }

    pub fn set_profile(&self, name: &str, profile: ResourceAsk) -> crate::Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(name)
            .ok_or_else(|| RunnerError::Generic(format!("queue {name} was not present")))?;
        record.profile = Some(profile);
        Ok(())
    }

    pub fn adjust_inflight(&self, name: &str, delta: i32) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(name) {
            record.inflight = record.inflight.saturating_add_signed(delta);
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps one project's inventory fresh until cancelled.
#[allow(clippy::too_many_arguments)]
pub async fn run_refresh(
    project: String,
    adapter: Arc<dyn QueueAdapter>,
    matcher: Regex,
    inventory: Arc<Inventory>,
    interval: Duration,
    metrics: Arc<MetricsRegistry>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    let host = hostname();
    // The first refresh happens quickly so a fresh project starts serving
    // its queues without waiting out a full interval
    let mut pause = Duration::from_secs(1).min(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(pause) => {}
        }
        pause = interval;

        let known = match adapter.refresh(&matcher, REFRESH_TIMEOUT).await {
            Ok(known) => known,
            Err(err) => {
                metrics.inc(REFRESH_FAIL, &[("host", &host), ("project", &project)]);
                log::warn!("unable to refresh queue manifest for {project}: {err}");
                continue;
            }
        };
        metrics.inc(REFRESH_SUCCESS, &[("host", &host), ("project", &project)]);
        log::debug!("on refresh got {known:?}");

        let (added, removed) = inventory.align(&known);
        let mut notice = String::new();
        if !added.is_empty() {
            notice.push_str(&format!("added queues {}", added.join(", ")));
        }
        if !removed.is_empty() {
            if !notice.is_empty() {
                notice.push_str(", and ");
            }
            notice.push_str(&format!("removed queues {}", removed.join(", ")));
        }
        if !notice.is_empty() {
            let msg = format!("project {project} {notice}");
            log::info!("{msg}");
            notifier.info("", &msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_tracks_additions_and_removals() {
        let inventory = Inventory::new();
        let known: HashSet<String> =
            ["rmq_a".to_string(), "rmq_b".to_string()].into_iter().collect();
        let (added, removed) = inventory.align(&known);
        assert_eq!(added, vec!["rmq_a", "rmq_b"]);
        assert!(removed.is_empty());

        let next: HashSet<String> =
            ["rmq_b".to_string(), "rmq_c".to_string()].into_iter().collect();
        let (added, removed) = inventory.align(&next);
        assert_eq!(added, vec!["rmq_c"]);
        assert_eq!(removed, vec!["rmq_a"]);
        assert_eq!(inventory.len(), 2);
    }

    #[test]
    fn test_removal_forgets_profile() {
        let inventory = Inventory::new();
        let known: HashSet<String> = ["q".to_string()].into_iter().collect();
        inventory.align(&known);
        inventory
            .set_profile("q", ResourceAsk { cpus: 2, ..Default::default() })
            .unwrap();

        inventory.align(&HashSet::new());
        inventory.align(&known);
        assert!(inventory.ranked()[0].profile.is_none());
    }

    #[test]
    fn test_ranked_orders_by_inflight() {
        let inventory = Inventory::new();
        let known: HashSet<String> = ["a".to_string(), "b".to_string(), "c".to_string()]
            .into_iter()
            .collect();
        inventory.align(&known);
        inventory.adjust_inflight("a", 2);
        inventory.adjust_inflight("c", 1);

        let ranked = inventory.ranked();
        assert_eq!(ranked[0].name, "b");
        assert_eq!(ranked[1].name, "c");
        assert_eq!(ranked[2].name, "a");
    }

    #[test]
    fn test_set_profile_requires_known_queue() {
        let inventory = Inventory::new();
        assert!(inventory
            .set_profile("ghost", ResourceAsk::default())
            .is_err());
    }
}
