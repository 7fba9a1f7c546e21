use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Default suppression window for a queue that misbehaved.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// How often expired entries are swept out.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// A set of queues the scheduler must not touch until their entries expire.
/// Think of an entry as a negative signal with an expiry time.
#[derive(Default)]
pub struct BackoffTable {
    entries: Mutex<HashMap<String, Instant>>,
}

pub fn queue_key(project: &str, queue: &str) -> String {
    format!("{project}:{queue}")
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Instant::now() + ttl);
    }

    /// Whether `key` is currently suppressed.  Expired entries encountered
    /// on the way are dropped.
    pub fn active(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn purge(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Janitor sweeping expired entries until cancelled.
pub async fn run_purge(table: Arc<BackoffTable>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => table.purge(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let table = BackoffTable::new();
        table.set("p:q", Duration::from_millis(40));
        assert!(table.active("p:q"));
        assert!(!table.active("p:other"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!table.active("p:q"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_purge_sweeps_expired() {
        let table = BackoffTable::new();
        table.set("a", Duration::from_millis(10));
        table.set("b", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(30));
        table.purge();
        assert_eq!(table.len(), 1);
        assert!(table.active("b"));
    }
}
