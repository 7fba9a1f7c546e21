//! In-process counters and their Prometheus text exposition.
//!
//! The pipeline increments labeled counters through [`MetricsRegistry`];
//! the HTTP endpoint is a thin exporter that renders the registry on demand.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

pub const CACHE_HITS: &str = "runner_cache_hits";
pub const CACHE_MISSES: &str = "runner_cache_misses";
pub const REFRESH_SUCCESS: &str = "queue_refresh_success";
pub const REFRESH_FAIL: &str = "queue_refresh_fail";

const HELP: &[(&str, &str)] = &[
    (CACHE_HITS, "Number of artifact fetches served from the local cache."),
    (CACHE_MISSES, "Number of artifact fetches that required a download."),
    (REFRESH_SUCCESS, "Number of successful queue inventory checks."),
    (REFRESH_FAIL, "Number of failed queue inventory checks."),
];

/// Monotonic counters keyed by metric name and rendered label set.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<&'static str, BTreeMap<String, u64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &'static str, labels: &[(&str, &str)]) {
        let mut counters = self.counters.lock().unwrap();
        *counters
            .entry(name)
            .or_default()
            .entry(render_labels(labels))
            .or_insert(0) += 1;
    }

    pub fn value(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters
            .get(name)
            .and_then(|series| series.get(&render_labels(labels)))
            .copied()
            .unwrap_or(0)
    }

    /// Render every counter into the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters = self.counters.lock().unwrap();
        let mut out = String::new();
        for (name, series) in counters.iter() {
            let help = HELP
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, h)| *h)
                .unwrap_or("Runner counter.");
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            for (labels, value) in series.iter() {
                out.push_str(&format!("{name}{labels} {value}\n"));
            }
        }
        out
    }
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let body = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

async fn metrics_text(State(registry): State<Arc<MetricsRegistry>>) -> String {
    registry.render()
}

/// Serves `/metrics` until the cancellation token fires.
pub async fn serve(
    registry: Arc<MetricsRegistry>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_text))
        .with_state(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("metrics exposition listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
