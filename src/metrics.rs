use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::Chain;

/// Counters describing what the tracker has done since start.
pub struct Metrics {
    registry: Registry,
    transfers_seen: IntCounterVec,
    transfers_qualified: IntCounterVec,
    notifications_sent: IntCounterVec,
    notifications_failed: IntCounterVec,
    fetch_failures: IntCounterVec,
    state_saves: IntCounter,
    state_save_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let by_chain = |name: &str, help: &str| -> Result<IntCounterVec, prometheus::Error> {
            let counter = IntCounterVec::new(Opts::new(name, help), &["chain"])?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let transfers_seen = by_chain(
            "tracker_transfers_seen_total",
            "Transfer ids added to the seen set",
        )?;
        let transfers_qualified = by_chain(
            "tracker_transfers_qualified_total",
            "New inbound transfers at or above the minimum amount",
        )?;
        let notifications_sent = by_chain(
            "tracker_notifications_sent_total",
            "Notifications accepted by the delivery channel",
        )?;
        let notifications_failed = by_chain(
            "tracker_notifications_failed_total",
            "Notifications the delivery channel rejected",
        )?;
        let fetch_failures = by_chain(
            "tracker_fetch_failures_total",
            "Index API calls that returned no usable data",
        )?;

        let state_saves = IntCounter::new("tracker_state_saves_total", "Successful state writes")?;
        registry.register(Box::new(state_saves.clone()))?;
        let state_save_failures =
            IntCounter::new("tracker_state_save_failures_total", "Failed state writes")?;
        registry.register(Box::new(state_save_failures.clone()))?;

        Ok(Self {
            registry,
            transfers_seen,
            transfers_qualified,
            notifications_sent,
            notifications_failed,
            fetch_failures,
            state_saves,
            state_save_failures,
        })
    }

    pub fn transfers_seen(&self, chain: Chain, count: usize) {
        self.transfers_seen
            .with_label_values(&[chain.key()])
            .inc_by(count as u64);
    }

    pub fn transfers_qualified(&self, chain: Chain, count: usize) {
        self.transfers_qualified
            .with_label_values(&[chain.key()])
            .inc_by(count as u64);
    }

    pub fn notification(&self, chain: Chain, delivered: bool) {
        let counter = if delivered {
            &self.notifications_sent
        } else {
            &self.notifications_failed
        };
        counter.with_label_values(&[chain.key()]).inc();
    }

    pub fn fetch_failure(&self, chain: Chain) {
        self.fetch_failures.with_label_values(&[chain.key()]).inc();
    }

    pub fn state_saved(&self, ok: bool) {
        if ok {
            self.state_saves.inc();
        } else {
            self.state_save_failures.inc();
        }
    }

    /// Prometheus text exposition of every counter.
    pub fn export(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
    }
}

/// Serves `GET /metrics` until `shutdown` fires.
pub fn start_metrics_server(metrics: Arc<Metrics>, port: u16, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { metrics.export() }
            }),
        );
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Metrics server could not bind {}: {}", addr, e);
                return;
            }
        };
        info!("Metrics server on {}", addr);
        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                if let Err(e) = result {
                    warn!("Metrics server stopped: {}", e);
                }
            }
            _ = shutdown.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.transfers_seen(Chain::Bsc, 3);
        metrics.notification(Chain::Tron, true);
        metrics.notification(Chain::Tron, false);
        metrics.state_saved(true);

        let text = metrics.export();
        assert!(text.contains(r#"tracker_transfers_seen_total{chain="bsc"} 3"#));
        assert!(text.contains(r#"tracker_notifications_sent_total{chain="tron"} 1"#));
        assert!(text.contains(r#"tracker_notifications_failed_total{chain="tron"} 1"#));
        assert!(text.contains("tracker_state_saves_total 1"));
    }

    #[test]
    fn instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.fetch_failure(Chain::Tron);
        assert!(!b.export().contains(r#"tracker_fetch_failures_total{chain="tron"} 1"#));
    }
}
