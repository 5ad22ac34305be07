//! Server runtime status tracking
//!
//! Uptime, request counts and per-route usage, reported by `GET /status`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clipserve_embeddings::MetricsSnapshot;

/// Server runtime status tracking
pub struct ServerStatus {
    /// When the server started
    started_at: Instant,
    /// Total requests processed
    request_count: AtomicU64,
    /// Requests per route
    route_calls: DashMap<String, u64>,
    /// Failed requests
    error_count: AtomicU64,
    /// Requests rejected because the model was not loaded
    unavailable_count: AtomicU64,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            request_count: AtomicU64::new(0),
            route_calls: DashMap::new(),
            error_count: AtomicU64::new(0),
            unavailable_count: AtomicU64::new(0),
        }
    }

    fn count_route(&self, route: &str) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.route_calls
            .entry(route.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    /// Record a successful request
    pub fn record_success(&self, route: &str) {
        self.count_route(route);
    }

    /// Record a failed request
    pub fn record_error(&self, route: &str) {
        self.count_route(route);
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request rejected by the readiness gate
    pub fn record_unavailable(&self, route: &str) {
        self.count_route(route);
        self.unavailable_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn unavailable_count(&self) -> u64 {
        self.unavailable_count.load(Ordering::Relaxed)
    }

    /// Route call counts sorted by count descending
    pub fn route_call_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<_> = self
            .route_calls
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    /// Format uptime as human-readable string
    pub fn format_uptime(&self) -> String {
        let total_secs = self.uptime().as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let secs = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }

    /// Snapshot for the status endpoint
    pub fn report(&self, inference: Option<MetricsSnapshot>) -> StatusReport {
        StatusReport {
            uptime: self.format_uptime(),
            uptime_secs: self.uptime().as_secs(),
            total_requests: self.request_count(),
            errors: self.error_count(),
            unavailable: self.unavailable_count(),
            routes: self
                .route_call_counts()
                .into_iter()
                .map(|(route, calls)| RouteCount { route, calls })
                .collect(),
            inference: inference.map(InferenceStats::from),
        }
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteCount {
    pub route: String,
    pub calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceStats {
    pub embeddings: u64,
    pub failures: u64,
    pub average_inference_ms: f64,
}

impl From<MetricsSnapshot> for InferenceStats {
    fn from(m: MetricsSnapshot) -> Self {
        Self {
            embeddings: m.total_embeddings,
            failures: m.total_failures,
            average_inference_ms: m.average_inference_ms,
        }
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime: String,
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub errors: u64,
    pub unavailable: u64,
    pub routes: Vec<RouteCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_status_new() {
        let status = ServerStatus::new();
        assert_eq!(status.request_count(), 0);
        assert_eq!(status.error_count(), 0);
        assert!(status.route_call_counts().is_empty());
    }

    #[test]
    fn test_record_calls() {
        let status = ServerStatus::new();
        status.record_success("/extract-features");
        status.record_success("/extract-features");
        status.record_error("/extract-features-batch");
        status.record_unavailable("/extract-features");

        assert_eq!(status.request_count(), 4);
        assert_eq!(status.error_count(), 1);
        assert_eq!(status.unavailable_count(), 1);

        let counts = status.route_call_counts();
        assert_eq!(counts[0], ("/extract-features".to_string(), 3));
        assert_eq!(counts[1], ("/extract-features-batch".to_string(), 1));
    }

    #[test]
    fn test_format_uptime() {
        let status = ServerStatus::new();
        assert!(status.format_uptime().ends_with('s'));
    }

    #[test]
    fn test_report_without_engine() {
        let status = ServerStatus::new();
        status.record_success("/health");

        let json = serde_json::to_value(status.report(None)).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["routes"][0]["route"], "/health");
        assert!(json.get("inference").is_none());
    }
}
