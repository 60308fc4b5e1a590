//! Per-project query metrics and health derivation.
//!
//! The monitor keeps a rolling window of the last 100 latency samples per
//! project plus error and cache counters, and derives a status with simple
//! thresholds. Percentile math on small windows is deliberately blunt: with
//! fewer than 20 samples p95 and p99 both report the window maximum.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Rolling latency window size.
pub const LATENCY_WINDOW: usize = 100;

/// Below this many samples, p95/p99 report the maximum.
const SMALL_WINDOW: usize = 20;

/// Three-state health classification. Backends only ever report healthy or
/// unhealthy; degraded comes from latency thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Serving, but slow.
    Degraded,
    /// Failing or unreachable.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Default)]
struct ProjectMetrics {
    latencies: VecDeque<f64>,
    total_queries: u64,
    errors: u64,
    cache_hits: u64,
    cache_misses: u64,
    last_query: Option<DateTime<Utc>>,
    document_count: Option<usize>,
}

/// Derived health report for one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectHealth {
    /// Project identifier.
    pub project_id: String,
    /// Derived status.
    pub status: HealthStatus,
    /// Total recorded queries.
    pub total_queries: u64,
    /// Failed queries.
    pub errors: u64,
    /// `errors / total_queries`.
    pub error_rate: f64,
    /// `hits / (hits + misses)`.
    pub cache_hit_rate: f64,
    /// Mean latency over the window, in milliseconds.
    pub avg_latency_ms: f64,
    /// 95th-percentile latency over the window.
    pub p95_latency_ms: f64,
    /// 99th-percentile latency over the window.
    pub p99_latency_ms: f64,
    /// RFC3339 timestamp of the last recorded query.
    pub last_query_at: Option<String>,
    /// Last reported document count, if recorded.
    pub document_count: Option<usize>,
    /// Human-readable alerts.
    pub alerts: Vec<String>,
}

/// Records per-project query metrics and computes status.
pub struct HealthMonitor {
    projects: Mutex<HashMap<String, ProjectMetrics>>,
}

impl HealthMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Records one query outcome.
    pub fn record_query(&self, project_id: &str, latency_ms: f64, success: bool, cache_hit: bool) {
        let mut projects = self.projects.lock();
        let metrics = projects.entry(project_id.to_string()).or_default();

        metrics.total_queries += 1;
        if !success {
            metrics.errors += 1;
        }
        if cache_hit {
            metrics.cache_hits += 1;
        } else {
            metrics.cache_misses += 1;
        }
        metrics.latencies.push_back(latency_ms);
        while metrics.latencies.len() > LATENCY_WINDOW {
            metrics.latencies.pop_front();
        }
        metrics.last_query = Some(Utc::now());
    }

    /// Records the project's current document count, feeding the
    /// empty-knowledge-base alert.
    pub fn record_document_count(&self, project_id: &str, count: usize) {
        let mut projects = self.projects.lock();
        projects
            .entry(project_id.to_string())
            .or_default()
            .document_count = Some(count);
    }

    /// Health for one project. Unknown projects report zeroed, healthy
    /// metrics.
    #[must_use]
    pub fn get_project_health(&self, project_id: &str) -> ProjectHealth {
        let projects = self.projects.lock();
        projects.get(project_id).map_or_else(
            || empty_health(project_id),
            |metrics| derive_health(project_id, metrics),
        )
    }

    /// Health for every tracked project, sorted by project id.
    #[must_use]
    pub fn get_all_projects_health(&self) -> Vec<ProjectHealth> {
        let projects = self.projects.lock();
        let mut out: Vec<ProjectHealth> = projects
            .iter()
            .map(|(id, metrics)| derive_health(id, metrics))
            .collect();
        out.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        out
    }

    /// Resets one project's metrics, or every project's when `None`.
    pub fn reset_metrics(&self, project_id: Option<&str>) {
        let mut projects = self.projects.lock();
        match project_id {
            Some(id) => {
                projects.remove(id);
            }
            None => projects.clear(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_health(project_id: &str) -> ProjectHealth {
    ProjectHealth {
        project_id: project_id.to_string(),
        status: HealthStatus::Healthy,
        total_queries: 0,
        errors: 0,
        error_rate: 0.0,
        cache_hit_rate: 0.0,
        avg_latency_ms: 0.0,
        p95_latency_ms: 0.0,
        p99_latency_ms: 0.0,
        last_query_at: None,
        document_count: None,
        alerts: Vec::new(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn derive_health(project_id: &str, metrics: &ProjectMetrics) -> ProjectHealth {
    let mut sorted: Vec<f64> = metrics.latencies.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let avg = if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<f64>() / sorted.len() as f64
    };
    let p95 = percentile(&sorted, 0.95);
    let p99 = percentile(&sorted, 0.99);

    let error_rate = if metrics.total_queries == 0 {
        0.0
    } else {
        metrics.errors as f64 / metrics.total_queries as f64
    };
    let cache_total = metrics.cache_hits + metrics.cache_misses;
    let cache_hit_rate = if cache_total == 0 {
        0.0
    } else {
        metrics.cache_hits as f64 / cache_total as f64
    };

    let status = if error_rate > 0.5 {
        HealthStatus::Unhealthy
    } else if avg > 500.0 || p99 > 1000.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let mut alerts = Vec::new();
    if avg > 500.0 {
        alerts.push(format!("average latency {avg:.0}ms exceeds 500ms"));
    }
    if error_rate > 0.1 {
        alerts.push(format!("error rate {:.0}% exceeds 10%", error_rate * 100.0));
    }
    if metrics.total_queries >= 10 && cache_hit_rate < 0.5 {
        alerts.push(format!(
            "cache hit rate {:.0}% below 50%",
            cache_hit_rate * 100.0
        ));
    }
    if let Some(last) = metrics.last_query {
        if Utc::now().signed_duration_since(last).num_minutes() > 60 {
            alerts.push("no queries in over 60 minutes".to_string());
        }
    }
    if metrics.document_count == Some(0) {
        alerts.push("knowledge base has no documents".to_string());
    }

    ProjectHealth {
        project_id: project_id.to_string(),
        status,
        total_queries: metrics.total_queries,
        errors: metrics.errors,
        error_rate,
        cache_hit_rate,
        avg_latency_ms: avg,
        p95_latency_ms: p95,
        p99_latency_ms: p99,
        last_query_at: metrics.last_query.map(|t| t.to_rfc3339()),
        document_count: metrics.document_count,
        alerts,
    }
}

/// Percentile by sort-and-index over an already sorted window. Windows
/// smaller than [`SMALL_WINDOW`] return the maximum.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() < SMALL_WINDOW {
        return sorted.last().copied().unwrap_or(0.0);
    }
    let idx = ((sorted.len() as f64 * p).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_project_is_healthy_and_zeroed() {
        let monitor = HealthMonitor::new();
        let health = monitor.get_project_health("nobody");
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.total_queries, 0);
        assert!(health.alerts.is_empty());
    }

    #[test]
    fn test_counters_and_rates() {
        let monitor = HealthMonitor::new();
        monitor.record_query("p", 10.0, true, true);
        monitor.record_query("p", 20.0, true, false);
        monitor.record_query("p", 30.0, false, false);

        let health = monitor.get_project_health("p");
        assert_eq!(health.total_queries, 3);
        assert_eq!(health.errors, 1);
        assert!((health.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((health.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((health.avg_latency_ms - 20.0).abs() < 1e-9);
        assert!(health.last_query_at.is_some());
    }

    #[test]
    fn test_small_window_percentiles_are_max() {
        let monitor = HealthMonitor::new();
        for latency in [5.0, 50.0, 10.0] {
            monitor.record_query("p", latency, true, false);
        }
        let health = monitor.get_project_health("p");
        assert!((health.p95_latency_ms - 50.0).abs() < 1e-9);
        assert!((health.p99_latency_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_large_window_percentiles() {
        let monitor = HealthMonitor::new();
        for i in 1..=100 {
            monitor.record_query("p", f64::from(i), true, false);
        }
        let health = monitor.get_project_health("p");
        assert!((health.p95_latency_ms - 95.0).abs() < 1e-9);
        assert!((health.p99_latency_ms - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let monitor = HealthMonitor::new();
        for _ in 0..250 {
            monitor.record_query("p", 1.0, true, false);
        }
        let projects = monitor.projects.lock();
        assert_eq!(projects["p"].latencies.len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_status_unhealthy_on_errors() {
        let monitor = HealthMonitor::new();
        for i in 0..10 {
            monitor.record_query("p", 10.0, i >= 6, false);
        }
        let health = monitor.get_project_health("p");
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.alerts.iter().any(|a| a.contains("error rate")));
    }

    #[test]
    fn test_status_degraded_on_latency() {
        let monitor = HealthMonitor::new();
        for _ in 0..5 {
            monitor.record_query("p", 900.0, true, false);
        }
        let health = monitor.get_project_health("p");
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.alerts.iter().any(|a| a.contains("latency")));
    }

    #[test]
    fn test_empty_project_alert() {
        let monitor = HealthMonitor::new();
        monitor.record_document_count("p", 0);
        let health = monitor.get_project_health("p");
        assert!(health.alerts.iter().any(|a| a.contains("no documents")));

        monitor.record_document_count("p", 5);
        let health = monitor.get_project_health("p");
        assert!(!health.alerts.iter().any(|a| a.contains("no documents")));
    }

    #[test]
    fn test_low_hit_rate_alert_needs_ten_queries() {
        let monitor = HealthMonitor::new();
        for _ in 0..9 {
            monitor.record_query("p", 1.0, true, false);
        }
        assert!(monitor
            .get_project_health("p")
            .alerts
            .iter()
            .all(|a| !a.contains("hit rate")));

        monitor.record_query("p", 1.0, true, false);
        assert!(monitor
            .get_project_health("p")
            .alerts
            .iter()
            .any(|a| a.contains("hit rate")));
    }

    #[test]
    fn test_reset_metrics() {
        let monitor = HealthMonitor::new();
        monitor.record_query("a", 1.0, true, false);
        monitor.record_query("b", 1.0, true, false);

        monitor.reset_metrics(Some("a"));
        assert_eq!(monitor.get_project_health("a").total_queries, 0);
        assert_eq!(monitor.get_project_health("b").total_queries, 1);

        monitor.reset_metrics(None);
        assert!(monitor.get_all_projects_health().is_empty());
    }

    #[test]
    fn test_all_projects_sorted() {
        let monitor = HealthMonitor::new();
        monitor.record_query("zeta", 1.0, true, false);
        monitor.record_query("alpha", 1.0, true, false);
        let all = monitor.get_all_projects_health();
        assert_eq!(all[0].project_id, "alpha");
        assert_eq!(all[1].project_id, "zeta");
    }
}
