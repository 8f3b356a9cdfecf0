//! Prometheus metrics for build orchestration.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build hook invocation.
pub fn hook_received(hook_type: &str) {
    counter!("ci_build_hooks_received_total", "hook" => hook_type.to_string()).increment(1);
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("ci_builds_total", "status" => status.to_string()).increment(1);
}

pub fn build_duration(duration_ms: u64) {
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}

/// Record a commit reaching its final verdict.
pub fn commit_verdict(verdict: &str) {
    counter!("ci_commit_verdicts_total", "verdict" => verdict.to_string()).increment(1);
}

/// Number of builds currently executing.
pub fn active_builds(count: usize) {
    gauge!("ci_active_builds").set(count as f64);
}

/// Record a build whose runner failed, as opposed to a failing build command.
pub fn runner_fault(builder: &str) {
    counter!("ci_build_runner_faults_total", "builder" => builder.to_string()).increment(1);
}

/// Record an error occurrence.
pub fn error_recorded(category: &str) {
    counter!("ci_errors_total", "category" => category.to_string()).increment(1);
}
