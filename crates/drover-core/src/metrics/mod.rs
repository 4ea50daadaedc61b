//! Prometheus metrics for agent observability.
//!
//! Counters are registered with a [`prometheus::Registry`] and exported in
//! Prometheus text format; the daemon serves the encoded output from its
//! `/metrics` endpoint.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Counters describing agent activity.
///
/// All metrics use interior mutability and are safe to share across
/// threads. The struct is `Clone`, `Send`, and `Sync`.
#[derive(Clone)]
pub struct AgentMetrics {
    /// Reconcile passes executed.
    reconciles_total: IntCounter,

    /// Generator invocations, including ones that failed.
    renders_total: IntCounter,

    /// Environment snapshots or generator invocations that failed.
    render_failures_total: IntCounter,

    /// Reconciles that matched the running fingerprint and did no work.
    unchanged_total: IntCounter,

    /// Proxy epochs that reached running.
    epochs_started_total: IntCounter,

    /// Proxy launches that failed before exec.
    spawn_failures_total: IntCounter,

    /// Proxy exits inside the startup window.
    startup_failures_total: IntCounter,

    /// Proxy exits after stabilization.
    proxy_crashes_total: IntCounter,

    /// Back-off retries scheduled.
    retries_scheduled_total: IntCounter,
}

impl AgentMetrics {
    /// Creates new agent metrics and registers them with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate
    /// name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let reconciles_total =
            IntCounter::new("drover_reconciles_total", "Reconcile passes executed")?;
        registry.register(Box::new(reconciles_total.clone()))?;

        let renders_total = IntCounter::new("drover_renders_total", "Generator invocations")?;
        registry.register(Box::new(renders_total.clone()))?;

        let render_failures_total = IntCounter::new(
            "drover_render_failures_total",
            "Environment snapshots or generator invocations that failed",
        )?;
        registry.register(Box::new(render_failures_total.clone()))?;

        let unchanged_total = IntCounter::new(
            "drover_unchanged_total",
            "Reconciles that matched the running fingerprint",
        )?;
        registry.register(Box::new(unchanged_total.clone()))?;

        let epochs_started_total = IntCounter::new(
            "drover_epochs_started_total",
            "Proxy epochs that reached running",
        )?;
        registry.register(Box::new(epochs_started_total.clone()))?;

        let spawn_failures_total = IntCounter::new(
            "drover_spawn_failures_total",
            "Proxy launches that failed before exec",
        )?;
        registry.register(Box::new(spawn_failures_total.clone()))?;

        let startup_failures_total = IntCounter::new(
            "drover_startup_failures_total",
            "Proxy exits inside the startup window",
        )?;
        registry.register(Box::new(startup_failures_total.clone()))?;

        let proxy_crashes_total = IntCounter::new(
            "drover_proxy_crashes_total",
            "Proxy exits after stabilization",
        )?;
        registry.register(Box::new(proxy_crashes_total.clone()))?;

        let retries_scheduled_total = IntCounter::new(
            "drover_retries_scheduled_total",
            "Back-off retries scheduled",
        )?;
        registry.register(Box::new(retries_scheduled_total.clone()))?;

        Ok(Self {
            reconciles_total,
            renders_total,
            render_failures_total,
            unchanged_total,
            epochs_started_total,
            spawn_failures_total,
            startup_failures_total,
            proxy_crashes_total,
            retries_scheduled_total,
        })
    }

    /// Records a reconcile pass.
    pub fn inc_reconciles(&self) {
        self.reconciles_total.inc();
    }

    /// Returns the total reconcile passes.
    #[must_use]
    pub fn reconciles(&self) -> u64 {
        self.reconciles_total.get()
    }

    /// Records a generator invocation.
    pub fn inc_renders(&self) {
        self.renders_total.inc();
    }

    /// Returns the total generator invocations.
    #[must_use]
    pub fn renders(&self) -> u64 {
        self.renders_total.get()
    }

    /// Records a failed snapshot or render.
    pub fn inc_render_failures(&self) {
        self.render_failures_total.inc();
    }

    /// Returns the total failed snapshots and renders.
    #[must_use]
    pub fn render_failures(&self) -> u64 {
        self.render_failures_total.get()
    }

    /// Records a fingerprint-match no-op.
    pub fn inc_unchanged(&self) {
        self.unchanged_total.inc();
    }

    /// Returns the total fingerprint-match no-ops.
    #[must_use]
    pub fn unchanged(&self) -> u64 {
        self.unchanged_total.get()
    }

    /// Records an epoch reaching running.
    pub fn inc_epochs_started(&self) {
        self.epochs_started_total.inc();
    }

    /// Returns the total epochs that reached running.
    #[must_use]
    pub fn epochs_started(&self) -> u64 {
        self.epochs_started_total.get()
    }

    /// Records a failed proxy launch.
    pub fn inc_spawn_failures(&self) {
        self.spawn_failures_total.inc();
    }

    /// Returns the total failed proxy launches.
    #[must_use]
    pub fn spawn_failures(&self) -> u64 {
        self.spawn_failures_total.get()
    }

    /// Records an exit inside the startup window.
    pub fn inc_startup_failures(&self) {
        self.startup_failures_total.inc();
    }

    /// Returns the total exits inside the startup window.
    #[must_use]
    pub fn startup_failures(&self) -> u64 {
        self.startup_failures_total.get()
    }

    /// Records a post-stabilization crash.
    pub fn inc_proxy_crashes(&self) {
        self.proxy_crashes_total.inc();
    }

    /// Returns the total post-stabilization crashes.
    #[must_use]
    pub fn proxy_crashes(&self) -> u64 {
        self.proxy_crashes_total.get()
    }

    /// Records a scheduled back-off retry.
    pub fn inc_retries_scheduled(&self) {
        self.retries_scheduled_total.inc();
    }

    /// Returns the total scheduled back-off retries.
    #[must_use]
    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled_total.get()
    }
}

/// Metrics registry wrapper that holds the Prometheus registry and agent
/// metrics.
///
/// This is the main entry point for metrics: it creates and registers all
/// agent counters and exports them in Prometheus text format.
#[derive(Clone)]
pub struct MetricsRegistry {
    /// The Prometheus registry.
    registry: Registry,

    /// Agent metrics registered with this registry.
    agent_metrics: AgentMetrics,
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all agent metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let agent_metrics = AgentMetrics::new(&registry)?;
        Ok(Self {
            registry,
            agent_metrics,
        })
    }

    /// Returns a reference to the agent metrics.
    #[must_use]
    pub const fn agent_metrics(&self) -> &AgentMetrics {
        &self.agent_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// This is the format expected by Prometheus scrapers and can be
    /// returned directly from the `/metrics` HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    /// Returns the underlying Prometheus registry.
    ///
    /// This is useful for registering additional custom metrics.
    #[must_use]
    pub const fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }
}

/// Shared metrics registry for use across the agent and daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().expect("registry creation should succeed");
        assert!(registry.encode_text().is_ok());
    }

    #[test]
    fn test_counters_increment() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.agent_metrics();

        metrics.inc_reconciles();
        metrics.inc_reconciles();
        metrics.inc_epochs_started();

        assert_eq!(metrics.reconciles(), 2);
        assert_eq!(metrics.epochs_started(), 1);
        assert_eq!(metrics.proxy_crashes(), 0);
    }

    #[test]
    fn test_metrics_text_encoding() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.agent_metrics();

        metrics.inc_renders();

        let output = registry.encode_text().unwrap();
        assert!(
            output.contains("# TYPE drover_renders_total counter"),
            "missing renders_total type line"
        );
        assert!(output.contains("drover_renders_total 1"));
        assert!(output.contains("drover_reconciles_total 0"));
        assert!(output.contains("drover_retries_scheduled_total"));
    }

    #[test]
    fn test_two_registries_do_not_interfere() {
        let first = MetricsRegistry::new().unwrap();
        let second = MetricsRegistry::new().unwrap();

        first.agent_metrics().inc_reconciles();
        assert_eq!(first.agent_metrics().reconciles(), 1);
        assert_eq!(second.agent_metrics().reconciles(), 0);
    }

    #[test]
    fn test_shared_registry() {
        let registry = new_shared_registry().unwrap();
        registry.agent_metrics().inc_unchanged();
        assert_eq!(registry.agent_metrics().unchanged(), 1);
    }
}
