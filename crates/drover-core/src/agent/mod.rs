//! The reconcile worker.
//!
//! One logical worker drains three input sources (reconcile inbox, retry
//! timer, exit channel) and is the only writer of the epoch table. Nothing
//! here blocks beyond the suspension points of one reconcile pass: the
//! select itself, the rate-limit wakeup, rendering, the filesystem
//! write-rename, fork+exec, and the post-start stabilization timer.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactStore, Generator, RenderError, Rendered};
use crate::budget::RetryBudget;
use crate::config::AgentConfig;
use crate::environment::{Discovery, NodeIdentity};
use crate::epoch::{Epoch, EpochRecord, EpochStatus, EpochTable};
use crate::metrics::{AgentMetrics, MetricsError, SharedMetricsRegistry, new_shared_registry};
use crate::ratelimit::TokenBucket;
use crate::supervisor::{ProxyExit, ProxySupervisor};

/// A payloadless hint that the environment may have changed.
///
/// Requests are coalesced: any number of them arriving inside one
/// rate-limit window produce at most one generator invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileRequest;

/// Fatal errors surfaced to the host, which decides process exit.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Too many consecutive transient failures.
    #[error("retry budget exhausted after {failures} consecutive failures")]
    BudgetExhausted {
        /// Consecutive failures at the point of exhaustion.
        failures: u32,
    },
}

/// Handles the host uses to feed and stop a running agent.
pub struct AgentHandles {
    /// Posting side of the reconcile inbox.
    pub inbox: mpsc::Sender<ReconcileRequest>,

    /// Shutdown signal; send `true` to begin graceful termination.
    pub shutdown: watch::Sender<bool>,

    /// The agent's metrics registry, ready for text encoding.
    pub metrics: SharedMetricsRegistry,
}

/// The epoch currently expected to be serving.
struct CurrentEpoch {
    epoch: Epoch,
    rendered: Rendered,
}

/// What a scheduled retry should do when it fires.
enum RetryKind {
    /// Snapshot the environment and render afresh.
    Render,

    /// Re-apply already-rendered bytes under a new epoch.
    Reapply(Rendered),
}

/// The proxy configuration agent.
///
/// Constructed with [`Agent::new`], driven by [`Agent::run`] until shutdown
/// or a fatal error.
pub struct Agent {
    config: AgentConfig,
    node: NodeIdentity,
    discovery: Arc<dyn Discovery>,
    store: ArtifactStore,
    supervisor: ProxySupervisor,
    table: EpochTable,
    limiter: TokenBucket,
    budget: RetryBudget,
    metrics: AgentMetrics,

    inbox_rx: mpsc::Receiver<ReconcileRequest>,
    exit_rx: mpsc::Receiver<ProxyExit>,
    shutdown_rx: watch::Receiver<bool>,

    current: Option<CurrentEpoch>,
    gate_wakeup: Option<Instant>,
    retry_at: Option<(Instant, RetryKind)>,
    stabilize_at: Option<(Instant, Epoch)>,
}

impl Agent {
    /// Create an agent and the handles for driving it.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if metric registration fails.
    pub fn new(
        config: AgentConfig,
        node: NodeIdentity,
        discovery: Arc<dyn Discovery>,
        generator: Generator,
    ) -> Result<(Self, AgentHandles), MetricsError> {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = new_shared_registry()?;

        let agent = Self {
            supervisor: ProxySupervisor::new(&config, exit_tx),
            store: ArtifactStore::new(config.scratch_dir.clone(), generator),
            limiter: TokenBucket::new(config.rate_limit.rate, config.rate_limit.burst),
            budget: RetryBudget::new(config.retry_budget, config.retry_window),
            table: EpochTable::new(),
            metrics: registry.agent_metrics().clone(),
            config,
            node,
            discovery,
            inbox_rx,
            exit_rx,
            shutdown_rx,
            current: None,
            gate_wakeup: None,
            retry_at: None,
            stabilize_at: None,
        };

        let handles = AgentHandles {
            inbox: inbox_tx,
            shutdown: shutdown_tx,
            metrics: registry,
        };
        Ok((agent, handles))
    }

    /// Run the reconcile loop until shutdown or a fatal error.
    ///
    /// Either way, all live epochs are stopped before this returns, with
    /// teardown bounded by the parent-shutdown ceiling.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::BudgetExhausted` when consecutive transient
    /// failures exceed the configured budget.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let swept = self.store.sweep();
        if swept > 0 {
            info!(files = swept, "removed stale configuration files at startup");
        }

        let result = self.event_loop().await;
        if let Err(err) = &result {
            error!(error = %err, "agent terminating on fatal error");
        }
        self.teardown().await;
        result
    }

    async fn event_loop(&mut self) -> Result<(), AgentError> {
        loop {
            let gate_deadline = self.gate_wakeup;
            let retry_deadline = self.retry_at.as_ref().map(|(at, _)| *at);
            let stabilize_deadline = self.stabilize_at.map(|(at, _)| at);

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return Ok(());
                    }
                },

                Some(exit) = self.exit_rx.recv() => {
                    self.handle_exit(exit)?;
                },

                () = sleep_until_opt(stabilize_deadline) => {
                    self.handle_stabilized();
                },

                () = sleep_until_opt(retry_deadline) => {
                    let (_, kind) = self.retry_at.take().expect("retry deadline without retry");
                    match kind {
                        RetryKind::Render => self.reconcile(None).await?,
                        RetryKind::Reapply(rendered) => self.reconcile(Some(rendered)).await?,
                    }
                },

                () = sleep_until_opt(gate_deadline) => {
                    // The wakeup's token was reserved when it was scheduled.
                    self.gate_wakeup = None;
                    self.reconcile(None).await?;
                },

                Some(ReconcileRequest) = self.inbox_rx.recv() => {
                    // Collapse the rest of the burst before deciding anything.
                    while self.inbox_rx.try_recv().is_ok() {}
                    self.on_request().await?;
                },
            }
        }
    }

    /// Gate one coalesced batch of reconcile requests through the bucket.
    async fn on_request(&mut self) -> Result<(), AgentError> {
        if self.gate_wakeup.is_some() {
            debug!("reconcile request coalesced behind pending wakeup");
            return Ok(());
        }
        if self.limiter.allow_now() {
            self.reconcile(None).await
        } else {
            let wait = self.limiter.reserve();
            self.gate_wakeup = Some(Instant::now() + wait);
            debug!(wait_ms = wait.as_millis() as u64, "rate limited, wakeup scheduled");
            Ok(())
        }
    }

    /// One reconcile pass. `reapply` short-circuits snapshot and render
    /// with already-rendered bytes (crash recovery, spawn retries).
    async fn reconcile(&mut self, reapply: Option<Rendered>) -> Result<(), AgentError> {
        self.metrics.inc_reconciles();

        let rendered = match reapply {
            Some(rendered) => rendered,
            None => match self.render_fresh() {
                Ok(Some(rendered)) => rendered,
                Ok(None) => return Ok(()),
                Err(failure) => return self.on_transient_failure(failure, None),
            },
        };

        // No work when the serving epoch already carries these bytes.
        if let Some(current) = &self.current {
            if current.rendered.fingerprint == rendered.fingerprint {
                debug!(
                    epoch = %current.epoch,
                    fingerprint = %rendered.fingerprint,
                    "fingerprint unchanged",
                );
                self.metrics.inc_unchanged();
                return Ok(());
            }
        }

        let epoch = self.table.allocate();
        let artifact = match self.store.materialize(epoch, &rendered) {
            Ok(artifact) => artifact,
            Err(err) => {
                return self.on_transient_failure(
                    Failure::new("materialize", err.to_string()),
                    Some(rendered),
                );
            },
        };

        self.table.insert(EpochRecord::new(epoch, artifact.clone()));

        let handle = match self.supervisor.start(epoch, &artifact) {
            Ok(handle) => handle,
            Err(err) => {
                self.metrics.inc_spawn_failures();
                self.table.transition(
                    epoch,
                    EpochStatus::Failed {
                        reason: err.to_string(),
                    },
                );
                return self
                    .on_transient_failure(Failure::new("spawn", err.to_string()), Some(rendered));
            },
        };

        // The proxy's restart protocol guarantees a newer epoch takes over
        // bindings, so Running is entered without awaiting readiness; the
        // stabilization timer classifies an early death as startup failure.
        {
            let record = self.table.get_mut(epoch).expect("record just inserted");
            record.proc = Some(handle);
            record.started_at = std::time::Instant::now();
        }
        self.table.transition(epoch, EpochStatus::Running);
        self.metrics.inc_epochs_started();

        // Overlap before drain: older epochs start draining only now.
        let superseded: Vec<Epoch> = self
            .table
            .records()
            .filter(|r| r.epoch != epoch && matches!(r.status, EpochStatus::Running))
            .map(|r| r.epoch)
            .collect();
        for old in superseded {
            self.table.transition(old, EpochStatus::Draining);
            if let Some(proc) = self.table.get(old).and_then(|r| r.proc.clone()) {
                self.supervisor.stop(&proc, true);
            }
            debug!(epoch = %old, "superseded epoch draining");
        }

        let fingerprint = rendered.fingerprint;
        self.current = Some(CurrentEpoch { epoch, rendered });
        self.stabilize_at = Some((Instant::now() + self.config.stabilization_delay, epoch));
        self.cleanup_superseded();

        info!(
            epoch = %epoch,
            fingerprint = %fingerprint,
            retries = self.budget.consecutive_failures(),
            "reconcile applied",
        );
        Ok(())
    }

    /// Snapshot the environment and render. `Ok(None)` means a permanent
    /// failure was logged and the running epoch must be left alone.
    fn render_fresh(&mut self) -> Result<Option<Rendered>, Failure> {
        let environment = match self.discovery.snapshot(&self.node) {
            Ok(environment) => environment,
            Err(err) => {
                self.metrics.inc_render_failures();
                return Err(Failure::new("snapshot", err.to_string()));
            },
        };

        self.metrics.inc_renders();
        match self.store.render(&environment, &self.node) {
            Ok(rendered) => Ok(Some(rendered)),
            Err(RenderError::Permanent(reason)) => {
                self.metrics.inc_render_failures();
                let (epoch, fingerprint) = self.current_labels();
                error!(
                    reason = %reason,
                    epoch = %epoch,
                    fingerprint = %fingerprint,
                    retries = self.budget.consecutive_failures(),
                    "permanent render failure, keeping running configuration",
                );
                Ok(None)
            },
            Err(err) => {
                self.metrics.inc_render_failures();
                Err(Failure::new("render", err.to_string()))
            },
        }
    }

    /// Consume budget for a transient failure and either schedule a retry
    /// or surface exhaustion as fatal.
    fn on_transient_failure(
        &mut self,
        failure: Failure,
        reapply: Option<Rendered>,
    ) -> Result<(), AgentError> {
        let (epoch, fingerprint) = self.current_labels();

        if !self.budget.consume() {
            let failures = self.budget.consecutive_failures();
            error!(
                stage = failure.stage,
                reason = %failure.reason,
                epoch = %epoch,
                fingerprint = %fingerprint,
                retries = failures,
                "retry budget exhausted",
            );
            return Err(AgentError::BudgetExhausted { failures });
        }

        let attempt = self.budget.consecutive_failures();
        let delay = self.config.backoff.delay_for_attempt(attempt);
        self.metrics.inc_retries_scheduled();
        let kind = match reapply {
            Some(rendered) => RetryKind::Reapply(rendered),
            None => RetryKind::Render,
        };
        self.retry_at = Some((Instant::now() + delay, kind));

        warn!(
            stage = failure.stage,
            reason = %failure.reason,
            epoch = %epoch,
            fingerprint = %fingerprint,
            retries = attempt,
            delay_ms = delay.as_millis() as u64,
            "reconcile failed, retry scheduled",
        );
        Ok(())
    }

    /// Route one exit report from the supervisor.
    fn handle_exit(&mut self, exit: ProxyExit) -> Result<(), AgentError> {
        let Some(record) = self.table.get(exit.epoch) else {
            debug!(epoch = %exit.epoch, "exit report for pruned epoch");
            return Ok(());
        };

        let is_current = self.current.as_ref().map(|c| c.epoch) == Some(exit.epoch);
        if !is_current {
            if !record.status.is_terminal() {
                self.table.transition(
                    exit.epoch,
                    EpochStatus::Exited {
                        code: exit.code,
                        signal: exit.signal,
                    },
                );
                if let Some(record) = self.table.get_mut(exit.epoch) {
                    record.proc = None;
                }
                debug!(epoch = %exit.epoch, code = ?exit.code, "superseded epoch exited");
            }
            self.cleanup_superseded();
            return Ok(());
        }

        let elapsed = record.started_at.elapsed();
        self.stabilize_at = None;

        if elapsed < self.config.stabilization_delay {
            // The active configuration is considered broken.
            self.metrics.inc_startup_failures();
            self.table.transition(
                exit.epoch,
                EpochStatus::Failed {
                    reason: format!("exited during startup window ({})", describe_exit(&exit)),
                },
            );
            if let Some(record) = self.table.get_mut(exit.epoch) {
                record.proc = None;
            }
            self.current = None;
            self.on_transient_failure(Failure::new("startup", describe_exit(&exit)), None)
        } else {
            // Crash of a stabilized epoch: re-apply the same artifact.
            self.metrics.inc_proxy_crashes();
            self.table.transition(
                exit.epoch,
                EpochStatus::Exited {
                    code: exit.code,
                    signal: exit.signal,
                },
            );
            if let Some(record) = self.table.get_mut(exit.epoch) {
                record.proc = None;
            }
            let cached = self.current.take().map(|current| current.rendered);
            self.on_transient_failure(Failure::new("crash", describe_exit(&exit)), cached)
        }
    }

    /// Replenish the budget once the current epoch has stayed up long
    /// enough.
    fn handle_stabilized(&mut self) {
        let Some((_, epoch)) = self.stabilize_at.take() else {
            return;
        };
        let still_current = self.current.as_ref().map(|c| c.epoch) == Some(epoch);
        let running = self
            .table
            .get(epoch)
            .is_some_and(|r| matches!(r.status, EpochStatus::Running));
        if still_current && running {
            self.budget.record_success();
            debug!(%epoch, "epoch stabilized, retry budget replenished");
        }
    }

    /// Unlink artifacts of terminal epochs that a newer serving epoch has
    /// replaced, then drop their records.
    fn cleanup_superseded(&mut self) {
        let unlinkable: Vec<_> = self
            .table
            .records()
            .filter(|r| r.status.is_terminal() && self.table.has_running_successor(r.epoch))
            .map(|r| r.artifact.path().to_path_buf())
            .collect();
        for path in &unlinkable {
            self.store.unlink(path);
        }
        let pruned = self.table.prune();
        for epoch in pruned {
            debug!(%epoch, "pruned terminal epoch");
        }
    }

    /// Graceful termination: drain the inbox without processing, stop all
    /// live epochs, bound the wait by the parent-shutdown ceiling, then
    /// force-kill survivors.
    async fn teardown(&mut self) {
        self.inbox_rx.close();
        while self.inbox_rx.try_recv().is_ok() {}
        self.retry_at = None;
        self.gate_wakeup = None;
        self.stabilize_at = None;

        let active = self.table.active();
        if active.is_empty() {
            info!("agent stopped, no live epochs");
            return;
        }

        info!(epochs = active.len(), "stopping live epochs");
        for epoch in active {
            let is_running = self
                .table
                .get(epoch)
                .is_some_and(|r| matches!(r.status, EpochStatus::Running));
            if is_running {
                self.table.transition(epoch, EpochStatus::Draining);
            }
            if let Some(proc) = self.table.get(epoch).and_then(|r| r.proc.clone()) {
                self.supervisor.stop(&proc, true);
            }
        }

        let deadline = Instant::now() + self.config.proxy.parent_shutdown_duration;
        while !self.table.active().is_empty() {
            match tokio::time::timeout_at(deadline, self.exit_rx.recv()).await {
                Ok(Some(exit)) => {
                    let live = self
                        .table
                        .get(exit.epoch)
                        .is_some_and(|r| !r.status.is_terminal());
                    if live {
                        self.table.transition(
                            exit.epoch,
                            EpochStatus::Exited {
                                code: exit.code,
                                signal: exit.signal,
                            },
                        );
                        if let Some(record) = self.table.get_mut(exit.epoch) {
                            record.proc = None;
                        }
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    for epoch in self.table.active() {
                        warn!(%epoch, "forcing termination of surviving epoch");
                        if let Some(proc) = self.table.get(epoch).and_then(|r| r.proc.clone()) {
                            self.supervisor.stop(&proc, false);
                        }
                    }
                    break;
                },
            }
        }
        info!("agent stopped");
    }

    /// Current epoch id and fingerprint for structured logs.
    fn current_labels(&self) -> (String, String) {
        self.current.as_ref().map_or_else(
            || ("none".to_string(), "none".to_string()),
            |current| {
                (
                    current.epoch.to_string(),
                    current.rendered.fingerprint.to_string(),
                )
            },
        )
    }
}

/// A classified transient failure on its way to the budget.
struct Failure {
    stage: &'static str,
    reason: String,
}

impl Failure {
    fn new(stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

fn describe_exit(exit: &ProxyExit) -> String {
    match (exit.code, exit.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown exit".to_string(),
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::environment::StaticDiscovery;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_node() -> NodeIdentity {
        NodeIdentity {
            service_cluster: "c".to_string(),
            service_node: "n".to_string(),
            ip_address: "10.0.0.9".to_string(),
        }
    }

    fn test_config(scratch: &Path, proxy: PathBuf) -> AgentConfig {
        let mut config = AgentConfig {
            proxy_binary: proxy,
            scratch_dir: scratch.to_path_buf(),
            stabilization_delay: Duration::from_millis(100),
            retry_budget: 5,
            backoff: crate::budget::BackoffConfig::Fixed {
                delay: Duration::from_millis(20),
            },
            ..Default::default()
        };
        config.proxy.drain_duration = Duration::from_millis(100);
        config.proxy.parent_shutdown_duration = Duration::from_millis(500);
        config
    }

    fn counting_generator(payload: &'static [u8]) -> (Generator, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let generator: Generator = Arc::new(move |_env, _node| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(payload.to_vec())
        });
        (generator, calls)
    }

    #[cfg_attr(miri, ignore)] // spawns processes
    #[tokio::test]
    async fn test_first_reconcile_allocates_epoch_zero() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = write_script(dir.path(), "proxy.sh", "exec sleep 30");
        let (generator, calls) = counting_generator(b"{\"v\":1}");
        let (mut agent, _handles) = Agent::new(
            test_config(dir.path(), proxy),
            test_node(),
            Arc::new(StaticDiscovery::default()),
            generator,
        )
        .unwrap();

        agent.reconcile(None).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("envoy-rev0.json").exists());
        let record = agent.table.get(Epoch::initial()).unwrap();
        assert!(matches!(record.status, EpochStatus::Running));
        assert_eq!(agent.current.as_ref().unwrap().epoch, Epoch::initial());

        agent.teardown().await;
    }

    #[cfg_attr(miri, ignore)] // spawns processes
    #[tokio::test]
    async fn test_unchanged_fingerprint_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = write_script(dir.path(), "proxy.sh", "exec sleep 30");
        let (generator, calls) = counting_generator(b"{\"v\":1}");
        let (mut agent, _handles) = Agent::new(
            test_config(dir.path(), proxy),
            test_node(),
            Arc::new(StaticDiscovery::default()),
            generator,
        )
        .unwrap();

        agent.reconcile(None).await.unwrap();
        agent.reconcile(None).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(agent.metrics.unchanged(), 1);
        assert_eq!(agent.metrics.epochs_started(), 1);
        assert_eq!(agent.table.len(), 1);

        agent.teardown().await;
    }

    #[tokio::test]
    async fn test_permanent_render_failure_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let generator: Generator =
            Arc::new(|_env, _node| Err(RenderError::Permanent("bad".to_string())));
        let (mut agent, _handles) = Agent::new(
            test_config(dir.path(), PathBuf::from("/nonexistent")),
            test_node(),
            Arc::new(StaticDiscovery::default()),
            generator,
        )
        .unwrap();

        agent.reconcile(None).await.unwrap();

        assert!(agent.table.is_empty());
        assert!(agent.retry_at.is_none());
        assert_eq!(agent.metrics.render_failures(), 1);
        assert_eq!(agent.metrics.retries_scheduled(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_budget() {
        let dir = tempfile::tempdir().unwrap();
        let generator: Generator =
            Arc::new(|_env, _node| Err(RenderError::Transient("flaky".to_string())));
        let mut config = test_config(dir.path(), PathBuf::from("/nonexistent"));
        config.retry_budget = 2;
        let (mut agent, _handles) = Agent::new(
            config,
            test_node(),
            Arc::new(StaticDiscovery::default()),
            generator,
        )
        .unwrap();

        // First failure schedules a retry.
        agent.reconcile(None).await.unwrap();
        assert!(agent.retry_at.is_some());

        // Second failure exhausts a budget of two.
        let err = agent.reconcile(None).await.unwrap_err();
        assert!(matches!(err, AgentError::BudgetExhausted { failures: 2 }));
    }

    #[cfg_attr(miri, ignore)] // spawns processes
    #[tokio::test]
    async fn test_spawn_failure_marks_epoch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _calls) = counting_generator(b"{}");
        let (mut agent, _handles) = Agent::new(
            test_config(dir.path(), PathBuf::from("/nonexistent/proxy")),
            test_node(),
            Arc::new(StaticDiscovery::default()),
            generator,
        )
        .unwrap();

        agent.reconcile(None).await.unwrap();

        let record = agent.table.get(Epoch::initial()).unwrap();
        assert!(matches!(record.status, EpochStatus::Failed { .. }));
        assert!(agent.current.is_none());
        assert!(matches!(
            agent.retry_at,
            Some((_, RetryKind::Reapply(_)))
        ));
        assert_eq!(agent.metrics.spawn_failures(), 1);
    }

    #[cfg_attr(miri, ignore)] // spawns processes
    #[tokio::test]
    async fn test_hitless_swap_drains_previous_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = write_script(dir.path(), "proxy.sh", "exec sleep 30");
        let discovery = Arc::new(StaticDiscovery::default());

        // Payload tracks an external value so the fingerprint changes.
        let version = Arc::new(AtomicU32::new(1));
        let version_ref = Arc::clone(&version);
        let generator: Generator = Arc::new(move |_env, _node| {
            Ok(format!("{{\"v\":{}}}", version_ref.load(Ordering::SeqCst)).into_bytes())
        });

        let (mut agent, _handles) = Agent::new(
            test_config(dir.path(), proxy),
            test_node(),
            discovery,
            generator,
        )
        .unwrap();

        agent.reconcile(None).await.unwrap();
        version.store(2, Ordering::SeqCst);
        agent.reconcile(None).await.unwrap();

        let first = agent.table.get(Epoch::initial()).unwrap();
        let second = agent.table.get(Epoch::initial().next()).unwrap();
        assert!(matches!(first.status, EpochStatus::Draining));
        assert!(matches!(second.status, EpochStatus::Running));

        agent.teardown().await;
    }
}
