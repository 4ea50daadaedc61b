//! Proxy process supervision.
//!
//! Launches one proxy process per epoch and watches it. Each child gets a
//! dedicated watcher task that owns the process handle, attaches before
//! `start` returns, and reports the exit on a channel the agent owns.
//! Watchers never touch the epoch table.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::artifact::ConfigArtifact;
use crate::config::AgentConfig;
use crate::epoch::Epoch;

/// Exit report for one epoch's proxy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyExit {
    /// Epoch the process belonged to.
    pub epoch: Epoch,

    /// Exit code, if the process exited normally.
    pub code: Option<i32>,

    /// Terminating signal, if any.
    pub signal: Option<i32>,
}

/// Stop request delivered to a watcher.
#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Forced,
}

/// Handle to a supervised proxy process.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    epoch: Epoch,
    pid: u32,
    stop_tx: mpsc::Sender<StopMode>,
}

impl ProxyHandle {
    /// Epoch the process serves.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

/// Launches and terminates proxy epoch instances.
pub struct ProxySupervisor {
    binary: PathBuf,
    service_cluster: String,
    service_node: String,
    drain: Duration,
    parent_shutdown: Duration,
    exit_tx: mpsc::Sender<ProxyExit>,
}

impl ProxySupervisor {
    /// Create a supervisor reporting exits on `exit_tx`.
    #[must_use]
    pub fn new(config: &AgentConfig, exit_tx: mpsc::Sender<ProxyExit>) -> Self {
        Self {
            binary: config.proxy_binary.clone(),
            service_cluster: config.service_cluster.clone(),
            service_node: config.service_node.clone(),
            drain: config.proxy.drain_duration,
            parent_shutdown: config.proxy.parent_shutdown_duration,
            exit_tx,
        }
    }

    /// Launch the proxy for `epoch` with the given artifact.
    ///
    /// Returns once fork+exec has completed; readiness is not awaited. The
    /// watcher task is attached before this returns, so an exit can never
    /// go unobserved.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::SpawnFailed` when the process cannot be
    /// launched; no handle exists in that case.
    pub fn start(
        &self,
        epoch: Epoch,
        artifact: &ConfigArtifact,
    ) -> Result<ProxyHandle, SupervisorError> {
        let args = self.proxy_args(epoch, artifact.path());
        debug!(%epoch, binary = %self.binary.display(), ?args, "launching proxy");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| SupervisorError::SpawnFailed(err.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::SpawnFailed("no process id".to_string()))?;

        // Capacity two: a graceful stop may still be in flight when
        // teardown escalates to a forced one.
        let (stop_tx, stop_rx) = mpsc::channel(2);
        tokio::spawn(watch(
            child,
            epoch,
            pid,
            stop_rx,
            self.exit_tx.clone(),
            self.parent_shutdown,
        ));

        info!(%epoch, pid, "proxy launched");
        Ok(ProxyHandle {
            epoch,
            pid,
            stop_tx,
        })
    }

    /// Request termination of a supervised process.
    ///
    /// With `graceful` set, the watcher sends the drain signal and
    /// escalates to a forced kill after the parent-shutdown ceiling.
    /// Requests to a watcher that has already reported are dropped.
    pub fn stop(&self, handle: &ProxyHandle, graceful: bool) {
        let mode = if graceful {
            StopMode::Graceful
        } else {
            StopMode::Forced
        };
        if handle.stop_tx.try_send(mode).is_err() {
            debug!(epoch = %handle.epoch, "stop request dropped, process already reaping");
        }
    }

    /// Command-line arguments for one epoch's proxy process.
    fn proxy_args(&self, epoch: Epoch, config_path: &Path) -> Vec<String> {
        vec![
            "-c".to_string(),
            config_path.display().to_string(),
            "--restart-epoch".to_string(),
            epoch.value().to_string(),
            "--drain-time-s".to_string(),
            self.drain.as_secs().to_string(),
            "--parent-shutdown-time-s".to_string(),
            self.parent_shutdown.as_secs().to_string(),
            "--service-cluster".to_string(),
            self.service_cluster.clone(),
            "--service-node".to_string(),
            self.service_node.clone(),
        ]
    }
}

/// Watch one child process until it exits, honoring stop requests.
///
/// Owns the `Child`; the exit report is the only thing that leaves.
async fn watch(
    mut child: Child,
    epoch: Epoch,
    pid: u32,
    mut stop_rx: mpsc::Receiver<StopMode>,
    exit_tx: mpsc::Sender<ProxyExit>,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        Some(mode) = stop_rx.recv() => match mode {
            StopMode::Graceful => {
                #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(%epoch, pid, error = %err, "failed to signal proxy");
                }
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        warn!(%epoch, pid, "graceful stop deadline exceeded, killing proxy");
                        let _ = child.kill().await;
                        child.wait().await.ok()
                    },
                }
            },
            StopMode::Forced => {
                let _ = child.kill().await;
                child.wait().await.ok()
            },
        },
    };

    let (code, sig) = status.map_or((None, None), |s| (s.code(), s.signal()));
    debug!(%epoch, pid, ?code, ?sig, "proxy exited");

    // The agent may already be gone during teardown; that is fine.
    let _ = exit_tx
        .send(ProxyExit {
            epoch,
            code,
            signal: sig,
        })
        .await;
}

/// Supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The proxy process could not be launched.
    #[error("failed to spawn proxy: {0}")]
    SpawnFailed(String),
}
