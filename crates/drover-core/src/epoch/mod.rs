//! Epoch tracking.
//!
//! An epoch is one generation of the managed proxy process. The table below
//! is owned and mutated exclusively by the reconcile worker; watcher tasks
//! never touch it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::artifact::ConfigArtifact;
use crate::supervisor::ProxyHandle;

/// Identifier of a single proxy generation.
///
/// Strictly increasing within a process lifetime, starting at zero, never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// The first epoch of a process lifetime.
    #[must_use]
    pub const fn initial() -> Self {
        Self(0)
    }

    /// The epoch following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Numeric value, as passed on the proxy command line.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochStatus {
    /// The proxy process is being launched.
    Starting,

    /// The proxy process is serving.
    Running,

    /// A newer epoch took over; this one is finishing in-flight work.
    Draining,

    /// The proxy process exited.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,

        /// Terminating signal, if any.
        signal: Option<i32>,
    },

    /// The epoch never reached a serving state, or broke during startup.
    Failed {
        /// Human-readable failure cause.
        reason: String,
    },
}

impl EpochStatus {
    /// Whether this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Failed { .. })
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Running -> Failed` is admitted for the startup-window crash
    /// classification: a new epoch is optimistically marked `Running` the
    /// moment its process launches, and may still turn out broken.
    #[must_use]
    pub const fn can_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running | Self::Failed { .. })
            | (Self::Running, Self::Draining | Self::Exited { .. } | Self::Failed { .. })
            | (Self::Draining, Self::Exited { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EpochStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Exited { code, signal } => match (code, signal) {
                (Some(code), _) => write!(f, "exited (code: {code})"),
                (None, Some(signal)) => write!(f, "exited (signal: {signal})"),
                (None, None) => write!(f, "exited"),
            },
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Bookkeeping for one epoch.
#[derive(Debug)]
pub struct EpochRecord {
    /// Epoch identifier.
    pub epoch: Epoch,

    /// The materialized configuration this epoch serves.
    pub artifact: ConfigArtifact,

    /// Handle to the running proxy process. Absent while launching or once
    /// the process is gone.
    pub proc: Option<ProxyHandle>,

    /// Current lifecycle state.
    pub status: EpochStatus,

    /// When the epoch's process was launched.
    pub started_at: Instant,
}

impl EpochRecord {
    /// Create a fresh record in `Starting` state.
    #[must_use]
    pub fn new(epoch: Epoch, artifact: ConfigArtifact) -> Self {
        Self {
            epoch,
            artifact,
            proc: None,
            status: EpochStatus::Starting,
            started_at: Instant::now(),
        }
    }
}

/// Table of live and recently terminal epochs.
#[derive(Debug, Default)]
pub struct EpochTable {
    records: BTreeMap<u64, EpochRecord>,
    last_issued: Option<u64>,
}

impl EpochTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next epoch id. Ids are never reused, including ids whose
    /// reconcile later failed before a record was inserted.
    pub fn allocate(&mut self) -> Epoch {
        let next = self.last_issued.map_or(0, |last| last + 1);
        self.last_issued = Some(next);
        Epoch(next)
    }

    /// Insert a freshly created record.
    ///
    /// # Panics
    ///
    /// Panics if the record is not in `Starting` state, if the epoch is
    /// already present, or if another epoch is currently `Starting`; all
    /// are programmer errors.
    pub fn insert(&mut self, record: EpochRecord) {
        assert!(
            matches!(record.status, EpochStatus::Starting),
            "epoch {} inserted in non-starting state {}",
            record.epoch,
            record.status,
        );
        assert!(
            !self
                .records
                .values()
                .any(|r| matches!(r.status, EpochStatus::Starting)),
            "epoch {} inserted while another epoch is starting",
            record.epoch,
        );
        let previous = self.records.insert(record.epoch.value(), record);
        assert!(previous.is_none(), "epoch id reused");
    }

    /// Move an epoch to a new status.
    ///
    /// # Panics
    ///
    /// Panics on an unknown epoch or an illegal transition; both are
    /// programmer errors.
    pub fn transition(&mut self, epoch: Epoch, next: EpochStatus) {
        let record = self
            .records
            .get_mut(&epoch.value())
            .unwrap_or_else(|| panic!("transition of unknown epoch {epoch}"));
        assert!(
            record.status.can_transition(&next),
            "illegal transition {} -> {} for epoch {}",
            record.status,
            next,
            epoch,
        );
        record.status = next;
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, epoch: Epoch) -> Option<&EpochRecord> {
        self.records.get(&epoch.value())
    }

    /// Look up a record mutably.
    pub fn get_mut(&mut self, epoch: Epoch) -> Option<&mut EpochRecord> {
        self.records.get_mut(&epoch.value())
    }

    /// Epochs in a non-terminal state, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<Epoch> {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.epoch)
            .collect()
    }

    /// Whether any epoch newer than `epoch` is `Running`.
    #[must_use]
    pub fn has_running_successor(&self, epoch: Epoch) -> bool {
        self.records
            .range(epoch.value() + 1..)
            .any(|(_, r)| matches!(r.status, EpochStatus::Running))
    }

    /// Remove terminal records whose artifact files have been unlinked.
    /// Returns the removed epochs.
    pub fn prune(&mut self) -> Vec<Epoch> {
        let removable: Vec<u64> = self
            .records
            .values()
            .filter(|r| r.status.is_terminal() && !r.artifact.path().exists())
            .map(|r| r.epoch.value())
            .collect();
        for value in &removable {
            self.records.remove(value);
        }
        removable.into_iter().map(Epoch).collect()
    }

    /// Iterate over all records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &EpochRecord> {
        self.records.values()
    }

    /// Number of tracked records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::artifact::{ArtifactStore, Generator};
    use crate::environment::{Environment, NodeIdentity};

    fn store(dir: &std::path::Path) -> ArtifactStore {
        let generator: Generator = Arc::new(|_env, _node| Ok(b"payload".to_vec()));
        ArtifactStore::new(dir.to_path_buf(), generator)
    }

    fn artifact(dir: &std::path::Path, epoch: Epoch) -> ConfigArtifact {
        let store = store(dir);
        let node = NodeIdentity {
            service_cluster: "c".to_string(),
            service_node: "n".to_string(),
            ip_address: "10.0.0.9".to_string(),
        };
        let rendered = store.render(&Environment::default(), &node).unwrap();
        store.materialize(epoch, &rendered).unwrap()
    }

    #[test]
    fn test_allocate_is_strictly_increasing() {
        let mut table = EpochTable::new();
        let first = table.allocate();
        let second = table.allocate();
        let third = table.allocate();

        assert_eq!(first.value(), 0);
        assert_eq!(second.value(), 1);
        assert_eq!(third.value(), 2);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();
        let epoch = table.allocate();
        table.insert(EpochRecord::new(epoch, artifact(dir.path(), epoch)));

        table.transition(epoch, EpochStatus::Running);
        table.transition(epoch, EpochStatus::Draining);
        table.transition(
            epoch,
            EpochStatus::Exited {
                code: Some(0),
                signal: None,
            },
        );
        assert!(table.get(epoch).unwrap().status.is_terminal());
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();
        let epoch = table.allocate();
        table.insert(EpochRecord::new(epoch, artifact(dir.path(), epoch)));

        table.transition(epoch, EpochStatus::Running);
        table.transition(epoch, EpochStatus::Draining);
        // Draining can only exit.
        table.transition(epoch, EpochStatus::Running);
    }

    #[test]
    #[should_panic(expected = "another epoch is starting")]
    fn test_second_starting_epoch_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();

        let first = table.allocate();
        table.insert(EpochRecord::new(first, artifact(dir.path(), first)));
        let second = table.allocate();
        table.insert(EpochRecord::new(second, artifact(dir.path(), second)));
    }

    #[test]
    fn test_running_to_failed_is_legal() {
        // Startup-window crash classification demotes a Running epoch.
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();
        let epoch = table.allocate();
        table.insert(EpochRecord::new(epoch, artifact(dir.path(), epoch)));

        table.transition(epoch, EpochStatus::Running);
        table.transition(
            epoch,
            EpochStatus::Failed {
                reason: "exited during startup window".to_string(),
            },
        );
    }

    #[test]
    fn test_active_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();

        let first = table.allocate();
        table.insert(EpochRecord::new(first, artifact(dir.path(), first)));
        table.transition(first, EpochStatus::Running);
        table.transition(first, EpochStatus::Draining);

        let second = table.allocate();
        table.insert(EpochRecord::new(second, artifact(dir.path(), second)));
        table.transition(second, EpochStatus::Running);

        assert_eq!(table.active(), vec![first, second]);
        assert!(table.has_running_successor(first));
        assert!(!table.has_running_successor(second));
    }

    #[test]
    fn test_prune_requires_unlinked_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EpochTable::new();
        let epoch = table.allocate();
        let art = artifact(dir.path(), epoch);
        let path = art.path().to_path_buf();
        table.insert(EpochRecord::new(epoch, art));

        table.transition(epoch, EpochStatus::Running);
        table.transition(
            epoch,
            EpochStatus::Exited {
                code: Some(0),
                signal: None,
            },
        );

        // Terminal but file still on disk: kept.
        assert!(table.prune().is_empty());

        std::fs::remove_file(&path).unwrap();
        assert_eq!(table.prune(), vec![epoch]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_prune_keeps_non_terminal() {
        let mut table = EpochTable::new();
        let dir = tempfile::tempdir().unwrap();
        let epoch = table.allocate();
        let art = artifact(dir.path(), epoch);
        std::fs::remove_file(art.path()).unwrap();
        table.insert(EpochRecord::new(epoch, art));
        table.transition(epoch, EpochStatus::Running);

        // Running epochs are never pruned, even with the file gone.
        assert!(table.prune().is_empty());
        assert_eq!(table.len(), 1);
    }
}
