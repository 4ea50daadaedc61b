//! Configuration artifacts.
//!
//! Renders opaque payload bytes through an injected generator, fingerprints
//! them, and materializes them as epoch-stamped files in the scratch
//! directory using write-rename atomicity.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::environment::{Environment, NodeIdentity};
use crate::epoch::Epoch;

/// Filename prefix for materialized configuration files.
const CONFIG_FILE_PREFIX: &str = "envoy-rev";

/// The injected configuration generator.
///
/// A pure function of the environment snapshot and node identity; two calls
/// with byte-equal snapshots must produce byte-equal payloads.
pub type Generator =
    Arc<dyn Fn(&Environment, &NodeIdentity) -> Result<Vec<u8>, RenderError> + Send + Sync>;

/// Render and materialization errors, classified by retryability.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The failure may clear on its own; the agent retries with back-off.
    #[error("transient render failure: {0}")]
    Transient(String),

    /// The failure will not clear without an upstream change; the agent
    /// logs it and leaves the running epoch intact.
    #[error("permanent render failure: {0}")]
    Permanent(String),
}

impl RenderError {
    /// Whether the agent should retry this failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// Filesystem failures are always worth retrying.
impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Stable content hash of a payload, valid within one process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the given payload bytes.
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex chars is plenty for log correlation.
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Rendered payload bytes plus fingerprint, not yet on disk.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Content hash of the payload.
    pub fingerprint: Fingerprint,
}

/// An immutable, materialized configuration artifact.
#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    payload: Vec<u8>,
    fingerprint: Fingerprint,
    path: PathBuf,
}

impl ConfigArtifact {
    /// Opaque payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Content hash of the payload.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// On-disk location the proxy reads the payload from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Renders and materializes configuration artifacts.
pub struct ArtifactStore {
    scratch_dir: PathBuf,
    generator: Generator,
}

impl ArtifactStore {
    /// Create a store writing under `scratch_dir`.
    #[must_use]
    pub const fn new(scratch_dir: PathBuf, generator: Generator) -> Self {
        Self {
            scratch_dir,
            generator,
        }
    }

    /// Invoke the generator and fingerprint its output. Touches no disk.
    ///
    /// # Errors
    ///
    /// Propagates the generator's classified error.
    pub fn render(
        &self,
        environment: &Environment,
        node: &NodeIdentity,
    ) -> Result<Rendered, RenderError> {
        let payload = (self.generator)(environment, node)?;
        let fingerprint = Fingerprint::of(&payload);
        Ok(Rendered {
            payload,
            fingerprint,
        })
    }

    /// Write the payload to its epoch-stamped path via write-rename.
    ///
    /// # Errors
    ///
    /// Filesystem failures are returned as `Transient`.
    pub fn materialize(
        &self,
        epoch: Epoch,
        rendered: &Rendered,
    ) -> Result<ConfigArtifact, RenderError> {
        std::fs::create_dir_all(&self.scratch_dir)?;

        let path = self.config_path(epoch);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &rendered.payload)?;
        std::fs::rename(&tmp, &path)?;

        debug!(%epoch, path = %path.display(), "materialized configuration");
        Ok(ConfigArtifact {
            payload: rendered.payload.clone(),
            fingerprint: rendered.fingerprint,
            path,
        })
    }

    /// Remove a materialized file. Missing files are not an error.
    pub fn unlink(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed configuration file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove configuration file"),
        }
    }

    /// Remove configuration files left over from prior runs.
    ///
    /// Epochs restart at zero on every process start, so anything matching
    /// the configuration filename pattern is stale at startup.
    #[must_use]
    pub fn sweep(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.scratch_dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(CONFIG_FILE_PREFIX) {
                self.unlink(&entry.path());
                removed += 1;
            }
        }
        removed
    }

    /// Epoch-stamped configuration path inside the scratch directory.
    #[must_use]
    pub fn config_path(&self, epoch: Epoch) -> PathBuf {
        self.scratch_dir
            .join(format!("{CONFIG_FILE_PREFIX}{epoch}.json"))
    }
}
