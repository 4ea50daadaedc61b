//! # drover-core
//!
//! Core library for drover, a per-node proxy configuration agent.
//!
//! The agent reconciles a live data-plane proxy process with configuration
//! derived from a service-discovery source. Change notifications are
//! debounced into epoch-stamped reconfigurations, each epoch is
//! materialized atomically on disk, and the running proxy is hot-swapped
//! with overlap so traffic never sees a gap. Transient failures retry
//! against a bounded budget.
//!
//! ## Components
//!
//! - **Artifact**: fingerprinting and write-rename materialization
//! - **Epoch table**: monotonic epoch ids and the per-epoch state machine
//! - **Supervisor**: proxy process launch, watch, and graceful stop
//! - **Agent**: the single reconcile worker tying it all together
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use drover_core::agent::Agent;
//! use drover_core::bootstrap;
//! use drover_core::config::AgentConfig;
//! use drover_core::environment::{NodeIdentity, StaticDiscovery};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::default();
//! let node = NodeIdentity {
//!     service_cluster: "checkout".to_string(),
//!     service_node: "checkout-7f9c".to_string(),
//!     ip_address: "10.0.0.9".to_string(),
//! };
//! let generator = bootstrap::renderer(config.proxy.clone());
//! let (agent, handles) =
//!     Agent::new(config, node, Arc::new(StaticDiscovery::default()), generator)?;
//!
//! let worker = tokio::spawn(agent.run());
//! handles.inbox.send(drover_core::agent::ReconcileRequest).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod artifact;
pub mod bootstrap;
pub mod budget;
pub mod config;
pub mod environment;
pub mod epoch;
pub mod metrics;
pub mod ratelimit;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::agent::{Agent, AgentError, AgentHandles, ReconcileRequest};
    pub use crate::artifact::{ConfigArtifact, Fingerprint, Generator, RenderError};
    pub use crate::config::AgentConfig;
    pub use crate::environment::{Discovery, Environment, NodeIdentity};
    pub use crate::epoch::{Epoch, EpochStatus};
}

/// Re-export commonly used types at the crate root.
pub use agent::{Agent, AgentError, AgentHandles, ReconcileRequest};
pub use config::AgentConfig;
pub use environment::{Discovery, Environment, NodeIdentity};
pub use epoch::{Epoch, EpochStatus, EpochTable};
