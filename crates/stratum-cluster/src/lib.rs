//! Cluster lifecycle for stratum
//!
//! Provisions Hetzner Cloud infrastructure, bootstraps Talos nodes into a
//! Kubernetes cluster, installs platform addons, and upgrades or destroys the
//! result. Every external system sits behind a collaborator trait wired in
//! through [`Context`].
//!
//! Related crates:
//! - `stratum-common`: desired-state model, naming, errors, polling

#![deny(missing_docs)]

pub mod addons;
pub mod bootstrap;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod images;
pub mod infra;
pub mod kube_api;
pub mod node_os;
pub mod nodeconfig;
pub mod reconciler;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the entry points
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use upgrade::UpgradeOutcome;

// Re-export wiring types
pub use config::{PollConfig, ReconcilerConfig, Timeouts};
pub use context::{Context, ContextBuilder};

// Re-export collaborator contracts and their bundled implementations
pub use addons::ManifestSource;
pub use cloud::{CloudProvider, HttpPublicIpResolver, PublicIpResolver};
pub use images::ImageBuilder;
pub use kube_api::{ClusterApi, ClusterApiConnector, KubeClusterApi, KubeClusterApiConnector};
pub use node_os::{NodeOsClient, NodeOsConnector, PortProbe, TcpPortProbe};
pub use nodeconfig::{NodeConfigGenerator, NodeSecrets, SecretsStore};

// Re-export common error types
pub use stratum_common::{Error, Result};
