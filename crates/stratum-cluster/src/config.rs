//! Reconciler configuration
//!
//! Everything the reconciler needs beyond the desired state is passed in
//! explicitly. Nothing here reads the environment.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use stratum_common::poll::IntervalStrategy;

/// Pod network range handed to the node OS and the cloud controller
pub const POD_CIDR: &str = "10.244.0.0/16";

/// Per-step wait budgets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Management API port reachable after server creation
    pub maintenance_port: Duration,
    /// Management API back in configured mode after applying configuration
    pub reboot: Duration,
    /// Authenticated session established
    pub authenticated_connect: Duration,
    /// etcd membership converged
    pub etcd_membership: Duration,
    /// Kubernetes API reachable through the load balancer
    pub kube_api: Duration,
    /// Expected node count Ready
    pub node_ready: Duration,
    /// Each addon's workloads running and secrets present
    pub addon_ready: Duration,
    /// One image snapshot built
    pub image_build: Duration,
    /// Managed ingress certificate issued
    pub certificate: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            maintenance_port: Duration::from_secs(10 * 60),
            reboot: Duration::from_secs(15 * 60),
            authenticated_connect: Duration::from_secs(5 * 60),
            etcd_membership: Duration::from_secs(10 * 60),
            kube_api: Duration::from_secs(10 * 60),
            node_ready: Duration::from_secs(15 * 60),
            addon_ready: Duration::from_secs(10 * 60),
            image_build: Duration::from_secs(30 * 60),
            certificate: Duration::from_secs(10 * 60),
        }
    }
}

/// Interval strategies for bounded waits
#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    /// Connection-style waits (ports, sessions)
    pub connect: IntervalStrategy,
    /// Readiness-style waits (nodes, pods, etcd)
    pub readiness: IntervalStrategy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            connect: IntervalStrategy::fixed(Duration::from_secs(5)),
            readiness: IntervalStrategy::exponential(Duration::from_secs(2), Duration::from_secs(30)),
        }
    }
}

/// Top-level configuration
pub struct ReconcilerConfig {
    /// Root of the per-cluster state files (secrets, kubeconfig)
    pub state_dir: PathBuf,
    /// Provider API token, written into the cloud-controller and storage secrets
    pub api_token: SecretString,
    /// Wait budgets
    pub timeouts: Timeouts,
    /// Interval strategies
    pub poll: PollConfig,
}

impl ReconcilerConfig {
    /// Configuration with default timeouts
    pub fn new(state_dir: impl Into<PathBuf>, api_token: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            api_token: SecretString::new(api_token.into().into_boxed_str()),
            timeouts: Timeouts::default(),
            poll: PollConfig::default(),
        }
    }

    /// Token value for secret manifests
    pub(crate) fn token(&self) -> &str {
        self.api_token.expose_secret()
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::new(".stratum", "")
    }
}

impl fmt::Debug for ReconcilerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerConfig")
            .field("state_dir", &self.state_dir)
            .field("api_token", &"[REDACTED]")
            .field("timeouts", &self.timeouts)
            .field("poll", &self.poll)
            .finish()
    }
}
