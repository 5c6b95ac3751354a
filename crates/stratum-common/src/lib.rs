//! Common types for stratum: desired-state model, naming, errors, and utilities

#![deny(missing_docs)]

pub mod diagnostics;
pub mod error;
pub mod kubeconfig;
pub mod model;
pub mod naming;
pub mod poll;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kubernetes API server port, exposed through the API load balancer
pub const KUBE_API_PORT: u16 = 6443;

/// Node OS management API port (maintenance mode and authenticated mode)
pub const NODE_OS_API_PORT: u16 = 50000;

/// Label carrying the cluster identity on every owned cloud resource
pub const CLUSTER_LABEL: &str = "cluster";

/// Label carrying the node role (`control-plane` or `worker`) on servers
pub const ROLE_LABEL: &str = "role";

/// Label carrying the node pool name on servers
pub const POOL_LABEL: &str = "pool";

/// Namespace used for platform integration secrets and system workloads
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
