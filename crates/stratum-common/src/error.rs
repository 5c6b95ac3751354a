//! Error types for stratum
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the step, resource, or node that failed so a caller
//! can tell exactly where a reconciliation stopped.

use thiserror::Error;

use crate::diagnostics::DiagnosticReport;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// One addon that failed to install or become ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddonFailure {
    /// Addon name (e.g. `cni`, `ccm`)
    pub addon: String,
    /// What went wrong
    pub message: String,
}

/// Main error type for stratum operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for the desired-state model
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "controlPlanePools[0].count")
        field: Option<String>,
    },

    /// Cloud provider call failed during a reconciliation step
    #[error("provider error [{step}] on {resource} for {cluster}: {message}")]
    Provider {
        /// Cluster being reconciled
        cluster: String,
        /// Pipeline step (network, firewall, load-balancer, ...)
        step: String,
        /// Name of the resource the call was about
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether the failure class is transient
        retryable: bool,
    },

    /// A bounded wait exhausted its budget
    #[error("timeout [{step}] waiting for {target}: {message}")]
    Timeout {
        /// Step that was waiting
        step: String,
        /// What was being waited on (node, address, addon)
        target: String,
        /// Description of the last observed state
        message: String,
    },

    /// The external cancellation signal fired
    #[error("cancelled during {step}")]
    Cancelled {
        /// Step that was running when cancellation was observed
        step: String,
    },

    /// Authenticated connection rejected while the node still answers insecurely
    #[error("certificate mismatch on {node}: {message}")]
    CertificateMismatch {
        /// Node whose certificate chain does not match the cluster secrets
        node: String,
        /// Handshake error text
        message: String,
    },

    /// etcd bootstrap was requested against a node that already has members
    #[error("etcd already bootstrapped on {node}")]
    AlreadyBootstrapped {
        /// Node that rejected the bootstrap call
        node: String,
    },

    /// Fatal bootstrap failure with the diagnostic snapshot gathered afterwards
    #[error("bootstrap error [{step}] on {node}: {message}{}", render_diagnostics(.diagnostics))]
    Bootstrap {
        /// Node being driven when the step failed
        node: String,
        /// Sequencer step (maintenance-port, apply-config, reboot, ...)
        step: String,
        /// Description of what failed
        message: String,
        /// Connectivity, service, and etcd snapshot
        diagnostics: Option<Box<DiagnosticReport>>,
    },

    /// Provisioning failure with the diagnostic snapshot gathered afterwards
    #[error("{source}\n{diagnostics}")]
    Provisioning {
        /// The failure that stopped provisioning
        source: Box<Error>,
        /// Connectivity, service, and etcd snapshot
        diagnostics: Box<DiagnosticReport>,
    },

    /// Fewer nodes became Ready than the desired state asks for
    #[error("expected {expected} ready nodes, observed {ready}")]
    NodeCountMismatch {
        /// Desired node count across all pools
        expected: usize,
        /// Nodes reporting Ready when the budget ran out
        ready: usize,
    },

    /// Persisted node secrets are unreadable or corrupt
    #[error("secrets error at {path}: {message}")]
    Secrets {
        /// Secrets file location
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Cluster credential failed structural validation
    #[error("credential error: {message}")]
    Credential {
        /// Description of what's wrong with the kubeconfig
        message: String,
    },

    /// One or more addons failed; the others were left in place
    #[error("addon installation failed: {}", render_addon_failures(.failures))]
    Addons {
        /// Every addon that failed or was skipped
        failures: Vec<AddonFailure>,
    },

    /// An operation would take the control plane below etcd quorum
    #[error("quorum error: {message}")]
    Quorum {
        /// Description of the rejected disruption
        message: String,
    },

    /// Rolling replacement failed on a node
    #[error("upgrade error on {node}: {message}")]
    Upgrade {
        /// Node being replaced or verified
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Teardown left resources behind
    #[error("cleanup error for {cluster}: {}", .failures.join("; "))]
    Cleanup {
        /// Cluster being destroyed
        cluster: String,
        /// Deletions that failed after the fallback sweep
        failures: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Filesystem error on persisted state
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being read or written
        context: String,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

fn render_diagnostics(diagnostics: &Option<Box<DiagnosticReport>>) -> String {
    match diagnostics {
        Some(report) => format!("\n{}", report),
        None => String::new(),
    }
}

fn render_addon_failures(failures: &[AddonFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.addon, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error for a pipeline step
    pub fn provider(
        cluster: impl Into<String>,
        step: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            step: step.into(),
            resource: resource.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create a timeout error
    pub fn timeout(
        step: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            step: step.into(),
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// Create a bootstrap error without diagnostics
    pub fn bootstrap(
        node: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Bootstrap {
            node: node.into(),
            step: step.into(),
            message: msg.into(),
            diagnostics: None,
        }
    }

    /// Create a secrets error
    pub fn secrets(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Secrets {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
        }
    }

    /// Create a quorum error
    pub fn quorum(msg: impl Into<String>) -> Self {
        Self::Quorum {
            message: msg.into(),
        }
    }

    /// Create an upgrade error for a node
    pub fn upgrade(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Upgrade {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap an IO error with what was being accessed
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a diagnostic snapshot to a bootstrap failure.
    ///
    /// Other variants are converted into a bootstrap failure on `node` at
    /// `step` so the snapshot is never dropped.
    pub fn with_diagnostics(
        self,
        node: impl Into<String>,
        step: impl Into<String>,
        report: DiagnosticReport,
    ) -> Self {
        match self {
            Error::Bootstrap {
                node,
                step,
                message,
                ..
            } => Error::Bootstrap {
                node,
                step,
                message,
                diagnostics: Some(Box::new(report)),
            },
            other => Error::Bootstrap {
                node: node.into(),
                step: step.into(),
                message: other.to_string(),
                diagnostics: Some(Box::new(report)),
            },
        }
    }

    /// Attach a diagnostic snapshot to a provisioning failure.
    ///
    /// Unlike [`Error::with_diagnostics`] the original error stays intact, so
    /// its step, cluster, and retryability are still reported.
    pub fn with_provisioning_diagnostics(self, report: DiagnosticReport) -> Self {
        match self {
            Error::Provisioning { source, .. } => Error::Provisioning {
                source,
                diagnostics: Box::new(report),
            },
            other => Error::Provisioning {
                source: Box::new(other),
                diagnostics: Box::new(report),
            },
        }
    }

    /// Check if this error is retryable
    ///
    /// Retryable means a later reconciliation can resume from where this one
    /// stopped. Structural errors need a configuration or state fix first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::Provider { retryable, .. } => *retryable,
            Error::Provisioning { source, .. } => source.is_retryable(),
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Addons { .. } => true,
            Error::Cleanup { .. } => true,
            Error::Io { .. } => true,
            Error::Internal { .. } => true,
            Error::Validation { .. }
            | Error::CertificateMismatch { .. }
            | Error::AlreadyBootstrapped { .. }
            | Error::Bootstrap { .. }
            | Error::NodeCountMismatch { .. }
            | Error::Secrets { .. }
            | Error::Credential { .. }
            | Error::Quorum { .. }
            | Error::Upgrade { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            Error::Cleanup { cluster, .. } => Some(cluster),
            Error::Provisioning { source, .. } => source.cluster(),
            _ => None,
        }
    }

    /// Get the pipeline step this error was raised in
    pub fn step(&self) -> Option<&str> {
        match self {
            Error::Provider { step, .. } => Some(step),
            Error::Timeout { step, .. } => Some(step),
            Error::Cancelled { step } => Some(step),
            Error::Bootstrap { step, .. } => Some(step),
            Error::Provisioning { source, .. } => source.step(),
            _ => None,
        }
    }

    /// Get the diagnostic snapshot if one was attached
    pub fn diagnostics(&self) -> Option<&DiagnosticReport> {
        match self {
            Error::Bootstrap { diagnostics, .. } => diagnostics.as_deref(),
            Error::Provisioning { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}
