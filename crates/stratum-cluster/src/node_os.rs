//! Node OS management API contract and TCP reachability
//!
//! Nodes boot into maintenance mode, where the management API accepts a
//! machine configuration without client authentication. Once configured the
//! API only answers clients presenting a certificate issued from the cluster
//! secrets.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use stratum_common::Error;

/// Failure class of a management API call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeOsErrorKind {
    /// Connection refused, reset, or timed out
    Unreachable,
    /// TLS handshake or certificate verification failed
    Tls,
    /// Bootstrap was requested but etcd already has members
    AlreadyBootstrapped,
    /// Any other API error
    Other,
}

impl fmt::Display for NodeOsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeOsErrorKind::Unreachable => "unreachable",
            NodeOsErrorKind::Tls => "tls",
            NodeOsErrorKind::AlreadyBootstrapped => "already bootstrapped",
            NodeOsErrorKind::Other => "api error",
        };
        f.write_str(s)
    }
}

/// Error returned by the node OS client
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{endpoint}: {message} ({kind})")]
pub struct NodeOsError {
    /// Failure class
    pub kind: NodeOsErrorKind,
    /// Endpoint that was called
    pub endpoint: String,
    /// Client message
    pub message: String,
}

impl NodeOsError {
    /// Create an error of the given class
    pub fn new(kind: NodeOsErrorKind, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Map into the crate error for `node`.
    ///
    /// Unreachable and generic API errors stay retryable so bounded waits poll
    /// through them; TLS rejection becomes a certificate mismatch.
    pub fn into_error(self, node: &str) -> Error {
        match self.kind {
            NodeOsErrorKind::Tls => Error::CertificateMismatch {
                node: node.to_string(),
                message: self.message,
            },
            NodeOsErrorKind::AlreadyBootstrapped => Error::AlreadyBootstrapped {
                node: node.to_string(),
            },
            NodeOsErrorKind::Unreachable | NodeOsErrorKind::Other => {
                Error::internal_with_context(node, self.to_string())
            }
        }
    }
}

/// Which mode the management API answers in, seen without credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// Accepts unauthenticated configuration
    Maintenance,
    /// Completes the TLS handshake but requires a client certificate
    Configured,
}

/// Node OS and Kubernetes versions reported by a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeVersion {
    /// Node OS release tag (e.g. `v1.9.2`)
    pub tag: String,
    /// Architecture the node runs on
    pub arch: String,
}

/// State of one OS service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Service id (`etcd`, `kubelet`, `apid`)
    pub id: String,
    /// Reported state (`Running`, `Preparing`, ...)
    pub state: String,
    /// Health check result
    pub healthy: bool,
}

/// One etcd member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdMember {
    /// Member id
    pub id: u64,
    /// Hostname of the node running the member
    pub hostname: String,
    /// Whether the member is still a non-voting learner
    pub is_learner: bool,
}

/// Authenticated management API session to one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOsClient: Send + Sync {
    /// OS version
    async fn version(&self) -> Result<NodeVersion, NodeOsError>;
    /// Status of one service
    async fn service_status(&self, service: &str) -> Result<ServiceStatus, NodeOsError>;
    /// etcd member list; empty when etcd was never bootstrapped
    async fn etcd_members(&self) -> Result<Vec<EtcdMember>, NodeOsError>;
    /// One-time etcd bootstrap
    async fn bootstrap(&self) -> Result<(), NodeOsError>;
    /// Make this node's etcd member leave the cluster gracefully
    async fn etcd_leave(&self) -> Result<(), NodeOsError>;
}

/// Opens management API sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOsConnector: Send + Sync {
    /// Determine the API mode without presenting credentials
    async fn probe_mode(&self, endpoint: SocketAddr) -> Result<NodeMode, NodeOsError>;
    /// Apply a machine configuration over an unauthenticated connection
    async fn apply_config_insecure(&self, endpoint: SocketAddr, config: &[u8]) -> Result<(), NodeOsError>;
    /// Open an authenticated session with the given client configuration
    async fn connect(
        &self,
        endpoint: SocketAddr,
        client_config: &[u8],
    ) -> Result<Arc<dyn NodeOsClient>, NodeOsError>;
}

/// Plain TCP reachability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether a TCP connection to `address` can be established
    async fn is_open(&self, address: SocketAddr) -> bool;
}

/// [`PortProbe`] dialing with tokio
#[derive(Clone, Debug)]
pub struct TcpPortProbe {
    connect_timeout: Duration,
}

impl TcpPortProbe {
    /// Create a probe with a per-dial timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_open(&self, address: SocketAddr) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(address = %address, error = %e, "port closed");
                false
            }
            Err(_) => {
                trace!(address = %address, "dial timed out");
                false
            }
        }
    }
}
