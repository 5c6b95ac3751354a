//! Cloud provider contract
//!
//! The concrete HTTP client for the provider lives outside this crate. The
//! reconciler consumes it through [`CloudProvider`], which is mocked in unit
//! tests and faked in scenario tests.
//!
//! Contract obligations on implementors:
//! - creates return [`CloudErrorKind::AlreadyExists`] (or the existing
//!   resource) when the named resource is already there
//! - transient failures (rate limiting, timeouts) are retried with bounded
//!   backoff before they are returned
//! - deletes of missing resources return [`CloudErrorKind::NotFound`]

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

use stratum_common::Error;

/// Result type for provider calls
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Resource labels
pub type Labels = BTreeMap<String, String>;

/// Failure class reported by the provider client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The resource does not exist
    NotFound,
    /// A resource with this name already exists
    AlreadyExists,
    /// The API rate limit was hit and the client's backoff budget ran out
    RateLimited,
    /// The request or the provider action timed out
    Timeout,
    /// Another action is locking the resource
    Conflict,
    /// Anything else (invalid input, quota, server error)
    Other,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudErrorKind::NotFound => "not found",
            CloudErrorKind::AlreadyExists => "already exists",
            CloudErrorKind::RateLimited => "rate limited",
            CloudErrorKind::Timeout => "timeout",
            CloudErrorKind::Conflict => "conflict",
            CloudErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// Error returned by the provider client
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{resource}: {message} ({kind})")]
pub struct CloudError {
    /// Failure class
    pub kind: CloudErrorKind,
    /// Resource the call was about
    pub resource: String,
    /// Provider message
    pub message: String,
}

impl CloudError {
    /// Create an error of the given class
    pub fn new(kind: CloudErrorKind, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Resource is missing
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, resource, "not found")
    }

    /// Resource is already there
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::AlreadyExists, resource, "already exists")
    }

    /// Whether a later run may succeed without changes
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::RateLimited | CloudErrorKind::Timeout | CloudErrorKind::Conflict
        )
    }

    /// Wrap into the crate error, tagged with the pipeline step
    pub fn into_provider_error(self, cluster: &str, step: &str) -> Error {
        let retryable = self.is_transient();
        Error::provider(cluster, step, self.resource, self.message, retryable)
    }
}

/// Private network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Top-level range
    pub ip_range: Ipv4Net,
    /// Subnets carved from the range
    pub subnets: Vec<Ipv4Net>,
    /// Labels
    pub labels: Labels,
}

/// Network creation request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Name
    pub name: String,
    /// Top-level range
    pub ip_range: Ipv4Net,
    /// Subnets to create with the network
    pub subnets: Vec<Ipv4Net>,
    /// Network zone of the subnets
    pub network_zone: String,
    /// Labels
    pub labels: Labels,
}

/// Transport protocol of a firewall rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP (no port)
    Icmp,
}

/// Inbound firewall rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    /// Free-form description shown in the provider console
    pub description: String,
    /// Protocol
    pub protocol: Protocol,
    /// Destination port; `None` for ICMP
    pub port: Option<u16>,
    /// Allowed source ranges
    pub source_ips: Vec<IpNet>,
}

/// Firewall
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Firewall {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Inbound rules
    pub rules: Vec<FirewallRule>,
    /// Label selectors the firewall is applied to
    pub applied_to: Vec<String>,
    /// Labels
    pub labels: Labels,
}

/// Firewall creation request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRequest {
    /// Name
    pub name: String,
    /// Inbound rules
    pub rules: Vec<FirewallRule>,
    /// Servers matching this selector are covered, including future ones
    pub label_selector: String,
    /// Labels
    pub labels: Labels,
}

/// Spread placement group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementGroup {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// Load balancer health check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthCheck {
    /// TCP connect
    Tcp {
        /// Port to dial
        port: u16,
    },
    /// HTTP(S) request expecting one of the listed status codes
    Http {
        /// Port to dial
        port: u16,
        /// Request path
        path: String,
        /// Accepted status codes
        status_codes: Vec<String>,
        /// Use TLS without verifying the certificate
        tls: bool,
    },
}

/// Service on a load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerService {
    /// Public port
    pub listen_port: u16,
    /// Target port
    pub destination_port: u16,
    /// Health check
    pub health_check: HealthCheck,
    /// Certificates terminating TLS on the listen port; empty for plain TCP
    pub certificate_ids: Vec<u64>,
}

/// Load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Public IPv4
    pub public_ipv4: Option<Ipv4Addr>,
    /// Address in the private network, once attached
    pub private_ip: Option<Ipv4Addr>,
    /// Attached network
    pub network_id: Option<u64>,
    /// Services
    pub services: Vec<LoadBalancerService>,
    /// Label selector targets
    pub label_targets: Vec<String>,
    /// Labels
    pub labels: Labels,
}

/// Load balancer creation request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerRequest {
    /// Name
    pub name: String,
    /// Provider type (e.g. `lb11`)
    pub lb_type: String,
    /// Location
    pub location: String,
    /// Network to attach to
    pub network_id: u64,
    /// Fixed private address
    pub private_ip: Option<Ipv4Addr>,
    /// Services
    pub services: Vec<LoadBalancerService>,
    /// Label selector target
    pub label_target: String,
    /// Labels
    pub labels: Labels,
}

/// OS image a server boots from
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerImage {
    /// Snapshot id
    Snapshot(u64),
    /// Named base image
    Named(String),
}

impl fmt::Display for ServerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerImage::Snapshot(id) => write!(f, "snapshot {}", id),
            ServerImage::Named(name) => write!(f, "image {}", name),
        }
    }
}

/// Server lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    /// Being created
    Initializing,
    /// Booting
    Starting,
    /// Running
    Running,
    /// Powered off
    Off,
    /// Being deleted
    Deleting,
    /// Anything else
    Unknown,
}

/// Server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Status
    pub status: ServerStatus,
    /// Public IPv4
    pub public_ipv4: Option<Ipv4Addr>,
    /// Address in the private network
    pub private_ip: Option<Ipv4Addr>,
    /// Image the server was created from
    pub image: Option<ServerImage>,
    /// Labels
    pub labels: Labels,
}

/// Server creation request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerRequest {
    /// Name
    pub name: String,
    /// Provider server type
    pub server_type: String,
    /// Location
    pub location: String,
    /// Image
    pub image: ServerImage,
    /// Network to attach to
    pub network_id: u64,
    /// Fixed private address
    pub private_ip: Ipv4Addr,
    /// Spread group (control plane only)
    pub placement_group_id: Option<u64>,
    /// SSH keys to install
    pub ssh_key_ids: Vec<u64>,
    /// Labels; the firewall selects on these
    pub labels: Labels,
}

/// Floating IPv4
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloatingIp {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Address
    pub ip: Ipv4Addr,
    /// Server currently holding the address
    pub server_id: Option<u64>,
    /// Labels
    pub labels: Labels,
}

/// Image snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Provider id
    pub id: u64,
    /// Description
    pub description: String,
    /// Labels
    pub labels: Labels,
}

/// Issuance state of a managed certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateStatus {
    /// Waiting for DNS validation
    Pending,
    /// Issued and usable
    Issued,
    /// Issuance failed; the provider will not retry
    Failed,
}

/// Provider-managed TLS certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// Covered domains
    pub domain_names: Vec<String>,
    /// Issuance state
    pub status: CertificateStatus,
    /// Labels
    pub labels: Labels,
}

/// Managed certificate request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Name
    pub name: String,
    /// Domains to cover
    pub domain_names: Vec<String>,
    /// Labels
    pub labels: Labels,
}

/// SSH key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshKey {
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
    /// OpenSSH public key
    pub public_key: String,
    /// Labels
    pub labels: Labels,
}

/// Resource kinds the provider reports in label listings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Network
    Network,
    /// Firewall
    Firewall,
    /// Placement group
    PlacementGroup,
    /// Load balancer
    LoadBalancer,
    /// Server
    Server,
    /// Floating IP
    FloatingIp,
    /// SSH key
    SshKey,
    /// Image snapshot
    Snapshot,
    /// Managed certificate
    Certificate,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Network => "network",
            ResourceKind::Firewall => "firewall",
            ResourceKind::PlacementGroup => "placement-group",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::Server => "server",
            ResourceKind::FloatingIp => "floating-ip",
            ResourceKind::SshKey => "ssh-key",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Certificate => "certificate",
        };
        f.write_str(s)
    }
}

/// A resource found by label
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    /// Kind
    pub kind: ResourceKind,
    /// Provider id
    pub id: u64,
    /// Name
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (id {})", self.kind, self.name, self.id)
    }
}

/// Provider operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Look up a network by name
    async fn get_network(&self, name: &str) -> CloudResult<Option<Network>>;
    /// Create a network with its initial subnets
    async fn create_network(&self, request: &NetworkRequest) -> CloudResult<Network>;
    /// Add a subnet to an existing network
    async fn add_subnet(&self, network_id: u64, subnet: Ipv4Net, network_zone: &str) -> CloudResult<()>;
    /// Delete a network
    async fn delete_network(&self, id: u64) -> CloudResult<()>;

    /// Look up a firewall by name
    async fn get_firewall(&self, name: &str) -> CloudResult<Option<Firewall>>;
    /// Create a firewall applied to a label selector
    async fn create_firewall(&self, request: &FirewallRequest) -> CloudResult<Firewall>;
    /// Replace the rule set of a firewall
    async fn set_firewall_rules(&self, id: u64, rules: &[FirewallRule]) -> CloudResult<()>;
    /// Apply a firewall to every server matching a label selector
    async fn apply_firewall_to_selector(&self, id: u64, selector: &str) -> CloudResult<()>;
    /// Delete a firewall
    async fn delete_firewall(&self, id: u64) -> CloudResult<()>;

    /// Look up a placement group by name
    async fn get_placement_group(&self, name: &str) -> CloudResult<Option<PlacementGroup>>;
    /// Create a spread placement group
    async fn create_placement_group(&self, name: &str, labels: &Labels) -> CloudResult<PlacementGroup>;
    /// Delete a placement group
    async fn delete_placement_group(&self, id: u64) -> CloudResult<()>;

    /// Look up a load balancer by name
    async fn get_load_balancer(&self, name: &str) -> CloudResult<Option<LoadBalancer>>;
    /// Create a load balancer attached to a network
    async fn create_load_balancer(&self, request: &LoadBalancerRequest) -> CloudResult<LoadBalancer>;
    /// Add a service
    async fn add_load_balancer_service(&self, id: u64, service: &LoadBalancerService) -> CloudResult<()>;
    /// Replace the service listening on `service.listen_port`
    async fn update_load_balancer_service(&self, id: u64, service: &LoadBalancerService) -> CloudResult<()>;
    /// Add a label selector target
    async fn add_load_balancer_target(&self, id: u64, selector: &str) -> CloudResult<()>;
    /// Attach to a network
    async fn attach_load_balancer_to_network(
        &self,
        id: u64,
        network_id: u64,
        ip: Option<Ipv4Addr>,
    ) -> CloudResult<()>;
    /// Delete a load balancer
    async fn delete_load_balancer(&self, id: u64) -> CloudResult<()>;

    /// Look up a server by name
    async fn get_server(&self, name: &str) -> CloudResult<Option<Server>>;
    /// Create a server; returns once the server has its addresses
    async fn create_server(&self, request: &ServerRequest) -> CloudResult<Server>;
    /// Delete a server
    async fn delete_server(&self, id: u64) -> CloudResult<()>;
    /// Servers matching a label selector
    async fn list_servers_by_label(&self, selector: &str) -> CloudResult<Vec<Server>>;

    /// Look up a floating IP by name
    async fn get_floating_ip(&self, name: &str) -> CloudResult<Option<FloatingIp>>;
    /// Allocate a floating IPv4 in a location
    async fn create_floating_ip(&self, name: &str, location: &str, labels: &Labels) -> CloudResult<FloatingIp>;
    /// Point a floating IP at a server
    async fn assign_floating_ip(&self, id: u64, server_id: u64) -> CloudResult<()>;
    /// Release a floating IP
    async fn delete_floating_ip(&self, id: u64) -> CloudResult<()>;

    /// Look up an SSH key by name
    async fn get_ssh_key(&self, name: &str) -> CloudResult<Option<SshKey>>;
    /// Register an SSH key
    async fn create_ssh_key(&self, name: &str, public_key: &str, labels: &Labels) -> CloudResult<SshKey>;
    /// Delete an SSH key
    async fn delete_ssh_key(&self, id: u64) -> CloudResult<()>;

    /// Look up a snapshot by id
    async fn get_snapshot(&self, id: u64) -> CloudResult<Option<Snapshot>>;
    /// Newest snapshot matching a label selector
    async fn get_snapshot_by_labels(&self, selector: &str) -> CloudResult<Option<Snapshot>>;
    /// Every snapshot matching a label selector
    async fn list_snapshots_by_label(&self, selector: &str) -> CloudResult<Vec<Snapshot>>;
    /// Snapshot a server's disk; returns once the snapshot is available
    async fn create_snapshot(&self, server_id: u64, description: &str, labels: &Labels) -> CloudResult<Snapshot>;
    /// Delete a snapshot
    async fn delete_snapshot(&self, id: u64) -> CloudResult<()>;

    /// Look up a certificate by name
    async fn get_certificate(&self, name: &str) -> CloudResult<Option<Certificate>>;
    /// Request a managed certificate; issuance continues in the background
    async fn create_certificate(&self, request: &CertificateRequest) -> CloudResult<Certificate>;
    /// Delete a certificate
    async fn delete_certificate(&self, id: u64) -> CloudResult<()>;

    /// Every resource of any kind matching a label selector
    async fn list_resources_by_label(&self, selector: &str) -> CloudResult<Vec<ResourceRef>>;
    /// Delete every resource matching a label selector; returns what was deleted
    async fn cleanup_by_label(&self, selector: &str) -> CloudResult<Vec<ResourceRef>>;
}

/// Resolves the caller's public IPv4 for the current-IP firewall policy
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    /// Observe the caller's public IPv4 address
    async fn resolve(&self) -> Result<Ipv4Addr, Error>;
}

/// Default echo endpoint returning the caller's address as plain text
pub const DEFAULT_IP_ECHO_URL: &str = "https://ipv4.icanhazip.com";

/// [`PublicIpResolver`] backed by a plain-text echo service
pub struct HttpPublicIpResolver {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpPublicIpResolver {
    /// Create a resolver for the given echo endpoint
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("public-ip", e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    /// Resolver for [`DEFAULT_IP_ECHO_URL`]
    pub fn with_default_endpoint() -> Result<Self, Error> {
        let endpoint = Url::parse(DEFAULT_IP_ECHO_URL)
            .map_err(|e| Error::internal_with_context("public-ip", e.to_string()))?;
        Self::new(endpoint, Duration::from_secs(10))
    }
}

#[async_trait]
impl PublicIpResolver for HttpPublicIpResolver {
    async fn resolve(&self) -> Result<Ipv4Addr, Error> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::internal_with_context("public-ip", e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::internal_with_context("public-ip", e.to_string()))?;
        let ip = parse_echo_body(&body)?;
        debug!(ip = %ip, endpoint = %self.endpoint, "resolved caller public IP");
        Ok(ip)
    }
}

fn parse_echo_body(body: &str) -> Result<Ipv4Addr, Error> {
    body.trim().parse().map_err(|_| {
        Error::internal_with_context(
            "public-ip",
            format!("echo endpoint returned '{}', not an IPv4 address", body.trim()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        let err = CloudError::new(CloudErrorKind::RateLimited, "demo", "slow down");
        assert!(err.is_transient());
        assert!(err.into_provider_error("demo", "network").is_retryable());

        let err = CloudError::new(CloudErrorKind::Other, "demo", "invalid ip_range");
        let wrapped = err.into_provider_error("demo", "network");
        assert!(!wrapped.is_retryable());
        assert_eq!(wrapped.step(), Some("network"));
    }

    #[test]
    fn echo_body_is_trimmed() {
        assert_eq!(
            parse_echo_body("203.0.113.7\n").unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
        assert!(parse_echo_body("<html>").is_err());
    }

    #[test]
    fn resource_refs_render_kind_and_name() {
        let r = ResourceRef {
            kind: ResourceKind::PlacementGroup,
            id: 7,
            name: "demo-control-plane".into(),
        };
        assert_eq!(r.to_string(), "placement-group demo-control-plane (id 7)");
    }
}
