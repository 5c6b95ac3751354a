//! Desired-state model
//!
//! A [`ClusterSpec`] is the immutable input to one reconciliation run. The
//! external configuration layer builds it (and may change it between runs);
//! nothing in the reconciler mutates it.

use std::collections::{BTreeMap, HashSet};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Maximum cluster name length; every owned resource name is prefixed with it
const MAX_CLUSTER_NAME_LEN: usize = 32;

/// Role a node pool plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    /// Runs etcd and the Kubernetes control plane
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl NodeRole {
    /// Canonical label value
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of a server type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// x86_64 server types
    Amd64,
    /// Ampere server types (`cax*`)
    Arm64,
}

impl Arch {
    /// Derive the architecture from a provider server type name
    pub fn from_server_type(server_type: &str) -> Self {
        if server_type.to_ascii_lowercase().starts_with("cax") {
            Arch::Arm64
        } else {
            Arch::Amd64
        }
    }

    /// Label value used on snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

/// Complete desired state of one cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Global identifier, used as the name prefix of every owned resource
    pub name: String,

    /// Provider location for servers and load balancers (e.g. `fsn1`)
    pub location: String,

    /// Provider network zone for subnets (e.g. `eu-central`)
    #[serde(default = "default_network_zone")]
    pub network_zone: String,

    /// Private network layout
    #[serde(default)]
    pub network: NetworkSpec,

    /// Source restriction for the management and Kubernetes API ports
    #[serde(default)]
    pub firewall: FirewallPolicy,

    /// Control-plane pools (at least one)
    pub control_plane_pools: Vec<NodePool>,

    /// Worker pools (may be empty)
    #[serde(default)]
    pub worker_pools: Vec<NodePool>,

    /// Node OS and Kubernetes versions
    pub versions: Versions,

    /// Load balancer sizing and optional ingress balancer
    #[serde(default)]
    pub load_balancer: LoadBalancerSpec,

    /// Platform services installed after bootstrap
    #[serde(default)]
    pub addons: AddonSet,

    /// Public key registered with the provider for server creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,

    /// Allocate a floating IP for a public control-plane endpoint
    #[serde(default)]
    pub floating_ip: bool,

    /// Additional Subject-Alternative-Names for the API certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_sans: Vec<String>,
}

fn default_network_zone() -> String {
    "eu-central".to_string()
}

/// Private network configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Top-level IPv4 range; every subnet is carved from it deterministically
    pub cidr: String,
    /// Prefix length of each carved subnet
    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: u8,
}

fn default_subnet_prefix() -> u8 {
    24
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            subnet_prefix: default_subnet_prefix(),
        }
    }
}

impl NetworkSpec {
    /// Parse the top-level range
    pub fn parsed(&self) -> Result<Ipv4Net, Error> {
        self.cidr
            .parse::<Ipv4Net>()
            .map(|net| net.trunc())
            .map_err(|e| Error::validation(format!("invalid network cidr '{}': {}", self.cidr, e)))
    }
}

/// Who may reach the Kubernetes API and node management ports
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum FirewallPolicy {
    /// Any IPv4/IPv6 source
    #[default]
    Open,
    /// Only the listed CIDRs
    Allow {
        /// Source ranges
        cidrs: Vec<String>,
    },
    /// Only the caller's public IPv4, resolved fresh on every run
    CurrentIp,
}

/// How a pool's servers get their OS image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ImageRef {
    /// A specific snapshot id
    Snapshot {
        /// Provider snapshot id
        id: u64,
    },
    /// A named provider base image
    Named {
        /// Image name
        name: String,
    },
    /// The snapshot labelled with the desired OS version and the pool's arch
    #[default]
    OsVersion,
}

/// One group of identically configured servers
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name; members are `<cluster>-<pool>-<index>`
    pub name: String,
    /// Provider server type (e.g. `cx22`, `cax21`)
    pub server_type: String,
    /// Desired member count
    pub count: u32,
    /// OS image source
    #[serde(default)]
    pub image: ImageRef,
    /// Location override; defaults to the cluster location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Extra Kubernetes node labels written into the machine configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NodePool {
    /// Architecture of this pool's server type
    pub fn arch(&self) -> Arch {
        Arch::from_server_type(&self.server_type)
    }

    /// Effective location for this pool
    pub fn location_or<'a>(&'a self, cluster_location: &'a str) -> &'a str {
        self.location.as_deref().unwrap_or(cluster_location)
    }
}

/// Node OS / Kubernetes version pair
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Versions {
    /// Node OS release (e.g. `v1.9.2`)
    pub talos: String,
    /// Kubernetes release without the leading `v` (e.g. `1.32.1`)
    pub kubernetes: String,
}

impl Versions {
    /// Kubelet version string as reported by the node list
    pub fn kubelet_version(&self) -> String {
        format!("v{}", self.kubernetes.trim_start_matches('v'))
    }
}

/// Load balancer configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Provider load balancer type for the API balancer
    #[serde(default = "default_lb_type")]
    pub lb_type: String,
    /// Optional second balancer for ingress traffic to workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressLoadBalancer>,
}

fn default_lb_type() -> String {
    "lb11".to_string()
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            lb_type: default_lb_type(),
            ingress: None,
        }
    }
}

/// Ingress balancer forwarding 80/443 to node ports
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressLoadBalancer {
    /// Provider load balancer type
    #[serde(default = "default_lb_type")]
    pub lb_type: String,
    /// Node port receiving HTTP
    #[serde(default = "default_http_node_port")]
    pub http_node_port: u16,
    /// Node port receiving HTTPS
    #[serde(default = "default_https_node_port")]
    pub https_node_port: u16,
    /// Domains of a provider-managed certificate. When set, the balancer
    /// terminates TLS on 443 and forwards plain HTTP to `http_node_port`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

fn default_http_node_port() -> u16 {
    30080
}

fn default_https_node_port() -> u16 {
    30443
}

/// Transparent encryption mode for the CNI
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CniEncryption {
    /// Plain pod-to-pod traffic
    #[default]
    None,
    /// WireGuard tunnels
    Wireguard,
    /// IPsec with a cluster-wide pre-shared key
    Ipsec,
}

/// CNI options
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniSpec {
    /// Encryption mode
    #[serde(default)]
    pub encryption: CniEncryption,
    /// Replace kube-proxy with the CNI's eBPF service implementation
    #[serde(default)]
    pub kube_proxy_replacement: bool,
}

/// Platform services to install after bootstrap
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonSet {
    /// Cloud-controller integration
    #[serde(default = "default_true")]
    pub ccm: bool,
    /// Storage integration
    #[serde(default = "default_true")]
    pub csi: bool,
    /// CNI; `None` leaves networking to something installed out of band
    #[serde(default = "default_cni")]
    pub cni: Option<CniSpec>,
    /// Resource metrics API
    #[serde(default)]
    pub metrics_server: bool,
    /// Certificate issuance
    #[serde(default)]
    pub cert_manager: bool,
    /// Ingress controller
    #[serde(default)]
    pub ingress: bool,
    /// GitOps controller
    #[serde(default)]
    pub gitops: bool,
}

fn default_true() -> bool {
    true
}

fn default_cni() -> Option<CniSpec> {
    Some(CniSpec::default())
}

impl Default for AddonSet {
    fn default() -> Self {
        Self {
            ccm: true,
            csi: true,
            cni: default_cni(),
            metrics_server: false,
            cert_manager: false,
            ingress: false,
            gitops: false,
        }
    }
}

impl AddonSet {
    /// True when no addon is enabled
    pub fn is_empty(&self) -> bool {
        !self.ccm
            && !self.csi
            && self.cni.is_none()
            && !self.metrics_server
            && !self.cert_manager
            && !self.ingress
            && !self.gitops
    }
}

impl ClusterSpec {
    /// Every pool paired with its role, control-plane pools first
    pub fn pools(&self) -> impl Iterator<Item = (NodeRole, &NodePool)> {
        self.control_plane_pools
            .iter()
            .map(|p| (NodeRole::ControlPlane, p))
            .chain(self.worker_pools.iter().map(|p| (NodeRole::Worker, p)))
    }

    /// Desired control-plane member count across all control-plane pools
    pub fn control_plane_count(&self) -> u32 {
        self.control_plane_pools.iter().map(|p| p.count).sum()
    }

    /// Desired worker count across all worker pools
    pub fn worker_count(&self) -> u32 {
        self.worker_pools.iter().map(|p| p.count).sum()
    }

    /// Desired node count across all pools
    pub fn total_nodes(&self) -> u32 {
        self.control_plane_count() + self.worker_count()
    }

    /// Validate the desired state before any resource is touched
    pub fn validate(&self) -> Result<(), Error> {
        validate_dns_label(&self.name).map_err(|msg| {
            Error::validation_for_field(&self.name, "name", format!("cluster name {}", msg))
        })?;
        if self.name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(Error::validation_for_field(
                &self.name,
                "name",
                format!("cluster name must be at most {} characters", MAX_CLUSTER_NAME_LEN),
            ));
        }
        if self.location.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "location",
                "location cannot be empty",
            ));
        }

        if self.control_plane_pools.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "controlPlanePools",
                "at least one control-plane pool is required",
            ));
        }
        for (i, pool) in self.control_plane_pools.iter().enumerate() {
            if pool.count == 0 {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("controlPlanePools[{}].count", i),
                    "control-plane pools must have at least one member",
                ));
            }
        }
        let cp = self.control_plane_count();
        if cp > 1 && cp.is_multiple_of(2) {
            return Err(Error::validation_for_field(
                &self.name,
                "controlPlanePools",
                "control plane count must be odd for HA (1, 3, 5, ...)",
            ));
        }

        let mut seen = HashSet::new();
        for (role, pool) in self.pools() {
            validate_dns_label(&pool.name).map_err(|msg| {
                Error::validation_for_field(
                    &self.name,
                    format!("{} pool '{}'", role, pool.name),
                    format!("pool name {}", msg),
                )
            })?;
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("{} pool '{}'", role, pool.name),
                    "pool names must be unique across control-plane and worker pools",
                ));
            }
            if pool.server_type.is_empty() {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("{} pool '{}'", role, pool.name),
                    "server type cannot be empty",
                ));
            }
        }

        if let Some(ingress) = &self.load_balancer.ingress {
            if let Some(domain) = ingress
                .domains
                .iter()
                .find(|d| d.is_empty() || d.chars().any(char::is_whitespace))
            {
                return Err(Error::validation_for_field(
                    &self.name,
                    "loadBalancer.ingress.domains",
                    format!("invalid certificate domain '{}'", domain),
                ));
            }
        }

        if self.versions.talos.is_empty() || self.versions.kubernetes.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "versions",
                "both node OS and Kubernetes versions are required",
            ));
        }

        if let FirewallPolicy::Allow { cidrs } = &self.firewall {
            if cidrs.is_empty() {
                return Err(Error::validation_for_field(
                    &self.name,
                    "firewall.cidrs",
                    "allow policy needs at least one source range",
                ));
            }
            for cidr in cidrs {
                cidr.parse::<ipnet::IpNet>().map_err(|e| {
                    Error::validation_for_field(
                        &self.name,
                        "firewall.cidrs",
                        format!("invalid source range '{}': {}", cidr, e),
                    )
                })?;
            }
        }

        // Subnet layout must fit; this also validates the cidr itself.
        crate::naming::NetworkLayout::compute(self)?;

        Ok(())
    }
}

/// Check RFC 1123 label rules; returns a message fragment on failure
fn validate_dns_label(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("cannot be empty".to_string());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "'{}' must contain only lowercase letters, digits, and '-'",
            value
        ));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(format!("'{}' must not start or end with '-'", value));
    }
    Ok(())
}
