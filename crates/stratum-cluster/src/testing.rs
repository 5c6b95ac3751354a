//! In-memory cloud, node OS, and cluster for scenario tests
//!
//! One `FakeWorld` backs every collaborator of a [`Context`]: servers created
//! through the fake cloud boot into maintenance mode on the fake node OS,
//! applied configurations turn them into cluster nodes, and the fake
//! Kubernetes API reports those nodes. Hooks inject failures.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::Ipv4Net;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::Instant;
use url::Url;

use stratum_common::kubeconfig::ClusterCredential;
use stratum_common::model::{
    AddonSet, ClusterSpec, FirewallPolicy, ImageRef, LoadBalancerSpec, NetworkSpec, NodePool, NodeRole, Versions,
};
use stratum_common::poll::IntervalStrategy;
use stratum_common::yaml::ObjectIdentity;
use stratum_common::{Error, CLUSTER_LABEL, KUBE_API_PORT, NODE_OS_API_PORT, ROLE_LABEL};

use crate::addons::{Addon, ManifestSource};
use crate::cloud::{
    Certificate, CertificateRequest, CertificateStatus, CloudError, CloudErrorKind, CloudProvider, CloudResult, Firewall, FirewallRequest, FirewallRule, FloatingIp,
    Labels, LoadBalancer, LoadBalancerRequest, LoadBalancerService, Network, NetworkRequest, PlacementGroup,
    PublicIpResolver, ResourceKind, ResourceRef, Server, ServerImage, ServerRequest, ServerStatus, Snapshot, SshKey,
};
use crate::config::{PollConfig, ReconcilerConfig};
use crate::context::Context;
use crate::images::{ImageBuildRequest, ImageBuilder};
use crate::kube_api::{ClusterApi, ClusterApiConnector, NodeInfo, PodInfo};
use crate::node_os::{
    EtcdMember, NodeMode, NodeOsClient, NodeOsConnector, NodeOsError, NodeOsErrorKind, NodeVersion, PortProbe,
    ServiceStatus,
};
use crate::nodeconfig::{MachineConfigInput, NodeConfigGenerator, NodeSecrets};

/// A pool with `count` members on an x86 server type
pub fn pool(name: &str, count: u32) -> NodePool {
    NodePool {
        name: name.to_string(),
        server_type: "cx22".to_string(),
        count,
        image: ImageRef::OsVersion,
        location: None,
        labels: BTreeMap::new(),
    }
}

/// A cluster spec with the given control-plane and worker counts
pub fn spec(name: &str, control_plane: u32, workers: u32) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        location: "fsn1".to_string(),
        network_zone: "eu-central".to_string(),
        network: NetworkSpec::default(),
        firewall: FirewallPolicy::Open,
        control_plane_pools: vec![pool("control-plane", control_plane)],
        worker_pools: if workers > 0 { vec![pool("worker", workers)] } else { vec![] },
        versions: Versions {
            talos: "v1.9.2".to_string(),
            kubernetes: "1.32.1".to_string(),
        },
        load_balancer: LoadBalancerSpec::default(),
        addons: AddonSet::default(),
        ssh_public_key: None,
        floating_ip: false,
        extra_sans: vec![],
    }
}

#[derive(Debug)]
struct FakeNode {
    name: String,
    role: Option<String>,
    mode: NodeMode,
    config: Option<Value>,
    os_version: String,
}

impl FakeNode {
    fn is_control_plane(&self) -> bool {
        self.role.as_deref() == Some(NodeRole::ControlPlane.as_str())
    }
}

/// Injected answer of one node's etcd member list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtcdRead {
    /// Report no members
    Empty,
    /// Fail the call
    Fail,
}

#[derive(Debug)]
struct WorldState {
    next_id: u64,
    networks: BTreeMap<u64, Network>,
    firewalls: BTreeMap<u64, Firewall>,
    placement_groups: BTreeMap<u64, PlacementGroup>,
    load_balancers: BTreeMap<u64, LoadBalancer>,
    servers: BTreeMap<u64, Server>,
    floating_ips: BTreeMap<u64, FloatingIp>,
    ssh_keys: BTreeMap<u64, SshKey>,
    snapshots: Vec<Snapshot>,
    certificates: BTreeMap<u64, Certificate>,
    certificate_outcome: CertificateStatus,
    creates: BTreeMap<ResourceKind, usize>,
    fail_create: BTreeSet<ResourceKind>,
    fail_delete: BTreeSet<ResourceKind>,
    pinned: BTreeSet<ResourceKind>,
    deleted_servers: Vec<String>,
    sweeps: usize,
    fail_server_list: bool,
    rule_updates: usize,
    scramble_rules: bool,
    caller_ip: Ipv4Addr,
    image_builds: usize,
    secrets_generated: usize,

    nodes: BTreeMap<Ipv4Addr, FakeNode>,
    etcd: Vec<String>,
    bootstrapped: bool,
    bootstrap_calls: usize,
    min_etcd: Option<usize>,
    reject_client_certs: bool,
    stalled: BTreeSet<String>,
    not_ready: BTreeSet<String>,
    etcd_reads: BTreeMap<String, EtcdRead>,
    port_opens_at: BTreeMap<String, Instant>,
    mode_refused: BTreeSet<String>,
    applies: BTreeMap<String, usize>,

    kube_secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    applied: Vec<String>,
    failing_addons: BTreeSet<&'static str>,
}

impl WorldState {
    fn new() -> Self {
        Self {
            next_id: 0,
            networks: BTreeMap::new(),
            firewalls: BTreeMap::new(),
            placement_groups: BTreeMap::new(),
            load_balancers: BTreeMap::new(),
            servers: BTreeMap::new(),
            floating_ips: BTreeMap::new(),
            ssh_keys: BTreeMap::new(),
            snapshots: Vec::new(),
            certificates: BTreeMap::new(),
            certificate_outcome: CertificateStatus::Issued,
            creates: BTreeMap::new(),
            fail_create: BTreeSet::new(),
            fail_delete: BTreeSet::new(),
            pinned: BTreeSet::new(),
            deleted_servers: Vec::new(),
            sweeps: 0,
            fail_server_list: false,
            rule_updates: 0,
            scramble_rules: false,
            caller_ip: Ipv4Addr::new(192, 0, 2, 10),
            image_builds: 0,
            secrets_generated: 0,
            nodes: BTreeMap::new(),
            etcd: Vec::new(),
            bootstrapped: false,
            bootstrap_calls: 0,
            min_etcd: None,
            reject_client_certs: false,
            stalled: BTreeSet::new(),
            not_ready: BTreeSet::new(),
            etcd_reads: BTreeMap::new(),
            port_opens_at: BTreeMap::new(),
            mode_refused: BTreeSet::new(),
            applies: BTreeMap::new(),
            kube_secrets: BTreeMap::new(),
            applied: Vec::new(),
            failing_addons: BTreeSet::new(),
        }
    }

    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Count a create of `kind`, or fail it once when injected
    fn begin_create(&mut self, kind: ResourceKind, name: &str, exists: bool) -> CloudResult<u64> {
        if self.fail_create.remove(&kind) {
            return Err(CloudError::new(CloudErrorKind::Timeout, name, "injected create failure"));
        }
        if exists {
            return Err(CloudError::already_exists(name));
        }
        *self.creates.entry(kind).or_default() += 1;
        Ok(self.id())
    }

    /// Check injected delete failures for `kind`
    fn begin_delete(&mut self, kind: ResourceKind, name: &str) -> CloudResult<()> {
        if self.fail_delete.remove(&kind) {
            return Err(CloudError::new(CloudErrorKind::Other, name, "injected delete failure"));
        }
        if self.pinned.contains(&kind) {
            return Err(CloudError::new(CloudErrorKind::Conflict, name, "resource is locked"));
        }
        Ok(())
    }

    fn remove_server(&mut self, id: u64) -> Option<Server> {
        let server = self.servers.remove(&id)?;
        if let Some(ip) = server.public_ipv4 {
            self.nodes.remove(&ip);
        }
        self.deleted_servers.push(server.name.clone());
        Some(server)
    }

    fn resources(&self, selector: &str) -> Vec<ResourceRef> {
        let mut found = Vec::new();
        let mut push = |kind, id: u64, name: &str, labels: &Labels| {
            if matches_selector(labels, selector) {
                found.push(ResourceRef {
                    kind,
                    id,
                    name: name.to_string(),
                });
            }
        };
        for r in self.floating_ips.values() {
            push(ResourceKind::FloatingIp, r.id, &r.name, &r.labels);
        }
        for r in self.servers.values() {
            push(ResourceKind::Server, r.id, &r.name, &r.labels);
        }
        for r in self.load_balancers.values() {
            push(ResourceKind::LoadBalancer, r.id, &r.name, &r.labels);
        }
        for r in self.placement_groups.values() {
            push(ResourceKind::PlacementGroup, r.id, &r.name, &r.labels);
        }
        for r in self.firewalls.values() {
            push(ResourceKind::Firewall, r.id, &r.name, &r.labels);
        }
        for r in self.networks.values() {
            push(ResourceKind::Network, r.id, &r.name, &r.labels);
        }
        for r in self.ssh_keys.values() {
            push(ResourceKind::SshKey, r.id, &r.name, &r.labels);
        }
        for r in &self.snapshots {
            push(ResourceKind::Snapshot, r.id, &r.description, &r.labels);
        }
        for r in self.certificates.values() {
            push(ResourceKind::Certificate, r.id, &r.name, &r.labels);
        }
        found
    }

    fn node_by_name(&mut self, name: &str) -> Option<&mut FakeNode> {
        self.nodes.values_mut().find(|n| n.name == name)
    }

    fn port_open(&self, address: SocketAddr) -> bool {
        let std::net::IpAddr::V4(ip) = address.ip() else {
            return false;
        };
        match address.port() {
            NODE_OS_API_PORT => self.nodes.get(&ip).is_some_and(|n| {
                self.port_opens_at
                    .get(&n.name)
                    .map_or(true, |at| Instant::now() >= *at)
            }),
            KUBE_API_PORT => {
                let control_plane_up = |n: &FakeNode| n.is_control_plane() && n.mode == NodeMode::Configured;
                if let Some(node) = self.nodes.get(&ip) {
                    return control_plane_up(node) && self.bootstrapped;
                }
                self.load_balancers.values().any(|lb| lb.public_ipv4 == Some(ip))
                    && self.bootstrapped
                    && self.nodes.values().any(control_plane_up)
            }
            _ => false,
        }
    }
}

fn matches_selector(labels: &Labels, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|pair| match pair.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(pair),
    })
}

fn offset_ip(base: Ipv4Addr, id: u64) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(id as u32))
}

type Shared = Arc<Mutex<WorldState>>;

fn lock(state: &Shared) -> MutexGuard<'_, WorldState> {
    state.lock().unwrap()
}

/// Shared fake backing every collaborator of a test [`Context`]
pub struct FakeWorld {
    state: Shared,
    dir: TempDir,
}

impl FakeWorld {
    /// Empty world with a fresh state directory
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorldState::new())),
            dir: TempDir::new().unwrap(),
        }
    }

    /// State directory handed to contexts
    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Context with short poll intervals and the default timeouts
    pub fn context(&self) -> Context {
        let mut config = ReconcilerConfig::new(self.state_dir(), "test-token");
        config.poll = PollConfig {
            connect: IntervalStrategy::fixed(Duration::from_millis(10)),
            readiness: IntervalStrategy::fixed(Duration::from_millis(10)),
        };
        self.context_with(config)
    }

    /// Context with the given configuration
    pub fn context_with(&self, config: ReconcilerConfig) -> Context {
        let state = &self.state;
        Context::builder(config)
            .cloud(Arc::new(FakeCloud(state.clone())))
            .node_os(Arc::new(FakeNodeOs(state.clone())))
            .generator(Arc::new(FakeGenerator(state.clone())))
            .cluster_api(Arc::new(FakeClusterConnector(state.clone())))
            .manifests(Arc::new(FakeManifests(state.clone())))
            .image_builder(Arc::new(FakeImageBuilder(state.clone())))
            .public_ip(Arc::new(FakePublicIp(state.clone())))
            .probe(Arc::new(FakeProbe(state.clone())))
            .build()
            .unwrap()
    }

    /// Kubernetes API view of the world
    pub fn cluster_api(&self) -> Arc<dyn ClusterApi> {
        Arc::new(FakeClusterApi(self.state.clone()))
    }

    // -- failure injection --

    /// Fail the next create of `kind`
    pub fn fail_next_create(&self, kind: ResourceKind) {
        lock(&self.state).fail_create.insert(kind);
    }

    /// Fail the next delete of `kind`
    pub fn fail_next_delete(&self, kind: ResourceKind) {
        lock(&self.state).fail_delete.insert(kind);
    }

    /// Make every resource of `kind` undeletable
    pub fn pin(&self, kind: ResourceKind) {
        lock(&self.state).pinned.insert(kind);
    }

    /// Fail rendering of `addon`
    pub fn fail_addon(&self, addon: Addon) {
        lock(&self.state).failing_addons.insert(addon.name());
    }

    /// Address reported by the public IP resolver
    pub fn set_caller_ip(&self, ip: Ipv4Addr) {
        lock(&self.state).caller_ip = ip;
    }

    /// Reject authenticated sessions as if the node trusted another CA
    pub fn reject_client_certificates(&self, reject: bool) {
        lock(&self.state).reject_client_certs = reject;
    }

    /// Keep `node` in maintenance mode after it accepts its configuration
    pub fn stall_reboot(&self, node: &str) {
        lock(&self.state).stalled.insert(node.to_string());
    }

    /// Report `node` as not Ready
    pub fn hold_not_ready(&self, node: &str) {
        lock(&self.state).not_ready.insert(node.to_string());
    }

    /// Fail the next server listing
    pub fn fail_next_server_list(&self) {
        lock(&self.state).fail_server_list = true;
    }

    /// Answer etcd member lists read from `node` with `read`
    pub fn override_etcd_read(&self, node: &str, read: EtcdRead) {
        lock(&self.state).etcd_reads.insert(node.to_string(), read);
    }

    /// Keep the management port of `node` closed for `delay` from now
    pub fn delay_management_port(&self, node: &str, delay: Duration) {
        lock(&self.state)
            .port_opens_at
            .insert(node.to_string(), Instant::now() + delay);
    }

    /// Refuse mode queries against `node`
    pub fn refuse_mode_queries(&self, node: &str) {
        lock(&self.state).mode_refused.insert(node.to_string());
    }

    /// Report firewall rules and their sources in reverse order
    pub fn scramble_firewall_rules(&self) {
        lock(&self.state).scramble_rules = true;
    }

    /// Status new certificates reach on their first read
    pub fn certificates_become(&self, status: CertificateStatus) {
        lock(&self.state).certificate_outcome = status;
    }

    /// Seed a snapshot carrying `labels`
    pub fn add_snapshot(&self, description: &str, labels: Labels) -> u64 {
        let mut state = lock(&self.state);
        let id = state.id();
        state.snapshots.push(Snapshot {
            id,
            description: description.to_string(),
            labels,
        });
        id
    }

    /// Reset `node` to maintenance mode with a blank disk
    pub fn wipe_node(&self, node: &str) {
        let mut state = lock(&self.state);
        if let Some(n) = state.node_by_name(node) {
            n.mode = NodeMode::Maintenance;
            n.config = None;
        }
        state.etcd.retain(|m| m != node);
    }

    // -- observations --

    /// Creates per kind
    pub fn creates(&self, kind: ResourceKind) -> usize {
        lock(&self.state).creates.get(&kind).copied().unwrap_or(0)
    }

    /// Creates across all kinds
    pub fn total_creates(&self) -> usize {
        lock(&self.state).creates.values().sum()
    }

    /// Existing server names, sorted
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).servers.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    /// Existing server ids by name
    pub fn server_ids(&self) -> BTreeMap<String, u64> {
        lock(&self.state)
            .servers
            .values()
            .map(|s| (s.name.clone(), s.id))
            .collect()
    }

    /// Deleted server names in deletion order
    pub fn deleted_servers(&self) -> Vec<String> {
        lock(&self.state).deleted_servers.clone()
    }

    /// Resources labeled for `cluster`
    pub fn resources(&self, cluster: &str) -> Vec<ResourceRef> {
        lock(&self.state).resources(&format!("{}={}", CLUSTER_LABEL, cluster))
    }

    /// Firewall rule replacements received
    pub fn firewall_rule_updates(&self) -> usize {
        lock(&self.state).rule_updates
    }

    /// Existing snapshot ids
    pub fn snapshot_ids(&self) -> Vec<u64> {
        lock(&self.state).snapshots.iter().map(|s| s.id).collect()
    }

    /// Existing certificates
    pub fn certificates(&self) -> Vec<Certificate> {
        lock(&self.state).certificates.values().cloned().collect()
    }

    /// Label sweeps performed
    pub fn sweeps(&self) -> usize {
        lock(&self.state).sweeps
    }

    /// Snapshots built
    pub fn image_builds(&self) -> usize {
        lock(&self.state).image_builds
    }

    /// etcd bootstrap calls received
    pub fn bootstrap_calls(&self) -> usize {
        lock(&self.state).bootstrap_calls
    }

    /// Current etcd members
    pub fn etcd_members(&self) -> Vec<String> {
        lock(&self.state).etcd.clone()
    }

    /// Smallest membership observed after a member left, if any left
    pub fn min_etcd_members(&self) -> Option<usize> {
        lock(&self.state).min_etcd
    }

    /// Configurations applied to `node` across its replacements
    pub fn config_applies(&self, node: &str) -> usize {
        lock(&self.state).applies.get(node).copied().unwrap_or(0)
    }

    /// Configuration currently applied to `node`
    pub fn applied_config(&self, node: &str) -> Option<Value> {
        lock(&self.state).node_by_name(node).and_then(|n| n.config.clone())
    }

    /// Manifests applied to the cluster as `Kind/name`
    pub fn applied_kinds(&self) -> Vec<String> {
        lock(&self.state).applied.clone()
    }

    /// Public addresses of the control-plane servers of `cluster`
    pub fn control_plane_ips(&self, cluster: &str) -> Vec<Ipv4Addr> {
        lock(&self.state)
            .servers
            .values()
            .filter(|s| s.labels.get(CLUSTER_LABEL).map(String::as_str) == Some(cluster))
            .filter(|s| s.labels.get(ROLE_LABEL).map(String::as_str) == Some(NodeRole::ControlPlane.as_str()))
            .filter_map(|s| s.public_ipv4)
            .collect()
    }

    /// Whether the fake network accepts connections on `ip:port`
    pub fn port_open(&self, ip: Ipv4Addr, port: u16) -> bool {
        lock(&self.state).port_open(SocketAddr::from((ip, port)))
    }
}

// -- cloud --

struct FakeCloud(Shared);

fn find<'a, T>(map: &'a BTreeMap<u64, T>, name: &str, name_of: impl Fn(&T) -> &str) -> Option<&'a T> {
    map.values().find(|r| name_of(r) == name)
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn get_network(&self, name: &str) -> CloudResult<Option<Network>> {
        Ok(find(&lock(&self.0).networks, name, |r| &r.name).cloned())
    }

    async fn create_network(&self, request: &NetworkRequest) -> CloudResult<Network> {
        let mut state = lock(&self.0);
        let exists = find(&state.networks, &request.name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::Network, &request.name, exists)?;
        let network = Network {
            id,
            name: request.name.clone(),
            ip_range: request.ip_range,
            subnets: request.subnets.clone(),
            labels: request.labels.clone(),
        };
        state.networks.insert(id, network.clone());
        Ok(network)
    }

    async fn add_subnet(&self, network_id: u64, subnet: Ipv4Net, _network_zone: &str) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let network = state
            .networks
            .get_mut(&network_id)
            .ok_or_else(|| CloudError::not_found(network_id.to_string()))?;
        network.subnets.push(subnet);
        Ok(())
    }

    async fn delete_network(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::Network, &id.to_string())?;
        state.networks.remove(&id).map(|_| ()).ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_firewall(&self, name: &str) -> CloudResult<Option<Firewall>> {
        let state = lock(&self.0);
        let mut firewall = find(&state.firewalls, name, |r| &r.name).cloned();
        if let Some(firewall) = firewall.as_mut().filter(|_| state.scramble_rules) {
            firewall.rules.reverse();
            for rule in &mut firewall.rules {
                rule.source_ips.reverse();
            }
        }
        Ok(firewall)
    }

    async fn create_firewall(&self, request: &FirewallRequest) -> CloudResult<Firewall> {
        let mut state = lock(&self.0);
        let exists = find(&state.firewalls, &request.name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::Firewall, &request.name, exists)?;
        let firewall = Firewall {
            id,
            name: request.name.clone(),
            rules: request.rules.clone(),
            applied_to: vec![request.label_selector.clone()],
            labels: request.labels.clone(),
        };
        state.firewalls.insert(id, firewall.clone());
        Ok(firewall)
    }

    async fn set_firewall_rules(&self, id: u64, rules: &[FirewallRule]) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let firewall = state.firewalls.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        firewall.rules = rules.to_vec();
        state.rule_updates += 1;
        Ok(())
    }

    async fn apply_firewall_to_selector(&self, id: u64, selector: &str) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let firewall = state.firewalls.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        firewall.applied_to.push(selector.to_string());
        Ok(())
    }

    async fn delete_firewall(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::Firewall, &id.to_string())?;
        state.firewalls.remove(&id).map(|_| ()).ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_placement_group(&self, name: &str) -> CloudResult<Option<PlacementGroup>> {
        Ok(find(&lock(&self.0).placement_groups, name, |r| &r.name).cloned())
    }

    async fn create_placement_group(&self, name: &str, labels: &Labels) -> CloudResult<PlacementGroup> {
        let mut state = lock(&self.0);
        let exists = find(&state.placement_groups, name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::PlacementGroup, name, exists)?;
        let group = PlacementGroup {
            id,
            name: name.to_string(),
            labels: labels.clone(),
        };
        state.placement_groups.insert(id, group.clone());
        Ok(group)
    }

    async fn delete_placement_group(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::PlacementGroup, &id.to_string())?;
        state
            .placement_groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_load_balancer(&self, name: &str) -> CloudResult<Option<LoadBalancer>> {
        Ok(find(&lock(&self.0).load_balancers, name, |r| &r.name).cloned())
    }

    async fn create_load_balancer(&self, request: &LoadBalancerRequest) -> CloudResult<LoadBalancer> {
        let mut state = lock(&self.0);
        let exists = find(&state.load_balancers, &request.name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::LoadBalancer, &request.name, exists)?;
        let lb = LoadBalancer {
            id,
            name: request.name.clone(),
            public_ipv4: Some(offset_ip(Ipv4Addr::new(203, 0, 113, 0), id)),
            private_ip: request.private_ip,
            network_id: Some(request.network_id),
            services: request.services.clone(),
            label_targets: vec![request.label_target.clone()],
            labels: request.labels.clone(),
        };
        state.load_balancers.insert(id, lb.clone());
        Ok(lb)
    }

    async fn add_load_balancer_service(&self, id: u64, service: &LoadBalancerService) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let lb = state.load_balancers.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        lb.services.push(service.clone());
        Ok(())
    }

    async fn update_load_balancer_service(&self, id: u64, service: &LoadBalancerService) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let lb = state.load_balancers.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        for existing in lb.services.iter_mut().filter(|s| s.listen_port == service.listen_port) {
            *existing = service.clone();
        }
        Ok(())
    }

    async fn add_load_balancer_target(&self, id: u64, selector: &str) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let lb = state.load_balancers.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        lb.label_targets.push(selector.to_string());
        Ok(())
    }

    async fn attach_load_balancer_to_network(&self, id: u64, network_id: u64, ip: Option<Ipv4Addr>) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let lb = state.load_balancers.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        lb.network_id = Some(network_id);
        lb.private_ip = ip.or(lb.private_ip);
        Ok(())
    }

    async fn delete_load_balancer(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::LoadBalancer, &id.to_string())?;
        state
            .load_balancers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_server(&self, name: &str) -> CloudResult<Option<Server>> {
        Ok(find(&lock(&self.0).servers, name, |r| &r.name).cloned())
    }

    async fn create_server(&self, request: &ServerRequest) -> CloudResult<Server> {
        let mut state = lock(&self.0);
        let exists = find(&state.servers, &request.name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::Server, &request.name, exists)?;
        let public_ip = offset_ip(Ipv4Addr::new(198, 51, 100, 0), id);
        let server = Server {
            id,
            name: request.name.clone(),
            status: ServerStatus::Running,
            public_ipv4: Some(public_ip),
            private_ip: Some(request.private_ip),
            image: Some(request.image.clone()),
            labels: request.labels.clone(),
        };
        let os_version = match &request.image {
            ServerImage::Snapshot(snapshot) => state
                .snapshots
                .iter()
                .find(|s| s.id == *snapshot)
                .and_then(|s| s.labels.get("talos-version").cloned())
                .unwrap_or_else(|| "custom".to_string()),
            ServerImage::Named(name) => name.clone(),
        };
        state.nodes.insert(
            public_ip,
            FakeNode {
                name: request.name.clone(),
                role: request.labels.get(ROLE_LABEL).cloned(),
                mode: NodeMode::Maintenance,
                config: None,
                os_version,
            },
        );
        state.servers.insert(id, server.clone());
        Ok(server)
    }

    async fn delete_server(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::Server, &id.to_string())?;
        state.remove_server(id).map(|_| ()).ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn list_servers_by_label(&self, selector: &str) -> CloudResult<Vec<Server>> {
        let mut state = lock(&self.0);
        if std::mem::take(&mut state.fail_server_list) {
            return Err(CloudError::new(CloudErrorKind::Other, selector, "injected list failure"));
        }
        Ok(state
            .servers
            .values()
            .filter(|s| matches_selector(&s.labels, selector))
            .cloned()
            .collect())
    }

    async fn get_floating_ip(&self, name: &str) -> CloudResult<Option<FloatingIp>> {
        Ok(find(&lock(&self.0).floating_ips, name, |r| &r.name).cloned())
    }

    async fn create_floating_ip(&self, name: &str, _location: &str, labels: &Labels) -> CloudResult<FloatingIp> {
        let mut state = lock(&self.0);
        let exists = find(&state.floating_ips, name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::FloatingIp, name, exists)?;
        let fip = FloatingIp {
            id,
            name: name.to_string(),
            ip: offset_ip(Ipv4Addr::new(198, 18, 0, 0), id),
            server_id: None,
            labels: labels.clone(),
        };
        state.floating_ips.insert(id, fip.clone());
        Ok(fip)
    }

    async fn assign_floating_ip(&self, id: u64, server_id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        let fip = state.floating_ips.get_mut(&id).ok_or_else(|| CloudError::not_found(id.to_string()))?;
        fip.server_id = Some(server_id);
        Ok(())
    }

    async fn delete_floating_ip(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::FloatingIp, &id.to_string())?;
        state
            .floating_ips
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_ssh_key(&self, name: &str) -> CloudResult<Option<SshKey>> {
        Ok(find(&lock(&self.0).ssh_keys, name, |r| &r.name).cloned())
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str, labels: &Labels) -> CloudResult<SshKey> {
        let mut state = lock(&self.0);
        let exists = find(&state.ssh_keys, name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::SshKey, name, exists)?;
        let key = SshKey {
            id,
            name: name.to_string(),
            public_key: public_key.to_string(),
            labels: labels.clone(),
        };
        state.ssh_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn delete_ssh_key(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::SshKey, &id.to_string())?;
        state.ssh_keys.remove(&id).map(|_| ()).ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn get_snapshot(&self, id: u64) -> CloudResult<Option<Snapshot>> {
        Ok(lock(&self.0).snapshots.iter().find(|s| s.id == id).cloned())
    }

    async fn get_snapshot_by_labels(&self, selector: &str) -> CloudResult<Option<Snapshot>> {
        Ok(lock(&self.0)
            .snapshots
            .iter()
            .rev()
            .find(|s| matches_selector(&s.labels, selector))
            .cloned())
    }

    async fn list_snapshots_by_label(&self, selector: &str) -> CloudResult<Vec<Snapshot>> {
        Ok(lock(&self.0)
            .snapshots
            .iter()
            .filter(|s| matches_selector(&s.labels, selector))
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, server_id: u64, description: &str, labels: &Labels) -> CloudResult<Snapshot> {
        let mut state = lock(&self.0);
        if !state.servers.contains_key(&server_id) {
            return Err(CloudError::not_found(server_id.to_string()));
        }
        let id = state.begin_create(ResourceKind::Snapshot, description, false)?;
        let snapshot = Snapshot {
            id,
            description: description.to_string(),
            labels: labels.clone(),
        };
        state.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::Snapshot, &id.to_string())?;
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.id != id);
        if state.snapshots.len() == before {
            return Err(CloudError::not_found(id.to_string()));
        }
        Ok(())
    }

    async fn get_certificate(&self, name: &str) -> CloudResult<Option<Certificate>> {
        let mut state = lock(&self.0);
        let outcome = state.certificate_outcome;
        let certificate = state.certificates.values_mut().find(|c| c.name == name);
        Ok(certificate.map(|c| {
            if c.status == CertificateStatus::Pending {
                c.status = outcome;
            }
            c.clone()
        }))
    }

    async fn create_certificate(&self, request: &CertificateRequest) -> CloudResult<Certificate> {
        let mut state = lock(&self.0);
        let exists = find(&state.certificates, &request.name, |r| &r.name).is_some();
        let id = state.begin_create(ResourceKind::Certificate, &request.name, exists)?;
        let certificate = Certificate {
            id,
            name: request.name.clone(),
            domain_names: request.domain_names.clone(),
            status: CertificateStatus::Pending,
            labels: request.labels.clone(),
        };
        state.certificates.insert(id, certificate.clone());
        Ok(certificate)
    }

    async fn delete_certificate(&self, id: u64) -> CloudResult<()> {
        let mut state = lock(&self.0);
        state.begin_delete(ResourceKind::Certificate, &id.to_string())?;
        state
            .certificates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(id.to_string()))
    }

    async fn list_resources_by_label(&self, selector: &str) -> CloudResult<Vec<ResourceRef>> {
        Ok(lock(&self.0).resources(selector))
    }

    async fn cleanup_by_label(&self, selector: &str) -> CloudResult<Vec<ResourceRef>> {
        let mut state = lock(&self.0);
        state.sweeps += 1;
        let mut removed = Vec::new();
        for resource in state.resources(selector) {
            if state.pinned.contains(&resource.kind) {
                continue;
            }
            let gone = match resource.kind {
                ResourceKind::Server => state.remove_server(resource.id).is_some(),
                ResourceKind::Network => state.networks.remove(&resource.id).is_some(),
                ResourceKind::Firewall => state.firewalls.remove(&resource.id).is_some(),
                ResourceKind::PlacementGroup => state.placement_groups.remove(&resource.id).is_some(),
                ResourceKind::LoadBalancer => state.load_balancers.remove(&resource.id).is_some(),
                ResourceKind::FloatingIp => state.floating_ips.remove(&resource.id).is_some(),
                ResourceKind::SshKey => state.ssh_keys.remove(&resource.id).is_some(),
                ResourceKind::Snapshot => {
                    let before = state.snapshots.len();
                    state.snapshots.retain(|s| s.id != resource.id);
                    state.snapshots.len() != before
                }
                ResourceKind::Certificate => state.certificates.remove(&resource.id).is_some(),
            };
            if gone {
                removed.push(resource);
            }
        }
        Ok(removed)
    }
}

struct FakeImageBuilder(Shared);

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build(&self, request: &ImageBuildRequest) -> Result<Snapshot, Error> {
        let mut state = lock(&self.0);
        state.image_builds += 1;
        let snapshot = Snapshot {
            id: state.id(),
            description: format!("talos {} {}", request.os_version, request.arch.as_str()),
            labels: request.labels.clone(),
        };
        state.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }
}

struct FakePublicIp(Shared);

#[async_trait]
impl PublicIpResolver for FakePublicIp {
    async fn resolve(&self) -> Result<Ipv4Addr, Error> {
        Ok(lock(&self.0).caller_ip)
    }
}

struct FakeProbe(Shared);

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_open(&self, address: SocketAddr) -> bool {
        lock(&self.0).port_open(address)
    }
}

// -- node OS --

struct FakeNodeOs(Shared);

fn ipv4(endpoint: SocketAddr) -> Option<Ipv4Addr> {
    match endpoint.ip() {
        std::net::IpAddr::V4(ip) if endpoint.port() == NODE_OS_API_PORT => Some(ip),
        _ => None,
    }
}

fn unreachable(endpoint: SocketAddr) -> NodeOsError {
    NodeOsError::new(NodeOsErrorKind::Unreachable, endpoint.to_string(), "connection refused")
}

#[async_trait]
impl NodeOsConnector for FakeNodeOs {
    async fn probe_mode(&self, endpoint: SocketAddr) -> Result<NodeMode, NodeOsError> {
        let state = lock(&self.0);
        ipv4(endpoint)
            .and_then(|ip| state.nodes.get(&ip))
            .filter(|n| !state.mode_refused.contains(&n.name))
            .map(|n| n.mode)
            .ok_or_else(|| unreachable(endpoint))
    }

    async fn apply_config_insecure(&self, endpoint: SocketAddr, config: &[u8]) -> Result<(), NodeOsError> {
        let parsed: Value = serde_json::from_slice(config)
            .map_err(|e| NodeOsError::new(NodeOsErrorKind::Other, endpoint.to_string(), e.to_string()))?;
        let mut state = lock(&self.0);
        let ip = ipv4(endpoint).ok_or_else(|| unreachable(endpoint))?;
        let bootstrapped = state.bootstrapped;
        let stalled = state.stalled.clone();
        let node = state.nodes.get_mut(&ip).ok_or_else(|| unreachable(endpoint))?;
        if node.mode != NodeMode::Maintenance {
            return Err(NodeOsError::new(
                NodeOsErrorKind::Other,
                endpoint.to_string(),
                "configuration already applied",
            ));
        }
        node.config = Some(parsed);
        let name = node.name.clone();
        let joins_etcd = node.is_control_plane() && bootstrapped;
        if !stalled.contains(&name) {
            node.mode = NodeMode::Configured;
            if joins_etcd && !state.etcd.contains(&name) {
                state.etcd.push(name.clone());
            }
        }
        *state.applies.entry(name).or_default() += 1;
        Ok(())
    }

    async fn connect(&self, endpoint: SocketAddr, _client_config: &[u8]) -> Result<Arc<dyn NodeOsClient>, NodeOsError> {
        let state = lock(&self.0);
        let ip = ipv4(endpoint).ok_or_else(|| unreachable(endpoint))?;
        let node = state.nodes.get(&ip).ok_or_else(|| unreachable(endpoint))?;
        if node.mode == NodeMode::Maintenance {
            return Err(NodeOsError::new(
                NodeOsErrorKind::Other,
                endpoint.to_string(),
                "maintenance mode does not serve authenticated sessions",
            ));
        }
        if state.reject_client_certs {
            return Err(NodeOsError::new(
                NodeOsErrorKind::Tls,
                endpoint.to_string(),
                "x509: certificate signed by unknown authority",
            ));
        }
        Ok(Arc::new(FakeNodeClient {
            state: self.0.clone(),
            ip,
            endpoint: endpoint.to_string(),
        }))
    }
}

struct FakeNodeClient {
    state: Shared,
    ip: Ipv4Addr,
    endpoint: String,
}

impl FakeNodeClient {
    fn gone(&self) -> NodeOsError {
        NodeOsError::new(NodeOsErrorKind::Unreachable, self.endpoint.clone(), "connection reset")
    }
}

#[async_trait]
impl NodeOsClient for FakeNodeClient {
    async fn version(&self) -> Result<NodeVersion, NodeOsError> {
        let state = lock(&self.state);
        let node = state.nodes.get(&self.ip).ok_or_else(|| self.gone())?;
        Ok(NodeVersion {
            tag: node.os_version.clone(),
            arch: "amd64".to_string(),
        })
    }

    async fn service_status(&self, service: &str) -> Result<ServiceStatus, NodeOsError> {
        let state = lock(&self.state);
        state.nodes.get(&self.ip).ok_or_else(|| self.gone())?;
        Ok(ServiceStatus {
            id: service.to_string(),
            state: "Running".to_string(),
            healthy: true,
        })
    }

    async fn etcd_members(&self) -> Result<Vec<EtcdMember>, NodeOsError> {
        let state = lock(&self.state);
        let node = state.nodes.get(&self.ip).ok_or_else(|| self.gone())?;
        match state.etcd_reads.get(&node.name) {
            Some(EtcdRead::Empty) => return Ok(Vec::new()),
            Some(EtcdRead::Fail) => {
                return Err(NodeOsError::new(
                    NodeOsErrorKind::Other,
                    self.endpoint.clone(),
                    "etcdserver: request timed out",
                ))
            }
            None => {}
        }
        if !node.is_control_plane() || !state.etcd.contains(&node.name) {
            return Ok(Vec::new());
        }
        Ok(state
            .etcd
            .iter()
            .enumerate()
            .map(|(i, hostname)| EtcdMember {
                id: i as u64 + 1,
                hostname: hostname.clone(),
                is_learner: false,
            })
            .collect())
    }

    async fn bootstrap(&self) -> Result<(), NodeOsError> {
        let mut state = lock(&self.state);
        state.bootstrap_calls += 1;
        if state.bootstrapped {
            return Err(NodeOsError::new(
                NodeOsErrorKind::AlreadyBootstrapped,
                self.endpoint.clone(),
                "etcd data directory is not empty",
            ));
        }
        let name = state.nodes.get(&self.ip).ok_or_else(|| self.gone())?.name.clone();
        state.bootstrapped = true;
        state.etcd = vec![name];
        Ok(())
    }

    async fn etcd_leave(&self) -> Result<(), NodeOsError> {
        let mut state = lock(&self.state);
        let name = state.nodes.get(&self.ip).ok_or_else(|| self.gone())?.name.clone();
        state.etcd.retain(|m| *m != name);
        let remaining = state.etcd.len();
        state.min_etcd = Some(state.min_etcd.map_or(remaining, |m| m.min(remaining)));
        Ok(())
    }
}

// -- configuration generator --

struct FakeGenerator(Shared);

impl FakeGenerator {
    fn config(role: &str, input: &MachineConfigInput) -> Result<Vec<u8>, Error> {
        let doc = json!({
            "role": role,
            "hostname": input.hostname,
            "kubernetes": input.kubernetes_version,
            "endpoint": input.endpoint.to_string(),
            "certSans": input.cert_sans,
            "privateIp": input.private_ip.to_string(),
            "inlineManifests": input.inline_manifests.len(),
        });
        serde_json::to_vec(&doc).map_err(|e| Error::serialization(e.to_string()))
    }
}

impl NodeConfigGenerator for FakeGenerator {
    fn generate_secrets(&self, _os_version: &str) -> Result<NodeSecrets, Error> {
        let mut state = lock(&self.0);
        state.secrets_generated += 1;
        Ok(NodeSecrets::new(format!("secrets-{}", state.secrets_generated).into_bytes()))
    }

    fn validate_secrets(&self, secrets: &NodeSecrets) -> Result<(), String> {
        if secrets.as_bytes().starts_with(b"secrets-") {
            Ok(())
        } else {
            Err("not a secrets bundle".to_string())
        }
    }

    fn control_plane_config(&self, _secrets: &NodeSecrets, input: &MachineConfigInput) -> Result<Vec<u8>, Error> {
        Self::config("controlplane", input)
    }

    fn worker_config(&self, _secrets: &NodeSecrets, input: &MachineConfigInput) -> Result<Vec<u8>, Error> {
        Self::config("worker", input)
    }

    fn client_config(&self, _secrets: &NodeSecrets, cluster_name: &str, endpoints: &[String]) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(&json!({ "context": cluster_name, "endpoints": endpoints }))
            .map_err(|e| Error::serialization(e.to_string()))
    }

    fn kubeconfig(&self, _secrets: &NodeSecrets, cluster_name: &str, endpoint: &Url) -> Result<Vec<u8>, Error> {
        Ok(format!(
            "apiVersion: v1\n\
             kind: Config\n\
             clusters:\n\
             - name: {c}\n  cluster:\n    server: {endpoint}\n\
             users:\n\
             - name: admin@{c}\n  user:\n    token: fake\n\
             contexts:\n\
             - name: admin@{c}\n  context:\n    cluster: {c}\n    user: admin@{c}\n\
             current-context: admin@{c}\n",
            c = cluster_name,
            endpoint = endpoint
        )
        .into_bytes())
    }
}

// -- Kubernetes --

struct FakeClusterConnector(Shared);

#[async_trait]
impl ClusterApiConnector for FakeClusterConnector {
    async fn connect(&self, _credential: &ClusterCredential) -> Result<Arc<dyn ClusterApi>, Error> {
        Ok(Arc::new(FakeClusterApi(self.0.clone())))
    }
}

struct FakeClusterApi(Shared);

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        let state = lock(&self.0);
        let mut nodes: Vec<NodeInfo> = state
            .nodes
            .values()
            .filter(|n| n.mode == NodeMode::Configured)
            .filter_map(|n| {
                let kubernetes = n.config.as_ref()?.get("kubernetes")?.as_str()?;
                Some(NodeInfo {
                    name: n.name.clone(),
                    ready: !state.not_ready.contains(&n.name),
                    kubelet_version: format!("v{}", kubernetes),
                    os_image: format!("Talos ({})", n.os_version),
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<PodInfo>, Error> {
        Ok(vec![PodInfo {
            name: format!("{}-0", selector.rsplit('=').next().unwrap_or("pod")),
            phase: "Running".to_string(),
            ready: true,
        }])
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        Ok(lock(&self.0)
            .kube_secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply(&self, manifest: &Value) -> Result<(), Error> {
        let identity = ObjectIdentity::of(manifest)?;
        let mut state = lock(&self.0);
        if identity.kind == "Secret" {
            let data = manifest
                .get("data")
                .and_then(Value::as_object)
                .map(|data| {
                    data.iter()
                        .filter_map(|(k, v)| Some((k.clone(), STANDARD.decode(v.as_str()?).ok()?)))
                        .collect()
                })
                .unwrap_or_default();
            let namespace = identity.namespace.clone().unwrap_or_else(|| "default".to_string());
            state.kube_secrets.insert((namespace, identity.name.clone()), data);
        }
        state.applied.push(format!("{}/{}", identity.kind, identity.name));
        Ok(())
    }

    async fn delete_node(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
}

struct FakeManifests(Shared);

#[async_trait]
impl ManifestSource for FakeManifests {
    async fn render(&self, addon: Addon, _values: &Value) -> Result<String, Error> {
        if lock(&self.0).failing_addons.contains(addon.name()) {
            return Err(Error::internal_with_context(addon.name(), "chart repository unavailable"));
        }
        Ok(format!(
            "apiVersion: apps/v1\n\
             kind: DaemonSet\n\
             metadata:\n  name: {name}\n  namespace: kube-system\n\
             ---\n\
             apiVersion: v1\n\
             kind: ServiceAccount\n\
             metadata:\n  name: {name}\n  namespace: kube-system\n",
            name = addon.name()
        ))
    }
}
