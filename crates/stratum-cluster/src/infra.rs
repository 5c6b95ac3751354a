//! Infrastructure reconciliation
//!
//! Converges the provider resources of one cluster in a fixed order:
//! SSH key, network, firewall, placement groups, load balancers, images,
//! control-plane servers, worker servers, floating IP. Every resource is
//! looked up by its deterministic name first and created only when absent;
//! existing resources get only the fields that differ updated.
//!
//! A failing step stops the run and leaves everything created so far in
//! place. The next run picks up from there.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use futures::future::try_join_all;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stratum_common::model::{ClusterSpec, FirewallPolicy, NodePool, NodeRole};
use stratum_common::naming::{
    api_load_balancer_name, cluster_labels, cluster_selector, firewall_name, floating_ip_name,
    ingress_certificate_name, ingress_load_balancer_name, member_index, network_name, placement_group_name, role_selector,
    server_labels, server_name, ssh_key_name, NetworkLayout,
};
use stratum_common::poll::{poll_until, run_cancellable, PollOutcome};
use stratum_common::{Error, KUBE_API_PORT, NODE_OS_API_PORT, POOL_LABEL};

use crate::cloud::{
    Certificate, CertificateRequest, CertificateStatus, CloudError, CloudErrorKind, CloudResult, Firewall,
    FirewallRequest, FirewallRule, FloatingIp, HealthCheck, LoadBalancer, LoadBalancerRequest,
    LoadBalancerService, Network, NetworkRequest, PlacementGroup, Protocol, Server, ServerImage,
    ServerRequest, SshKey,
};
use crate::context::Context;
use crate::images::resolve_pool_images;

/// Pipeline steps in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfraStep {
    /// SSH key registration
    SshKey,
    /// Private network and subnets
    Network,
    /// Firewall rules and selector
    Firewall,
    /// Spread placement groups
    PlacementGroups,
    /// API and ingress load balancers
    LoadBalancers,
    /// Node image resolution
    Images,
    /// Control-plane members
    ControlPlaneServers,
    /// Worker members
    WorkerServers,
    /// Floating IP
    FloatingIp,
}

impl InfraStep {
    /// Step name used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraStep::SshKey => "ssh-key",
            InfraStep::Network => "network",
            InfraStep::Firewall => "firewall",
            InfraStep::PlacementGroups => "placement-groups",
            InfraStep::LoadBalancers => "load-balancers",
            InfraStep::Images => "images",
            InfraStep::ControlPlaneServers => "control-plane-servers",
            InfraStep::WorkerServers => "worker-servers",
            InfraStep::FloatingIp => "floating-ip",
        }
    }

    fn for_role(role: NodeRole) -> Self {
        match role {
            NodeRole::ControlPlane => InfraStep::ControlPlaneServers,
            NodeRole::Worker => InfraStep::WorkerServers,
        }
    }
}

impl fmt::Display for InfraStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pool member backed by a server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedNode {
    /// Server (and node) name
    pub name: String,
    /// Role of the member's pool
    pub role: NodeRole,
    /// Pool name
    pub pool: String,
    /// 1-based member index
    pub index: u32,
    /// Deterministic private address
    pub private_ip: Ipv4Addr,
    /// Provider view of the server
    pub server: Server,
}

impl ProvisionedNode {
    /// Public IPv4, required to reach the management API
    pub fn public_ip(&self) -> Result<Ipv4Addr, Error> {
        self.server.public_ipv4.ok_or_else(|| {
            Error::internal_with_context(&self.name, "server has no public IPv4 address")
        })
    }

    /// Management API address
    pub fn management_endpoint(&self) -> Result<SocketAddr, Error> {
        Ok(SocketAddr::from((self.public_ip()?, NODE_OS_API_PORT)))
    }
}

/// Everything a new server is attached to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachments {
    /// Private network id
    pub network_id: u64,
    /// Placement group id per control-plane pool
    pub placement_groups: BTreeMap<String, u64>,
    /// Registered SSH key ids
    pub ssh_key_ids: Vec<u64>,
}

/// Provider resources of a converged cluster
#[derive(Clone, Debug)]
pub struct InfraState {
    /// Subnets and fixed addresses
    pub layout: NetworkLayout,
    /// Private network
    pub network: Network,
    /// Firewall
    pub firewall: Firewall,
    /// SSH key, when one was requested
    pub ssh_key: Option<SshKey>,
    /// Placement groups keyed by pool name
    pub placement_groups: BTreeMap<String, PlacementGroup>,
    /// Kubernetes API load balancer
    pub api_load_balancer: LoadBalancer,
    /// Ingress load balancer, when requested
    pub ingress_load_balancer: Option<LoadBalancer>,
    /// Image per pool
    pub images: BTreeMap<String, ServerImage>,
    /// Control-plane members in pool order, then index order
    pub control_plane: Vec<ProvisionedNode>,
    /// Worker members in pool order, then index order
    pub workers: Vec<ProvisionedNode>,
    /// Floating IP, when requested
    pub floating_ip: Option<FloatingIp>,
}

impl InfraState {
    /// Public address of the Kubernetes API
    pub fn api_endpoint_ip(&self) -> Result<Ipv4Addr, Error> {
        self.api_load_balancer.public_ipv4.ok_or_else(|| {
            Error::internal_with_context(
                &self.api_load_balancer.name,
                "load balancer has no public IPv4 address",
            )
        })
    }

    /// Every member, control plane first
    pub fn nodes(&self) -> impl Iterator<Item = &ProvisionedNode> {
        self.control_plane.iter().chain(self.workers.iter())
    }

    /// Attachments for new servers
    pub fn attachments(&self) -> Attachments {
        Attachments {
            network_id: self.network.id,
            placement_groups: self
                .placement_groups
                .iter()
                .map(|(pool, pg)| (pool.clone(), pg.id))
                .collect(),
            ssh_key_ids: self.ssh_key.iter().map(|k| k.id).collect(),
        }
    }
}

/// Converges provider resources for one cluster spec
pub struct InfraReconciler<'a> {
    ctx: &'a Context,
    spec: &'a ClusterSpec,
    cancel: &'a CancellationToken,
}

impl<'a> InfraReconciler<'a> {
    /// Reconciler for `spec`
    pub fn new(ctx: &'a Context, spec: &'a ClusterSpec, cancel: &'a CancellationToken) -> Self {
        Self { ctx, spec, cancel }
    }

    /// Run every step in order
    pub async fn run(&self) -> Result<InfraState, Error> {
        info!(cluster = %self.spec.name, "Reconciling infrastructure");
        let occupied = self.step(InfraStep::Network, self.occupied_subnets()).await?;
        let layout = NetworkLayout::compute_with(self.spec, &occupied)?;

        let ssh_key = self.step(InfraStep::SshKey, self.ensure_ssh_key()).await?;
        let network = self.step(InfraStep::Network, self.ensure_network(&layout)).await?;
        let firewall = self.step(InfraStep::Firewall, self.ensure_firewall()).await?;
        let placement_groups = self
            .step(InfraStep::PlacementGroups, self.ensure_placement_groups())
            .await?;
        let (api_load_balancer, ingress_load_balancer) = self
            .step(InfraStep::LoadBalancers, self.ensure_load_balancers(&layout, network.id))
            .await?;
        let images = resolve_pool_images(self.ctx, self.spec, &self.spec.versions.talos, self.cancel).await?;

        let mut state = InfraState {
            layout,
            network,
            firewall,
            ssh_key,
            placement_groups,
            api_load_balancer,
            ingress_load_balancer,
            images,
            control_plane: Vec::new(),
            workers: Vec::new(),
            floating_ip: None,
        };

        let control_plane = self
            .step(
                InfraStep::ControlPlaneServers,
                self.ensure_role(&state, NodeRole::ControlPlane),
            )
            .await?;
        state.control_plane = control_plane;
        let workers = self
            .step(InfraStep::WorkerServers, self.ensure_role(&state, NodeRole::Worker))
            .await?;
        state.workers = workers;
        let floating_ip = self
            .step(InfraStep::FloatingIp, self.ensure_floating_ip(&state.control_plane))
            .await?;
        state.floating_ip = floating_ip;

        info!(
            cluster = %self.spec.name,
            control_plane = state.control_plane.len(),
            workers = state.workers.len(),
            api = ?state.api_load_balancer.public_ipv4,
            "Infrastructure converged"
        );
        Ok(state)
    }

    async fn step<T>(&self, step: InfraStep, fut: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        debug!(cluster = %self.spec.name, step = step.as_str(), "Starting step");
        run_cancellable(self.cancel, step.as_str(), fut).await
    }

    fn cloud_error(&self, step: InfraStep, err: CloudError) -> Error {
        err.into_provider_error(&self.spec.name, step.as_str())
    }

    /// Get by name, create when absent. A create racing another writer is
    /// resolved by reading the winner back.
    async fn get_or_create<T, G, GF, C, CF>(
        &self,
        step: InfraStep,
        name: &str,
        get: G,
        create: C,
    ) -> Result<T, Error>
    where
        G: Fn() -> GF,
        GF: Future<Output = CloudResult<Option<T>>>,
        C: FnOnce() -> CF,
        CF: Future<Output = CloudResult<T>>,
    {
        if let Some(existing) = get().await.map_err(|e| self.cloud_error(step, e))? {
            debug!(cluster = %self.spec.name, step = step.as_str(), resource = %name, "Reusing existing resource");
            return Ok(existing);
        }
        match create().await {
            Ok(created) => {
                info!(cluster = %self.spec.name, step = step.as_str(), resource = %name, "Created resource");
                Ok(created)
            }
            Err(e) if e.kind == CloudErrorKind::AlreadyExists => {
                warn!(cluster = %self.spec.name, step = step.as_str(), resource = %name, "Resource already exists, reusing");
                get().await.map_err(|e| self.cloud_error(step, e))?.ok_or_else(|| {
                    Error::provider(
                        &self.spec.name,
                        step.as_str(),
                        name,
                        "create reported an existing resource that cannot be read back",
                        true,
                    )
                })
            }
            Err(e) => Err(self.cloud_error(step, e)),
        }
    }

    async fn ensure_ssh_key(&self) -> Result<Option<SshKey>, Error> {
        let Some(public_key) = self.spec.ssh_public_key.as_deref() else {
            return Ok(None);
        };
        let cloud = &self.ctx.cloud;
        let name = ssh_key_name(&self.spec.name);
        let labels = cluster_labels(&self.spec.name);
        let key = self
            .get_or_create(
                InfraStep::SshKey,
                &name,
                || cloud.get_ssh_key(&name),
                || cloud.create_ssh_key(&name, public_key, &labels),
            )
            .await?;
        Ok(Some(key))
    }

    /// Subnet each pool's existing members live in
    async fn occupied_subnets(&self) -> Result<BTreeMap<String, Ipv4Net>, Error> {
        let servers = self
            .ctx
            .cloud
            .list_servers_by_label(&cluster_selector(&self.spec.name))
            .await
            .map_err(|e| self.cloud_error(InfraStep::Network, e))?;
        let mut occupied = BTreeMap::new();
        for server in servers {
            let (Some(pool), Some(ip)) = (server.labels.get(POOL_LABEL), server.private_ip) else {
                continue;
            };
            let Ok(subnet) = Ipv4Net::new(ip, self.spec.network.subnet_prefix) else {
                continue;
            };
            occupied.entry(pool.clone()).or_insert_with(|| subnet.trunc());
        }
        Ok(occupied)
    }

    async fn ensure_network(&self, layout: &NetworkLayout) -> Result<Network, Error> {
        let step = InfraStep::Network;
        let cloud = &self.ctx.cloud;
        let name = network_name(&self.spec.name);
        let request = NetworkRequest {
            name: name.clone(),
            ip_range: layout.network,
            subnets: layout.subnets(),
            network_zone: self.spec.network_zone.clone(),
            labels: cluster_labels(&self.spec.name),
        };
        let mut network = self
            .get_or_create(step, &name, || cloud.get_network(&name), || cloud.create_network(&request))
            .await?;

        if network.ip_range != layout.network {
            return Err(Error::validation_for_field(
                &self.spec.name,
                "network.cidr",
                format!(
                    "network {} exists with range {}, cannot change it to {}",
                    name, network.ip_range, layout.network
                ),
            ));
        }

        for subnet in layout.subnets() {
            if network.subnets.contains(&subnet) {
                continue;
            }
            info!(cluster = %self.spec.name, subnet = %subnet, "Adding missing subnet");
            cloud
                .add_subnet(network.id, subnet, &self.spec.network_zone)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            network.subnets.push(subnet);
        }
        Ok(network)
    }

    async fn firewall_sources(&self) -> Result<Vec<IpNet>, Error> {
        match &self.spec.firewall {
            FirewallPolicy::Open => {
                let any_v4 = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)
                    .map_err(|e| Error::internal_with_context("firewall", e.to_string()))?;
                let any_v6 = Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0)
                    .map_err(|e| Error::internal_with_context("firewall", e.to_string()))?;
                Ok(vec![IpNet::V4(any_v4), IpNet::V6(any_v6)])
            }
            FirewallPolicy::Allow { cidrs } => cidrs
                .iter()
                .map(|cidr| {
                    cidr.parse::<IpNet>().map_err(|e| {
                        Error::validation_for_field(
                            &self.spec.name,
                            "firewall.cidrs",
                            format!("invalid source '{}': {}", cidr, e),
                        )
                    })
                })
                .collect(),
            FirewallPolicy::CurrentIp => {
                let ip = self.ctx.public_ip.resolve().await?;
                info!(cluster = %self.spec.name, ip = %ip, "Restricting firewall to caller address");
                let net = Ipv4Net::new(ip, 32)
                    .map_err(|e| Error::internal_with_context("firewall", e.to_string()))?;
                Ok(vec![IpNet::V4(net)])
            }
        }
    }

    async fn ensure_firewall(&self) -> Result<Firewall, Error> {
        let step = InfraStep::Firewall;
        let cloud = &self.ctx.cloud;
        let sources = self.firewall_sources().await?;
        let rules = firewall_rules(&sources);
        let name = firewall_name(&self.spec.name);
        let selector = cluster_selector(&self.spec.name);
        let request = FirewallRequest {
            name: name.clone(),
            rules: rules.clone(),
            label_selector: selector.clone(),
            labels: cluster_labels(&self.spec.name),
        };
        let mut firewall = self
            .get_or_create(step, &name, || cloud.get_firewall(&name), || cloud.create_firewall(&request))
            .await?;

        if !same_rules(&firewall.rules, &rules) {
            info!(cluster = %self.spec.name, "Updating firewall rules");
            cloud
                .set_firewall_rules(firewall.id, &rules)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            firewall.rules = rules;
        }
        if !firewall.applied_to.contains(&selector) {
            info!(cluster = %self.spec.name, selector = %selector, "Applying firewall to cluster selector");
            cloud
                .apply_firewall_to_selector(firewall.id, &selector)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            firewall.applied_to.push(selector);
        }
        Ok(firewall)
    }

    async fn ensure_placement_groups(&self) -> Result<BTreeMap<String, PlacementGroup>, Error> {
        let cloud = &self.ctx.cloud;
        let labels = cluster_labels(&self.spec.name);
        let mut groups = BTreeMap::new();
        for pool in &self.spec.control_plane_pools {
            let name = placement_group_name(&self.spec.name, &pool.name);
            let group = self
                .get_or_create(
                    InfraStep::PlacementGroups,
                    &name,
                    || cloud.get_placement_group(&name),
                    || cloud.create_placement_group(&name, &labels),
                )
                .await?;
            groups.insert(pool.name.clone(), group);
        }
        Ok(groups)
    }

    async fn ensure_load_balancers(
        &self,
        layout: &NetworkLayout,
        network_id: u64,
    ) -> Result<(LoadBalancer, Option<LoadBalancer>), Error> {
        let api = self
            .ensure_load_balancer(LoadBalancerRequest {
                name: api_load_balancer_name(&self.spec.name),
                lb_type: self.spec.load_balancer.lb_type.clone(),
                location: self.spec.location.clone(),
                network_id,
                private_ip: Some(layout.api_load_balancer_ip()),
                services: vec![api_service()],
                label_target: role_selector(&self.spec.name, NodeRole::ControlPlane),
                labels: cluster_labels(&self.spec.name),
            })
            .await?;
        if api.public_ipv4.is_none() {
            return Err(Error::provider(
                &self.spec.name,
                InfraStep::LoadBalancers.as_str(),
                &api.name,
                "load balancer has no public IPv4 address",
                true,
            ));
        }

        let ingress = match &self.spec.load_balancer.ingress {
            Some(ingress) => {
                let https = if ingress.domains.is_empty() {
                    tcp_service(443, ingress.https_node_port)
                } else {
                    let certificate = self.ensure_ingress_certificate(&ingress.domains).await?;
                    tls_service(443, ingress.http_node_port, certificate.id)
                };
                let target_role = if self.spec.worker_count() > 0 {
                    NodeRole::Worker
                } else {
                    NodeRole::ControlPlane
                };
                Some(
                    self.ensure_load_balancer(LoadBalancerRequest {
                        name: ingress_load_balancer_name(&self.spec.name),
                        lb_type: ingress.lb_type.clone(),
                        location: self.spec.location.clone(),
                        network_id,
                        private_ip: None,
                        services: vec![tcp_service(80, ingress.http_node_port), https],
                        label_target: role_selector(&self.spec.name, target_role),
                        labels: cluster_labels(&self.spec.name),
                    })
                    .await?,
                )
            }
            None => None,
        };
        Ok((api, ingress))
    }

    /// Get or request the ingress certificate and wait until it is issued
    async fn ensure_ingress_certificate(&self, domains: &[String]) -> Result<Certificate, Error> {
        let step = InfraStep::LoadBalancers;
        let cloud = &self.ctx.cloud;
        let name = ingress_certificate_name(&self.spec.name);
        let request = CertificateRequest {
            name: name.clone(),
            domain_names: domains.to_vec(),
            labels: cluster_labels(&self.spec.name),
        };
        let certificate = self
            .get_or_create(step, &name, || cloud.get_certificate(&name), || cloud.create_certificate(&request))
            .await?;

        let mut wanted = domains.to_vec();
        wanted.sort_unstable();
        let mut covered = certificate.domain_names.clone();
        covered.sort_unstable();
        if wanted != covered {
            return Err(Error::validation_for_field(
                &self.spec.name,
                "loadBalancer.ingress.domains",
                format!(
                    "certificate {} covers {}; delete it to change its domains",
                    name,
                    covered.join(", ")
                ),
            ));
        }
        if certificate.status == CertificateStatus::Issued {
            return Ok(certificate);
        }

        info!(cluster = %self.spec.name, certificate = %name, "Waiting for certificate issuance");
        poll_until(
            self.cancel,
            step.as_str(),
            &name,
            self.ctx.config.timeouts.certificate,
            &self.ctx.config.poll.readiness,
            || async {
                match cloud.get_certificate(&name).await {
                    Ok(Some(c)) => match c.status {
                        CertificateStatus::Issued => Ok(PollOutcome::Ready(c)),
                        CertificateStatus::Pending => {
                            Ok(PollOutcome::Pending("waiting for DNS validation".to_string()))
                        }
                        CertificateStatus::Failed => Err(Error::provider(
                            &self.spec.name,
                            step.as_str(),
                            &name,
                            "certificate issuance failed",
                            false,
                        )),
                    },
                    Ok(None) => Ok(PollOutcome::Pending("certificate not visible yet".to_string())),
                    Err(e) => Err(self.cloud_error(step, e)),
                }
            },
        )
        .await
    }

    async fn ensure_load_balancer(&self, request: LoadBalancerRequest) -> Result<LoadBalancer, Error> {
        let step = InfraStep::LoadBalancers;
        let cloud = &self.ctx.cloud;
        let mut lb = self
            .get_or_create(
                step,
                &request.name,
                || cloud.get_load_balancer(&request.name),
                || cloud.create_load_balancer(&request),
            )
            .await?;

        for service in &request.services {
            match lb.services.iter().position(|s| s.listen_port == service.listen_port) {
                None => {
                    info!(cluster = %self.spec.name, lb = %lb.name, port = service.listen_port, "Adding load balancer service");
                    cloud
                        .add_load_balancer_service(lb.id, service)
                        .await
                        .map_err(|e| self.cloud_error(step, e))?;
                    lb.services.push(service.clone());
                }
                Some(i) if lb.services[i] != *service => {
                    info!(cluster = %self.spec.name, lb = %lb.name, port = service.listen_port, "Updating load balancer service");
                    cloud
                        .update_load_balancer_service(lb.id, service)
                        .await
                        .map_err(|e| self.cloud_error(step, e))?;
                    lb.services[i] = service.clone();
                }
                Some(_) => {}
            }
        }

        if !lb.label_targets.contains(&request.label_target) {
            cloud
                .add_load_balancer_target(lb.id, &request.label_target)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            lb.label_targets.push(request.label_target.clone());
        }

        if lb.network_id != Some(request.network_id) {
            info!(cluster = %self.spec.name, lb = %lb.name, "Attaching load balancer to network");
            cloud
                .attach_load_balancer_to_network(lb.id, request.network_id, request.private_ip)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            lb.network_id = Some(request.network_id);
            lb.private_ip = request.private_ip.or(lb.private_ip);
        }
        Ok(lb)
    }

    async fn ensure_role(&self, state: &InfraState, role: NodeRole) -> Result<Vec<ProvisionedNode>, Error> {
        let pools: Vec<&NodePool> = self
            .spec
            .pools()
            .filter(|(r, _)| *r == role)
            .map(|(_, pool)| pool)
            .collect();

        let existing = self
            .ctx
            .cloud
            .list_servers_by_label(&role_selector(&self.spec.name, role))
            .await
            .map_err(|e| self.cloud_error(InfraStep::for_role(role), e))?;
        let excess = self.excess_members(&pools, &existing);
        if !excess.is_empty() && role == NodeRole::ControlPlane {
            let names: Vec<&str> = excess.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::validation_for_field(
                &self.spec.name,
                "controlPlanePools",
                format!(
                    "removing control-plane members ({}) is not supported by reconcile",
                    names.join(", ")
                ),
            ));
        }

        let attachments = state.attachments();
        let mut members = Vec::new();
        for pool in &pools {
            let image = state.images.get(&pool.name).cloned().ok_or_else(|| {
                Error::internal_with_context(
                    InfraStep::for_role(role).as_str(),
                    format!("no image resolved for pool '{}'", pool.name),
                )
            })?;
            for index in 1..=pool.count {
                members.push(self.ensure_member(&state.layout, &attachments, role, pool, index, image.clone()));
            }
        }
        let nodes = try_join_all(members).await?;

        for server in excess {
            info!(cluster = %self.spec.name, server = %server.name, "Removing worker beyond desired count");
            match self.ctx.cloud.delete_server(server.id).await {
                Ok(()) => {}
                Err(e) if e.kind == CloudErrorKind::NotFound => {}
                Err(e) => return Err(self.cloud_error(InfraStep::for_role(role), e)),
            }
        }
        Ok(nodes)
    }

    /// Existing servers of a role that the desired state no longer asks for, highest
    /// index first
    fn excess_members(&self, pools: &[&NodePool], existing: &[Server]) -> Vec<Server> {
        let wanted: BTreeMap<&str, u32> = pools.iter().map(|p| (p.name.as_str(), p.count)).collect();
        let mut excess: Vec<(u32, Server)> = Vec::new();
        for server in existing {
            let Some(pool) = server.labels.get(POOL_LABEL) else {
                warn!(cluster = %self.spec.name, server = %server.name, "Server has no pool label, leaving it alone");
                continue;
            };
            let Some(index) = member_index(&self.spec.name, pool, &server.name) else {
                warn!(cluster = %self.spec.name, server = %server.name, "Server name does not follow the member scheme, leaving it alone");
                continue;
            };
            match wanted.get(pool.as_str()) {
                Some(count) if index <= *count => {}
                _ => excess.push((index, server.clone())),
            }
        }
        excess.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        excess.into_iter().map(|(_, server)| server).collect()
    }

    /// Get or create one pool member
    pub(crate) async fn ensure_member(
        &self,
        layout: &NetworkLayout,
        attachments: &Attachments,
        role: NodeRole,
        pool: &NodePool,
        index: u32,
        image: ServerImage,
    ) -> Result<ProvisionedNode, Error> {
        let step = InfraStep::for_role(role);
        let cloud = &self.ctx.cloud;
        let name = server_name(&self.spec.name, &pool.name, index);
        let private_ip = layout.member_ip(&pool.name, index)?;
        let request = ServerRequest {
            name: name.clone(),
            server_type: pool.server_type.clone(),
            location: pool.location_or(&self.spec.location).to_string(),
            image,
            network_id: attachments.network_id,
            private_ip,
            placement_group_id: match role {
                NodeRole::ControlPlane => attachments.placement_groups.get(&pool.name).copied(),
                NodeRole::Worker => None,
            },
            ssh_key_ids: attachments.ssh_key_ids.clone(),
            labels: server_labels(&self.spec.name, role, &pool.name),
        };
        let server = self
            .get_or_create(step, &name, || cloud.get_server(&name), || cloud.create_server(&request))
            .await?;
        let private_ip = match server.private_ip {
            Some(actual) if actual != private_ip => {
                warn!(cluster = %self.spec.name, server = %name, expected = %private_ip, actual = %actual, "Server keeps its existing private address");
                actual
            }
            _ => private_ip,
        };
        Ok(ProvisionedNode {
            name,
            role,
            pool: pool.name.clone(),
            index,
            private_ip,
            server,
        })
    }

    async fn ensure_floating_ip(&self, control_plane: &[ProvisionedNode]) -> Result<Option<FloatingIp>, Error> {
        if !self.spec.floating_ip {
            return Ok(None);
        }
        let step = InfraStep::FloatingIp;
        let cloud = &self.ctx.cloud;
        let name = floating_ip_name(&self.spec.name);
        let labels = cluster_labels(&self.spec.name);
        let mut fip = self
            .get_or_create(
                step,
                &name,
                || cloud.get_floating_ip(&name),
                || cloud.create_floating_ip(&name, &self.spec.location, &labels),
            )
            .await?;

        let Some(first) = control_plane.first() else {
            return Ok(Some(fip));
        };
        if fip.server_id != Some(first.server.id) {
            info!(cluster = %self.spec.name, ip = %fip.ip, server = %first.name, "Assigning floating IP");
            cloud
                .assign_floating_ip(fip.id, first.server.id)
                .await
                .map_err(|e| self.cloud_error(step, e))?;
            fip.server_id = Some(first.server.id);
        }
        Ok(Some(fip))
    }
}

/// Rules opening the Kubernetes API and management API ports to `sources`
pub fn firewall_rules(sources: &[IpNet]) -> Vec<FirewallRule> {
    vec![
        FirewallRule {
            description: "kubernetes api".to_string(),
            protocol: Protocol::Tcp,
            port: Some(KUBE_API_PORT),
            source_ips: sources.to_vec(),
        },
        FirewallRule {
            description: "node management api".to_string(),
            protocol: Protocol::Tcp,
            port: Some(NODE_OS_API_PORT),
            source_ips: sources.to_vec(),
        },
    ]
}

/// Whether two rule sets allow the same traffic, ignoring rule and source order
pub fn same_rules(a: &[FirewallRule], b: &[FirewallRule]) -> bool {
    fn canonical(rules: &[FirewallRule]) -> Vec<(Option<u16>, Protocol, String, Vec<IpNet>)> {
        let mut out: Vec<_> = rules
            .iter()
            .map(|r| {
                let mut sources = r.source_ips.clone();
                sources.sort_unstable();
                sources.dedup();
                (r.port, r.protocol, r.description.clone(), sources)
            })
            .collect();
        out.sort_unstable();
        out
    }
    canonical(a) == canonical(b)
}

/// API service: an unauthenticated request is answered with 401 when healthy
pub fn api_service() -> LoadBalancerService {
    LoadBalancerService {
        listen_port: KUBE_API_PORT,
        destination_port: KUBE_API_PORT,
        health_check: HealthCheck::Http {
            port: KUBE_API_PORT,
            path: "/version".to_string(),
            status_codes: vec!["401".to_string()],
            tls: true,
        },
        certificate_ids: Vec::new(),
    }
}

fn tcp_service(listen_port: u16, destination_port: u16) -> LoadBalancerService {
    LoadBalancerService {
        listen_port,
        destination_port,
        health_check: HealthCheck::Tcp {
            port: destination_port,
        },
        certificate_ids: Vec::new(),
    }
}

/// TLS-terminating service forwarding plain traffic to `destination_port`
fn tls_service(listen_port: u16, destination_port: u16, certificate_id: u64) -> LoadBalancerService {
    LoadBalancerService {
        certificate_ids: vec![certificate_id],
        ..tcp_service(listen_port, destination_port)
    }
}

/// Names of every member the desired state asks for
pub fn expected_node_names(spec: &ClusterSpec) -> BTreeSet<String> {
    spec.pools()
        .flat_map(|(_, pool)| (1..=pool.count).map(move |i| server_name(&spec.name, &pool.name, i)))
        .collect()
}
