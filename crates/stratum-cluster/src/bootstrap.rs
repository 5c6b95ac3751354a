//! Control-plane bootstrap
//!
//! Each node starts in maintenance mode and accepts its configuration once
//! over an unauthenticated connection. After the reboot that follows, it
//! only answers authenticated sessions. The sequencer never trusts an assumed
//! state: it probes every node on entry and only applies configuration to
//! nodes that still answer in maintenance mode.
//!
//! etcd is bootstrapped on the first control-plane node, once, and only
//! when every other control-plane node is known to hold no members. A node
//! whose membership cannot be read blocks the bootstrap. Re-running against
//! a bootstrapped cluster goes straight to the readiness waits.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use stratum_common::kubeconfig::ClusterCredential;
use stratum_common::model::{ClusterSpec, NodeRole};
use stratum_common::poll::{poll_until, run_cancellable, PollOutcome};
use stratum_common::{Error, KUBE_API_PORT};

use crate::addons::cni_inline_manifest;
use crate::config::POD_CIDR;
use crate::context::Context;
use crate::diagnostics;
use crate::infra::{expected_node_names, InfraState, ProvisionedNode};
use crate::kube_api::ClusterApi;
use crate::node_os::{NodeMode, NodeOsClient, NodeOsErrorKind};
use crate::nodeconfig::{InlineManifest, MachineConfigInput, NodeSecrets};

/// Single-attempt probes made while deciding whether to bootstrap
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sequencer steps, used as the `step` of errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Management port reachable after provisioning
    MaintenancePort,
    /// Configuration applied in maintenance mode
    ApplyConfig,
    /// Node back in configured mode
    Reboot,
    /// Authenticated session established
    AuthenticatedConnect,
    /// One-time etcd bootstrap
    EtcdBootstrap,
    /// etcd membership converged
    EtcdMembership,
    /// Kubernetes API reachable through the load balancer
    KubeApi,
    /// Expected node count Ready
    NodeReady,
    /// Kubeconfig fetched, verified, persisted
    Credential,
}

impl BootstrapStep {
    /// Step name used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapStep::MaintenancePort => "maintenance-port",
            BootstrapStep::ApplyConfig => "apply-config",
            BootstrapStep::Reboot => "reboot",
            BootstrapStep::AuthenticatedConnect => "authenticated-connect",
            BootstrapStep::EtcdBootstrap => "etcd-bootstrap",
            BootstrapStep::EtcdMembership => "etcd-membership",
            BootstrapStep::KubeApi => "kube-api",
            BootstrapStep::NodeReady => "node-ready",
            BootstrapStep::Credential => "credential",
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one control-plane node. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Maintenance mode
    Unconfigured,
    /// Configured, etcd reports no members
    ConfiguredUnbootstrapped,
    /// Configured, etcd reports members
    ConfiguredBootstrapped,
}

impl NodeState {
    /// Whether configuration was already applied
    pub fn is_configured(&self) -> bool {
        !matches!(self, NodeState::Unconfigured)
    }
}

/// Result of a successful bootstrap
pub struct BootstrapOutcome {
    /// Verified admin credential
    pub credential: ClusterCredential,
    /// Where the credential was written
    pub kubeconfig_path: PathBuf,
    /// Kubernetes API session through the load balancer
    pub api: Arc<dyn ClusterApi>,
}

impl fmt::Debug for BootstrapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapOutcome")
            .field("credential", &self.credential)
            .field("kubeconfig_path", &self.kubeconfig_path)
            .finish_non_exhaustive()
    }
}

/// Error tagged with where it happened
struct Failure {
    node: String,
    step: BootstrapStep,
    error: Error,
}

trait At<T> {
    fn at(self, node: &str, step: BootstrapStep) -> Result<T, Failure>;
}

impl<T> At<T> for Result<T, Error> {
    fn at(self, node: &str, step: BootstrapStep) -> Result<T, Failure> {
        self.map_err(|error| Failure {
            node: node.to_string(),
            step,
            error,
        })
    }
}

/// Drives the nodes of a provisioned cluster to a ready control plane
pub struct BootstrapSequencer<'a> {
    ctx: &'a Context,
    spec: &'a ClusterSpec,
    infra: &'a InfraState,
    secrets: &'a NodeSecrets,
    cancel: &'a CancellationToken,
    lb_ip: Ipv4Addr,
    endpoint: Url,
    cert_sans: Vec<String>,
    inline_manifests: Vec<InlineManifest>,
    client_config: Vec<u8>,
}

impl<'a> BootstrapSequencer<'a> {
    /// Derive the endpoint, certificate names, inline manifests, and
    /// management client configuration, and persist the latter
    pub async fn prepare(
        ctx: &'a Context,
        spec: &'a ClusterSpec,
        infra: &'a InfraState,
        secrets: &'a NodeSecrets,
        cancel: &'a CancellationToken,
    ) -> Result<Self, Error> {
        let lb_ip = infra.api_endpoint_ip()?;
        let endpoint = api_endpoint(lb_ip)?;
        let inline_manifests = run_cancellable(cancel, "render-cni", cni_inline_manifest(ctx, spec))
            .await?
            .into_iter()
            .collect();
        let client_config = client_config_for(ctx, spec, secrets, &infra.control_plane)?;
        ctx.store.write_client_config(&spec.name, &client_config)?;

        Ok(Self {
            ctx,
            spec,
            infra,
            secrets,
            cancel,
            lb_ip,
            endpoint,
            cert_sans: cert_sans(spec, infra),
            inline_manifests,
            client_config,
        })
    }

    /// Management client configuration used for authenticated sessions
    pub fn client_config(&self) -> &[u8] {
        &self.client_config
    }

    /// Run the full sequence. Fatal failures carry a diagnostic snapshot.
    pub async fn run(&self) -> Result<BootstrapOutcome, Error> {
        match self.sequence().await {
            Ok(outcome) => Ok(outcome),
            Err(Failure {
                error: error @ Error::Cancelled { .. },
                ..
            }) => Err(error),
            Err(Failure { node, step, error }) => {
                error!(cluster = %self.spec.name, node = %node, step = step.as_str(), error = %error, "Bootstrap failed, collecting diagnostics");
                let report = diagnostics::collect(self.ctx, self.infra, &self.client_config).await;
                Err(error.with_diagnostics(node, step.as_str(), report))
            }
        }
    }

    async fn sequence(&self) -> Result<BootstrapOutcome, Failure> {
        let cluster = self.spec.name.as_str();
        let Some(first) = self.infra.control_plane.first() else {
            return Err(Error::internal_with_context("bootstrap", "no control-plane nodes")).at(cluster, BootstrapStep::MaintenancePort);
        };

        info!(cluster, nodes = self.infra.control_plane.len(), "Bootstrapping control plane");
        let first_client = self.configure_node(first).await?;
        self.bootstrap_once(first, first_client.as_ref()).await?;
        for node in self.infra.control_plane.iter().skip(1) {
            self.configure_node(node).await?;
        }
        self.wait_etcd_members(&first.name, first_client.as_ref(), self.infra.control_plane.len())
            .await
            .at(&first.name, BootstrapStep::EtcdMembership)?;

        if !self.infra.workers.is_empty() {
            info!(cluster, workers = self.infra.workers.len(), "Configuring workers");
            try_join_all(self.infra.workers.iter().map(|node| self.configure_node(node))).await?;
        }

        let (credential, api) = self.connect_cluster().await?;
        self.wait_nodes_ready(api.as_ref()).await.at(cluster, BootstrapStep::NodeReady)?;
        let kubeconfig_path = self
            .ctx
            .store
            .write_kubeconfig(cluster, credential.as_bytes())
            .at(cluster, BootstrapStep::Credential)?;

        info!(cluster, server = %credential.server(), path = %kubeconfig_path.display(), "Control plane ready");
        Ok(BootstrapOutcome {
            credential,
            kubeconfig_path,
            api,
        })
    }

    /// Bring one node to an authenticated session, applying configuration
    /// only if it still answers in maintenance mode
    async fn configure_node(&self, node: &ProvisionedNode) -> Result<Arc<dyn NodeOsClient>, Failure> {
        let name = node.name.as_str();
        let endpoint = node.management_endpoint().at(name, BootstrapStep::MaintenancePort)?;
        let timeouts = &self.ctx.config.timeouts;

        // Port and mode share one maintenance budget
        let deadline = Instant::now() + timeouts.maintenance_port;
        self.wait_port(name, endpoint, BootstrapStep::MaintenancePort, timeouts.maintenance_port)
            .await
            .at(name, BootstrapStep::MaintenancePort)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mode = self
            .wait_mode(name, endpoint, None, BootstrapStep::MaintenancePort, remaining)
            .await
            .at(name, BootstrapStep::MaintenancePort)?;

        match mode {
            NodeMode::Maintenance => {
                info!(cluster = %self.spec.name, node = name, role = %node.role, "Applying configuration in maintenance mode");
                let input = self.machine_input(node);
                let config = match node.role {
                    NodeRole::ControlPlane => self.ctx.generator.control_plane_config(self.secrets, &input),
                    NodeRole::Worker => self.ctx.generator.worker_config(self.secrets, &input),
                }
                .at(name, BootstrapStep::ApplyConfig)?;
                run_cancellable(self.cancel, BootstrapStep::ApplyConfig.as_str(), async {
                    self.ctx
                        .node_os
                        .apply_config_insecure(endpoint, &config)
                        .await
                        .map_err(|e| e.into_error(name))
                })
                .await
                .at(name, BootstrapStep::ApplyConfig)?;

                self.wait_mode(name, endpoint, Some(NodeMode::Configured), BootstrapStep::Reboot, timeouts.reboot)
                    .await
                    .at(name, BootstrapStep::Reboot)?;
                info!(cluster = %self.spec.name, node = name, "Node rebooted into configured mode");
            }
            NodeMode::Configured => {
                debug!(cluster = %self.spec.name, node = name, "Node already configured, not re-applying");
            }
        }

        self.authenticated_connect(name, endpoint)
            .await
            .at(name, BootstrapStep::AuthenticatedConnect)
    }

    async fn wait_port(
        &self,
        node: &str,
        endpoint: SocketAddr,
        step: BootstrapStep,
        timeout: Duration,
    ) -> Result<(), Error> {
        let probe = &self.ctx.probe;
        poll_until(
            self.cancel,
            step.as_str(),
            node,
            timeout,
            &self.ctx.config.poll.connect,
            || async {
                if probe.is_open(endpoint).await {
                    Ok(PollOutcome::Ready(()))
                } else {
                    Ok(PollOutcome::Pending(format!("{} not accepting connections", endpoint)))
                }
            },
        )
        .await
    }

    /// Wait until the management API answers, optionally in a specific mode
    async fn wait_mode(
        &self,
        node: &str,
        endpoint: SocketAddr,
        want: Option<NodeMode>,
        step: BootstrapStep,
        timeout: Duration,
    ) -> Result<NodeMode, Error> {
        let node_os = &self.ctx.node_os;
        poll_until(
            self.cancel,
            step.as_str(),
            node,
            timeout,
            &self.ctx.config.poll.connect,
            || async {
                match node_os.probe_mode(endpoint).await {
                    Ok(mode) if want.is_none() || want == Some(mode) => Ok(PollOutcome::Ready(mode)),
                    Ok(mode) => Ok(PollOutcome::Pending(format!("still in {:?} mode", mode))),
                    Err(e) => Ok(PollOutcome::Pending(e.to_string())),
                }
            },
        )
        .await
    }

    async fn authenticated_connect(&self, node: &str, endpoint: SocketAddr) -> Result<Arc<dyn NodeOsClient>, Error> {
        let node_os = &self.ctx.node_os;
        let client_config = self.client_config.as_slice();
        poll_until(
            self.cancel,
            BootstrapStep::AuthenticatedConnect.as_str(),
            node,
            self.ctx.config.timeouts.authenticated_connect,
            &self.ctx.config.poll.connect,
            || async {
                match node_os.connect(endpoint, client_config).await {
                    Ok(client) => Ok(PollOutcome::Ready(client)),
                    Err(e) if e.kind == NodeOsErrorKind::Tls => {
                        // The unauthenticated path still answering means the
                        // node is healthy but trusts a different identity.
                        match node_os.probe_mode(endpoint).await {
                            Ok(_) => Err(e.into_error(node)),
                            Err(probe) => Ok(PollOutcome::Pending(format!("{}; {}", e, probe))),
                        }
                    }
                    Err(e) => Ok(PollOutcome::Pending(e.to_string())),
                }
            },
        )
        .await
    }

    /// Probe one node without waiting. `Err` says why its etcd state cannot
    /// be told yet; a configured node whose membership is unreadable is never
    /// taken for an unbootstrapped one.
    async fn observe(&self, node: &ProvisionedNode) -> Result<NodeState, String> {
        let endpoint = node.management_endpoint().map_err(|e| e.to_string())?;
        match tokio::time::timeout(PROBE_TIMEOUT, self.ctx.node_os.probe_mode(endpoint)).await {
            Ok(Ok(NodeMode::Maintenance)) => return Ok(NodeState::Unconfigured),
            Ok(Ok(NodeMode::Configured)) => {}
            Ok(Err(e)) => return Err(format!("management API not answering: {}", e)),
            Err(_) => return Err("management API probe timed out".to_string()),
        }
        let members = tokio::time::timeout(PROBE_TIMEOUT, async {
            let client = self.ctx.node_os.connect(endpoint, &self.client_config).await?;
            client.etcd_members().await
        })
        .await;
        match members {
            Ok(Ok(members)) if !members.is_empty() => Ok(NodeState::ConfiguredBootstrapped),
            Ok(Ok(_)) => Ok(NodeState::ConfiguredUnbootstrapped),
            Ok(Err(e)) => Err(format!("etcd membership unreadable: {}", e)),
            Err(_) => Err("etcd membership read timed out".to_string()),
        }
    }

    /// Issue the etcd bootstrap on `first` unless any control-plane node
    /// already reports members. Peers whose state cannot be read are polled
    /// until they answer; the step fails instead of bootstrapping blind.
    async fn bootstrap_once(&self, first: &ProvisionedNode, client: &dyn NodeOsClient) -> Result<(), Failure> {
        let name = first.name.as_str();
        let step = BootstrapStep::EtcdBootstrap;

        let own = run_cancellable(self.cancel, step.as_str(), async {
            client.etcd_members().await.map_err(|e| e.into_error(name))
        })
        .await
        .at(name, step)?;
        if !own.is_empty() {
            info!(cluster = %self.spec.name, node = name, members = own.len(), "etcd already bootstrapped");
            return Ok(());
        }

        let bootstrapped_peer = poll_until(
            self.cancel,
            step.as_str(),
            name,
            self.ctx.config.timeouts.etcd_membership,
            &self.ctx.config.poll.readiness,
            || async {
                let mut undecided = Vec::new();
                for other in self.infra.control_plane.iter().skip(1) {
                    match self.observe(other).await {
                        Ok(NodeState::ConfiguredBootstrapped) => {
                            return Ok(PollOutcome::Ready(Some(other.name.clone())));
                        }
                        Ok(state) => {
                            debug!(cluster = %self.spec.name, node = %other.name, state = ?state, "Observed control-plane node");
                        }
                        Err(reason) => {
                            warn!(cluster = %self.spec.name, node = %other.name, reason = %reason, "Cannot tell etcd state of control-plane node");
                            undecided.push(format!("{}: {}", other.name, reason));
                        }
                    }
                }
                if undecided.is_empty() {
                    Ok(PollOutcome::Ready(None))
                } else {
                    Ok(PollOutcome::Pending(undecided.join("; ")))
                }
            },
        )
        .await
        .at(name, step)?;
        if let Some(peer) = bootstrapped_peer {
            info!(cluster = %self.spec.name, node = %peer, "etcd already bootstrapped on another member");
            return Ok(());
        }

        info!(cluster = %self.spec.name, node = name, "Bootstrapping etcd");
        run_cancellable(self.cancel, step.as_str(), async {
            client.bootstrap().await.map_err(|e| e.into_error(name))
        })
        .await
        .at(name, step)?;

        self.wait_etcd_members(name, client, 1)
            .await
            .at(name, BootstrapStep::EtcdMembership)
    }

    /// Wait until etcd reports `expected` voting members
    pub(crate) async fn wait_etcd_members(
        &self,
        node: &str,
        client: &dyn NodeOsClient,
        expected: usize,
    ) -> Result<(), Error> {
        poll_until(
            self.cancel,
            BootstrapStep::EtcdMembership.as_str(),
            node,
            self.ctx.config.timeouts.etcd_membership,
            &self.ctx.config.poll.readiness,
            || async {
                let members = client.etcd_members().await.map_err(|e| e.into_error(node))?;
                let voting = members.iter().filter(|m| !m.is_learner).count();
                if voting >= expected && members.len() == voting {
                    Ok(PollOutcome::Ready(()))
                } else {
                    Ok(PollOutcome::Pending(format!(
                        "{}/{} etcd members ({} learners)",
                        voting,
                        expected,
                        members.len() - voting
                    )))
                }
            },
        )
        .await
    }

    async fn connect_cluster(&self) -> Result<(ClusterCredential, Arc<dyn ClusterApi>), Failure> {
        let cluster = self.spec.name.as_str();
        let lb = SocketAddr::from((self.lb_ip, KUBE_API_PORT));
        self.wait_port("load-balancer", lb, BootstrapStep::KubeApi, self.ctx.config.timeouts.kube_api)
            .await
            .at(cluster, BootstrapStep::KubeApi)?;

        let raw = self
            .ctx
            .generator
            .kubeconfig(self.secrets, cluster, &self.endpoint)
            .at(cluster, BootstrapStep::Credential)?;
        let credential = ClusterCredential::verify(raw, &self.lb_ip.to_string()).at(cluster, BootstrapStep::Credential)?;
        let api = run_cancellable(
            self.cancel,
            BootstrapStep::KubeApi.as_str(),
            self.ctx.cluster_api.connect(&credential),
        )
        .await
        .at(cluster, BootstrapStep::KubeApi)?;
        Ok((credential, api))
    }

    /// Wait until every expected member reports Ready
    pub(crate) async fn wait_nodes_ready(&self, api: &dyn ClusterApi) -> Result<(), Error> {
        let expected = expected_node_names(self.spec);
        let observed = AtomicUsize::new(0);
        let result = poll_until(
            self.cancel,
            BootstrapStep::NodeReady.as_str(),
            &self.spec.name,
            self.ctx.config.timeouts.node_ready,
            &self.ctx.config.poll.readiness,
            || async {
                let nodes = api.list_nodes().await?;
                let ready = nodes
                    .iter()
                    .filter(|n| n.ready && expected.contains(&n.name))
                    .count();
                observed.store(ready, Ordering::Relaxed);
                if ready == expected.len() {
                    Ok(PollOutcome::Ready(()))
                } else {
                    Ok(PollOutcome::Pending(format!("{}/{} nodes ready", ready, expected.len())))
                }
            },
        )
        .await;

        match result {
            Err(Error::Timeout { .. }) => Err(Error::NodeCountMismatch {
                expected: expected.len(),
                ready: observed.load(Ordering::Relaxed),
            }),
            other => other,
        }
    }

    /// Configure a freshly created replacement member and return its session
    pub(crate) async fn configure_replacement(&self, node: &ProvisionedNode) -> Result<Arc<dyn NodeOsClient>, Error> {
        self.configure_node(node).await.map_err(|failure| match failure.error {
            error @ Error::Cancelled { .. } => error,
            error => Error::upgrade(&failure.node, format!("[{}] {}", failure.step, error)),
        })
    }

    /// Open an authenticated session to an existing member
    pub(crate) async fn connect_node(&self, node: &ProvisionedNode) -> Result<Arc<dyn NodeOsClient>, Error> {
        let endpoint = node.management_endpoint()?;
        self.authenticated_connect(&node.name, endpoint).await
    }

    fn machine_input(&self, node: &ProvisionedNode) -> MachineConfigInput {
        let node_labels = self
            .spec
            .pools()
            .find(|(_, pool)| pool.name == node.pool)
            .map(|(_, pool)| pool.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let cni = self.spec.addons.cni.as_ref();
        MachineConfigInput {
            cluster_name: self.spec.name.clone(),
            endpoint: self.endpoint.clone(),
            cert_sans: self.cert_sans.clone(),
            kubernetes_version: self.spec.versions.kubernetes.trim_start_matches('v').to_string(),
            hostname: node.name.clone(),
            role: node.role,
            private_ip: node.private_ip,
            node_labels,
            pod_cidr: POD_CIDR.to_string(),
            external_cloud_provider: self.spec.addons.ccm,
            disable_default_cni: cni.is_some(),
            disable_kube_proxy: cni.is_some_and(|c| c.kube_proxy_replacement),
            inline_manifests: match node.role {
                NodeRole::ControlPlane => self.inline_manifests.clone(),
                NodeRole::Worker => Vec::new(),
            },
        }
    }
}

/// `https://<ip>:6443`
pub fn api_endpoint(ip: Ipv4Addr) -> Result<Url, Error> {
    Url::parse(&format!("https://{}:{}", ip, KUBE_API_PORT))
        .map_err(|e| Error::internal_with_context("endpoint", e.to_string()))
}

/// Certificate names: load balancer public and private address, floating IP,
/// then any extra names, without duplicates
pub fn cert_sans(spec: &ClusterSpec, infra: &InfraState) -> Vec<String> {
    let lb = &infra.api_load_balancer;
    let candidates = lb
        .public_ipv4
        .iter()
        .chain(lb.private_ip.iter())
        .chain(infra.floating_ip.as_ref().map(|f| &f.ip))
        .map(|ip| ip.to_string())
        .chain(spec.extra_sans.iter().cloned());
    let mut sans: Vec<String> = Vec::new();
    for san in candidates {
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    sans
}

/// Management client configuration listing the control-plane public addresses
pub(crate) fn client_config_for(
    ctx: &Context,
    spec: &ClusterSpec,
    secrets: &NodeSecrets,
    control_plane: &[ProvisionedNode],
) -> Result<Vec<u8>, Error> {
    let endpoints: Vec<String> = control_plane
        .iter()
        .filter_map(|n| n.server.public_ipv4)
        .map(|ip| ip.to_string())
        .collect();
    ctx.generator.client_config(secrets, &spec.name, &endpoints)
}
