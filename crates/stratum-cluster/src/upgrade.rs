//! Rolling replacement upgrades
//!
//! Nodes are immutable: an upgrade replaces every member whose image or
//! kubelet version differs from the desired state, one at a time, control
//! plane first. A control-plane member leaves etcd before its server is
//! deleted and the replacement has to rejoin before the next one goes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stratum_common::kubeconfig::ClusterCredential;
use stratum_common::model::{ClusterSpec, ImageRef, NodeRole};
use stratum_common::naming::server_name;
use stratum_common::poll::{poll_until, run_cancellable, PollOutcome};
use stratum_common::Error;

use crate::bootstrap::{client_config_for, BootstrapSequencer};
use crate::cloud::CloudErrorKind;
use crate::context::Context;
use crate::infra::{expected_node_names, InfraReconciler, InfraState, ProvisionedNode};
use crate::kube_api::{ClusterApi, NodeInfo};
use crate::nodeconfig::NodeSecrets;

/// Step name used in errors and logs
pub const UPGRADE_STEP: &str = "upgrade";

/// Budget for a deleted server to disappear from the provider
const SERVER_GONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Tracks which etcd members are out so a removal never breaks quorum
#[derive(Clone, Debug)]
pub struct QuorumTracker {
    members: usize,
    absent: BTreeSet<String>,
}

impl QuorumTracker {
    /// Tracker for a control plane of `members` nodes
    pub fn new(members: usize) -> Self {
        Self {
            members,
            absent: BTreeSet::new(),
        }
    }

    /// Members that may be absent at once: `(n - 1) / 2`
    pub fn max_absent(&self) -> usize {
        self.members.saturating_sub(1) / 2
    }

    /// Members currently present
    pub fn available(&self) -> usize {
        self.members - self.absent.len()
    }

    /// Fail with [`Error::Quorum`] if taking `node` out would break quorum
    pub fn check_can_remove(&self, node: &str) -> Result<(), Error> {
        if self.members <= 1 {
            return Err(Error::quorum(format!(
                "cannot replace {}: a single-member control plane has no quorum to spare",
                node
            )));
        }
        if self.absent.len() + 1 > self.max_absent() {
            return Err(Error::quorum(format!(
                "cannot replace {}: {} of {} members already out, at most {} may be",
                node,
                self.absent.len(),
                self.members,
                self.max_absent()
            )));
        }
        Ok(())
    }

    /// Mark `node` as out
    pub fn remove(&mut self, node: &str) -> Result<(), Error> {
        self.check_can_remove(node)?;
        self.absent.insert(node.to_string());
        Ok(())
    }

    /// Mark `node` as back
    pub fn restore(&mut self, node: &str) {
        self.absent.remove(node);
    }
}

/// Result of a completed upgrade
pub struct UpgradeOutcome {
    /// Members that were replaced, in replacement order
    pub replaced: Vec<String>,
    /// Admin credential
    pub credential: ClusterCredential,
    /// Where the credential was written
    pub kubeconfig_path: PathBuf,
}

/// Drives a rolling replacement towards the desired versions
pub struct Upgrader<'a> {
    ctx: &'a Context,
    spec: &'a ClusterSpec,
    cancel: &'a CancellationToken,
}

impl<'a> Upgrader<'a> {
    /// Upgrader for `spec`
    pub fn new(ctx: &'a Context, spec: &'a ClusterSpec, cancel: &'a CancellationToken) -> Self {
        Self { ctx, spec, cancel }
    }

    /// Converge the cluster, then replace stale members and verify versions
    pub async fn run(&self, secrets: &NodeSecrets) -> Result<UpgradeOutcome, Error> {
        let cluster = self.spec.name.as_str();
        let infra_reconciler = InfraReconciler::new(self.ctx, self.spec, self.cancel);
        let infra = infra_reconciler.run().await?;
        let sequencer = BootstrapSequencer::prepare(self.ctx, self.spec, &infra, secrets, self.cancel).await?;
        let bootstrapped = sequencer.run().await?;
        let api = bootstrapped.api.as_ref();

        let kubelets: BTreeMap<String, NodeInfo> = run_cancellable(self.cancel, UPGRADE_STEP, api.list_nodes())
            .await?
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let target_kubelet = self.spec.versions.kubelet_version();
        let stale = |node: &ProvisionedNode| -> bool {
            let image_stale = node.server.image.as_ref() != infra.images.get(&node.pool);
            let kubelet_stale = kubelets
                .get(&node.name)
                .is_none_or(|n| n.kubelet_version != target_kubelet);
            image_stale || kubelet_stale
        };

        let stale_control_plane: Vec<&ProvisionedNode> = infra.control_plane.iter().filter(|&n| stale(n)).collect();
        let stale_workers: Vec<&ProvisionedNode> = infra.workers.iter().filter(|&n| stale(n)).collect();
        info!(
            cluster,
            control_plane = stale_control_plane.len(),
            workers = stale_workers.len(),
            target = %target_kubelet,
            os = %self.spec.versions.talos,
            "Planned rolling replacement"
        );

        let mut tracker = QuorumTracker::new(infra.control_plane.len());
        if let Some(first) = stale_control_plane.first() {
            tracker.check_can_remove(&first.name)?;
        }

        let mut replaced = Vec::new();
        let mut current_control_plane = infra.control_plane.clone();
        for node in stale_control_plane {
            tracker.remove(&node.name)?;
            let replacement = self.replace(&infra_reconciler, &infra, &sequencer, api, node).await?;
            tracker.restore(&node.name);
            if let Some(slot) = current_control_plane.iter_mut().find(|n| n.name == node.name) {
                *slot = replacement;
            }
            replaced.push(node.name.clone());
        }
        for node in stale_workers {
            self.replace(&infra_reconciler, &infra, &sequencer, api, node).await?;
            replaced.push(node.name.clone());
        }

        self.verify_versions(api).await?;

        if !replaced.is_empty() {
            let client_config = client_config_for(self.ctx, self.spec, secrets, &current_control_plane)?;
            self.ctx.store.write_client_config(cluster, &client_config)?;
        }
        info!(cluster, replaced = replaced.len(), "Upgrade complete");

        Ok(UpgradeOutcome {
            replaced,
            credential: bootstrapped.credential,
            kubeconfig_path: bootstrapped.kubeconfig_path,
        })
    }

    /// Replace one member and wait until the cluster has it back
    async fn replace(
        &self,
        infra_reconciler: &InfraReconciler<'_>,
        infra: &InfraState,
        sequencer: &BootstrapSequencer<'_>,
        api: &dyn ClusterApi,
        node: &ProvisionedNode,
    ) -> Result<ProvisionedNode, Error> {
        let cluster = self.spec.name.as_str();
        let name = node.name.as_str();
        let pool = self
            .spec
            .pools()
            .find(|(role, pool)| *role == node.role && pool.name == node.pool)
            .map(|(_, pool)| pool)
            .ok_or_else(|| Error::upgrade(name, format!("pool '{}' is no longer in the desired state", node.pool)))?;
        let image = infra
            .images
            .get(&node.pool)
            .cloned()
            .ok_or_else(|| Error::upgrade(name, format!("no image resolved for pool '{}'", node.pool)))?;

        info!(cluster, node = name, role = %node.role, "Replacing member");
        if node.role == NodeRole::ControlPlane {
            let client = sequencer.connect_node(node).await?;
            run_cancellable(self.cancel, UPGRADE_STEP, async {
                client.etcd_leave().await.map_err(|e| e.into_error(name))
            })
            .await?;
            info!(cluster, node = name, "Member left etcd");
        }

        run_cancellable(self.cancel, UPGRADE_STEP, async {
            match self.ctx.cloud.delete_server(node.server.id).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind == CloudErrorKind::NotFound => {
                    warn!(cluster, node = name, "Server already gone");
                    Ok(())
                }
                Err(e) => Err(e.into_provider_error(cluster, UPGRADE_STEP)),
            }
        })
        .await?;
        self.wait_server_gone(name).await?;
        run_cancellable(self.cancel, UPGRADE_STEP, api.delete_node(name)).await?;

        let replacement = infra_reconciler
            .ensure_member(&infra.layout, &infra.attachments(), node.role, pool, node.index, image)
            .await?;
        let client = sequencer.configure_replacement(&replacement).await?;
        if node.role == NodeRole::ControlPlane {
            sequencer
                .wait_etcd_members(name, client.as_ref(), infra.control_plane.len())
                .await
                .map_err(|e| match e {
                    e @ Error::Cancelled { .. } => e,
                    e => Error::upgrade(name, e.to_string()),
                })?;
        }
        sequencer.wait_nodes_ready(api).await.map_err(|e| match e {
            e @ Error::Cancelled { .. } => e,
            e => Error::upgrade(name, e.to_string()),
        })?;

        info!(cluster, node = name, "Member replaced");
        Ok(replacement)
    }

    async fn wait_server_gone(&self, name: &str) -> Result<(), Error> {
        let cluster = self.spec.name.as_str();
        let cloud = &self.ctx.cloud;
        poll_until(
            self.cancel,
            UPGRADE_STEP,
            name,
            SERVER_GONE_TIMEOUT,
            &self.ctx.config.poll.connect,
            || async {
                match cloud.get_server(name).await {
                    Ok(None) => Ok(PollOutcome::Ready(())),
                    Ok(Some(server)) => Ok(PollOutcome::Pending(format!("server {} still {:?}", server.id, server.status))),
                    Err(e) => Err(e.into_provider_error(cluster, UPGRADE_STEP)),
                }
            },
        )
        .await
    }

    /// Every expected node reports the target kubelet, and nodes of
    /// version-tracking pools report the target OS
    async fn verify_versions(&self, api: &dyn ClusterApi) -> Result<(), Error> {
        let expected = expected_node_names(self.spec);
        let tracking_os: BTreeSet<String> = self
            .spec
            .pools()
            .filter(|(_, pool)| pool.image == ImageRef::OsVersion)
            .flat_map(|(_, pool)| {
                (1..=pool.count).map(move |i| server_name(&self.spec.name, &pool.name, i))
            })
            .collect();
        let target_kubelet = self.spec.versions.kubelet_version();

        let nodes = run_cancellable(self.cancel, UPGRADE_STEP, api.list_nodes()).await?;
        for name in &expected {
            let Some(node) = nodes.iter().find(|n| &n.name == name) else {
                return Err(Error::upgrade(name, "node is not registered"));
            };
            if node.kubelet_version != target_kubelet {
                return Err(Error::upgrade(
                    name,
                    format!("kubelet {} does not match {}", node.kubelet_version, target_kubelet),
                ));
            }
            if tracking_os.contains(name) && !node.os_image.contains(&self.spec.versions.talos) {
                return Err(Error::upgrade(
                    name,
                    format!("OS image '{}' does not match {}", node.os_image, self.spec.versions.talos),
                ));
            }
        }
        Ok(())
    }
}
