//! Kubernetes API access for readiness checks and addon installation
//!
//! [`ClusterApi`] is the narrow surface the reconciler needs. The production
//! implementation wraps a kube-rs client built from the verified cluster
//! credential, so every call goes through the API load balancer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Scope;
use kube::Client;
use serde_json::Value;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use stratum_common::kubeconfig::ClusterCredential;
use stratum_common::yaml::ObjectIdentity;
use stratum_common::Error;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "stratum";

/// Summary of one Kubernetes node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name (the server name)
    pub name: String,
    /// `Ready` condition is `True`
    pub ready: bool,
    /// Kubelet version (e.g. `v1.32.1`)
    pub kubelet_version: String,
    /// OS image (e.g. `Talos (v1.9.2)`)
    pub os_image: String,
}

/// Summary of one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Phase (`Running`, `Pending`, ...)
    pub phase: String,
    /// Every container reports ready
    pub ready: bool,
}

impl PodInfo {
    /// Running with all containers ready
    pub fn is_running(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

/// Kubernetes operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error>;
    /// Pods in a namespace matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, Error>;
    /// Secret data, `None` when the secret does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;
    /// Server-side apply of one manifest
    async fn apply(&self, manifest: &Value) -> Result<(), Error>;
    /// Delete a node object; missing nodes are not an error
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// Builds [`ClusterApi`] sessions from a credential
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApiConnector: Send + Sync {
    /// Connect using the credential's current context
    async fn connect(&self, credential: &ClusterCredential) -> Result<Arc<dyn ClusterApi>, Error>;
}

/// Production [`ClusterApiConnector`]
#[derive(Clone, Debug, Default)]
pub struct KubeClusterApiConnector;

#[async_trait]
impl ClusterApiConnector for KubeClusterApiConnector {
    async fn connect(&self, credential: &ClusterCredential) -> Result<Arc<dyn ClusterApi>, Error> {
        let text = std::str::from_utf8(credential.as_bytes())
            .map_err(|e| Error::credential(format!("kubeconfig is not valid UTF-8: {}", e)))?;
        let kubeconfig = Kubeconfig::from_yaml(text)
            .map_err(|e| Error::credential(format!("kubeconfig rejected by client: {}", e)))?;
        let options = KubeConfigOptions {
            context: Some(credential.context().to_string()),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::credential(format!("kubeconfig rejected by client: {}", e)))?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_info).collect())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(Some(
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
        ))
    }

    async fn apply(&self, manifest: &Value) -> Result<(), Error> {
        let identity = ObjectIdentity::of(manifest)?;
        let (group, version) = parse_api_version(&identity.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &identity.kind);

        let (resource, capabilities) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| {
                Error::internal_with_context(
                    "apply",
                    format!("unknown resource type {}/{}: {}", identity.api_version, identity.kind, e),
                )
            })?;

        let api: Api<DynamicObject> = match (&capabilities.scope, identity.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resource),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(
            &identity.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "apply",
                format!("failed to apply {}/{}: {}", identity.kind, identity.name, e),
            )
        })?;

        trace!(kind = %identity.kind, name = %identity.name, namespace = ?identity.namespace, "applied manifest");
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(node = %name, "deleted node object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `apiVersion` into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

/// Apply order for manifest kinds; lower goes first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 8,
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let status = node.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let info = status.and_then(|s| s.node_info.as_ref());
    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready,
        kubelet_version: info.map(|i| i.kubelet_version.clone()).unwrap_or_default(),
        os_image: info.map(|i| i.os_image.clone()).unwrap_or_default(),
    }
}

fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|containers| !containers.is_empty() && containers.iter().all(|c| c.ready));
    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        ready,
    }
}
