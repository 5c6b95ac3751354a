//! Addon installation after bootstrap
//!
//! Chart contents come from a [`ManifestSource`]; this module decides what to
//! install, in which order, with which values and secrets, and waits for each
//! addon's workloads to run.
//!
//! The CNI and the cloud controller form the first tier: without them nodes
//! stay uninitialised and nothing else schedules. Every other addon is
//! installed concurrently once the first tier is up. A failure in one addon
//! does not roll back the others.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::join_all;
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use stratum_common::error::AddonFailure;
use stratum_common::model::{ClusterSpec, CniEncryption};
use stratum_common::poll::{poll_until, run_cancellable, PollOutcome};
use stratum_common::yaml::{parse_manifests, ObjectIdentity};
use stratum_common::{Error, KUBE_SYSTEM_NAMESPACE};

use crate::config::POD_CIDR;
use crate::context::Context;
use crate::kube_api::{kind_priority, ClusterApi};
use crate::nodeconfig::InlineManifest;

/// Secret read by the cloud controller (`token`, `network`)
pub const CLOUD_CONTROLLER_SECRET: &str = "hcloud";
/// Secret read by the storage driver (`token`)
pub const STORAGE_SECRET: &str = "hcloud-csi";
/// Secret holding the CNI's IPsec pre-shared key (`keys`)
pub const IPSEC_SECRET: &str = "cilium-ipsec-keys";

/// KubePrism endpoint served on every node
const KUBEPRISM_HOST: &str = "localhost";
const KUBEPRISM_PORT: u16 = 7445;

/// Platform services the reconciler knows how to install
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Addon {
    /// Pod networking
    Cni,
    /// Cloud-controller integration
    CloudController,
    /// Storage integration
    Storage,
    /// Resource metrics API
    MetricsServer,
    /// Certificate issuance
    CertManager,
    /// Ingress controller
    Ingress,
    /// GitOps controller
    GitOps,
}

impl Addon {
    /// Short name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Addon::Cni => "cni",
            Addon::CloudController => "ccm",
            Addon::Storage => "csi",
            Addon::MetricsServer => "metrics-server",
            Addon::CertManager => "cert-manager",
            Addon::Ingress => "ingress",
            Addon::GitOps => "gitops",
        }
    }

    /// Enabled addons in install order
    pub fn enabled(spec: &ClusterSpec) -> Vec<Addon> {
        let set = &spec.addons;
        [
            (Addon::Cni, set.cni.is_some()),
            (Addon::CloudController, set.ccm),
            (Addon::Storage, set.csi),
            (Addon::MetricsServer, set.metrics_server),
            (Addon::CertManager, set.cert_manager),
            (Addon::Ingress, set.ingress),
            (Addon::GitOps, set.gitops),
        ]
        .into_iter()
        .filter_map(|(addon, on)| on.then_some(addon))
        .collect()
    }

    /// Whether other addons depend on this one
    pub fn is_foundation(&self) -> bool {
        matches!(self, Addon::Cni | Addon::CloudController)
    }

    /// Namespace and label selector of the addon's workloads
    pub fn workload(&self) -> (&'static str, &'static str) {
        match self {
            Addon::Cni => (KUBE_SYSTEM_NAMESPACE, "k8s-app=cilium"),
            Addon::CloudController => (
                KUBE_SYSTEM_NAMESPACE,
                "app.kubernetes.io/name=hcloud-cloud-controller-manager",
            ),
            Addon::Storage => (KUBE_SYSTEM_NAMESPACE, "app.kubernetes.io/name=hcloud-csi"),
            Addon::MetricsServer => (KUBE_SYSTEM_NAMESPACE, "k8s-app=metrics-server"),
            Addon::CertManager => ("cert-manager", "app.kubernetes.io/instance=cert-manager"),
            Addon::Ingress => ("ingress-nginx", "app.kubernetes.io/name=ingress-nginx"),
            Addon::GitOps => ("flux-system", "app.kubernetes.io/part-of=flux"),
        }
    }

    /// Secrets (name, keys) that must exist with non-empty values
    pub fn required_secrets(&self, spec: &ClusterSpec) -> Vec<(&'static str, &'static [&'static str])> {
        match self {
            Addon::CloudController => vec![(CLOUD_CONTROLLER_SECRET, &["token", "network"])],
            Addon::Storage => vec![(STORAGE_SECRET, &["token"])],
            Addon::Cni if cni_encryption(spec) == CniEncryption::Ipsec => vec![(IPSEC_SECRET, &["keys"])],
            _ => vec![],
        }
    }
}

impl fmt::Display for Addon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Renders an addon's manifests from Helm-style values
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Multi-document YAML for `addon`
    async fn render(&self, addon: Addon, values: &Value) -> Result<String, Error>;
}

fn cni_encryption(spec: &ClusterSpec) -> CniEncryption {
    spec.addons
        .cni
        .as_ref()
        .map(|c| c.encryption)
        .unwrap_or_default()
}

/// Chart values for an addon
pub fn addon_values(addon: Addon, spec: &ClusterSpec) -> Value {
    match addon {
        Addon::Cni => {
            let cni = spec.addons.cni.clone().unwrap_or_default();
            let encryption = match cni.encryption {
                CniEncryption::None => json!({ "enabled": false }),
                CniEncryption::Wireguard => json!({ "enabled": true, "type": "wireguard" }),
                CniEncryption::Ipsec => json!({
                    "enabled": true,
                    "type": "ipsec",
                    "ipsec": { "secretName": IPSEC_SECRET }
                }),
            };
            json!({
                "ipam": { "mode": "kubernetes" },
                "kubeProxyReplacement": cni.kube_proxy_replacement,
                "k8sServiceHost": KUBEPRISM_HOST,
                "k8sServicePort": KUBEPRISM_PORT,
                "routingMode": "tunnel",
                "tunnelProtocol": "vxlan",
                "securityContext": {
                    "capabilities": {
                        "ciliumAgent": [
                            "CHOWN", "KILL", "NET_ADMIN", "NET_RAW", "IPC_LOCK", "SYS_ADMIN",
                            "SYS_RESOURCE", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID"
                        ],
                        "cleanCiliumState": ["NET_ADMIN", "SYS_ADMIN", "SYS_RESOURCE"]
                    }
                },
                "cgroup": { "autoMount": { "enabled": false }, "hostRoot": "/sys/fs/cgroup" },
                "bpf": { "autoMount": { "enabled": false } },
                "encryption": encryption
            })
        }
        Addon::CloudController => json!({
            "networking": { "enabled": true, "clusterCIDR": POD_CIDR },
            "env": {
                "HCLOUD_LOAD_BALANCERS_LOCATION": { "value": spec.location },
                "HCLOUD_LOAD_BALANCERS_USE_PRIVATE_IP": { "value": "true" }
            }
        }),
        Addon::Storage => json!({}),
        Addon::MetricsServer => json!({ "args": ["--kubelet-insecure-tls"] }),
        Addon::CertManager => json!({ "crds": { "enabled": true } }),
        Addon::Ingress => {
            let (http, https) = spec
                .load_balancer
                .ingress
                .as_ref()
                .map(|i| (i.http_node_port, i.https_node_port))
                .unwrap_or((30080, 30443));
            json!({
                "controller": {
                    "kind": "DaemonSet",
                    "service": {
                        "type": "NodePort",
                        "nodePorts": { "http": http, "https": https }
                    }
                }
            })
        }
        Addon::GitOps => json!({}),
    }
}

/// Opaque secret manifest with base64-encoded data
pub fn secret_manifest(name: &str, namespace: &str, data: &BTreeMap<&str, String>) -> Value {
    let encoded: serde_json::Map<String, Value> = data
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(STANDARD.encode(v.as_bytes()))))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { "app.kubernetes.io/managed-by": "stratum" }
        },
        "type": "Opaque",
        "data": encoded
    })
}

/// Random IPsec key in the CNI's `<spi>+ <algorithm> <key> <icv bits>` format
pub fn generate_ipsec_key() -> String {
    let key: [u8; 20] = rand::thread_rng().gen();
    let hex: String = key.iter().map(|b| format!("{:02x}", b)).collect();
    format!("3+ rfc4106(gcm(aes)) {} 128", hex)
}

/// CNI manifests for the control-plane configuration, so nodes become Ready
/// during bootstrap without waiting for the addon pass
pub async fn cni_inline_manifest(
    ctx: &Context,
    spec: &ClusterSpec,
) -> Result<Option<InlineManifest>, Error> {
    if spec.addons.cni.is_none() {
        return Ok(None);
    }
    let mut contents = ctx
        .manifests
        .render(Addon::Cni, &addon_values(Addon::Cni, spec))
        .await?;
    if cni_encryption(spec) == CniEncryption::Ipsec {
        let key = ctx.store.load_or_generate_ipsec_key(&spec.name, generate_ipsec_key)?;
        let secret = secret_manifest(IPSEC_SECRET, KUBE_SYSTEM_NAMESPACE, &BTreeMap::from([("keys", key)]));
        let secret = serde_json::to_string(&secret).map_err(|e| Error::serialization(e.to_string()))?;
        contents = format!("{}\n---\n{}\n", secret, contents);
    }
    Ok(Some(InlineManifest {
        name: "cilium".to_string(),
        contents,
    }))
}

/// Installs and awaits the enabled addons of one cluster
pub struct AddonManager<'a> {
    ctx: &'a Context,
    spec: &'a ClusterSpec,
    api: Arc<dyn ClusterApi>,
    network_id: u64,
    cancel: &'a CancellationToken,
}

impl<'a> AddonManager<'a> {
    /// Manager for `spec` talking to the cluster through `api`
    pub fn new(
        ctx: &'a Context,
        spec: &'a ClusterSpec,
        api: Arc<dyn ClusterApi>,
        network_id: u64,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            ctx,
            spec,
            api,
            network_id,
            cancel,
        }
    }

    /// Install every enabled addon.
    ///
    /// Returns [`Error::Addons`] naming each failed or skipped addon; addons
    /// that succeeded stay installed.
    pub async fn apply(&self) -> Result<(), Error> {
        let enabled = Addon::enabled(self.spec);
        if enabled.is_empty() {
            return Ok(());
        }
        let (foundation, platform): (Vec<Addon>, Vec<Addon>) =
            enabled.into_iter().partition(Addon::is_foundation);

        let mut failures = self.install_tier(&foundation).await?;
        if failures.is_empty() {
            failures.extend(self.install_tier(&platform).await?);
        } else {
            let failed: Vec<&str> = failures.iter().map(|f| f.addon.as_str()).collect();
            let reason = format!("skipped: {} failed", failed.join(", "));
            for addon in &platform {
                warn!(cluster = %self.spec.name, addon = %addon, "Skipping addon after prerequisite failure");
                failures.push(AddonFailure {
                    addon: addon.name().to_string(),
                    message: reason.clone(),
                });
            }
        }

        if failures.is_empty() {
            info!(cluster = %self.spec.name, "All addons installed");
            Ok(())
        } else {
            Err(Error::Addons { failures })
        }
    }

    async fn install_tier(&self, addons: &[Addon]) -> Result<Vec<AddonFailure>, Error> {
        let results = join_all(addons.iter().map(|addon| async move { (*addon, self.install(*addon).await) })).await;
        let mut failures = Vec::new();
        for (addon, result) in results {
            match result {
                Ok(()) => {}
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(cluster = %self.spec.name, addon = %addon, error = %e, "Addon failed");
                    failures.push(AddonFailure {
                        addon: addon.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(failures)
    }

    async fn install(&self, addon: Addon) -> Result<(), Error> {
        let step = format!("addon-{}", addon.name());
        info!(cluster = %self.spec.name, addon = %addon, "Installing addon");

        run_cancellable(self.cancel, &step, self.ensure_secrets(addon)).await?;

        let rendered = run_cancellable(
            self.cancel,
            &step,
            self.ctx.manifests.render(addon, &addon_values(addon, self.spec)),
        )
        .await?;
        let mut documents = parse_manifests(&rendered)?;
        documents.sort_by_key(|doc| {
            doc.get("kind")
                .and_then(Value::as_str)
                .map(kind_priority)
                .unwrap_or(u8::MAX)
        });
        for doc in &documents {
            ObjectIdentity::of(doc)?;
            run_cancellable(self.cancel, &step, self.api.apply(doc)).await?;
        }

        self.wait_ready(addon, &step).await?;
        info!(cluster = %self.spec.name, addon = %addon, manifests = documents.len(), "Addon ready");
        Ok(())
    }

    async fn ensure_secrets(&self, addon: Addon) -> Result<(), Error> {
        let token = self.ctx.config.token().to_string();
        match addon {
            Addon::CloudController => {
                let data = BTreeMap::from([("token", token), ("network", self.network_id.to_string())]);
                self.api
                    .apply(&secret_manifest(CLOUD_CONTROLLER_SECRET, KUBE_SYSTEM_NAMESPACE, &data))
                    .await
            }
            Addon::Storage => {
                let data = BTreeMap::from([("token", token)]);
                self.api
                    .apply(&secret_manifest(STORAGE_SECRET, KUBE_SYSTEM_NAMESPACE, &data))
                    .await
            }
            Addon::Cni if cni_encryption(self.spec) == CniEncryption::Ipsec => {
                let existing = self.api.get_secret(KUBE_SYSTEM_NAMESPACE, IPSEC_SECRET).await?;
                if has_keys(existing.as_ref(), &["keys"]) {
                    return Ok(());
                }
                let key = self
                    .ctx
                    .store
                    .load_or_generate_ipsec_key(&self.spec.name, generate_ipsec_key)?;
                self.api
                    .apply(&secret_manifest(
                        IPSEC_SECRET,
                        KUBE_SYSTEM_NAMESPACE,
                        &BTreeMap::from([("keys", key)]),
                    ))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn wait_ready(&self, addon: Addon, step: &str) -> Result<(), Error> {
        let (namespace, selector) = addon.workload();
        let secrets = addon.required_secrets(self.spec);
        let api = &self.api;

        poll_until(
            self.cancel,
            step,
            addon.name(),
            self.ctx.config.timeouts.addon_ready,
            &self.ctx.config.poll.readiness,
            || async {
                for (name, keys) in &secrets {
                    let data = api.get_secret(KUBE_SYSTEM_NAMESPACE, name).await?;
                    if !has_keys(data.as_ref(), keys) {
                        return Ok(PollOutcome::Pending(format!(
                            "secret {} missing or has empty keys",
                            name
                        )));
                    }
                }
                let pods = api.list_pods(namespace, selector).await?;
                let running = pods.iter().filter(|p| p.is_running()).count();
                if !pods.is_empty() && running == pods.len() {
                    Ok(PollOutcome::Ready(()))
                } else {
                    Ok(PollOutcome::Pending(format!(
                        "{}/{} pods running in {} ({})",
                        running,
                        pods.len(),
                        namespace,
                        selector
                    )))
                }
            },
        )
        .await
    }
}

fn has_keys(data: Option<&BTreeMap<String, Vec<u8>>>, keys: &[&str]) -> bool {
    data.is_some_and(|d| keys.iter().all(|k| d.get(*k).is_some_and(|v| !v.is_empty())))
}
