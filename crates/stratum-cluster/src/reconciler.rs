//! Top-level reconciler
//!
//! Chains the infrastructure pass, the bootstrap sequence, and the addon pass
//! for create and update, and exposes upgrade and destroy beside it. Every
//! entry point is safe to call again after a failure.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stratum_common::kubeconfig::ClusterCredential;
use stratum_common::model::ClusterSpec;
use stratum_common::Error;

use crate::addons::AddonManager;
use crate::bootstrap::BootstrapSequencer;
use crate::cleanup::ClusterCleaner;
use crate::context::Context;
use crate::diagnostics::{collect_targets, Targets};
use crate::infra::InfraReconciler;
use crate::nodeconfig::NodeSecrets;
use crate::upgrade::{UpgradeOutcome, Upgrader};

/// Result of a successful reconciliation
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// Verified admin credential
    pub credential: ClusterCredential,
    /// Where the credential was written
    pub kubeconfig_path: PathBuf,
    /// Public address of the Kubernetes API
    pub api_endpoint: Ipv4Addr,
    /// Members across all pools
    pub nodes: usize,
}

/// Reconciles clusters against their desired state
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    /// Reconciler over the given collaborators
    pub fn new(ctx: Context) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Shared collaborators
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Create or update a cluster and return its credential
    pub async fn reconcile(&self, spec: &ClusterSpec, cancel: &CancellationToken) -> Result<ReconcileOutcome, Error> {
        spec.validate()?;
        let cluster = spec.name.as_str();
        info!(cluster, nodes = spec.total_nodes(), "Reconciling cluster");

        let result = self.converge(spec, cancel).await;
        if let Err(e) = &result {
            error!(cluster, step = e.step().unwrap_or("-"), retryable = e.is_retryable(), error = %e, "Reconciliation failed");
        }
        result
    }

    async fn converge(&self, spec: &ClusterSpec, cancel: &CancellationToken) -> Result<ReconcileOutcome, Error> {
        let ctx = self.ctx.as_ref();
        let secrets = self.secrets(spec)?;
        let infra = match InfraReconciler::new(ctx, spec, cancel).run().await {
            Ok(infra) => infra,
            Err(e) => return Err(self.diagnose_provisioning(spec, &secrets, e).await),
        };
        let bootstrapped = BootstrapSequencer::prepare(ctx, spec, &infra, &secrets, cancel)
            .await?
            .run()
            .await?;
        AddonManager::new(ctx, spec, bootstrapped.api.clone(), infra.network.id, cancel)
            .apply()
            .await?;

        info!(cluster = %spec.name, server = %bootstrapped.credential.server(), "Cluster reconciled");
        Ok(ReconcileOutcome {
            api_endpoint: infra.api_endpoint_ip()?,
            nodes: infra.nodes().count(),
            credential: bootstrapped.credential,
            kubeconfig_path: bootstrapped.kubeconfig_path,
        })
    }

    /// Replace members running anything other than the desired versions
    pub async fn upgrade(&self, spec: &ClusterSpec, cancel: &CancellationToken) -> Result<UpgradeOutcome, Error> {
        spec.validate()?;
        let secrets = self.secrets(spec)?;
        Upgrader::new(self.ctx.as_ref(), spec, cancel).run(&secrets).await
    }

    /// Delete every provider resource of the cluster. Persisted secrets and
    /// credentials stay on disk.
    pub async fn destroy(&self, spec: &ClusterSpec, cancel: &CancellationToken) -> Result<(), Error> {
        ClusterCleaner::new(self.ctx.as_ref(), spec, cancel).run().await
    }

    /// Attach a diagnostic snapshot to an infrastructure failure once
    /// control-plane servers or the API load balancer exist
    async fn diagnose_provisioning(&self, spec: &ClusterSpec, secrets: &NodeSecrets, err: Error) -> Error {
        if matches!(err, Error::Cancelled { .. } | Error::Validation { .. }) {
            return err;
        }
        let ctx = self.ctx.as_ref();
        let mut targets = Targets::discover(ctx, spec).await;
        if targets.is_empty() {
            return err;
        }
        error!(cluster = %spec.name, step = err.step().unwrap_or("-"), error = %err, "Provisioning failed, collecting diagnostics");
        let client_config = match ctx.generator.client_config(secrets, &spec.name, &targets.endpoints()) {
            Ok(config) => config,
            Err(e) => {
                targets.notes.push(format!("client configuration: {}", e));
                Vec::new()
            }
        };
        let report = collect_targets(ctx, &targets, &client_config).await;
        err.with_provisioning_diagnostics(report)
    }

    fn secrets(&self, spec: &ClusterSpec) -> Result<NodeSecrets, Error> {
        self.ctx
            .store
            .load_or_generate(&spec.name, &spec.versions.talos, self.ctx.generator.as_ref())
    }
}
