//! Cluster teardown
//!
//! Deletes every provider resource of a cluster in reverse dependency order.
//! A resource that is already gone counts as deleted. Individual failures,
//! listings included, do not stop the teardown. Whenever the ordered pass
//! failed somewhere or anything labeled for the cluster is still listed
//! afterwards, a label-based sweep removes the rest. A final label listing
//! decides success.
//!
//! Persisted secrets and credentials are left on disk.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stratum_common::model::{ClusterSpec, NodeRole};
use stratum_common::naming::{
    api_load_balancer_name, cluster_selector, firewall_name, floating_ip_name, ingress_certificate_name,
    ingress_load_balancer_name, member_index, network_name, placement_group_name, role_selector, ssh_key_name,
};
use stratum_common::poll::run_cancellable;
use stratum_common::Error;

use crate::cloud::{CloudErrorKind, CloudResult, ResourceRef, Server};
use crate::context::Context;
use crate::infra::expected_node_names;

/// Step name used in errors and logs
pub const CLEANUP_STEP: &str = "cleanup";

/// Tears down the provider resources of one cluster
pub struct ClusterCleaner<'a> {
    ctx: &'a Context,
    spec: &'a ClusterSpec,
    cancel: &'a CancellationToken,
}

impl<'a> ClusterCleaner<'a> {
    /// Cleaner for `spec`
    pub fn new(ctx: &'a Context, spec: &'a ClusterSpec, cancel: &'a CancellationToken) -> Self {
        Self { ctx, spec, cancel }
    }

    /// Delete everything, then verify nothing labeled for the cluster remains
    pub async fn run(&self) -> Result<(), Error> {
        let cluster = self.spec.name.as_str();
        info!(cluster, "Destroying cluster");

        let mut failures = self.ordered_pass().await?;
        let mut remaining = self.remaining().await?;
        if !failures.is_empty() || !remaining.is_empty() {
            warn!(
                cluster,
                failed = failures.len(),
                remaining = remaining.len(),
                "Ordered teardown incomplete, sweeping by label"
            );
            if let Err(e) = self.sweep().await {
                failures.push(format!("label sweep: {}", e));
            }
            remaining = self.remaining().await?;
        }
        if remaining.is_empty() {
            info!(cluster, "Cluster destroyed");
            return Ok(());
        }

        let mut leftovers: Vec<String> = remaining
            .iter()
            .map(|r| format!("{} {} ({}) still exists", r.kind, r.name, r.id))
            .collect();
        leftovers.extend(failures);
        Err(Error::Cleanup {
            cluster: cluster.to_string(),
            failures: leftovers,
        })
    }

    /// Everything still labeled for the cluster
    async fn remaining(&self) -> Result<Vec<ResourceRef>, Error> {
        let cluster = self.spec.name.as_str();
        run_cancellable(self.cancel, CLEANUP_STEP, async {
            self.ctx
                .cloud
                .list_resources_by_label(&cluster_selector(cluster))
                .await
                .map_err(|e| e.into_provider_error(cluster, CLEANUP_STEP))
        })
        .await
    }

    /// Deletions in dependency order, collecting failures
    async fn ordered_pass(&self) -> Result<Vec<String>, Error> {
        let cluster = self.spec.name.as_str();
        let cloud = &self.ctx.cloud;
        let mut failures = Vec::new();

        let name = floating_ip_name(cluster);
        self.delete("floating-ip", &name, &mut failures, async {
            match cloud.get_floating_ip(&name).await? {
                Some(fip) => cloud.delete_floating_ip(fip.id).await.map(|_| true),
                None => Ok(false),
            }
        })
        .await?;

        for role in [NodeRole::Worker, NodeRole::ControlPlane] {
            for server in self.servers(role, &mut failures).await? {
                self.delete("server", &server.name, &mut failures, async {
                    cloud.delete_server(server.id).await.map(|_| true)
                })
                .await?;
            }
        }

        let snapshots = self
            .list("snapshots", &mut failures, cloud.list_snapshots_by_label(&cluster_selector(cluster)))
            .await?;
        for snapshot in snapshots {
            self.delete("snapshot", &snapshot.description, &mut failures, async {
                cloud.delete_snapshot(snapshot.id).await.map(|_| true)
            })
            .await?;
        }

        for name in [ingress_load_balancer_name(cluster), api_load_balancer_name(cluster)] {
            self.delete("load-balancer", &name, &mut failures, async {
                match cloud.get_load_balancer(&name).await? {
                    Some(lb) => cloud.delete_load_balancer(lb.id).await.map(|_| true),
                    None => Ok(false),
                }
            })
            .await?;
        }

        let name = ingress_certificate_name(cluster);
        self.delete("certificate", &name, &mut failures, async {
            match cloud.get_certificate(&name).await? {
                Some(cert) => cloud.delete_certificate(cert.id).await.map(|_| true),
                None => Ok(false),
            }
        })
        .await?;

        for pool in &self.spec.control_plane_pools {
            let name = placement_group_name(cluster, &pool.name);
            self.delete("placement-group", &name, &mut failures, async {
                match cloud.get_placement_group(&name).await? {
                    Some(pg) => cloud.delete_placement_group(pg.id).await.map(|_| true),
                    None => Ok(false),
                }
            })
            .await?;
        }

        let name = firewall_name(cluster);
        self.delete("firewall", &name, &mut failures, async {
            match cloud.get_firewall(&name).await? {
                Some(fw) => cloud.delete_firewall(fw.id).await.map(|_| true),
                None => Ok(false),
            }
        })
        .await?;

        let name = network_name(cluster);
        self.delete("network", &name, &mut failures, async {
            match cloud.get_network(&name).await? {
                Some(net) => cloud.delete_network(net.id).await.map(|_| true),
                None => Ok(false),
            }
        })
        .await?;

        let name = ssh_key_name(cluster);
        self.delete("ssh-key", &name, &mut failures, async {
            match cloud.get_ssh_key(&name).await? {
                Some(key) => cloud.delete_ssh_key(key.id).await.map(|_| true),
                None => Ok(false),
            }
        })
        .await?;

        Ok(failures)
    }

    /// Servers of `role`: the expected names plus anything carrying the
    /// role labels, so members of removed pools go too. Lookups that fail
    /// are recorded and skipped.
    async fn servers(&self, role: NodeRole, failures: &mut Vec<String>) -> Result<Vec<Server>, Error> {
        let cluster = self.spec.name.as_str();
        let cloud = &self.ctx.cloud;
        let selector = role_selector(cluster, role);
        let mut servers = self
            .list(&format!("{} servers", role), failures, cloud.list_servers_by_label(&selector))
            .await?;

        let pools: Vec<&str> = self
            .spec
            .pools()
            .filter(|(r, _)| *r == role)
            .map(|(_, pool)| pool.name.as_str())
            .collect();
        for name in expected_node_names(self.spec) {
            let in_role = pools.iter().any(|pool| member_index(cluster, pool, &name).is_some());
            if !in_role || servers.iter().any(|s| s.name == name) {
                continue;
            }
            let found = run_cancellable(self.cancel, CLEANUP_STEP, async { Ok(cloud.get_server(&name).await) }).await?;
            match found {
                Ok(server) => servers.extend(server),
                Err(e) if e.kind == CloudErrorKind::NotFound => {}
                Err(e) => {
                    warn!(cluster, name, error = %e, "Server lookup failed");
                    failures.push(format!("server {}: {}", name, e));
                }
            }
        }

        servers.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(servers)
    }

    /// Run one listing; a failure is recorded and lists nothing
    async fn list<T>(
        &self,
        what: &str,
        failures: &mut Vec<String>,
        fut: impl Future<Output = CloudResult<Vec<T>>>,
    ) -> Result<Vec<T>, Error> {
        let cluster = self.spec.name.as_str();
        let outcome = run_cancellable(self.cancel, CLEANUP_STEP, async { Ok(fut.await) }).await?;
        match outcome {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!(cluster, what, error = %e, "Listing failed");
                failures.push(format!("{}: {}", what, e));
                Ok(Vec::new())
            }
        }
    }

    /// Run one deletion; not-found counts as done, other failures are recorded
    async fn delete(
        &self,
        kind: &str,
        name: &str,
        failures: &mut Vec<String>,
        fut: impl Future<Output = CloudResult<bool>>,
    ) -> Result<(), Error> {
        let cluster = self.spec.name.as_str();
        let outcome = run_cancellable(self.cancel, CLEANUP_STEP, async { Ok(fut.await) }).await?;
        match outcome {
            Ok(true) => info!(cluster, kind, name, "Deleted"),
            Ok(false) => {}
            Err(e) if e.kind == CloudErrorKind::NotFound => {}
            Err(e) => {
                warn!(cluster, kind, name, error = %e, "Deletion failed");
                failures.push(format!("{} {}: {}", kind, name, e));
            }
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<(), Error> {
        let cluster = self.spec.name.as_str();
        let removed = run_cancellable(self.cancel, CLEANUP_STEP, async {
            self.ctx
                .cloud
                .cleanup_by_label(&cluster_selector(cluster))
                .await
                .map_err(|e| e.into_provider_error(cluster, CLEANUP_STEP))
        })
        .await?;
        for resource in &removed {
            info!(cluster, kind = %resource.kind, name = %resource.name, "Deleted by label sweep");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ResourceKind;
    use crate::infra::InfraReconciler;
    use crate::testing::{pool, spec, FakeWorld};
    use stratum_common::model::IngressLoadBalancer;
    use stratum_common::naming::cluster_labels;

    async fn provision(world: &FakeWorld, s: &ClusterSpec) {
        let ctx = world.context();
        InfraReconciler::new(&ctx, s, &CancellationToken::new())
            .run()
            .await
            .unwrap();
    }

    async fn destroy(world: &FakeWorld, s: &ClusterSpec) -> Result<(), Error> {
        let ctx = world.context();
        ClusterCleaner::new(&ctx, s, &CancellationToken::new()).run().await
    }

    #[tokio::test]
    async fn everything_labeled_is_removed() {
        let world = FakeWorld::new();
        let mut s = spec("demo", 3, 2);
        s.floating_ip = true;
        s.ssh_public_key = Some("ssh-ed25519 AAAA test".into());
        s.load_balancer.ingress = Some(IngressLoadBalancer {
            lb_type: "lb11".into(),
            http_node_port: 30080,
            https_node_port: 30443,
            domains: vec![],
        });
        provision(&world, &s).await;
        assert!(!world.resources("demo").is_empty());

        destroy(&world, &s).await.unwrap();

        assert!(world.resources("demo").is_empty());
        // Workers go before control-plane members, highest index first
        assert_eq!(
            world.deleted_servers(),
            vec![
                "demo-worker-2",
                "demo-worker-1",
                "demo-control-plane-3",
                "demo-control-plane-2",
                "demo-control-plane-1",
            ]
        );
    }

    #[tokio::test]
    async fn second_destroy_is_a_no_op() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 1);
        provision(&world, &s).await;

        destroy(&world, &s).await.unwrap();
        destroy(&world, &s).await.unwrap();
    }

    #[tokio::test]
    async fn other_clusters_are_untouched() {
        let world = FakeWorld::new();
        let demo = spec("demo", 1, 0);
        let other = spec("other", 1, 0);
        provision(&world, &demo).await;
        provision(&world, &other).await;

        destroy(&world, &demo).await.unwrap();

        assert!(world.resources("demo").is_empty());
        assert!(!world.resources("other").is_empty());
    }

    #[tokio::test]
    async fn members_of_removed_pools_are_found_by_label() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 2);
        provision(&world, &s).await;

        let shrunk = spec("demo", 1, 0);
        destroy(&world, &shrunk).await.unwrap();

        assert!(world.resources("demo").is_empty());
    }

    #[tokio::test]
    async fn failed_deletions_are_swept_by_label() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 0);
        provision(&world, &s).await;
        world.fail_next_delete(ResourceKind::Firewall);

        destroy(&world, &s).await.unwrap();

        assert!(world.resources("demo").is_empty());
        assert_eq!(world.sweeps(), 1);
    }

    #[tokio::test]
    async fn renamed_control_plane_pool_is_swept() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 0);
        provision(&world, &s).await;

        // The old pool's placement group is not among the expected names
        let mut renamed = s.clone();
        renamed.control_plane_pools = vec![pool("cp", 1)];
        destroy(&world, &renamed).await.unwrap();

        assert!(world.resources("demo").is_empty());
        assert_eq!(world.sweeps(), 1);
    }

    #[tokio::test]
    async fn clean_teardown_needs_no_sweep() {
        let world = FakeWorld::new();
        provision(&world, &spec("demo", 1, 1)).await;

        destroy(&world, &spec("demo", 1, 1)).await.unwrap();
        assert_eq!(world.sweeps(), 0);
    }

    #[tokio::test]
    async fn server_listing_failure_does_not_abort_teardown() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 1);
        provision(&world, &s).await;
        world.fail_next_server_list();

        destroy(&world, &s).await.unwrap();

        assert!(world.resources("demo").is_empty());
        // Expected members are still looked up by name, in order
        assert_eq!(world.deleted_servers(), vec!["demo-worker-1", "demo-control-plane-1"]);
        assert_eq!(world.sweeps(), 1);
    }

    #[tokio::test]
    async fn cluster_snapshots_and_certificate_are_deleted() {
        let world = FakeWorld::new();
        let mut s = spec("demo", 1, 0);
        s.load_balancer.ingress = Some(IngressLoadBalancer {
            lb_type: "lb11".into(),
            http_node_port: 30080,
            https_node_port: 30443,
            domains: vec!["app.example.com".into()],
        });
        provision(&world, &s).await;
        let ctx = world.context();
        let server_id = world.server_ids()["demo-control-plane-1"];
        let backup = ctx
            .cloud
            .create_snapshot(server_id, "demo disk backup", &cluster_labels("demo"))
            .await
            .unwrap();
        let os_images: Vec<u64> = world.snapshot_ids().into_iter().filter(|id| *id != backup.id).collect();
        assert_eq!(os_images.len(), 1);
        assert_eq!(world.certificates().len(), 1);

        destroy(&world, &s).await.unwrap();

        assert!(world.resources("demo").is_empty());
        assert!(world.certificates().is_empty());
        // Node OS images are shared across clusters and stay
        assert_eq!(world.snapshot_ids(), os_images);
        assert_eq!(world.sweeps(), 0);
    }

    #[tokio::test]
    async fn stubborn_resources_are_reported() {
        let world = FakeWorld::new();
        let s = spec("demo", 1, 0);
        provision(&world, &s).await;
        world.pin(ResourceKind::Network);

        let err = destroy(&world, &s).await.unwrap_err();

        assert!(err.is_retryable());
        match err {
            Error::Cleanup { cluster, failures } => {
                assert_eq!(cluster, "demo");
                assert!(failures.iter().any(|f| f.starts_with("network demo")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
