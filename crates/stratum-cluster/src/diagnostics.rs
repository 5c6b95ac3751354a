//! Diagnostic collection after fatal bootstrap or provisioning failures
//!
//! Every probe here is best-effort and individually bounded; a collection
//! problem becomes a note in the report instead of another error.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::debug;

use stratum_common::diagnostics::{DiagnosticReport, PortCheck, ServiceHealth};
use stratum_common::model::{ClusterSpec, NodeRole};
use stratum_common::naming::{api_load_balancer_name, role_selector};
use stratum_common::{KUBE_API_PORT, NODE_OS_API_PORT};

use crate::context::Context;
use crate::infra::InfraState;

/// Services whose health is recorded per control-plane node
pub const CORE_SERVICES: [&str; 3] = ["apid", "etcd", "kubelet"];

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// What a diagnostic pass looks at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Targets {
    /// Control-plane members with their public address
    pub control_plane: Vec<(String, Option<Ipv4Addr>)>,
    /// API load balancer public address; outer `None` when there is no balancer
    pub load_balancer: Option<Option<Ipv4Addr>>,
    /// Problems found while discovering the targets
    pub notes: Vec<String>,
}

impl Targets {
    /// Targets of a converged infrastructure
    pub fn of(infra: &InfraState) -> Self {
        Self {
            control_plane: infra
                .control_plane
                .iter()
                .map(|n| (n.name.clone(), n.server.public_ipv4))
                .collect(),
            load_balancer: Some(infra.api_load_balancer.public_ipv4),
            notes: Vec::new(),
        }
    }

    /// Look up whatever control-plane servers and API load balancer exist,
    /// for failures that stopped before the infrastructure converged
    pub async fn discover(ctx: &Context, spec: &ClusterSpec) -> Self {
        let mut targets = Self::default();
        let selector = role_selector(&spec.name, NodeRole::ControlPlane);
        match tokio::time::timeout(CALL_TIMEOUT, ctx.cloud.list_servers_by_label(&selector)).await {
            Ok(Ok(mut servers)) => {
                servers.sort_by(|a, b| a.name.cmp(&b.name));
                targets.control_plane = servers.into_iter().map(|s| (s.name, s.public_ipv4)).collect();
            }
            Ok(Err(e)) => targets.notes.push(format!("control-plane servers: {}", e)),
            Err(_) => targets.notes.push("control-plane servers: listing timed out".to_string()),
        }
        let name = api_load_balancer_name(&spec.name);
        match tokio::time::timeout(CALL_TIMEOUT, ctx.cloud.get_load_balancer(&name)).await {
            Ok(Ok(lb)) => targets.load_balancer = lb.map(|lb| lb.public_ipv4),
            Ok(Err(e)) => targets.notes.push(format!("{}: {}", name, e)),
            Err(_) => targets.notes.push(format!("{}: lookup timed out", name)),
        }
        targets
    }

    /// Whether there is nothing to look at
    pub fn is_empty(&self) -> bool {
        self.control_plane.is_empty() && self.load_balancer.is_none()
    }

    /// Public control-plane addresses as client endpoints
    pub fn endpoints(&self) -> Vec<String> {
        self.control_plane
            .iter()
            .filter_map(|(_, ip)| ip.map(|ip| ip.to_string()))
            .collect()
    }
}

/// Gather connectivity, service health, and etcd membership
pub async fn collect(ctx: &Context, infra: &InfraState, client_config: &[u8]) -> DiagnosticReport {
    collect_targets(ctx, &Targets::of(infra), client_config).await
}

/// Gather the same snapshot for an explicit target set
pub async fn collect_targets(ctx: &Context, targets: &Targets, client_config: &[u8]) -> DiagnosticReport {
    let mut report = DiagnosticReport {
        notes: targets.notes.clone(),
        ..Default::default()
    };

    for (name, ip) in &targets.control_plane {
        let Some(ip) = ip else {
            report.notes.push(format!("{} has no public address", name));
            continue;
        };
        for port in [NODE_OS_API_PORT, KUBE_API_PORT] {
            let address = SocketAddr::from((*ip, port));
            report.ports.push(PortCheck {
                target: name.clone(),
                address,
                reachable: ctx.probe.is_open(address).await,
            });
        }
    }
    match targets.load_balancer {
        Some(Some(ip)) => {
            let address = SocketAddr::from((ip, KUBE_API_PORT));
            report.ports.push(PortCheck {
                target: "load-balancer".to_string(),
                address,
                reachable: ctx.probe.is_open(address).await,
            });
        }
        Some(None) => report.notes.push("load balancer has no public address".to_string()),
        None => report.notes.push("load balancer does not exist".to_string()),
    }

    for (name, ip) in &targets.control_plane {
        let Some(ip) = ip else {
            continue;
        };
        let endpoint = SocketAddr::from((*ip, NODE_OS_API_PORT));
        let client = match tokio::time::timeout(CALL_TIMEOUT, ctx.node_os.connect(endpoint, client_config)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                report.notes.push(format!("{}: connect failed: {}", name, e));
                continue;
            }
            Err(_) => {
                report.notes.push(format!("{}: connect timed out", name));
                continue;
            }
        };

        for service in CORE_SERVICES {
            let health = match tokio::time::timeout(CALL_TIMEOUT, client.service_status(service)).await {
                Ok(Ok(status)) => ServiceHealth {
                    node: name.clone(),
                    service: service.to_string(),
                    state: status.state,
                    healthy: status.healthy,
                },
                Ok(Err(e)) => ServiceHealth {
                    node: name.clone(),
                    service: service.to_string(),
                    state: e.to_string(),
                    healthy: false,
                },
                Err(_) => ServiceHealth {
                    node: name.clone(),
                    service: service.to_string(),
                    state: "timed out".to_string(),
                    healthy: false,
                },
            };
            report.services.push(health);
        }

        if report.etcd_members.is_none() {
            match tokio::time::timeout(CALL_TIMEOUT, client.etcd_members()).await {
                Ok(Ok(members)) => {
                    report.etcd_members = Some(members.into_iter().map(|m| m.hostname).collect());
                }
                Ok(Err(e)) => report.notes.push(format!("{}: etcd member list failed: {}", name, e)),
                Err(_) => report.notes.push(format!("{}: etcd member list timed out", name)),
            }
        }
    }

    debug!(
        unreachable = report.unreachable().count(),
        unhealthy = report.unhealthy().count(),
        "Collected diagnostics"
    );
    report
}
