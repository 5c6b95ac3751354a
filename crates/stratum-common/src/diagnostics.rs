//! Diagnostic snapshot attached to fatal provisioning and bootstrap failures
//!
//! The data here is collected by the cluster crate when a step exhausts its
//! budget. It is plain data so it can ride along inside [`crate::Error`].

use std::fmt;
use std::net::SocketAddr;

/// Reachability of a single TCP endpoint at the time of the failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCheck {
    /// What the address belongs to (node name or `load-balancer`)
    pub target: String,
    /// The dialed address
    pub address: SocketAddr,
    /// Whether a TCP connection could be established
    pub reachable: bool,
}

/// Health of one node OS service on one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHealth {
    /// Node name
    pub node: String,
    /// Service id (e.g. `etcd`, `kubelet`)
    pub service: String,
    /// Reported state, or the error text when the query failed
    pub state: String,
    /// Whether the service reported healthy
    pub healthy: bool,
}

/// Snapshot gathered after a fatal failure
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticReport {
    /// Per-port reachability for every control-plane node and the load balancer
    pub ports: Vec<PortCheck>,
    /// Core service health per control-plane node
    pub services: Vec<ServiceHealth>,
    /// etcd member names as seen from the first node that answered
    pub etcd_members: Option<Vec<String>>,
    /// Collection problems that did not prevent the rest of the report
    pub notes: Vec<String>,
}

impl DiagnosticReport {
    /// Addresses that refused or timed out
    pub fn unreachable(&self) -> impl Iterator<Item = &PortCheck> {
        self.ports.iter().filter(|p| !p.reachable)
    }

    /// Services that did not report healthy
    pub fn unhealthy(&self) -> impl Iterator<Item = &ServiceHealth> {
        self.services.iter().filter(|s| !s.healthy)
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connectivity:")?;
        for port in &self.ports {
            let state = if port.reachable { "open" } else { "closed" };
            writeln!(f, "  {} {} {}", port.target, port.address, state)?;
        }
        writeln!(f, "services:")?;
        for svc in &self.services {
            writeln!(f, "  {} {} {}", svc.node, svc.service, svc.state)?;
        }
        match &self.etcd_members {
            Some(members) => writeln!(f, "etcd members: [{}]", members.join(", "))?,
            None => writeln!(f, "etcd members: unavailable")?,
        }
        for note in &self.notes {
            writeln!(f, "note: {}", note)?;
        }
        Ok(())
    }
}
