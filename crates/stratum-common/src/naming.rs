//! Deterministic names, labels, and network layout
//!
//! Every cloud resource a cluster owns is named from the cluster name, so the
//! name doubles as the idempotency key for get-before-create. Subnets and
//! private addresses are carved from the top-level range by fixed rules so
//! re-runs never drift.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::model::{ClusterSpec, NodeRole};
use crate::{Error, CLUSTER_LABEL, POOL_LABEL, ROLE_LABEL};

/// Subnet index of the load balancer subnet
const LOAD_BALANCER_SUBNET_INDEX: usize = 0;

/// First subnet index handed to control-plane pools
const FIRST_CONTROL_PLANE_SUBNET_INDEX: usize = 1;

/// Control-plane pools share indices 1..=4; worker pools start after them
const MAX_CONTROL_PLANE_POOLS: usize = 4;

/// Host offset of the first pool member (member `i` gets `offset + i`)
const MEMBER_HOST_OFFSET: u32 = 10;

/// Host offset of the API load balancer's private address
const API_LOAD_BALANCER_HOST_OFFSET: u32 = 5;

/// Network name: the cluster name itself
pub fn network_name(cluster: &str) -> String {
    cluster.to_string()
}

/// Firewall name: the cluster name itself
pub fn firewall_name(cluster: &str) -> String {
    cluster.to_string()
}

/// SSH key name: the cluster name itself
pub fn ssh_key_name(cluster: &str) -> String {
    cluster.to_string()
}

/// Placement group for one control-plane pool
pub fn placement_group_name(cluster: &str, pool: &str) -> String {
    format!("{}-{}", cluster, pool)
}

/// Load balancer fronting the Kubernetes API
pub fn api_load_balancer_name(cluster: &str) -> String {
    format!("{}-kube-api", cluster)
}

/// Optional load balancer for ingress traffic
pub fn ingress_load_balancer_name(cluster: &str) -> String {
    format!("{}-ingress", cluster)
}

/// Managed certificate terminating TLS on the ingress balancer
pub fn ingress_certificate_name(cluster: &str) -> String {
    format!("{}-ingress-tls", cluster)
}

/// Floating IP for the public control-plane endpoint
pub fn floating_ip_name(cluster: &str) -> String {
    format!("{}-control-plane-ipv4", cluster)
}

/// Pool member name; `index` is 1-based
pub fn server_name(cluster: &str, pool: &str, index: u32) -> String {
    format!("{}-{}-{}", cluster, pool, index)
}

/// Recover the 1-based member index from a server name of this pool
pub fn member_index(cluster: &str, pool: &str, server_name: &str) -> Option<u32> {
    server_name
        .strip_prefix(cluster)?
        .strip_prefix('-')?
        .strip_prefix(pool)?
        .strip_prefix('-')?
        .parse()
        .ok()
        .filter(|i| *i > 0)
}

/// Labels carried by every owned resource
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.to_string())])
}

/// Labels carried by every server of a pool
pub fn server_labels(cluster: &str, role: NodeRole, pool: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    labels.insert(POOL_LABEL.to_string(), pool.to_string());
    labels
}

/// Selector matching every resource owned by the cluster
pub fn cluster_selector(cluster: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster)
}

/// Selector matching the servers of one role
pub fn role_selector(cluster: &str, role: NodeRole) -> String {
    format!("{},{}={}", cluster_selector(cluster), ROLE_LABEL, role.as_str())
}

/// Selector matching the servers of one pool
pub fn pool_selector(cluster: &str, pool: &str) -> String {
    format!("{},{}={}", cluster_selector(cluster), POOL_LABEL, pool)
}

/// Subnets and fixed addresses derived from the network range
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkLayout {
    /// Top-level range
    pub network: Ipv4Net,
    /// Subnet holding the load balancers
    pub load_balancer_subnet: Ipv4Net,
    /// Subnet per pool, keyed by pool name
    pub pool_subnets: BTreeMap<String, Ipv4Net>,
}

impl NetworkLayout {
    /// Carve the layout for a fresh cluster.
    ///
    /// Subnet 0 is the load balancer subnet, control-plane pools take indices
    /// 1..=4 in pool-name order, worker pools follow in pool-name order.
    pub fn compute(spec: &ClusterSpec) -> Result<Self, Error> {
        Self::compute_with(spec, &BTreeMap::new())
    }

    /// Carve the layout, keeping the subnets pools already occupy.
    ///
    /// `occupied` maps pool names to the subnet their existing members live
    /// in. Those assignments stay as they are; pools without one take the
    /// lowest free index of their role's range in pool-name order. Entries
    /// outside the network, in the wrong role's range, or for pools no longer
    /// desired are ignored. Adding a pool never moves another pool.
    pub fn compute_with(spec: &ClusterSpec, occupied: &BTreeMap<String, Ipv4Net>) -> Result<Self, Error> {
        let network = spec.network.parsed()?;
        let prefix = spec.network.subnet_prefix;
        if prefix <= network.prefix_len() || prefix > 28 {
            return Err(Error::validation_for_field(
                &spec.name,
                "network.subnetPrefix",
                format!(
                    "subnet prefix /{} must be longer than the network /{} and at most /28",
                    prefix,
                    network.prefix_len()
                ),
            ));
        }

        let subnet_at = |index: usize| -> Result<Ipv4Net, Error> {
            network
                .subnets(prefix)
                .ok()
                .and_then(|mut subnets| subnets.nth(index))
                .ok_or_else(|| {
                    Error::validation_for_field(
                        &spec.name,
                        "network.cidr",
                        format!(
                            "network {} has no room for subnet #{} at /{}",
                            network, index, prefix
                        ),
                    )
                })
        };
        let index_of = |subnet: &Ipv4Net| -> Option<usize> {
            if subnet.prefix_len() != prefix || subnet.trunc() != *subnet || !network.contains(subnet) {
                return None;
            }
            let offset = u32::from(subnet.network()) - u32::from(network.network());
            Some((offset >> (32 - u32::from(prefix))) as usize)
        };

        let mut control_plane: Vec<&str> = spec
            .control_plane_pools
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        control_plane.sort_unstable();
        if control_plane.len() > MAX_CONTROL_PLANE_POOLS {
            return Err(Error::validation_for_field(
                &spec.name,
                "controlPlanePools",
                format!("at most {} control-plane pools are supported", MAX_CONTROL_PLANE_POOLS),
            ));
        }

        let mut workers: Vec<&str> = spec.worker_pools.iter().map(|p| p.name.as_str()).collect();
        workers.sort_unstable();

        let first_worker = FIRST_CONTROL_PLANE_SUBNET_INDEX + MAX_CONTROL_PLANE_POOLS;
        let mut taken = BTreeSet::from([LOAD_BALANCER_SUBNET_INDEX]);
        let mut indices: BTreeMap<&str, usize> = BTreeMap::new();
        for (names, first, end) in [
            (&control_plane, FIRST_CONTROL_PLANE_SUBNET_INDEX, Some(first_worker)),
            (&workers, first_worker, None),
        ] {
            let in_range = |i: usize| i >= first && end.map_or(true, |end| i < end);

            // Pools that already have members keep their subnet
            for name in names.iter() {
                let kept = occupied
                    .get(*name)
                    .and_then(|subnet| index_of(subnet))
                    .filter(|i| in_range(*i) && !taken.contains(i));
                if let Some(index) = kept {
                    taken.insert(index);
                    indices.insert(*name, index);
                }
            }
            for name in names.iter() {
                if indices.contains_key(name) {
                    continue;
                }
                let mut index = first;
                while taken.contains(&index) {
                    index += 1;
                }
                taken.insert(index);
                indices.insert(*name, index);
            }
        }

        let mut pool_subnets = BTreeMap::new();
        for (name, index) in indices {
            pool_subnets.insert(name.to_string(), subnet_at(index)?);
        }

        let layout = Self {
            network,
            load_balancer_subnet: subnet_at(LOAD_BALANCER_SUBNET_INDEX)?,
            pool_subnets,
        };

        for (_, pool) in spec.pools() {
            if pool.count > 0 {
                layout.member_ip(&pool.name, pool.count).map_err(|_| {
                    Error::validation_for_field(
                        &spec.name,
                        format!("pool '{}'", pool.name),
                        format!(
                            "{} members do not fit into a /{} subnet",
                            pool.count, prefix
                        ),
                    )
                })?;
            }
        }

        Ok(layout)
    }

    /// All subnets in creation order (load balancer first)
    pub fn subnets(&self) -> Vec<Ipv4Net> {
        let mut subnets = vec![self.load_balancer_subnet];
        let mut pools: Vec<Ipv4Net> = self.pool_subnets.values().copied().collect();
        pools.sort_unstable();
        subnets.extend(pools);
        subnets
    }

    /// Private address of the API load balancer
    pub fn api_load_balancer_ip(&self) -> Ipv4Addr {
        nth_host(self.load_balancer_subnet, API_LOAD_BALANCER_HOST_OFFSET)
            .unwrap_or_else(|| self.load_balancer_subnet.network())
    }

    /// Private address of pool member `index` (1-based)
    pub fn member_ip(&self, pool: &str, index: u32) -> Result<Ipv4Addr, Error> {
        let subnet = self
            .pool_subnets
            .get(pool)
            .ok_or_else(|| Error::internal_with_context("network-layout", format!("unknown pool '{}'", pool)))?;
        nth_host(*subnet, MEMBER_HOST_OFFSET + index).ok_or_else(|| {
            Error::internal_with_context(
                "network-layout",
                format!("member {} of pool '{}' is outside {}", index, pool, subnet),
            )
        })
    }
}

/// Host `offset` of a subnet, excluding the broadcast address
fn nth_host(subnet: Ipv4Net, offset: u32) -> Option<Ipv4Addr> {
    let base = u32::from(subnet.network());
    let candidate = Ipv4Addr::from(base.checked_add(offset)?);
    (subnet.contains(&candidate) && candidate != subnet.broadcast()).then_some(candidate)
}
