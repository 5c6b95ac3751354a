//! Shared reconciler context
//!
//! Every collaborator is held as a trait object so production clients and
//! test doubles plug in the same way.

use std::sync::Arc;

use stratum_common::Error;

use crate::addons::ManifestSource;
use crate::cloud::{CloudProvider, HttpPublicIpResolver, PublicIpResolver};
use crate::config::ReconcilerConfig;
use crate::images::ImageBuilder;
use crate::kube_api::{ClusterApiConnector, KubeClusterApiConnector};
use crate::node_os::{NodeOsConnector, PortProbe, TcpPortProbe};
use crate::nodeconfig::{NodeConfigGenerator, SecretsStore};

/// Collaborators and configuration for one reconciler
pub struct Context {
    /// Cloud provider client
    pub cloud: Arc<dyn CloudProvider>,
    /// Node OS management API
    pub node_os: Arc<dyn NodeOsConnector>,
    /// Machine configuration generator
    pub generator: Arc<dyn NodeConfigGenerator>,
    /// Kubernetes API sessions
    pub cluster_api: Arc<dyn ClusterApiConnector>,
    /// Addon manifest renderer
    pub manifests: Arc<dyn ManifestSource>,
    /// Node image builder
    pub image_builder: Arc<dyn ImageBuilder>,
    /// Caller public IP lookup
    pub public_ip: Arc<dyn PublicIpResolver>,
    /// TCP reachability
    pub probe: Arc<dyn PortProbe>,
    /// Persisted per-cluster state
    pub store: SecretsStore,
    /// Timeouts, intervals, token
    pub config: ReconcilerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(config: ReconcilerConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }
}

/// Builder for constructing [`Context`] instances
///
/// The cloud provider, node OS connector, configuration generator, manifest
/// source, and image builder have no default and must be set. The Kubernetes
/// connector, public IP resolver, and port probe default to the production
/// implementations.
///
/// ```text
/// let ctx = Context::builder(config)
///     .cloud(hcloud)
///     .node_os(talos)
///     .generator(talos_gen)
///     .manifests(charts)
///     .image_builder(packer)
///     .build()?;
/// ```
pub struct ContextBuilder {
    config: ReconcilerConfig,
    cloud: Option<Arc<dyn CloudProvider>>,
    node_os: Option<Arc<dyn NodeOsConnector>>,
    generator: Option<Arc<dyn NodeConfigGenerator>>,
    cluster_api: Option<Arc<dyn ClusterApiConnector>>,
    manifests: Option<Arc<dyn ManifestSource>>,
    image_builder: Option<Arc<dyn ImageBuilder>>,
    public_ip: Option<Arc<dyn PublicIpResolver>>,
    probe: Option<Arc<dyn PortProbe>>,
}

impl ContextBuilder {
    fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            cloud: None,
            node_os: None,
            generator: None,
            cluster_api: None,
            manifests: None,
            image_builder: None,
            public_ip: None,
            probe: None,
        }
    }

    /// Set the cloud provider client
    pub fn cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Set the node OS connector
    pub fn node_os(mut self, node_os: Arc<dyn NodeOsConnector>) -> Self {
        self.node_os = Some(node_os);
        self
    }

    /// Set the configuration generator
    pub fn generator(mut self, generator: Arc<dyn NodeConfigGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Override the Kubernetes connector
    pub fn cluster_api(mut self, connector: Arc<dyn ClusterApiConnector>) -> Self {
        self.cluster_api = Some(connector);
        self
    }

    /// Set the addon manifest source
    pub fn manifests(mut self, manifests: Arc<dyn ManifestSource>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Set the image builder
    pub fn image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.image_builder = Some(builder);
        self
    }

    /// Override the public IP resolver
    pub fn public_ip(mut self, resolver: Arc<dyn PublicIpResolver>) -> Self {
        self.public_ip = Some(resolver);
        self
    }

    /// Override the port probe
    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        fn required<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> Result<Arc<T>, Error> {
            value.ok_or_else(|| Error::internal_with_context("context", format!("{} is required", name)))
        }

        let public_ip: Arc<dyn PublicIpResolver> = match self.public_ip {
            Some(resolver) => resolver,
            None => Arc::new(HttpPublicIpResolver::with_default_endpoint()?),
        };

        Ok(Context {
            cloud: required(self.cloud, "cloud provider")?,
            node_os: required(self.node_os, "node OS connector")?,
            generator: required(self.generator, "configuration generator")?,
            cluster_api: self
                .cluster_api
                .unwrap_or_else(|| Arc::new(KubeClusterApiConnector)),
            manifests: required(self.manifests, "manifest source")?,
            image_builder: required(self.image_builder, "image builder")?,
            public_ip,
            probe: self.probe.unwrap_or_else(|| Arc::new(TcpPortProbe::default())),
            store: SecretsStore::new(self.config.state_dir.clone()),
            config: self.config,
        })
    }
}
