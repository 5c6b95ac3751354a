//! Node configuration generation and persisted cluster secrets
//!
//! The generator itself is external; this module defines its contract and
//! owns the on-disk secrets and kubeconfig files. Secrets are load-or-generate:
//! an existing file is never replaced, and a corrupt one stops the run.

use std::fmt;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

use stratum_common::model::NodeRole;
use stratum_common::Error;

const SECRETS_FILE: &str = "secrets.yaml";
const KUBECONFIG_FILE: &str = "kubeconfig";
const CLIENT_CONFIG_FILE: &str = "talosconfig";
const IPSEC_KEY_FILE: &str = "ipsec.key";

/// Cluster secret bundle (CA, bootstrap tokens, encryption keys)
#[derive(Clone, PartialEq, Eq)]
pub struct NodeSecrets(Vec<u8>);

impl NodeSecrets {
    /// Wrap serialized secrets
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Serialized form
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NodeSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeSecrets({} bytes)", self.0.len())
    }
}

/// Manifest embedded into the control-plane configuration and applied by the
/// node OS during bootstrap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineManifest {
    /// Manifest name
    pub name: String,
    /// Multi-document YAML
    pub contents: String,
}

/// Per-node inputs to machine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineConfigInput {
    /// Cluster name
    pub cluster_name: String,
    /// Stable control-plane endpoint (`https://<load balancer>:6443`)
    pub endpoint: Url,
    /// Subject-Alternative-Names for the API and management certificates
    pub cert_sans: Vec<String>,
    /// Kubernetes version without the leading `v`
    pub kubernetes_version: String,
    /// Node hostname (the server name)
    pub hostname: String,
    /// Node role
    pub role: NodeRole,
    /// Private address in the cluster network
    pub private_ip: Ipv4Addr,
    /// Extra Kubernetes node labels
    pub node_labels: Vec<(String, String)>,
    /// Pod network range
    pub pod_cidr: String,
    /// Hand node initialization to the external cloud controller
    pub external_cloud_provider: bool,
    /// Disable the built-in CNI because one is installed as an addon
    pub disable_default_cni: bool,
    /// Disable kube-proxy because the CNI replaces it
    pub disable_kube_proxy: bool,
    /// Manifests to apply at bootstrap (control plane only)
    pub inline_manifests: Vec<InlineManifest>,
}

/// Machine configuration and credential generation
#[cfg_attr(test, automock)]
pub trait NodeConfigGenerator: Send + Sync {
    /// Generate fresh cluster secrets for a node OS version
    fn generate_secrets(&self, os_version: &str) -> Result<NodeSecrets, Error>;
    /// Check that persisted secrets are structurally complete
    fn validate_secrets(&self, secrets: &NodeSecrets) -> Result<(), String>;
    /// Control-plane machine configuration
    fn control_plane_config(&self, secrets: &NodeSecrets, input: &MachineConfigInput) -> Result<Vec<u8>, Error>;
    /// Worker machine configuration
    fn worker_config(&self, secrets: &NodeSecrets, input: &MachineConfigInput) -> Result<Vec<u8>, Error>;
    /// Management API client configuration for the given node endpoints
    fn client_config(&self, secrets: &NodeSecrets, cluster_name: &str, endpoints: &[String]) -> Result<Vec<u8>, Error>;
    /// Admin kubeconfig for the given API endpoint
    fn kubeconfig(&self, secrets: &NodeSecrets, cluster_name: &str, endpoint: &Url) -> Result<Vec<u8>, Error>;
}

/// Per-cluster state files under a root directory
#[derive(Clone, Debug)]
pub struct SecretsStore {
    root: PathBuf,
}

impl SecretsStore {
    /// Store rooted at `root`; cluster files live in `root/<cluster>/`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one cluster's files
    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.root.join(cluster)
    }

    /// Secrets file path
    pub fn secrets_path(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join(SECRETS_FILE)
    }

    /// Kubeconfig file path
    pub fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join(KUBECONFIG_FILE)
    }

    /// Management client configuration file path
    pub fn client_config_path(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join(CLIENT_CONFIG_FILE)
    }

    /// Load the cluster's secrets, generating and persisting them on first use.
    ///
    /// An existing file that fails validation is reported as
    /// [`Error::Secrets`] and left untouched.
    pub fn load_or_generate(
        &self,
        cluster: &str,
        os_version: &str,
        generator: &dyn NodeConfigGenerator,
    ) -> Result<NodeSecrets, Error> {
        let path = self.secrets_path(cluster);
        match fs::read(&path) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Err(Error::secrets(path.display().to_string(), "file is empty"));
                }
                let secrets = NodeSecrets::new(bytes);
                generator
                    .validate_secrets(&secrets)
                    .map_err(|msg| Error::secrets(path.display().to_string(), msg))?;
                info!(cluster = %cluster, path = %path.display(), "Reusing persisted cluster secrets");
                Ok(secrets)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let secrets = generator.generate_secrets(os_version)?;
                write_private(&path, secrets.as_bytes())?;
                info!(cluster = %cluster, path = %path.display(), "Generated new cluster secrets");
                Ok(secrets)
            }
            Err(e) => Err(Error::secrets(path.display().to_string(), e.to_string())),
        }
    }

    /// Load the CNI IPsec key, generating and persisting it on first use
    pub fn load_or_generate_ipsec_key(
        &self,
        cluster: &str,
        generate: impl FnOnce() -> String,
    ) -> Result<String, Error> {
        let path = self.cluster_dir(cluster).join(IPSEC_KEY_FILE);
        match fs::read_to_string(&path) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            Ok(_) => Err(Error::secrets(path.display().to_string(), "file is empty")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = generate();
                write_private(&path, key.as_bytes())?;
                info!(cluster = %cluster, "Generated CNI encryption key");
                Ok(key)
            }
            Err(e) => Err(Error::secrets(path.display().to_string(), e.to_string())),
        }
    }

    /// Persist the kubeconfig with owner-only permissions
    pub fn write_kubeconfig(&self, cluster: &str, kubeconfig: &[u8]) -> Result<PathBuf, Error> {
        let path = self.kubeconfig_path(cluster);
        write_private(&path, kubeconfig)?;
        Ok(path)
    }

    /// Persist the management client configuration with owner-only permissions
    pub fn write_client_config(&self, cluster: &str, client_config: &[u8]) -> Result<PathBuf, Error> {
        let path = self.client_config_path(cluster);
        write_private(&path, client_config)?;
        Ok(path)
    }
}

/// Write `bytes` to `path` atomically with mode 0600
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::internal_with_context("state", format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir.display().to_string(), e))?;

    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&tmp)
        .map_err(|e| Error::io(tmp.display().to_string(), e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::io(tmp.display().to_string(), e))?;
    drop(file);

    #[cfg(unix)]
    {
        // The temp file may have pre-existed with wider permissions.
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)) {
            warn!(path = %tmp.display(), error = %e, "could not restrict permissions");
        }
    }

    fs::rename(&tmp, path).map_err(|e| Error::io(path.display().to_string(), e))
}
