//! Cluster credential (kubeconfig) parsing and structural checks
//!
//! A kubeconfig is a capability token. The reconciler only hands one back
//! after confirming it points at the API load balancer, never at an
//! individual node.

use std::fmt;

use serde_json::Value;
use url::Url;

use crate::{yaml, Error, KUBE_API_PORT};

/// A verified kubeconfig
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterCredential {
    raw: Vec<u8>,
    server: Url,
    context: String,
}

impl fmt::Debug for ClusterCredential {
    // Raw bytes carry client keys; keep them out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("server", &self.server.as_str())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ClusterCredential {
    /// Parse and verify a kubeconfig against the expected API endpoint host.
    ///
    /// The document must have non-empty `clusters`, `users`, and `contexts`
    /// sections and a `current-context` whose cluster's server URL is
    /// `https://<expected_host>:6443`.
    pub fn verify(raw: Vec<u8>, expected_host: &str) -> Result<Self, Error> {
        let text = std::str::from_utf8(&raw)
            .map_err(|e| Error::credential(format!("kubeconfig is not valid UTF-8: {}", e)))?;
        let doc = yaml::parse_yaml(text)
            .map_err(|e| Error::credential(format!("kubeconfig does not parse: {}", e)))?;

        for section in ["clusters", "users", "contexts"] {
            let populated = doc
                .get(section)
                .and_then(Value::as_array)
                .is_some_and(|entries| !entries.is_empty());
            if !populated {
                return Err(Error::credential(format!(
                    "kubeconfig has no entries in '{}'",
                    section
                )));
            }
        }

        let context = doc
            .get("current-context")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::credential("kubeconfig has no current-context"))?
            .to_string();

        let cluster_ref = named_entry(&doc, "contexts", &context)
            .and_then(|entry| entry.pointer("/context/cluster"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::credential(format!("current-context '{}' does not name a cluster", context))
            })?;

        let server = named_entry(&doc, "clusters", cluster_ref)
            .and_then(|entry| entry.pointer("/cluster/server"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::credential(format!("cluster '{}' has no server URL", cluster_ref))
            })?;
        let server = Url::parse(server)
            .map_err(|e| Error::credential(format!("server URL '{}' is invalid: {}", server, e)))?;

        let host = server.host_str().unwrap_or_default();
        if host != expected_host {
            return Err(Error::credential(format!(
                "server host {} does not match the API endpoint {}",
                host, expected_host
            )));
        }
        if server.port_or_known_default() != Some(KUBE_API_PORT) {
            return Err(Error::credential(format!(
                "server URL {} does not use port {}",
                server, KUBE_API_PORT
            )));
        }

        Ok(Self {
            raw,
            server,
            context,
        })
    }

    /// The kubeconfig document as returned by the generator
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// API server URL of the current context
    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Name of the current context
    pub fn context(&self) -> &str {
        &self.context
    }
}

fn named_entry<'a>(doc: &'a Value, section: &str, name: &str) -> Option<&'a Value> {
    doc.get(section)?
        .as_array()?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
}
