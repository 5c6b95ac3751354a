//! YAML parsing on top of yaml-rust2
//!
//! Kubeconfigs, secrets files, and addon manifests arrive as YAML. They are
//! converted into `serde_json::Value` so the rest of the code works on one
//! document representation.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a multi-document stream, dropping empty documents.
///
/// Rendered charts routinely contain `---` separators around comments only;
/// those produce null documents that have nothing to apply.
pub fn parse_manifests(input: &str) -> Result<Vec<Value>, Error> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    docs.into_iter()
        .map(yaml_to_json)
        .filter(|doc| !matches!(doc, Ok(Value::Null)))
        .collect()
}

/// Identity of a Kubernetes object: apiVersion, kind, name, namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectIdentity {
    /// `apiVersion` field
    pub api_version: String,
    /// `kind` field
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, when set
    pub namespace: Option<String>,
}

impl ObjectIdentity {
    /// Extract the identity of a parsed manifest
    pub fn of(doc: &Value) -> Result<Self, Error> {
        let field = |pointer: &str| doc.pointer(pointer).and_then(Value::as_str);
        let kind = field("/kind")
            .ok_or_else(|| Error::serialization("manifest has no kind"))?
            .to_string();
        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization_for_kind(&kind, "manifest has no apiVersion"))?
            .to_string();
        let name = field("/metadata/name")
            .ok_or_else(|| Error::serialization_for_kind(&kind, "manifest has no metadata.name"))?
            .to_string();
        Ok(Self {
            api_version,
            kind,
            name,
            namespace: field("/metadata/namespace").map(str::to_string),
        })
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    _ => return Err(Error::serialization("unsupported YAML key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::serialization("bad YAML value")),
    }
}
