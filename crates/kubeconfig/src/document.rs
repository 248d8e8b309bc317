//! The credential document, modelled after the orchestrator client's
//! config file. Keys this crate does not understand are carried through
//! untouched.

use minikit_core::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type Extra = BTreeMap<String, Value>;

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    #[serde(
        rename = "certificate-authority",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority: Option<PathBuf>,
    #[serde(
        rename = "certificate-authority-data",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<Vec<u8>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Cluster {
    fn has_ca(&self) -> bool {
        self.certificate_authority.is_some() || self.certificate_authority_data.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(
        rename = "client-certificate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate: Option<PathBuf>,
    #[serde(rename = "client-key", default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    #[serde(
        rename = "client-certificate-data",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<Vec<u8>>,
    #[serde(
        rename = "client-key-data",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_key_data: Option<Vec<u8>>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: User,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    #[serde(default)]
    pub context: Context,
    #[serde(flatten)]
    pub extra: Extra,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, deserialize_with = "nullable")]
    pub clusters: Vec<NamedCluster>,
    #[serde(default, deserialize_with = "nullable")]
    pub users: Vec<NamedUser>,
    #[serde(default, deserialize_with = "nullable")]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default, deserialize_with = "nullable")]
    pub current_context: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: Vec::new(),
            users: Vec::new(),
            contexts: Vec::new(),
            current_context: String::new(),
            extra: Extra::new(),
        }
    }
}

/// Certificate files for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub ca: PathBuf,
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
}

impl CertPaths {
    /// `<machine-dir>/certs/{ca.crt,client.crt,client.key}`
    pub fn for_machine(machine_dir: &Path) -> Self {
        let certs = machine_dir.join("certs");
        Self {
            ca: certs.join("ca.crt"),
            client_certificate: certs.join("client.crt"),
            client_key: certs.join("client.key"),
        }
    }
}

/// Where a machine's API server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub certs: CertPaths,
    /// Leave `current-context` alone.
    pub keep_context: bool,
}

impl Endpoint {
    pub fn server(&self) -> String {
        if self.host.contains(':') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

impl Config {
    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }

    pub fn context(&self, name: &str) -> Option<&Context> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.users.is_empty() && self.contexts.is_empty()
    }

    /// Every context must point at a cluster and a user that exist.
    pub fn validate(&self) -> Result<()> {
        self.contexts
            .iter()
            .try_for_each(|named| self.check_context(&named.name, &named.context))
    }

    /// Like [`Config::validate`] but only for the context called `name`.
    /// A missing context is not an error.
    pub fn validate_context(&self, name: &str) -> Result<()> {
        match self.context(name) {
            Some(ctx) => self.check_context(name, ctx),
            None => Ok(()),
        }
    }

    fn check_context(&self, name: &str, ctx: &Context) -> Result<()> {
        if self.cluster(&ctx.cluster).is_none() {
            return Err(Error::DanglingContext {
                context: name.to_string(),
                kind: "cluster",
                name: ctx.cluster.clone(),
            });
        }
        if self.user(&ctx.user).is_none() {
            return Err(Error::DanglingContext {
                context: name.to_string(),
                kind: "user",
                name: ctx.user.clone(),
            });
        }
        Ok(())
    }

    /// Merges `endpoint` into the document. Returns whether anything
    /// changed.
    pub fn apply(&mut self, endpoint: &Endpoint) -> bool {
        let server = endpoint.server();
        let mut changed = false;

        match self.clusters.iter_mut().find(|c| c.name == endpoint.name) {
            Some(named) => {
                let cluster = &mut named.cluster;
                if cluster.server != server {
                    cluster.server = server;
                    changed = true;
                }
                if !cluster.has_ca() {
                    cluster.certificate_authority = Some(endpoint.certs.ca.clone());
                    changed = true;
                }
            }
            None => {
                self.clusters.push(NamedCluster {
                    name: endpoint.name.clone(),
                    cluster: Cluster {
                        server,
                        certificate_authority: Some(endpoint.certs.ca.clone()),
                        ..Default::default()
                    },
                    extra: Extra::new(),
                });
                changed = true;
            }
        }

        match self.users.iter_mut().find(|u| u.name == endpoint.name) {
            Some(named) => {
                let user = &mut named.user;
                if user.client_certificate.is_none() && user.client_certificate_data.is_none() {
                    user.client_certificate = Some(endpoint.certs.client_certificate.clone());
                    changed = true;
                }
                if user.client_key.is_none() && user.client_key_data.is_none() {
                    user.client_key = Some(endpoint.certs.client_key.clone());
                    changed = true;
                }
            }
            None => {
                self.users.push(NamedUser {
                    name: endpoint.name.clone(),
                    user: User {
                        client_certificate: Some(endpoint.certs.client_certificate.clone()),
                        client_key: Some(endpoint.certs.client_key.clone()),
                        ..Default::default()
                    },
                    extra: Extra::new(),
                });
                changed = true;
            }
        }

        match self.contexts.iter_mut().find(|c| c.name == endpoint.name) {
            Some(named) => {
                let ctx = &mut named.context;
                if ctx.cluster != endpoint.name || ctx.user != endpoint.name {
                    ctx.cluster = endpoint.name.clone();
                    ctx.user = endpoint.name.clone();
                    changed = true;
                }
            }
            None => {
                self.contexts.push(NamedContext {
                    name: endpoint.name.clone(),
                    context: Context {
                        cluster: endpoint.name.clone(),
                        user: endpoint.name.clone(),
                        ..Default::default()
                    },
                    extra: Extra::new(),
                });
                changed = true;
            }
        }

        if !endpoint.keep_context && self.current_context != endpoint.name {
            self.current_context = endpoint.name.clone();
            changed = true;
        }

        changed
    }

    /// Drops the cluster, user and context called `name`. Returns whether
    /// anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.clusters.len() + self.users.len() + self.contexts.len();
        self.clusters.retain(|c| c.name != name);
        self.users.retain(|u| u.name != name);
        self.contexts.retain(|c| c.name != name);
        let removed = before != self.clusters.len() + self.users.len() + self.contexts.len();
        if self.current_context == name {
            self.current_context.clear();
            return true;
        }
        removed
    }
}
