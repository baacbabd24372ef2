//! Kubernetes API client implementing [`RemoteStore`].
//!
//! Provides:
//! - Connection resolution from `--master` / `--kubeconfig`, in-cluster
//!   service account discovery, or the default kubeconfig
//! - Listing and watching a resource collection (nodes by default)
//! - Strategic-merge label patches

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::object::{split_key, ChangeKind, Object, ObjectList, WatchEvent};
use crate::store::{RemoteStore, StoreError, WatchStream};

/// Collection the controller works on.
pub const DEFAULT_RESOURCE_PATH: &str = "/api/v1/nodes";

/// Content type of label patches.
pub const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

/// Timeout for list and patch requests. Watches are long-lived and unbounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side timeout requested for each watch.
const WATCH_TIMEOUT_SECS: u64 = 290;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

// =============================================================================
// Connection configuration
// =============================================================================

/// Resolved API server connection.
#[derive(Clone, Default)]
pub struct ClusterConfig {
    /// API server base URL.
    pub server: String,

    /// Bearer token.
    pub token: Option<String>,

    /// PEM bundle of additional trusted CAs.
    pub ca_pem: Option<Vec<u8>>,

    /// PEM client certificate followed by its private key.
    pub identity_pem: Option<Vec<u8>>,

    /// Skip server certificate verification.
    pub insecure_skip_tls_verify: bool,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.is_some())
            .field("identity_pem", &self.identity_pem.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

impl ClusterConfig {
    /// Connection to `server` without credentials.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    /// Resolve the connection from the `--master` and `--kubeconfig` flags.
    ///
    /// - kubeconfig given: load it; `master` overrides its server
    /// - only master given: use it without credentials
    /// - neither: in-cluster service account, then the default kubeconfig
    pub fn from_flags(master: Option<&str>, kubeconfig: Option<&Path>) -> Result<Self> {
        let master = master.filter(|m| !m.is_empty());

        match (master, kubeconfig) {
            (master, Some(path)) => {
                let mut config = Self::from_kubeconfig(path)?;
                if let Some(master) = master {
                    config.server = master.to_string();
                }
                Ok(config)
            }
            (Some(master), None) => Ok(Self::new(master)),
            (None, None) => match Self::in_cluster() {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Neither --master nor --kubeconfig given and in-cluster config unavailable; using default kubeconfig"
                    );
                    let path = default_kubeconfig_path()
                        .context("Could not determine the default kubeconfig location")?;
                    Self::from_kubeconfig(&path)
                }
            },
        }
    }

    /// Service account credentials mounted into a pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set")?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token_path = dir.join("token");
        let token = fs::read_to_string(&token_path)
            .with_context(|| format!("Failed to read {}", token_path.display()))?;
        let ca_pem = fs::read(dir.join("ca.crt")).ok();

        Ok(Self {
            server: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            ca_pem,
            identity_pem: None,
            insecure_skip_tls_verify: false,
        })
    }

    /// Load the current context of a kubeconfig file.
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse kubeconfig {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        kubeconfig.resolve(base_dir)
    }
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".kube").join("config"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<String>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<String>,
    #[serde(default)]
    client_certificate: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

impl Kubeconfig {
    fn resolve(&self, base_dir: &Path) -> Result<ClusterConfig> {
        let context = match &self.current_context {
            Some(name) => self
                .contexts
                .iter()
                .find(|c| &c.name == name)
                .with_context(|| format!("Context {name:?} not found in kubeconfig"))?,
            None => self
                .contexts
                .first()
                .context("Kubeconfig has no contexts")?,
        };

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .with_context(|| {
                format!(
                    "Cluster {:?} not found in kubeconfig",
                    context.context.cluster
                )
            })?;

        let user = match &context.context.user {
            Some(name) => Some(
                self.users
                    .iter()
                    .find(|u| &u.name == name)
                    .with_context(|| format!("User {name:?} not found in kubeconfig"))?,
            ),
            None => None,
        };

        let ca_pem = inline_or_file(
            cluster.cluster.certificate_authority_data.as_deref(),
            cluster.cluster.certificate_authority.as_deref(),
            base_dir,
        )
        .context("Invalid certificate authority")?;

        let mut config = ClusterConfig {
            server: cluster.cluster.server.clone(),
            token: None,
            ca_pem,
            identity_pem: None,
            insecure_skip_tls_verify: cluster.cluster.insecure_skip_tls_verify,
        };

        let Some(user) = user else {
            return Ok(config);
        };
        let user = &user.user;

        config.token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(file)) => {
                let path = base_dir.join(file);
                let token = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read token file {}", path.display()))?;
                Some(token.trim().to_string())
            }
            (None, None) => None,
        };

        let cert = inline_or_file(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
        )
        .context("Invalid client certificate")?;
        let key = inline_or_file(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base_dir,
        )
        .context("Invalid client key")?;

        config.identity_pem = match (cert, key) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            (None, None) => None,
            _ => anyhow::bail!("Client certificate and key must be configured together"),
        };

        Ok(config)
    }
}

/// Base64 inline data wins over a file path, which is relative to the kubeconfig.
fn inline_or_file(data: Option<&str>, file: Option<&str>, base_dir: &Path) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .context("Inline data is not valid base64")?;
        return Ok(Some(decoded));
    }

    match file {
        Some(file) => {
            let path = base_dir.join(file);
            let bytes =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    resource_version: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct WireObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: serde_json::Value,
}

impl From<WireObject> for Object {
    fn from(wire: WireObject) -> Self {
        Self {
            name: wire.metadata.name,
            namespace: wire.metadata.namespace,
            resource_version: wire.metadata.resource_version,
            labels: wire.metadata.labels.unwrap_or_default(),
            state: wire.status,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<WireObject>,
}

#[derive(Debug, Deserialize)]
struct WireWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct WireStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode one line of a watch response.
fn decode_watch_line(line: &[u8]) -> Result<WatchEvent, StoreError> {
    let event: WireWatchEvent = serde_json::from_slice(line)?;

    let kind = match event.event_type.as_str() {
        "ADDED" => ChangeKind::Added,
        "MODIFIED" => ChangeKind::Modified,
        "DELETED" => ChangeKind::Deleted,
        "BOOKMARK" => {
            let object: WireObject = serde_json::from_value(event.object)?;
            return Ok(WatchEvent::Bookmark(
                object.metadata.resource_version.unwrap_or_default(),
            ));
        }
        "ERROR" => {
            let status: WireStatus = serde_json::from_value(event.object)?;
            let message = status
                .message
                .or(status.reason)
                .unwrap_or_else(|| "unknown watch error".to_string());
            return Err(match status.code {
                Some(410) => StoreError::Gone(message),
                _ => StoreError::Stream(message),
            });
        }
        other => {
            return Err(StoreError::Stream(format!(
                "unknown watch event type {other:?}"
            )))
        }
    };

    let object: WireObject = serde_json::from_value(event.object)?;
    Ok(WatchEvent::Changed(kind, object.into()))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end.max(start)]
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::GONE {
        return Err(StoreError::Gone(body));
    }

    error!(status = %status, body = %body, "Request failed");
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for one resource collection of the Kubernetes API.
#[derive(Debug, Clone)]
pub struct KubeClient {
    client: reqwest::Client,
    server: String,
    resource_path: String,
}

impl KubeClient {
    /// Build a client for the node collection.
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("Invalid bearer token format")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("node-labeler/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(ca_pem) = &config.ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(ca_pem)
                .context("Invalid certificate authority PEM")?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(identity_pem) = &config.identity_pem {
            let identity = reqwest::Identity::from_pem(identity_pem)
                .context("Invalid client certificate or key")?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            server: config.server.trim_end_matches('/').to_string(),
            resource_path: DEFAULT_RESOURCE_PATH.to_string(),
        })
    }

    /// Builder: work on another collection, e.g. `/api/v1/pods`.
    pub fn with_resource_path(mut self, resource_path: impl Into<String>) -> Self {
        self.resource_path = resource_path.into();
        self
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.server, self.resource_path)
    }

    fn object_url(&self, key: &str) -> String {
        match split_key(key) {
            (Some(namespace), name) => {
                let (prefix, resource) = self
                    .resource_path
                    .rsplit_once('/')
                    .unwrap_or(("", self.resource_path.as_str()));
                format!(
                    "{}{prefix}/namespaces/{namespace}/{resource}/{name}",
                    self.server
                )
            }
            (None, name) => format!("{}/{name}", self.collection_url()),
        }
    }
}

#[async_trait]
impl RemoteStore for KubeClient {
    async fn list_all(&self) -> Result<ObjectList, StoreError> {
        let url = self.collection_url();
        debug!(url = %url, "Listing objects");

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response).await?;
        let list: WireList = serde_json::from_slice(&response.bytes().await?)?;

        Ok(ObjectList {
            items: list.items.into_iter().map(Object::from).collect(),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<WatchStream, StoreError> {
        let url = self.collection_url();
        let mut query = vec![
            ("watch", "true".to_string()),
            ("allowWatchBookmarks", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string()),
        ];
        if let Some(version) = resource_version {
            query.push(("resourceVersion", version.to_string()));
        }
        debug!(url = %url, resource_version = ?resource_version, "Starting watch");

        let response = self.client.get(&url).query(&query).send().await?;
        let response = check_status(response).await?;
        let body = Box::pin(response.bytes_stream());

        let events = futures_util::stream::unfold(
            (body, BytesMut::new(), false),
            |(mut body, mut buffer, finished)| async move {
                if finished {
                    return None;
                }

                loop {
                    if let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(newline + 1);
                        let line = trim_line(&line);
                        if line.is_empty() {
                            continue;
                        }
                        let event = decode_watch_line(line);
                        return Some((event, (body, buffer, false)));
                    }

                    match body.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            return Some((Err(StoreError::Http(e)), (body, buffer, true)));
                        }
                        None => {
                            let rest = buffer.split();
                            let line = trim_line(&rest);
                            if line.is_empty() {
                                return None;
                            }
                            let event = decode_watch_line(line);
                            return Some((event, (body, buffer, true)));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    async fn patch_label(&self, key: &str, label: &str, value: &str) -> Result<(), StoreError> {
        let url = self.object_url(key);
        let patch = serde_json::json!({
            "metadata": {
                "labels": { label: value }
            }
        });
        debug!(url = %url, label = %label, value = %value, "Patching label");

        let response = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(serde_json::to_vec(&patch)?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }
}
