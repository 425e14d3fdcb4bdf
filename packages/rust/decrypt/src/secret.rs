//! External secret store: key material fetched from a cluster secret.
//!
//! The cluster is reached through an explicit API endpoint, a kube-config
//! file, or the in-cluster service account, in that order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use subst_shared::{BuildConfig, Result, SubstError};

/// User-Agent string for cluster requests.
const USER_AGENT: &str = concat!("subst/", env!("CARGO_PKG_VERSION"));

/// Request timeout for secret fetches.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Name and namespace of a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read-only access to named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the decoded data entries of a secret.
    async fn fetch(&self, secret: &SecretRef) -> Result<BTreeMap<String, Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Cluster connection
// ---------------------------------------------------------------------------

/// Where and how to reach the cluster API.
#[derive(Clone)]
pub struct ClusterConnection {
    pub server: Url,
    pub token: Option<String>,
    /// PEM bundle of the cluster CA.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("server", &self.server.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.is_some())
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl ClusterConnection {
    /// Resolve a connection. An explicit `kube_api` overrides the kube-config server.
    pub fn resolve(kube_api: Option<&str>, kubeconfig: Option<&Path>) -> Result<Self> {
        let file = match kubeconfig {
            Some(path) if path.exists() => Some(KubeConfig::load(path)?),
            _ => None,
        };

        let from_file = file.as_ref().map(KubeConfig::current).transpose()?;

        match (kube_api, from_file) {
            (Some(api), Some(mut conn)) => {
                conn.server = parse_server(api)?;
                Ok(conn)
            }
            (Some(api), None) => Ok(Self {
                server: parse_server(api)?,
                token: None,
                ca_pem: None,
                insecure: false,
            }),
            (None, Some(conn)) => Ok(conn),
            (None, None) => Self::in_cluster(),
        }
    }

    /// Service-account connection when running inside a pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| SubstError::config("no kube-config and not running in a cluster"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token_path = dir.join("token");
        let token = std::fs::read_to_string(&token_path)
            .map_err(|e| SubstError::io(&token_path, e))?;
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();

        Ok(Self {
            server: parse_server(&format!("https://{host}:{port}"))?,
            token: Some(token.trim().to_string()),
            ca_pem,
            insecure: false,
        })
    }
}

fn parse_server(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| SubstError::config(format!("invalid cluster API '{raw}': {e}")))
}

// ---------------------------------------------------------------------------
// kube-config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    ca_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure: bool,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
}

impl KubeConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| SubstError::io(path, e))?;
        serde_yaml::from_slice(&content).map_err(|e| {
            SubstError::config(format!("failed to parse kube-config {}: {e}", path.display()))
        })
    }

    fn current(&self) -> Result<ClusterConnection> {
        let context_name = self
            .current_context
            .as_deref()
            .ok_or_else(|| SubstError::config("kube-config has no current-context"))?;
        let context = find(&self.contexts, context_name, "context")?;
        let cluster = find(&self.clusters, &context.cluster, "cluster")?;
        let token = match &context.user {
            Some(user) => find(&self.users, user, "user")?.token.clone(),
            None => None,
        };
        let ca_pem = cluster
            .ca_data
            .as_deref()
            .map(|data| STANDARD.decode(data.trim()))
            .transpose()
            .map_err(|e| SubstError::config(format!("bad certificate-authority-data: {e}")))?;

        Ok(ClusterConnection {
            server: parse_server(&cluster.server)?,
            token,
            ca_pem,
            insecure: cluster.insecure,
        })
    }
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, kind: &str) -> Result<&'a T> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| &e.value)
        .ok_or_else(|| SubstError::config(format!("kube-config {kind} '{name}' not found")))
}

// ---------------------------------------------------------------------------
// Kubernetes secret store
// ---------------------------------------------------------------------------

/// Secret store backed by the Kubernetes core API.
#[derive(Debug)]
pub struct KubeSecretStore {
    client: Client,
    connection: ClusterConnection,
}

#[derive(Debug, Deserialize)]
struct SecretBody {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl KubeSecretStore {
    /// Resolve the cluster from the build configuration and build a client.
    pub fn connect(config: &BuildConfig) -> Result<Self> {
        let kubeconfig = config.kubeconfig_path();
        let connection =
            ClusterConnection::resolve(config.secret.kube_api.as_deref(), kubeconfig.as_deref())?;
        Self::new(connection)
    }

    pub fn new(connection: ClusterConnection) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));

        if let Some(pem) = &connection.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| SubstError::Network(format!("invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if connection.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| SubstError::Network(format!("failed to build HTTP client: {e}")))?;

        debug!(server = %connection.server, "cluster client ready");
        Ok(Self { client, connection })
    }

    fn secret_url(&self, secret: &SecretRef) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.connection.server.as_str().trim_end_matches('/'),
            secret.namespace,
            secret.name
        )
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    #[instrument(skip_all, fields(secret = %secret))]
    async fn fetch(&self, secret: &SecretRef) -> Result<BTreeMap<String, Vec<u8>>> {
        let url = self.secret_url(secret);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.connection.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SubstError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubstError::Network(format!("{url}: HTTP {status}")));
        }

        let body: SecretBody = response
            .json()
            .await
            .map_err(|e| SubstError::parse(format!("{url}: {e}")))?;

        body.data
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value.trim())
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|e| SubstError::parse(format!("secret entry {key}: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://dev.example.com:6443
      insecure-skip-tls-verify: true
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: dev-user
users:
  - name: dev-user
    user:
      token: t0ken
"#;

    fn write_kubeconfig(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("subst-kubeconfig-{}", Uuid::now_v7()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn resolves_current_context() {
        let path = write_kubeconfig(KUBECONFIG);
        let conn = ClusterConnection::resolve(None, Some(&path)).unwrap();
        assert_eq!(conn.server.as_str(), "https://dev.example.com:6443/");
        assert_eq!(conn.token.as_deref(), Some("t0ken"));
        assert!(conn.insecure);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn explicit_api_overrides_server() {
        let path = write_kubeconfig(KUBECONFIG);
        let conn = ClusterConnection::resolve(Some("https://api.internal:443"), Some(&path)).unwrap();
        assert_eq!(conn.server.host_str(), Some("api.internal"));
        assert_eq!(conn.token.as_deref(), Some("t0ken"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_context_is_a_config_error() {
        let path = write_kubeconfig("current-context: nope\n");
        let err = ClusterConnection::resolve(None, Some(&path)).unwrap_err();
        assert!(err.to_string().contains("context 'nope' not found"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn connection_debug_redacts_token() {
        let path = write_kubeconfig(KUBECONFIG);
        let conn = ClusterConnection::resolve(None, Some(&path)).unwrap();
        assert!(!format!("{conn:?}").contains("t0ken"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn fetches_and_decodes_secret() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/namespaces/argocd/secrets/subst-keys"))
            .and(wiremock::matchers::header("authorization", "Bearer t0ken"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "Secret",
                "data": { "key": STANDARD.encode("abc123") }
            })))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(ClusterConnection {
            server: Url::parse(&server.uri()).unwrap(),
            token: Some("t0ken".into()),
            ca_pem: None,
            insecure: false,
        })
        .unwrap();

        let data = store.fetch(&SecretRef::new("subst-keys", "argocd")).await.unwrap();
        assert_eq!(data.get("key").map(Vec::as_slice), Some(b"abc123".as_slice()));
    }

    #[tokio::test]
    async fn missing_secret_is_a_network_error() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(ClusterConnection {
            server: Url::parse(&server.uri()).unwrap(),
            token: None,
            ca_pem: None,
            insecure: false,
        })
        .unwrap();

        let err = store.fetch(&SecretRef::new("missing", "default")).await.unwrap_err();
        assert!(matches!(err, SubstError::Network(_)));
        assert!(err.to_string().contains("404"));
    }
}
