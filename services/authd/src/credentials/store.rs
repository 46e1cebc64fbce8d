//! Thread-safe credential store with Secret persistence.
//!
//! # Purpose
//! Maps cluster names to `(token, ca_cert)` pairs. When running in-cluster,
//! the whole map is mirrored into a single Kubernetes Secret so renewed
//! tokens survive restarts; outside a cluster the store is memory-only.
//!
//! # Notes
//! Reads never fail. A failed persistence attempt is reported to the caller
//! but the in-memory update stands, so the service keeps working off the
//! freshest credentials it has.
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

const TOKEN_KEY_SUFFIX: &str = "-token";
const CA_KEY_SUFFIX: &str = "-ca.crt";

/// Bearer token and CA certificate for one remote cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub ca_cert: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("persisting credentials secret {namespace}/{name}")]
    Persist {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

struct SecretBackend {
    client: kube::Client,
    namespace: String,
    name: String,
}

pub struct CredentialStore {
    entries: RwLock<HashMap<String, Credentials>>,
    backend: Option<SecretBackend>,
}

impl CredentialStore {
    /// A store with no durable backing. Used outside a cluster and in tests.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Builds a store backed by a Kubernetes Secret, seeding the in-memory
    /// map from any credentials persisted by a previous run. Falls back to a
    /// memory-only store when no API access exists.
    pub async fn with_persistence(namespace: &str, name: &str) -> Self {
        let client = match kube::Client::try_default().await {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "not running in cluster, credentials will not be persisted"
                );
                return Self::in_memory();
            }
        };
        let store = Self {
            entries: RwLock::new(HashMap::new()),
            backend: Some(SecretBackend {
                client,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        };
        if let Err(err) = store.load_from_secret().await {
            tracing::warn!(error = %err, "failed to load credentials from secret");
        }
        store
    }

    /// Returns a snapshot of the credentials for a cluster.
    pub fn get(&self, cluster: &str) -> Option<Credentials> {
        self.entries
            .read()
            .expect("credential lock poisoned")
            .get(cluster)
            .cloned()
    }

    /// Installs credentials for a cluster, then mirrors the whole map into
    /// the Secret. The in-memory update stands even when persistence fails.
    pub async fn set(&self, cluster: &str, credentials: Credentials) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write().expect("credential lock poisoned");
            entries.insert(cluster.to_string(), credentials);
        }
        self.persist().await
    }

    /// Reads bootstrap files and unconditionally replaces the entry.
    ///
    /// This intentionally skips persistence: bootstrap files are mounted state
    /// and the Secret should only ever hold tokens this service minted.
    pub fn load_from_files(
        &self,
        cluster: &str,
        token_path: &Path,
        ca_path: &Path,
    ) -> Result<(), StoreError> {
        let token = std::fs::read_to_string(token_path).map_err(|source| StoreError::Io {
            path: token_path.display().to_string(),
            source,
        })?;
        let ca_cert = std::fs::read(ca_path).map_err(|source| StoreError::Io {
            path: ca_path.display().to_string(),
            source,
        })?;
        let mut entries = self.entries.write().expect("credential lock poisoned");
        entries.insert(
            cluster.to_string(),
            Credentials {
                token: token.trim().to_string(),
                ca_cert,
            },
        );
        tracing::info!(cluster, "loaded bootstrap credentials from files");
        Ok(())
    }

    /// Like [`Self::load_from_files`], but a no-op when the cluster already
    /// has credentials, so persisted tokens from a prior run win over stale
    /// bootstrap files.
    pub fn load_bootstrap_from_files(
        &self,
        cluster: &str,
        token_path: &Path,
        ca_path: &Path,
    ) -> Result<(), StoreError> {
        if self.get(cluster).is_some() {
            tracing::info!(
                cluster,
                "skipping bootstrap: credentials already loaded from secret"
            );
            return Ok(());
        }
        self.load_from_files(cluster, token_path, ca_path)
    }

    async fn load_from_secret(&self) -> Result<(), kube::Error> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let api: Api<Secret> = Api::namespaced(backend.client.clone(), &backend.namespace);
        let secret = match api.get(&backend.name).await {
            Ok(secret) => secret,
            Err(err) if is_not_found(&err) => {
                tracing::info!(
                    namespace = %backend.namespace,
                    name = %backend.name,
                    "credentials secret not found, starting fresh"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let data = secret.data.unwrap_or_default();
        let mut entries = self.entries.write().expect("credential lock poisoned");
        for (key, ByteString(token)) in &data {
            let Some(cluster) = key.strip_suffix(TOKEN_KEY_SUFFIX) else {
                continue;
            };
            let Some(ByteString(ca_cert)) = data.get(&format!("{cluster}{CA_KEY_SUFFIX}")) else {
                continue;
            };
            entries.insert(
                cluster.to_string(),
                Credentials {
                    token: String::from_utf8_lossy(token).trim().to_string(),
                    ca_cert: ca_cert.clone(),
                },
            );
            tracing::info!(cluster, "loaded credentials from secret");
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };

        let data: BTreeMap<String, ByteString> = {
            let entries = self.entries.read().expect("credential lock poisoned");
            entries
                .iter()
                .flat_map(|(cluster, credentials)| {
                    [
                        (
                            format!("{cluster}{TOKEN_KEY_SUFFIX}"),
                            ByteString(credentials.token.clone().into_bytes()),
                        ),
                        (
                            format!("{cluster}{CA_KEY_SUFFIX}"),
                            ByteString(credentials.ca_cert.clone()),
                        ),
                    ]
                })
                .collect()
        };

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(backend.name.clone()),
                namespace: Some(backend.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(backend.client.clone(), &backend.namespace);
        let persist_error = |source| StoreError::Persist {
            namespace: backend.namespace.clone(),
            name: backend.name.clone(),
            source,
        };
        match api.replace(&backend.name, &PostParams::default(), &secret).await {
            Ok(_) => {
                tracing::debug!(
                    namespace = %backend.namespace,
                    name = %backend.name,
                    "updated credentials secret"
                );
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                api.create(&PostParams::default(), &secret)
                    .await
                    .map_err(persist_error)?;
                tracing::info!(
                    namespace = %backend.namespace,
                    name = %backend.name,
                    "created credentials secret"
                );
                Ok(())
            }
            Err(err) => Err(persist_error(err)),
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}
