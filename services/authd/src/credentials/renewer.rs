//! Per-cluster credential renewal loops.
//!
//! # Purpose
//! Keeps each remote cluster's bearer token fresh by calling the cluster's
//! TokenRequest API before the current token expires, falling back to the
//! mounted bootstrap files when the stored token no longer works.
//!
//! # Notes
//! Renewal failures are logged and retried on the next tick; the serving path
//! never observes them directly. A successful renewal invalidates the cached
//! verifier so subsequent JWKS fetches use the new token.
use crate::auth::claims::{self, ClaimsError};
use crate::auth::verifier::VerifierInvalidator;
use crate::config::{AuthConfig, ClusterConfig};
use crate::credentials::store::{CredentialStore, Credentials, StoreError};
use crate::credentials::ca_bundle_der;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::Resource;
use kube::api::PostParams;
use kube::core::Request;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RenewError {
    #[error("no credentials available for cluster {0}")]
    NoCredentials(String),
    #[error("loading bootstrap credentials")]
    Bootstrap(#[source] StoreError),
    #[error("parsing token subject")]
    Subject(#[from] ClaimsError),
    #[error("invalid API server url {url}")]
    InvalidApiServer {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("creating kubernetes client")]
    Client(#[source] kube::Error),
    #[error("encoding token request")]
    Encode(#[source] serde_json::Error),
    #[error("building token request")]
    BuildRequest(#[source] kube::core::request::Error),
    #[error("requesting token")]
    TokenRequest(#[source] kube::Error),
    #[error("token request returned no status")]
    EmptyToken,
    #[error("storing credentials")]
    Store(#[source] StoreError),
}

/// A token freshly minted by a cluster's TokenRequest API.
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Seam around the TokenRequest call so renewal logic is testable without a
/// live API server.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(
        &self,
        cluster: &ClusterConfig,
        credentials: &Credentials,
        namespace: &str,
        service_account: &str,
        duration: Duration,
    ) -> Result<MintedToken, RenewError>;
}

/// Production minter: builds a Kubernetes client against the cluster's API
/// server from the current credentials and issues a TokenRequest.
pub struct KubeTokenMinter;

#[async_trait]
impl TokenMinter for KubeTokenMinter {
    async fn mint(
        &self,
        cluster: &ClusterConfig,
        credentials: &Credentials,
        namespace: &str,
        service_account: &str,
        duration: Duration,
    ) -> Result<MintedToken, RenewError> {
        let url = cluster.api_server.clone().unwrap_or_default();
        let cluster_url = url
            .parse()
            .map_err(|source| RenewError::InvalidApiServer { url, source })?;

        let mut config = kube::Config::new(cluster_url);
        config.default_namespace = namespace.to_string();
        config.auth_info.token = Some(credentials.token.trim().to_string().into());
        if !credentials.ca_cert.is_empty() {
            config.root_cert = Some(ca_bundle_der(&credentials.ca_cert));
        }
        let client = kube::Client::try_from(config).map_err(RenewError::Client)?;

        let token_request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(duration.as_secs() as i64),
                ..Default::default()
            },
            ..Default::default()
        };
        // kube has no typed TokenRequest call; issue the token subresource
        // request by hand and deserialize the TokenRequest it returns.
        let body = serde_json::to_vec(&token_request).map_err(RenewError::Encode)?;
        let request = Request {
            url_path: ServiceAccount::url_path(&(), Some(namespace)),
        };
        let request = request
            .create_subresource("token", service_account, &PostParams::default(), body)
            .map_err(RenewError::BuildRequest)?;
        let response: TokenRequest = client
            .request(request)
            .await
            .map_err(RenewError::TokenRequest)?;
        let status = response.status.ok_or(RenewError::EmptyToken)?;

        Ok(MintedToken {
            token: status.token,
            expires_at: status.expiration_timestamp.0,
        })
    }
}

pub struct Renewer {
    config: Arc<AuthConfig>,
    store: Arc<CredentialStore>,
    invalidator: Arc<dyn VerifierInvalidator>,
    minter: Arc<dyn TokenMinter>,
}

impl Renewer {
    pub fn new(
        config: Arc<AuthConfig>,
        store: Arc<CredentialStore>,
        invalidator: Arc<dyn VerifierInvalidator>,
    ) -> Self {
        Self::with_minter(config, store, invalidator, Arc::new(KubeTokenMinter))
    }

    pub fn with_minter(
        config: Arc<AuthConfig>,
        store: Arc<CredentialStore>,
        invalidator: Arc<dyn VerifierInvalidator>,
        minter: Arc<dyn TokenMinter>,
    ) -> Self {
        Self {
            config,
            store,
            invalidator,
            minter,
        }
    }

    /// Spawns one renewal loop per remote cluster. Each loop renews once at
    /// startup, then ticks at the configured interval until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        for (name, cluster) in self.config.remote_clusters() {
            let renewer = self.clone();
            let name = name.to_string();
            let cluster = cluster.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                renewer.renew_loop(&name, &cluster, shutdown).await;
            });
        }
    }

    async fn renew_loop(&self, cluster: &str, config: &ClusterConfig, shutdown: CancellationToken) {
        let interval = self.config.renewal.interval();
        tracing::info!(cluster, ?interval, "starting credential renewal loop");

        if let Err(err) = self.renew(cluster, config).await {
            tracing::warn!(cluster, error = %format_chain(&err), "initial credential renewal failed");
        }

        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately and would double up the initial
        // renewal.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.renew(cluster, config).await {
                        tracing::warn!(cluster, error = %format_chain(&err), "credential renewal failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(cluster, "stopping credential renewal loop");
                    return;
                }
            }
        }
    }

    /// One renewal pass for one cluster.
    ///
    /// Skips when the stored token is comfortably far from expiry. On failure
    /// with bootstrap files configured, reloads them and retries exactly once.
    pub async fn renew(&self, cluster: &str, config: &ClusterConfig) -> Result<(), RenewError> {
        let credentials = match self.store.get(cluster) {
            Some(credentials) => credentials,
            None => {
                let (Some(token_path), Some(ca_path)) = (&config.token_path, &config.ca_cert)
                else {
                    return Err(RenewError::NoCredentials(cluster.to_string()));
                };
                self.store
                    .load_from_files(cluster, token_path, ca_path)
                    .map_err(RenewError::Bootstrap)?;
                self.store
                    .get(cluster)
                    .ok_or_else(|| RenewError::NoCredentials(cluster.to_string()))?
            }
        };

        check_ca_expiration(cluster, &credentials.ca_cert);

        let renew_before = chrono::Duration::from_std(self.config.renewal.renew_before())
            .unwrap_or_else(|_| chrono::Duration::hours(48));
        match claims::token_expiration(&credentials.token) {
            Ok(expires_at) => {
                let remaining = expires_at - Utc::now();
                if remaining > renew_before {
                    tracing::info!(
                        cluster,
                        expires_in_minutes = remaining.num_minutes(),
                        threshold_hours = renew_before.num_hours(),
                        "skipping renewal: token is not close to expiry"
                    );
                    return Ok(());
                }
                tracing::info!(
                    cluster,
                    expires_in_minutes = remaining.num_minutes(),
                    "renewing credentials"
                );
            }
            Err(err) => {
                tracing::info!(
                    cluster,
                    error = %err,
                    "renewing credentials: could not determine token expiration"
                );
            }
        }

        let Err(err) = self.request_new_token(cluster, config, &credentials).await else {
            return Ok(());
        };

        let (Some(token_path), Some(ca_path)) = (&config.token_path, &config.ca_cert) else {
            tracing::error!(
                cluster,
                "token renewal failed; mount a new bootstrap token and set token_path"
            );
            return Err(err);
        };

        tracing::warn!(
            cluster,
            error = %format_chain(&err),
            "token renewal failed, retrying with bootstrap credentials"
        );
        if let Err(load_err) = self.store.load_from_files(cluster, token_path, ca_path) {
            tracing::error!(
                cluster,
                path = %token_path.display(),
                error = %load_err,
                "failed to read bootstrap token"
            );
            return Err(err);
        }
        let bootstrap = self
            .store
            .get(cluster)
            .ok_or_else(|| RenewError::NoCredentials(cluster.to_string()))?;
        if let Err(retry_err) = self.request_new_token(cluster, config, &bootstrap).await {
            tracing::error!(
                cluster,
                path = %token_path.display(),
                "bootstrap token is invalid or expired; mount a new bootstrap token at this path"
            );
            return Err(retry_err);
        }
        Ok(())
    }

    async fn request_new_token(
        &self,
        cluster: &str,
        config: &ClusterConfig,
        credentials: &Credentials,
    ) -> Result<(), RenewError> {
        let (namespace, service_account) = claims::service_account_subject(&credentials.token)?;

        let minted = self
            .minter
            .mint(
                config,
                credentials,
                &namespace,
                &service_account,
                self.config.renewal.token_duration(),
            )
            .await?;

        let expires_at = minted.expires_at;
        self.store
            .set(
                cluster,
                Credentials {
                    token: minted.token,
                    ca_cert: credentials.ca_cert.clone(),
                },
            )
            .await
            .map_err(RenewError::Store)?;

        // New bearer means the verifier's cached HTTP state is stale.
        self.invalidator.invalidate(cluster);

        metrics::counter!("authd_renewals_total", "cluster" => cluster.to_string()).increment(1);
        tracing::info!(
            cluster,
            expires = %expires_at.to_rfc3339(),
            "renewed service account credentials"
        );
        Ok(())
    }
}

// Warns when the CA certificate is inside the last 20% of its lifetime.
// Informational only: an expiring CA needs operator action, not a restart.
fn check_ca_expiration(cluster: &str, ca_pem: &[u8]) {
    if ca_pem.is_empty() {
        return;
    }
    let pem = match x509_parser::pem::parse_x509_pem(ca_pem) {
        Ok((_, pem)) => pem,
        Err(err) => {
            tracing::warn!(cluster, error = %err, "failed to decode CA certificate PEM");
            return;
        }
    };
    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(err) => {
            tracing::warn!(cluster, error = %err, "failed to parse CA certificate");
            return;
        }
    };
    let validity = cert.validity();
    let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
    let remaining = validity.not_after.timestamp() - Utc::now().timestamp();
    if remaining < lifetime / 5 {
        tracing::warn!(
            cluster,
            days_remaining = remaining / 86_400,
            not_after = %validity.not_after,
            "CA certificate is in the last 20% of its lifetime"
        );
    }
}

fn format_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
