//! Per-cluster OIDC verifier cache.
//!
//! # Purpose
//! Lazily builds one verifier per configured cluster from its OIDC discovery
//! document and JWKS, validates ServiceAccount token signatures against it,
//! and supports point-in-time invalidation when credentials rotate.
//!
//! # Key invariants
//! - For remote clusters, discovery is fetched from `api_server` but the
//!   verifier pins the `issuer` from config; the two frequently differ because
//!   a cluster's self-advertised issuer is an internal DNS name.
//! - At most one verifier is constructed per cluster between invalidations;
//!   concurrent construction for different clusters is unrestricted.
//! - Invalidation removes the cached entry; in-flight verifications finish
//!   against the old key set, new callers rebuild.
use crate::auth::claims::Claims;
use crate::config::{AuthConfig, ClusterConfig};
use crate::credentials::store::CredentialStore;
use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::OnceCell;

const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

// Kubernetes API servers publish their JWKS at this fixed path; discovery
// documents advertise it under the in-cluster issuer hostname.
const KUBERNETES_JWKS_PATH: &str = "/openid/v1/jwks";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("cluster not found: {0}")]
    UnknownCluster(String),
    #[error("reading credentials: {0}")]
    Credentials(String),
    #[error("building HTTP client: {0}")]
    Http(#[source] reqwest::Error),
    #[error("fetching OIDC discovery from {url}: {source}")]
    Discovery {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("discovery at {url} returned status {status}")]
    DiscoveryStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("fetching JWKS from {url}: {source}")]
    JwksFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("no JWKS key matches the token key id")]
    KeyNotFound,
    #[error("token is expired")]
    Expired,
    #[error("verifying token: {0}")]
    Jwt(#[source] jsonwebtoken::errors::Error),
}

/// Signature verification seam between HTTP handlers and the verifier cache.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, cluster: &str, token: &str) -> Result<Claims, VerifyError>;
}

/// Invalidation seam consumed by the credential renewer.
pub trait VerifierInvalidator: Send + Sync {
    fn invalidate(&self, cluster: &str);
}

/// Caches one [`ClusterVerifier`] per cluster.
///
/// Each cluster maps to an async once-cell, so a cold verifier is constructed
/// exactly once no matter how many verifications race for it, and clusters
/// never block each other's construction.
pub struct VerifierManager {
    config: Arc<AuthConfig>,
    credentials: Arc<CredentialStore>,
    verifiers: DashMap<String, Arc<OnceCell<Arc<ClusterVerifier>>>>,
}

impl VerifierManager {
    pub fn new(config: Arc<AuthConfig>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            credentials,
            verifiers: DashMap::new(),
        }
    }

    async fn cluster_verifier(
        &self,
        name: &str,
        cluster: &ClusterConfig,
    ) -> Result<Arc<ClusterVerifier>, VerifyError> {
        let cell = self
            .verifiers
            .entry(name.to_string())
            .or_default()
            .clone();
        let verifier = cell
            .get_or_try_init(|| {
                ClusterVerifier::discover(name, cluster, self.credentials.clone())
            })
            .await?;
        Ok(verifier.clone())
    }
}

#[async_trait]
impl TokenVerifier for VerifierManager {
    async fn verify(&self, cluster: &str, token: &str) -> Result<Claims, VerifyError> {
        let config = self
            .config
            .clusters
            .get(cluster)
            .ok_or_else(|| VerifyError::UnknownCluster(cluster.to_string()))?;
        let verifier = self.cluster_verifier(cluster, config).await?;
        verifier.verify(token).await
    }
}

impl VerifierInvalidator for VerifierManager {
    fn invalidate(&self, cluster: &str) {
        if self.verifiers.remove(cluster).is_some() {
            tracing::debug!(cluster, "invalidated cached verifier");
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[allow(dead_code)]
    issuer: String,
    jwks_uri: String,
}

/// A verifier for one cluster: the pinned issuer plus a remote key set.
struct ClusterVerifier {
    cluster: String,
    issuer: String,
    jwks_url: String,
    http: reqwest::Client,
    bearer: BearerSource,
    keys: RwLock<JwkSet>,
}

impl ClusterVerifier {
    async fn discover(
        name: &str,
        cluster: &ClusterConfig,
        credentials: Arc<CredentialStore>,
    ) -> Result<Arc<Self>, VerifyError> {
        let http = build_http_client(cluster)?;
        let bearer = BearerSource {
            cluster: name.to_string(),
            token_path: cluster.token_path.clone(),
            credentials,
        };

        let discovery_url = format!(
            "{}{WELL_KNOWN_PATH}",
            cluster.discovery_url().trim_end_matches('/')
        );
        let mut request = http.get(&discovery_url);
        if let Some(token) = bearer.token() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| VerifyError::Discovery {
            url: discovery_url.clone(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(VerifyError::DiscoveryStatus {
                url: discovery_url,
                status: response.status(),
            });
        }
        let document: DiscoveryDocument =
            response
                .json()
                .await
                .map_err(|source| VerifyError::Discovery {
                    url: discovery_url,
                    source,
                })?;

        let jwks_url = match &cluster.api_server {
            Some(api_server) => rewrite_jwks_url(&document.jwks_uri, api_server),
            None => document.jwks_uri,
        };
        let keys = fetch_jwks(&http, &bearer, &jwks_url).await?;

        tracing::debug!(
            cluster = name,
            jwks_url,
            key_count = keys.keys.len(),
            "built verifier"
        );

        Ok(Arc::new(Self {
            cluster: name.to_string(),
            issuer: cluster.issuer.clone(),
            jwks_url,
            http,
            bearer,
            keys: RwLock::new(keys),
        }))
    }

    async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let header = decode_header(token).map_err(VerifyError::Jwt)?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let decoding_key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        // Audience membership is the downstream TokenReview's concern.
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Jwt(err),
            }
        })?;

        let mut claims = data.claims;
        claims.cluster = self.cluster.clone();
        Ok(claims)
    }

    // Looks up the decoding key in the cached JWKS, refreshing it once when
    // the key id is unknown so key rotation on the cluster is picked up.
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, VerifyError> {
        let cached = {
            let keys = self.keys.read().expect("jwks lock poisoned");
            find_jwk(&keys, kid).cloned()
        };
        let jwk = match cached {
            Some(jwk) => jwk,
            None => {
                let refreshed = fetch_jwks(&self.http, &self.bearer, &self.jwks_url).await?;
                let jwk = find_jwk(&refreshed, kid)
                    .cloned()
                    .ok_or(VerifyError::KeyNotFound)?;
                *self.keys.write().expect("jwks lock poisoned") = refreshed;
                jwk
            }
        };
        DecodingKey::from_jwk(&jwk).map_err(VerifyError::Jwt)
    }
}

/// Reads the bearer token for discovery/JWKS fetches, preferring renewed
/// credentials from the store over the bootstrap token file. The file is
/// re-read on every fetch so rotation on disk is picked up.
struct BearerSource {
    cluster: String,
    token_path: Option<PathBuf>,
    credentials: Arc<CredentialStore>,
}

impl BearerSource {
    fn token(&self) -> Option<String> {
        if let Some(credentials) = self.credentials.get(&self.cluster) {
            return Some(credentials.token.trim().to_string());
        }
        let path = self.token_path.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(err) => {
                tracing::warn!(
                    cluster = %self.cluster,
                    path = %path.display(),
                    error = %err,
                    "failed to read token file"
                );
                None
            }
        }
    }
}

async fn fetch_jwks(
    http: &reqwest::Client,
    bearer: &BearerSource,
    url: &str,
) -> Result<JwkSet, VerifyError> {
    let mut request = http.get(url);
    if let Some(token) = bearer.token() {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|source| VerifyError::JwksFetch {
            url: url.to_string(),
            source,
        })?;
    response
        .error_for_status()
        .map_err(|source| VerifyError::JwksFetch {
            url: url.to_string(),
            source,
        })?
        .json()
        .await
        .map_err(|source| VerifyError::JwksFetch {
            url: url.to_string(),
            source,
        })
}

fn find_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|key| key.common.key_id.as_deref() == Some(kid)),
        None => jwks.keys.first(),
    }
}

fn build_http_client(cluster: &ClusterConfig) -> Result<reqwest::Client, VerifyError> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = &cluster.ca_cert {
        let pem = std::fs::read(path).map_err(|err| {
            VerifyError::Credentials(format!("reading CA cert {}: {err}", path.display()))
        })?;
        let certificate = reqwest::Certificate::from_pem(&pem).map_err(VerifyError::Http)?;
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().map_err(VerifyError::Http)
}

// The JWKS URL from Kubernetes discovery typically looks like
// https://kubernetes.default.svc.cluster.local/openid/v1/jwks, which is
// unreachable from outside the cluster. Rewrite the host to the API server.
// JWKS published under any other path is left untouched, reachable or not.
fn rewrite_jwks_url(advertised: &str, api_server: &str) -> String {
    if advertised.contains(KUBERNETES_JWKS_PATH) {
        format!(
            "{}{KUBERNETES_JWKS_PATH}",
            api_server.trim_end_matches('/')
        )
    } else {
        advertised.to_string()
    }
}
