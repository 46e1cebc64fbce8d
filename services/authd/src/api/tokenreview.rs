//! The TokenReview endpoint.
//!
//! # Purpose
//! Accepts a standard TokenReview, authenticates the caller when a whitelist
//! is configured, detects which configured cluster issued the token by trying
//! each cached verifier locally, forwards the review to that cluster's API
//! server, and annotates the response with the detected cluster name.
//!
//! # Key invariants
//! - Detection never sends the token anywhere; only the detected cluster's
//!   own API server ever sees it.
//! - Every response body is a valid TokenReview object.
//! - Only parse errors and caller rejections change the HTTP status; all
//!   validation outcomes are 200s with structured status.
use crate::api::error::{self, ReviewRejection};
use crate::app::AppState;
use crate::credentials::ca_bundle_der;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::authentication::v1::TokenReview;
use kube::api::{Api, PostParams};
use thiserror::Error;

/// Key added to `status.user.extra` naming the cluster that validated the
/// token.
pub const EXTRA_CLUSTER_NAME_KEY: &str = "authentication.kubernetes.io/cluster-name";

#[derive(Debug, Error)]
enum ForwardError {
    #[error("cluster not found: {0}")]
    UnknownCluster(String),
    #[error("invalid API server url {0}")]
    InvalidApiServer(String),
    #[error("creating kubernetes client: {0}")]
    Client(kube::Error),
    #[error("calling TokenReview API: {0}")]
    Request(kube::Error),
}

pub async fn review_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.config.authorized_clients.is_empty() {
        if let Err(rejection) = authenticate_caller(&state, &headers).await {
            return rejection.into_response();
        }
    }

    // Decoded by hand so malformed bodies still get a TokenReview envelope
    // instead of the framework's plain-text 400.
    let review: TokenReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(_) => return error::bad_request("invalid request body").into_response(),
    };
    let Some(token) = review.spec.token.clone().filter(|token| !token.is_empty()) else {
        return error::bad_request("token is required").into_response();
    };

    if state.config.clusters.is_empty() {
        return error::unauthenticated("server not configured");
    }

    let Some(cluster) = detect_cluster(&state, &token).await else {
        metrics::counter!("authd_detection_misses_total").increment(1);
        return error::unauthenticated("token signature does not match any configured cluster");
    };
    tracing::info!(cluster, "detected issuing cluster");
    metrics::counter!("authd_detections_total", "cluster" => cluster.clone()).increment(1);

    match forward_token_review(&state, &cluster, &review).await {
        Ok(mut result) => {
            annotate_cluster(&mut result, &cluster);
            Json(result).into_response()
        }
        Err(err) => {
            tracing::warn!(cluster, error = %err, "token review forwarding failed");
            metrics::counter!("authd_forwarding_failures_total", "cluster" => cluster.clone())
                .increment(1);
            error::unauthenticated(&format!("failed to validate token: {err}"))
        }
    }
}

/// Verifies the caller's own ServiceAccount token from the Authorization
/// header and checks it against the whitelist.
async fn authenticate_caller(state: &AppState, headers: &HeaderMap) -> Result<(), ReviewRejection> {
    let Some(header) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) else {
        return Err(error::unauthorized("Authorization header required"));
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(error::unauthorized(
            "Authorization header must use Bearer scheme",
        ));
    };
    if token.is_empty() {
        return Err(error::unauthorized("bearer token is empty"));
    }

    let mut verified = None;
    for name in state.config.clusters.keys() {
        match state.verifier.verify(name, token).await {
            Ok(claims) => {
                verified = Some(claims);
                break;
            }
            Err(err) => {
                tracing::debug!(cluster = %name, error = %err, "caller token rejected by cluster");
            }
        }
    }
    let Some(claims) = verified else {
        return Err(error::unauthorized(
            "caller token not valid for any configured cluster",
        ));
    };

    let Some((namespace, service_account)) = claims.identity() else {
        return Err(error::unauthorized("caller token missing identity claims"));
    };

    if !state
        .config
        .is_authorized_client(&claims.cluster, &namespace, &service_account)
    {
        tracing::warn!(
            cluster = %claims.cluster,
            namespace,
            service_account,
            "rejected unauthorized caller"
        );
        return Err(error::forbidden(&format!(
            "caller {}/{}/{} is not authorized",
            claims.cluster, namespace, service_account
        )));
    }

    tracing::debug!(
        cluster = %claims.cluster,
        namespace,
        service_account,
        "authorized caller"
    );
    Ok(())
}

/// Tries the token against every configured cluster's verifier. Purely local:
/// detection only reads JWKS material that is already cached or publicly
/// fetchable, and per-cluster failures are expected.
async fn detect_cluster(state: &AppState, token: &str) -> Option<String> {
    for name in state.config.clusters.keys() {
        match state.verifier.verify(name, token).await {
            Ok(_) => return Some(name.clone()),
            Err(err) => {
                tracing::debug!(cluster = %name, error = %err, "token not valid for cluster");
            }
        }
    }
    None
}

async fn forward_token_review(
    state: &AppState,
    cluster: &str,
    review: &TokenReview,
) -> Result<TokenReview, ForwardError> {
    let config = state
        .config
        .clusters
        .get(cluster)
        .ok_or_else(|| ForwardError::UnknownCluster(cluster.to_string()))?;

    let client = build_cluster_client(state, cluster, config).await?;
    let outbound = TokenReview {
        metadata: Default::default(),
        spec: review.spec.clone(),
        status: None,
    };
    let api: Api<TokenReview> = Api::all(client);
    api.create(&PostParams::default(), &outbound)
        .await
        .map_err(ForwardError::Request)
}

async fn build_cluster_client(
    state: &AppState,
    cluster: &str,
    config: &crate::config::ClusterConfig,
) -> Result<kube::Client, ForwardError> {
    if let Some(api_server) = &config.api_server {
        let cluster_url = api_server
            .parse()
            .map_err(|_| ForwardError::InvalidApiServer(api_server.clone()))?;
        let mut kube_config = kube::Config::new(cluster_url);
        if let Some(credentials) = state.credentials.get(cluster) {
            kube_config.auth_info.token = Some(credentials.token.trim().to_string().into());
            if !credentials.ca_cert.is_empty() {
                kube_config.root_cert = Some(ca_bundle_der(&credentials.ca_cert));
            }
        }
        return kube::Client::try_from(kube_config).map_err(ForwardError::Client);
    }

    // Local cluster: the service is expected to run inside it. The issuer
    // fallback keeps out-of-cluster test setups working.
    match kube::Config::incluster() {
        Ok(kube_config) => kube::Client::try_from(kube_config).map_err(ForwardError::Client),
        Err(_) => {
            tracing::debug!(cluster, "not running in cluster, using issuer as API host");
            let cluster_url = config
                .issuer
                .parse()
                .map_err(|_| ForwardError::InvalidApiServer(config.issuer.clone()))?;
            kube::Client::try_from(kube::Config::new(cluster_url)).map_err(ForwardError::Client)
        }
    }
}

/// Records the detected cluster in `status.user.extra`. Confined to the extra
/// map so schema-strict TokenReview consumers still parse the response.
fn annotate_cluster(review: &mut TokenReview, cluster: &str) {
    let Some(status) = review.status.as_mut() else {
        return;
    };
    if status.authenticated != Some(true) {
        return;
    }
    let user = status.user.get_or_insert_with(Default::default);
    let extra = user.extra.get_or_insert_with(Default::default);
    extra.insert(
        EXTRA_CLUSTER_NAME_KEY.to_string(),
        vec![cluster.to_string()],
    );
}
