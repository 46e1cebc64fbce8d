//! HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! This module centralizes route composition to keep `main` small and
//! testable; integration tests drive the real router through `tower`.
use crate::api;
use crate::auth::verifier::TokenVerifier;
use crate::config::AuthConfig;
use crate::credentials::store::CredentialStore;
use crate::observability;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub credentials: Arc<CredentialStore>,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route("/health", get(api::system::health))
        .route("/clusters", get(api::system::list_clusters))
        .route(
            "/apis/authentication.k8s.io/v1/tokenreviews",
            post(api::tokenreview::review_token),
        )
        .layer(trace_layer)
        .with_state(state)
}
