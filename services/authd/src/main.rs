// Federated TokenReview service
// ------------------------------
// A single instance runs in one "home" cluster and answers TokenReview
// requests for ServiceAccount tokens minted by any of the configured
// clusters. Per request: authenticate the caller (when a whitelist is
// configured), detect the issuing cluster by trying each cached OIDC
// verifier locally, forward the TokenReview to that cluster's API server,
// and annotate the response with the cluster name.
//
// Remote clusters are reached with credentials kept fresh by one renewal
// loop per cluster; renewed tokens are persisted to a Kubernetes Secret so
// restarts do not fall back to stale bootstrap files.
use anyhow::Context;
use authd::app::{self, AppState};
use authd::auth::verifier::VerifierManager;
use authd::config::{AuthConfig, ServerConfig};
use authd::credentials::renewer::Renewer;
use authd::credentials::store::CredentialStore;
use authd::observability;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability("authd");

    let server_config = ServerConfig::from_env()?;
    let auth_config = Arc::new(
        AuthConfig::load(&server_config.cluster_config).with_context(|| "load cluster config")?,
    );
    tracing::info!(
        clusters = ?auth_config.cluster_names(),
        authorized_clients = auth_config.authorized_clients.len(),
        "loaded cluster configuration"
    );

    let has_remote = !auth_config.remote_clusters().is_empty();
    let credentials = Arc::new(if has_remote {
        CredentialStore::with_persistence(
            &server_config.secret_namespace,
            &server_config.secret_name,
        )
        .await
    } else {
        CredentialStore::in_memory()
    });

    // Seed bootstrap credentials for clusters the secret did not cover.
    for (name, cluster) in &auth_config.clusters {
        if let (Some(token_path), Some(ca_path)) = (&cluster.token_path, &cluster.ca_cert) {
            if let Err(err) = credentials.load_bootstrap_from_files(name, token_path, ca_path) {
                tracing::warn!(
                    cluster = %name,
                    error = %err,
                    "could not load bootstrap credentials"
                );
            }
        }
    }

    let verifier = Arc::new(VerifierManager::new(
        auth_config.clone(),
        credentials.clone(),
    ));

    let shutdown = CancellationToken::new();
    if has_remote {
        tracing::info!(
            clusters = ?auth_config.remote_clusters().iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "starting credential renewal"
        );
        let renewer = Arc::new(Renewer::new(
            auth_config.clone(),
            credentials.clone(),
            verifier.clone(),
        ));
        renewer.spawn(shutdown.clone());
    }

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        server_config.metrics_bind,
    ));

    let state = AppState {
        config: auth_config,
        verifier,
        credentials,
    };
    let router = app::build_router(state);

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr).await?;
    tracing::info!(addr = %server_config.bind_addr, "token review service listening");
    let signal_shutdown = shutdown.clone();
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            signal_shutdown.cancel();
        })
        .await?;
    shutdown.cancel();
    Ok(())
}
