//! Shared helpers for integration tests: RS256 key material, token minting,
//! and a stub cluster serving OIDC discovery, JWKS, TokenReview, and
//! TokenRequest endpoints.
#![allow(dead_code)]

use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;

pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// An RS256 signing key plus its public JWKS document.
pub struct SigningKey {
    pub private_pem: String,
    pub jwks: Value,
    pub kid: String,
}

pub fn signing_key(kid: &str) -> SigningKey {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("key");
    let public_key = RsaPublicKey::from(&key);
    let jwks = json!({
        "keys": [{
            "kty": "RSA",
            "kid": kid,
            "alg": "RS256",
            "use": "sig",
            "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }]
    });
    SigningKey {
        private_pem: key
            .to_pkcs1_pem(Default::default())
            .expect("pem")
            .to_string(),
        jwks,
        kid: kid.to_string(),
    }
}

/// Mints an RS256 ServiceAccount-shaped token signed by `key`.
pub fn mint_token(
    key: &SigningKey,
    issuer: &str,
    namespace: &str,
    service_account: &str,
    exp_offset_secs: i64,
) -> String {
    let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(key.kid.clone());
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
        "iss": issuer,
        "sub": format!("system:serviceaccount:{namespace}:{service_account}"),
        "aud": ["https://kubernetes.default.svc"],
        "iat": now,
        "exp": now + exp_offset_secs,
        "kubernetes.io": {
            "namespace": namespace,
            "serviceaccount": {"name": service_account},
        },
    });
    jsonwebtoken::encode(
        &header,
        &claims,
        &jsonwebtoken::EncodingKey::from_rsa_pem(key.private_pem.as_bytes()).expect("key"),
    )
    .expect("token")
}

/// A structurally valid but unsigned JWT, for exercising paths that only
/// inspect the payload.
pub fn unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.sig")
}

pub struct ClusterStub {
    pub addr: SocketAddr,
    pub base_url: String,
    /// TokenReview forwarding hits, to assert detection never forwards.
    pub review_hits: Arc<AtomicUsize>,
    /// TokenRequest hits.
    pub mint_hits: Arc<AtomicUsize>,
}

/// Spawns a stub cluster API server.
///
/// Discovery advertises `jwks_uri` under `advertised_issuer` (defaulting to
/// the stub's own address), which lets tests exercise the JWKS URL rewrite:
/// a remote cluster config pointing `api_server` at this stub will rewrite
/// the unreachable advertised host back to the stub.
pub async fn spawn_cluster_stub(
    jwks: Value,
    advertised_issuer: Option<&str>,
    review_response: Value,
    minted_token: &str,
) -> ClusterStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let base_url = format!("http://{addr}");
    let issuer = advertised_issuer
        .map(str::to_string)
        .unwrap_or_else(|| base_url.clone());

    let discovery = json!({
        "issuer": issuer,
        "jwks_uri": format!("{issuer}/openid/v1/jwks"),
    });
    let review_hits = Arc::new(AtomicUsize::new(0));
    let mint_hits = Arc::new(AtomicUsize::new(0));
    let token_response = json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenRequest",
        "metadata": {},
        "spec": {"audiences": [], "expirationSeconds": 604800},
        "status": {
            "token": minted_token,
            "expirationTimestamp": (chrono::Utc::now() + chrono::Duration::hours(168)).to_rfc3339(),
        },
    });

    let app = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get({
                let discovery = discovery.clone();
                move || {
                    let discovery = discovery.clone();
                    async move { Json(discovery) }
                }
            }),
        )
        .route(
            "/openid/v1/jwks",
            get({
                let jwks = jwks.clone();
                move || {
                    let jwks = jwks.clone();
                    async move { Json(jwks) }
                }
            }),
        )
        .route(
            "/apis/authentication.k8s.io/v1/tokenreviews",
            post({
                let review_response = review_response.clone();
                let review_hits = review_hits.clone();
                move || {
                    let review_response = review_response.clone();
                    review_hits.fetch_add(1, Ordering::SeqCst);
                    async move { Json(review_response) }
                }
            }),
        )
        .route(
            "/api/v1/namespaces/:namespace/serviceaccounts/:name/token",
            post({
                let token_response = token_response.clone();
                let mint_hits = mint_hits.clone();
                move |Path((_namespace, _name)): Path<(String, String)>| {
                    let token_response = token_response.clone();
                    mint_hits.fetch_add(1, Ordering::SeqCst);
                    async move { Json(token_response) }
                }
            }),
        );

    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });

    ClusterStub {
        addr,
        base_url,
        review_hits,
        mint_hits,
    }
}

/// A TokenReview response body as a remote API server would return it.
pub fn authenticated_review(username: &str) -> Value {
    json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenReview",
        "metadata": {},
        "spec": {},
        "status": {
            "authenticated": true,
            "user": {
                "username": username,
                "uid": "0e79c2ec-32eb-4a46-ab9b-f075fbbfbd43",
                "groups": ["system:serviceaccounts", "system:authenticated"],
            },
        },
    })
}
