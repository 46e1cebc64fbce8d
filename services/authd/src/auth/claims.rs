//! Claims extracted from ServiceAccount tokens.
//!
//! # Purpose
//! Defines the verified claims record produced by the verifier manager plus
//! helpers that inspect a JWT payload without signature verification. The
//! unverified helpers exist for the renewal path, where token expiry and
//! subject are local hints only; nothing security-relevant trusts them.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("token is not a three-part JWT")]
    MalformedToken,
    #[error("decoding JWT payload: {0}")]
    Payload(String),
    #[error("token has no expiration claim")]
    MissingExpiry,
    #[error("unexpected subject format: {0}")]
    Subject(String),
}

/// Claims from a signature-verified ServiceAccount token, tagged with the
/// cluster whose JWKS verified it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub cluster: String,
    #[serde(rename = "iss")]
    pub issuer: String,
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "aud", default, deserialize_with = "deserialize_audience")]
    pub audience: Vec<String>,
    #[serde(rename = "exp")]
    pub expiry: i64,
    #[serde(rename = "iat", default)]
    pub issued_at: Option<i64>,
    #[serde(rename = "nbf", default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
    #[serde(
        rename = "kubernetes.io",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub kubernetes: Option<Value>,
}

impl Claims {
    /// Extracts `(namespace, serviceaccount)` from the `kubernetes.io` claim.
    ///
    /// Returns `None` when either field is absent, which callers treat as an
    /// unidentifiable caller rather than an error.
    pub fn identity(&self) -> Option<(String, String)> {
        let kubernetes = self.kubernetes.as_ref()?;
        let namespace = kubernetes.get("namespace")?.as_str()?;
        let service_account = kubernetes
            .get("serviceaccount")?
            .get("name")?
            .as_str()?;
        Some((namespace.to_string(), service_account.to_string()))
    }
}

// Kubernetes emits `aud` as an array, but single-audience issuers may use a
// bare string.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Audience {
        One(String),
        Many(Vec<String>),
    }

    match Option::<Audience>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(Audience::One(value)) => Ok(vec![value]),
        Some(Audience::Many(values)) => Ok(values),
    }
}

/// Decodes a JWT payload without verifying the signature.
pub fn decode_unverified(token: &str) -> Result<Value, ClaimsError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ClaimsError::MalformedToken);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| ClaimsError::Payload(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| ClaimsError::Payload(err.to_string()))
}

/// Reads the `exp` claim of a token without signature verification.
pub fn token_expiration(token: &str) -> Result<DateTime<Utc>, ClaimsError> {
    let claims = decode_unverified(token)?;
    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or(ClaimsError::MissingExpiry)?;
    Utc.timestamp_opt(exp, 0)
        .single()
        .ok_or(ClaimsError::MissingExpiry)
}

/// Parses `(namespace, name)` out of a `system:serviceaccount:<ns>:<name>`
/// subject, read from the token without signature verification.
pub fn service_account_subject(token: &str) -> Result<(String, String), ClaimsError> {
    let claims = decode_unverified(token)?;
    let subject = claims
        .get("sub")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let parts: Vec<&str> = subject.split(':').collect();
    match parts.as_slice() {
        ["system", "serviceaccount", namespace, name] => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(ClaimsError::Subject(subject.to_string())),
    }
}
