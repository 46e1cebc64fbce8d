//! Service configuration.
//!
//! # Purpose
//! Loads listener settings from the environment and the cluster topology from
//! a YAML file, and owns the authorized-caller whitelist matcher.
//!
//! # Notes
//! Clusters are kept in a `BTreeMap`, so anything that iterates them (cluster
//! detection, caller authentication) sees a stable name order. Two clusters
//! sharing a trust root is a configuration error the service does not detect;
//! the first verifier that accepts a token wins.
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(168 * 60 * 60);
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(48 * 60 * 60);

/// Process-level settings sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the TokenReview API.
    pub bind_addr: SocketAddr,
    /// Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    /// Path to the cluster topology YAML file.
    pub cluster_config: PathBuf,
    /// Namespace holding the credentials Secret.
    pub secret_namespace: String,
    /// Name of the credentials Secret.
    pub secret_name: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("AUTHD_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse AUTHD_BIND")?;
        let metrics_bind = std::env::var("AUTHD_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse AUTHD_METRICS_BIND")?;
        let cluster_config = std::env::var("AUTHD_CONFIG")
            .unwrap_or_else(|_| "config/clusters.yaml".to_string())
            .into();
        let secret_namespace =
            std::env::var("AUTHD_NAMESPACE").unwrap_or_else(|_| "kubefed-auth".to_string());
        let secret_name =
            std::env::var("AUTHD_SECRET_NAME").unwrap_or_else(|_| "kubefed-auth".to_string());
        Ok(Self {
            bind_addr,
            metrics_bind,
            cluster_config,
            secret_namespace,
            secret_name,
        })
    }
}

/// One Kubernetes cluster whose tokens this service validates.
///
/// A cluster is remote iff `api_server` is set; remote clusters use it both
/// as the OIDC discovery root and as the TokenReview forwarding target, while
/// token signatures are always pinned to `issuer`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub issuer: String,
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn is_remote(&self) -> bool {
        self.api_server.is_some()
    }

    /// Root URL for OIDC discovery: the API server when set, else the issuer.
    pub fn discovery_url(&self) -> &str {
        self.api_server.as_deref().unwrap_or(&self.issuer)
    }
}

/// Token renewal knobs shared by every renewal loop.
///
/// Unset values fall back to 1h / 168h / 48h.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenewalSettings {
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub token_duration: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub renew_before: Option<Duration>,
}

impl RenewalSettings {
    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_RENEWAL_INTERVAL)
    }

    pub fn token_duration(&self) -> Duration {
        self.token_duration.unwrap_or(DEFAULT_TOKEN_DURATION)
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before.unwrap_or(DEFAULT_RENEW_BEFORE)
    }
}

/// The frozen cluster topology loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub authorized_clients: Vec<String>,
    #[serde(default)]
    pub renewal: RenewalSettings,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl AuthConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&contents).with_context(|| "parse cluster config yaml")?;
        if config.clusters.is_empty() {
            bail!("no clusters configured");
        }
        for (name, cluster) in &config.clusters {
            if cluster.issuer.is_empty() {
                bail!("cluster {name:?}: issuer is required");
            }
        }
        Ok(config)
    }

    /// Checks a caller identity against the `authorized_clients` whitelist.
    ///
    /// Entries have the form `cluster/namespace/serviceaccount` where each
    /// segment is a literal or `*`. Entries with fewer than three segments are
    /// ignored. An empty whitelist denies everyone.
    pub fn is_authorized_client(
        &self,
        cluster: &str,
        namespace: &str,
        service_account: &str,
    ) -> bool {
        self.authorized_clients.iter().any(|entry| {
            let mut parts = entry.splitn(3, '/');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(c), Some(n), Some(s)) => {
                    match_segment(c, cluster)
                        && match_segment(n, namespace)
                        && match_segment(s, service_account)
                }
                _ => false,
            }
        })
    }

    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.keys().map(String::as_str).collect()
    }

    pub fn remote_clusters(&self) -> Vec<(&str, &ClusterConfig)> {
        self.clusters
            .iter()
            .filter(|(_, cluster)| cluster.is_remote())
            .map(|(name, cluster)| (name.as_str(), cluster))
            .collect()
    }
}

fn match_segment(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// Parses Go-style duration strings such as `"1h"`, `"30m"`, or `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        digits.clear();
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(format!("unknown duration unit {ch:?} in {input:?}")),
        };
        total += Duration::from_secs(value.saturating_mul(unit));
    }
    if !digits.is_empty() {
        return Err(format!("duration {input:?} is missing a unit"));
    }
    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(text) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn clear_authd_env() {
        for (key, _) in env::vars() {
            if key.starts_with("AUTHD_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn server_config_uses_defaults() {
        clear_authd_env();
        let config = ServerConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:9090");
        assert_eq!(config.secret_namespace, "kubefed-auth");
    }

    #[serial]
    #[test]
    fn server_config_respects_env() {
        clear_authd_env();
        unsafe {
            env::set_var("AUTHD_BIND", "127.0.0.1:9443");
            env::set_var("AUTHD_NAMESPACE", "auth-system");
        }
        let config = ServerConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9443");
        assert_eq!(config.secret_namespace, "auth-system");
        clear_authd_env();
    }

    #[serial]
    #[test]
    fn server_config_rejects_invalid_bind() {
        clear_authd_env();
        unsafe {
            env::set_var("AUTHD_BIND", "not-a-socket");
        }
        assert!(ServerConfig::from_env().is_err());
        clear_authd_env();
    }

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("48h").unwrap(), Duration::from_secs(48 * 3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn load_parses_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
authorized_clients:
  - cluster-a/default/allowed-app
renewal:
  interval: 1h
  token_duration: 168h
  renew_before: 48h
clusters:
  cluster-a:
    issuer: https://a.example.com
  cluster-b:
    issuer: https://kubernetes.default.svc.cluster.local
    api_server: https://10.0.0.1:6443
    ca_cert: /etc/bootstrap/ca.crt
    token_path: /etc/bootstrap/token
"#
        )
        .unwrap();

        let config = AuthConfig::load(file.path()).expect("load");
        assert_eq!(config.clusters.len(), 2);
        assert_eq!(config.renewal.interval(), Duration::from_secs(3600));
        assert_eq!(
            config.renewal.token_duration(),
            Duration::from_secs(168 * 3600)
        );

        let a = &config.clusters["cluster-a"];
        assert!(!a.is_remote());
        assert_eq!(a.discovery_url(), "https://a.example.com");

        let b = &config.clusters["cluster-b"];
        assert!(b.is_remote());
        assert_eq!(b.discovery_url(), "https://10.0.0.1:6443");

        assert_eq!(config.remote_clusters().len(), 1);
        assert_eq!(config.remote_clusters()[0].0, "cluster-b");
    }

    #[test]
    fn load_rejects_empty_clusters() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "clusters: {{}}").unwrap();
        assert!(AuthConfig::load(file.path()).is_err());
    }

    #[test]
    fn load_rejects_missing_issuer() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
clusters:
  cluster-a:
    issuer: ""
"#
        )
        .unwrap();
        assert!(AuthConfig::load(file.path()).is_err());
    }

    #[test]
    fn renewal_defaults_apply_when_unset() {
        let settings = RenewalSettings::default();
        assert_eq!(settings.interval(), DEFAULT_RENEWAL_INTERVAL);
        assert_eq!(settings.token_duration(), DEFAULT_TOKEN_DURATION);
        assert_eq!(settings.renew_before(), DEFAULT_RENEW_BEFORE);
    }

    #[test]
    fn whitelist_matches_literals_and_wildcards() {
        // Every segment is independently a literal or `*`; a triple matches
        // iff each segment matches.
        let identity = ("cluster-a", "default", "allowed-app");
        for cluster_pat in ["cluster-a", "*"] {
            for ns_pat in ["default", "*"] {
                for sa_pat in ["allowed-app", "*"] {
                    let config = AuthConfig {
                        authorized_clients: vec![format!("{cluster_pat}/{ns_pat}/{sa_pat}")],
                        ..Default::default()
                    };
                    assert!(
                        config.is_authorized_client(identity.0, identity.1, identity.2),
                        "pattern {cluster_pat}/{ns_pat}/{sa_pat} should match"
                    );
                }
            }
        }

        let config = AuthConfig {
            authorized_clients: vec!["cluster-a/default/allowed-app".to_string()],
            ..Default::default()
        };
        assert!(!config.is_authorized_client("cluster-a", "default", "other-app"));
        assert!(!config.is_authorized_client("cluster-b", "default", "allowed-app"));
        assert!(!config.is_authorized_client("cluster-a", "kube-system", "allowed-app"));
    }

    #[test]
    fn whitelist_ignores_malformed_entries() {
        let config = AuthConfig {
            authorized_clients: vec!["cluster-a/default".to_string(), "".to_string()],
            ..Default::default()
        };
        assert!(!config.is_authorized_client("cluster-a", "default", "anything"));
    }

    #[test]
    fn empty_whitelist_denies_all() {
        let config = AuthConfig::default();
        assert!(!config.is_authorized_client("cluster-a", "default", "app"));
    }
}
