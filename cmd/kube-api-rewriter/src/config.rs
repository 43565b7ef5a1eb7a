//! Environment configuration.
//!
//! Read once at startup. An empty variable counts as unset.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogConfig;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const DEFAULT_CLIENT_ADDRESS: &str = "127.0.0.1";
const DEFAULT_CLIENT_PORT: u16 = 23915;
const DEFAULT_WEBHOOK_ADDRESS: &str = "0.0.0.0";
const DEFAULT_WEBHOOK_PORT: u16 = 24192;
const DEFAULT_MONITORING_ADDRESS: &str = ":9090";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Client proxy, unless disabled
    pub client: Option<ClientProxyConfig>,
    /// Webhook proxy, when a backend is configured
    pub webhook: Option<WebhookProxyConfig>,
    /// External rule file; the bundled rules otherwise
    pub rules_path: Option<PathBuf>,
    /// Logging
    pub logging: LogConfig,
    /// `/healthz`, `/readyz` and `/metrics`
    pub monitoring_address: SocketAddr,
    /// `/debug/runtime`, off unless set
    pub pprof_address: Option<SocketAddr>,
    /// Forwarding timeout for non-watch requests
    pub request_timeout: Duration,
}

/// Client proxy: original-schema clients to the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProxyConfig {
    /// Listener
    pub listen: SocketAddr,
    /// API server base URL
    pub api_url: String,
    /// Service account token
    pub token_file: Option<PathBuf>,
    /// Cluster CA bundle
    pub ca_file: Option<PathBuf>,
}

/// Webhook proxy: the API server to original-schema webhooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookProxyConfig {
    /// Listener
    pub listen: SocketAddr,
    /// Webhook backend base URL
    pub target_url: String,
    /// Listener certificate and key; plain HTTP when unset
    pub tls: Option<TlsFiles>,
    /// Accept any certificate from the backend
    pub insecure_skip_verify: bool,
}

/// Certificate and key file pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let client = if env.get("CLIENT_PROXY").as_deref() == Some("no") {
            None
        } else {
            Some(ClientProxyConfig::from_env(&env)?)
        };
        let webhook = if env.get("WEBHOOK_PROXY").as_deref() == Some("no") {
            None
        } else {
            WebhookProxyConfig::from_env(&env)?
        };

        let mut logging = LogConfig::default();
        if let Some(level) = env.get("LOG_LEVEL") {
            logging.level = level;
        }
        if let Some(format) = env.get("LOG_FORMAT") {
            logging.format = format
                .parse()
                .map_err(|e: String| ConfigError::invalid("LOG_FORMAT", &format, e))?;
        }
        if let Some(output) = env.get("LOG_OUTPUT") {
            logging.output = output
                .parse()
                .map_err(|e: String| ConfigError::invalid("LOG_OUTPUT", &output, e))?;
        }

        let monitoring = env.get("MONITORING_BIND_ADDRESS");
        let monitoring_address = bind_address(
            "MONITORING_BIND_ADDRESS",
            monitoring.as_deref().unwrap_or(DEFAULT_MONITORING_ADDRESS),
        )?;
        let pprof_address = env
            .get("PPROF_BIND_ADDRESS")
            .map(|value| bind_address("PPROF_BIND_ADDRESS", &value))
            .transpose()?;

        let request_timeout = match env.get("PROXY_REQUEST_TIMEOUT") {
            Some(value) => Duration::from_secs(
                value
                    .parse()
                    .map_err(|e| ConfigError::invalid("PROXY_REQUEST_TIMEOUT", &value, e))?,
            ),
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        Ok(Self {
            client,
            webhook,
            rules_path: env.get("RULES_PATH").map(PathBuf::from),
            logging,
            monitoring_address,
            pprof_address,
            request_timeout,
        })
    }
}

impl ClientProxyConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let listen = listen_address(env, "CLIENT_PROXY_ADDRESS", "CLIENT_PROXY_PORT", DEFAULT_CLIENT_ADDRESS, DEFAULT_CLIENT_PORT)?;

        let api_url = match env.get("KUBERNETES_API_URL") {
            Some(url) => url,
            None => {
                let host = env
                    .get("KUBERNETES_SERVICE_HOST")
                    .ok_or(ConfigError::Missing("KUBERNETES_SERVICE_HOST"))?;
                let port = env
                    .get("KUBERNETES_SERVICE_PORT")
                    .ok_or(ConfigError::Missing("KUBERNETES_SERVICE_PORT"))?;
                if host.contains(':') {
                    format!("https://[{host}]:{port}")
                } else {
                    format!("https://{host}:{port}")
                }
            }
        };

        Ok(Self {
            listen,
            api_url,
            token_file: credential_file(env, "KUBERNETES_TOKEN_FILE", "token"),
            ca_file: credential_file(env, "KUBERNETES_CA_FILE", "ca.crt"),
        })
    }
}

impl WebhookProxyConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Option<Self>, ConfigError> {
        let Some(target_url) = env.get("WEBHOOK_ADDRESS") else {
            return Ok(None);
        };
        let listen = listen_address(
            env,
            "WEBHOOK_PROXY_ADDRESS",
            "WEBHOOK_PROXY_PORT",
            DEFAULT_WEBHOOK_ADDRESS,
            DEFAULT_WEBHOOK_PORT,
        )?;

        let tls = match (env.get("WEBHOOK_CERT_FILE"), env.get("WEBHOOK_KEY_FILE")) {
            (Some(cert_file), Some(key_file)) => Some(TlsFiles {
                cert_file: cert_file.into(),
                key_file: key_file.into(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("WEBHOOK_KEY_FILE")),
            (None, Some(_)) => return Err(ConfigError::Missing("WEBHOOK_CERT_FILE")),
        };

        let insecure_skip_verify = match env.get("WEBHOOK_INSECURE_SKIP_VERIFY") {
            Some(value) => parse_bool("WEBHOOK_INSECURE_SKIP_VERIFY", &value)?,
            None => true,
        };

        Ok(Some(Self {
            listen,
            target_url,
            tls,
            insecure_skip_verify,
        }))
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.is_empty())
    }
}

fn listen_address<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
    address_var: &'static str,
    port_var: &'static str,
    default_address: &str,
    default_port: u16,
) -> Result<SocketAddr, ConfigError> {
    let address = env.get(address_var);
    let address = address.as_deref().unwrap_or(default_address);
    let ip: IpAddr = address
        .parse()
        .map_err(|e| ConfigError::invalid(address_var, address, e))?;
    let port = match env.get(port_var) {
        Some(port) => port.parse().map_err(|e| ConfigError::invalid(port_var, &port, e))?,
        None => default_port,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Parses `host:port`, where an empty host (`:9090`) means all interfaces.
fn bind_address(name: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    full.parse().map_err(|e| ConfigError::invalid(name, value, e))
}

/// Explicit path, or the service account file when it exists.
fn credential_file<F: Fn(&str) -> Option<String>>(env: &Env<F>, name: &str, default_file: &str) -> Option<PathBuf> {
    env.get(name).map(PathBuf::from).or_else(|| {
        let path = Path::new(SERVICE_ACCOUNT_DIR).join(default_file);
        path.exists().then_some(path)
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(name, value, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogOutput};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("KUBERNETES_SERVICE_HOST", "10.96.0.1"), ("KUBERNETES_SERVICE_PORT", "443")]).unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.listen, "127.0.0.1:23915".parse().unwrap());
        assert_eq!(client.api_url, "https://10.96.0.1:443");
        assert_eq!(config.webhook, None);
        assert_eq!(config.rules_path, None);
        assert_eq!(config.logging, LogConfig::default());
        assert_eq!(config.monitoring_address, "0.0.0.0:9090".parse().unwrap());
        assert_eq!(config.pprof_address, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_client_proxy_needs_api_server() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("KUBERNETES_SERVICE_HOST"))));

        let config = config(&[("CLIENT_PROXY", "no"), ("WEBHOOK_ADDRESS", "https://127.0.0.1:9443")]).unwrap();
        assert_eq!(config.client, None);
        assert!(config.webhook.is_some());
    }

    #[test]
    fn test_ipv6_service_host() {
        let config = config(&[("KUBERNETES_SERVICE_HOST", "fd00::1"), ("KUBERNETES_SERVICE_PORT", "6443")]).unwrap();
        assert_eq!(config.client.unwrap().api_url, "https://[fd00::1]:6443");
    }

    #[test]
    fn test_webhook_proxy() {
        let config = config(&[
            ("CLIENT_PROXY", "no"),
            ("WEBHOOK_ADDRESS", "https://127.0.0.1:9443"),
            ("WEBHOOK_PROXY_PORT", "8443"),
            ("WEBHOOK_CERT_FILE", "/tls/tls.crt"),
            ("WEBHOOK_KEY_FILE", "/tls/tls.key"),
            ("WEBHOOK_INSECURE_SKIP_VERIFY", "false"),
        ])
        .unwrap();

        assert_eq!(
            config.webhook.unwrap(),
            WebhookProxyConfig {
                listen: "0.0.0.0:8443".parse().unwrap(),
                target_url: "https://127.0.0.1:9443".to_string(),
                tls: Some(TlsFiles {
                    cert_file: "/tls/tls.crt".into(),
                    key_file: "/tls/tls.key".into(),
                }),
                insecure_skip_verify: false,
            }
        );
    }

    #[test]
    fn test_webhook_tls_needs_both_files() {
        let result = config(&[
            ("CLIENT_PROXY", "no"),
            ("WEBHOOK_ADDRESS", "https://127.0.0.1:9443"),
            ("WEBHOOK_CERT_FILE", "/tls/tls.crt"),
        ]);
        assert!(matches!(result, Err(ConfigError::Missing("WEBHOOK_KEY_FILE"))));
    }

    #[test]
    fn test_webhook_proxy_disabled() {
        let config = config(&[
            ("CLIENT_PROXY", "no"),
            ("WEBHOOK_PROXY", "no"),
            ("WEBHOOK_ADDRESS", "https://127.0.0.1:9443"),
        ])
        .unwrap();
        assert_eq!(config.webhook, None);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = config(&[("CLIENT_PROXY", "no"), ("WEBHOOK_ADDRESS", ""), ("LOG_LEVEL", "")]).unwrap();
        assert_eq!(config.webhook, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_logging_and_monitoring() {
        let config = config(&[
            ("CLIENT_PROXY", "no"),
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "json"),
            ("LOG_OUTPUT", "stdout"),
            ("MONITORING_BIND_ADDRESS", "127.0.0.1:8080"),
            ("PPROF_BIND_ADDRESS", ":6060"),
            ("PROXY_REQUEST_TIMEOUT", "5"),
            ("RULES_PATH", "/etc/rewriter/rules.yaml"),
        ])
        .unwrap();

        assert_eq!(
            config.logging,
            LogConfig {
                level: "debug".to_string(),
                format: LogFormat::Json,
                output: LogOutput::Stdout,
            }
        );
        assert_eq!(config.monitoring_address, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.pprof_address, Some("0.0.0.0:6060".parse().unwrap()));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.rules_path, Some(PathBuf::from("/etc/rewriter/rules.yaml")));
    }

    #[rstest]
    #[case("CLIENT_PROXY_PORT", "http")]
    #[case("CLIENT_PROXY_ADDRESS", "localhost")]
    #[case("LOG_FORMAT", "xml")]
    #[case("MONITORING_BIND_ADDRESS", "9090")]
    #[case("PROXY_REQUEST_TIMEOUT", "30s")]
    fn test_invalid_values(#[case] name: &str, #[case] value: &str) {
        let result = config(&[
            ("KUBERNETES_API_URL", "https://10.96.0.1"),
            (name, value),
        ]);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }
}
