//! Process-level error types.

use std::net::SocketAddr;

use api_rewriter::RulesError;
use rewrite_proxy::{CertError, ProxyError};
use thiserror::Error;

/// Errors in the environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is required but unset
    #[error("{0} is required")]
    Missing(&'static str),

    /// A variable has an unusable value
    #[error("invalid {name}='{value}': {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Value as found in the environment
        value: String,
        /// What is wrong with it
        reason: String,
    },

    /// Logging could not be initialized
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that stop the process.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Environment configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule file or bundled rules
    #[error("Rules error: {0}")]
    Rules(#[from] RulesError),

    /// Proxy setup
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Listener TLS material
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    /// Neither proxy is enabled
    #[error("no proxy to start, check CLIENT_PROXY and WEBHOOK_ADDRESS")]
    NoProxy,

    /// A listener could not be bound
    #[error("{server}: cannot listen on {addr}")]
    Bind {
        /// Server name
        server: &'static str,
        /// Listen address
        addr: SocketAddr,
    },

    /// One or more servers stopped with an error
    #[error("servers failed: {}", .0.join("; "))]
    Servers(Vec<String>),
}
