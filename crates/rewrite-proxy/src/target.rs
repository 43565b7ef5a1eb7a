//! Forwarding targets.
//!
//! A target is a base URL plus the HTTP client used to reach it. The API
//! server target trusts the cluster CA and authenticates with the service
//! account token when the caller sent no credentials of its own. The webhook
//! target usually serves a self-signed certificate, so verification can be
//! switched off.

use std::path::{Path, PathBuf};

use tracing::warn;
use url::Url;

use crate::error::ProxyError;

/// Where a proxy forwards requests.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    base: Url,
    token_file: Option<PathBuf>,
    client: reqwest::Client,
}

impl ProxyTarget {
    /// Target reached with a plain client.
    pub fn new(base: &str) -> Result<Self, ProxyError> {
        Self::with_client(base, builder().build()?)
    }

    /// The Kubernetes API server, trusting `ca_file` and authenticating with
    /// the token in `token_file`.
    pub fn kubernetes(base: &str, token_file: Option<PathBuf>, ca_file: Option<&Path>) -> Result<Self, ProxyError> {
        let mut builder = builder();
        if let Some(ca_file) = ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| ProxyError::Config(format!("reading CA file {}: {e}", ca_file.display())))?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        let mut target = Self::with_client(base, builder.build()?)?;
        target.token_file = token_file;
        Ok(target)
    }

    /// An admission webhook backend.
    pub fn webhook(base: &str, insecure_skip_verify: bool) -> Result<Self, ProxyError> {
        let client = builder().danger_accept_invalid_certs(insecure_skip_verify).build()?;
        Self::with_client(base, client)
    }

    /// Target reached with a caller-built client.
    pub fn with_client(base: &str, client: reqwest::Client) -> Result<Self, ProxyError> {
        let base = Url::parse(base).map_err(|e| ProxyError::Config(format!("invalid target URL '{base}': {e}")))?;
        Ok(Self {
            base,
            token_file: None,
            client,
        })
    }

    /// Base URL.
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// HTTP client.
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Full URL for a request path and query.
    #[must_use]
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base.as_str().trim_end_matches('/'))
    }

    /// Bearer token, read on every call so rotated tokens are picked up.
    pub async fn bearer_token(&self) -> Option<String> {
        let path = self.token_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Some(token.trim().to_string()).filter(|token| !token.is_empty()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read token file");
                None
            }
        }
    }
}

fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
}
