//! Proxy errors.
//!
//! Request-path errors render as a Kubernetes `Status` object so clients
//! (kubectl, controllers, the API server calling a webhook) surface them the
//! way they surface API server errors.

use api_rewriter::RewriteError;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while proxying one request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request or response body could not be rewritten
    #[error("Rewrite error: {0}")]
    Rewrite(#[from] RewriteError),

    /// Request body could not be read
    #[error("Request body error: {0}")]
    Body(String),

    /// Target unreachable, or the connection failed mid-response
    #[error("Target error: {0}")]
    Target(String),

    /// Target did not answer in time
    #[error("Target timeout: {0}")]
    Timeout(String),

    /// Proxy could not be set up
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Target(err.to_string())
        }
    }
}

impl ProxyError {
    /// HTTP status returned to the client.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Rewrite(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Target(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rewrite(_) => "rewrite",
            Self::Body(_) => "body",
            Self::Target(_) => "target",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Rewrite(_) | Self::Config(_) => "InternalError",
            Self::Body(_) => "BadRequest",
            Self::Target(_) => "ServiceUnavailable",
            Self::Timeout(_) => "Timeout",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status<'a> {
    kind: &'static str,
    api_version: &'static str,
    status: &'static str,
    message: &'a str,
    reason: &'static str,
    code: u16,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let message = self.to_string();
        let body = serde_json::to_vec(&Status {
            kind: "Status",
            api_version: "v1",
            status: "Failure",
            message: &message,
            reason: self.reason(),
            code: code.as_u16(),
        })
        .unwrap_or_default();

        (code, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

/// Errors raised while loading listener TLS material.
#[derive(Debug, Error)]
pub enum CertError {
    /// Certificate or key file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not usable PEM
    #[error("PEM error: {0}")]
    Pem(String),

    /// rustls rejected the pair
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}
