//! Proxy handler.
//!
//! ```text
//! client ──► classify ──► rewrite(direction) ──► target
//!   ▲                                              │
//!   └──────── rewrite(direction.inverse()) ◄───────┘
//! ```
//!
//! Bodies that are rewritten are buffered whole. Other request bodies, watch
//! streams and non-JSON responses are streamed through untouched. The
//! timeout covers the target's response headers and any body buffered for
//! rewriting, never a streamed body.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use api_rewriter::{Direction, EnvelopeShape, RewriteError, Rewriter};
use axum::Router;
use axum::body::{Body, HttpBody};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::classify::{ProxyMode, TargetRequest, is_json};
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::target::ProxyTarget;

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Default timeout for non-watch requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const PROTOBUF: &str = "protobuf";
const AGGREGATED_DISCOVERY: &str = "APIGroupDiscoveryList";

/// One proxy instance: fixed direction, own target and metrics.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    mode: ProxyMode,
    rewriter: Rewriter,
    target: ProxyTarget,
    metrics: ProxyMetrics,
    timeout: Duration,
}

impl Proxy {
    /// Creates a proxy named after its mode.
    pub fn new(mode: ProxyMode, rewriter: Rewriter, target: ProxyTarget) -> Result<Self, ProxyError> {
        let name = mode.to_string();
        let metrics = ProxyMetrics::new(&name).map_err(|e| ProxyError::Config(e.to_string()))?;
        Ok(Self {
            name,
            mode,
            rewriter,
            target,
            metrics,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the timeout for non-watch requests.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance metrics.
    #[must_use]
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Router sending every path to this proxy.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle).with_state(self)
    }

    /// Proxies one request.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let direction = self.mode.direction();
        let target = TargetRequest::classify(&self.rewriter, self.mode, &parts.method, &parts.uri, &parts.headers);
        debug!(
            proxy = %self.name,
            method = %parts.method,
            path = %parts.uri.path(),
            target = %target.path_and_query,
            resource = ?target.request_resource,
            watch = target.watch,
            "Proxy request received"
        );

        let body = match &target.request_resource {
            Some(resource) if target.rewrites_request() => {
                let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
                    .await
                    .map_err(|e| ProxyError::Body(e.to_string()))?;
                if body.is_empty() {
                    reqwest::Body::from(body)
                } else {
                    reqwest::Body::from(self.rewrite_body(resource, direction, target.patch, "request", body)?)
                }
            }
            _ if body.size_hint().exact() == Some(0) => reqwest::Body::from(Bytes::new()),
            _ => reqwest::Body::wrap_stream(body.into_data_stream()),
        };

        let mut headers = forward_headers(&parts.headers);
        headers.remove(header::HOST);
        headers.remove(header::ACCEPT_ENCODING);
        if target.rewrites_response() {
            force_json_accept(&mut headers);
        }
        if !headers.contains_key(header::AUTHORIZATION)
            && let Some(token) = self.target.bearer_token().await
        {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProxyError::Config(format!("token is not a valid header value: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let send = self
            .target
            .client()
            .request(parts.method.clone(), self.target.url(&target.path_and_query))
            .headers(headers)
            .body(body)
            .send();
        let upstream = if target.watch {
            send.await?
        } else {
            tokio::time::timeout_at(deadline, send).await.map_err(|_| self.timed_out())??
        };

        let status = upstream.status();
        let headers = forward_headers(upstream.headers());
        if !(target.rewrites_response() && is_json(&headers)) {
            debug!(proxy = %self.name, status = %status, watch = target.watch, "Streaming response");
            let proxy = self.name.clone();
            let stream = upstream
                .bytes_stream()
                .inspect_err(move |e| warn!(proxy = %proxy, error = %e, "Response stream interrupted"));
            return Ok(respond(status, headers, Body::from_stream(stream)));
        }

        let bytes = tokio::time::timeout_at(deadline, upstream.bytes())
            .await
            .map_err(|_| self.timed_out())??;
        let bytes = match target.response_resource.as_deref() {
            Some(resource) => self.rewrite_body(resource, direction.inverse(), false, "response", bytes)?,
            None => self.restore_discovery(direction.inverse(), bytes)?,
        };
        Ok(respond(status, headers, Body::from(bytes)))
    }

    fn timed_out(&self) -> ProxyError {
        ProxyError::Timeout(format!("no response from target within {:?}", self.timeout))
    }

    fn restore_discovery(&self, direction: Direction, body: Bytes) -> Result<Bytes, ProxyError> {
        match self.rewriter.rewrite_discovery(&body, direction) {
            Ok(Cow::Owned(bytes)) => {
                debug!(proxy = %self.name, %direction, "Discovery rewritten");
                self.metrics.rewrite("discovery");
                Ok(Bytes::from(bytes))
            }
            Ok(Cow::Borrowed(_)) => Ok(body),
            Err(err) => {
                warn!(proxy = %self.name, %direction, error = %err, "Discovery rewrite failed");
                Err(err.into())
            }
        }
    }

    fn rewrite_body(
        &self,
        resource: &str,
        direction: Direction,
        patch: bool,
        stage: &str,
        body: Bytes,
    ) -> Result<Bytes, ProxyError> {
        let shape = EnvelopeShape::classify(&body, patch).map_err(RewriteError::from)?;
        let rewritten = match self.rewriter.rewrite_shaped(resource, direction, shape, &body) {
            Ok(Cow::Owned(bytes)) => Some(bytes),
            Ok(Cow::Borrowed(_)) => None,
            Err(err) => {
                warn!(proxy = %self.name, resource, stage, %direction, decision = ?shape, error = %err, "Rewrite failed");
                return Err(err.into());
            }
        };
        let Some(rewritten) = rewritten else {
            if shape == EnvelopeShape::Passthrough && !body.is_empty() {
                warn!(proxy = %self.name, resource, stage, "Body not recognized, forwarding unchanged");
            } else {
                debug!(proxy = %self.name, resource, stage, decision = ?shape, "Body unchanged");
            }
            return Ok(body);
        };
        debug!(proxy = %self.name, resource, stage, %direction, decision = ?shape, "Body rewritten");
        self.metrics.rewrite(stage);
        Ok(Bytes::from(rewritten))
    }
}

async fn handle(State(proxy): State<Arc<Proxy>>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let started = Instant::now();
    let response = match proxy.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(proxy = %proxy.name, method = %method, error = %err, "Proxy request failed");
            proxy.metrics.error(err.kind());
            err.into_response()
        }
    };
    proxy
        .metrics
        .observe_request(method.as_str(), response.status().as_u16(), started.elapsed());
    response
}

/// Copies headers, dropping hop-by-hop ones and `Content-Length`.
fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out.remove(header::CONTENT_LENGTH);
    out
}

/// Replaces protobuf and aggregated discovery `Accept` values with JSON so
/// the response can be rewritten.
fn force_json_accept(headers: &mut HeaderMap) {
    let rewritable = headers.get_all(header::ACCEPT).iter().all(|value| {
        value
            .to_str()
            .is_ok_and(|value| !value.contains(PROTOBUF) && !value.contains(AGGREGATED_DISCOVERY))
    });
    if !rewritable {
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    }
}

fn respond(status: axum::http::StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_forward_headers_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = forward_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_force_json_accept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.kubernetes.protobuf, application/json"),
        );
        force_json_accept(&mut headers);
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json;as=Table;g=meta.k8s.io;v=v1"));
        force_json_accept(&mut headers);
        assert_eq!(
            headers.get(header::ACCEPT).unwrap(),
            "application/json;as=Table;g=meta.k8s.io;v=v1"
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList,application/json",
            ),
        );
        force_json_accept(&mut headers);
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }
}
