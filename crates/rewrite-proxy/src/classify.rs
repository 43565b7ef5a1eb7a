//! Request classification.
//!
//! Decides, once per request, where it goes and which resource type names
//! the request and response bodies. Everything downstream reads the
//! resulting [`TargetRequest`] instead of looking at the request again.

use std::fmt;

use api_rewriter::endpoint::{ApiEndpoint, is_watch_query};
use api_rewriter::{Direction, Rewriter};
use axum::http::{HeaderMap, Method, Uri, header};

/// Which side of the cluster a proxy instance sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Original-schema clients calling the API server
    Client,
    /// API server calling original-schema admission webhooks
    Webhook,
}

impl ProxyMode {
    /// Direction applied to requests. Responses use the inverse.
    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            Self::Client => Direction::ToRenamed,
            Self::Webhook => Direction::ToOriginal,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Webhook => "webhook",
        })
    }
}

/// Classification of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRequest {
    /// Path and query sent to the target
    pub path_and_query: String,
    /// Resource type for the request body, as named on the source side of
    /// the proxy direction. `None` when no rule applies.
    pub request_resource: Option<String>,
    /// Resource type for the response body, as named on the source side of
    /// the inverse direction
    pub response_resource: Option<String>,
    /// `watch=true|1` in the query
    pub watch: bool,
    /// PATCH request
    pub patch: bool,
    /// Request body is JSON
    pub json_body: bool,
    /// Legacy discovery document for `/apis` or a ruled group
    pub discovery: bool,
}

impl TargetRequest {
    /// Classifies a request for a proxy in `mode`.
    #[must_use]
    pub fn classify(rewriter: &Rewriter, mode: ProxyMode, method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let mut target = Self {
            path_and_query: uri.path_and_query().map_or_else(|| uri.path().to_string(), ToString::to_string),
            watch: is_watch_query(uri.query().unwrap_or_default()),
            patch: *method == Method::PATCH,
            json_body: is_json(headers),
            ..Default::default()
        };
        match mode {
            ProxyMode::Client => target.classify_api(rewriter, uri),
            ProxyMode::Webhook => target.classify_webhook(rewriter, uri),
        }
        target
    }

    /// True when the request body goes through the rewriter.
    #[must_use]
    pub fn rewrites_request(&self) -> bool {
        self.json_body && self.request_resource.is_some()
    }

    /// True when a JSON response body goes through the rewriter.
    #[must_use]
    pub fn rewrites_response(&self) -> bool {
        !self.watch && (self.response_resource.is_some() || self.discovery)
    }

    fn classify_api(&mut self, rewriter: &Rewriter, uri: &Uri) {
        let Some(endpoint) = ApiEndpoint::parse(uri.path(), uri.query()) else {
            return;
        };
        let direction = Direction::ToRenamed;
        let ruled = !endpoint.core
            && rewriter
                .rules()
                .rule_for_resource(&endpoint.resource, direction)
                .is_some_and(|rule| rule.source(direction).group == endpoint.group);

        self.discovery = !endpoint.core
            && endpoint.resource.is_empty()
            && (endpoint.group.is_empty() || rewriter.rules().has_group(&endpoint.group, direction));

        let rewritten = rewriter.rewrite_endpoint(&endpoint, direction);
        if let Some(rewritten) = &rewritten {
            self.path_and_query = rewritten.path_and_query();
        }
        if ruled {
            self.request_resource = Some(endpoint.resource_type());
            self.response_resource = Some(rewritten.unwrap_or(endpoint).resource_type());
        }
    }

    fn classify_webhook(&mut self, rewriter: &Rewriter, uri: &Uri) {
        let rules = rewriter.rules();
        let Some(rule) = rules
            .webhook(uri.path())
            .and_then(|hook| rules.rule_for_resource(hook.primary_resource(), Direction::ToRenamed))
        else {
            return;
        };
        self.request_resource = Some(rule.renamed().resource.clone());
        self.response_resource = Some(rule.original().resource.clone());
    }
}

/// True when the `Content-Type` names a JSON media type.
#[must_use]
pub fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            let media = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
            media == "application/json" || media.ends_with("+json")
        })
}
