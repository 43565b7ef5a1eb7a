//! Rewrite Proxy
//!
//! HTTP reverse proxy that renames Kubernetes resource identities in flight.
//!
//! Two instances are usually run side by side:
//!
//! - the client proxy sits between original-schema clients and the API
//!   server ([`ProxyMode::Client`], requests renamed, responses restored)
//! - the webhook proxy sits between the API server and original-schema
//!   admission webhooks ([`ProxyMode::Webhook`], requests restored, responses
//!   renamed), terminating TLS with certificates kept current by
//!   [`CertManager`]
//!
//! Both share one [`api_rewriter::RuleTable`] and nothing else.

pub mod certs;
pub mod classify;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod target;

#[cfg(test)]
mod test_utils;

pub use certs::{CertManager, CertMaterial, CertWatcher};
pub use classify::{ProxyMode, TargetRequest};
pub use error::{CertError, ProxyError};
pub use handler::Proxy;
pub use metrics::ProxyMetrics;
pub use target::ProxyTarget;
