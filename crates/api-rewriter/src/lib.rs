//! Kubernetes API Rewriter
//!
//! Renames Kubernetes resource identities (API group, kind, resource and the
//! references embedded in objects) between an original schema and a renamed
//! schema, directly on raw JSON bodies.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use api_rewriter::{Direction, Rewriter, RuleTable};
//!
//! let rewriter = Rewriter::new(Arc::new(RuleTable::bundled()?));
//!
//! let body = br#"{"apiVersion":"kubevirt.io/v1","kind":"VirtualMachine","metadata":{"name":"vm"}}"#;
//! let renamed = rewriter.rewrite("virtualmachines", Direction::ToRenamed, body)?;
//! assert_eq!(
//!     renamed.as_ref(),
//!     br#"{"apiVersion":"internal.virtualization.deckhouse.io/v1","kind":"InternalVirtualizationVirtualMachine","metadata":{"name":"vm"}}"#
//! );
//!
//! let restored = rewriter.rewrite("internalvirtualizationvirtualmachines", Direction::ToOriginal, &renamed)?;
//! assert_eq!(restored.as_ref(), body);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Layers
//!
//! - [`transform`]: path-addressed reads and edits over raw JSON bytes
//! - [`envelope`]: single object / list / patch dispatch
//! - [`rules`]: the rule file schema and the validated [`RuleTable`]
//! - [`names`]: label, annotation and finalizer name rules
//! - [`rewriter`], [`patch`], [`admission`]: the rewriter engine
//! - [`endpoint`]: API paths and label selectors
//! - [`discovery`]: group and resource discovery documents

pub mod admission;
pub mod discovery;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod names;
pub mod patch;
pub mod rewriter;
pub mod rules;
pub mod transform;

#[cfg(test)]
mod rewriter_test;
#[cfg(test)]
mod test_utils;

pub use endpoint::ApiEndpoint;
pub use envelope::EnvelopeShape;
pub use error::{RewriteError, RulesError, TransformError};
pub use rewriter::Rewriter;
pub use rules::{Direction, ResourceIdentity, RuleTable};
