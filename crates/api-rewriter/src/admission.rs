//! Admission review rewriting.
//!
//! An `AdmissionReview` names the reviewed resource several times
//! (`request.kind`, `request.resource` and their `request*` twins), carries
//! the object and old object, and on the way back may carry a base64 encoded
//! patch in `response.patch`.

use base64::{Engine, prelude::BASE64_STANDARD};

use crate::error::TransformError;
use crate::rewriter::Rewriter;
use crate::rules::{Direction, Rule};
use crate::transform::{self, Pipeline, TransformResult};

const PATCH_PATH: &str = "response.patch";

impl Rewriter {
    /// Rewrites the request and response parts of an admission review.
    ///
    /// `fallback` is used for embedded objects and for the response patch,
    /// which does not name its own kind.
    pub(crate) fn admission_review(&self, body: &[u8], direction: Direction, fallback: Option<&Rule>) -> TransformResult {
        Pipeline::new()
            .step("request.kind", |d| self.group_kind(d, "request.kind", direction))
            .step("request.requestKind", |d| self.group_kind(d, "request.requestKind", direction))
            .step("request.resource", |d| self.group_resource(d, "request.resource", direction))
            .step("request.requestResource", |d| {
                self.group_resource(d, "request.requestResource", direction)
            })
            .step("request.object", |d| {
                transform::object(d, "request.object", |obj| self.object(obj, direction, fallback))
            })
            .step("request.oldObject", |d| {
                transform::object(d, "request.oldObject", |obj| self.object(obj, direction, fallback))
            })
            .step("response.patch", |d| self.admission_patch(d, direction, fallback))
            .run(body)
    }

    /// Rewrites a `{group, version, kind}` object.
    fn group_kind(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        let Some(group) = transform::get_str(doc, &format!("{path}.group"))? else {
            return Ok(None);
        };
        if !self.rules().has_group(&group, direction) {
            return Ok(None);
        }
        transform::object(doc, path, |gvk| {
            Pipeline::new()
                .step("kind", |d| {
                    transform::string(d, "kind", |kind| {
                        self.rules()
                            .rule_for_group_kind(&group, kind, direction)
                            .and_then(|rule| rule.map_kind(kind, direction))
                            .map(str::to_string)
                    })
                })
                .step("group", |d| self.group_field(d, direction))
                .run(gvk)
        })
    }

    /// Rewrites a `{group, version, resource}` object.
    fn group_resource(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        let Some(group) = transform::get_str(doc, &format!("{path}.group"))? else {
            return Ok(None);
        };
        if !self.rules().has_group(&group, direction) {
            return Ok(None);
        }
        transform::object(doc, path, |gvr| {
            Pipeline::new()
                .step("resource", |d| {
                    transform::string(d, "resource", |resource| {
                        self.rules()
                            .rule_for_resource(resource, direction)
                            .filter(|rule| rule.source(direction).group == group)
                            .map(|rule| rule.target(direction).resource.clone())
                    })
                })
                .step("group", |d| self.group_field(d, direction))
                .run(gvr)
        })
    }

    fn group_field(&self, doc: &[u8], direction: Direction) -> TransformResult {
        transform::string(doc, "group", |group| {
            self.rules().map_group(group, direction).map(str::to_string)
        })
    }

    /// Decodes, rewrites and re-encodes `response.patch`.
    fn admission_patch(&self, doc: &[u8], direction: Direction, rule: Option<&Rule>) -> TransformResult {
        let Some(encoded) = transform::get_str(doc, PATCH_PATH)? else {
            return Ok(None);
        };
        let decoded = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| TransformError::Encoding(format!("{PATCH_PATH}: {e}")))?;
        let Some(patch) = self.patch(&decoded, direction, rule)? else {
            return Ok(None);
        };
        transform::set_string(doc, PATCH_PATH, &BASE64_STANDARD.encode(patch)).map(Some)
    }
}
