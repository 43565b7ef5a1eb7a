//! Rewriter engine.
//!
//! [`Rewriter::rewrite`] takes a body for a resource type and rewrites every
//! identity it knows about toward the target side of a [`Direction`]:
//!
//! - `apiVersion` and `kind` of the object (and of a list and its items)
//! - declared nested references (`apiVersion`/`apiGroup` + `kind`)
//! - `metadata.ownerReferences` and `metadata.managedFields[].apiVersion`
//! - label, annotation and finalizer names, also inside declared templates
//! - `details.group`/`details.kind` of `Status` objects
//!
//! Admission reviews and patches have their own entry points in
//! [`crate::admission`] and [`crate::patch`].

use std::borrow::Cow;
use std::sync::Arc;

use tracing::trace;

use crate::envelope::{self, EnvelopeShape};
use crate::error::{RewriteError, TransformError};
use crate::rules::{Direction, Rule, RuleTable};
use crate::transform::{self, Pipeline, TransformResult};

/// Kind of an admission review envelope.
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

const STATUS_KIND: &str = "Status";

/// Rule-driven body rewriter. Cheap to clone; the rule table is shared.
#[derive(Debug, Clone)]
pub struct Rewriter {
    rules: Arc<RuleTable>,
}

impl Rewriter {
    /// Creates a rewriter over a shared rule table.
    #[must_use]
    pub fn new(rules: Arc<RuleTable>) -> Self {
        Self { rules }
    }

    /// The rule table.
    #[must_use]
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Rewrites an object, list or admission review body for `resource_type`
    /// (a plural on the source side of `direction`, subresource allowed).
    ///
    /// Unknown resource types and bodies without a `kind` come back borrowed
    /// and untouched.
    pub fn rewrite<'a>(
        &self,
        resource_type: &str,
        direction: Direction,
        body: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, RewriteError> {
        if self.rules.rule_for_resource(resource_type, direction).is_none() {
            return Ok(Cow::Borrowed(body));
        }
        let shape = EnvelopeShape::classify(body, false)?;
        self.rewrite_shaped(resource_type, direction, shape, body)
    }

    /// Rewrites a body already classified as `shape`.
    pub fn rewrite_shaped<'a>(
        &self,
        resource_type: &str,
        direction: Direction,
        shape: EnvelopeShape,
        body: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, RewriteError> {
        let Some(rule) = self.rules.rule_for_resource(resource_type, direction) else {
            trace!(resource = resource_type, "No rule for resource, passing through");
            return Ok(Cow::Borrowed(body));
        };

        let rewritten = match shape {
            EnvelopeShape::Passthrough => None,
            EnvelopeShape::MergePatch | EnvelopeShape::JsonPatch => self.patch(body, direction, Some(rule))?,
            _ if is_admission_review(body)? => self.admission_review(body, direction, Some(rule))?,
            EnvelopeShape::List => Pipeline::new()
                .step("items", |doc| {
                    envelope::resource_or_list(doc, |item| self.object(item, direction, Some(rule)))
                })
                .step("list type", |doc| self.type_meta(doc, direction))
                .run(body)?,
            EnvelopeShape::Single => self.object(body, direction, Some(rule))?,
        };
        Ok(finish(body, rewritten))
    }

    /// Rewrites one object. The rule for nested references and templates is
    /// taken from the object's own `apiVersion`/`kind`, or `fallback` when
    /// the object does not name a ruled kind.
    pub fn object(&self, doc: &[u8], direction: Direction, fallback: Option<&Rule>) -> TransformResult {
        let rule = self.rule_of(doc, direction)?.or(fallback);

        let mut pipeline = Pipeline::new()
            .step("type meta", |d| self.type_meta(d, direction))
            .step("metadata", |d| self.metadata(d, direction))
            .step("status details", |d| self.status_details(d, direction));
        if let Some(rule) = rule {
            for path in &rule.references {
                pipeline = pipeline.step("reference", move |d| self.reference(d, path, direction));
            }
            for path in &rule.templates {
                pipeline = pipeline.step("template metadata", move |d| {
                    transform::object(d, path, |template| self.metadata(template, direction))
                });
            }
        }
        pipeline.run(doc)
    }

    /// Rewrites `apiVersion` and `kind` of a typed object.
    pub fn type_meta(&self, doc: &[u8], direction: Direction) -> TransformResult {
        self.reference_object(doc, direction)
    }

    /// Rewrites `doc.metadata` in place.
    pub fn metadata(&self, doc: &[u8], direction: Direction) -> TransformResult {
        transform::object(doc, "metadata", |meta| self.metadata_fields(meta, direction))
    }

    /// Rewrites the fields of a metadata object (`doc` is the metadata itself).
    pub fn metadata_fields(&self, meta: &[u8], direction: Direction) -> TransformResult {
        Pipeline::new()
            .step("ownerReferences", |d| {
                transform::array(d, "ownerReferences", |owner| self.reference_object(owner, direction))
            })
            .step("managedFields", |d| {
                transform::array(d, "managedFields", |field| {
                    transform::string(field, "apiVersion", |av| self.rules.map_api_version(av, direction))
                })
            })
            .step("labels", |d| self.labels(d, "labels", direction))
            .step("annotations", |d| self.annotations(d, "annotations", direction))
            .step("finalizers", |d| self.finalizers(d, "finalizers", direction))
            .run(meta)
    }

    /// Rewrites the label map at `path`.
    pub fn labels(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        let labels = self.rules.labels();
        transform::map_string_string(doc, path, |name, value| Some(labels.rewrite(name, value, direction)))
    }

    /// Rewrites the annotation map at `path`.
    pub fn annotations(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        let annotations = self.rules.annotations();
        transform::map_string_string(doc, path, |name, value| {
            Some(annotations.rewrite(name, value, direction))
        })
    }

    /// Rewrites the finalizer list at `path`.
    pub fn finalizers(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        let finalizers = self.rules.finalizers();
        transform::array_of_strings(doc, path, |name| Some(finalizers.rewrite_name(name, direction)))
    }

    /// Rewrites a reference at `path`: one object or an array of objects.
    pub fn reference(&self, doc: &[u8], path: &str, direction: Direction) -> TransformResult {
        match transform::get(doc, path)?.and_then(|raw| raw.first().copied()) {
            Some(b'[') => transform::array(doc, path, |item| self.reference_object(item, direction)),
            Some(b'{') => transform::object(doc, path, |item| self.reference_object(item, direction)),
            _ => Ok(None),
        }
    }

    /// Rewrites an object that names another resource through
    /// `apiVersion` (or `apiGroup`) and `kind`.
    pub fn reference_object(&self, doc: &[u8], direction: Direction) -> TransformResult {
        let (group_path, group) = if let Some(api_version) = transform::get_str(doc, "apiVersion")? {
            match api_version.split_once('/') {
                Some((group, _)) => ("apiVersion", group.to_string()),
                None => return Ok(None),
            }
        } else if let Some(group) = transform::get_str(doc, "apiGroup")? {
            ("apiGroup", group)
        } else {
            return Ok(None);
        };
        if !self.rules.has_group(&group, direction) {
            return Ok(None);
        }

        let kind = |d: &[u8]| {
            transform::string(d, "kind", |kind| {
                self.rules
                    .rule_for_group_kind(&group, kind, direction)
                    .and_then(|rule| rule.map_kind(kind, direction))
                    .map(str::to_string)
            })
        };
        let group_field = |d: &[u8]| {
            transform::string(d, group_path, |value| {
                if group_path == "apiVersion" {
                    self.rules.map_api_version(value, direction)
                } else {
                    self.rules.map_group(value, direction).map(str::to_string)
                }
            })
        };
        transform::apply(doc, &[&kind, &group_field])
    }

    /// Rewrites `details.group` and `details.kind` (a plural) of a `Status`.
    pub fn status_details(&self, doc: &[u8], direction: Direction) -> TransformResult {
        if transform::get_str(doc, "kind")?.as_deref() != Some(STATUS_KIND) {
            return Ok(None);
        }
        let Some(group) = transform::get_str(doc, "details.group")? else {
            return Ok(None);
        };
        if !self.rules.has_group(&group, direction) {
            return Ok(None);
        }

        Pipeline::new()
            .step("details.kind", |d| {
                transform::string(d, "details.kind", |resource| {
                    self.rules
                        .rule_for_resource(resource, direction)
                        .filter(|rule| rule.source(direction).group == group)
                        .map(|rule| rule.target(direction).resource.clone())
                })
            })
            .step("details.group", |d| {
                transform::string(d, "details.group", |value| {
                    self.rules.map_group(value, direction).map(str::to_string)
                })
            })
            .run(doc)
    }

    fn rule_of(&self, doc: &[u8], direction: Direction) -> Result<Option<&Rule>, TransformError> {
        let Some(api_version) = transform::get_str(doc, "apiVersion")? else {
            return Ok(None);
        };
        let Some(kind) = transform::get_str(doc, "kind")? else {
            return Ok(None);
        };
        let group = api_version.split_once('/').map_or("", |(group, _)| group);
        Ok(self.rules.rule_for_group_kind(group, &kind, direction))
    }
}

/// True when the body is an `AdmissionReview` envelope.
pub fn is_admission_review(body: &[u8]) -> Result<bool, TransformError> {
    Ok(transform::get_str(body, "kind")?.as_deref() == Some(ADMISSION_REVIEW_KIND))
}

/// Turns a transform outcome into the response body.
pub(crate) fn finish(body: &[u8], rewritten: Option<Vec<u8>>) -> Cow<'_, [u8]> {
    match rewritten {
        Some(bytes) => Cow::Owned(bytes),
        None => Cow::Borrowed(body),
    }
}
