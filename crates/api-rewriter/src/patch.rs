//! Patch rewriting.
//!
//! Merge patches are partial objects and go through the regular object
//! rewrite. JSON patches are rewritten one operation at a time: the
//! operation's `path` (and `from`) pointer decides what its `value` holds,
//! and label or annotation keys inside the pointer are renamed the same way
//! they would be inside the object.

use std::borrow::Cow;

use crate::envelope::{self, EnvelopeShape};
use crate::error::RewriteError;
use crate::rewriter::Rewriter;
use crate::rules::{Direction, Rule};
use crate::transform::{self, Pipeline, TransformResult};

/// What a JSON pointer addresses inside a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// The whole object (`""`)
    Document,
    ApiVersion,
    Kind,
    /// A declared template (its value carries `metadata`)
    Template,
    Metadata,
    Labels,
    /// One label; the key is segment `index`
    Label(usize),
    Annotations,
    Annotation(usize),
    Finalizers,
    Finalizer,
    OwnerReferences,
    OwnerReference,
    /// A declared reference path
    Reference,
    /// One element of a declared reference array
    ReferenceItem,
    Other,
}

impl Rewriter {
    /// Rewrites a merge patch or JSON patch body for `resource_type`.
    pub fn rewrite_patch<'a>(
        &self,
        resource_type: &str,
        direction: Direction,
        body: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, RewriteError> {
        let shape = EnvelopeShape::classify(body, true)?;
        self.rewrite_shaped(resource_type, direction, shape, body)
    }

    /// Routes `body` by patch dialect and rewrites it.
    pub fn patch(&self, body: &[u8], direction: Direction, rule: Option<&Rule>) -> TransformResult {
        envelope::patch(
            body,
            |merge| self.object(merge, direction, rule),
            |op| self.json_patch_op(op, direction, rule),
        )
    }

    /// Rewrites one JSON patch operation object.
    pub fn json_patch_op(&self, op: &[u8], direction: Direction, rule: Option<&Rule>) -> TransformResult {
        Pipeline::new()
            .step("path", |d| self.op_path(d, direction, rule))
            .step("from", |d| self.op_from(d, direction, rule))
            .run(op)
    }

    /// Rewrites `path` together with `value`, since label rules may match on
    /// both.
    fn op_path(&self, op: &[u8], direction: Direction, rule: Option<&Rule>) -> TransformResult {
        let Some(path) = transform::get_str(op, "path")? else {
            return Ok(None);
        };
        let Some(segments) = parse_pointer(&path) else {
            return Ok(None);
        };

        let (index, names) = match locate(&segments, rule) {
            Target::Label(index) => (index, self.rules().labels()),
            Target::Annotation(index) => (index, self.rules().annotations()),
            target => return self.op_value(op, &target, direction, rule),
        };
        let value = match transform::get(op, "value")? {
            Some(raw) if raw.first() == Some(&b'"') => transform::get_str(op, "value")?,
            _ => None,
        };
        let (name, new_value) = names.rewrite(&segments[index], value.as_deref().unwrap_or_default(), direction);

        let mut out = None;
        if name != segments[index] {
            let mut renamed = segments.clone();
            renamed[index] = name;
            out = Some(transform::set_string(op, "path", &format_pointer(&renamed))?);
        }
        if let Some(value) = value
            && new_value != value
        {
            let current = out.as_deref().unwrap_or(op);
            out = Some(transform::set_string(current, "value", &new_value)?);
        }
        Ok(out)
    }

    fn op_value(&self, op: &[u8], target: &Target, direction: Direction, rule: Option<&Rule>) -> TransformResult {
        match target {
            Target::Document => transform::object(op, "value", |v| self.object(v, direction, rule)),
            Target::ApiVersion => {
                transform::string(op, "value", |av| self.rules().map_api_version(av, direction))
            }
            Target::Kind => transform::string(op, "value", |kind| {
                rule.and_then(|rule| rule.map_kind(kind, direction)).map(str::to_string)
            }),
            Target::Template => transform::object(op, "value", |t| self.metadata(t, direction)),
            Target::Metadata => transform::object(op, "value", |m| self.metadata_fields(m, direction)),
            Target::Labels => self.labels(op, "value", direction),
            Target::Annotations => self.annotations(op, "value", direction),
            Target::Finalizers => self.finalizers(op, "value", direction),
            Target::Finalizer => transform::string(op, "value", |name| {
                Some(self.rules().finalizers().rewrite_name(name, direction))
            }),
            Target::OwnerReferences => {
                transform::array(op, "value", |owner| self.reference_object(owner, direction))
            }
            Target::OwnerReference | Target::ReferenceItem => {
                transform::object(op, "value", |item| self.reference_object(item, direction))
            }
            Target::Reference => self.reference(op, "value", direction),
            Target::Label(_) | Target::Annotation(_) | Target::Other => Ok(None),
        }
    }

    /// `from` (move/copy) only carries names, never values.
    fn op_from(&self, op: &[u8], direction: Direction, rule: Option<&Rule>) -> TransformResult {
        let Some(from) = transform::get_str(op, "from")? else {
            return Ok(None);
        };
        let Some(mut segments) = parse_pointer(&from) else {
            return Ok(None);
        };
        let (index, names) = match locate(&segments, rule) {
            Target::Label(index) => (index, self.rules().labels()),
            Target::Annotation(index) => (index, self.rules().annotations()),
            _ => return Ok(None),
        };
        let name = names.rewrite_name(&segments[index], direction);
        if name == segments[index] {
            return Ok(None);
        }
        segments[index] = name;
        transform::set_string(op, "from", &format_pointer(&segments)).map(Some)
    }
}

/// Classifies a pointer against the object layout and the rule's declared
/// templates and references.
fn locate(segments: &[String], rule: Option<&Rule>) -> Target {
    match segments {
        [] => return Target::Document,
        [field] if field == "apiVersion" => return Target::ApiVersion,
        [field] if field == "kind" => return Target::Kind,
        _ => {}
    }

    let templates = rule.map(|rule| rule.templates.as_slice()).unwrap_or_default();
    let bases = std::iter::once(Vec::new()).chain(templates.iter().map(|path| dotted(path)));
    for base in bases {
        if !base.is_empty() && segments == base.as_slice() {
            return Target::Template;
        }
        let Some(rest) = segments.strip_prefix(base.as_slice()) else {
            continue;
        };
        let Some(("metadata", rest)) = rest.split_first().map(|(head, rest)| (head.as_str(), rest)) else {
            continue;
        };
        let key = base.len() + 2;
        return match rest {
            [] => Target::Metadata,
            [field] if field == "labels" => Target::Labels,
            [field, _] if field == "labels" => Target::Label(key),
            [field] if field == "annotations" => Target::Annotations,
            [field, _] if field == "annotations" => Target::Annotation(key),
            [field] if field == "finalizers" => Target::Finalizers,
            [field, _] if field == "finalizers" => Target::Finalizer,
            [field] if field == "ownerReferences" => Target::OwnerReferences,
            [field, _] if field == "ownerReferences" => Target::OwnerReference,
            _ => Target::Other,
        };
    }

    let references = rule.map(|rule| rule.references.as_slice()).unwrap_or_default();
    for reference in references {
        let reference = dotted(reference);
        match segments.strip_prefix(reference.as_slice()) {
            Some([]) => return Target::Reference,
            Some([_]) => return Target::ReferenceItem,
            _ => {}
        }
    }
    Target::Other
}

fn dotted(path: &str) -> Vec<String> {
    path.split('.').map(ToString::to_string).collect()
}

/// Splits an RFC 6901 pointer into unescaped segments.
fn parse_pointer(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    let rest = pointer.strip_prefix('/')?;
    Some(
        rest.split('/')
            .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}

fn format_pointer(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}
