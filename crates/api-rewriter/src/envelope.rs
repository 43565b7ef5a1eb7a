//! Kubernetes envelope helpers.
//!
//! Bodies come in a handful of shapes: a single object, a `*List` wrapping
//! objects under `items`, a merge patch (JSON object) or a JSON patch
//! (array of operations). The helpers here route a body to the right
//! per-object transform so callers only write the per-object part once.

use crate::error::TransformError;
use crate::transform::{self, ROOT, TransformResult};

/// Shape of a body, decided once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    /// A single object with a kind
    Single,
    /// A `*List` object; per-object transforms apply to `items`
    List,
    /// Merge patch or strategic merge patch (a JSON object)
    MergePatch,
    /// RFC 6902 JSON patch (a JSON array of operations)
    JsonPatch,
    /// Anything that is not rewritten (empty, scalar, no kind)
    Passthrough,
}

impl EnvelopeShape {
    /// Classifies `body`. Patch bodies are classified by their first
    /// non-whitespace byte, everything else by `kind`.
    pub fn classify(body: &[u8], is_patch: bool) -> Result<Self, TransformError> {
        if is_patch {
            return Ok(match first_byte(body) {
                Some(b'{') => Self::MergePatch,
                Some(b'[') => Self::JsonPatch,
                _ => Self::Passthrough,
            });
        }
        if first_byte(body) != Some(b'{') {
            return Ok(Self::Passthrough);
        }
        Ok(match transform::get_str(body, "kind")? {
            Some(kind) if kind.ends_with("List") => Self::List,
            Some(kind) if !kind.is_empty() => Self::Single,
            _ => Self::Passthrough,
        })
    }
}

/// Applies `single` to a lone object, or to every element of `items` when
/// the body is a list. A body without `kind` is left alone.
///
/// The list's own `apiVersion` and `kind` are not touched here.
pub fn resource_or_list<F>(doc: &[u8], single: F) -> TransformResult
where
    F: Fn(&[u8]) -> TransformResult,
{
    match transform::get_str(doc, "kind")? {
        Some(kind) if kind.ends_with("List") => transform::array(doc, "items", single),
        Some(kind) if !kind.is_empty() => single(doc),
        _ => Ok(None),
    }
}

/// Routes a patch body by dialect: merge patches go to `merge`, JSON patches
/// have `json_op` applied to every operation. Any other body is unchanged.
pub fn patch<M, J>(doc: &[u8], merge: M, json_op: J) -> TransformResult
where
    M: FnOnce(&[u8]) -> TransformResult,
    J: FnMut(&[u8]) -> TransformResult,
{
    match first_byte(doc) {
        Some(b'{') => merge(doc),
        Some(b'[') => transform::array(doc, ROOT, json_op),
        _ => Ok(None),
    }
}

fn first_byte(doc: &[u8]) -> Option<u8> {
    doc.iter().copied().find(|b| !b.is_ascii_whitespace())
}
