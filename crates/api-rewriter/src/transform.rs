//! Path-addressed edits over raw JSON bytes.
//!
//! Documents are never parsed into a tree. Values are located through
//! borrowed `serde_json::value::RawValue` spans and every edit splices new
//! bytes into a copy of the input, so bytes outside an edited span (field
//! order, whitespace, number formatting) come out exactly as they went in.
//!
//! Paths are dotted selectors such as `metadata.labels` or `items.0.kind`.
//! Numeric segments index arrays. [`ROOT`] addresses the document itself.
//! A `null` value is treated exactly like a missing one.
//!
//! Every combinator returns [`TransformResult`]: `Ok(None)` means the
//! document is unchanged and the caller keeps using its own buffer.

use std::fmt;
use std::ops::Range;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::value::RawValue;
use tracing::debug;

use crate::error::TransformError;

/// Path that addresses the whole document.
pub const ROOT: &str = "@this";

/// Outcome of an edit: a new document, or `None` when nothing changed.
pub type TransformResult = Result<Option<Vec<u8>>, TransformError>;

/// A single edit step, as accepted by [`apply`].
pub type Step<'a> = dyn Fn(&[u8]) -> TransformResult + 'a;

/// Returns the raw bytes of the value at `path`, if present and not null.
pub fn get<'a>(doc: &'a [u8], path: &str) -> Result<Option<&'a [u8]>, TransformError> {
    let text = as_text(doc, path)?;
    Ok(match resolve(text, path)? {
        Slot::Found(span) => Some(&doc[span]),
        _ => None,
    })
}

/// Returns the string at `path`. A non-string value is `MalformedInput`.
pub fn get_str(doc: &[u8], path: &str) -> Result<Option<String>, TransformError> {
    let text = as_text(doc, path)?;
    match resolve(text, path)? {
        Slot::Found(span) => decode_string(&text[span], path).map(Some),
        _ => Ok(None),
    }
}

/// Replaces (or inserts) the value at `path` with raw JSON `value`.
///
/// Missing intermediate objects are created. Walking through a scalar or
/// past the end of an array is `MalformedInput`.
pub fn set_raw(doc: &[u8], path: &str, value: &[u8]) -> Result<Vec<u8>, TransformError> {
    let text = as_text(doc, path)?;
    match resolve(text, path)? {
        Slot::Found(span) => Ok(splice(doc, vec![(span, value.to_vec())])),
        Slot::Null { span, rest } => Ok(splice(doc, vec![(span, nest(&rest, value)?)])),
        Slot::Missing { object, rest } => {
            let (key, deeper) = rest
                .split_first()
                .ok_or_else(|| TransformError::malformed(path, "empty path"))?;
            let member = [encode_string(key)?, b":".to_vec(), nest(deeper, value)?].concat();
            let entries = members(text, object.clone(), path)?;
            let edit = match entries.last() {
                Some(last) => (last.value.end..last.value.end, [b",".as_slice(), &member].concat()),
                None => (object.start + 1..object.start + 1, member),
            };
            Ok(splice(doc, vec![edit]))
        }
        Slot::Blocked(reason) => Err(TransformError::malformed(path, reason)),
    }
}

/// Replaces (or inserts) the string at `path`.
pub fn set_string(doc: &[u8], path: &str, value: &str) -> Result<Vec<u8>, TransformError> {
    set_raw(doc, path, &encode_string(value)?)
}

/// Rewrites the string leaf at `path` with `f`. Absent leaves are left alone.
pub fn string<F>(doc: &[u8], path: &str, f: F) -> TransformResult
where
    F: FnOnce(&str) -> Option<String>,
{
    let text = as_text(doc, path)?;
    let Slot::Found(span) = resolve(text, path)? else {
        return Ok(None);
    };
    let current = decode_string(&text[span.clone()], path)?;
    match f(&current) {
        Some(next) if next != current => Ok(Some(splice(doc, vec![(span, encode_string(&next)?)]))),
        _ => Ok(None),
    }
}

/// Rewrites the object at `path` by handing its raw bytes to `f`.
pub fn object<F>(doc: &[u8], path: &str, f: F) -> TransformResult
where
    F: FnOnce(&[u8]) -> TransformResult,
{
    let text = as_text(doc, path)?;
    let Slot::Found(span) = resolve(text, path)? else {
        return Ok(None);
    };
    expect_kind(text, &span, b'{', path, "expected an object")?;
    Ok(f(&doc[span.clone()])?.map(|next| splice(doc, vec![(span, next)])))
}

/// Rewrites every key/value pair of the string map at `path`.
///
/// `f` gets the key and the value and returns the replacement pair, or `None`
/// to keep it. A `null` value (a deletion in a merge patch) is passed as `""`
/// and stays `null`; only its key is rewritten.
pub fn map_string_string<F>(doc: &[u8], path: &str, mut f: F) -> TransformResult
where
    F: FnMut(&str, &str) -> Option<(String, String)>,
{
    let text = as_text(doc, path)?;
    let Slot::Found(span) = resolve(text, path)? else {
        return Ok(None);
    };
    expect_kind(text, &span, b'{', path, "expected a map of strings")?;

    let mut edits = Vec::new();
    for member in members(text, span, path)? {
        let raw = &text[member.value.clone()];
        let value = if raw.starts_with('n') {
            None
        } else {
            Some(decode_string(raw, path)?)
        };
        let Some((key, next)) = f(&member.key, value.as_deref().unwrap_or_default()) else {
            continue;
        };
        if key != member.key {
            edits.push((member.key_span, encode_string(&key)?));
        }
        if let Some(value) = value
            && next != value
        {
            edits.push((member.value, encode_string(&next)?));
        }
    }
    Ok(if edits.is_empty() { None } else { Some(splice(doc, edits)) })
}

/// Rewrites each element of the array at `path`.
///
/// Elements for which `f` returns `None` are kept as is. Order and length
/// never change.
pub fn array<F>(doc: &[u8], path: &str, mut f: F) -> TransformResult
where
    F: FnMut(&[u8]) -> TransformResult,
{
    let text = as_text(doc, path)?;
    let Slot::Found(span) = resolve(text, path)? else {
        return Ok(None);
    };
    expect_kind(text, &span, b'[', path, "expected an array")?;

    let mut edits = Vec::new();
    for element in elements(text, span, path)? {
        if let Some(next) = f(&doc[element.clone()])? {
            edits.push((element, next));
        }
    }
    Ok(if edits.is_empty() { None } else { Some(splice(doc, edits)) })
}

/// Rewrites each element of the array of strings at `path`.
pub fn array_of_strings<F>(doc: &[u8], path: &str, mut f: F) -> TransformResult
where
    F: FnMut(&str) -> Option<String>,
{
    array(doc, path, |element| {
        let current = decode_string(as_text(element, path)?, path)?;
        match f(&current) {
            Some(next) if next != current => encode_string(&next).map(Some),
            _ => Ok(None),
        }
    })
}

/// Runs `steps` left to right, feeding each the previous output.
///
/// The first error aborts the whole chain.
pub fn apply(doc: &[u8], steps: &[&Step<'_>]) -> TransformResult {
    let mut current: Option<Vec<u8>> = None;
    for step in steps {
        if let Some(next) = step(current.as_deref().unwrap_or(doc))? {
            current = Some(next);
        }
    }
    Ok(current)
}

/// An ordered list of named edit steps.
///
/// Like [`apply`], but each step carries a name that is logged when the step
/// fails, which makes a failing rewrite traceable to the field it touched.
#[derive(Default)]
pub struct Pipeline<'a> {
    steps: Vec<(&'static str, Box<Step<'a>>)>,
}

impl<'a> Pipeline<'a> {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Appends a named step.
    #[must_use]
    pub fn step<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&[u8]) -> TransformResult + 'a,
    {
        self.steps.push((name, Box::new(f)));
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no steps were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps in order. The first failing step's error is returned
    /// unchanged and no partial output escapes.
    pub fn run(&self, doc: &[u8]) -> TransformResult {
        let mut current: Option<Vec<u8>> = None;
        for (name, step) in &self.steps {
            match step(current.as_deref().unwrap_or(doc)) {
                Ok(Some(next)) => current = Some(next),
                Ok(None) => {}
                Err(err) => {
                    debug!(step = name, error = %err, "transform step failed");
                    return Err(err);
                }
            }
        }
        Ok(current)
    }
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Where a path lands inside a document.
enum Slot {
    /// Existing, non-null value.
    Found(Range<usize>),
    /// The object at `object` has no member named `rest[0]`.
    Missing { object: Range<usize>, rest: Vec<String> },
    /// A `null` sits at `span`; `rest` are the segments below it.
    Null { span: Range<usize>, rest: Vec<String> },
    /// Walked into a scalar or past the end of an array.
    Blocked(String),
}

struct Member {
    key: String,
    key_span: Range<usize>,
    value: Range<usize>,
}

fn resolve(text: &str, path: &str) -> Result<Slot, TransformError> {
    let root: &RawValue = serde_json::from_str(text)
        .map_err(|err| TransformError::malformed(path, format!("invalid JSON: {err}")))?;
    let mut span = subspan(text, root.get());

    let segments: Vec<&str> = if path == ROOT || path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    };
    let rest = |from: usize| -> Vec<String> { segments[from..].iter().map(ToString::to_string).collect() };

    if is_null(text, &span) {
        return Ok(Slot::Null { span, rest: rest(0) });
    }

    for (i, segment) in segments.iter().enumerate() {
        let next = match text.as_bytes()[span.start] {
            b'{' => {
                let found = members(text, span.clone(), path)?
                    .into_iter()
                    .rev()
                    .find(|member| member.key == *segment);
                match found {
                    Some(member) => member.value,
                    None => return Ok(Slot::Missing { object: span, rest: rest(i) }),
                }
            }
            b'[' => {
                let index = segment.parse::<usize>().ok();
                let items = elements(text, span.clone(), path)?;
                match index.and_then(|index| items.get(index)) {
                    Some(item) => item.clone(),
                    None => return Ok(Slot::Blocked(format!("no element '{segment}' in array"))),
                }
            }
            _ => return Ok(Slot::Blocked(format!("cannot descend into scalar at '{segment}'"))),
        };
        if is_null(text, &next) {
            return Ok(Slot::Null { span: next, rest: rest(i + 1) });
        }
        span = next;
    }
    Ok(Slot::Found(span))
}

struct Entries<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for Entries<'de> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries<'de>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, &'de RawValue>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn members(text: &str, span: Range<usize>, path: &str) -> Result<Vec<Member>, TransformError> {
    let object = &text[span.clone()];
    let Entries(entries) = serde_json::from_str(object)
        .map_err(|err| TransformError::malformed(path, format!("invalid object: {err}")))?;

    let bytes = text.as_bytes();
    let mut cursor = span.start + 1;
    let mut out = Vec::with_capacity(entries.len());
    for (key, raw) in entries {
        let key_span = scan_key(bytes, cursor)
            .ok_or_else(|| TransformError::malformed(path, format!("cannot locate key '{key}'")))?;
        let value = subspan(text, raw.get());
        cursor = value.end;
        out.push(Member { key, key_span, value });
    }
    Ok(out)
}

fn elements(text: &str, span: Range<usize>, path: &str) -> Result<Vec<Range<usize>>, TransformError> {
    let items: Vec<&RawValue> = serde_json::from_str(&text[span])
        .map_err(|err| TransformError::malformed(path, format!("invalid array: {err}")))?;
    Ok(items.iter().map(|item| subspan(text, item.get())).collect())
}

/// Finds the quoted key that starts after `at`, skipping whitespace and the
/// separating comma.
fn scan_key(bytes: &[u8], mut at: usize) -> Option<Range<usize>> {
    while at < bytes.len() && (bytes[at].is_ascii_whitespace() || bytes[at] == b',') {
        at += 1;
    }
    if bytes.get(at) != Some(&b'"') {
        return None;
    }
    let start = at;
    at += 1;
    while at < bytes.len() {
        match bytes[at] {
            b'\\' => at += 2,
            b'"' => return Some(start..at + 1),
            _ => at += 1,
        }
    }
    None
}

/// Byte range of `part` inside `whole`. `part` must borrow from `whole`.
fn subspan(whole: &str, part: &str) -> Range<usize> {
    let start = part.as_ptr() as usize - whole.as_ptr() as usize;
    start..start + part.len()
}

fn is_null(text: &str, span: &Range<usize>) -> bool {
    &text[span.clone()] == "null"
}

fn expect_kind(
    text: &str,
    span: &Range<usize>,
    first: u8,
    path: &str,
    reason: &str,
) -> Result<(), TransformError> {
    if text.as_bytes()[span.start] == first {
        Ok(())
    } else {
        Err(TransformError::malformed(path, reason))
    }
}

fn as_text<'a>(doc: &'a [u8], path: &str) -> Result<&'a str, TransformError> {
    std::str::from_utf8(doc).map_err(|err| TransformError::malformed(path, format!("invalid UTF-8: {err}")))
}

fn decode_string(raw: &str, path: &str) -> Result<String, TransformError> {
    if !raw.starts_with('"') {
        return Err(TransformError::malformed(path, "expected a string"));
    }
    serde_json::from_str(raw).map_err(|err| TransformError::malformed(path, err.to_string()))
}

fn encode_string(value: &str) -> Result<Vec<u8>, TransformError> {
    serde_json::to_vec(value).map_err(|err| TransformError::Encoding(err.to_string()))
}

/// Wraps `value` in one object per segment: `["a", "b"]` -> `{"a":{"b":value}}`.
fn nest(segments: &[String], value: &[u8]) -> Result<Vec<u8>, TransformError> {
    let mut out = value.to_vec();
    for segment in segments.iter().rev() {
        out = [b"{".as_slice(), &encode_string(segment)?, b":", &out, b"}"].concat();
    }
    Ok(out)
}

/// Applies ascending, non-overlapping edits in one pass.
fn splice(doc: &[u8], edits: Vec<(Range<usize>, Vec<u8>)>) -> Vec<u8> {
    let mut out = Vec::with_capacity(doc.len() + 64);
    let mut cursor = 0;
    for (span, replacement) in edits {
        out.extend_from_slice(&doc[cursor..span.start]);
        out.extend_from_slice(&replacement);
        cursor = span.end;
    }
    out.extend_from_slice(&doc[cursor..]);
    out
}
