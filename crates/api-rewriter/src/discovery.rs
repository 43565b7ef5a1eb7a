//! Discovery documents.
//!
//! The API server lists renamed groups and resources in its discovery
//! responses. Restoring them lets original-schema clients find their
//! resources under the names they asked for:
//!
//! - `APIGroupList` (`/apis`): every group entry
//! - `APIGroup` (`/apis/GROUP`): `name`, `versions[].groupVersion` and
//!   `preferredVersion`
//! - `APIResourceList` (`/apis/GROUP/VERSION`): `groupVersion` and the name,
//!   kind, singular name, short names and categories of each resource
//!
//! Aggregated discovery (`APIGroupDiscoveryList`) is not rewritten. Callers
//! ask for the legacy documents instead.

use std::borrow::Cow;

use crate::error::{RewriteError, TransformError};
use crate::rewriter::{Rewriter, finish};
use crate::rules::Direction;
use crate::transform::{self, Pipeline, TransformResult};

/// Kind of the `/apis` document.
pub const API_GROUP_LIST_KIND: &str = "APIGroupList";
/// Kind of the `/apis/GROUP` document.
pub const API_GROUP_KIND: &str = "APIGroup";
/// Kind of the `/apis/GROUP/VERSION` document.
pub const API_RESOURCE_LIST_KIND: &str = "APIResourceList";

impl Rewriter {
    /// Rewrites a legacy discovery document. Any other body, and documents
    /// about unruled groups, come back borrowed.
    pub fn rewrite_discovery<'a>(&self, body: &'a [u8], direction: Direction) -> Result<Cow<'a, [u8]>, RewriteError> {
        let rewritten = match transform::get_str(body, "kind")?.as_deref() {
            Some(API_GROUP_LIST_KIND) => transform::array(body, "groups", |group| self.api_group(group, direction))?,
            Some(API_GROUP_KIND) => self.api_group(body, direction)?,
            Some(API_RESOURCE_LIST_KIND) => self.api_resource_list(body, direction)?,
            _ => None,
        };
        Ok(finish(body, rewritten))
    }

    /// Rewrites one `APIGroup` object.
    pub fn api_group(&self, doc: &[u8], direction: Direction) -> TransformResult {
        let Some(name) = transform::get_str(doc, "name")? else {
            return Ok(None);
        };
        if !self.rules().has_group(&name, direction) {
            return Ok(None);
        }

        let group_version = |d: &[u8]| {
            transform::string(d, "groupVersion", |gv| self.rules().map_api_version(gv, direction))
        };
        Pipeline::new()
            .step("name", |d| {
                transform::string(d, "name", |group| {
                    self.rules().map_group(group, direction).map(str::to_string)
                })
            })
            .step("versions", |d| transform::array(d, "versions", &group_version))
            .step("preferredVersion", |d| transform::object(d, "preferredVersion", &group_version))
            .run(doc)
    }

    /// Rewrites an `APIResourceList` for a ruled group.
    pub fn api_resource_list(&self, doc: &[u8], direction: Direction) -> TransformResult {
        let Some(group_version) = transform::get_str(doc, "groupVersion")? else {
            return Ok(None);
        };
        let Some((group, _)) = group_version.split_once('/') else {
            return Ok(None);
        };
        if !self.rules().has_group(group, direction) {
            return Ok(None);
        }

        Pipeline::new()
            .step("groupVersion", |d| {
                transform::string(d, "groupVersion", |gv| self.rules().map_api_version(gv, direction))
            })
            .step("resources", |d| {
                transform::array(d, "resources", |resource| self.api_resource(resource, group, direction))
            })
            .run(doc)
    }

    fn api_resource(&self, doc: &[u8], group: &str, direction: Direction) -> TransformResult {
        let Some(name) = transform::get_str(doc, "name")? else {
            return Ok(None);
        };
        let (plural, subresource) = match name.split_once('/') {
            Some((plural, sub)) => (plural, Some(sub)),
            None => (name.as_str(), None),
        };
        let Some(rule) = self
            .rules()
            .rule_for_resource(plural, direction)
            .filter(|rule| rule.source(direction).group == group)
        else {
            return Ok(None);
        };
        let (source, target) = (rule.source(direction), rule.target(direction));
        let new_name = match subresource {
            Some(sub) => format!("{}/{sub}", target.resource),
            None => target.resource.clone(),
        };

        Pipeline::new()
            .step("name", |d| transform::string(d, "name", |_| Some(new_name.clone())))
            .step("kind", |d| {
                transform::string(d, "kind", |kind| rule.map_kind(kind, direction).map(str::to_string))
            })
            .step("singularName", |d| {
                transform::string(d, "singularName", |singular| {
                    (!singular.is_empty() && singular == source.singular).then(|| target.singular.clone())
                })
            })
            .step("shortNames", |d| {
                transform::array_of_strings(d, "shortNames", |short| {
                    let index = source.short_names.iter().position(|s| s == short)?;
                    target.short_names.get(index).cloned()
                })
            })
            .step("categories", |d| {
                let Some(raw) = transform::get(d, "categories")? else {
                    return Ok(None);
                };
                let current: Vec<String> = serde_json::from_slice(raw)
                    .map_err(|e| TransformError::malformed("categories", e.to_string()))?;
                if current != source.categories || current == target.categories {
                    return Ok(None);
                }
                let categories = serde_json::to_vec(&target.categories)
                    .map_err(|e| TransformError::Encoding(e.to_string()))?;
                transform::set_raw(d, "categories", &categories).map(Some)
            })
            .run(doc)
    }
}
