//! Kubernetes API paths.
//!
//! Recognized layouts:
//!
//! - `/api/VERSION/RESOURCE[/NAME[/SUBRESOURCE]]`
//! - `/api/VERSION/namespaces/NAMESPACE/RESOURCE[/NAME[/SUBRESOURCE]]`
//! - `/api/VERSION/namespaces/NAME/{status,finalize}`
//! - `/apis/GROUP/VERSION/RESOURCE[/NAME[/SUBRESOURCE]]`
//! - `/apis/GROUP/VERSION/namespaces/NAMESPACE/RESOURCE[/NAME[/SUBRESOURCE]]`
//!
//! Shorter prefixes (`/api`, `/apis/GROUP`, ...) parse with empty trailing
//! parts. Anything else is not an API endpoint.

use url::form_urlencoded;

use crate::names::PrefixedNameRewriter;
use crate::rewriter::Rewriter;
use crate::rules::Direction;

const CORE_PREFIX: &str = "api";
const APIS_PREFIX: &str = "apis";
const NAMESPACES: &str = "namespaces";
const LABEL_SELECTOR: &str = "labelSelector";

/// A parsed API request path and its query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// `true` for `/api/...` (the core group)
    pub core: bool,
    pub group: String,
    pub version: String,
    pub namespace: String,
    /// Plural resource name
    pub resource: String,
    pub name: String,
    pub subresource: String,
    /// Path segments after the subresource
    pub remainder: Vec<String>,
    /// Raw query string without `?`
    pub query: String,
}

impl ApiEndpoint {
    /// Parses `path` and `query`. Returns `None` for paths outside `/api`
    /// and `/apis`.
    #[must_use]
    pub fn parse(path: &str, query: Option<&str>) -> Option<Self> {
        let mut parts = path.trim_matches('/').split('/').filter(|part| !part.is_empty());
        let mut endpoint = Self {
            query: query.unwrap_or_default().to_string(),
            ..Default::default()
        };
        match parts.next()? {
            CORE_PREFIX => endpoint.core = true,
            APIS_PREFIX => endpoint.group = parts.next().unwrap_or_default().to_string(),
            _ => return None,
        }

        let mut next = || parts.next().map(str::to_string).unwrap_or_default();
        endpoint.version = next();
        endpoint.resource = next();
        endpoint.name = next();
        endpoint.subresource = next();

        if endpoint.resource == NAMESPACES && !endpoint.subresource.is_empty() {
            let namespace_subresource =
                endpoint.core && matches!(endpoint.subresource.as_str(), "status" | "finalize");
            if !namespace_subresource {
                endpoint.namespace = std::mem::take(&mut endpoint.name);
                endpoint.resource = std::mem::take(&mut endpoint.subresource);
                endpoint.name = next();
                endpoint.subresource = next();
            }
        }
        endpoint.remainder = parts.map(str::to_string).collect();
        Some(endpoint)
    }

    /// `resource` or `resource/subresource`, the way rules look it up.
    #[must_use]
    pub fn resource_type(&self) -> String {
        if self.subresource.is_empty() {
            self.resource.clone()
        } else {
            format!("{}/{}", self.resource, self.subresource)
        }
    }

    /// True for `watch=true` or `watch=1` requests.
    #[must_use]
    pub fn is_watch(&self) -> bool {
        is_watch_query(&self.query)
    }

    /// Rebuilds the path.
    #[must_use]
    pub fn path(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(8 + self.remainder.len());
        if self.core {
            parts.push(CORE_PREFIX);
        } else {
            parts.extend([APIS_PREFIX, self.group.as_str()]);
        }
        parts.push(&self.version);
        if !self.namespace.is_empty() {
            parts.extend([NAMESPACES, self.namespace.as_str()]);
        }
        parts.extend([self.resource.as_str(), self.name.as_str(), self.subresource.as_str()]);
        parts.extend(self.remainder.iter().map(String::as_str));

        parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .fold(String::new(), |mut path, part| {
                path.push('/');
                path.push_str(part);
                path
            })
    }

    /// Path plus `?query` when there is one.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path()
        } else {
            format!("{}?{}", self.path(), self.query)
        }
    }
}

/// True when the query asks for a watch stream.
#[must_use]
pub fn is_watch_query(query: &str) -> bool {
    form_urlencoded::parse(query.as_bytes()).any(|(key, value)| key == "watch" && (value == "true" || value == "1"))
}

impl Rewriter {
    /// Rewrites `endpoint` toward `direction`. Returns `None` when nothing
    /// changes.
    ///
    /// Paths in a ruled group move to the target group, which covers the
    /// group's discovery paths too. Ruled resources also get their plural and
    /// their `labelSelector` rewritten. Selectors on other resources are left
    /// alone, since their bodies, and so their stored labels, are too.
    #[must_use]
    pub fn rewrite_endpoint(&self, endpoint: &ApiEndpoint, direction: Direction) -> Option<ApiEndpoint> {
        if endpoint.core {
            return None;
        }
        let group = self.rules().map_group(&endpoint.group, direction)?;
        let mut out = endpoint.clone();
        out.group = group.to_string();

        if let Some(rule) = self
            .rules()
            .rule_for_resource(&endpoint.resource, direction)
            .filter(|rule| rule.source(direction).group == endpoint.group)
        {
            out.resource = rule.target(direction).resource.clone();
            if let Some(query) = self.rewrite_label_selector(&endpoint.query, direction) {
                out.query = query;
            }
        }

        (out != *endpoint).then_some(out)
    }

    /// Rewrites label names and values inside the `labelSelector` parameter
    /// of a raw query. Returns `None` when the selector is absent or
    /// unchanged.
    #[must_use]
    pub fn rewrite_label_selector(&self, query: &str, direction: Direction) -> Option<String> {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let (_, selector) = pairs.iter_mut().find(|(key, _)| key == LABEL_SELECTOR)?;
        *selector = rewrite_selector(selector, self.rules().labels(), direction)?;

        Some(form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish())
    }
}

/// Rewrites every requirement of a label selector. Unchanged requirements
/// keep their exact text.
fn rewrite_selector(selector: &str, labels: &PrefixedNameRewriter, direction: Direction) -> Option<String> {
    let requirements = split_requirements(selector);
    let mut changed = false;
    let rewritten: Vec<String> = requirements
        .iter()
        .map(|requirement| match rewrite_requirement(requirement, labels, direction) {
            Some(next) => {
                changed = true;
                next
            }
            None => (*requirement).to_string(),
        })
        .collect();
    changed.then(|| rewritten.join(","))
}

/// Splits on commas outside of `( )`.
fn split_requirements(selector: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&selector[start..]);
    out
}

fn rewrite_requirement(requirement: &str, labels: &PrefixedNameRewriter, direction: Direction) -> Option<String> {
    let requirement = requirement.trim();
    if requirement.is_empty() {
        return None;
    }

    if let Some(key) = requirement.strip_prefix('!') {
        let key = key.trim();
        let name = labels.rewrite_name(key, direction);
        return (name != key).then(|| format!("!{name}"));
    }

    if let (Some(open), Some(close)) = (requirement.find('('), requirement.rfind(')')) {
        let mut head = requirement[..open].split_whitespace();
        let (Some(key), Some(op)) = (head.next(), head.next()) else {
            return None;
        };
        let values: Vec<String> = requirement[open + 1..close]
            .split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        let (name, new_values) = labels.rewrite_name_values(key, &values, direction);
        if name == key && new_values == values {
            return None;
        }
        return Some(format!("{name} {op} ({})", new_values.join(",")));
    }

    for op in ["!=", "==", "=", ">", "<"] {
        if let Some((key, value)) = requirement.split_once(op) {
            let (key, value) = (key.trim(), value.trim());
            let (name, new_value) = if matches!(op, ">" | "<") {
                (labels.rewrite_name(key, direction), value.to_string())
            } else {
                labels.rewrite(key, value, direction)
            };
            if name == key && new_value == value {
                return None;
            }
            return Some(format!("{name}{op}{new_value}"));
        }
    }

    let name = labels.rewrite_name(requirement, direction);
    (name != requirement).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("/api/v1/pods", "", "", "pods", "", "")]
    #[case("/api/v1/namespaces/default/pods/p1/log", "", "default", "pods", "p1", "log")]
    #[case("/api/v1/namespaces/default", "", "", "namespaces", "default", "")]
    #[case("/api/v1/namespaces/default/status", "", "", "namespaces", "default", "status")]
    #[case("/apis/example.io/v1/widgets", "example.io", "", "widgets", "", "")]
    #[case("/apis/example.io/v1/namespaces/ns/widgets/w/status", "example.io", "ns", "widgets", "w", "status")]
    #[case("/apis/example.io/v1/namespaces/ns/widgets", "example.io", "ns", "widgets", "", "")]
    #[case("/apis/example.io", "example.io", "", "", "", "")]
    fn test_parse(
        #[case] path: &str,
        #[case] group: &str,
        #[case] namespace: &str,
        #[case] resource: &str,
        #[case] name: &str,
        #[case] subresource: &str,
    ) {
        let endpoint = ApiEndpoint::parse(path, None).unwrap();
        assert_eq!(
            (
                endpoint.group.as_str(),
                endpoint.namespace.as_str(),
                endpoint.resource.as_str(),
                endpoint.name.as_str(),
                endpoint.subresource.as_str()
            ),
            (group, namespace, resource, name, subresource)
        );
        assert_eq!(endpoint.path(), path);
    }

    #[test]
    fn test_parse_rejects_other_paths() {
        assert_eq!(ApiEndpoint::parse("/healthz", None), None);
        assert_eq!(ApiEndpoint::parse("/", None), None);
        assert_eq!(ApiEndpoint::parse("/widgets-validate", None), None);
    }

    #[rstest]
    #[case("watch=true", true)]
    #[case("labelSelector=a&watch=1", true)]
    #[case("watch=false", false)]
    #[case("resourceVersion=5", false)]
    fn test_watch(#[case] query: &str, #[case] watch: bool) {
        let endpoint = ApiEndpoint::parse("/api/v1/pods", Some(query)).unwrap();
        assert_eq!(endpoint.is_watch(), watch);
    }

    #[test]
    fn test_rewrite_endpoint() {
        let rewriter = widget_rewriter();
        let endpoint = ApiEndpoint::parse("/apis/example.io/v1/namespaces/ns/widgets/w/status", Some("timeout=5s")).unwrap();
        let renamed = rewriter.rewrite_endpoint(&endpoint, Direction::ToRenamed).unwrap();
        assert_eq!(
            renamed.path_and_query(),
            "/apis/internal.example.io/v1/namespaces/ns/prefixedwidgets/w/status?timeout=5s"
        );
        assert_eq!(renamed.resource_type(), "prefixedwidgets/status");

        let restored = rewriter.rewrite_endpoint(&renamed, Direction::ToOriginal).unwrap();
        assert_eq!(restored, endpoint);

        let pods = ApiEndpoint::parse("/api/v1/pods", None).unwrap();
        assert_eq!(rewriter.rewrite_endpoint(&pods, Direction::ToRenamed), None);
    }

    #[test]
    fn test_selector_follows_the_resource_rule() {
        let rewriter = widget_rewriter();
        let query = Some("labelSelector=example.io%2Frole%3Ddb");

        let pods = ApiEndpoint::parse("/api/v1/namespaces/ns/pods", query).unwrap();
        assert_eq!(rewriter.rewrite_endpoint(&pods, Direction::ToRenamed), None);

        let gadgets = ApiEndpoint::parse("/apis/example.io/v1/gadgets", query).unwrap();
        assert_eq!(
            rewriter.rewrite_endpoint(&gadgets, Direction::ToRenamed).unwrap().path_and_query(),
            "/apis/internal.example.io/v1/gadgets?labelSelector=example.io%2Frole%3Ddb"
        );

        let widgets = ApiEndpoint::parse("/apis/example.io/v1/widgets", query).unwrap();
        assert_eq!(
            rewriter.rewrite_endpoint(&widgets, Direction::ToRenamed).unwrap().path_and_query(),
            "/apis/internal.example.io/v1/prefixedwidgets?labelSelector=internal.example.io%2Frole%3Ddb"
        );
    }

    #[rstest]
    #[case("/apis/example.io", "/apis/internal.example.io")]
    #[case("/apis/example.io/v1", "/apis/internal.example.io/v1")]
    fn test_discovery_paths_move_with_the_group(#[case] path: &str, #[case] renamed: &str) {
        let rewriter = widget_rewriter();
        let endpoint = ApiEndpoint::parse(path, None).unwrap();
        assert_eq!(
            rewriter.rewrite_endpoint(&endpoint, Direction::ToRenamed).unwrap().path(),
            renamed
        );
    }

    #[rstest]
    #[case("example.io/role=db", Some("internal.example.io/role=db"))]
    #[case("example.io/role!=db,app=x", Some("internal.example.io/role!=db,app=x"))]
    #[case("example.io/role in (a,b),!example.io/gone", Some("internal.example.io/role in (a,b),!internal.example.io/gone"))]
    #[case("example.io/present", Some("internal.example.io/present"))]
    #[case("app=x", None)]
    #[case("", None)]
    fn test_selector(#[case] selector: &str, #[case] expected: Option<&str>) {
        let rewriter = widget_rewriter();
        let out = rewrite_selector(selector, rewriter.rules().labels(), Direction::ToRenamed);
        assert_eq!(out.as_deref(), expected);
    }

    #[test]
    fn test_label_selector_query() {
        let rewriter = widget_rewriter();
        let query = "limit=500&labelSelector=example.io%2Frole%3Ddb";
        assert_eq!(
            rewriter.rewrite_label_selector(query, Direction::ToRenamed).as_deref(),
            Some("limit=500&labelSelector=internal.example.io%2Frole%3Ddb")
        );
        assert_eq!(rewriter.rewrite_label_selector("limit=500", Direction::ToRenamed), None);
    }
}
