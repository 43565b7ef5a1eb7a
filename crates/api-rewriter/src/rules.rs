//! Rewrite rules and the immutable rule table.
//!
//! A rule file lists API groups of the original schema with their resources.
//! Renamed identities are derived from the table-wide prefixes: a kind
//! becomes `kindPrefix + Kind`, a plural becomes `resourceTypePrefix + plural`,
//! and each group carries its own `renamed` group name.
//!
//! [`RuleTable::new`] indexes both sides and rejects any rule set that would
//! make the mapping ambiguous in either direction.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RulesError;
use crate::names::PrefixedNameRewriter;

/// Rule set bundled with the binary.
pub const BUNDLED_RULES: &str = include_str!("../rules/kubevirt.yaml");

/// Which way names are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Original schema to renamed schema
    ToRenamed,
    /// Renamed schema back to original schema
    ToOriginal,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::ToRenamed => Self::ToOriginal,
            Self::ToOriginal => Self::ToRenamed,
        }
    }

    fn source(self) -> usize {
        match self {
            Self::ToRenamed => ORIGINAL,
            Self::ToOriginal => RENAMED,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ToRenamed => "rename",
            Self::ToOriginal => "restore",
        })
    }
}

const ORIGINAL: usize = 0;
const RENAMED: usize = 1;

/// Top-level rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRules {
    /// Prepended to every kind and list kind
    #[serde(default)]
    pub kind_prefix: String,
    /// Prepended to every plural and singular resource name
    #[serde(default)]
    pub resource_type_prefix: String,
    /// Prepended to every short name
    #[serde(default)]
    pub short_name_prefix: String,
    /// Categories the renamed resources are listed in
    #[serde(default)]
    pub categories: Vec<String>,
    /// Rules keyed by original API group
    #[serde(default)]
    pub rules: BTreeMap<String, ApiGroupRule>,
    /// Admission webhook paths served by the original-schema backend
    #[serde(default)]
    pub webhooks: BTreeMap<String, WebhookRule>,
    /// Label name rules
    #[serde(default)]
    pub labels: MetadataReplace,
    /// Annotation name rules
    #[serde(default)]
    pub annotations: MetadataReplace,
    /// Finalizer name rules
    #[serde(default)]
    pub finalizers: MetadataReplace,
}

/// One API group and its resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroupRule {
    /// Group naming
    pub group_rule: GroupRule,
    /// Resources keyed by original plural
    #[serde(default)]
    pub resource_rules: BTreeMap<String, ResourceRule>,
}

/// Original and renamed group names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRule {
    /// Original group
    pub group: String,
    /// Served versions
    #[serde(default)]
    pub versions: Vec<String>,
    /// Preferred version
    #[serde(default)]
    pub preferred_version: String,
    /// Renamed group
    pub renamed: String,
}

/// Original names of one resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    /// Kind, e.g. `VirtualMachine`
    pub kind: String,
    /// List kind, defaults to `<kind>List`
    #[serde(default)]
    pub list_kind: String,
    /// Plural resource name
    pub plural: String,
    /// Singular resource name
    #[serde(default)]
    pub singular: String,
    /// Short names
    #[serde(default)]
    pub short_names: Vec<String>,
    /// Categories
    #[serde(default)]
    pub categories: Vec<String>,
    /// Served versions
    #[serde(default)]
    pub versions: Vec<String>,
    /// Preferred version
    #[serde(default)]
    pub preferred_version: String,
    /// Dotted paths of nested references (objects, or arrays of objects,
    /// with `apiVersion`/`apiGroup` and `kind`)
    #[serde(default)]
    pub references: Vec<String>,
    /// Dotted paths of embedded object templates whose `metadata` is
    /// rewritten like the resource's own
    #[serde(default)]
    pub templates: Vec<String>,
}

/// Webhook served by the original-schema backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRule {
    /// Request path
    pub path: String,
    /// Original group of the reviewed resource
    pub group: String,
    /// Original plural of the reviewed resource, may list several
    /// comma-separated `plural[/subresource]` entries
    pub resource: String,
}

impl WebhookRule {
    /// First plural named by the rule, without subresource.
    #[must_use]
    pub fn primary_resource(&self) -> &str {
        let first = self.resource.split(',').next().unwrap_or_default();
        first.split('/').next().unwrap_or_default().trim()
    }
}

/// Name and prefix rules for one kind of prefixed name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataReplace {
    /// Prefixes (the part before `/`)
    #[serde(default)]
    pub prefixes: Vec<MetadataReplaceRule>,
    /// Exact names, optionally with exact values
    #[serde(default)]
    pub names: Vec<MetadataReplaceRule>,
}

/// One prefix or name rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataReplaceRule {
    /// Original name or prefix
    pub original: String,
    /// Renamed name or prefix
    pub renamed: String,
    /// Original value, for name+value rules
    #[serde(default)]
    pub original_value: String,
    /// Renamed value, for name+value rules
    #[serde(default)]
    pub renamed_value: String,
}

/// Identity of a resource as seen on one side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub resource: String,
}

/// Names of a resource on one side of a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceNames {
    /// API group
    pub group: String,
    /// Kind
    pub kind: String,
    /// List kind
    pub list_kind: String,
    /// Plural
    pub resource: String,
    /// Singular
    pub singular: String,
    /// Short names
    pub short_names: Vec<String>,
    /// Discovery categories
    pub categories: Vec<String>,
}

/// One original/renamed resource pair.
#[derive(Debug, Clone)]
pub struct Rule {
    sides: [ResourceNames; 2],
    /// Nested reference paths declared for this resource
    pub references: Vec<String>,
    /// Embedded template paths declared for this resource
    pub templates: Vec<String>,
}

impl Rule {
    /// Names on the side the `direction` reads from.
    #[must_use]
    pub fn source(&self, direction: Direction) -> &ResourceNames {
        &self.sides[direction.source()]
    }

    /// Names on the side the `direction` writes to.
    #[must_use]
    pub fn target(&self, direction: Direction) -> &ResourceNames {
        &self.sides[direction.inverse().source()]
    }

    /// Original names.
    #[must_use]
    pub fn original(&self) -> &ResourceNames {
        &self.sides[ORIGINAL]
    }

    /// Renamed names.
    #[must_use]
    pub fn renamed(&self) -> &ResourceNames {
        &self.sides[RENAMED]
    }

    /// Maps `kind` (a kind or list kind on the source side) to the target side.
    #[must_use]
    pub fn map_kind(&self, kind: &str, direction: Direction) -> Option<&str> {
        let (source, target) = (self.source(direction), self.target(direction));
        if kind == source.kind {
            Some(&target.kind)
        } else if kind == source.list_kind {
            Some(&target.list_kind)
        } else {
            None
        }
    }
}

/// Validated, immutable index over a [`RewriteRules`] set.
///
/// Built once at startup and shared read-only between proxies.
#[derive(Debug)]
pub struct RuleTable {
    rules: Vec<Rule>,
    by_resource: [HashMap<String, usize>; 2],
    by_kind: [HashMap<String, usize>; 2],
    groups: [HashMap<String, String>; 2],
    webhooks: HashMap<String, WebhookRule>,
    labels: PrefixedNameRewriter,
    annotations: PrefixedNameRewriter,
    finalizers: PrefixedNameRewriter,
    source: RewriteRules,
}

impl RuleTable {
    /// Validates and indexes `rules`.
    pub fn new(rules: RewriteRules) -> Result<Self, RulesError> {
        let mut table = Self {
            rules: Vec::new(),
            by_resource: [HashMap::new(), HashMap::new()],
            by_kind: [HashMap::new(), HashMap::new()],
            groups: [HashMap::new(), HashMap::new()],
            webhooks: HashMap::new(),
            labels: PrefixedNameRewriter::new("labels", &rules.labels)?,
            annotations: PrefixedNameRewriter::new("annotations", &rules.annotations)?,
            finalizers: PrefixedNameRewriter::new("finalizers", &rules.finalizers)?,
            source: RewriteRules::default(),
        };

        for (key, api_group) in &rules.rules {
            let group = &api_group.group_rule;
            if group.group != *key {
                return Err(RulesError::Invalid(format!(
                    "group key '{key}' does not match groupRule.group '{}'",
                    group.group
                )));
            }
            if group.renamed.is_empty() {
                return Err(RulesError::Invalid(format!("group '{key}' has no renamed group")));
            }
            insert_unique(&mut table.groups[ORIGINAL], &group.group, group.renamed.clone(), "original group")?;
            insert_unique(&mut table.groups[RENAMED], &group.renamed, group.group.clone(), "renamed group")?;

            for (plural, resource) in &api_group.resource_rules {
                table.add_resource(&rules, group, plural, resource)?;
            }
        }

        if let Some(clash) = table.groups[RENAMED]
            .keys()
            .find(|renamed| table.groups[ORIGINAL].contains_key(*renamed))
        {
            return Err(RulesError::NotBijective(format!(
                "group '{clash}' is both an original and a renamed group"
            )));
        }

        for (path, webhook) in &rules.webhooks {
            if webhook.path != *path {
                return Err(RulesError::Invalid(format!(
                    "webhook key '{path}' does not match path '{}'",
                    webhook.path
                )));
            }
            table.webhooks.insert(path.clone(), webhook.clone());
        }

        table.source = rules;
        Ok(table)
    }

    /// Parses a YAML (or JSON) rule document.
    pub fn from_yaml(document: &str) -> Result<Self, RulesError> {
        Self::new(serde_yaml::from_str(document)?)
    }

    /// Loads rules from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)?;
        let table = Self::from_yaml(&document)?;
        info!(path = %path.display(), rules = table.len(), "Loaded rewrite rules from file");
        Ok(table)
    }

    /// The bundled rule set.
    pub fn bundled() -> Result<Self, RulesError> {
        Self::from_yaml(BUNDLED_RULES)
    }

    fn add_resource(
        &mut self,
        rules: &RewriteRules,
        group: &GroupRule,
        plural: &str,
        resource: &ResourceRule,
    ) -> Result<(), RulesError> {
        if resource.plural != plural {
            return Err(RulesError::Invalid(format!(
                "resource key '{plural}' does not match plural '{}'",
                resource.plural
            )));
        }
        if resource.kind.is_empty() || resource.plural.is_empty() {
            return Err(RulesError::Invalid(format!("resource '{plural}' has an empty kind or plural")));
        }
        let list_kind = if resource.list_kind.is_empty() {
            format!("{}List", resource.kind)
        } else {
            resource.list_kind.clone()
        };

        let original = ResourceNames {
            group: group.group.clone(),
            kind: resource.kind.clone(),
            list_kind: list_kind.clone(),
            resource: resource.plural.clone(),
            singular: resource.singular.clone(),
            short_names: resource.short_names.clone(),
            categories: resource.categories.clone(),
        };
        let renamed = ResourceNames {
            group: group.renamed.clone(),
            kind: format!("{}{}", rules.kind_prefix, resource.kind),
            list_kind: format!("{}{}", rules.kind_prefix, list_kind),
            resource: format!("{}{}", rules.resource_type_prefix, resource.plural),
            singular: if resource.singular.is_empty() {
                String::new()
            } else {
                format!("{}{}", rules.resource_type_prefix, resource.singular)
            },
            short_names: resource
                .short_names
                .iter()
                .map(|short| format!("{}{short}", rules.short_name_prefix))
                .collect(),
            categories: rules.categories.clone(),
        };

        let idx = self.rules.len();
        for (side, names) in [(ORIGINAL, &original), (RENAMED, &renamed)] {
            let label = if side == ORIGINAL { "original" } else { "renamed" };
            insert_unique(&mut self.by_resource[side], &names.resource, idx, &format!("{label} resource"))?;
            insert_unique(&mut self.by_kind[side], &names.kind, idx, &format!("{label} kind"))?;
            insert_unique(&mut self.by_kind[side], &names.list_kind, idx, &format!("{label} kind"))?;
        }

        self.rules.push(Rule {
            sides: [original, renamed],
            references: resource.references.clone(),
            templates: resource.templates.clone(),
        });
        Ok(())
    }

    /// Number of resource rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when the table has no resource rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All resource rules.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// The rule set the table was built from.
    #[must_use]
    pub fn source(&self) -> &RewriteRules {
        &self.source
    }

    /// Finds the rule for a source-side plural. A `/subresource` suffix is ignored.
    #[must_use]
    pub fn rule_for_resource(&self, resource: &str, direction: Direction) -> Option<&Rule> {
        let plural = resource.split('/').next().unwrap_or(resource);
        self.by_resource[direction.source()]
            .get(plural)
            .map(|idx| &self.rules[*idx])
    }

    /// Finds the rule for a source-side kind or list kind.
    #[must_use]
    pub fn rule_for_kind(&self, kind: &str, direction: Direction) -> Option<&Rule> {
        self.by_kind[direction.source()].get(kind).map(|idx| &self.rules[*idx])
    }

    /// Finds the rule for a kind that belongs to `group` on the source side.
    #[must_use]
    pub fn rule_for_group_kind(&self, group: &str, kind: &str, direction: Direction) -> Option<&Rule> {
        self.rule_for_kind(kind, direction)
            .filter(|rule| rule.source(direction).group == group)
    }

    /// Maps a source-side group to the target side.
    #[must_use]
    pub fn map_group(&self, group: &str, direction: Direction) -> Option<&str> {
        self.groups[direction.source()].get(group).map(String::as_str)
    }

    /// True when `group` is a ruled group on the source side.
    #[must_use]
    pub fn has_group(&self, group: &str, direction: Direction) -> bool {
        self.groups[direction.source()].contains_key(group)
    }

    /// Maps `group/version` to the target side. Core `v1` and unknown groups
    /// give `None`.
    #[must_use]
    pub fn map_api_version(&self, api_version: &str, direction: Direction) -> Option<String> {
        let (group, version) = api_version.split_once('/')?;
        self.map_group(group, direction).map(|mapped| format!("{mapped}/{version}"))
    }

    /// Maps a full identity. The version is kept, the kind may be a list kind
    /// and the resource may carry a subresource.
    ///
    /// Returns the mapped identity and the reference paths declared for it.
    #[must_use]
    pub fn lookup(&self, identity: &ResourceIdentity, direction: Direction) -> Option<(ResourceIdentity, &[String])> {
        let rule = if identity.resource.is_empty() {
            self.rule_for_group_kind(&identity.group, &identity.kind, direction)?
        } else {
            self.rule_for_resource(&identity.resource, direction)
                .filter(|rule| rule.source(direction).group == identity.group)?
        };
        let target = rule.target(direction);

        let kind = if identity.kind.is_empty() {
            String::new()
        } else {
            rule.map_kind(&identity.kind, direction)?.to_string()
        };
        let resource = match identity.resource.split_once('/') {
            Some((_, sub)) => format!("{}/{sub}", target.resource),
            None if identity.resource.is_empty() => String::new(),
            None => target.resource.clone(),
        };

        Some((
            ResourceIdentity {
                group: target.group.clone(),
                version: identity.version.clone(),
                kind,
                resource,
            },
            &rule.references,
        ))
    }

    /// Webhook rule for a request path.
    #[must_use]
    pub fn webhook(&self, path: &str) -> Option<&WebhookRule> {
        self.webhooks.get(path)
    }

    /// Label name rules.
    #[must_use]
    pub fn labels(&self) -> &PrefixedNameRewriter {
        &self.labels
    }

    /// Annotation name rules.
    #[must_use]
    pub fn annotations(&self) -> &PrefixedNameRewriter {
        &self.annotations
    }

    /// Finalizer name rules.
    #[must_use]
    pub fn finalizers(&self) -> &PrefixedNameRewriter {
        &self.finalizers
    }
}

fn insert_unique<V>(index: &mut HashMap<String, V>, key: &str, value: V, what: &str) -> Result<(), RulesError> {
    if index.insert(key.to_string(), value).is_some() {
        return Err(RulesError::NotBijective(format!("{what} '{key}' is declared twice")));
    }
    Ok(())
}
