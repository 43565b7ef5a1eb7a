//! Prefixed name rewriting for labels, annotations and finalizers.
//!
//! A name is matched against three kinds of rules, most specific first:
//! exact name plus value, exact name, and the prefix before `/`.
//!
//! Names that are already in their original form when restoring get the
//! [`PRESERVED_PREFIX`] so they stay invisible to the original-schema side
//! but survive an update that sends them back. Renaming strips the prefix.
//! Names already in renamed form when renaming get
//! [`PRESERVED_RENAMED_PREFIX`] the same way, and restoring strips it, so a
//! rename followed by a restore gives back every name unchanged.

use std::collections::HashMap;

use crate::error::RulesError;
use crate::rules::{Direction, MetadataReplace, MetadataReplaceRule};

/// Prefix carried by original-form names seen on the renamed side.
pub const PRESERVED_PREFIX: &str = "preserved-original-";

/// Prefix carried by renamed-form names sent from the original side.
pub const PRESERVED_RENAMED_PREFIX: &str = "preserved-renamed-";

/// Bidirectional index over one [`MetadataReplace`] rule set.
#[derive(Debug, Clone, Default)]
pub struct PrefixedNameRewriter {
    names_rename: HashMap<String, String>,
    names_restore: HashMap<String, String>,
    prefix_rename: HashMap<String, String>,
    prefix_restore: HashMap<String, String>,
}

impl PrefixedNameRewriter {
    /// Builds the indexes. `what` names the rule set in error messages.
    pub fn new(what: &str, rules: &MetadataReplace) -> Result<Self, RulesError> {
        Ok(Self {
            names_rename: index(what, &rules.names, by_original)?,
            names_restore: index(what, &rules.names, by_renamed)?,
            prefix_rename: index(what, &rules.prefixes, by_original)?,
            prefix_restore: index(what, &rules.prefixes, by_renamed)?,
        })
    }

    /// True when no rule is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names_rename.is_empty() && self.prefix_rename.is_empty()
    }

    /// Rewrites a name that carries no value (finalizers, selector keys).
    #[must_use]
    pub fn rewrite_name(&self, name: &str, direction: Direction) -> String {
        self.rewrite(name, "", direction).0
    }

    /// Rewrites a name/value pair. An empty `value` means "no value".
    #[must_use]
    pub fn rewrite(&self, name: &str, value: &str, direction: Direction) -> (String, String) {
        match direction {
            Direction::ToRenamed => self.rename(name, value),
            Direction::ToOriginal => self.restore(name, value),
        }
    }

    /// Rewrites a name used with several values, e.g. `key in (a,b)`.
    ///
    /// The name is taken from the first value that changes it; each value is
    /// rewritten on its own.
    #[must_use]
    pub fn rewrite_name_values(&self, name: &str, values: &[String], direction: Direction) -> (String, Vec<String>) {
        if values.is_empty() {
            return (self.rewrite_name(name, direction), Vec::new());
        }
        let mut new_name = name.to_string();
        let mut new_values = Vec::with_capacity(values.len());
        for value in values {
            let (n, v) = self.rewrite(name, value, direction);
            if n != name && new_name == name {
                new_name = n;
            }
            new_values.push(v);
        }
        (new_name, new_values)
    }

    fn rename(&self, name: &str, value: &str) -> (String, String) {
        if let Some(original) = name.strip_prefix(PRESERVED_PREFIX) {
            return (original.to_string(), value.to_string());
        }
        if claims(&self.names_restore, &self.prefix_restore, name, value) {
            return (format!("{PRESERVED_RENAMED_PREFIX}{name}"), value.to_string());
        }
        lookup(&self.names_rename, &self.prefix_rename, name, value)
    }

    fn restore(&self, name: &str, value: &str) -> (String, String) {
        if let Some(renamed) = name.strip_prefix(PRESERVED_RENAMED_PREFIX) {
            return (renamed.to_string(), value.to_string());
        }
        if claims(&self.names_rename, &self.prefix_rename, name, value) {
            return (format!("{PRESERVED_PREFIX}{name}"), value.to_string());
        }
        lookup(&self.names_restore, &self.prefix_restore, name, value)
    }
}

/// True when a rule in `names` or `prefixes` matches the pair.
fn claims(names: &HashMap<String, String>, prefixes: &HashMap<String, String>, name: &str, value: &str) -> bool {
    if !value.is_empty() && names.contains_key(&join(name, value)) {
        return true;
    }
    if names.contains_key(name) {
        return true;
    }
    name.split_once('/')
        .is_some_and(|(prefix, _)| prefixes.contains_key(prefix))
}

fn lookup(
    names: &HashMap<String, String>,
    prefixes: &HashMap<String, String>,
    name: &str,
    value: &str,
) -> (String, String) {
    if !value.is_empty()
        && let Some(pair) = names.get(&join(name, value))
    {
        return split(pair);
    }
    if let Some(renamed) = names.get(name) {
        return (renamed.clone(), value.to_string());
    }
    if let Some((prefix, rest)) = name.split_once('/')
        && let Some(renamed) = prefixes.get(prefix)
    {
        return (format!("{renamed}/{rest}"), value.to_string());
    }
    (name.to_string(), value.to_string())
}

type Sides<'a> = ((&'a str, &'a str), (&'a str, &'a str));

fn by_original(rule: &MetadataReplaceRule) -> Sides<'_> {
    (
        (rule.original.as_str(), rule.original_value.as_str()),
        (rule.renamed.as_str(), rule.renamed_value.as_str()),
    )
}

fn by_renamed(rule: &MetadataReplaceRule) -> Sides<'_> {
    let (from, to) = by_original(rule);
    (to, from)
}

fn index(
    what: &str,
    rules: &[MetadataReplaceRule],
    sides: fn(&MetadataReplaceRule) -> Sides<'_>,
) -> Result<HashMap<String, String>, RulesError> {
    let mut idx = HashMap::with_capacity(rules.len());
    for rule in rules {
        if rule.original.is_empty() || rule.renamed.is_empty() {
            return Err(RulesError::Invalid(format!("{what} rule with an empty name")));
        }
        let ((from, from_value), (to, to_value)) = sides(rule);
        let (key, target) = if from_value.is_empty() || to_value.is_empty() {
            (from.to_string(), to.to_string())
        } else {
            (join(from, from_value), join(to, to_value))
        };
        if idx.insert(key.clone(), target).is_some() {
            return Err(RulesError::NotBijective(format!("{what} rule '{key}' is declared twice")));
        }
    }
    Ok(idx)
}

fn join(name: &str, value: &str) -> String {
    format!("{name}={value}")
}

fn split(pair: &str) -> (String, String) {
    let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
    (name.to_string(), value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rule(original: &str, renamed: &str) -> MetadataReplaceRule {
        MetadataReplaceRule {
            original: original.to_string(),
            renamed: renamed.to_string(),
            ..Default::default()
        }
    }

    fn labels() -> PrefixedNameRewriter {
        let rules = MetadataReplace {
            names: vec![
                rule("kubevirt.io", "kubevirt.internal.io"),
                MetadataReplaceRule {
                    original: "app.kubernetes.io/managed-by".to_string(),
                    original_value: "virt-operator".to_string(),
                    renamed: "app.kubernetes.io/managed-by".to_string(),
                    renamed_value: "virt-operator-internal".to_string(),
                },
            ],
            prefixes: vec![rule("kubevirt.io", "kubevirt.internal.io")],
        };
        PrefixedNameRewriter::new("labels", &rules).unwrap()
    }

    #[rstest]
    #[case("kubevirt.io", "", "kubevirt.internal.io", "")]
    #[case("kubevirt.io/domain", "vm1", "kubevirt.internal.io/domain", "vm1")]
    #[case("app.kubernetes.io/managed-by", "virt-operator", "app.kubernetes.io/managed-by", "virt-operator-internal")]
    #[case("app.kubernetes.io/managed-by", "helm", "app.kubernetes.io/managed-by", "helm")]
    #[case("preserved-original-kubevirt.io/x", "v", "kubevirt.io/x", "v")]
    #[case("unrelated", "v", "unrelated", "v")]
    #[case("kubevirt.internal.io/x", "v", "preserved-renamed-kubevirt.internal.io/x", "v")]
    #[case("app.kubernetes.io/managed-by", "virt-operator-internal", "preserved-renamed-app.kubernetes.io/managed-by", "virt-operator-internal")]
    fn test_rename(#[case] name: &str, #[case] value: &str, #[case] want_name: &str, #[case] want_value: &str) {
        let (n, v) = labels().rewrite(name, value, Direction::ToRenamed);
        assert_eq!((n.as_str(), v.as_str()), (want_name, want_value));
    }

    #[rstest]
    #[case("kubevirt.internal.io/domain", "vm1", "kubevirt.io/domain", "vm1")]
    #[case("app.kubernetes.io/managed-by", "virt-operator-internal", "app.kubernetes.io/managed-by", "virt-operator")]
    #[case("kubevirt.io/x", "v", "preserved-original-kubevirt.io/x", "v")]
    #[case("app.kubernetes.io/managed-by", "virt-operator", "preserved-original-app.kubernetes.io/managed-by", "virt-operator")]
    #[case("preserved-renamed-kubevirt.internal.io/x", "v", "kubevirt.internal.io/x", "v")]
    fn test_restore(#[case] name: &str, #[case] value: &str, #[case] want_name: &str, #[case] want_value: &str) {
        let (n, v) = labels().rewrite(name, value, Direction::ToOriginal);
        assert_eq!((n.as_str(), v.as_str()), (want_name, want_value));
    }

    #[test]
    fn test_round_trip_keeps_names() {
        let labels = labels();
        for name in [
            "kubevirt.io/x",
            "preserved-original-kubevirt.io/y",
            "kubevirt.internal.io/z",
            "kubevirt.internal.io",
            "plain",
        ] {
            let renamed = labels.rewrite_name(name, Direction::ToRenamed);
            assert_eq!(labels.rewrite_name(&renamed, Direction::ToOriginal), name);
        }
    }

    #[test]
    fn test_name_values() {
        let values = vec!["virt-operator".to_string(), "helm".to_string()];
        let (name, values) = labels().rewrite_name_values("app.kubernetes.io/managed-by", &values, Direction::ToRenamed);
        assert_eq!(name, "app.kubernetes.io/managed-by");
        assert_eq!(values, vec!["virt-operator-internal", "helm"]);
    }

    #[test]
    fn test_duplicate_rule_is_rejected() {
        let rules = MetadataReplace {
            names: vec![],
            prefixes: vec![rule("a.io", "x.io"), rule("b.io", "x.io")],
        };
        assert!(matches!(
            PrefixedNameRewriter::new("finalizers", &rules),
            Err(RulesError::NotBijective(_))
        ));
    }
}
