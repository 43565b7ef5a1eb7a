//! Test utilities shared by the rewriter unit tests

use std::sync::Arc;

use crate::rewriter::Rewriter;
use crate::rules::RuleTable;

/// Renames `example.io` widgets with kind and resource prefixes, and carries
/// label, annotation and finalizer rules.
pub const WIDGET_RULES: &str = r"
kindPrefix: Prefixed
resourceTypePrefix: prefixed
shortNamePrefix: p
categories: [internal]
rules:
  example.io:
    groupRule:
      group: example.io
      versions: [v1]
      preferredVersion: v1
      renamed: internal.example.io
    resourceRules:
      widgets:
        kind: Widget
        listKind: WidgetList
        plural: widgets
        singular: widget
        shortNames: [wd]
        categories: [all]
        versions: [v1]
        references: [spec.sourceRef]
        templates: [spec.template]
webhooks:
  /widgets-validate: {path: /widgets-validate, group: example.io, resource: widgets}
labels:
  prefixes:
    - {original: example.io, renamed: internal.example.io}
annotations:
  prefixes:
    - {original: example.io, renamed: internal.example.io}
finalizers:
  prefixes:
    - {original: example.io, renamed: internal.example.io}
";

/// Renames only the group: `orig.io/Widget` becomes `new.io/Widget`.
pub const GROUP_ONLY_RULES: &str = r"
rules:
  orig.io:
    groupRule:
      group: orig.io
      versions: [v1]
      renamed: new.io
    resourceRules:
      widgets:
        kind: Widget
        listKind: WidgetList
        plural: widgets
";

/// Rewriter over [`WIDGET_RULES`].
pub fn widget_rewriter() -> Rewriter {
    rewriter(WIDGET_RULES)
}

/// Rewriter over any YAML rule document.
pub fn rewriter(rules: &str) -> Rewriter {
    Rewriter::new(Arc::new(RuleTable::from_yaml(rules).unwrap()))
}

/// Body bytes as a string, for readable assertions.
pub fn text(body: &[u8]) -> &str {
    std::str::from_utf8(body).unwrap()
}
