//! Test utilities shared by the proxy unit tests

use std::sync::Arc;

use api_rewriter::{Rewriter, RuleTable};

/// Renames `example.io` widgets to `internal.example.io` prefixed widgets.
pub const WIDGET_RULES: &str = r"
kindPrefix: Prefixed
resourceTypePrefix: prefixed
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
        versions: [v1]
webhooks:
  /widgets-validate: {path: /widgets-validate, group: example.io, resource: widgets}
labels:
  prefixes:
    - {original: example.io, renamed: internal.example.io}
";

/// Rewriter over [`WIDGET_RULES`].
pub fn widget_rewriter() -> Rewriter {
    Rewriter::new(Arc::new(RuleTable::from_yaml(WIDGET_RULES).unwrap()))
}
