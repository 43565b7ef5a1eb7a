//! Unit tests for the rewriter engine

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use crate::envelope::EnvelopeShape;
    use crate::error::{RewriteError, TransformError};
    use crate::rules::Direction;
    use crate::test_utils::*;
    use crate::transform;
    use pretty_assertions::assert_eq;

    const WIDGET: &str = r#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":{"name":"w","labels":{"example.io/role":"db","app":"x"},"annotations":{"example.io/note":"n"},"finalizers":["example.io/cleanup","other"],"ownerReferences":[{"apiVersion":"example.io/v1","kind":"Widget","name":"parent","uid":"1"}],"managedFields":[{"manager":"m","apiVersion":"example.io/v1"}]},"spec":{"sourceRef":{"apiGroup":"example.io","kind":"Widget","name":"src"},"template":{"metadata":{"labels":{"example.io/role":"worker"}}}}}"#;

    const RENAMED_WIDGET: &str = r#"{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","metadata":{"name":"w","labels":{"internal.example.io/role":"db","app":"x"},"annotations":{"internal.example.io/note":"n"},"finalizers":["internal.example.io/cleanup","other"],"ownerReferences":[{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","name":"parent","uid":"1"}],"managedFields":[{"manager":"m","apiVersion":"internal.example.io/v1"}]},"spec":{"sourceRef":{"apiGroup":"internal.example.io","kind":"PrefixedWidget","name":"src"},"template":{"metadata":{"labels":{"internal.example.io/role":"worker"}}}}}"#;

    #[test]
    fn test_widget_list_group_rename() {
        let rewriter = rewriter(GROUP_ONLY_RULES);
        let input = r#"{"kind":"WidgetList","apiVersion":"orig.io/v1","items":[{"kind":"Widget","apiVersion":"orig.io/v1","metadata":{"name":"a"}}]}"#;

        let renamed = rewriter.rewrite("widgets", Direction::ToRenamed, input.as_bytes()).unwrap();
        assert_eq!(
            text(&renamed),
            r#"{"kind":"WidgetList","apiVersion":"new.io/v1","items":[{"kind":"Widget","apiVersion":"new.io/v1","metadata":{"name":"a"}}]}"#
        );

        let restored = rewriter.rewrite("widgets", Direction::ToOriginal, &renamed).unwrap();
        assert_eq!(text(&restored), input);
    }

    #[test]
    fn test_object_rename_covers_every_identity() {
        let rewriter = widget_rewriter();
        let renamed = rewriter.rewrite("widgets", Direction::ToRenamed, WIDGET.as_bytes()).unwrap();
        assert_eq!(text(&renamed), RENAMED_WIDGET);
    }

    #[test]
    fn test_round_trip_restores_bytes() {
        let rewriter = widget_rewriter();
        let pretty = "{\n  \"apiVersion\": \"example.io/v1\",\n  \"kind\": \"Widget\",\n  \"metadata\": {\"labels\": {\"example.io/a\": \"1\"}}\n}";
        for body in [WIDGET, pretty] {
            let renamed = rewriter.rewrite("widgets", Direction::ToRenamed, body.as_bytes()).unwrap();
            assert_ne!(text(&renamed), body);
            let restored = rewriter.rewrite("prefixedwidgets", Direction::ToOriginal, &renamed).unwrap();
            assert_eq!(text(&restored), body);
        }
    }

    #[test]
    fn test_original_labels_on_renamed_side_are_preserved() {
        let rewriter = widget_rewriter();
        let body = r#"{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","metadata":{"labels":{"example.io/raw":"1"}}}"#;

        let restored = rewriter.rewrite("prefixedwidgets", Direction::ToOriginal, body.as_bytes()).unwrap();
        assert_eq!(
            text(&restored),
            r#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":{"labels":{"preserved-original-example.io/raw":"1"}}}"#
        );
        let renamed = rewriter.rewrite("widgets", Direction::ToRenamed, &restored).unwrap();
        assert_eq!(text(&renamed), body);
    }

    #[test]
    fn test_renamed_labels_on_original_side_round_trip() {
        let rewriter = widget_rewriter();
        let body = r#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":{"labels":{"internal.example.io/raw":"1"}}}"#;

        let renamed = rewriter.rewrite("widgets", Direction::ToRenamed, body.as_bytes()).unwrap();
        assert_eq!(
            text(&renamed),
            r#"{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","metadata":{"labels":{"preserved-renamed-internal.example.io/raw":"1"}}}"#
        );
        let restored = rewriter.rewrite("prefixedwidgets", Direction::ToOriginal, &renamed).unwrap();
        assert_eq!(text(&restored), body);
    }

    #[test]
    fn test_passthrough_returns_input() {
        let rewriter = widget_rewriter();
        let pod = br#"{"apiVersion":"v1","kind":"Pod","metadata":{"labels":{"example.io/role":"db"}}}"#;
        assert!(matches!(
            rewriter.rewrite("pods", Direction::ToRenamed, pod).unwrap(),
            Cow::Borrowed(_)
        ));

        for body in [b"".as_slice(), b"  ".as_slice(), br#"{"spec":{}}"#.as_slice(), b"[1,2]".as_slice()] {
            let out = rewriter.rewrite("widgets", Direction::ToRenamed, body).unwrap();
            assert!(matches!(out, Cow::Borrowed(_)));
            assert_eq!(out.as_ref(), body);
        }
    }

    #[test]
    fn test_list_matches_standalone_items() {
        let rewriter = widget_rewriter();
        let second = r#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":{"finalizers":["example.io/x"]}}"#;
        let list = format!(r#"{{"apiVersion":"example.io/v1","kind":"WidgetList","metadata":{{}},"items":[{WIDGET},{second}]}}"#);

        let out = rewriter.rewrite("widgets", Direction::ToRenamed, list.as_bytes()).unwrap();
        assert_eq!(transform::get_str(&out, "kind").unwrap().as_deref(), Some("PrefixedWidgetList"));
        assert_eq!(
            transform::get_str(&out, "apiVersion").unwrap().as_deref(),
            Some("internal.example.io/v1")
        );
        for (index, item) in [WIDGET, second].into_iter().enumerate() {
            let standalone = rewriter.rewrite("widgets", Direction::ToRenamed, item.as_bytes()).unwrap();
            let in_list = transform::get(&out, &format!("items.{index}")).unwrap().unwrap();
            assert_eq!(text(in_list), text(&standalone));
        }
    }

    #[test]
    fn test_status_details() {
        let rewriter = widget_rewriter();
        let body = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"NotFound","details":{"name":"w","group":"internal.example.io","kind":"prefixedwidgets"},"code":404}"#;
        let out = rewriter.rewrite("prefixedwidgets", Direction::ToOriginal, body.as_bytes()).unwrap();
        assert_eq!(
            text(&out),
            r#"{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"NotFound","details":{"name":"w","group":"example.io","kind":"widgets"},"code":404}"#
        );
    }

    #[test]
    fn test_foreign_owner_reference_is_kept() {
        let rewriter = widget_rewriter();
        let body = r#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":{"ownerReferences":[{"apiVersion":"apps/v1","kind":"Deployment","name":"d"}]}}"#;
        let out = rewriter.rewrite("widgets", Direction::ToRenamed, body.as_bytes()).unwrap();
        assert_eq!(
            text(&out),
            r#"{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","metadata":{"ownerReferences":[{"apiVersion":"apps/v1","kind":"Deployment","name":"d"}]}}"#
        );
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let rewriter = widget_rewriter();
        let wrong_type = br#"{"apiVersion":"example.io/v1","kind":"Widget","metadata":"oops"}"#;
        let err = rewriter.rewrite("widgets", Direction::ToRenamed, wrong_type).unwrap_err();
        assert!(matches!(err, RewriteError::Transform(TransformError::MalformedInput { .. })));

        let truncated = br#"{"apiVersion":"example.io/v1","kind":"#;
        assert!(rewriter.rewrite("widgets", Direction::ToRenamed, truncated).is_err());
    }

    #[test]
    fn test_subresource_uses_resource_rule() {
        let rewriter = widget_rewriter();
        let body = r#"{"apiVersion":"example.io/v1","kind":"Widget","status":{"ready":true}}"#;
        let out = rewriter.rewrite("widgets/status", Direction::ToRenamed, body.as_bytes()).unwrap();
        assert_eq!(
            text(&out),
            r#"{"apiVersion":"internal.example.io/v1","kind":"PrefixedWidget","status":{"ready":true}}"#
        );
    }

    #[test]
    fn test_shape_decides_the_route() {
        let rewriter = widget_rewriter();
        let merge = br#"{"metadata":{"labels":{"example.io/role":null}}}"#;

        let out = rewriter
            .rewrite_shaped("widgets", Direction::ToRenamed, EnvelopeShape::MergePatch, merge)
            .unwrap();
        assert_eq!(text(&out), r#"{"metadata":{"labels":{"internal.example.io/role":null}}}"#);

        let out = rewriter
            .rewrite_shaped("widgets", Direction::ToRenamed, EnvelopeShape::Passthrough, merge)
            .unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }
}
