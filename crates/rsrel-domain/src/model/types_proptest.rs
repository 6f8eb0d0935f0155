//! Property-based tests for model types.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::model::{ObjectAndRelation, Relationship};

    fn identifier_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,10}"
    }

    fn object_id_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,20}"
    }

    proptest! {
        #[test]
        fn test_onr_text_form_parses_back(
            ns in identifier_strategy(),
            id in object_id_strategy(),
            rel in identifier_strategy(),
        ) {
            let onr = ObjectAndRelation::new(&ns, &id, &rel);
            let parsed = ObjectAndRelation::parse(&onr.to_string());
            prop_assert_eq!(parsed, Ok(onr));
        }

        #[test]
        fn test_terminal_subject_renders_without_ellipsis(
            ns in identifier_strategy(),
            id in object_id_strategy(),
        ) {
            let onr = ObjectAndRelation::terminal(&ns, &id);
            prop_assert_eq!(onr.to_string(), format!("{ns}:{id}"));
        }

        #[test]
        fn test_generated_relationships_validate(
            resource_ns in identifier_strategy(),
            resource_id in object_id_strategy(),
            relation in identifier_strategy(),
            subject_ns in identifier_strategy(),
            subject_id in object_id_strategy(),
        ) {
            let text = format!("{resource_ns}:{resource_id}#{relation}@{subject_ns}:{subject_id}");
            let relationship = Relationship::parse(&text);
            prop_assert!(relationship.is_ok(), "failed to parse {}", text);
            let relationship = relationship.unwrap();
            prop_assert!(relationship.validate().is_ok());
            prop_assert_eq!(relationship.to_string(), text);
        }

        #[test]
        fn test_uppercase_namespace_is_rejected(
            ns in "[A-Z][a-z]{1,8}",
            id in object_id_strategy(),
        ) {
            let text = format!("{ns}:{id}#viewer@user:alice");
            let valid = Relationship::parse(&text).and_then(|r| r.validate());
            prop_assert!(valid.is_err());
        }
    }
}
