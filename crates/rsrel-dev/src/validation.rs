//! Expected-subject validation.
//!
//! For each resource relation the sandbox can render the subjects it finds,
//! one entry per subject with the relationships it was reached through:
//!
//! ```text
//! document:readme#view:
//!   - "[user:alice] is <document:readme#owner>/<document:readme#viewer>"
//!   - "[user:* - {user:mallory}] is <document:readme#viewer>"
//! ```
//!
//! [`validate_expected`] compares such a listing against what the sandbox
//! actually finds. Only the bracketed subject takes part in the comparison.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, instrument};

use rsrel_domain::model::ObjectAndRelation;

use crate::classify::{classify, Classification};
use crate::context::DevContext;
use crate::error::{DevResult, DeveloperError, ErrorKind, ErrorSource};

/// One subject found for a resource relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValidationEntry {
    /// Canonical subject string, e.g. `user:* - {user:mallory}`.
    pub subject: String,
    /// The relations the subject was reached through.
    pub relationships: Vec<ObjectAndRelation>,
}

impl fmt::Display for ValidationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.subject)?;
        if !self.relationships.is_empty() {
            let via: Vec<String> = self
                .relationships
                .iter()
                .map(|onr| format!("<{onr}>"))
                .collect();
            write!(f, " is {}", via.join("/"))?;
        }
        Ok(())
    }
}

/// Generated entries per resource relation.
pub type ValidationMap = BTreeMap<ObjectAndRelation, Vec<ValidationEntry>>;

/// Extracts the subject from an entry in either `[subject] is ...` or bare
/// `subject` form.
pub fn expected_subject(entry: &str) -> &str {
    let entry = entry.trim();
    match entry.strip_prefix('[').and_then(|rest| rest.find(']').map(|end| &rest[..end])) {
        Some(subject) => subject.trim(),
        None => entry,
    }
}

/// Renders the subjects found for each of `resources`.
///
/// Dispatch errors a developer can act on come back alongside the entries
/// that could be generated. Conditional subjects have no canonical form and
/// fail the whole call.
#[instrument(skip_all, fields(scope = %ctx.scope().id(), resources = resources.len()))]
pub async fn generate_validation(
    ctx: &DevContext,
    resources: &[ObjectAndRelation],
) -> DevResult<(ValidationMap, Vec<DeveloperError>)> {
    let mut generated = ValidationMap::new();
    let mut errors = Vec::new();

    for resource in resources {
        let found = match ctx.found_subjects(resource).await {
            Ok(found) => found,
            Err(err) => {
                let context = resource.to_string();
                match classify(
                    err,
                    ErrorSource::ValidationYaml,
                    None,
                    None,
                    Some(&context),
                    ctx.reporter(),
                    ctx.scope(),
                ) {
                    Classification::Developer(developer) => {
                        errors.push(developer);
                        continue;
                    }
                    Classification::Infrastructure(err) => return Err(err),
                }
            }
        };

        let mut entries = found
            .list_found()
            .iter()
            .map(|subject| -> DevResult<ValidationEntry> {
                Ok(ValidationEntry {
                    subject: subject.to_canonical_string()?,
                    relationships: subject.relationships(),
                })
            })
            .collect::<DevResult<Vec<_>>>()?;
        entries.sort();
        generated.insert(resource.clone(), entries);
    }

    Ok((generated, errors))
}

/// Compares `expected` subjects per resource relation against the sandbox.
///
/// Every expected subject that is not found is a `MISSING_EXPECTED_SUBJECT`
/// error; every found subject that was not expected is an
/// `EXTRA_SUBJECT_FOUND` error.
pub async fn validate_expected(
    ctx: &DevContext,
    expected: &BTreeMap<ObjectAndRelation, Vec<String>>,
) -> DevResult<Vec<DeveloperError>> {
    let resources: Vec<ObjectAndRelation> = expected.keys().cloned().collect();
    let (generated, mut errors) = generate_validation(ctx, &resources).await?;

    for (resource, entries) in expected {
        let Some(found) = generated.get(resource) else {
            continue;
        };
        let context = resource.to_string();

        let wanted: BTreeSet<&str> = entries.iter().map(|e| expected_subject(e)).collect();
        let actual: BTreeSet<&str> = found.iter().map(|e| e.subject.as_str()).collect();

        for missing in wanted.difference(&actual) {
            errors.push(
                DeveloperError::new(
                    format!(
                        "For object and permission/relation `{resource}`, missing expected subject `{missing}`"
                    ),
                    ErrorSource::ValidationYaml,
                    ErrorKind::MissingExpectedSubject,
                )
                .with_context(context.clone()),
            );
        }
        for extra in actual.difference(&wanted) {
            errors.push(
                DeveloperError::new(
                    format!(
                        "For object and permission/relation `{resource}`, subject `{extra}` found but not expected"
                    ),
                    ErrorSource::ValidationYaml,
                    ErrorKind::ExtraSubjectFound,
                )
                .with_context(context.clone()),
            );
        }
    }

    debug!(errors = errors.len(), "expected subjects validated");
    Ok(errors)
}
