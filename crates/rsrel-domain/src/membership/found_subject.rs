//! Found subjects: one subject's access to a resource.

use std::collections::BTreeSet;

use crate::model::{CaveatExpression, ObjectAndRelation};

use super::error::{MembershipError, MembershipResult};
use super::tracking_set::TrackingSubjectSet;

/// A subject found for a resource, with its wildcard exclusions, the
/// condition gating it and the relationships that led to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundSubject {
    subject: ObjectAndRelation,
    caveat_expression: Option<CaveatExpression>,
    /// Only non-empty for wildcard subjects; kept sorted by subject.
    excluded_subjects: Vec<FoundSubject>,
    relationships: BTreeSet<ObjectAndRelation>,
}

impl FoundSubject {
    /// Creates an unconditional finding with the given provenance and no exclusions.
    pub fn new(
        subject: ObjectAndRelation,
        resources: impl IntoIterator<Item = ObjectAndRelation>,
    ) -> Self {
        Self {
            subject,
            caveat_expression: None,
            excluded_subjects: Vec::new(),
            relationships: resources.into_iter().collect(),
        }
    }

    /// Sets the condition gating this finding.
    pub fn with_caveat_expression(mut self, caveat: Option<CaveatExpression>) -> Self {
        self.caveat_expression = caveat;
        self
    }

    /// Attaches exclusions to a wildcard finding.
    ///
    /// Exclusions of the same subject are merged.
    pub fn with_excluded_subjects(
        mut self,
        excluded: impl IntoIterator<Item = FoundSubject>,
    ) -> MembershipResult<Self> {
        let excluded: Vec<FoundSubject> = excluded.into_iter().collect();
        if !excluded.is_empty() && !self.subject.is_wildcard() {
            return Err(MembershipError::ExclusionOnConcreteSubject {
                subject: self.subject.to_string(),
            });
        }

        let set = TrackingSubjectSet::new();
        for subject in excluded {
            set.add(subject)?;
        }
        self.excluded_subjects = set.to_vec();
        Ok(self)
    }

    pub fn subject(&self) -> &ObjectAndRelation {
        &self.subject
    }

    pub fn caveat_expression(&self) -> Option<&CaveatExpression> {
        self.caveat_expression.as_ref()
    }

    /// The exclusion entries, including any conditions they carry.
    pub fn excluded_subjects(&self) -> &[FoundSubject] {
        &self.excluded_subjects
    }

    /// Returns the namespace when this is a wildcard finding.
    pub fn wildcard_type(&self) -> Option<&str> {
        self.subject
            .is_wildcard()
            .then_some(self.subject.namespace.as_str())
    }

    /// Returns the subjects excluded from the wildcard, or `None` when this is
    /// not a wildcard finding.
    ///
    /// # Errors
    ///
    /// Returns `MembershipError::Unsupported` if an exclusion is conditional.
    pub fn excluded_from_wildcard(&self) -> MembershipResult<Option<Vec<ObjectAndRelation>>> {
        if !self.subject.is_wildcard() {
            return Ok(None);
        }

        self.excluded_subjects
            .iter()
            .map(|excluded| {
                if excluded.caveat_expression.is_some() {
                    return Err(MembershipError::unsupported(format!(
                        "caveated exclusion `{}` on wildcard `{}`",
                        excluded.subject, self.subject
                    )));
                }
                Ok(excluded.subject.clone())
            })
            .collect::<MembershipResult<Vec<_>>>()
            .map(Some)
    }

    /// Provenance relationships in sorted order.
    pub fn relationships(&self) -> Vec<ObjectAndRelation> {
        self.relationships.iter().cloned().collect()
    }

    /// Renders `ns:id#rel`, or `ns:*#rel - {a, b}` for a wildcard with
    /// exclusions (sorted lexicographically).
    ///
    /// # Errors
    ///
    /// Conditional findings and conditional exclusions have no canonical form
    /// and return `MembershipError::Unsupported`.
    pub fn to_canonical_string(&self) -> MembershipResult<String> {
        if let Some(caveat) = &self.caveat_expression {
            return Err(MembershipError::unsupported(format!(
                "canonical form of conditional subject `{}` with condition {caveat}",
                self.subject
            )));
        }

        let rendered = self.subject.to_string();
        match self.excluded_from_wildcard()? {
            Some(excluded) if !excluded.is_empty() => {
                let mut excluded: Vec<String> =
                    excluded.iter().map(ToString::to_string).collect();
                excluded.sort();
                Ok(format!("{rendered} - {{{}}}", excluded.join(", ")))
            }
            _ => Ok(rendered),
        }
    }

    pub(crate) fn relationship_set(&self) -> &BTreeSet<ObjectAndRelation> {
        &self.relationships
    }

    pub(crate) fn from_parts(
        subject: ObjectAndRelation,
        caveat_expression: Option<CaveatExpression>,
        excluded_subjects: Vec<FoundSubject>,
        relationships: BTreeSet<ObjectAndRelation>,
    ) -> Self {
        Self {
            subject,
            caveat_expression,
            excluded_subjects,
            relationships,
        }
    }

    pub(crate) fn set_caveat_expression(&mut self, caveat: Option<CaveatExpression>) {
        self.caveat_expression = caveat;
    }
}

/// The subjects found for one resource.
#[derive(Debug, Clone)]
pub struct FoundSubjects {
    resource: ObjectAndRelation,
    subjects: TrackingSubjectSet,
}

impl FoundSubjects {
    pub fn new(resource: ObjectAndRelation, subjects: TrackingSubjectSet) -> Self {
        Self { resource, subjects }
    }

    pub fn resource(&self) -> &ObjectAndRelation {
        &self.resource
    }

    /// Every found subject, sorted by subject.
    pub fn list_found(&self) -> Vec<FoundSubject> {
        self.subjects.to_vec()
    }

    pub fn lookup_subject(&self, subject: &ObjectAndRelation) -> Option<FoundSubject> {
        self.subjects.get(subject)
    }
}
