//! Subject tracking set: found subjects keyed by subject identity.
//!
//! The key is the `subject` ONR alone; caveats, exclusions and provenance are
//! merge targets. Merges run under the per-key entry lock of the backing
//! `DashMap`, so concurrent producers may call [`TrackingSubjectSet::add`].
//!
//! Besides union by `add`, the set supports the intersection and exclusion
//! needed to consume expansion trees. For those, a concrete subject of
//! namespace `N` with the ellipsis relation is a member through a wildcard of
//! `N` unless the wildcard excludes it.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::{and_optional, or_optional, CaveatExpression, ObjectAndRelation, ELLIPSIS};

use super::error::{MembershipError, MembershipResult};
use super::found_subject::FoundSubject;

/// Whether a subject is a member, and under which condition.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    Never,
    Always,
    When(CaveatExpression),
}

impl Membership {
    fn from_caveat(caveat: Option<&CaveatExpression>) -> Self {
        match caveat {
            None => Self::Always,
            Some(expr) => Self::When(expr.clone()),
        }
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Never, _) | (_, Self::Never) => Self::Never,
            (Self::Always, other) | (other, Self::Always) => other,
            (Self::When(a), Self::When(b)) => Self::When(a.and(b)),
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Always, _) | (_, Self::Always) => Self::Always,
            (Self::Never, other) | (other, Self::Never) => other,
            (Self::When(a), Self::When(b)) => Self::When(a.or(b)),
        }
    }

    fn not(self) -> Self {
        match self {
            Self::Never => Self::Always,
            Self::Always => Self::Never,
            Self::When(expr) => Self::When(expr.invert()),
        }
    }

    /// `None` when never a member, otherwise the gating caveat (if any).
    fn into_caveat(self) -> Option<Option<CaveatExpression>> {
        match self {
            Self::Never => None,
            Self::Always => Some(None),
            Self::When(expr) => Some(Some(expr)),
        }
    }
}

/// A set of found subjects keyed by subject, merging findings of the same
/// subject from independent derivations.
#[derive(Debug, Clone, Default)]
pub struct TrackingSubjectSet {
    subjects: DashMap<ObjectAndRelation, FoundSubject>,
}

impl TrackingSubjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from found subjects, merging duplicates.
    pub fn from_subjects(
        subjects: impl IntoIterator<Item = FoundSubject>,
    ) -> MembershipResult<Self> {
        let set = Self::new();
        for subject in subjects {
            set.add(subject)?;
        }
        Ok(set)
    }

    /// Inserts a found subject, merging it with any entry for the same subject.
    ///
    /// Relationships are unioned, caveats are OR-ed (unconditional wins) and
    /// wildcard exclusions are intersected.
    ///
    /// # Errors
    ///
    /// Returns `MembershipError::Unsupported` when merging wildcards whose
    /// exclusions carry caveats.
    pub fn add(&self, subject: FoundSubject) -> MembershipResult<()> {
        match self.subjects.entry(subject.subject().clone()) {
            Entry::Occupied(mut existing) => {
                let merged = merge(existing.get(), &subject)?;
                existing.insert(merged);
            }
            Entry::Vacant(slot) => {
                slot.insert(subject);
            }
        }
        Ok(())
    }

    /// Adds every subject of `other`.
    pub fn add_from(&self, other: &TrackingSubjectSet) -> MembershipResult<()> {
        for subject in other.to_vec() {
            self.add(subject)?;
        }
        Ok(())
    }

    pub fn get(&self, subject: &ObjectAndRelation) -> Option<FoundSubject> {
        self.subjects.get(subject).map(|entry| entry.value().clone())
    }

    /// All found subjects, sorted by subject.
    pub fn to_vec(&self) -> Vec<FoundSubject> {
        let mut subjects: Vec<FoundSubject> =
            self.subjects.iter().map(|entry| entry.value().clone()).collect();
        subjects.sort_by(|a, b| a.subject().cmp(b.subject()));
        subjects
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// ANDs `caveat` into the condition of every subject.
    pub fn apply_parent_caveat(&self, caveat: Option<&CaveatExpression>) {
        let Some(caveat) = caveat else {
            return;
        };
        for mut entry in self.subjects.iter_mut() {
            let combined = and_optional(entry.caveat_expression(), Some(caveat));
            entry.set_caveat_expression(combined);
        }
    }

    /// Subjects that are members of both sets.
    pub fn intersect(&self, other: &TrackingSubjectSet) -> MembershipResult<TrackingSubjectSet> {
        let result = TrackingSubjectSet::new();

        let concrete: BTreeSet<ObjectAndRelation> = self
            .keys()
            .into_iter()
            .chain(other.keys())
            .filter(|key| !key.is_wildcard())
            .collect();

        for key in concrete {
            let membership = self.membership_of(&key).and(other.membership_of(&key));
            let Some(caveat) = membership.into_caveat() else {
                continue;
            };
            let mut relationships = self.provenance_of(&key);
            relationships.extend(other.provenance_of(&key));
            result.add(FoundSubject::from_parts(key, caveat, Vec::new(), relationships))?;
        }

        for left in self.wildcards() {
            let Some(right) = other.get(left.subject()) else {
                continue;
            };
            let condition = Membership::from_caveat(left.caveat_expression())
                .and(Membership::from_caveat(right.caveat_expression()));
            let Some(caveat) = condition.into_caveat() else {
                continue;
            };

            // Excluded from the intersection when excluded by either side.
            let mut excluded = exclusion_conditions(&left);
            for (subject, (membership, relationships)) in exclusion_conditions(&right) {
                let slot = excluded
                    .entry(subject)
                    .or_insert((Membership::Never, BTreeSet::new()));
                slot.0 = slot.0.clone().or(membership);
                slot.1.extend(relationships);
            }

            let mut relationships = left.relationship_set().clone();
            relationships.extend(right.relationship_set().iter().cloned());
            result.add(FoundSubject::from_parts(
                left.subject().clone(),
                caveat,
                exclusions_from(excluded),
                relationships,
            ))?;
        }

        Ok(result)
    }

    /// Subjects of this set that are not members of `other`.
    pub fn exclude(&self, other: &TrackingSubjectSet) -> MembershipResult<TrackingSubjectSet> {
        let result = TrackingSubjectSet::new();

        for subject in self.to_vec() {
            if subject.subject().is_wildcard() {
                self.exclude_from_wildcard(&subject, other, &result)?;
                continue;
            }

            let membership = Membership::from_caveat(subject.caveat_expression())
                .and(other.membership_of(subject.subject()).not());
            if let Some(caveat) = membership.into_caveat() {
                result.add(FoundSubject::from_parts(
                    subject.subject().clone(),
                    caveat,
                    Vec::new(),
                    subject.relationship_set().clone(),
                ))?;
            }
        }

        Ok(result)
    }

    fn exclude_from_wildcard(
        &self,
        wildcard: &FoundSubject,
        other: &TrackingSubjectSet,
        result: &TrackingSubjectSet,
    ) -> MembershipResult<()> {
        let condition = Membership::from_caveat(wildcard.caveat_expression());
        let mut excluded = exclusion_conditions(wildcard);

        // Concrete subjects removed by `other` become exclusions.
        for removed in other.to_vec() {
            if removed.subject().is_wildcard()
                || !wildcard_matches(wildcard.subject(), removed.subject())
            {
                continue;
            }
            let slot = excluded
                .entry(removed.subject().clone())
                .or_insert((Membership::Never, BTreeSet::new()));
            slot.0 = slot
                .0
                .clone()
                .or(Membership::from_caveat(removed.caveat_expression()));
            slot.1.extend(removed.relationship_set().iter().cloned());
        }

        match other.get(wildcard.subject()) {
            Some(removed_wildcard) => {
                // Subjects the other wildcard excludes stay members here unless
                // `other` still contains them.
                for carved in removed_wildcard.excluded_subjects() {
                    let key = carved.subject();
                    let excluded_here = excluded
                        .get(key)
                        .map(|(membership, _)| membership.clone())
                        .unwrap_or(Membership::Never);
                    let membership = condition
                        .clone()
                        .and(excluded_here.not())
                        .and(other.membership_of(key).not());
                    if let Some(caveat) = membership.into_caveat() {
                        result.add(FoundSubject::from_parts(
                            key.clone(),
                            caveat,
                            Vec::new(),
                            wildcard.relationship_set().clone(),
                        ))?;
                    }
                }

                let remaining = condition
                    .and(Membership::from_caveat(removed_wildcard.caveat_expression()).not());
                if let Some(caveat) = remaining.into_caveat() {
                    result.add(FoundSubject::from_parts(
                        wildcard.subject().clone(),
                        caveat,
                        exclusions_from(excluded),
                        wildcard.relationship_set().clone(),
                    ))?;
                }
            }
            None => {
                result.add(FoundSubject::from_parts(
                    wildcard.subject().clone(),
                    wildcard.caveat_expression().cloned(),
                    exclusions_from(excluded),
                    wildcard.relationship_set().clone(),
                ))?;
            }
        }

        Ok(())
    }

    fn keys(&self) -> Vec<ObjectAndRelation> {
        self.subjects.iter().map(|entry| entry.key().clone()).collect()
    }

    fn wildcards(&self) -> Vec<FoundSubject> {
        self.to_vec()
            .into_iter()
            .filter(|subject| subject.subject().is_wildcard())
            .collect()
    }

    fn wildcard_for(&self, subject: &ObjectAndRelation) -> Option<FoundSubject> {
        if subject.relation != ELLIPSIS {
            return None;
        }
        self.get(&ObjectAndRelation::wildcard(subject.namespace.clone()))
    }

    /// Membership of a concrete subject: directly, or through a wildcard
    /// that does not exclude it.
    fn membership_of(&self, subject: &ObjectAndRelation) -> Membership {
        let exact = self
            .get(subject)
            .map(|found| Membership::from_caveat(found.caveat_expression()))
            .unwrap_or(Membership::Never);

        let through_wildcard = match self.wildcard_for(subject) {
            Some(wildcard) => {
                let excluded = wildcard
                    .excluded_subjects()
                    .iter()
                    .find(|e| e.subject() == subject)
                    .map(|e| Membership::from_caveat(e.caveat_expression()))
                    .unwrap_or(Membership::Never);
                Membership::from_caveat(wildcard.caveat_expression()).and(excluded.not())
            }
            None => Membership::Never,
        };

        exact.or(through_wildcard)
    }

    fn provenance_of(&self, subject: &ObjectAndRelation) -> BTreeSet<ObjectAndRelation> {
        let mut relationships = BTreeSet::new();
        if let Some(found) = self.get(subject) {
            relationships.extend(found.relationship_set().iter().cloned());
        }
        if let Some(wildcard) = self.wildcard_for(subject) {
            relationships.extend(wildcard.relationship_set().iter().cloned());
        }
        relationships
    }
}

fn wildcard_matches(wildcard: &ObjectAndRelation, subject: &ObjectAndRelation) -> bool {
    wildcard.namespace == subject.namespace && subject.relation == ELLIPSIS
}

type ExclusionConditions = BTreeMap<ObjectAndRelation, (Membership, BTreeSet<ObjectAndRelation>)>;

fn exclusion_conditions(wildcard: &FoundSubject) -> ExclusionConditions {
    wildcard
        .excluded_subjects()
        .iter()
        .map(|excluded| {
            (
                excluded.subject().clone(),
                (
                    Membership::from_caveat(excluded.caveat_expression()),
                    excluded.relationship_set().clone(),
                ),
            )
        })
        .collect()
}

fn exclusions_from(conditions: ExclusionConditions) -> Vec<FoundSubject> {
    conditions
        .into_iter()
        .filter_map(|(subject, (membership, relationships))| {
            membership
                .into_caveat()
                .map(|caveat| FoundSubject::from_parts(subject, caveat, Vec::new(), relationships))
        })
        .collect()
}

/// Merges two findings of the same subject.
fn merge(existing: &FoundSubject, incoming: &FoundSubject) -> MembershipResult<FoundSubject> {
    let mut relationships = existing.relationship_set().clone();
    relationships.extend(incoming.relationship_set().iter().cloned());

    let caveat = or_optional(existing.caveat_expression(), incoming.caveat_expression());
    let excluded = intersect_exclusions(existing, incoming)?;

    Ok(FoundSubject::from_parts(
        existing.subject().clone(),
        caveat,
        excluded,
        relationships,
    ))
}

/// A subject stays excluded only if both derivations excluded it.
fn intersect_exclusions(
    existing: &FoundSubject,
    incoming: &FoundSubject,
) -> MembershipResult<Vec<FoundSubject>> {
    let conditional = existing
        .excluded_subjects()
        .iter()
        .chain(incoming.excluded_subjects())
        .find(|excluded| excluded.caveat_expression().is_some());
    if let Some(excluded) = conditional {
        return Err(MembershipError::unsupported(format!(
            "merging wildcard `{}` with caveated exclusion `{}`",
            existing.subject(),
            excluded.subject()
        )));
    }

    let mut merged: Vec<FoundSubject> = existing
        .excluded_subjects()
        .iter()
        .filter_map(|left| {
            incoming
                .excluded_subjects()
                .iter()
                .find(|right| right.subject() == left.subject())
                .map(|right| {
                    let mut relationships = left.relationship_set().clone();
                    relationships.extend(right.relationship_set().iter().cloned());
                    FoundSubject::from_parts(
                        left.subject().clone(),
                        None,
                        Vec::new(),
                        relationships,
                    )
                })
        })
        .collect();
    merged.sort_by(|a, b| a.subject().cmp(b.subject()));
    Ok(merged)
}
