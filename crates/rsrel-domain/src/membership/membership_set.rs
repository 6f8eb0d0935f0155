//! Membership computed from expansion trees.

use std::collections::HashMap;

use crate::dispatch::{ExpansionNode, SetOperation};
use crate::model::ObjectAndRelation;

use super::error::{MembershipError, MembershipResult};
use super::found_subject::{FoundSubject, FoundSubjects};
use super::tracking_set::TrackingSubjectSet;

/// Found subjects per root resource, computed from expansion trees.
#[derive(Debug, Default)]
pub struct MembershipSet {
    by_resource: HashMap<ObjectAndRelation, FoundSubjects>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the subjects of `resource` from its expansion tree and caches
    /// them, merging with earlier expansions of the same resource.
    pub fn add_expansion(
        &mut self,
        resource: &ObjectAndRelation,
        expansion: &ExpansionNode,
    ) -> MembershipResult<FoundSubjects> {
        let found = populate(expansion)?;
        if let Some(existing) = self.by_resource.get(resource) {
            for subject in existing.list_found() {
                found.add(subject)?;
            }
        }

        let subjects = FoundSubjects::new(resource.clone(), found);
        self.by_resource.insert(resource.clone(), subjects.clone());
        Ok(subjects)
    }

    pub fn subjects_for(&self, resource: &ObjectAndRelation) -> Option<&FoundSubjects> {
        self.by_resource.get(resource)
    }

    pub fn len(&self) -> usize {
        self.by_resource.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}

fn populate(node: &ExpansionNode) -> MembershipResult<TrackingSubjectSet> {
    let set = match node {
        ExpansionNode::Leaf {
            expanded, subjects, ..
        } => {
            let set = TrackingSubjectSet::new();
            for direct in subjects {
                set.add(
                    FoundSubject::new(direct.subject.clone(), [expanded.clone()])
                        .with_caveat_expression(direct.caveat.clone()),
                )?;
            }
            set
        }
        ExpansionNode::Intermediate {
            expanded,
            operation,
            children,
            ..
        } => match operation {
            SetOperation::Union => {
                let set = TrackingSubjectSet::new();
                for child in children {
                    set.add_from(&populate(child)?)?;
                }
                set
            }
            SetOperation::Intersection => {
                let mut children = children.iter();
                let Some(first) = children.next() else {
                    return Ok(TrackingSubjectSet::new());
                };
                let mut set = populate(first)?;
                for child in children {
                    set = set.intersect(&populate(child)?)?;
                }
                set
            }
            SetOperation::Exclusion => {
                let mut children = children.iter();
                let first = children
                    .next()
                    .ok_or_else(|| MembershipError::MalformedExpansion {
                        resource: expanded.to_string(),
                        message: "exclusion without a base".to_string(),
                    })?;
                let mut set = populate(first)?;
                for child in children {
                    set = set.exclude(&populate(child)?)?;
                }
                set
            }
        },
    };

    set.apply_parent_caveat(node.caveat());
    Ok(set)
}
