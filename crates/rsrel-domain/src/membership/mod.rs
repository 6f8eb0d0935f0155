//! Subject-set algebra: found subjects, tracking sets and membership from
//! expansion trees.
//!
//! A [`FoundSubject`] records one subject's access to a resource together
//! with its wildcard exclusions, the caveat gating it and the relationships
//! that led to it. A [`TrackingSubjectSet`] merges findings of the same
//! subject arriving from independent derivation paths:
//!
//! - provenance is unioned
//! - caveats are OR-ed, and an unconditional finding dominates
//! - wildcard exclusions are intersected
//!
//! Conditional exclusions cannot be merged and surface as
//! [`MembershipError::Unsupported`].

mod error;
mod found_subject;
mod membership_set;
mod tracking_set;

pub use error::{MembershipError, MembershipResult};
pub use found_subject::{FoundSubject, FoundSubjects};
pub use membership_set::MembershipSet;
pub use tracking_set::TrackingSubjectSet;
