//! Tests for the dispatch module.
//!
//! Organized by functionality:
//! - Direct relationships, wildcards and usersets
//! - Rewrites (computed, arrow, union, intersection, exclusion)
//! - Caveats
//! - Expansion trees
//! - Safety features (depth limiting, cancellation, timeouts, close)


#[cfg(test)]
mod dispatch_tests;
