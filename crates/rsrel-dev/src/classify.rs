//! Classification of dispatch errors into developer errors or transport
//! statuses.
//!
//! The table is checked in order and the first match wins:
//!
//! | Dispatch error                | Outcome                          |
//! |-------------------------------|----------------------------------|
//! | `MaxDepthExceeded`            | developer `MAXIMUM_RECURSION`    |
//! | `UnknownNamespace`            | developer `UNKNOWN_OBJECT_TYPE`  |
//! | `UnknownRelation`             | developer `UNKNOWN_RELATION`     |
//! | `InvalidRelationReference`    | developer `UNKNOWN_RELATION`     |
//! | anything else                 | [`rewrite_dispatch_error`]       |

use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use rsrel_domain::dispatch::DispatchError;

use crate::error::{DevError, DeveloperError, ErrorKind, ErrorSource, Status};

/// A cancellable evaluation scope; its id attributes log lines to a request.
#[derive(Debug, Clone)]
pub struct EvaluationScope {
    id: Uuid,
    cancel: CancellationToken,
}

impl EvaluationScope {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for EvaluationScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Port for reporting internal errors found during classification.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, scope: &EvaluationScope, err: &DispatchError, message: &str);
}

/// Reports through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, scope: &EvaluationScope, err: &DispatchError, message: &str) {
        error!(scope = %scope.id(), error = %err, "{message}");
    }
}

/// Outcome of [`classify`]: exactly one of the two.
#[derive(Debug)]
pub enum Classification {
    Developer(DeveloperError),
    Infrastructure(DevError),
}

impl Classification {
    pub fn developer_error(&self) -> Option<&DeveloperError> {
        match self {
            Classification::Developer(err) => Some(err),
            Classification::Infrastructure(_) => None,
        }
    }

    pub fn into_result(self) -> Result<DeveloperError, DevError> {
        match self {
            Classification::Developer(err) => Ok(err),
            Classification::Infrastructure(err) => Err(err),
        }
    }
}

/// Turns a dispatch error into a developer error or an infrastructural error.
///
/// `line`, `column` and `context` locate the input that triggered the
/// dispatch and are copied onto developer errors.
pub fn classify(
    err: DispatchError,
    source: ErrorSource,
    line: Option<u32>,
    column: Option<u32>,
    context: Option<&str>,
    reporter: &dyn ErrorReporter,
    scope: &EvaluationScope,
) -> Classification {
    let kind = match &err {
        DispatchError::MaxDepthExceeded { .. } => ErrorKind::MaximumRecursion,
        DispatchError::UnknownNamespace { .. } => ErrorKind::UnknownObjectType,
        DispatchError::UnknownRelation { .. } | DispatchError::InvalidRelationReference { .. } => {
            ErrorKind::UnknownRelation
        }
        _ => return Classification::Infrastructure(rewrite_dispatch_error(err, reporter, scope)),
    };

    let mut developer =
        DeveloperError::new(err.to_string(), source, kind).with_location(line, column);
    if let Some(context) = context {
        developer = developer.with_context(context);
    }
    Classification::Developer(developer)
}

/// Maps a dispatch error that is not developer-actionable to a transport
/// status. Internal sentinels and unmapped errors are reported.
pub fn rewrite_dispatch_error(
    err: DispatchError,
    reporter: &dyn ErrorReporter,
    scope: &EvaluationScope,
) -> DevError {
    match err {
        DispatchError::UnknownNamespace { .. }
        | DispatchError::UnknownRelation { .. }
        | DispatchError::Canceled => Status::canceled(format!("request canceled: {err}")).into(),
        DispatchError::InvalidArgument { .. } => Status::invalid_argument(err.to_string()).into(),
        DispatchError::InvalidRevision { .. } => {
            Status::out_of_range(format!("invalid revision: {err}")).into()
        }
        DispatchError::RelationMissingTypeInfo { .. } => {
            Status::failed_precondition(format!("failed precondition: {err}")).into()
        }
        DispatchError::AlwaysFail => {
            reporter.report(scope, &err, "internal dispatch error in sandbox");
            Status::internal(format!("internal error: {err}")).into()
        }
        DispatchError::InvalidRelationReference { .. } => {
            Status::invalid_argument(err.to_string()).into()
        }
        other => {
            reporter.report(scope, &other, "unexpected dispatch error in sandbox");
            DevError::Dispatch(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::StatusCode;
    use rsrel_domain::membership::MembershipError;

    /// Records reported errors instead of logging them.
    #[derive(Default)]
    struct RecordingReporter {
        reported: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, _scope: &EvaluationScope, err: &DispatchError, message: &str) {
            self.reported
                .lock()
                .unwrap()
                .push(format!("{message}: {err}"));
        }
    }

    fn every_dispatch_error() -> Vec<DispatchError> {
        vec![
            DispatchError::MaxDepthExceeded {
                max_depth: 10,
                resource: "group:a#member".to_string(),
            },
            DispatchError::UnknownNamespace {
                namespace: "folder".to_string(),
            },
            DispatchError::UnknownRelation {
                namespace: "document".to_string(),
                relation: "viewr".to_string(),
            },
            DispatchError::InvalidRelationReference {
                message: "cannot write to permission".to_string(),
            },
            DispatchError::Canceled,
            DispatchError::InvalidArgument {
                message: "bad".to_string(),
            },
            DispatchError::InvalidRevision {
                message: "future".to_string(),
            },
            DispatchError::RelationMissingTypeInfo {
                namespace: "document".to_string(),
                relation: "viewer".to_string(),
            },
            DispatchError::AlwaysFail,
            DispatchError::Timeout { duration_ms: 5 },
            DispatchError::Storage {
                message: "closed".to_string(),
            },
            DispatchError::Closed,
            DispatchError::Membership(MembershipError::Unsupported {
                feature: "caveated exclusions".to_string(),
            }),
        ]
    }

    // ========== Section 1: Developer Errors ==========

    #[test]
    fn test_max_depth_is_maximum_recursion() {
        let reporter = RecordingReporter::default();
        let scope = EvaluationScope::new();
        let err = DispatchError::MaxDepthExceeded {
            max_depth: 10,
            resource: "group:a#member".to_string(),
        };

        let classified = classify(
            err,
            ErrorSource::Assertion,
            Some(3),
            Some(7),
            Some("assertTrue"),
            &reporter,
            &scope,
        );
        let developer = classified.developer_error().unwrap();
        assert_eq!(developer.kind, ErrorKind::MaximumRecursion);
        assert_eq!(developer.source, ErrorSource::Assertion);
        assert_eq!(developer.line, Some(3));
        assert_eq!(developer.column, Some(7));
        assert_eq!(developer.context.as_deref(), Some("assertTrue"));
        assert!(reporter.reported.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_types_and_relations_are_developer_errors() {
        let scope = EvaluationScope::new();
        let cases = [
            (
                DispatchError::UnknownNamespace {
                    namespace: "folder".to_string(),
                },
                ErrorKind::UnknownObjectType,
            ),
            (
                DispatchError::UnknownRelation {
                    namespace: "document".to_string(),
                    relation: "viewr".to_string(),
                },
                ErrorKind::UnknownRelation,
            ),
            (
                DispatchError::InvalidRelationReference {
                    message: "not assignable".to_string(),
                },
                ErrorKind::UnknownRelation,
            ),
        ];

        for (err, kind) in cases {
            let message = err.to_string();
            let developer = classify(
                err,
                ErrorSource::Relationship,
                None,
                None,
                None,
                &TracingReporter,
                &scope,
            )
            .into_result()
            .unwrap();
            assert_eq!(developer.kind, kind);
            assert_eq!(developer.message, message);
            assert_eq!(developer.context, None);
        }
    }

    // ========== Section 2: Infrastructural Mapping ==========

    #[test]
    fn test_rewrite_maps_to_transport_codes() {
        let reporter = RecordingReporter::default();
        let scope = EvaluationScope::new();
        let cases = [
            (
                DispatchError::UnknownNamespace {
                    namespace: "x".to_string(),
                },
                StatusCode::Canceled,
            ),
            (DispatchError::Canceled, StatusCode::Canceled),
            (
                DispatchError::InvalidArgument {
                    message: "bad".to_string(),
                },
                StatusCode::InvalidArgument,
            ),
            (
                DispatchError::InvalidRevision {
                    message: "future".to_string(),
                },
                StatusCode::OutOfRange,
            ),
            (
                DispatchError::RelationMissingTypeInfo {
                    namespace: "document".to_string(),
                    relation: "viewer".to_string(),
                },
                StatusCode::FailedPrecondition,
            ),
            (
                DispatchError::InvalidRelationReference {
                    message: "bad".to_string(),
                },
                StatusCode::InvalidArgument,
            ),
        ];

        for (err, code) in cases {
            let rewritten = rewrite_dispatch_error(err, &reporter, &scope);
            assert!(
                matches!(&rewritten, DevError::Status(status) if status.code == code),
                "expected {code}, got {rewritten:?}"
            );
        }
        assert!(reporter.reported.lock().unwrap().is_empty());
    }

    #[test]
    fn test_always_fail_is_logged_internal() {
        let reporter = RecordingReporter::default();
        let scope = EvaluationScope::new();

        let rewritten = rewrite_dispatch_error(DispatchError::AlwaysFail, &reporter, &scope);
        assert_eq!(rewritten.status_code(), StatusCode::Internal);
        let reported = reporter.reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("internal dispatch error"));
    }

    #[test]
    fn test_unmapped_errors_are_logged_and_propagated() {
        let reporter = RecordingReporter::default();
        let scope = EvaluationScope::new();

        let rewritten =
            rewrite_dispatch_error(DispatchError::Timeout { duration_ms: 5 }, &reporter, &scope);
        assert!(matches!(
            rewritten,
            DevError::Dispatch(DispatchError::Timeout { duration_ms: 5 })
        ));
        assert_eq!(reporter.reported.lock().unwrap().len(), 1);
    }

    // ========== Section 3: Totality ==========

    #[test]
    fn test_classify_returns_exactly_one_outcome_for_every_error() {
        let scope = EvaluationScope::new();
        for err in every_dispatch_error() {
            let developer_expected = matches!(
                err,
                DispatchError::MaxDepthExceeded { .. }
                    | DispatchError::UnknownNamespace { .. }
                    | DispatchError::UnknownRelation { .. }
                    | DispatchError::InvalidRelationReference { .. }
            );
            let description = err.to_string();
            let classified = classify(
                err,
                ErrorSource::Assertion,
                None,
                None,
                None,
                &RecordingReporter::default(),
                &scope,
            );
            match classified {
                Classification::Developer(_) => {
                    assert!(developer_expected, "{description} should be infrastructural")
                }
                Classification::Infrastructure(_) => {
                    assert!(!developer_expected, "{description} should be a developer error")
                }
            }
        }
    }

    #[test]
    fn test_scope_cancellation() {
        let token = CancellationToken::new();
        let scope = EvaluationScope::with_cancellation(token.clone());
        assert!(!scope.is_cancelled());
        token.cancel();
        assert!(scope.is_cancelled());
        assert_ne!(scope.id(), EvaluationScope::new().id());
    }
}
