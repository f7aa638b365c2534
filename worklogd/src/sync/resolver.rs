use worklog_core::{ApiErrorClass, WorklogError};

use super::queue::{OperationKind, PendingOperation};

/// What the scheduler should do with an operation after a remote call came
/// back with an error. The dominant ambiguity is the replayed request: the
/// server deduplicates on the idempotency key, so a conflict answer means the
/// earlier attempt landed and the operation is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Retry {
        retry_after: Option<u64>,
        reason: String,
    },
    Reject {
        reason: String,
    },
    PauseAuth {
        reason: String,
    },
}

pub fn dispose(kind: OperationKind, err: &WorklogError) -> Disposition {
    match err.classification() {
        Some(ApiErrorClass::Conflict) => Disposition::Applied,
        Some(ApiErrorClass::NotFound) => match kind {
            // Deleting something already gone is a success for our purposes.
            OperationKind::Delete => Disposition::Applied,
            OperationKind::Update => Disposition::Reject {
                reason: "target no longer exists".to_string(),
            },
            OperationKind::Create => Disposition::Reject {
                reason: err.to_string(),
            },
        },
        Some(ApiErrorClass::Auth) => Disposition::PauseAuth {
            reason: err.to_string(),
        },
        Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => Disposition::Retry {
            retry_after: err.retry_after_secs(),
            reason: err.to_string(),
        },
        Some(
            ApiErrorClass::Validation | ApiErrorClass::LimitExceeded | ApiErrorClass::Permanent,
        ) => Disposition::Reject {
            reason: err.to_string(),
        },
        None => Disposition::Retry {
            retry_after: None,
            reason: err.to_string(),
        },
    }
}

/// Finds create/delete chains that never reached the remote store. When a
/// delete is queued behind a still-unapplied create of the same record, the
/// record never existed remotely: the create, any updates in between and the
/// delete itself can all be dropped locally without a single remote call.
pub fn collapse_unsynced_deletes(ops: &[PendingOperation]) -> Vec<String> {
    let mut doomed = Vec::new();
    for (delete_idx, delete) in ops.iter().enumerate() {
        if delete.kind != OperationKind::Delete || delete.status.is_terminal() {
            continue;
        }
        let creates_locally = ops[..delete_idx].iter().any(|op| {
            op.kind == OperationKind::Create
                && op.record_id == delete.record_id
                && !op.status.is_terminal()
        });
        if !creates_locally {
            continue;
        }
        for op in &ops[..=delete_idx] {
            if op.record_id == delete.record_id && !op.status.is_terminal() {
                doomed.push(op.op_id.clone());
            }
        }
    }
    doomed
}
