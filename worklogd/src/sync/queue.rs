use worklog_core::EntryKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    InFlight,
    Applied,
    Failed,
    Rejected,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::InFlight => "in_flight",
            OpStatus::Applied => "applied",
            OpStatus::Failed => "failed",
            OpStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OpStatus::Pending),
            "in_flight" => Some(OpStatus::InFlight),
            "applied" => Some(OpStatus::Applied),
            "failed" => Some(OpStatus::Failed),
            "rejected" => Some(OpStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal statuses end the retry lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpStatus::Applied | OpStatus::Rejected)
    }
}

/// A queued mutation, exactly as persisted. `payload` is the snapshot taken
/// at enqueue time and is never rewritten; only status, attempts, last_error
/// and retry_at change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub op_id: String,
    pub entity: EntryKind,
    pub kind: OperationKind,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub attempts: u32,
    pub status: OpStatus,
    pub last_error: Option<String>,
    pub retry_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub op_id: String,
    pub entity: EntryKind,
    pub kind: OperationKind,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kind_round_trips() {
        for kind in [
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            assert_eq!(OperationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OperationKind::parse("upsert"), None);
    }

    #[test]
    fn status_round_trips() {
        for status in [
            OpStatus::Pending,
            OpStatus::InFlight,
            OpStatus::Applied,
            OpStatus::Failed,
            OpStatus::Rejected,
        ] {
            assert_eq!(OpStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OpStatus::parse("done"), None);
    }

    #[test]
    fn only_applied_and_rejected_are_terminal() {
        assert!(OpStatus::Applied.is_terminal());
        assert!(OpStatus::Rejected.is_terminal());
        assert!(!OpStatus::Pending.is_terminal());
        assert!(!OpStatus::InFlight.is_terminal());
        assert!(!OpStatus::Failed.is_terminal());
    }
}
